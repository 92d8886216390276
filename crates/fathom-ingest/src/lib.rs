//! NMEA ingest engines — serial and UDP sentence sources.
//!
//! Both engines aggregate NMEA-0183 sentences into timestamped blocks and
//! publish them to subscribers; blocks typically continue onto the sonar
//! data plane as opaque messages.

pub mod sentence;
pub mod uart;
pub mod udp;

pub use uart::UartIngest;
pub use udp::UdpIngest;

/// Receive buffers per ingest port.
pub(crate) const INGEST_BUFFERS: usize = 16;

/// An emitted NMEA block, borrowed from ingest-owned storage. Subscribers
/// must consume it synchronously.
#[derive(Debug, Clone, Copy)]
pub struct BlockView<'a> {
    /// Receive time of the block's first byte, monotonic microseconds.
    pub time: i64,
    /// Configured port name.
    pub port: &'a str,
    pub data: &'a [u8],
}

pub(crate) type BlockSubscriber = Box<dyn Fn(BlockView<'_>) + Send + Sync>;

/// A block parked in a pool slab between the receiver and emitter workers.
pub(crate) struct PooledBlock {
    pub slab: Box<[u8]>,
    pub len: usize,
    pub time: i64,
}
