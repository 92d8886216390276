//! Sonar data messages — the logical unit delivered to subscribers.

use std::sync::OnceLock;
use std::time::Instant;

use bytes::Bytes;

/// One data message from a sonar source.
///
/// Messages with the same `id` form an independent logical stream. Within a
/// stream, `time` never decreases; the receiver flushes any partially
/// reassembled message when a newer `time` arrives on its stream.
#[derive(Debug, Clone)]
pub struct DataMessage {
    /// Capture time, monotonic microseconds.
    pub time: i64,
    /// Source identifier. Opaque to the transport.
    pub id: u32,
    /// Data format tag. Opaque to the transport.
    pub type_tag: u32,
    /// Sampling rate in Hz. Forwarded, never interpreted.
    pub rate: f32,
    /// Payload bytes; the wire `size` field is `data.len()`.
    pub data: Bytes,
}

/// A reassembled message borrowed from receiver-owned storage.
///
/// Subscribers must consume it synchronously; the backing buffer is reused
/// for the stream's next message as soon as the callback returns.
#[derive(Debug, Clone, Copy)]
pub struct MessageView<'a> {
    pub time: i64,
    pub id: u32,
    pub type_tag: u32,
    pub rate: f32,
    pub data: &'a [u8],
}

/// Monotonic microseconds since process start. Used to stamp messages and
/// ingest blocks; comparable only within one process.
pub fn monotonic_micros() -> i64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_micros() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_micros_never_decreases() {
        let a = monotonic_micros();
        let b = monotonic_micros();
        assert!(b >= a);
    }
}
