//! Message reassembly — rebuilds sonar messages from data packets.
//!
//! Each source id owns an independent stream with its own growable backing
//! buffer. Packets may arrive out of order; the emitter selects them via the
//! queue policy and hands them here one at a time. A stream flushes early
//! when a packet with a newer `time` arrives, and a background sweep flushes
//! any stream that has been silent for [`STREAM_IDLE_FLUSH`] so a lost tail
//! packet cannot pin a partial message forever.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use fathom_core::message::MessageView;
use fathom_core::wire::PacketView;

/// Inactivity after which a partial message is emitted as-is.
pub const STREAM_IDLE_FLUSH: Duration = Duration::from_secs(1);

/// Backing buffers grow in steps of this many bytes.
const BUFFER_STEP: usize = 65_536;

struct Stream {
    time: i64,
    type_tag: u32,
    rate: f32,
    size: u32,
    cur_size: u32,
    buffer: Vec<u8>,
    last_rx: Instant,
}

impl Stream {
    fn new() -> Self {
        Self {
            time: 0,
            type_tag: 0,
            rate: 0.0,
            size: 0,
            cur_size: 0,
            buffer: Vec::new(),
            last_rx: Instant::now(),
        }
    }

    /// Emit the current message (complete or not) and return to idle.
    /// `time` survives the reset: it keeps enforcing monotonic time on the
    /// stream's next message.
    fn emit_and_reset(&mut self, id: u32, emit: &mut dyn FnMut(MessageView<'_>)) {
        let size = self.size as usize;
        emit(MessageView {
            time: self.time,
            id,
            type_tag: self.type_tag,
            rate: self.rate,
            data: &self.buffer[..size],
        });
        self.buffer[..size].fill(0);
        self.cur_size = 0;
        self.size = 0;
        self.type_tag = 0;
        self.rate = 0.0;
    }
}

pub struct Reassembler {
    streams: HashMap<u32, Stream>,
    next_index: u32,
}

impl Reassembler {
    pub fn new() -> Self {
        Self { streams: HashMap::new(), next_index: 0 }
    }

    /// The transport index the emitter wants next.
    pub fn next_index(&self) -> u32 {
        self.next_index
    }

    /// Emit every stream whose partial message has been idle too long.
    pub fn flush_expired(&mut self, emit: &mut dyn FnMut(MessageView<'_>)) {
        for (id, stream) in self.streams.iter_mut() {
            if stream.cur_size == 0 || stream.last_rx.elapsed() < STREAM_IDLE_FLUSH {
                continue;
            }
            tracing::debug!(id = *id, time = stream.time, "flushing stalled partial message");
            stream.emit_and_reset(*id, emit);
        }
    }

    /// Fold one selected datagram into its stream.
    ///
    /// Verifies the CRC, applies the acceptance filter, copies the part into
    /// place and advances `next_index`. Rejected packets are dropped with a
    /// log and do not advance the index.
    pub fn process(&mut self, datagram: &[u8], emit: &mut dyn FnMut(MessageView<'_>)) {
        let view = match PacketView::parse(datagram) {
            Ok(view) => view,
            Err(e) => {
                tracing::warn!(error = %e, "unparseable packet reached reassembly");
                return;
            }
        };

        if let Err(e) = view.verify_crc() {
            tracing::warn!(index = view.index, error = %e, "packet dropped");
            return;
        }

        let stream = self.streams.entry(view.id).or_insert_with(Stream::new);

        // Grow only between messages: a size change mid-message must never
        // reallocate under a partially filled buffer.
        if stream.size == 0 && view.size as usize > stream.buffer.len() {
            let rounded = (view.size as usize).div_ceil(BUFFER_STEP) * BUFFER_STEP;
            stream.buffer = vec![0u8; rounded];
        }

        let acceptable = view.size as usize <= stream.buffer.len()
            && (stream.size == 0 || stream.size == view.size)
            && (stream.type_tag == 0 || stream.type_tag == view.type_tag)
            && (stream.rate == 0.0 || stream.rate == view.rate)
            && view.time >= stream.time;

        if !acceptable {
            tracing::warn!(index = view.index, id = view.id, "inconsistent packet dropped");
            return;
        }

        // A newer capture time flushes whatever was in progress.
        if stream.cur_size > 0 && stream.time != view.time {
            stream.emit_and_reset(view.id, emit);
        }

        stream.time = view.time;
        stream.type_tag = view.type_tag;
        stream.rate = view.rate;
        stream.size = view.size;
        stream.cur_size += view.part_size;
        let start = view.offset as usize;
        stream.buffer[start..start + view.data.len()].copy_from_slice(view.data);
        stream.last_rx = Instant::now();

        if stream.cur_size == stream.size {
            stream.emit_and_reset(view.id, emit);
        }

        self.next_index = view.index.wrapping_add(1);
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}
