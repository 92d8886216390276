//! Receive-side packet queue.
//!
//! The receiver pushes validated datagrams (still in their pool slabs); the
//! emitter picks them back out in transport order. Selection prefers the
//! exact next index, waits while the queue is lightly loaded, and skips
//! forward only once occupancy shows the missing packet is unlikely to
//! arrive.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

/// One received datagram, parked in its pool slab until the emitter takes it.
#[derive(Debug)]
pub struct QueuedPacket {
    pub slab: Box<[u8]>,
    pub len: usize,
    /// Transport sequence number, cached from the header at receive time.
    pub index: u32,
}

/// Outcome of one selection attempt.
#[derive(Debug)]
pub enum Pick {
    /// The packet with the wanted index.
    InOrder(QueuedPacket),
    /// The wanted index is missing and occupancy forced a reselection.
    Skipped(QueuedPacket),
    /// The wanted index is missing but the queue is shallow; let more arrive.
    Wait,
    Empty,
}

pub struct PacketQueue {
    inner: Mutex<VecDeque<QueuedPacket>>,
    notify: Notify,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self { inner: Mutex::new(VecDeque::new()), notify: Notify::new() }
    }

    pub fn push(&self, packet: QueuedPacket) {
        self.inner.lock().expect("queue lock poisoned").push_back(packet);
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until a push happens, bounded by the caller's timeout wrapper.
    pub async fn pushed(&self) {
        self.notify.notified().await;
    }

    /// Wake any emitter blocked in [`PacketQueue::pushed`].
    pub fn wake(&self) {
        self.notify.notify_waiters();
    }

    /// Select a packet for `next_index`.
    ///
    /// Falls back to the smallest index greater than `next_index`, then to
    /// the smallest index below it. The second leg handles index wrap-around
    /// and also accepts backward jumps; deployed senders rely on both.
    pub fn pick(&self, next_index: u32, wait_threshold: usize) -> Pick {
        let mut queue = self.inner.lock().expect("queue lock poisoned");
        if queue.is_empty() {
            return Pick::Empty;
        }

        if let Some(pos) = queue.iter().position(|p| p.index == next_index) {
            return Pick::InOrder(queue.remove(pos).expect("position in bounds"));
        }

        if queue.len() < wait_threshold {
            return Pick::Wait;
        }

        let pos = fallback_position(queue.iter().map(|p| p.index), next_index)
            .expect("non-empty queue has a fallback");
        Pick::Skipped(queue.remove(pos).expect("position in bounds"))
    }

    /// Drain every queued packet, returning the slabs for pool release.
    pub fn drain(&self) -> Vec<QueuedPacket> {
        self.inner.lock().expect("queue lock poisoned").drain(..).collect()
    }
}

/// Position of the reselection target: the smallest index above
/// `next_index`, else the smallest index below it.
pub fn fallback_position(indices: impl Iterator<Item = u32>, next_index: u32) -> Option<usize> {
    let mut above: Option<(usize, u32)> = None;
    let mut below: Option<(usize, u32)> = None;

    for (pos, index) in indices.enumerate() {
        if index > next_index && above.map_or(true, |(_, best)| index < best) {
            above = Some((pos, index));
        }
        if index < next_index && below.map_or(true, |(_, best)| index < best) {
            below = Some((pos, index));
        }
    }

    above.or(below).map(|(pos, _)| pos)
}
