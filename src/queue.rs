//! Hand-off between the receive loop and the application.
//!
//! Batches of frames travel through a crossbeam channel in decode order.
//! Besides frame batches the channel carries numbered flush markers: the
//! controller pushes one when an acquisition ends and consumes until it gets
//! its marker back, which proves everything queued before it is gone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::warn;

use crate::errors::{DriverError, Result};
use crate::frame::Frame;

/// Wait slice used while a flush waits on a concurrent consumer.
const FLUSH_POLL: Duration = Duration::from_millis(10);

/// What a bounded queue does when a push finds it full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overflow {
    /// Evict the oldest batch to make room.
    DropOldest,
    /// Refuse the new batch with [`DriverError::QueueFull`].
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuePolicy {
    #[default]
    Unbounded,
    /// At most `capacity` batches in flight.
    Bounded { capacity: usize, overflow: Overflow },
}

enum Message {
    Frames(Vec<Frame>),
    Flush(u64),
}

pub struct DeliveryQueue {
    tx: Sender<Message>,
    rx: Receiver<Message>,
    policy: QueuePolicy,
    /// Frames lost to overflow since construction.
    overflowed: AtomicU64,
    next_marker: AtomicU64,
    /// Highest flush marker a consumer has seen.
    acked: AtomicU64,
}

impl DeliveryQueue {
    pub fn new(policy: QueuePolicy) -> Self {
        let (tx, rx) = match policy {
            QueuePolicy::Unbounded => unbounded(),
            QueuePolicy::Bounded { capacity, .. } => bounded(capacity.max(1)),
        };
        Self {
            tx,
            rx,
            policy,
            overflowed: AtomicU64::new(0),
            next_marker: AtomicU64::new(0),
            acked: AtomicU64::new(0),
        }
    }

    /// Enqueue one batch. Empty batches are ignored.
    pub fn push(&self, frames: Vec<Frame>) -> Result<()> {
        if frames.is_empty() {
            return Ok(());
        }
        let mut message = Message::Frames(frames);
        loop {
            match self.tx.try_send(message) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Disconnected(_)) => {
                    return Err(DriverError::Command("delivery queue disconnected".into()))
                }
                Err(TrySendError::Full(rejected)) => match self.policy {
                    QueuePolicy::Bounded {
                        overflow: Overflow::DropOldest,
                        ..
                    } => {
                        self.evict_oldest();
                        message = rejected;
                    }
                    _ => {
                        if let Message::Frames(frames) = &rejected {
                            self.overflowed.fetch_add(frames.len() as u64, Ordering::AcqRel);
                        }
                        return Err(DriverError::QueueFull);
                    }
                },
            }
        }
    }

    /// Wait up to `timeout` (forever when `None`) for the first batch, then
    /// take everything else already queued without waiting.
    ///
    /// Returns an empty vector when nothing arrives in time.
    pub fn drain(&self, timeout: Option<Duration>) -> Vec<Frame> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut out = loop {
            let next = match deadline {
                None => self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
                Some(deadline) => self.rx.recv_deadline(deadline),
            };
            match next {
                Ok(Message::Frames(frames)) => break frames,
                Ok(Message::Flush(id)) => self.ack(id),
                Err(_) => return Vec::new(),
            }
        };
        while let Ok(message) = self.rx.try_recv() {
            match message {
                Message::Frames(frames) => out.extend(frames),
                Message::Flush(id) => self.ack(id),
            }
        }
        out
    }

    /// Discard every batch queued before this call. Returns the number of
    /// frames discarded by this caller.
    ///
    /// Safe against a concurrent [`drain`](Self::drain): if the consumer
    /// swallows the marker it acknowledges it instead.
    pub fn flush(&self) -> usize {
        let id = self.next_marker.fetch_add(1, Ordering::AcqRel) + 1;
        let mut marker = Some(Message::Flush(id));
        let mut discarded = 0;
        loop {
            if let Some(message) = marker.take() {
                match self.tx.try_send(message) {
                    Ok(()) => {}
                    Err(TrySendError::Full(message)) => marker = Some(message),
                    Err(TrySendError::Disconnected(_)) => return discarded,
                }
            }
            match self.rx.recv_timeout(FLUSH_POLL) {
                Ok(Message::Frames(frames)) => discarded += frames.len(),
                Ok(Message::Flush(seen)) => {
                    self.ack(seen);
                    if seen == id {
                        return discarded;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return discarded,
            }
            if marker.is_none() && self.acked.load(Ordering::Acquire) >= id {
                return discarded;
            }
        }
    }

    /// Queued batches (frame batches and markers).
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Frames lost to a full bounded queue.
    pub fn overflowed(&self) -> u64 {
        self.overflowed.load(Ordering::Acquire)
    }

    pub fn policy(&self) -> QueuePolicy {
        self.policy
    }

    fn ack(&self, id: u64) {
        self.acked.fetch_max(id, Ordering::AcqRel);
    }

    fn evict_oldest(&self) {
        match self.rx.try_recv() {
            Ok(Message::Frames(frames)) => {
                let lost = frames.len() as u64;
                let total = self.overflowed.fetch_add(lost, Ordering::AcqRel) + lost;
                warn!(
                    "delivery queue full, dropped {} oldest frames (total {})",
                    lost, total
                );
            }
            Ok(Message::Flush(id)) => self.ack(id),
            Err(_) => {}
        }
    }
}

impl Default for DeliveryQueue {
    fn default() -> Self {
        Self::new(QueuePolicy::Unbounded)
    }
}
