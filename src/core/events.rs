//! Event bus: typed fan-out from the protocol engine to its observers.
//!
//! Subscribers are strictly non-blocking: each gets a bounded queue, and
//! when a slow subscriber overflows, the oldest event is dropped and a
//! per-subscriber counter records the loss. The engine never waits on a
//! consumer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::Level;

use crate::core::session::{Direction, FailReason, NodeId, TransferId};

/// Queue depth given to subscribers unless they ask for another.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Everything the engine reports to the outside world.
#[derive(Debug, Clone)]
pub enum Event {
    /// A node was observed for the first time, or its SNR moved past the
    /// configured threshold.
    NodeSeen {
        id: NodeId,
        name: Option<String>,
        snr: Option<f64>,
    },
    TransferStarted {
        tid: TransferId,
        peer: NodeId,
        direction: Direction,
        filename: String,
        total_chunks: u16,
    },
    ChunkSent {
        tid: TransferId,
        index: u16,
        /// 1 for the first transmission, +1 per retransmit.
        attempt: u8,
    },
    ChunkAcked {
        tid: TransferId,
        index: u16,
    },
    ChunkTimedOut {
        tid: TransferId,
        index: u16,
        retries: u8,
    },
    /// Chunks confirmed so far (sent side) or stored so far (receive side).
    Progress {
        tid: TransferId,
        done: u16,
        total: u16,
    },
    TransferCompleted {
        tid: TransferId,
        peer: NodeId,
        filename: String,
        bytes: usize,
    },
    TransferFailed {
        tid: TransferId,
        peer: NodeId,
        reason: FailReason,
    },
    LogLine {
        level: Level,
        text: String,
    },
}

struct SubQueue {
    events: Mutex<VecDeque<Event>>,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
}

/// Handle held by a subscriber. Dropping it detaches from the bus.
pub struct Subscription {
    queue: Arc<SubQueue>,
}

impl Subscription {
    /// Pop one event without waiting.
    pub fn try_recv(&self) -> Option<Event> {
        self.queue.events.lock().unwrap().pop_front()
    }

    /// Pop everything currently queued.
    pub fn drain(&self) -> Vec<Event> {
        self.queue.events.lock().unwrap().drain(..).collect()
    }

    /// Await the next event.
    pub async fn recv(&self) -> Event {
        loop {
            if let Some(event) = self.try_recv() {
                return event;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Events lost to overflow since subscribing.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.closed.store(true, Ordering::Release);
    }
}

/// Cheap-to-clone fan-out handle shared by the engine, the tracing bridge
/// and any UI.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Arc<SubQueue>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscription {
        let queue = Arc::new(SubQueue {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        });
        self.subscribers.lock().unwrap().push(queue.clone());
        Subscription { queue }
    }

    /// Push an event to every live subscriber, dropping the oldest entry
    /// of any queue that is full. Never blocks.
    pub fn publish(&self, event: Event) {
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|q| !q.closed.load(Ordering::Acquire));
        for queue in subs.iter() {
            {
                let mut events = queue.events.lock().unwrap();
                if events.len() >= queue.capacity {
                    events.pop_front();
                    queue.dropped.fetch_add(1, Ordering::Relaxed);
                }
                events.push_back(event.clone());
            }
            queue.notify.notify_one();
        }
    }

    /// Number of live subscribers (for diagnostics).
    pub fn subscriber_count(&self) -> usize {
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|q| !q.closed.load(Ordering::Acquire));
        subs.len()
    }
}
