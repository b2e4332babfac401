use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::envelope::Envelope;

/// A decoded datagram handed from the receive worker to the tick thread.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub from: SocketAddr,
    pub envelope: Envelope,
    pub size: usize,
}

#[derive(Debug, Default)]
struct Shared {
    queue: Mutex<VecDeque<Inbound>>,
    malformed: AtomicU64,
}

/// The only cross-thread boundary of a session: a mutex-guarded FIFO the
/// worker pushes into and the tick thread drains. Cloning shares the queue.
#[derive(Debug, Clone, Default)]
pub struct Inbox {
    shared: Arc<Shared>,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, inbound: Inbound) {
        self.shared.queue.lock().push_back(inbound);
    }

    /// Takes everything queued so far. Datagrams pushed while the caller is
    /// working through the batch wait for the next drain.
    pub fn drain(&self) -> VecDeque<Inbound> {
        std::mem::take(&mut *self.shared.queue.lock())
    }

    pub fn record_malformed(&self) {
        self.shared.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed_count(&self) -> u64 {
        self.shared.malformed.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
