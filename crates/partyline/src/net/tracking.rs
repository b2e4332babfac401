use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::envelope::Envelope;

/// An outbound envelope waiting for the peer to acknowledge it.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub envelope: Envelope,
    pub bytes: Vec<u8>,
    pub last_send: Instant,
    pub retry_count: u32,
}

impl PendingMessage {
    pub fn new(envelope: Envelope, bytes: Vec<u8>, sent_at: Instant) -> Self {
        Self {
            envelope,
            bytes,
            last_send: sent_at,
            retry_count: 0,
        }
    }

    pub fn is_overdue(&self, now: Instant, ack_timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_send) >= ack_timeout
    }
}

/// Result of one pass over a peer's pending list.
#[derive(Debug, Default)]
pub struct RetryScan {
    /// Encoded datagrams to transmit again, paired with their envelope id.
    pub resend: Vec<(u64, Vec<u8>)>,
    /// Entries that ran out of retries and were dropped.
    pub lost: Vec<Envelope>,
}

impl RetryScan {
    pub fn is_empty(&self) -> bool {
        self.resend.is_empty() && self.lost.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct PendingList {
    entries: VecDeque<PendingMessage>,
}

impl PendingList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, envelope: Envelope, bytes: Vec<u8>, sent_at: Instant) {
        self.entries
            .push_back(PendingMessage::new(envelope, bytes, sent_at));
    }

    /// Walks the list once. Entries inside the ack timeout are left alone.
    /// An overdue entry is either retransmitted (retry count bumped) or, once
    /// it has already been retransmitted `max_retries` times, dropped as lost.
    pub fn scan(&mut self, now: Instant, ack_timeout: Duration, max_retries: u32) -> RetryScan {
        let mut scan = RetryScan::default();

        self.entries.retain_mut(|pending| {
            if !pending.is_overdue(now, ack_timeout) {
                return true;
            }

            if pending.retry_count >= max_retries {
                scan.lost.push(pending.envelope.clone());
                return false;
            }

            pending.retry_count += 1;
            pending.last_send = now;
            scan.resend.push((pending.envelope.id, pending.bytes.clone()));
            true
        });

        scan
    }

    /// Removes every entry whose id appears in `ids`. Returns how many were retired.
    pub fn process_ack(&mut self, ids: &[u64]) -> usize {
        let before = self.entries.len();
        self.entries.retain(|pending| !ids.contains(&pending.envelope.id));
        before - self.entries.len()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.iter().any(|p| p.envelope.id == id)
    }

    pub fn get(&self, id: u64) -> Option<&PendingMessage> {
        self.entries.iter().find(|p| p.envelope.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingMessage> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Fixed-capacity memory of recently accepted inbound ids, oldest evicted first.
#[derive(Debug)]
pub struct DedupWindow {
    recent: VecDeque<u64>,
    capacity: usize,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            recent: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns `false` if the id was already in the window.
    pub fn record(&mut self, id: u64) -> bool {
        if self.recent.contains(&id) {
            return false;
        }

        if self.recent.len() >= self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(id);

        true
    }

    pub fn contains(&self, id: u64) -> bool {
        self.recent.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Inbound ids owed an acknowledgement, flushed as one ACK per tick.
#[derive(Debug, Default)]
pub struct AckAccumulator {
    ids: Vec<u64>,
}

impl AckAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: u64) {
        self.ids.push(id);
    }

    pub fn take(&mut self) -> Option<Vec<u64>> {
        if self.ids.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.ids))
        }
    }

    pub fn pending(&self) -> &[u64] {
        &self.ids
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
