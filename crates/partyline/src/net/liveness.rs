use std::time::{Duration, Instant};

use super::connection::PeerConnection;

/// Fixed-rate heartbeat timer advanced by the tick loop.
///
/// There is no OS timer behind it: a heartbeat only fires when the owner
/// polls, so a stalled tick loop delays heartbeats and disconnects alike.
#[derive(Debug)]
pub struct HeartbeatSchedule {
    interval: Duration,
    next_due: Option<Instant>,
}

impl HeartbeatSchedule {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_due: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Arms the timer on first use and reports whether a heartbeat is due.
    /// After a long stall only one heartbeat fires and the phase restarts at `now`.
    pub fn poll(&mut self, now: Instant) -> bool {
        let Some(due) = self.next_due else {
            self.next_due = Some(now + self.interval);
            return false;
        };

        if now < due {
            return false;
        }

        let next = due + self.interval;
        self.next_due = Some(if next <= now { now + self.interval } else { next });
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Traffic flowed both ways within the last interval.
    Idle,
    /// Send a PING to the peer.
    Ping,
    /// The peer missed too many consecutive windows.
    Disconnect,
}

/// Runs one heartbeat for `peer`.
///
/// A window counts as missed when nothing at all arrived from the peer during
/// the last interval. Misses accumulate in `consecutive_timeouts` and any
/// received datagram resets the count at the next heartbeat. A ping goes out
/// whenever the peer has been quiet or we have not sent it anything for an
/// interval, so a live peer always has something to answer.
pub fn check_peer(
    peer: &mut PeerConnection,
    now: Instant,
    interval: Duration,
    max_missed: u32,
) -> HeartbeatAction {
    let silent = now.saturating_duration_since(peer.last_received) >= interval;

    if silent {
        peer.consecutive_timeouts += 1;
    } else {
        peer.consecutive_timeouts = 0;
    }

    if peer.consecutive_timeouts >= max_missed {
        return HeartbeatAction::Disconnect;
    }

    let idle_outbound = now.saturating_duration_since(peer.last_sent) >= interval;
    if silent || idle_outbound {
        HeartbeatAction::Ping
    } else {
        HeartbeatAction::Idle
    }
}
