use std::io;
use std::net::SocketAddr;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::endpoint::DatagramSink;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PacketLossSimulation {
    pub enabled: bool,
    /// 0.0 to 100.0
    pub loss_percent: f32,
}

impl PacketLossSimulation {
    pub fn new(loss_percent: f32) -> Self {
        Self {
            enabled: loss_percent > 0.0,
            loss_percent: loss_percent.clamp(0.0, 100.0),
        }
    }
}

/// Wraps a sink and silently discards a share of outbound datagrams.
/// Dropped sends still report success, just like a datagram lost in transit.
pub struct LossySink<S> {
    inner: S,
    sim: PacketLossSimulation,
    rng: Mutex<StdRng>,
}

impl<S: DatagramSink> LossySink<S> {
    pub fn new(inner: S, sim: PacketLossSimulation) -> Self {
        Self {
            inner,
            sim,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_seed(inner: S, sim: PacketLossSimulation, seed: u64) -> Self {
        Self {
            inner,
            sim,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn should_drop(&self) -> bool {
        if !self.sim.enabled || self.sim.loss_percent <= 0.0 {
            return false;
        }
        self.rng.lock().gen_range(0.0..100.0) < self.sim.loss_percent
    }
}

impl<S: DatagramSink> DatagramSink for LossySink<S> {
    fn send_datagram(&self, bytes: &[u8], addr: SocketAddr) -> io::Result<usize> {
        if self.should_drop() {
            log::trace!("Simulated loss of {} bytes to {}", bytes.len(), addr);
            return Ok(bytes.len());
        }
        self.inner.send_datagram(bytes, addr)
    }
}
