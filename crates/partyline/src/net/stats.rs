#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub retransmissions: u64,
    pub deliveries_lost: u64,
    pub duplicates_dropped: u64,
    pub malformed_dropped: u64,
    pub send_failures: u64,
}

impl NetworkStats {
    pub fn record_sent(&mut self, bytes: usize) {
        self.datagrams_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.datagrams_received += 1;
        self.bytes_received += bytes as u64;
    }
}
