#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bundles_sent: u64,
    pub send_failures: u64,
    pub datagrams_dropped: u64,
}

impl ChannelStats {
    pub fn merge(&mut self, other: &ChannelStats) {
        self.bytes_sent += other.bytes_sent;
        self.bytes_received += other.bytes_received;
        self.messages_sent += other.messages_sent;
        self.messages_received += other.messages_received;
        self.bundles_sent += other.bundles_sent;
        self.send_failures += other.send_failures;
        self.datagrams_dropped += other.datagrams_dropped;
    }
}

/// Totals for one network interface. Traffic of destroyed channels is
/// folded into `retired` so the totals never go backwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub live: ChannelStats,
    pub retired: ChannelStats,
    pub channels: usize,
    pub accepted: u64,
    pub rejected: u64,
    pub condemned: u64,
    pub destroyed: u64,
}

impl NetworkStats {
    pub fn total(&self) -> ChannelStats {
        let mut total = self.live;
        total.merge(&self.retired);
        total
    }
}
