use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::error::Reason;

#[derive(Debug, Clone, Copy)]
struct Entry {
    count: u64,
    first: Instant,
    last: Instant,
}

/// Collapses repeated transport exceptions into one warning per
/// `(reason, address)` per reporting window.
#[derive(Debug)]
pub struct ErrorReporter {
    interval: Duration,
    window_start: Instant,
    entries: HashMap<(Reason, SocketAddr), Entry>,
    total: u64,
}

impl ErrorReporter {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            window_start: now,
            entries: HashMap::new(),
            total: 0,
        }
    }

    pub fn report(&mut self, reason: Reason, addr: SocketAddr, now: Instant) {
        self.total += 1;
        let entry = self.entries.entry((reason, addr)).or_insert(Entry {
            count: 0,
            first: now,
            last: now,
        });
        if entry.count == 0 {
            log::debug!("{} on {}", reason, addr);
        }
        entry.count += 1;
        entry.last = now;
    }

    /// Emits the window's summary once the interval has passed. Returns the
    /// number of distinct entries logged.
    pub fn flush(&mut self, now: Instant) -> usize {
        if now.duration_since(self.window_start) < self.interval {
            return 0;
        }
        self.flush_now(now)
    }

    pub fn flush_now(&mut self, now: Instant) -> usize {
        let flushed = self.entries.len();
        for ((reason, addr), entry) in self.entries.drain() {
            let span = entry.last.duration_since(entry.first);
            log::warn!(
                "{}: {} occurrence(s) of {} over {:.1}s",
                addr,
                entry.count,
                reason,
                span.as_secs_f32()
            );
        }
        self.window_start = now;
        flushed
    }

    pub fn pending(&self, reason: Reason, addr: SocketAddr) -> u64 {
        self.entries.get(&(reason, addr)).map_or(0, |e| e.count)
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregates_per_window() {
        let start = Instant::now();
        let addr: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        let mut reporter = ErrorReporter::new(Duration::from_secs(10), start);

        for _ in 0..5 {
            reporter.report(Reason::TransientResourceUnavailable, addr, start);
        }
        reporter.report(Reason::ChannelLost, addr, start);
        assert_eq!(reporter.pending(Reason::TransientResourceUnavailable, addr), 5);

        assert_eq!(reporter.flush(start + Duration::from_secs(1)), 0);
        assert_eq!(reporter.flush(start + Duration::from_secs(10)), 2);
        assert_eq!(reporter.pending(Reason::ChannelLost, addr), 0);
        assert_eq!(reporter.total(), 6);
    }
}
