use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters for an endpoint's DATA envelopes (pings are not counted), shared between the ICMP
///  channel, connection tasks and the housekeeping loop which reports and resets them once
///  per interval.
#[derive(Default, Debug)]
pub struct Throughput {
    sent_packets: AtomicU64,
    sent_bytes: AtomicU64,
    received_packets: AtomicU64,
    received_bytes: AtomicU64,
    dropped_packets: AtomicU64,
}

#[derive(Default, Debug, Clone, Copy, Eq, PartialEq)]
pub struct ThroughputSnapshot {
    pub sent_packets: u64,
    pub sent_bytes: u64,
    pub received_packets: u64,
    pub received_bytes: u64,
    /// packets that could not be decoded, e.g. because of a checksum mismatch
    pub dropped_packets: u64,
}

impl ThroughputSnapshot {
    /// Convert counters accumulated over `interval` to rates
    pub fn per_second(&self, interval: Duration) -> ThroughputRate {
        let secs = interval.as_secs_f64().max(0.001);
        let rate = |n: u64| n as f64 / secs;
        ThroughputRate {
            sent_packets: rate(self.sent_packets),
            sent_kb: rate(self.sent_bytes) / 1024.0,
            received_packets: rate(self.received_packets),
            received_kb: rate(self.received_bytes) / 1024.0,
            dropped_packets: rate(self.dropped_packets),
        }
    }
}

/// Throughput per second, the form in which it is logged
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputRate {
    pub sent_packets: f64,
    pub sent_kb: f64,
    pub received_packets: f64,
    pub received_kb: f64,
    pub dropped_packets: f64,
}

impl Display for ThroughputRate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "sent {:.1} packets/s / {:.1} KB/s, received {:.1} packets/s / {:.1} KB/s",
               self.sent_packets, self.sent_kb,
               self.received_packets, self.received_kb,
        )?;
        if self.dropped_packets > 0.0 {
            write!(f, ", dropped {:.1} undecodable packets/s", self.dropped_packets)?;
        }
        Ok(())
    }
}

impl Throughput {
    pub fn on_sent(&self, num_bytes: usize) {
        self.sent_packets.fetch_add(1, Ordering::Relaxed);
        self.sent_bytes.fetch_add(num_bytes as u64, Ordering::Relaxed);
    }

    pub fn on_received(&self, num_bytes: usize) {
        self.received_packets.fetch_add(1, Ordering::Relaxed);
        self.received_bytes.fetch_add(num_bytes as u64, Ordering::Relaxed);
    }

    pub fn on_dropped(&self) {
        self.dropped_packets.fetch_add(1, Ordering::Relaxed);
    }

    /// Return the counters accumulated since the previous call, resetting them to zero
    pub fn take(&self) -> ThroughputSnapshot {
        ThroughputSnapshot {
            sent_packets: self.sent_packets.swap(0, Ordering::Relaxed),
            sent_bytes: self.sent_bytes.swap(0, Ordering::Relaxed),
            received_packets: self.received_packets.swap(0, Ordering::Relaxed),
            received_bytes: self.received_bytes.swap(0, Ordering::Relaxed),
            dropped_packets: self.dropped_packets.swap(0, Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_resets() {
        let throughput = Throughput::default();
        throughput.on_sent(100);
        throughput.on_sent(2000);
        throughput.on_received(5);
        throughput.on_dropped();

        assert_eq!(throughput.take(), ThroughputSnapshot {
            sent_packets: 2,
            sent_bytes: 2100,
            received_packets: 1,
            received_bytes: 5,
            dropped_packets: 1,
        });
        assert_eq!(throughput.take(), ThroughputSnapshot::default());
    }

    #[test]
    fn test_per_second() {
        let snapshot = ThroughputSnapshot {
            sent_packets: 30,
            sent_bytes: 20 * 1024,
            received_packets: 5,
            received_bytes: 1024,
            dropped_packets: 0,
        };
        let rate = snapshot.per_second(Duration::from_secs(2));
        assert_eq!(rate, ThroughputRate {
            sent_packets: 15.0,
            sent_kb: 10.0,
            received_packets: 2.5,
            received_kb: 0.5,
            dropped_packets: 0.0,
        });
        assert_eq!(rate.to_string(), "sent 15.0 packets/s / 10.0 KB/s, received 2.5 packets/s / 0.5 KB/s");

        let with_drops = ThroughputSnapshot { dropped_packets: 3, ..snapshot }.per_second(Duration::from_millis(500));
        assert_eq!(
            with_drops.to_string(),
            "sent 60.0 packets/s / 40.0 KB/s, received 10.0 packets/s / 2.0 KB/s, dropped 6.0 undecodable packets/s",
        );
    }
}
