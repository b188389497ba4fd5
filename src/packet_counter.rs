use std::sync::atomic::{AtomicU32, Ordering};

/// Default number of packets between radio-quality reports
pub const DEFAULT_PACKET_COUNTER_LIMIT: u32 = 10;

/// Counts pack attempts and decides when radio data is due.
#[derive(Debug)]
pub struct PacketCounter {
    counter: AtomicU32,
    limit: AtomicU32,
}

impl Default for PacketCounter {
    fn default() -> Self {
        Self::new(DEFAULT_PACKET_COUNTER_LIMIT)
    }
}

impl PacketCounter {
    pub fn new(limit: u32) -> Self {
        Self {
            counter: AtomicU32::new(0),
            limit: AtomicU32::new(limit),
        }
    }

    pub fn get(&self) -> u32 {
        self.counter.load(Ordering::Acquire)
    }

    pub fn set(&self, value: u32) {
        self.counter.store(value, Ordering::Release);
    }

    pub fn reset(&self) {
        self.set(0);
    }

    /// Returns the value after incrementing
    pub fn increment(&self) -> u32 {
        self.counter
            .fetch_add(1, Ordering::AcqRel)
            .wrapping_add(1)
    }

    pub fn limit(&self) -> u32 {
        self.limit.load(Ordering::Acquire)
    }

    pub fn set_limit(&self, limit: u32) {
        self.limit.store(limit, Ordering::Release);
    }

    /// True when the next message must carry radio-quality data.
    ///
    /// A limit of 0 disables the periodic radio report.
    pub fn radio_data_due(&self) -> bool {
        let limit = self.limit();
        limit != 0 && self.get() >= limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_radio_data_cadence() {
        let counter = PacketCounter::new(3);
        assert!(!counter.radio_data_due());
        counter.increment();
        counter.increment();
        assert!(!counter.radio_data_due());
        assert_eq!(counter.increment(), 3);
        assert!(counter.radio_data_due());
        counter.reset();
        assert_eq!(counter.get(), 0);
        assert!(!counter.radio_data_due());
    }

    #[test]
    fn test_zero_limit_disables_radio() {
        let counter = PacketCounter::new(0);
        counter.set(1000);
        assert!(!counter.radio_data_due());
        counter.set_limit(500);
        assert!(counter.radio_data_due());
        assert_eq!(counter.limit(), 500);
    }
}
