use std::sync::atomic::{AtomicU64, Ordering};

/// Counted event outcomes within a rank's processing loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventClass {
    Entry = 0,
    Exit = 1,
    Send = 2,
    Recv = 3,
    /// Message issued while the thread was outside every instrumented call.
    OrphanComm = 4,
    Violation = 5,
}

const NUM_CLASSES: usize = 6;

impl EventClass {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Exit => "exit",
            Self::Send => "send",
            Self::Recv => "recv",
            Self::OrphanComm => "orphan_comm",
            Self::Violation => "violation",
        }
    }

    fn from_index(i: usize) -> Option<Self> {
        match i {
            0 => Some(Self::Entry),
            1 => Some(Self::Exit),
            2 => Some(Self::Send),
            3 => Some(Self::Recv),
            4 => Some(Self::OrphanComm),
            5 => Some(Self::Violation),
            _ => None,
        }
    }
}

/// Lock-free per-class counters.
///
/// `snapshot()` reads and resets all counters, so the driver can report
/// per-frame totals without holding a lock.
pub struct EventStats {
    counts: [AtomicU64; NUM_CLASSES],
}

impl EventStats {
    pub fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn record(&self, class: EventClass) {
        if let Some(counter) = self.counts.get(class as usize) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Current value without resetting.
    pub fn get(&self, class: EventClass) -> u64 {
        self.counts
            .get(class as usize)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Atomically read and reset all counters, returning only non-zero entries.
    pub fn snapshot(&self) -> Vec<(EventClass, u64)> {
        let mut result = Vec::new();

        for (i, counter) in self.counts.iter().enumerate() {
            let v = counter.swap(0, Ordering::Relaxed);
            if v > 0 {
                if let Some(class) = EventClass::from_index(i) {
                    result.push((class, v));
                }
            }
        }

        result
    }
}

impl Default for EventStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let stats = EventStats::new();
        stats.record(EventClass::Entry);
        stats.record(EventClass::Entry);
        stats.record(EventClass::Send);

        let snap = stats.snapshot();
        assert_eq!(snap.len(), 2);

        let entries = snap
            .iter()
            .find(|(c, _)| *c == EventClass::Entry)
            .map(|(_, v)| *v);
        assert_eq!(entries, Some(2));
    }

    #[test]
    fn test_snapshot_resets_counters() {
        let stats = EventStats::new();
        stats.record(EventClass::OrphanComm);
        assert_eq!(stats.get(EventClass::OrphanComm), 1);

        assert_eq!(stats.snapshot().len(), 1);
        assert!(stats.snapshot().is_empty());
        assert_eq!(stats.get(EventClass::OrphanComm), 0);
    }
}
