//! Gap Detection for Market Data Source Sequences
//!
//! Every tick carries the publisher's own sequence number. The SPSC queue
//! already reports ticks lost in shared memory; this detector catches what
//! the publisher never delivered or delivered twice, and notices when the
//! publisher restarts (sequence drops back).
//!
//! Source sequences start at 1 and are never expected to wrap a u64.

/// Result of checking one sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqStatus {
    /// First sequence seen since creation or reset
    First,
    InOrder,
    /// `missed` sequences were skipped
    Gap { missed: u64 },
    /// Same sequence as the previous message
    Duplicate,
    /// Sequence went backwards; the publisher restarted
    Restart { previous: u64 },
}

/// Tracks the last source sequence of one stream
///
/// # Example
///
/// ```
/// use hermod_core::resilience::gap_detector::{GapDetector, SeqStatus};
///
/// let mut detector = GapDetector::new();
/// assert_eq!(detector.check(1), SeqStatus::First);
/// assert_eq!(detector.check(2), SeqStatus::InOrder);
/// assert_eq!(detector.check(5), SeqStatus::Gap { missed: 2 });
/// assert_eq!(detector.total_missed(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct GapDetector {
    last_sequence: u64,
    ready: bool,
    gaps: u64,
    total_missed: u64,
    duplicates: u64,
    restarts: u64,
}

impl GapDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check the next sequence number
    #[inline(always)]
    pub fn check(&mut self, sequence: u64) -> SeqStatus {
        if !self.ready {
            self.last_sequence = sequence;
            self.ready = true;
            return SeqStatus::First;
        }

        let last = self.last_sequence;
        if sequence == last {
            self.duplicates += 1;
            return SeqStatus::Duplicate;
        }
        self.last_sequence = sequence;

        if sequence < last {
            self.restarts += 1;
            return SeqStatus::Restart { previous: last };
        }

        let missed = sequence - last - 1;
        if missed == 0 {
            SeqStatus::InOrder
        } else {
            self.gaps += 1;
            self.total_missed += missed;
            SeqStatus::Gap { missed }
        }
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    #[inline]
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn gaps(&self) -> u64 {
        self.gaps
    }

    pub fn total_missed(&self) -> u64 {
        self.total_missed
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    /// Forget the stream position; counters are kept
    pub fn reset(&mut self) {
        self.last_sequence = 0;
        self.ready = false;
    }

    /// Continue from a known sequence, e.g. after resynchronising
    pub fn reset_at_sequence(&mut self, sequence: u64) {
        self.last_sequence = sequence;
        self.ready = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_sequence() {
        let mut detector = GapDetector::new();
        assert_eq!(detector.check(1), SeqStatus::First);
        assert_eq!(detector.check(2), SeqStatus::InOrder);
        assert_eq!(detector.check(3), SeqStatus::InOrder);
        assert_eq!(detector.gaps(), 0);
    }

    #[test]
    fn test_gap_counts_missing() {
        let mut detector = GapDetector::new();
        detector.check(10);
        assert_eq!(detector.check(14), SeqStatus::Gap { missed: 3 });
        assert_eq!(detector.check(20), SeqStatus::Gap { missed: 5 });
        assert_eq!(detector.gaps(), 2);
        assert_eq!(detector.total_missed(), 8);
    }

    #[test]
    fn test_duplicate_not_gap() {
        let mut detector = GapDetector::new();
        detector.check(100);
        assert_eq!(detector.check(100), SeqStatus::Duplicate);
        assert_eq!(detector.duplicates(), 1);
        assert_eq!(detector.check(101), SeqStatus::InOrder);
    }

    #[test]
    fn test_restart_detected() {
        let mut detector = GapDetector::new();
        detector.check(1000);
        assert_eq!(detector.check(1), SeqStatus::Restart { previous: 1000 });
        assert_eq!(detector.restarts(), 1);
        // Continues from the new position
        assert_eq!(detector.check(2), SeqStatus::InOrder);
    }

    #[test]
    fn test_reset_at_sequence() {
        let mut detector = GapDetector::new();
        detector.check(100);
        detector.reset_at_sequence(105);
        assert!(detector.is_ready());
        assert_eq!(detector.check(106), SeqStatus::InOrder);

        detector.reset();
        assert!(!detector.is_ready());
        assert_eq!(detector.check(7), SeqStatus::First);
    }
}
