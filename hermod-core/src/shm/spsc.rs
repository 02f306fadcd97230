//! Single-producer / single-consumer market data queue
//!
//! The writer keeps a private counter and never waits for the reader. A slow
//! reader loses the oldest ticks: only the newest `capacity` are retained.
//! Every loss is counted from gap detection and the reader jumps forward to
//! the oldest tick still in the ring.
//!
//! The single-writer / single-reader contract is not enforced across
//! processes; callers are trusted to create exactly one of each.

use crate::core::errors::ShmError;
use crate::monitoring::metrics::{MetricsRegistry, QueueCounters};
use crate::shm::ring::{ReadOutcome, RingBuffer, RingLayout, ShmPayload};
use crate::shm::segment::{ShmKey, ShmSegment};
use crossbeam_utils::Backoff;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// A market data queue bound to a segment
pub struct SpscQueue<T: ShmPayload> {
    ring: RingBuffer<T>,
    label: &'static str,
    counters: Option<QueueCounters>,
}

impl<T: ShmPayload> SpscQueue<T> {
    /// Create and initialise the segment (owner side)
    pub fn create(
        key: &ShmKey,
        capacity: usize,
        slot_size: Option<usize>,
        label: &'static str,
    ) -> Result<Self, ShmError> {
        let layout = RingLayout::with_slot_size::<T>(capacity, slot_size)?;
        let segment = Arc::new(ShmSegment::create(key, layout.region_len())?);
        let ring = RingBuffer::new(segment, layout)?;
        ring.init();
        Ok(Self::from_ring(ring, label))
    }

    /// Attach to a queue created by another process
    pub fn attach(
        key: &ShmKey,
        capacity: usize,
        slot_size: Option<usize>,
        label: &'static str,
    ) -> Result<Self, ShmError> {
        let layout = RingLayout::with_slot_size::<T>(capacity, slot_size)?;
        let segment = Arc::new(ShmSegment::attach(key, layout.region_len())?);
        Ok(Self::from_ring(RingBuffer::new(segment, layout)?, label))
    }

    /// In-process queue over an anonymous mapping
    pub fn anonymous(capacity: usize, label: &'static str) -> Result<Self, ShmError> {
        let layout = RingLayout::new::<T>(capacity)?;
        let segment = Arc::new(ShmSegment::anonymous(layout.region_len())?);
        let ring = RingBuffer::new(segment, layout)?;
        ring.init();
        Ok(Self::from_ring(ring, label))
    }

    fn from_ring(ring: RingBuffer<T>, label: &'static str) -> Self {
        Self {
            ring,
            label,
            counters: None,
        }
    }

    /// Count traffic and drops in `metrics` under this queue's label
    pub fn with_metrics(mut self, metrics: &MetricsRegistry) -> Self {
        self.counters = Some(metrics.transport().queue(self.label));
        self
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn segment(&self) -> &Arc<ShmSegment> {
        self.ring.segment()
    }

    /// The single writer. Continues from the current shared cursor.
    pub fn writer(&self) -> SpscWriter<T> {
        SpscWriter {
            next_seq: self.ring.cursor(),
            ring: self.ring.clone(),
            counters: self.counters.clone(),
        }
    }

    /// The single reader. History before attach time is skipped.
    pub fn reader(&self) -> SpscReader<T> {
        SpscReader {
            cursor: self.ring.cursor(),
            ring: self.ring.clone(),
            label: self.label,
            counters: self.counters.clone(),
            received: 0,
            dropped: 0,
            gaps: 0,
        }
    }
}

/// In-process SPSC pair over an anonymous mapping
pub fn channel<T: ShmPayload>(capacity: usize) -> Result<(SpscWriter<T>, SpscReader<T>), ShmError> {
    let queue = SpscQueue::anonymous(capacity, "spsc")?;
    Ok((queue.writer(), queue.reader()))
}

pub struct SpscWriter<T: ShmPayload> {
    ring: RingBuffer<T>,
    next_seq: u64,
    counters: Option<QueueCounters>,
}

impl<T: ShmPayload> SpscWriter<T> {
    /// Publish one value; never blocks. Returns its sequence number.
    #[inline]
    pub fn publish(&mut self, value: &T) -> u64 {
        let seq = self.next_seq;
        self.ring.publish(seq, value);
        self.next_seq = seq + 1;
        self.ring.advance_cursor(self.next_seq);
        if let Some(c) = &self.counters {
            c.enqueued.inc();
        }
        seq
    }

    /// Sequence number the next publish will use
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }
}

pub struct SpscReader<T: ShmPayload> {
    ring: RingBuffer<T>,
    cursor: u64,
    label: &'static str,
    counters: Option<QueueCounters>,
    received: u64,
    dropped: u64,
    gaps: u64,
}

impl<T: ShmPayload> SpscReader<T> {
    /// Next value, or `None` if the writer has not published one yet
    ///
    /// Overwritten values are skipped and counted in [`dropped`](Self::dropped).
    #[inline]
    pub fn try_recv(&mut self) -> Option<T> {
        loop {
            match self.ring.try_read(self.cursor) {
                ReadOutcome::Empty => return None,
                ReadOutcome::Ready(value) => {
                    self.cursor += 1;
                    self.received += 1;
                    if let Some(c) = &self.counters {
                        c.dequeued.inc();
                    }
                    return Some(value);
                }
                ReadOutcome::Gap { expected, found } => {
                    let resume = self.ring.resync_point(expected);
                    let missed = resume - expected;
                    self.dropped += missed;
                    self.gaps += 1;
                    if let Some(c) = &self.counters {
                        c.record_gap(missed);
                    }
                    warn!(
                        queue = self.label,
                        expected,
                        found,
                        resume,
                        missed,
                        total_dropped = self.dropped,
                        "Reader fell behind, skipping overwritten ticks"
                    );
                    self.cursor = resume;
                }
            }
        }
    }

    /// Poll until a value arrives or `timeout` elapses
    ///
    /// Spins briefly, then yields the core between polls.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let backoff = Backoff::new();
        loop {
            if let Some(value) = self.try_recv() {
                return Some(value);
            }
            if Instant::now() >= deadline {
                return None;
            }
            if backoff.is_completed() {
                std::thread::yield_now();
            } else {
                backoff.snooze();
            }
        }
    }

    /// Values still waiting to be read
    pub fn backlog(&self) -> u64 {
        self.ring.cursor().saturating_sub(self.cursor)
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// Values lost because the writer lapped this reader
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn gaps(&self) -> u64 {
        self.gaps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_delivery() {
        let (mut tx, mut rx) = channel::<u64>(8).unwrap();
        for v in 0..5u64 {
            tx.publish(&v);
        }
        let got: Vec<u64> = std::iter::from_fn(|| rx.try_recv()).collect();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
        assert_eq!(rx.dropped(), 0);
        assert_eq!(rx.try_recv(), None);
    }

    #[test]
    fn test_overflow_keeps_newest_capacity() {
        let (mut tx, mut rx) = channel::<u64>(4).unwrap();
        for v in 0..10u64 {
            tx.publish(&v);
        }
        let got: Vec<u64> = std::iter::from_fn(|| rx.try_recv()).collect();
        assert_eq!(got, vec![6, 7, 8, 9]);
        assert_eq!(rx.dropped(), 6);
        assert_eq!(rx.gaps(), 1);
    }

    #[test]
    fn test_reader_skips_history_before_attach() {
        let queue = SpscQueue::<u64>::anonymous(8, "md").unwrap();
        let mut tx = queue.writer();
        tx.publish(&1);
        tx.publish(&2);
        let mut rx = queue.reader();
        assert_eq!(rx.try_recv(), None);
        tx.publish(&3);
        assert_eq!(rx.try_recv(), Some(3));
    }

    #[test]
    fn test_metrics_count_drops() {
        let metrics = MetricsRegistry::new().unwrap();
        let queue = SpscQueue::<u64>::anonymous(2, "md").unwrap().with_metrics(&metrics);
        let mut tx = queue.writer();
        let mut rx = queue.reader();
        for v in 0..5u64 {
            tx.publish(&v);
        }
        while rx.try_recv().is_some() {}
        let counters = metrics.transport().queue("md");
        assert_eq!(counters.enqueued.get(), 5);
        assert_eq!(counters.missed.get(), 3);
        assert_eq!(counters.dequeued.get(), 2);
    }

    #[test]
    fn test_recv_timeout_expires() {
        let (_tx, mut rx) = channel::<u64>(4).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_millis(5)), None);
    }
}
