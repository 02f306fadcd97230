//! Multi-writer / multi-reader order queue
//!
//! Writers claim a unique sequence number with a single `fetch_add` on the
//! shared cursor and then publish into the claimed slot, so writers never
//! collide. Every reader keeps its own cursor starting at the queue state
//! when it attached and sees every message published afterwards, in the same
//! total order as every other reader.
//!
//! A lost request or fill desynchronises the position ledger, so unlike the
//! market data queue a gap here is an incident: it is logged at `error!`,
//! counted, and returned to the caller as a [`TransportGap`].

use crate::core::errors::{ShmError, TransportGap};
use crate::monitoring::metrics::{MetricsRegistry, QueueCounters};
use crate::shm::ring::{ReadOutcome, RingBuffer, RingLayout, ShmPayload};
use crate::shm::segment::{ShmKey, ShmSegment};
use crossbeam_utils::Backoff;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::error;

/// An order request or response queue bound to a segment
pub struct MwmrQueue<T: ShmPayload> {
    ring: RingBuffer<T>,
    label: &'static str,
    counters: Option<QueueCounters>,
}

impl<T: ShmPayload> MwmrQueue<T> {
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

    pub fn with_metrics(mut self, metrics: &MetricsRegistry) -> Self {
        self.counters = Some(metrics.transport().queue(self.label));
        self
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn segment(&self) -> &Arc<ShmSegment> {
        self.ring.segment()
    }

    /// Next sequence number the queue will hand out
    pub fn cursor(&self) -> u64 {
        self.ring.cursor()
    }

    pub fn writer(&self) -> MwmrWriter<T> {
        MwmrWriter {
            ring: self.ring.clone(),
            counters: self.counters.clone(),
        }
    }

    /// A new independent reader positioned at the current cursor
    pub fn reader(&self) -> MwmrReader<T> {
        MwmrReader {
            cursor: self.ring.cursor(),
            ring: self.ring.clone(),
            label: self.label,
            counters: self.counters.clone(),
            received: 0,
            gaps: 0,
            missed: 0,
        }
    }
}

/// Cloneable writer handle; any number may enqueue concurrently
pub struct MwmrWriter<T: ShmPayload> {
    ring: RingBuffer<T>,
    counters: Option<QueueCounters>,
}

impl<T: ShmPayload> Clone for MwmrWriter<T> {
    fn clone(&self) -> Self {
        Self {
            ring: self.ring.clone(),
            counters: self.counters.clone(),
        }
    }
}

impl<T: ShmPayload> MwmrWriter<T> {
    /// Enqueue a copy of `value`; returns the sequence number it was given
    #[inline]
    pub fn enqueue(&self, value: &T) -> u64 {
        let seq = self.ring.claim();
        self.ring.publish(seq, value);
        if let Some(c) = &self.counters {
            c.enqueued.inc();
        }
        seq
    }
}

pub struct MwmrReader<T: ShmPayload> {
    ring: RingBuffer<T>,
    cursor: u64,
    label: &'static str,
    counters: Option<QueueCounters>,
    received: u64,
    gaps: u64,
    missed: u64,
}

impl<T: ShmPayload> MwmrReader<T> {
    /// Next message in sequence order
    ///
    /// `Ok(None)` when nothing new is published. On a gap the reader is moved
    /// to the oldest retained message, the gap is reported, and the next call
    /// continues from there.
    #[inline]
    pub fn try_dequeue(&mut self) -> Result<Option<T>, TransportGap> {
        match self.ring.try_read(self.cursor) {
            ReadOutcome::Empty => Ok(None),
            ReadOutcome::Ready(value) => {
                self.cursor += 1;
                self.received += 1;
                if let Some(c) = &self.counters {
                    c.dequeued.inc();
                }
                Ok(Some(value))
            }
            ReadOutcome::Gap { expected, found } => {
                let resume = self.ring.resync_point(expected);
                let gap = TransportGap::new(self.label, expected, found, resume - expected);
                self.gaps += 1;
                self.missed += gap.missed;
                if let Some(c) = &self.counters {
                    c.record_gap(gap.missed);
                }
                error!(
                    queue = self.label,
                    expected,
                    found,
                    resume,
                    missed = gap.missed,
                    "Order path sequence gap, messages lost"
                );
                self.cursor = resume;
                Err(gap)
            }
        }
    }

    /// Poll until a message arrives, a gap is hit, or `timeout` elapses
    pub fn dequeue_timeout(&mut self, timeout: Duration) -> Result<Option<T>, TransportGap> {
        let deadline = Instant::now() + timeout;
        let backoff = Backoff::new();
        loop {
            if let Some(value) = self.try_dequeue()? {
                return Ok(Some(value));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            if backoff.is_completed() {
                std::thread::yield_now();
            } else {
                backoff.snooze();
            }
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ring.slot_sequence(self.cursor) < self.cursor
    }

    /// Next sequence number this reader expects
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Messages claimed by writers but not yet consumed here
    pub fn backlog(&self) -> u64 {
        self.ring.cursor().saturating_sub(self.cursor)
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn gaps(&self) -> u64 {
        self.gaps
    }

    pub fn missed(&self) -> u64 {
        self.missed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_writer_fifo() {
        let q = MwmrQueue::<u64>::anonymous(16, "test").unwrap();
        let w = q.writer();
        let mut r = q.reader();
        for v in 100..110u64 {
            w.enqueue(&v);
        }
        for v in 100..110u64 {
            assert_eq!(r.try_dequeue(), Ok(Some(v)));
        }
        assert_eq!(r.try_dequeue(), Ok(None));
        assert!(r.is_empty());
    }

    #[test]
    fn test_sequences_are_unique_and_increasing() {
        let q = MwmrQueue::<u64>::anonymous(16, "test").unwrap();
        let a = q.writer();
        let b = a.clone();
        let s1 = a.enqueue(&1);
        let s2 = b.enqueue(&2);
        let s3 = a.enqueue(&3);
        assert_eq!((s1, s2, s3), (1, 2, 3));
        assert_eq!(q.cursor(), 4);
    }

    #[test]
    fn test_readers_are_independent() {
        let q = MwmrQueue::<u64>::anonymous(8, "test").unwrap();
        let w = q.writer();
        let mut r1 = q.reader();
        w.enqueue(&1);
        let mut r2 = q.reader();
        w.enqueue(&2);

        assert_eq!(r1.try_dequeue(), Ok(Some(1)));
        assert_eq!(r1.try_dequeue(), Ok(Some(2)));
        // r2 attached after the first message
        assert_eq!(r2.try_dequeue(), Ok(Some(2)));
        assert_eq!(r2.try_dequeue(), Ok(None));
    }

    #[test]
    fn test_gap_is_reported_then_reader_resumes() {
        let metrics = MetricsRegistry::new().unwrap();
        let q = MwmrQueue::<u64>::anonymous(4, "order_response")
            .unwrap()
            .with_metrics(&metrics);
        let w = q.writer();
        let mut r = q.reader();
        for v in 1..=6u64 {
            w.enqueue(&v);
        }

        let gap = r.try_dequeue().unwrap_err();
        assert_eq!(gap.queue, "order_response");
        assert_eq!(gap.expected, 1);
        assert_eq!(gap.found, 5);
        assert_eq!(gap.missed, 2);

        assert_eq!(r.try_dequeue(), Ok(Some(3)));
        assert_eq!(r.try_dequeue(), Ok(Some(4)));
        assert_eq!(r.try_dequeue(), Ok(Some(5)));
        assert_eq!(r.try_dequeue(), Ok(Some(6)));
        assert_eq!(r.try_dequeue(), Ok(None));
        assert_eq!(r.missed(), 2);

        let counters = metrics.transport().queue("order_response");
        assert_eq!(counters.gaps.get(), 1);
        assert_eq!(counters.missed.get(), 2);
    }
}
