//! Ring Buffer Primitive
//!
//! Fixed-capacity circular buffer laid out over a shared-memory segment:
//!
//! ```text
//! [cursor: u64][slot 0][slot 1]...[slot N-1]
//!  slot = [payload T, padded to 8][seq: u64][optional tail padding]
//! ```
//!
//! N is a power of two so the slot for sequence `s` is `s & (N - 1)`.
//! A slot's sequence number is written only after its payload; readers use
//! it as the sole readiness signal:
//!
//! - `seq <  expected` → slot not yet written for this lap (empty)
//! - `seq == expected` → payload is ready
//! - `seq >  expected` → writers lapped the reader (gap)
//!
//! The cursor starts at 1 so that a zeroed slot (seq 0) always reads as empty.

use crate::core::errors::ShmError;
use crate::shm::segment::ShmSegment;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ptr;
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;

/// Size of the queue header holding the shared cursor
pub const HEADER_LEN: usize = 8;

/// First sequence number handed out on a fresh ring
pub const FIRST_SEQ: u64 = 1;

/// Marker for types that may be copied byte-for-byte through shared memory
///
/// # Safety
///
/// Implementors must be `#[repr(C)]` (or a primitive), contain no pointers,
/// references or niches, have explicit padding fields so the layout is the
/// same in every attaching process, and accept the all-zero bit pattern as
/// a valid value.
pub unsafe trait ShmPayload: Copy + Send + 'static {}

// SAFETY: primitive integer, any bit pattern valid
unsafe impl ShmPayload for u64 {}

/// Outcome of a single non-blocking read attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReadOutcome<T> {
    Empty,
    Ready(T),
    /// The reader fell behind; `found` is the sequence now occupying the slot
    Gap { expected: u64, found: u64 },
}

/// Byte layout of a ring for a given payload type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    capacity: usize,
    slot_size: usize,
    seq_offset: usize,
}

impl RingLayout {
    /// Natural layout: capacity rounded up to a power of two, slot packed
    pub fn new<T: ShmPayload>(capacity: usize) -> Result<Self, ShmError> {
        Self::with_slot_size::<T>(capacity, None)
    }

    /// Layout with an explicit slot stride
    ///
    /// Needed when the other side of the segment was compiled with different
    /// packing, e.g. a cache-line aligned payload whose slots are 64-byte
    /// multiples.
    pub fn with_slot_size<T: ShmPayload>(
        capacity: usize,
        slot_size: Option<usize>,
    ) -> Result<Self, ShmError> {
        if capacity == 0 {
            return Err(ShmError::InvalidLayout("capacity must be non-zero".into()));
        }
        if align_of::<T>() > 8 {
            return Err(ShmError::InvalidLayout(format!(
                "payload alignment {} exceeds 8",
                align_of::<T>()
            )));
        }
        let capacity = capacity
            .checked_next_power_of_two()
            .ok_or_else(|| ShmError::InvalidLayout(format!("capacity {} too large", capacity)))?;

        let seq_offset = size_of::<T>().next_multiple_of(8);
        let natural = seq_offset + 8;
        let slot_size = match slot_size {
            None => natural,
            Some(s) if s % 8 != 0 => {
                return Err(ShmError::InvalidLayout(format!(
                    "slot size {} is not a multiple of 8",
                    s
                )))
            }
            Some(s) if s < natural => {
                return Err(ShmError::InvalidLayout(format!(
                    "slot size {} smaller than payload plus sequence ({})",
                    s, natural
                )))
            }
            Some(s) => s,
        };

        Ok(Self {
            capacity,
            slot_size,
            seq_offset,
        })
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline(always)]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Total bytes needed for header plus slots
    pub fn region_len(&self) -> usize {
        HEADER_LEN + self.capacity * self.slot_size
    }
}

/// Typed view of a ring laid out in a segment
///
/// Cloning is cheap and shares the same segment.
pub struct RingBuffer<T: ShmPayload> {
    segment: Arc<ShmSegment>,
    layout: RingLayout,
    mask: u64,
    _marker: PhantomData<T>,
}

impl<T: ShmPayload> Clone for RingBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            segment: Arc::clone(&self.segment),
            layout: self.layout,
            mask: self.mask,
            _marker: PhantomData,
        }
    }
}

// SAFETY: all shared state is reached through atomics or the seq protocol
unsafe impl<T: ShmPayload> Send for RingBuffer<T> {}
unsafe impl<T: ShmPayload> Sync for RingBuffer<T> {}

impl<T: ShmPayload> RingBuffer<T> {
    pub fn new(segment: Arc<ShmSegment>, layout: RingLayout) -> Result<Self, ShmError> {
        if segment.len() < layout.region_len() {
            return Err(ShmError::SizeMismatch {
                key: segment.name().to_string(),
                expected: layout.region_len(),
                found: segment.len(),
            });
        }
        if segment.as_ptr() as usize % 8 != 0 {
            return Err(ShmError::InvalidLayout("segment base is not 8-byte aligned".into()));
        }
        Ok(Self {
            segment,
            layout,
            mask: (layout.capacity - 1) as u64,
            _marker: PhantomData,
        })
    }

    pub fn layout(&self) -> RingLayout {
        self.layout
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.layout.capacity
    }

    pub fn segment(&self) -> &Arc<ShmSegment> {
        &self.segment
    }

    /// Reset the ring: cursor to [`FIRST_SEQ`], every slot zeroed
    ///
    /// Only the creator calls this, before any other process attaches.
    pub fn init(&self) {
        // SAFETY: region_len bytes were validated in new()
        unsafe {
            ptr::write_bytes(
                self.segment.as_ptr().add(HEADER_LEN),
                0,
                self.layout.capacity * self.layout.slot_size,
            );
        }
        self.header().store(FIRST_SEQ, Ordering::Release);
    }

    #[inline(always)]
    fn header(&self) -> &AtomicU64 {
        // SAFETY: header is the first 8 bytes of an 8-aligned region
        unsafe { &*(self.segment.as_ptr() as *const AtomicU64) }
    }

    #[inline(always)]
    fn slot_base(&self, seq: u64) -> *mut u8 {
        let index = (seq & self.mask) as usize;
        // SAFETY: index < capacity, so the slot lies inside the region
        unsafe {
            self.segment
                .as_ptr()
                .add(HEADER_LEN + index * self.layout.slot_size)
        }
    }

    #[inline(always)]
    fn slot_seq(&self, seq: u64) -> &AtomicU64 {
        // SAFETY: seq_offset is 8-aligned within an 8-aligned slot
        unsafe { &*(self.slot_base(seq).add(self.layout.seq_offset) as *const AtomicU64) }
    }

    /// Next sequence number to be assigned
    #[inline(always)]
    pub fn cursor(&self) -> u64 {
        self.header().load(Ordering::Acquire)
    }

    /// Atomically claim the next sequence number (multi-writer path)
    #[inline(always)]
    pub fn claim(&self) -> u64 {
        self.header().fetch_add(1, Ordering::AcqRel)
    }

    /// Publish a single writer's cursor
    #[inline(always)]
    pub fn advance_cursor(&self, next: u64) {
        self.header().store(next, Ordering::Release);
    }

    /// Where a lapped reader that expected `expected` should resume
    ///
    /// The oldest sequence that can still be in the ring, and always past
    /// `expected`.
    #[inline]
    pub fn resync_point(&self, expected: u64) -> u64 {
        let oldest = self.cursor().saturating_sub(self.layout.capacity as u64);
        oldest.max(expected + 1)
    }

    /// Sequence number currently stored in the slot that `seq` maps to
    pub fn slot_sequence(&self, seq: u64) -> u64 {
        self.slot_seq(seq).load(Ordering::Acquire)
    }

    /// Write `value` into the slot for `seq`, then release `seq`
    #[inline(always)]
    pub fn publish(&self, seq: u64, value: &T) {
        let slot_seq = self.slot_seq(seq);
        // Mark the slot as in-flight so a lapped reader mid-copy notices
        slot_seq.store(0, Ordering::Relaxed);
        fence(Ordering::Release);
        // SAFETY: slot holds size_of::<T>() bytes at an 8-aligned offset
        unsafe {
            ptr::write_volatile(self.slot_base(seq) as *mut T, *value);
        }
        slot_seq.store(seq, Ordering::Release);
    }

    /// Non-blocking read of the slot expected to hold `expected`
    #[inline(always)]
    pub fn try_read(&self, expected: u64) -> ReadOutcome<T> {
        let slot_seq = self.slot_seq(expected);
        let before = slot_seq.load(Ordering::Acquire);
        if before < expected {
            return ReadOutcome::Empty;
        }
        if before > expected {
            return ReadOutcome::Gap {
                expected,
                found: before,
            };
        }

        // SAFETY: slot holds a T written before the Release store we observed
        let value = unsafe { ptr::read_volatile(self.slot_base(expected) as *const T) };
        fence(Ordering::Acquire);
        let after = slot_seq.load(Ordering::Relaxed);
        if after != expected {
            // Overwritten while copying; the copy may be torn
            let found = if after == 0 {
                expected + self.layout.capacity as u64
            } else {
                after
            };
            return ReadOutcome::Gap { expected, found };
        }
        ReadOutcome::Ready(value)
    }
}
