//! Shared client-id counter and correlation id allocation
//!
//! The gateway owns a 16-byte segment `[counter: i64][first_client_id: i64]`.
//! Each trader process attaches, takes a unique client id with one
//! `fetch_add`, and from then on allocates correlation ids locally as
//! `client_id * range + local_seq`.

use crate::config::constants::ORDER_ID_RANGE;
use crate::core::errors::ShmError;
use crate::core::types::CorrelationId;
use crate::shm::segment::{ShmKey, ShmSegment};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Size of the client store segment
pub const CLIENT_STORE_LEN: usize = 16;

pub struct ClientStore {
    segment: Arc<ShmSegment>,
}

impl ClientStore {
    /// Create the store with the counter starting at `first_client_id`
    pub fn create(key: &ShmKey, first_client_id: i64) -> Result<Self, ShmError> {
        let store = Self {
            segment: Arc::new(ShmSegment::create(key, CLIENT_STORE_LEN)?),
        };
        store.init(first_client_id);
        Ok(store)
    }

    pub fn attach(key: &ShmKey) -> Result<Self, ShmError> {
        Ok(Self {
            segment: Arc::new(ShmSegment::attach(key, CLIENT_STORE_LEN)?),
        })
    }

    pub fn anonymous(first_client_id: i64) -> Result<Self, ShmError> {
        let store = Self {
            segment: Arc::new(ShmSegment::anonymous(CLIENT_STORE_LEN)?),
        };
        store.init(first_client_id);
        Ok(store)
    }

    fn init(&self, first_client_id: i64) {
        self.first_cell().store(first_client_id, Ordering::Release);
        self.counter().store(first_client_id, Ordering::Release);
    }

    #[inline(always)]
    fn counter(&self) -> &AtomicI64 {
        // SAFETY: segment is at least 16 bytes and page aligned
        unsafe { &*(self.segment.as_ptr() as *const AtomicI64) }
    }

    #[inline(always)]
    fn first_cell(&self) -> &AtomicI64 {
        // SAFETY: second 8-byte word of the segment
        unsafe { &*(self.segment.as_ptr().add(8) as *const AtomicI64) }
    }

    /// Claim a client id unique across every attached process
    pub fn next_client_id(&self) -> i64 {
        let id = self.counter().fetch_add(1, Ordering::AcqRel);
        info!(client_id = id, "Allocated client id");
        id
    }

    /// Next id that would be handed out
    pub fn peek(&self) -> i64 {
        self.counter().load(Ordering::Acquire)
    }

    pub fn first_client_id(&self) -> i64 {
        self.first_cell().load(Ordering::Acquire)
    }

    pub fn segment(&self) -> &Arc<ShmSegment> {
        &self.segment
    }
}

/// Per-process correlation id generator
///
/// Local sequence runs `1..range`; on exhaustion it wraps back to 1.
#[derive(Debug)]
pub struct OrderIdAllocator {
    client_id: u64,
    range: u64,
    next: AtomicU64,
}

impl OrderIdAllocator {
    pub fn new(client_id: u64) -> Self {
        Self::with_range(client_id, ORDER_ID_RANGE)
    }

    pub fn with_range(client_id: u64, range: u64) -> Self {
        Self {
            client_id,
            range: range.max(2),
            next: AtomicU64::new(1),
        }
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    pub fn next_id(&self) -> CorrelationId {
        let raw = self.next.fetch_add(1, Ordering::Relaxed);
        let span = self.range - 1;
        let local = (raw - 1) % span + 1;
        if raw > span && local == 1 {
            warn!(client_id = self.client_id, "Correlation id space wrapped");
        }
        CorrelationId(self.client_id * self.range + local)
    }

    /// Whether `id` was allocated by this client
    pub fn owns(&self, id: CorrelationId) -> bool {
        id.client_id(self.range) == self.client_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_ids_are_unique() {
        let store = ClientStore::anonymous(1).unwrap();
        assert_eq!(store.first_client_id(), 1);
        assert_eq!(store.next_client_id(), 1);
        assert_eq!(store.next_client_id(), 2);
        assert_eq!(store.peek(), 3);
    }

    #[test]
    fn test_correlation_ids_encode_client() {
        let alloc = OrderIdAllocator::new(3);
        let a = alloc.next_id();
        let b = alloc.next_id();
        assert_eq!(a, CorrelationId(3 * ORDER_ID_RANGE + 1));
        assert_eq!(b, CorrelationId(3 * ORDER_ID_RANGE + 2));
        assert!(alloc.owns(a));
        assert!(!OrderIdAllocator::new(4).owns(a));
    }

    #[test]
    fn test_allocator_wraps_within_range() {
        let alloc = OrderIdAllocator::with_range(2, 4);
        let ids: Vec<u64> = (0..5).map(|_| alloc.next_id().0).collect();
        assert_eq!(ids, vec![9, 10, 11, 9, 10]);
        assert!(ids.iter().all(|&id| id / 4 == 2));
    }
}
