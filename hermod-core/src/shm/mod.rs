//! Shared-memory transport
//!
//! - `segment`: owned/attached shared-memory regions (file, SysV, anonymous)
//! - `ring`: the sequence-numbered ring buffer every queue is built on
//! - `spsc`: loss-tolerant market data queue
//! - `mwmr`: gap-alerting order request/response queue
//! - `client_store`: cross-process client id counter and correlation ids

pub mod client_store;
pub mod mwmr;
pub mod ring;
pub mod segment;
pub mod spsc;

pub use client_store::{ClientStore, OrderIdAllocator};
pub use mwmr::{MwmrQueue, MwmrReader, MwmrWriter};
pub use ring::{ReadOutcome, RingBuffer, RingLayout, ShmPayload};
pub use segment::{SegmentRole, ShmKey, ShmSegment};
pub use spsc::{SpscQueue, SpscReader, SpscWriter};
