//! Compile-time defaults shared by every process
//!
//! Queue keys and sizes must agree between the gateway and every trader
//! attached to it; runtime configuration defaults to these values.

// ===== SHARED MEMORY LAYOUT =====

/// Default slot count for the order request/response queues
#[cfg(not(feature = "large-queues"))]
pub const DEFAULT_QUEUE_SIZE: usize = 4096;
#[cfg(feature = "large-queues")]
pub const DEFAULT_QUEUE_SIZE: usize = 16384;

/// Default slot count for the market data queue
#[cfg(not(feature = "large-queues"))]
pub const DEFAULT_MD_QUEUE_SIZE: usize = 4096;
#[cfg(feature = "large-queues")]
pub const DEFAULT_MD_QUEUE_SIZE: usize = 65536;

/// SysV key of the order request queue
pub const REQUEST_QUEUE_KEY: i32 = 0x0F20;

/// SysV key of the order response queue
pub const RESPONSE_QUEUE_KEY: i32 = 0x1308;

/// SysV key of the client id store
pub const CLIENT_STORE_KEY: i32 = 0x16F0;

/// Name of the market data segment under /dev/shm
pub const MD_SEGMENT_NAME: &str = "hermod_md";

// ===== ORDER IDS =====

/// Correlation ids are `client_id * ORDER_ID_RANGE + local_seq`
pub const ORDER_ID_RANGE: u64 = 1_000_000;

/// First client id handed out by a fresh client store
pub const FIRST_CLIENT_ID: i64 = 1;

// ===== MARKET DATA =====

/// Price levels carried per side in a tick
pub const BOOK_DEPTH: usize = 10;

// ===== OFFSET RESOLUTION =====

/// Maximum legs a single intent can be split into
/// (close-today, close-yesterday, open)
pub const MAX_PLAN_LEGS: usize = 3;

// ===== CONTROL =====

/// Default interval between risk checks
pub const RISK_CHECK_INTERVAL_MS: u64 = 100;

/// Default ceiling on rejects before a strategy exits
pub const MAX_REJECTS: u32 = 10;
