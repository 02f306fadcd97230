//! Market data: the tick wire type, the SPSC publisher/feed pair and the
//! in-process router

pub mod feed;
pub mod router;
pub mod types;

pub use feed::{FeedStats, MarketDataFeed, MarketDataPublisher};
pub use router::TickRouter;
pub use types::{BookLevel, MarketTick};
