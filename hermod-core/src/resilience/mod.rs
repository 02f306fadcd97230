//! Stream integrity checks and process-level failure handling

pub mod gap_detector;
pub mod panic;

pub use gap_detector::{GapDetector, SeqStatus};
pub use panic::{install_panic_handler, remove_panic_handler, PanicCleanup};
