//! Thread placement for the polling loops
//!
//! - **CPU affinity**: pin a thread to one core
//! - **Real-time scheduling**: SCHED_FIFO on Linux

pub mod cpu;

pub use cpu::{num_cores, optimize_for_hft, pin_to_core, set_realtime_priority, tune_current_thread};
