//! Shared setup for the hermod binaries

pub mod common;
