//! Process-wide panic hook
//!
//! A panic in any polling thread leaves shared-memory peers attached to a
//! process that will never write again. The hook logs where it happened,
//! runs the registered cleanup (segment owners unlink their segments) and
//! exits non-zero so a supervisor restarts the process.
//!
//! ```no_run
//! use hermod_core::resilience::install_panic_handler;
//!
//! install_panic_handler(None);
//! ```

use std::panic;
use std::process;
use std::time::Duration;
use tracing::error;

/// Cleanup run once from the panic hook before the process exits
pub type PanicCleanup = Box<dyn Fn() + Send + Sync + 'static>;

/// Install the hook; `cleanup` runs after logging and before exit
pub fn install_panic_handler(cleanup: Option<PanicCleanup>) {
    let default_hook = panic::take_hook();

    panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_else(|| "<unknown location>".to_string());

        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "<no message>".to_string()
        };

        let thread = std::thread::current();
        error!(
            location = %location,
            message = %message,
            thread = thread.name().unwrap_or("<unnamed>"),
            "Panic, shutting down"
        );
        // stderr copy in case no subscriber is installed yet
        eprintln!("hermod: panic at {location}: {message}");

        default_hook(panic_info);

        if let Some(cleanup) = &cleanup {
            cleanup();
        }

        std::thread::sleep(Duration::from_millis(100));
        process::exit(1);
    }));

    tracing::debug!("Panic handler installed");
}

/// Restore the standard library's default hook
pub fn remove_panic_handler() {
    let _ = panic::take_hook();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore] // exits the test process
    fn test_panic_handler_exits() {
        install_panic_handler(Some(Box::new(|| eprintln!("cleanup ran"))));
        panic!("deliberate");
    }
}
