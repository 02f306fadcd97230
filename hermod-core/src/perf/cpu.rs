//! Thread placement for the latency-sensitive loops
//!
//! The gateway worker, the market data feeder and the trader's response
//! loop each spin on a shared-memory queue. Pinning them to isolated cores
//! and raising them to SCHED_FIFO keeps polling jitter low.

use anyhow::{bail, Result};
use core_affinity::CoreId;
use tracing::{info, warn};

/// Pin the calling thread to `core`
///
/// # Example
/// ```no_run
/// use hermod_core::perf::cpu::pin_to_core;
/// pin_to_core(2).expect("core 2 not available");
/// ```
pub fn pin_to_core(core: usize) -> Result<()> {
    let available = num_cores();
    if core >= available {
        bail!("cannot pin to core {core}: only {available} cores available");
    }
    if !core_affinity::set_for_current(CoreId { id: core }) {
        bail!("failed to pin thread to core {core}");
    }
    info!(core, "Thread pinned");
    Ok(())
}

/// Run the calling thread under SCHED_FIFO at `priority`
///
/// Needs CAP_SYS_NICE or root.
#[cfg(target_os = "linux")]
pub fn set_realtime_priority(priority: i32) -> Result<()> {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    // SAFETY: pid 0 is the calling thread and `param` outlives the call
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        bail!("sched_setscheduler(SCHED_FIFO, {priority}) failed: {err}");
    }
    info!(priority, "Thread scheduled SCHED_FIFO");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_realtime_priority(priority: i32) -> Result<()> {
    warn!(priority, "Real-time priority not supported on this platform");
    Ok(())
}

pub fn num_cores() -> usize {
    core_affinity::get_core_ids().map(|ids| ids.len()).unwrap_or(1)
}

/// Pin and raise priority in one step; both must succeed
pub fn optimize_for_hft(core: usize, priority: i32) -> Result<()> {
    pin_to_core(core)?;
    set_realtime_priority(priority)?;
    Ok(())
}

/// Apply whatever tuning was asked for, logging failures instead of
/// returning them
///
/// Used by the binaries, where a missing capability should not stop the
/// process.
pub fn tune_current_thread(core: Option<usize>, priority: Option<i32>) {
    if let Some(core) = core {
        if let Err(e) = pin_to_core(core) {
            warn!(core, error = %e, "CPU pinning skipped");
        }
    }
    if let Some(priority) = priority {
        if let Err(e) = set_realtime_priority(priority) {
            warn!(priority, error = %e, "Real-time priority skipped");
        }
    }
}
