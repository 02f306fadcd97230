//! Common utilities for all binaries
//!
//! Shared CLI arguments, configuration loading, logging, thread tuning and
//! shutdown wiring.

use anyhow::{anyhow, Context, Result};
use clap::Args;
use hermod_core::config::{ConfigProfile, HermodConfig, ProfileName};
use hermod_core::monitoring::MetricsRegistry;
use hermod_core::perf::tune_current_thread;
use hermod_core::shm::ShmSegment;
use hermod_core::utils::init_logger;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// SCHED_FIFO priority used with `--realtime`
pub const REALTIME_PRIORITY: i32 = 50;

/// Common CLI arguments for all binaries
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// JSON configuration file (takes precedence over --profile)
    #[arg(short = 'f', long)]
    pub config: Option<PathBuf>,

    /// Built-in profile: development or production (default: $HERMOD_PROFILE)
    #[arg(short, long)]
    pub profile: Option<String>,

    /// CPU core to pin the hot loop to
    #[arg(short = 'c', long)]
    pub cpu_core: Option<usize>,

    /// Enable real-time priority (requires privileges)
    #[arg(long)]
    pub realtime: bool,

    /// Log level, overriding the configuration
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Emit JSON logs
    #[arg(long)]
    pub json_logs: bool,
}

/// Resolve the configuration: file, then explicit profile, then environment
pub fn load_config(args: &CommonArgs) -> Result<HermodConfig> {
    let mut config = match (&args.config, &args.profile) {
        (Some(path), _) => HermodConfig::load(path)?,
        (None, Some(name)) => {
            let profile: ProfileName = name.parse().map_err(|e: String| anyhow!(e))?;
            ConfigProfile::load(profile)
        }
        (None, None) => ConfigProfile::from_env(),
    };

    if let Some(level) = &args.log_level {
        config.monitoring.log_level = level.clone();
    }
    if args.json_logs {
        config.monitoring.json_logs = true;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Initialize tracing from the resolved configuration
pub fn init_logging(config: &HermodConfig) -> Result<()> {
    init_logger(&config.monitoring.log_level, config.monitoring.json_logs)
}

/// Setup CPU affinity and real-time priority for the calling thread
pub fn setup_performance(args: &CommonArgs) {
    tune_current_thread(args.cpu_core, args.realtime.then_some(REALTIME_PRIORITY));
}

/// Install a Ctrl-C / SIGTERM handler that raises the returned flag
pub fn shutdown_flag() -> Result<Arc<AtomicBool>> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::AcqRel) {
            warn!("Second interrupt received, exiting immediately");
            std::process::exit(130);
        }
        info!("Shutdown requested");
    })
    .context("failed to install signal handler")?;
    Ok(shutdown)
}

/// Sleep for `total`, waking early when `shutdown` is raised
///
/// Returns false if shutdown was requested.
pub fn sleep_unless_shutdown(total: Duration, shutdown: &AtomicBool) -> bool {
    let deadline = Instant::now() + total;
    while !shutdown.load(Ordering::Acquire) {
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(100)));
    }
    false
}

/// Log the metrics text dump every `interval_secs` (0 disables)
pub fn spawn_metrics_logger(
    metrics: MetricsRegistry,
    interval_secs: u64,
    shutdown: Arc<AtomicBool>,
) -> Result<Option<JoinHandle<()>>> {
    if interval_secs == 0 {
        return Ok(None);
    }
    let handle = std::thread::Builder::new()
        .name("metrics-log".into())
        .spawn(move || {
            while sleep_unless_shutdown(Duration::from_secs(interval_secs), &shutdown) {
                match metrics.gather_text() {
                    Ok(text) => info!(target: "hermod::metrics", "\n{}", text),
                    Err(e) => warn!(error = %e, "Failed to render metrics"),
                }
            }
        })
        .context("failed to spawn metrics logger")?;
    Ok(Some(handle))
}

/// Unlink owned segments, tolerating peers that are still attached
pub fn destroy_segments(segments: &[Arc<ShmSegment>]) {
    for segment in segments {
        match segment.destroy() {
            Ok(()) => {}
            Err(e) => warn!(segment = segment.name(), error = %e, "Segment left in place"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        common: CommonArgs,
    }

    #[test]
    fn test_profile_argument_selects_profile() {
        let cli = TestCli::parse_from(["test", "--profile", "production", "--log-level", "warn"]);
        let config = load_config(&cli.common).unwrap();
        assert!(!config.control.auto_activate);
        assert_eq!(config.monitoring.log_level, "warn");
    }

    #[test]
    fn test_unknown_profile_is_an_error() {
        let cli = TestCli::parse_from(["test", "--profile", "staging"]);
        assert!(load_config(&cli.common).is_err());
    }

    #[test]
    fn test_sleep_returns_early_on_shutdown() {
        let shutdown = AtomicBool::new(true);
        assert!(!sleep_unless_shutdown(Duration::from_secs(5), &shutdown));
        let running = AtomicBool::new(false);
        assert!(sleep_unless_shutdown(Duration::from_millis(1), &running));
    }
}
