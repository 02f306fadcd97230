//! Position snapshots on disk
//!
//! JSON is written to a sibling temp file and renamed into place, so a crash
//! mid-write leaves the previous snapshot intact.

use crate::position::ledger::{LedgerSnapshot, PositionLedger};
use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

/// Write the current ledger to `path`
pub fn save_snapshot<P: AsRef<Path>>(path: P, ledger: &PositionLedger) -> Result<LedgerSnapshot> {
    let path = path.as_ref();
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let snapshot = ledger.snapshot(now_ms);

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create snapshot directory {}", parent.display()))?;
        }
    }

    let tmp = path.with_extension("json.tmp");
    {
        let file = File::create(&tmp)
            .with_context(|| format!("Failed to create {}", tmp.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &snapshot).context("Failed to serialize snapshot")?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move snapshot into {}", path.display()))?;

    info!(
        path = %path.display(),
        instruments = snapshot.positions.len(),
        "Position snapshot saved"
    );
    Ok(snapshot)
}

/// Read a snapshot written by [`save_snapshot`]
pub fn load_snapshot<P: AsRef<Path>>(path: P) -> Result<LedgerSnapshot> {
    let path = path.as_ref();
    let file = File::open(path)
        .with_context(|| format!("Failed to open snapshot {}", path.display()))?;
    let snapshot: LedgerSnapshot = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse snapshot {}", path.display()))?;
    info!(
        path = %path.display(),
        instruments = snapshot.positions.len(),
        "Position snapshot loaded"
    );
    Ok(snapshot)
}
