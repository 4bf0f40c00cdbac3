//! Bookkeeping for reward-search experiments: groups a task root's policy
//! runs by iteration, scores them from their event logs, picks the best run
//! per group and materializes checkpoints, videos and reports for it.

pub mod artifact;
pub mod batch;
pub mod config;
pub mod error;
pub mod evaluate;
pub mod gpu;
pub mod index;
pub mod media;
pub mod process;
pub mod report;
pub mod sanitize;
pub mod select;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;

pub use artifact::{ArtifactKind, ArtifactStore, CheckpointEmitter, Emitter, VideoEmitter};
pub use batch::{discover_task_roots, run_batch, BatchReport};
pub use config::{HarnessSettings, RunConfig};
pub use error::ConfigError;
pub use index::{Group, IndexOptions, PolicyRunFolder, ScoredPolicy, TaskRunIndex};
pub use rlab_events::{MetricSeries, ScalarSeries};
pub use select::best_policy;

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("creating {}", path.display()))
}

/// Writes through a sibling temp file and renames it into place, so readers
/// never observe a half-written file.
/// Hidden sibling of `path` used to stage a write before renaming it in.
pub(crate) fn temp_sibling(path: &Path) -> PathBuf {
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts))
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let tmp = temp_sibling(path);
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &serde_json::Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}
