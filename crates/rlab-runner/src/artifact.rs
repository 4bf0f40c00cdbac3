use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::config::HarnessSettings;
use crate::index::{Group, TaskRunIndex};
use crate::process::{find_rendered_video, newest_dir, Renderer};
use crate::{atomic_write_bytes, ensure_dir, temp_sibling};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Checkpoint,
    Video,
}

impl ArtifactKind {
    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactKind::Checkpoint => ".pth",
            ArtifactKind::Video => ".mp4",
        }
    }

    pub fn dir(&self, settings: &HarnessSettings) -> PathBuf {
        match self {
            ArtifactKind::Checkpoint => settings.checkpoints_dir(),
            ArtifactKind::Video => settings.videos_dir(),
        }
    }
}

/// Key/value lines written next to an artifact.
pub type Provenance = Vec<(String, String)>;

/// Destination directory for one kind of artifact.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
    kind: ArtifactKind,
    save_metadata: bool,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>, kind: ArtifactKind, save_metadata: bool) -> Self {
        Self {
            dir: dir.into(),
            kind,
            save_metadata,
        }
    }

    pub fn for_kind(settings: &HarnessSettings, kind: ArtifactKind) -> Self {
        Self::new(kind.dir(settings), kind, settings.save_metadata)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    /// `{prefix}_iter{N}{ext}` or `{prefix}_eval{ext}`.
    pub fn path(&self, prefix: &str, group: Group) -> PathBuf {
        let ext = self.kind.extension();
        let name = match group {
            Group::Iteration(n) => format!("{}_iter{}{}", prefix, n, ext),
            Group::Evaluation => format!("{}_eval{}", prefix, ext),
        };
        self.dir.join(name)
    }

    /// `{stem}_task_folder.txt` beside `dest`.
    pub fn sidecar_path(dest: &Path) -> PathBuf {
        let stem = dest
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        dest.with_file_name(format!("{}_task_folder.txt", stem))
    }

    /// Writes the sidecar when metadata is enabled.
    pub fn save_provenance(&self, dest: &Path, provenance: &Provenance) -> Result<Option<PathBuf>> {
        if !self.save_metadata {
            return Ok(None);
        }
        let sidecar = Self::sidecar_path(dest);
        let mut text = String::new();
        for (key, value) in provenance {
            text.push_str(&format!("{}: {}\n", key, value));
        }
        atomic_write_bytes(&sidecar, text.as_bytes())?;
        Ok(Some(sidecar))
    }
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

fn copy_into_place(src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        ensure_dir(parent)?;
    }
    // A partial copy must never sit at `dest`, whose existence marks the
    // artifact as done.
    let tmp = temp_sibling(dest);
    if let Err(e) = fs::copy(src, &tmp).and_then(|_| fs::rename(&tmp, dest)) {
        let _ = fs::remove_file(&tmp);
        return Err(e).with_context(|| format!("copying {} to {}", src.display(), dest.display()));
    }
    Ok(())
}

/// What [`process_policy`] did for one group.
#[derive(Debug, Clone, PartialEq)]
pub enum EmitOutcome {
    AlreadyExists(PathBuf),
    NoPolicy,
    NoCheckpoint,
    NotProduced,
    Written(PathBuf),
}

/// Produces one artifact per group from the group's best checkpoint.
pub trait Emitter {
    fn store(&self) -> &ArtifactStore;

    /// Writes the artifact for `checkpoint` to `dest`. `Ok(None)` means the
    /// artifact could not be produced and nothing was written.
    fn materialize(
        &mut self,
        index: &TaskRunIndex,
        group: Group,
        checkpoint: &Path,
        dest: &Path,
    ) -> Result<Option<Provenance>>;
}

/// Emits the artifact of `group` unless it already exists.
pub fn process_policy(
    emitter: &mut dyn Emitter,
    index: &TaskRunIndex,
    prefix: &str,
    group: Group,
) -> Result<EmitOutcome> {
    let dest = emitter.store().path(prefix, group);
    if dest.exists() {
        info!(dest = %dest.display(), "artifact exists, skipping");
        return Ok(EmitOutcome::AlreadyExists(dest));
    }
    let Some(best) = index.best_policy(group) else {
        info!(root = %index.root().display(), %group, "no policy to emit");
        return Ok(EmitOutcome::NoPolicy);
    };
    let Some(checkpoint) = index.checkpoint_path(&best.folder) else {
        return Ok(EmitOutcome::NoCheckpoint);
    };
    let Some(provenance) = emitter.materialize(index, group, &checkpoint, &dest)? else {
        return Ok(EmitOutcome::NotProduced);
    };
    if let Some(sidecar) = emitter.store().save_provenance(&dest, &provenance)? {
        info!(sidecar = %sidecar.display(), "saved provenance");
    }
    info!(dest = %dest.display(), score = best.score, "saved artifact");
    Ok(EmitOutcome::Written(dest))
}

/// Runs [`process_policy`] for every iteration, then for the evaluation
/// group. A failing group is logged and does not stop the others.
pub fn emit_task(emitter: &mut dyn Emitter, index: &TaskRunIndex) -> Vec<(Group, EmitOutcome)> {
    let prefix = index.config().artifact_prefix();
    let groups = (0..index.config().iteration_count)
        .map(Group::Iteration)
        .chain(std::iter::once(Group::Evaluation));
    let mut outcomes = Vec::new();
    for group in groups {
        match process_policy(emitter, index, &prefix, group) {
            Ok(outcome) => outcomes.push((group, outcome)),
            Err(e) => error!(root = %index.root().display(), %group, error = %format!("{:#}", e), "emit failed"),
        }
    }
    outcomes
}

pub struct CheckpointEmitter {
    store: ArtifactStore,
}

impl CheckpointEmitter {
    pub fn new(store: ArtifactStore) -> Self {
        Self { store }
    }
}

impl Emitter for CheckpointEmitter {
    fn store(&self) -> &ArtifactStore {
        &self.store
    }

    fn materialize(
        &mut self,
        _index: &TaskRunIndex,
        _group: Group,
        checkpoint: &Path,
        dest: &Path,
    ) -> Result<Option<Provenance>> {
        copy_into_place(checkpoint, dest)?;
        // nn/<file> sits inside the run identifier directory.
        let run_dir = checkpoint
            .parent()
            .and_then(Path::parent)
            .unwrap_or(checkpoint);
        Ok(Some(vec![
            ("Original checkpoint".to_string(), checkpoint.display().to_string()),
            ("Policy folder".to_string(), run_dir.display().to_string()),
            ("sha256".to_string(), sha256_file(dest)?),
        ]))
    }
}

/// Renders each best checkpoint and copies the newest video.
pub struct VideoEmitter<R: Renderer> {
    store: ArtifactStore,
    renderer: R,
    outputs_root: PathBuf,
    pause: Duration,
}

impl<R: Renderer> VideoEmitter<R> {
    pub fn new(store: ArtifactStore, renderer: R, outputs_root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            renderer,
            outputs_root: outputs_root.into(),
            pause: Duration::ZERO,
        }
    }

    /// Sleep after every rendered iteration.
    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    fn render_dir(&self, dest: &Path) -> PathBuf {
        let stem = dest
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "render".to_string());
        let stamp = Utc::now().format("%Y-%m-%d_%H-%M-%S%.6f");
        self.outputs_root.join(format!("render-{}-{}", stem, stamp))
    }

    fn locate_video(&self, run_dir: &Path) -> Option<PathBuf> {
        if run_dir.is_dir() {
            return find_rendered_video(run_dir);
        }
        warn!(dir = %run_dir.display(), "render dir missing, falling back to newest output folder");
        let Some(latest) = newest_dir(&self.outputs_root) else {
            warn!(dir = %self.outputs_root.display(), "no output folders found");
            return None;
        };
        find_rendered_video(&latest)
    }
}

impl<R: Renderer> Emitter for VideoEmitter<R> {
    fn store(&self) -> &ArtifactStore {
        &self.store
    }

    fn materialize(
        &mut self,
        index: &TaskRunIndex,
        group: Group,
        checkpoint: &Path,
        dest: &Path,
    ) -> Result<Option<Provenance>> {
        let run_dir = self.render_dir(dest);
        info!(checkpoint = %checkpoint.display(), run_dir = %run_dir.display(), "rendering policy");
        let rendered = self
            .renderer
            .render(&index.config().task_name, checkpoint, &run_dir);
        // Every iteration attempt is followed by the pause, even a failed one.
        if group.iteration().is_some() && !self.pause.is_zero() {
            thread::sleep(self.pause);
        }
        rendered?;
        let Some(video) = self.locate_video(&run_dir) else {
            return Ok(None);
        };
        copy_into_place(&video, dest)?;
        let folder = video.parent().unwrap_or(video.as_path());
        Ok(Some(vec![
            ("Task video folder".to_string(), folder.display().to_string()),
            ("Original video".to_string(), video.display().to_string()),
            ("Checkpoint".to_string(), checkpoint.display().to_string()),
            ("sha256".to_string(), sha256_file(dest)?),
        ]))
    }
}
