use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::SystemTime;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::{RenderSettings, TrainerSettings};

/// Command line of one trainer invocation. Arguments after the script are
/// hydra-style `key=value` overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainerCommand {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl TrainerCommand {
    pub fn new(trainer: &TrainerSettings) -> Self {
        let mut args = Vec::new();
        if !trainer.script.is_empty() {
            args.push(trainer.script.clone());
        }
        Self {
            program: trainer.program.clone(),
            args,
            env: Vec::new(),
        }
    }

    /// Replay of a trained checkpoint with video capture.
    pub fn replay(
        trainer: &TrainerSettings,
        render: &RenderSettings,
        task_name: &str,
        checkpoint: &Path,
        run_dir: &Path,
    ) -> Self {
        let mut cmd = Self::new(trainer)
            .set("test", "True")
            .set("headless", "False")
            .set("task", task_name)
            .set("checkpoint", checkpoint.display())
            .set("capture_video", "True");
        if let Some(n) = render.num_envs {
            cmd = cmd.set("num_envs", n);
        }
        if render.force_render {
            cmd = cmd.set("force_render", "True");
        }
        if let Some(freq) = render.capture_video_freq {
            cmd = cmd.set("capture_video_freq", freq);
        }
        if let Some(len) = render.capture_video_len {
            cmd = cmd.set("capture_video_len", len);
        }
        cmd.set("hydra.run.dir", run_dir.display())
            .extend(trainer.extra_args.iter().cloned())
    }

    pub fn set(mut self, key: &str, value: impl std::fmt::Display) -> Self {
        self.args.push(format!("{}={}", key, value));
        self
    }

    pub fn extend(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.args.extend(args);
        self
    }

    pub fn env(mut self, key: &str, value: impl std::fmt::Display) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        cmd
    }

    /// Shell-quoted form for logs.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        shell_join(&parts)
    }

    /// Runs to completion with inherited stdio. The exit status is logged,
    /// not interpreted.
    pub fn run_blocking(&self) -> Result<Option<i32>> {
        info!(command = %self.display(), "running trainer");
        let status = self
            .to_command()
            .status()
            .with_context(|| format!("failed to launch {}", self.program))?;
        if !status.success() {
            warn!(command = %self.display(), status = %status, "trainer exited unsuccessfully");
        }
        Ok(status.code())
    }

    /// Starts without waiting, stdout and stderr appended to `log_path`.
    pub fn spawn_logged(&self, log_path: &Path) -> Result<Child> {
        let log = fs::File::create(log_path)
            .with_context(|| format!("creating log {}", log_path.display()))?;
        let err_log = log.try_clone()?;
        info!(command = %self.display(), log = %log_path.display(), "launching trainer");
        let mut cmd = self.to_command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(err_log));
        cmd.spawn()
            .with_context(|| format!("failed to launch {}", self.program))
    }
}

fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

/// Replays a checkpoint and leaves a rendered video somewhere under
/// `run_dir`.
pub trait Renderer {
    /// Blocks until the render has finished.
    fn render(&mut self, task_name: &str, checkpoint: &Path, run_dir: &Path) -> Result<()>;
}

/// Renders by running the trainer in test mode.
pub struct TrainerRenderer {
    trainer: TrainerSettings,
    render: RenderSettings,
}

impl TrainerRenderer {
    pub fn new(trainer: TrainerSettings, render: RenderSettings) -> Self {
        Self { trainer, render }
    }
}

impl Renderer for TrainerRenderer {
    fn render(&mut self, task_name: &str, checkpoint: &Path, run_dir: &Path) -> Result<()> {
        TrainerCommand::replay(&self.trainer, &self.render, task_name, checkpoint, run_dir)
            .run_blocking()
            .map(|_| ())
    }
}

fn created_or_modified(path: &Path) -> Option<SystemTime> {
    let meta = fs::metadata(path).ok()?;
    meta.created().or_else(|_| meta.modified()).ok()
}

/// Most recently created subdirectory of `parent`. Ties go to the later
/// name.
pub fn newest_dir(parent: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(parent).ok()?;
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .filter_map(|p| created_or_modified(&p).map(|t| (t, p)))
        .max_by(|(ta, pa), (tb, pb)| ta.cmp(tb).then_with(|| pa.cmp(pb)))
        .map(|(_, p)| p)
}

/// Files in `dir` with extension `ext` (no dot), sorted by name.
pub fn files_with_extension(dir: &Path, ext: &str) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().and_then(|e| e.to_str()) == Some(ext))
        .collect();
    files.sort();
    files
}

/// The video written by a replay into `output_dir`:
/// `output_dir/videos/<newest>/<first>.mp4`.
pub fn find_rendered_video(output_dir: &Path) -> Option<PathBuf> {
    let videos = output_dir.join("videos");
    if !videos.is_dir() {
        warn!(dir = %videos.display(), "videos directory not found");
        return None;
    }
    let Some(latest) = newest_dir(&videos) else {
        warn!(dir = %videos.display(), "no task video folders found");
        return None;
    };
    info!(folder = %latest.display(), "found task video folder");
    let video = files_with_extension(&latest, "mp4").into_iter().next();
    if video.is_none() {
        warn!(folder = %latest.display(), "no mp4 files found");
    }
    video
}
