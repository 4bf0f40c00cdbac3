use std::fs;
use std::path::{Path, PathBuf};
use std::process::Child;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rlab_events::load_scalars;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{HarnessSettings, RunConfig};
use crate::gpu::{wait_for_free_vram, GpuProbe};
use crate::index::{run_identifier_dir, write_run_tag, Group};
use crate::process::TrainerCommand;
use crate::{atomic_write_json_pretty, ensure_dir};

pub const FINAL_EVAL_FILE: &str = "final_eval.json";
const TENSORBOARD_MARKER: &str = "Tensorboard Directory:";
const TRAINING_MARKER: &str = "fps step:";
const FAILURE_MARKER: &str = "Traceback";

/// Summary of an evaluation campaign, stored as `final_eval.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalEval {
    pub successes: Vec<f64>,
    pub success_mean: Option<f64>,
    pub success_std: Option<f64>,
    #[serde(default)]
    pub correlations: Vec<f64>,
    #[serde(default)]
    pub correlation_mean: Option<f64>,
    #[serde(default)]
    pub correlation_std: Option<f64>,
}

impl FinalEval {
    pub fn new(successes: Vec<f64>, correlations: Vec<f64>) -> Self {
        Self {
            success_mean: mean(&successes),
            success_std: population_std(&successes),
            correlation_mean: mean(&correlations),
            correlation_std: population_std(&correlations),
            successes,
            correlations,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        atomic_write_json_pretty(path, &serde_json::to_value(self)?)
    }
}

pub fn mean(xs: &[f64]) -> Option<f64> {
    (!xs.is_empty()).then(|| xs.iter().sum::<f64>() / xs.len() as f64)
}

/// Standard deviation with divisor `n`.
pub fn population_std(xs: &[f64]) -> Option<f64> {
    let m = mean(xs)?;
    let var = xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / xs.len() as f64;
    Some(var.sqrt())
}

/// Pearson correlation; `None` for mismatched lengths, fewer than two points
/// or a constant series.
pub fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() != b.len() || a.len() < 2 {
        return None;
    }
    let (ma, mb) = (mean(a)?, mean(b)?);
    let mut cov = 0.0;
    let mut va = 0.0;
    let mut vb = 0.0;
    for (x, y) in a.iter().zip(b) {
        cov += (x - ma) * (y - mb);
        va += (x - ma).powi(2);
        vb += (y - mb).powi(2);
    }
    let denom = (va * vb).sqrt();
    (denom > 0.0).then(|| cov / denom)
}

/// Directory printed by the trainer on its `Tensorboard Directory:` line.
pub fn tensorboard_dir(log_text: &str) -> Option<PathBuf> {
    log_text
        .lines()
        .find_map(|line| line.trim_start().strip_prefix(TENSORBOARD_MARKER))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchState {
    Training,
    Failed,
    Exited,
}

pub fn launch_state(log_text: &str) -> Option<LaunchState> {
    if log_text.contains(FAILURE_MARKER) {
        Some(LaunchState::Failed)
    } else if log_text.contains(TRAINING_MARKER) {
        Some(LaunchState::Training)
    } else {
        None
    }
}

/// Trainer logs may carry bytes that are not UTF-8; those are replaced.
fn read_log(path: &Path) -> std::io::Result<String> {
    fs::read(path).map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

/// Waits until the run's log shows that training started or failed, or the
/// process is gone.
pub fn block_until_training(child: &mut Child, log_path: &Path, poll: Duration) -> Result<LaunchState> {
    loop {
        let text = read_log(log_path).unwrap_or_default();
        if let Some(state) = launch_state(&text) {
            return Ok(state);
        }
        if child.try_wait()?.is_some() {
            let text = read_log(log_path).unwrap_or_default();
            return Ok(launch_state(&text).unwrap_or(LaunchState::Exited));
        }
        thread::sleep(poll);
    }
}

struct LaunchedRun {
    seed: usize,
    child: Child,
    log_path: PathBuf,
    run_dir: PathBuf,
}

/// Repeated seeded training runs of one task root, scored after all finish.
pub struct EvalCampaign<'a> {
    settings: &'a HarnessSettings,
    probe: &'a mut dyn GpuProbe,
    launch_poll: Duration,
}

impl<'a> EvalCampaign<'a> {
    pub fn new(settings: &'a HarnessSettings, probe: &'a mut dyn GpuProbe) -> Self {
        Self {
            settings,
            probe,
            launch_poll: Duration::from_secs(1),
        }
    }

    pub fn with_launch_poll(mut self, poll: Duration) -> Self {
        self.launch_poll = poll;
        self
    }

    pub fn run(&mut self, task_root: &Path) -> Result<FinalEval> {
        let config = RunConfig::load(task_root)?;
        info!(root = %task_root.display(), task = %config.task_name, runs = config.eval_count, "starting evaluation");
        let mut launched = Vec::with_capacity(config.eval_count);
        for seed in 0..config.eval_count {
            match self.launch(task_root, &config, seed) {
                Ok(run) => launched.push(run),
                Err(e) => warn!(seed, error = %format!("{:#}", e), "cannot launch evaluation run"),
            }
        }

        let mut successes = Vec::new();
        let mut correlations = Vec::new();
        for mut run in launched {
            match run.child.wait() {
                Ok(status) => info!(seed = run.seed, status = %status, "evaluation run finished"),
                Err(e) => warn!(seed = run.seed, error = %e, "cannot wait for evaluation run"),
            }
            match self.score(&run) {
                Ok(Some((success, correlation))) => {
                    successes.push(success);
                    correlations.extend(correlation);
                }
                Ok(None) => {}
                Err(e) => warn!(seed = run.seed, error = %format!("{:#}", e), "cannot score evaluation run"),
            }
        }

        let summary = FinalEval::new(successes, correlations);
        info!(
            mean = ?summary.success_mean,
            std = ?summary.success_std,
            raw = ?summary.successes,
            "final success"
        );
        summary.save(&task_root.join(FINAL_EVAL_FILE))?;
        Ok(summary)
    }

    fn launch(&mut self, task_root: &Path, config: &RunConfig, seed: usize) -> Result<LaunchedRun> {
        let gpu = &self.settings.gpu;
        let device = wait_for_free_vram(
            &mut *self.probe,
            gpu.required_mb,
            Duration::from_secs(gpu.poll_interval_secs),
        );
        let stamp = Utc::now().format("%Y-%m-%d_%H-%M-%S");
        let run_dir = task_root.join(format!("policy-{}-eval{}", stamp, seed));
        ensure_dir(&run_dir)?;
        write_run_tag(&run_dir, Group::Evaluation)?;

        let log_path = task_root.join(format!("reward_code_eval{}.txt", seed));
        let trainer = &self.settings.trainer;
        let mut child = TrainerCommand::new(trainer)
            .set("hydra.run.dir", run_dir.display())
            .set("task", format!("{}{}", config.task_name, config.suffix))
            .set("headless", "True")
            .set("capture_video", "False")
            .set("force_render", "False")
            .set("seed", seed)
            .extend(trainer.extra_args.iter().cloned())
            .env("CUDA_VISIBLE_DEVICES", device)
            .spawn_logged(&log_path)?;
        match block_until_training(&mut child, &log_path, self.launch_poll)? {
            LaunchState::Training => info!(seed, gpu = device, "evaluation run training"),
            LaunchState::Failed => warn!(seed, log = %log_path.display(), "evaluation run failed at startup"),
            LaunchState::Exited => warn!(seed, log = %log_path.display(), "evaluation run exited before training"),
        }
        Ok(LaunchedRun {
            seed,
            child,
            log_path,
            run_dir,
        })
    }

    fn score(&self, run: &LaunchedRun) -> Result<Option<(f64, Option<f64>)>> {
        let text = read_log(&run.log_path)
            .with_context(|| format!("reading {}", run.log_path.display()))?;
        let summaries = match tensorboard_dir(&text) {
            Some(dir) if dir.is_relative() => run.run_dir.join(dir),
            Some(dir) => dir,
            None => run_identifier_dir(&run.run_dir)?.join("summaries"),
        };
        let metrics = load_scalars(&summaries)?;
        let key = self.settings.key_metric.as_str();
        let Some(success) = metrics.max_of(key) else {
            warn!(seed = run.seed, summaries = %summaries.display(), key, "key metric missing");
            return Ok(None);
        };
        let correlation = match (metrics.get("gt_reward"), metrics.get("gpt_reward")) {
            (Some(gt), Some(gpt)) => pearson(&gt.values, &gpt.values),
            _ => None,
        };
        Ok(Some((success, correlation)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::GpuMemory;

    #[test]
    fn statistics_match_population_definitions() {
        assert_eq!(mean(&[]), None);
        let xs = [0.5, 0.9];
        assert!((mean(&xs).expect("mean") - 0.7).abs() < 1e-12);
        assert!((population_std(&xs).expect("std") - 0.2).abs() < 1e-12);
        let r = pearson(&[1.0, 2.0, 3.0], &[2.0, 4.0, 6.5]).expect("corr");
        assert!(r > 0.99 && r <= 1.0, "r = {}", r);
        assert_eq!(pearson(&[1.0, 1.0], &[2.0, 3.0]), None);
        assert_eq!(pearson(&[1.0], &[2.0]), None);
    }

    #[test]
    fn tensorboard_dir_comes_from_marker_line() {
        let log = "starting\nTensorboard Directory: /runs/Ant-01/summaries\nfps step: 10\n";
        assert_eq!(tensorboard_dir(log), Some(PathBuf::from("/runs/Ant-01/summaries")));
        assert_eq!(tensorboard_dir("nothing here"), None);
        assert_eq!(
            tensorboard_dir("Tensorboard Directory: C:/runs/x\n"),
            Some(PathBuf::from("C:/runs/x"))
        );
    }

    #[test]
    fn launch_state_prefers_failure() {
        assert_eq!(launch_state("fps step: 1\n"), Some(LaunchState::Training));
        assert_eq!(launch_state("fps step: 1\nTraceback (most recent call last)"), Some(LaunchState::Failed));
        assert_eq!(launch_state("loading"), None);
    }

    #[test]
    fn final_eval_round_trips_through_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(FINAL_EVAL_FILE);
        FinalEval::new(vec![0.5, 0.9], Vec::new()).save(&path).expect("save");
        let loaded = FinalEval::load(&path).expect("load");
        assert_eq!(loaded.successes, vec![0.5, 0.9]);
        assert_eq!(loaded.correlation_mean, None);
    }

    struct FixedProbe;

    impl GpuProbe for FixedProbe {
        fn query(&mut self) -> Result<Vec<GpuMemory>> {
            Ok(vec![
                GpuMemory { index: 0, free_mb: 100 },
                GpuMemory { index: 1, free_mb: 20_000 },
            ])
        }
    }

    /// A task root with `num_eval: 2` and a shell trainer that prints
    /// `preamble`, then the summaries dir of its seed and a training line.
    #[cfg(unix)]
    fn fake_campaign(dir: &Path, preamble: &str) -> (PathBuf, HarnessSettings) {
        use crate::config::TrainerSettings;
        use crate::test_support::write_run_config;
        use rlab_events::writer::EventWriter;

        let root = dir.join("baseline");
        write_run_config(&root, "iteration: 1\nsample: 1\nnum_eval: 2\nenv: {task: Ant}\n");
        let fixtures = dir.join("fixtures");
        for (seed, value) in [(0, 0.5_f32), (1, 0.9_f32)] {
            let mut writer = EventWriter::create(&fixtures.join(format!("seed{}", seed)), "host").expect("writer");
            writer.write_scalar("consecutive_successes", 1, value / 2.0).expect("write");
            writer.write_scalar("consecutive_successes", 2, value).expect("write");
            writer.flush().expect("flush");
        }
        let script = dir.join("fake_train.sh");
        fs::write(
            &script,
            format!(
                "for a in \"$@\"; do case \"$a\" in seed=*) s=\"${{a#seed=}}\";; esac; done\n\
                 {}\n\
                 echo \"gpu=$CUDA_VISIBLE_DEVICES\"\n\
                 echo \"Tensorboard Directory: {}/seed$s\"\n\
                 echo \"fps step: 100\"\n",
                preamble,
                fixtures.display()
            ),
        )
        .expect("script");

        let settings = HarnessSettings {
            trainer: TrainerSettings {
                program: "sh".to_string(),
                script: script.display().to_string(),
                extra_args: Vec::new(),
            },
            ..HarnessSettings::default()
        };
        (root, settings)
    }

    #[cfg(unix)]
    #[test]
    fn campaign_scores_every_seed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (root, settings) = fake_campaign(dir.path(), "true");
        let mut probe = FixedProbe;
        let summary = EvalCampaign::new(&settings, &mut probe)
            .with_launch_poll(Duration::from_millis(20))
            .run(&root)
            .expect("campaign");

        assert_eq!(summary.successes.len(), 2);
        assert!((summary.successes[0] - 0.5).abs() < 1e-6, "{:?}", summary.successes);
        assert!((summary.successes[1] - 0.9).abs() < 1e-6, "{:?}", summary.successes);
        assert!(root.join(FINAL_EVAL_FILE).is_file());
        let log = fs::read_to_string(root.join("reward_code_eval1.txt")).expect("log");
        assert!(log.contains("gpu=1"), "log was: {}", log);
        let tagged = fs::read_dir(&root)
            .expect("list")
            .filter_map(|e| e.ok())
            .filter(|e| e.path().join(crate::index::RUN_TAG_FILE).is_file())
            .count();
        assert_eq!(tagged, 2);
    }

    #[cfg(unix)]
    #[test]
    fn failed_launch_still_scores_the_other_seeds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (root, settings) = fake_campaign(dir.path(), "true");
        // The log of seed 1 cannot be created as a file.
        fs::create_dir_all(root.join("reward_code_eval1.txt")).expect("block log");
        let mut probe = FixedProbe;
        let summary = EvalCampaign::new(&settings, &mut probe)
            .with_launch_poll(Duration::from_millis(20))
            .run(&root)
            .expect("campaign");

        assert_eq!(summary.successes.len(), 1, "{:?}", summary.successes);
        assert!((summary.successes[0] - 0.5).abs() < 1e-6);
        let saved = FinalEval::load(&root.join(FINAL_EVAL_FILE)).expect("final eval");
        assert_eq!(saved, summary);
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_trainer_output_is_still_scored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (root, settings) = fake_campaign(dir.path(), "printf 'progress \\377\\n'");
        let mut probe = FixedProbe;
        let summary = EvalCampaign::new(&settings, &mut probe)
            .with_launch_poll(Duration::from_millis(20))
            .run(&root)
            .expect("campaign");

        assert_eq!(summary.successes.len(), 2, "{:?}", summary.successes);
        let raw = fs::read(root.join("reward_code_eval0.txt")).expect("log");
        assert!(raw.contains(&0xff), "log should carry the raw byte");
    }
}
