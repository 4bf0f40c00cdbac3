use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_yaml::Value;

use crate::error::ConfigError;

/// Hydra writes the resolved config of every run here.
pub const RUN_CONFIG_RELATIVE_PATH: &str = ".hydra/config.yaml";

/// Immutable per-task-root configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub iteration_count: usize,
    pub samples_per_iteration: usize,
    pub eval_count: usize,
    pub task_name: String,
    /// Empty for a human-baseline run, the search suffix otherwise.
    pub suffix: String,
    /// Only used to name artifacts of search runs.
    pub max_iterations_hint: u64,
}

static NULL: Value = Value::Null;

fn lookup<'a>(root: &'a Value, key: &str) -> Option<&'a Value> {
    key.split('.')
        .try_fold(root, |cur, part| cur.get(part))
        .filter(|v| !v.is_null())
}

fn as_count(path: &Path, key: &str, value: &Value) -> Result<usize, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidValue {
        path: path.to_path_buf(),
        key: key.to_string(),
        reason,
    };
    let n = value
        .as_u64()
        .ok_or_else(|| invalid(format!("expected a non-negative integer, found {:?}", value)))?;
    usize::try_from(n).map_err(|_| invalid(format!("{} does not fit in usize", n)))
}

impl RunConfig {
    pub const REQUIRED_KEYS: [&'static str; 4] = ["iteration", "sample", "num_eval", "env.task"];

    /// Loads `<task_root>/.hydra/config.yaml`.
    pub fn load(task_root: &Path) -> Result<Self, ConfigError> {
        let path = task_root.join(RUN_CONFIG_RELATIVE_PATH);
        if !path.is_file() {
            return Err(ConfigError::MissingFile { path });
        }
        let text = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let value: Value = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        Self::from_value(&path, &value)
    }

    /// Builds a config from an already parsed document. Every missing
    /// required key is reported, not just the first.
    pub fn from_value(path: &Path, value: &Value) -> Result<Self, ConfigError> {
        let missing: Vec<String> = Self::REQUIRED_KEYS
            .iter()
            .filter(|key| lookup(value, key).is_none())
            .map(|key| key.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::MissingKeys {
                path: path.to_path_buf(),
                keys: missing,
            });
        }
        // Presence was checked above.
        let required = |key: &str| lookup(value, key).unwrap_or(&NULL);

        let iteration_count = as_count(path, "iteration", required("iteration"))?;
        let samples_per_iteration = as_count(path, "sample", required("sample"))?;
        if samples_per_iteration == 0 {
            return Err(ConfigError::InvalidValue {
                path: path.to_path_buf(),
                key: "sample".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        let eval_count = as_count(path, "num_eval", required("num_eval"))?;
        if iteration_count
            .checked_mul(samples_per_iteration)
            .and_then(|n| n.checked_add(eval_count))
            .is_none()
        {
            return Err(ConfigError::InvalidValue {
                path: path.to_path_buf(),
                key: "iteration".to_string(),
                reason: "folder count overflows".to_string(),
            });
        }
        let task_name = required("env.task")
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigError::InvalidValue {
                path: path.to_path_buf(),
                key: "env.task".to_string(),
                reason: "expected a non-empty string".to_string(),
            })?
            .to_string();
        let suffix = match lookup(value, "suffix") {
            None => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    path: path.to_path_buf(),
                    key: "suffix".to_string(),
                    reason: format!("expected a string, found {:?}", other),
                })
            }
        };
        let max_iterations_hint = lookup(value, "max_iterations")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        Ok(Self {
            iteration_count,
            samples_per_iteration,
            eval_count,
            task_name,
            suffix,
            max_iterations_hint,
        })
    }

    pub fn is_baseline(&self) -> bool {
        self.suffix.is_empty()
    }

    /// Number of folders the trainer creates for this task root.
    pub fn expected_folder_count(&self) -> usize {
        self.iteration_count
            .saturating_mul(self.samples_per_iteration)
            .saturating_add(self.eval_count)
    }

    /// `{task}{suffix}` for baselines, `{task}{suffix}_epoch_{max_iterations}`
    /// for search runs.
    pub fn artifact_prefix(&self) -> String {
        let mut prefix = format!("{}{}", self.task_name, self.suffix);
        if !self.is_baseline() {
            prefix.push_str(&format!("_epoch_{}", self.max_iterations_hint));
        }
        prefix
    }

    pub fn checkpoint_file_name(&self) -> String {
        format!("{}{}.pth", self.task_name, self.suffix)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderOrder {
    #[default]
    Lexical,
    Created,
}

/// What to do with a run whose event log lacks the key metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingMetricPolicy {
    #[default]
    Exclude,
    ScoreZero,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainerSettings {
    pub program: String,
    pub script: String,
    pub extra_args: Vec<String>,
}

impl Default for TrainerSettings {
    fn default() -> Self {
        Self {
            program: "python".to_string(),
            script: "isaacgymenvs/isaacgymenvs/train.py".to_string(),
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RenderSettings {
    pub num_envs: Option<u32>,
    pub force_render: bool,
    pub capture_video_freq: Option<u32>,
    pub capture_video_len: Option<u32>,
    pub pause_between_iterations_ms: u64,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            num_envs: None,
            force_render: false,
            capture_video_freq: None,
            capture_video_len: None,
            pause_between_iterations_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GpuSettings {
    pub query_program: String,
    pub required_mb: u64,
    pub poll_interval_secs: u64,
}

impl Default for GpuSettings {
    fn default() -> Self {
        Self {
            query_program: "nvidia-smi".to_string(),
            required_mb: 8 * 1024,
            poll_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SanitizeSettings {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub host_pattern: String,
    pub host_replacement: String,
    pub skip_top_level: Vec<String>,
}

impl Default for SanitizeSettings {
    fn default() -> Self {
        Self {
            source: PathBuf::from("eureka/outputs"),
            destination: PathBuf::from("eureka_artifacts"),
            host_pattern: "DESKTOP-[A-Z0-9]{7}".to_string(),
            host_replacement: "SERVER".to_string(),
            skip_top_level: vec!["old".to_string()],
        }
    }
}

/// Locations and knobs that every tool shares. Loaded once and passed down.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessSettings {
    pub results_root: PathBuf,
    pub tasks_glob_roots: Vec<PathBuf>,
    pub outputs_root: PathBuf,
    pub trainer: TrainerSettings,
    pub render: RenderSettings,
    pub save_metadata: bool,
    pub folder_order: FolderOrder,
    pub missing_metric: MissingMetricPolicy,
    pub key_metric: String,
    pub gpu: GpuSettings,
    pub sanitize: SanitizeSettings,
    pub ffmpeg_program: String,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        let results_root = PathBuf::from("eureka_artifacts");
        Self {
            tasks_glob_roots: vec![results_root.join("eureka"), results_root.join("human_baseline")],
            results_root,
            outputs_root: PathBuf::from("outputs/train"),
            trainer: TrainerSettings::default(),
            render: RenderSettings::default(),
            save_metadata: false,
            folder_order: FolderOrder::default(),
            missing_metric: MissingMetricPolicy::default(),
            key_metric: "consecutive_successes".to_string(),
            gpu: GpuSettings::default(),
            sanitize: SanitizeSettings::default(),
            ffmpeg_program: "ffmpeg".to_string(),
        }
    }
}

impl HarnessSettings {
    /// Reads settings from `path`, or returns the defaults when no file is
    /// given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.is_file() {
            return Err(ConfigError::MissingFile {
                path: path.to_path_buf(),
            });
        }
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn videos_dir(&self) -> PathBuf {
        self.results_root.join("videos")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.results_root.join("checkpoints")
    }

    pub fn plots_dir(&self) -> PathBuf {
        self.results_root.join("plots")
    }

    pub fn gifs_dir(&self) -> PathBuf {
        self.results_root.join("gifs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Result<RunConfig, ConfigError> {
        let value: Value = serde_yaml::from_str(yaml).expect("yaml");
        RunConfig::from_value(Path::new("/task/.hydra/config.yaml"), &value)
    }

    #[test]
    fn loads_search_run_config() {
        let cfg = parse(
            "iteration: 5\nsample: 2\nnum_eval: 2\nsuffix: GPT\nmax_iterations: 3000\nenv:\n  task: ShadowHand\n",
        )
        .expect("valid config");
        assert_eq!(cfg.iteration_count, 5);
        assert_eq!(cfg.samples_per_iteration, 2);
        assert_eq!(cfg.eval_count, 2);
        assert_eq!(cfg.expected_folder_count(), 12);
        assert!(!cfg.is_baseline());
        assert_eq!(cfg.artifact_prefix(), "ShadowHandGPT_epoch_3000");
        assert_eq!(cfg.checkpoint_file_name(), "ShadowHandGPT.pth");
    }

    #[test]
    fn missing_suffix_means_baseline() {
        let cfg = parse("iteration: 1\nsample: 1\nnum_eval: 5\nenv: {task: Ant}\n").expect("valid");
        assert!(cfg.is_baseline());
        assert_eq!(cfg.artifact_prefix(), "Ant");
        assert_eq!(cfg.max_iterations_hint, 0);
    }

    #[test]
    fn missing_iteration_is_reported() {
        let err = parse("sample: 2\nnum_eval: 2\nenv: {task: Ant}\n").expect_err("must fail");
        match &err {
            ConfigError::MissingKeys { keys, .. } => assert_eq!(keys, &vec!["iteration".to_string()]),
            other => panic!("expected MissingKeys, got {}", other),
        }
    }

    #[test]
    fn every_missing_key_is_reported() {
        let err = parse("env: {}\n").expect_err("must fail");
        let msg = err.to_string();
        for key in RunConfig::REQUIRED_KEYS {
            assert!(msg.contains(key), "missing {} in: {}", key, msg);
        }
    }

    #[test]
    fn zero_samples_is_invalid() {
        let err = parse("iteration: 1\nsample: 0\nnum_eval: 0\nenv: {task: Ant}\n").expect_err("must fail");
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "sample"), "{}", err);
    }

    #[test]
    fn overflowing_folder_count_is_invalid() {
        let err = parse("iteration: 9223372036854775807\nsample: 4\nnum_eval: 1\nenv: {task: Ant}\n")
            .expect_err("must fail");
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "iteration"), "{}", err);
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = RunConfig::load(dir.path()).expect_err("must fail");
        assert!(matches!(err, ConfigError::MissingFile { .. }), "{}", err);
    }

    #[test]
    fn settings_default_when_no_file() {
        let settings = HarnessSettings::load(None).expect("defaults");
        assert_eq!(settings.key_metric, "consecutive_successes");
        assert_eq!(settings.videos_dir(), PathBuf::from("eureka_artifacts/videos"));
        assert_eq!(settings.gpu.required_mb, 8192);
    }

    #[test]
    fn settings_file_overrides_selected_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rlab.yaml");
        fs::write(
            &path,
            "results_root: out\nmissing_metric: score_zero\nfolder_order: created\ntrainer:\n  program: python3\n",
        )
        .expect("write");
        let settings = HarnessSettings::load(Some(&path)).expect("settings");
        assert_eq!(settings.results_root, PathBuf::from("out"));
        assert_eq!(settings.missing_metric, MissingMetricPolicy::ScoreZero);
        assert_eq!(settings.folder_order, FolderOrder::Created);
        assert_eq!(settings.trainer.program, "python3");
        assert_eq!(settings.trainer.script, TrainerSettings::default().script);
    }

    #[test]
    fn settings_reject_unknown_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rlab.yaml");
        fs::write(&path, "result_root: typo\n").expect("write");
        let err = HarnessSettings::load(Some(&path)).expect_err("must fail");
        assert!(matches!(err, ConfigError::Parse { .. }), "{}", err);
    }
}
