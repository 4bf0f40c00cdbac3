use std::fmt;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{anyhow, Context, Result};
use rlab_events::{load_scalars, MetricSeries};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{FolderOrder, HarnessSettings, MissingMetricPolicy, RunConfig};
use crate::error::ConfigError;
use crate::{atomic_write_bytes, select};

pub const POLICY_FOLDER_PREFIX: &str = "policy-";
pub const RUN_TAG_FILE: &str = "run_tag.json";

/// One outer-loop iteration or the final evaluation phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Group {
    Iteration(usize),
    Evaluation,
}

impl Group {
    pub fn iteration(&self) -> Option<usize> {
        match self {
            Group::Iteration(n) => Some(*n),
            Group::Evaluation => None,
        }
    }
}

impl From<Option<usize>> for Group {
    fn from(value: Option<usize>) -> Self {
        value.map(Group::Iteration).unwrap_or(Group::Evaluation)
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Group::Iteration(n) => write!(f, "iteration {}", n),
            Group::Evaluation => f.write_str("evaluation"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunRole {
    #[default]
    Train,
    Eval,
}

/// Group membership recorded next to a run when it is launched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTag {
    #[serde(default)]
    pub role: RunRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<usize>,
}

impl RunTag {
    pub fn for_group(group: Group) -> Self {
        match group {
            Group::Iteration(n) => Self {
                role: RunRole::Train,
                iteration: Some(n),
            },
            Group::Evaluation => Self {
                role: RunRole::Eval,
                iteration: None,
            },
        }
    }

    pub fn group(&self) -> Option<Group> {
        match (self.role, self.iteration) {
            (RunRole::Eval, _) => Some(Group::Evaluation),
            (RunRole::Train, Some(n)) => Some(Group::Iteration(n)),
            (RunRole::Train, None) => None,
        }
    }
}

pub fn write_run_tag(policy_folder: &Path, group: Group) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(&RunTag::for_group(group))?;
    atomic_write_bytes(&policy_folder.join(RUN_TAG_FILE), &bytes)
}

fn read_run_tag(policy_folder: &Path) -> Option<RunTag> {
    let path = policy_folder.join(RUN_TAG_FILE);
    let bytes = fs::read(&path).ok()?;
    match serde_json::from_slice::<RunTag>(&bytes) {
        Ok(tag) if tag.group().is_some() => Some(tag),
        Ok(_) => {
            warn!(path = %path.display(), "run tag has no iteration for a training run, ignoring");
            None
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable run tag, ignoring");
            None
        }
    }
}

/// A `policy-*` directory written by one trainer invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyRunFolder {
    pub path: PathBuf,
    pub name: String,
    pub tag: Option<RunTag>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPolicy {
    /// Maximum ever recorded for the key metric.
    pub score: f64,
    pub folder: PathBuf,
    pub metrics: MetricSeries,
}

/// How folders are ordered and scored. Taken from [`HarnessSettings`].
#[derive(Debug, Clone, PartialEq)]
pub struct IndexOptions {
    pub folder_order: FolderOrder,
    pub missing_metric: MissingMetricPolicy,
    pub key_metric: String,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self::from(&HarnessSettings::default())
    }
}

impl From<&HarnessSettings> for IndexOptions {
    fn from(settings: &HarnessSettings) -> Self {
        Self {
            folder_order: settings.folder_order,
            missing_metric: settings.missing_metric,
            key_metric: settings.key_metric.clone(),
        }
    }
}

/// Folder range of `group` for positional grouping, clamped to `available`.
///
/// The first `iteration_count * samples_per_iteration` folders are the
/// training runs in chunks of `samples_per_iteration`; the next `eval_count`
/// are the evaluation runs.
pub fn positional_range(config: &RunConfig, group: Group, available: usize) -> Range<usize> {
    let (start, len) = match group {
        Group::Iteration(n) => (n.saturating_mul(config.samples_per_iteration), config.samples_per_iteration),
        Group::Evaluation => (
            config.iteration_count.saturating_mul(config.samples_per_iteration),
            config.eval_count,
        ),
    };
    let start = start.min(available);
    let end = start.saturating_add(len).min(available);
    start..end
}

/// The single run-identifier directory under `<folder>/runs/`.
pub fn run_identifier_dir(policy_folder: &Path) -> Result<PathBuf> {
    let runs = policy_folder.join("runs");
    let mut dirs: Vec<PathBuf> = fs::read_dir(&runs)
        .with_context(|| format!("no runs directory in {}", policy_folder.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    if dirs.len() > 1 {
        debug!(runs = %runs.display(), count = dirs.len(), "several run identifiers, using the first");
    }
    dirs.into_iter()
        .next()
        .ok_or_else(|| anyhow!("no run identifier found in {}", runs.display()))
}

fn folder_time(path: &Path, order: FolderOrder) -> Option<SystemTime> {
    let meta = fs::metadata(path).ok()?;
    match order {
        FolderOrder::Lexical => None,
        FolderOrder::Created => meta.created().or_else(|_| meta.modified()).ok(),
    }
}

fn sort_folders(folders: &mut [PolicyRunFolder], order: FolderOrder) {
    folders.sort_by(|a, b| a.name.cmp(&b.name));
    if order == FolderOrder::Lexical {
        return;
    }
    let times: Option<Vec<SystemTime>> = folders.iter().map(|f| folder_time(&f.path, order)).collect();
    match times {
        Some(times) => {
            let mut keyed: Vec<(SystemTime, PolicyRunFolder)> =
                times.into_iter().zip(folders.iter().cloned()).collect();
            keyed.sort_by_key(|(t, _)| *t);
            for (slot, (_, folder)) in folders.iter_mut().zip(keyed) {
                *slot = folder;
            }
        }
        None => warn!("folder timestamps unavailable, falling back to name order"),
    }
}

/// Index over the policy runs of one task root.
#[derive(Debug, Clone)]
pub struct TaskRunIndex {
    root: PathBuf,
    config: RunConfig,
    results_name: String,
    options: IndexOptions,
}

impl TaskRunIndex {
    /// Fails only when the task root's configuration is missing or
    /// incomplete.
    pub fn open(root: &Path, options: IndexOptions) -> Result<Self, ConfigError> {
        let config = RunConfig::load(root)?;
        Ok(Self::with_config(root, config, options))
    }

    pub fn with_config(root: &Path, config: RunConfig, options: IndexOptions) -> Self {
        let results_name = root
            .components()
            .next_back()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .unwrap_or_default();
        Self {
            root: root.to_path_buf(),
            config,
            results_name,
            options,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Base name of the task root.
    pub fn results_name(&self) -> &str {
        &self.results_name
    }

    pub fn options(&self) -> &IndexOptions {
        &self.options
    }

    /// Every `policy-*` folder, in trainer invocation order.
    pub fn policy_folders(&self) -> Vec<PolicyRunFolder> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(root = %self.root.display(), error = %e, "cannot list task root");
                return Vec::new();
            }
        };
        let mut folders: Vec<PolicyRunFolder> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                let path = e.path();
                (name.starts_with(POLICY_FOLDER_PREFIX) && path.is_dir()).then(|| PolicyRunFolder {
                    tag: read_run_tag(&path),
                    path,
                    name,
                })
            })
            .collect();
        sort_folders(&mut folders, self.options.folder_order);
        folders
    }

    /// Members of `group` among `folders`.
    ///
    /// When every folder carries a run tag the tags decide; otherwise the
    /// folders are sliced positionally and the slice size is checked against
    /// the configuration.
    pub fn group_folders<'a>(&self, folders: &'a [PolicyRunFolder], group: Group) -> Vec<&'a PolicyRunFolder> {
        let expected = match group {
            Group::Iteration(_) => self.config.samples_per_iteration,
            Group::Evaluation => self.config.eval_count,
        };
        let all_tagged = !folders.is_empty() && folders.iter().all(|f| f.tag.is_some());
        let members: Vec<&PolicyRunFolder> = if all_tagged {
            folders
                .iter()
                .filter(|f| f.tag.as_ref().and_then(RunTag::group) == Some(group))
                .collect()
        } else {
            if folders.len() > self.config.expected_folder_count() {
                warn!(
                    root = %self.root.display(),
                    found = folders.len(),
                    expected = self.config.expected_folder_count(),
                    "more policy folders than the config accounts for; positional groups may be shifted"
                );
            }
            folders[positional_range(&self.config, group, folders.len())]
                .iter()
                .collect()
        };
        if members.len() != expected {
            warn!(
                root = %self.root.display(),
                %group,
                found = members.len(),
                expected,
                "group size differs from config"
            );
        }
        members
    }

    /// Scored members of `group`. Folders that cannot be scored are skipped
    /// with a warning; an empty result is not an error.
    pub fn iteration_policies(&self, group: Group) -> Vec<ScoredPolicy> {
        if let Group::Iteration(n) = group {
            if n >= self.config.iteration_count {
                warn!(root = %self.root.display(), iteration = n, "iteration out of range");
            }
        }
        let folders = self.policy_folders();
        if folders.is_empty() {
            warn!(root = %self.root.display(), "no policy folders found");
            return Vec::new();
        }
        let mut policies = Vec::new();
        for folder in self.group_folders(&folders, group) {
            match self.score_folder(&folder.path) {
                Ok(Some(policy)) => policies.push(policy),
                Ok(None) => {}
                Err(e) => warn!(folder = %folder.path.display(), error = %format!("{:#}", e), "skipping policy folder"),
            }
        }
        if policies.is_empty() {
            warn!(root = %self.root.display(), %group, "no valid policies");
        }
        policies
    }

    fn score_folder(&self, folder: &Path) -> Result<Option<ScoredPolicy>> {
        let run_dir = run_identifier_dir(folder)?;
        let summaries = run_dir.join("summaries");
        let metrics = load_scalars(&summaries)
            .with_context(|| format!("loading event log {}", summaries.display()))?;
        let key = self.options.key_metric.as_str();
        let score = match (metrics.max_of(key), self.options.missing_metric) {
            (Some(score), _) => score,
            (None, MissingMetricPolicy::ScoreZero) => {
                warn!(summaries = %summaries.display(), key, "key metric missing, scoring as zero");
                0.0
            }
            (None, MissingMetricPolicy::Exclude) => {
                warn!(summaries = %summaries.display(), key, "key metric missing, excluding run");
                return Ok(None);
            }
        };
        Ok(Some(ScoredPolicy {
            score,
            folder: folder.to_path_buf(),
            metrics,
        }))
    }

    /// Best member of `group`, if any member could be scored.
    pub fn best_policy(&self, group: Group) -> Option<ScoredPolicy> {
        let policies = self.iteration_policies(group);
        select::best_policy(&policies).cloned()
    }

    /// `<folder>/runs/<id>/nn/{task}{suffix}.pth`, if it exists.
    pub fn checkpoint_path(&self, policy_folder: &Path) -> Option<PathBuf> {
        let run_dir = match run_identifier_dir(policy_folder) {
            Ok(dir) => dir,
            Err(e) => {
                warn!(folder = %policy_folder.display(), error = %e, "cannot resolve checkpoint");
                return None;
            }
        };
        let checkpoint = run_dir.join("nn").join(self.config.checkpoint_file_name());
        if !checkpoint.is_file() {
            warn!(checkpoint = %checkpoint.display(), "checkpoint not found");
            return None;
        }
        Some(checkpoint)
    }
}
