//! Numbers behind the progress and comparison charts, and the plain-text
//! results summary.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use regex::Regex;
use rlab_events::ScalarSeries;
use serde::Serialize;
use tracing::{info, warn};

use crate::atomic_write_json_pretty;
use crate::evaluate::{mean, FinalEval, FINAL_EVAL_FILE};
use crate::index::{Group, ScoredPolicy, TaskRunIndex};

/// Value recorded for an iteration without any scored policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressFill {
    Zero,
    CarryForward,
}

/// Best score of every iteration, in order.
pub fn training_progress(index: &TaskRunIndex, fill: ProgressFill) -> Vec<f64> {
    let mut progress: Vec<f64> = Vec::with_capacity(index.config().iteration_count);
    for n in 0..index.config().iteration_count {
        let policies = index.iteration_policies(Group::Iteration(n));
        let value = match crate::select::best_policy(&policies) {
            Some(best) => best.score,
            None => {
                let value = match fill {
                    ProgressFill::Zero => 0.0,
                    ProgressFill::CarryForward => progress.last().copied().unwrap_or(0.0),
                };
                warn!(root = %index.root().display(), iteration = n, value, "no valid policies for iteration");
                value
            }
        };
        progress.push(value);
    }
    progress
}

/// Mean score over a group, `None` when empty.
pub fn group_mean(policies: &[ScoredPolicy]) -> Option<f64> {
    mean(&policies.iter().map(|p| p.score).collect::<Vec<_>>())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesPoints {
    pub steps: Vec<i64>,
    pub values: Vec<f64>,
}

impl From<&ScalarSeries> for SeriesPoints {
    fn from(series: &ScalarSeries) -> Self {
        Self {
            steps: series.steps.clone(),
            values: series.values.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskPerformance {
    pub task: String,
    pub prefix: String,
    pub root: PathBuf,
    pub key_metric: String,
    pub progress: Vec<f64>,
    pub best_eval: Option<SeriesPoints>,
}

pub fn task_performance(index: &TaskRunIndex) -> TaskPerformance {
    let key = index.options().key_metric.clone();
    let progress = training_progress(index, ProgressFill::Zero);
    let best_eval = index
        .best_policy(Group::Evaluation)
        .and_then(|best| best.metrics.get(&key).map(SeriesPoints::from));
    if best_eval.is_none() {
        warn!(root = %index.root().display(), "no valid evaluation runs found");
    }
    TaskPerformance {
        task: index.config().task_name.clone(),
        prefix: format!("{}{}", index.config().task_name, index.config().suffix),
        root: index.root().to_path_buf(),
        key_metric: key,
        progress,
        best_eval,
    }
}

/// Writes `{plots}/{task}{suffix}_performance.json` unless there is nothing
/// to chart.
pub fn write_performance(index: &TaskRunIndex, plots_dir: &Path) -> Result<Option<PathBuf>> {
    let report = task_performance(index);
    if report.progress.is_empty() && report.best_eval.is_none() {
        info!(root = %index.root().display(), "nothing to report");
        return Ok(None);
    }
    let path = plots_dir.join(format!("{}_performance.json", report.prefix));
    atomic_write_json_pretty(&path, &serde_json::to_value(&report)?)?;
    info!(path = %path.display(), "saved performance report");
    Ok(Some(path))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Human,
    Default,
    Epochs3000,
}

impl RunKind {
    /// Roots under a `human_baseline` directory, or without a search
    /// suffix, are human baselines.
    pub fn of(index: &TaskRunIndex) -> Self {
        let under_baseline = index
            .root()
            .components()
            .any(|c| c.as_os_str() == "human_baseline");
        if under_baseline || index.config().is_baseline() {
            RunKind::Human
        } else if index.config().max_iterations_hint == 3000 {
            RunKind::Epochs3000
        } else {
            RunKind::Default
        }
    }

    fn label(&self) -> &'static str {
        match self {
            RunKind::Human => "Human",
            RunKind::Default => "Default training epochs",
            RunKind::Epochs3000 => "3000 training epochs",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunComparison {
    pub kind: RunKind,
    pub label: String,
    pub root: PathBuf,
    pub eval_mean: Option<f64>,
    /// `eval_mean / human_mean`.
    pub ratio: Option<f64>,
    pub progress: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskComparison {
    pub task: String,
    pub human_mean: f64,
    pub human_roots: Vec<PathBuf>,
    pub runs: Vec<RunComparison>,
}

#[derive(Default)]
struct TaskRuns<'a> {
    human: Vec<&'a TaskRunIndex>,
    default: Option<&'a TaskRunIndex>,
    epochs_3000: Option<&'a TaskRunIndex>,
}

/// Groups task roots by task name and compares search runs against the
/// human baseline. Tasks without usable baseline data are skipped.
pub fn compare_tasks(indices: &[TaskRunIndex]) -> Vec<TaskComparison> {
    let mut by_task: BTreeMap<String, TaskRuns> = BTreeMap::new();
    for index in indices {
        let runs = by_task.entry(index.config().task_name.clone()).or_default();
        let slot = match RunKind::of(index) {
            RunKind::Human => {
                runs.human.push(index);
                continue;
            }
            RunKind::Default => &mut runs.default,
            RunKind::Epochs3000 => &mut runs.epochs_3000,
        };
        if let Some(previous) = slot.replace(index) {
            warn!(
                replaced = %previous.root().display(),
                root = %index.root().display(),
                "several search runs of the same kind, keeping the last"
            );
        }
    }

    let mut comparisons = Vec::new();
    for (task, runs) in by_task {
        let human_means: Vec<f64> = runs
            .human
            .iter()
            .filter_map(|index| group_mean(&index.iteration_policies(Group::Evaluation)))
            .collect();
        let Some(human_mean) = mean(&human_means) else {
            warn!(task = %task, "no human baseline data");
            continue;
        };
        let searches = [
            (RunKind::Default, runs.default),
            (RunKind::Epochs3000, runs.epochs_3000),
        ];
        let runs_out = searches
            .into_iter()
            .filter_map(|(kind, index)| index.map(|index| (kind, index)))
            .map(|(kind, index)| {
                let eval_mean = group_mean(&index.iteration_policies(Group::Evaluation));
                RunComparison {
                    kind,
                    label: kind.label().to_string(),
                    root: index.root().to_path_buf(),
                    eval_mean,
                    ratio: eval_mean.filter(|_| human_mean != 0.0).map(|m| m / human_mean),
                    progress: training_progress(index, ProgressFill::CarryForward),
                }
            })
            .collect();
        comparisons.push(TaskComparison {
            task,
            human_mean,
            human_roots: runs.human.iter().map(|i| i.root().to_path_buf()).collect(),
            runs: runs_out,
        });
    }
    comparisons
}

/// Writes one `{plots}/{task}_comparison.json` per comparison.
pub fn write_comparisons(comparisons: &[TaskComparison], plots_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    for comparison in comparisons {
        let path = plots_dir.join(format!("{}_comparison.json", comparison.task));
        atomic_write_json_pretty(&path, &serde_json::to_value(comparison)?)?;
        info!(path = %path.display(), "saved comparison report");
        written.push(path);
    }
    Ok(written)
}

pub const RESULT_GROUPS: [&str; 2] = ["eureka", "human_baseline"];

#[derive(Debug, Clone, PartialEq)]
pub struct FolderResults {
    pub label: String,
    pub max_training_success: Option<f64>,
    pub final_eval: Option<FinalEval>,
}

impl FolderResults {
    fn is_empty(&self) -> bool {
        self.max_training_success.is_none() && self.final_eval.is_none()
    }
}

pub fn max_training_success(log_text: &str) -> Option<f64> {
    let re = Regex::new(r"Max Training Success ([\d.-]+)").ok()?;
    re.captures(log_text)?.get(1)?.as_str().parse().ok()
}

fn analyze_folder(label: String, folder: &Path) -> FolderResults {
    let final_path = folder.join(FINAL_EVAL_FILE);
    let final_eval = if final_path.is_file() {
        FinalEval::load(&final_path)
            .map_err(|e| warn!(folder = %folder.display(), error = %format!("{:#}", e), "cannot load final evaluation"))
            .ok()
    } else {
        None
    };
    let max_training_success = fs::read_to_string(folder.join("eureka.log"))
        .ok()
        .and_then(|text| max_training_success(&text));
    FolderResults {
        label,
        max_training_success,
        final_eval,
    }
}

/// Results of every run folder under `{results_root}/{eureka,human_baseline}`,
/// grouped and sorted by folder name. Folders without any result are left
/// out.
pub fn collect_results(results_root: &Path) -> Vec<(String, Vec<FolderResults>)> {
    let mut sections = Vec::new();
    for group in RESULT_GROUPS {
        let dir = results_root.join(group);
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        let mut folders: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        folders.sort();
        let results = folders
            .iter()
            .filter_map(|folder| {
                let name = folder.file_name()?.to_string_lossy().to_string();
                let results = analyze_folder(format!("{}/{}", group, name), folder);
                (!results.is_empty()).then_some(results)
            })
            .collect();
        sections.push((group.to_string(), results));
    }
    sections
}

fn mean_pm_std(mean: Option<f64>, std: Option<f64>) -> Option<String> {
    Some(format!("{:.2} ± {:.2}", mean?, std?))
}

pub fn render_results(sections: &[(String, Vec<FolderResults>)]) -> String {
    let mut out = String::new();
    for (group, folders) in sections {
        out.push_str(&format!("\n=== {} RESULTS ===\n", group.to_uppercase()));
        for folder in folders {
            out.push_str(&format!("\nFolder: {}\n", folder.label));
            if let Some(v) = folder.max_training_success {
                out.push_str(&format!("Max Training Success: {:.2}\n", v));
            }
            if let Some(eval) = &folder.final_eval {
                if let Some(s) = mean_pm_std(eval.success_mean, eval.success_std) {
                    out.push_str(&format!("Final Success: {}\n", s));
                }
                if let Some(s) = mean_pm_std(eval.correlation_mean, eval.correlation_std) {
                    out.push_str(&format!("Final Correlation: {}\n", s));
                }
            }
        }
    }
    out
}
