//! Scalar extraction from tensorboard event logs.
//!
//! A trainer's `summaries/` directory holds one or more
//! `events.out.tfevents.*` files. [`load_scalars`] reads every scalar written
//! so far into a [`MetricSeries`]: one [`ScalarSeries`] of paired values and
//! steps per tag.

mod proto;
mod record;
pub mod writer;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use prost::Message;
use tracing::debug;

pub use proto::{Event, Summary, SummaryValue};

#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    #[error("cannot read event log {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed event record in {}: {source}", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: prost::DecodeError,
    },
}

/// Values of one tag with the step each was logged at, ordered by step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScalarSeries {
    pub values: Vec<f64>,
    pub steps: Vec<i64>,
}

impl ScalarSeries {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Largest value ever recorded, ignoring NaNs.
    pub fn max_value(&self) -> Option<f64> {
        self.values
            .iter()
            .copied()
            .filter(|v| !v.is_nan())
            .fold(None, |acc, v| match acc {
                Some(best) if best >= v => Some(best),
                _ => Some(v),
            })
    }

    pub fn last(&self) -> Option<(i64, f64)> {
        Some((*self.steps.last()?, *self.values.last()?))
    }

    fn sort_by_step(&mut self) {
        if self.steps.windows(2).all(|w| w[0] <= w[1]) {
            return;
        }
        let mut points: Vec<(i64, f64)> = self
            .steps
            .iter()
            .copied()
            .zip(self.values.iter().copied())
            .collect();
        points.sort_by_key(|(step, _)| *step);
        self.steps = points.iter().map(|(s, _)| *s).collect();
        self.values = points.iter().map(|(_, v)| *v).collect();
    }
}

/// All scalar series of one event-log directory, keyed by tag.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricSeries {
    series: BTreeMap<String, ScalarSeries>,
}

impl MetricSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tag: &str) -> Option<&ScalarSeries> {
        self.series.get(tag)
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.series.contains_key(tag)
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ScalarSeries)> {
        self.series.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn push(&mut self, tag: &str, step: i64, value: f64) {
        let entry = self.series.entry(tag.to_string()).or_default();
        entry.steps.push(step);
        entry.values.push(value);
    }

    pub fn insert(&mut self, tag: impl Into<String>, series: ScalarSeries) {
        self.series.insert(tag.into(), series);
    }

    /// Maximum recorded value of `tag`, `None` when the tag never appeared.
    pub fn max_of(&self, tag: &str) -> Option<f64> {
        self.get(tag).and_then(ScalarSeries::max_value)
    }

    fn absorb(&mut self, event: &Event) {
        let Some(summary) = &event.summary else {
            return;
        };
        for value in &summary.value {
            if let Some(v) = value.scalar() {
                self.push(&value.tag, event.step, v);
            }
        }
    }
}

/// Event files of a log directory, in name order.
pub fn event_files(dir: &Path) -> Result<Vec<PathBuf>, EventLogError> {
    let entries = fs::read_dir(dir).map_err(|source| EventLogError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| EventLogError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let is_event_file = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.contains("tfevents"))
            .unwrap_or(false);
        if is_event_file && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Decodes every complete event in one file.
pub fn read_event_file(path: &Path) -> Result<Vec<Event>, EventLogError> {
    let bytes = fs::read(path).map_err(|source| EventLogError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    record::split_records(&bytes, path)
        .into_iter()
        .map(|data| {
            Event::decode(data).map_err(|source| EventLogError::Decode {
                path: path.to_path_buf(),
                source,
            })
        })
        .collect()
}

/// Loads every scalar written to `dir` so far.
///
/// An existing directory without event files, or whose files hold no scalar
/// summaries, yields an empty [`MetricSeries`].
pub fn load_scalars(dir: &Path) -> Result<MetricSeries, EventLogError> {
    let mut metrics = MetricSeries::new();
    for file in event_files(dir)? {
        let events = read_event_file(&file)?;
        debug!(path = %file.display(), events = events.len(), "read event file");
        for event in &events {
            metrics.absorb(event);
        }
    }
    for series in metrics.series.values_mut() {
        series.sort_by_step();
    }
    Ok(metrics)
}
