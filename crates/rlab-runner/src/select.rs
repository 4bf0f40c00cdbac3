use std::path::Path;

use rlab_events::MetricSeries;

use crate::index::ScoredPolicy;

/// Index of the first element with the largest key.
///
/// Ties keep the earlier element. NaN keys lose to any number and only win
/// when every key is NaN.
pub fn argmax_by<T>(items: &[T], key: impl Fn(&T) -> f64) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (idx, item) in items.iter().enumerate() {
        let score = key(item);
        let replace = match best {
            None => true,
            Some((_, current)) if current.is_nan() => !score.is_nan(),
            Some((_, current)) => score > current,
        };
        if replace {
            best = Some((idx, score));
        }
    }
    best.map(|(idx, _)| idx)
}

/// Highest-scoring policy of a group, `None` for an empty group.
pub fn best_policy(policies: &[ScoredPolicy]) -> Option<&ScoredPolicy> {
    argmax_by(policies, |p| p.score).map(|idx| &policies[idx])
}

/// [`best_policy`] split into the folder and its metrics.
pub fn best_folder_and_metrics(policies: &[ScoredPolicy]) -> Option<(&Path, &MetricSeries)> {
    best_policy(policies).map(|p| (p.folder.as_path(), &p.metrics))
}
