use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{error, info, warn};

/// Outcome of running one operation over many task roots.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BatchReport {
    pub succeeded: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Every child directory of each parent, sorted per parent. Missing parents
/// are skipped.
pub fn discover_task_roots(parents: &[PathBuf]) -> Vec<PathBuf> {
    let mut roots = Vec::new();
    for parent in parents {
        let entries = match fs::read_dir(parent) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %parent.display(), error = %e, "cannot list task parent");
                continue;
            }
        };
        let mut children: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        children.sort();
        roots.extend(children);
    }
    roots
}

/// Runs `op` for each root. A failing root is logged and recorded; the
/// remaining roots still run.
pub fn run_batch<F>(roots: &[PathBuf], mut op: F) -> BatchReport
where
    F: FnMut(&Path) -> Result<()>,
{
    let mut report = BatchReport::default();
    for root in roots {
        info!(root = %root.display(), "processing task root");
        match op(root) {
            Ok(()) => report.succeeded.push(root.clone()),
            Err(e) => {
                let msg = format!("{:#}", e);
                error!(root = %root.display(), error = %msg, "task root failed");
                report.failed.push((root.clone(), msg));
            }
        }
    }
    info!(
        succeeded = report.succeeded.len(),
        failed = report.failed.len(),
        "batch finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    #[test]
    fn discovers_sorted_children_of_existing_parents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let eureka = dir.path().join("eureka");
        for name in ["2025-01-19", "2025-01-17"] {
            fs::create_dir_all(eureka.join(name)).expect("mkdir");
        }
        fs::write(eureka.join("notes.txt"), "x").expect("write");
        let roots = discover_task_roots(&[eureka.clone(), dir.path().join("missing")]);
        assert_eq!(roots, vec![eureka.join("2025-01-17"), eureka.join("2025-01-19")]);
    }

    #[test]
    fn failures_do_not_stop_the_batch() {
        let roots = vec![PathBuf::from("a"), PathBuf::from("b"), PathBuf::from("c")];
        let mut seen = Vec::new();
        let report = run_batch(&roots, |root| {
            seen.push(root.to_path_buf());
            if root == Path::new("b") {
                bail!("broken config");
            }
            Ok(())
        });
        assert_eq!(seen.len(), 3);
        assert_eq!(report.succeeded, vec![PathBuf::from("a"), PathBuf::from("c")]);
        assert_eq!(report.failed, vec![(PathBuf::from("b"), "broken config".to_string())]);
        assert!(!report.is_clean());
    }
}
