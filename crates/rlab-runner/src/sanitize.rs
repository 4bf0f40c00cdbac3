use std::fs;
use std::path::{Component, Path};

use anyhow::{bail, Context, Result};
use regex::Regex;
use tracing::{debug, info};

use crate::config::SanitizeSettings;
use crate::ensure_dir;

const URL_PATTERN: &str = r#"https?://[^\s'"<>()\[\]]+"#;
pub const REDACTED_URL: &str = "[REDACTED_URL]";

/// Host-name and URL scrubbing for published run outputs.
pub struct Sanitizer {
    host: Regex,
    url: Regex,
    replacement: String,
}

impl Sanitizer {
    pub fn new(settings: &SanitizeSettings) -> Result<Self> {
        Ok(Self {
            host: Regex::new(&settings.host_pattern)
                .with_context(|| format!("invalid host pattern {:?}", settings.host_pattern))?,
            url: Regex::new(URL_PATTERN)?,
            replacement: settings.host_replacement.clone(),
        })
    }

    /// Event file names embed the host that wrote them.
    pub fn file_name(&self, name: &str) -> String {
        if name.contains("tfevents") {
            self.host.replace_all(name, self.replacement.as_str()).into_owned()
        } else {
            name.to_string()
        }
    }

    pub fn log_text(&self, text: &str) -> String {
        let scrubbed = self.host.replace_all(text, self.replacement.as_str());
        self.url.replace_all(&scrubbed, REDACTED_URL).into_owned()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SanitizeReport {
    pub copied: usize,
    pub rewritten_logs: usize,
    pub renamed: usize,
}

fn skipped(rel: &Path, skip_top_level: &[String]) -> bool {
    match rel.components().next() {
        Some(Component::Normal(first)) => skip_top_level.iter().any(|s| first == s.as_str()),
        _ => false,
    }
}

/// Mirrors `settings.source` into `settings.destination`, scrubbing host
/// names and URLs. `only` restricts the copy to one top-level sub-folder.
pub fn copy_and_sanitize(settings: &SanitizeSettings, only: Option<&str>) -> Result<SanitizeReport> {
    let src = settings.source.as_path();
    if !src.is_dir() {
        bail!("source directory {} not found", src.display());
    }
    let start = match only {
        Some(sub) => {
            let dir = src.join(sub);
            if !dir.is_dir() {
                bail!("sub-folder {} not found", dir.display());
            }
            dir
        }
        None => src.to_path_buf(),
    };
    let sanitizer = Sanitizer::new(settings)?;
    let dst = settings.destination.as_path();
    ensure_dir(dst)?;

    let mut report = SanitizeReport::default();
    let walker = walkdir::WalkDir::new(&start).into_iter().filter_entry(|e| {
        let rel = e.path().strip_prefix(src).unwrap_or(e.path());
        !skipped(rel, &settings.skip_top_level)
    });
    for entry in walker {
        let entry = entry?;
        let path = entry.path();
        let rel = path.strip_prefix(src).unwrap_or(path);
        if entry.file_type().is_dir() {
            ensure_dir(&dst.join(rel))?;
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        let clean = sanitizer.file_name(&name);
        if clean != name {
            report.renamed += 1;
        }
        let target = match rel.parent() {
            Some(parent) => dst.join(parent).join(&clean),
            None => dst.join(&clean),
        };
        if let Some(parent) = target.parent() {
            ensure_dir(parent)?;
        }
        if path.extension().and_then(|e| e.to_str()) == Some("log") {
            let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
            let text = String::from_utf8_lossy(&bytes);
            fs::write(&target, sanitizer.log_text(&text))
                .with_context(|| format!("writing {}", target.display()))?;
            report.rewritten_logs += 1;
        } else {
            fs::copy(path, &target)
                .with_context(|| format!("copying {} to {}", path.display(), target.display()))?;
            report.copied += 1;
        }
        debug!(from = %path.display(), to = %target.display(), "copied");
    }
    info!(
        copied = report.copied,
        logs = report.rewritten_logs,
        renamed = report.renamed,
        "sanitized copy finished"
    );
    Ok(report)
}
