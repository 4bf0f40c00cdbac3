use std::path::PathBuf;

/// Failure to load a task root's configuration or the harness settings.
///
/// This is the only failure that stops work on a task root; everything
/// below it degrades to a logged warning.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {}", .path.display())]
    MissingFile { path: PathBuf },
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{} missing required keys:\n{}", .path.display(), bullet_list(.keys))]
    MissingKeys { path: PathBuf, keys: Vec<String> },
    #[error("{}: invalid value for {key}: {reason}", .path.display())]
    InvalidValue {
        path: PathBuf,
        key: String,
        reason: String,
    },
}

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|k| format!("  - {}", k))
        .collect::<Vec<_>>()
        .join("\n")
}
