use std::process::Command;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{info, warn};

use crate::config::GpuSettings;

pub const QUERY_ARGS: [&str; 2] = ["--query-gpu=index,memory.free", "--format=csv,nounits,noheader"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuMemory {
    pub index: u32,
    pub free_mb: u64,
}

/// Parses `index, memory.free` lines.
pub fn parse_memory_query(output: &str) -> Result<Vec<GpuMemory>> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let (index, free) = line
                .split_once(',')
                .ok_or_else(|| anyhow!("malformed gpu query line: {:?}", line))?;
            Ok(GpuMemory {
                index: index.trim().parse().with_context(|| format!("gpu index in {:?}", line))?,
                free_mb: free.trim().parse().with_context(|| format!("free memory in {:?}", line))?,
            })
        })
        .collect()
}

pub trait GpuProbe {
    fn query(&mut self) -> Result<Vec<GpuMemory>>;
}

/// Queries `nvidia-smi` (or a compatible program).
pub struct NvidiaSmi {
    program: String,
}

impl NvidiaSmi {
    pub fn new(settings: &GpuSettings) -> Self {
        Self {
            program: settings.query_program.clone(),
        }
    }
}

impl GpuProbe for NvidiaSmi {
    fn query(&mut self) -> Result<Vec<GpuMemory>> {
        let output = Command::new(&self.program)
            .args(QUERY_ARGS)
            .output()
            .with_context(|| format!("failed to run {}", self.program))?;
        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        parse_memory_query(&String::from_utf8_lossy(&output.stdout))
    }
}

/// First device, in reported order, with at least `required_mb` free.
pub fn select_device(gpus: &[GpuMemory], required_mb: u64) -> Option<u32> {
    gpus.iter().find(|g| g.free_mb >= required_mb).map(|g| g.index)
}

/// Polls until some device has `required_mb` free and returns its index.
/// Failed queries are logged and retried.
pub fn wait_for_free_vram(probe: &mut dyn GpuProbe, required_mb: u64, interval: Duration) -> u32 {
    wait_with(probe, required_mb, interval, &mut thread::sleep)
}

fn wait_with(
    probe: &mut dyn GpuProbe,
    required_mb: u64,
    interval: Duration,
    sleep: &mut dyn FnMut(Duration),
) -> u32 {
    loop {
        match probe.query() {
            Ok(gpus) => {
                if let Some(index) = select_device(&gpus, required_mb) {
                    info!(gpu = index, required_mb, "gpu available");
                    return index;
                }
                info!(required_mb, interval_secs = interval.as_secs(), "no gpu with enough free memory, waiting");
            }
            Err(e) => warn!(error = %format!("{:#}", e), "gpu query failed, retrying"),
        }
        sleep(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct ScriptedProbe {
        replies: VecDeque<Result<Vec<GpuMemory>>>,
    }

    impl GpuProbe for ScriptedProbe {
        fn query(&mut self) -> Result<Vec<GpuMemory>> {
            self.replies.pop_front().expect("probe queried too often")
        }
    }

    #[test]
    fn parses_nvidia_smi_csv() {
        let gpus = parse_memory_query("0, 1024\n1, 20480\n\n").expect("parse");
        assert_eq!(
            gpus,
            vec![
                GpuMemory { index: 0, free_mb: 1024 },
                GpuMemory { index: 1, free_mb: 20480 },
            ]
        );
        assert!(parse_memory_query("0 1024").is_err());
        assert!(parse_memory_query("zero, 1").is_err());
    }

    #[test]
    fn first_sufficient_device_is_chosen() {
        let gpus = parse_memory_query("0, 100\n1, 9000\n2, 30000\n").expect("parse");
        assert_eq!(select_device(&gpus, 8192), Some(1));
        assert_eq!(select_device(&gpus, 40000), None);
    }

    #[test]
    fn waits_until_memory_frees_up() {
        let mut probe = ScriptedProbe {
            replies: VecDeque::from(vec![
                Ok(vec![GpuMemory { index: 0, free_mb: 10 }]),
                Err(anyhow!("driver busy")),
                Ok(vec![GpuMemory { index: 0, free_mb: 10 }, GpuMemory { index: 3, free_mb: 9000 }]),
            ]),
        };
        let mut sleeps = 0;
        let gpu = wait_with(&mut probe, 8192, Duration::from_secs(60), &mut |_| sleeps += 1);
        assert_eq!(gpu, 3);
        assert_eq!(sleeps, 2);
    }
}
