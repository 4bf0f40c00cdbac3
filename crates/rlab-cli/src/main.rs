use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rlab_runner::artifact::{emit_task, EmitOutcome, Emitter};
use rlab_runner::evaluate::EvalCampaign;
use rlab_runner::gpu::{GpuProbe, NvidiaSmi};
use rlab_runner::process::TrainerRenderer;
use rlab_runner::{
    discover_task_roots, media, report, run_batch, sanitize, ArtifactKind, ArtifactStore, BatchReport,
    CheckpointEmitter, HarnessSettings, IndexOptions, TaskRunIndex, VideoEmitter,
};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "rlab", version, about = "Reward-search experiment artifacts")]
struct Cli {
    /// Log filter, e.g. `info` or `rlab_runner=debug`.
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// YAML file overriding the harness defaults.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render and collect the best policy video of every group.
    Videos { roots: Vec<PathBuf> },
    /// Collect the best checkpoint of every group.
    Checkpoints { roots: Vec<PathBuf> },
    /// Write per-task training progress reports.
    Plots { roots: Vec<PathBuf> },
    /// Compare search runs against human baselines.
    Compare,
    /// Print training and evaluation results.
    Results,
    /// Convert collected videos to GIFs.
    Gifs,
    /// Copy run outputs with host names and URLs scrubbed.
    Sanitize {
        #[arg(long)]
        only: Option<String>,
    },
    /// Run the seeded evaluation campaign of one task root.
    Evaluate { root: PathBuf },
    /// Show free memory per GPU.
    Gpu,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::registry()
        .with(EnvFilter::new(&cli.log))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
    let json_mode = cli.json;
    match run_command(&cli) {
        Ok(payload) => {
            if json_mode {
                emit_json(&payload);
            } else {
                print_summary(&payload);
            }
        }
        Err(err) => {
            let message = format!("{:#}", err);
            error!(error = %message, "command failed");
            if json_mode {
                emit_json(&json_error("command_failed", message, json!({})));
            }
        }
    }
    Ok(())
}

fn run_command(cli: &Cli) -> Result<Value> {
    let settings = HarnessSettings::load(cli.settings.as_deref())?;
    match &cli.command {
        Commands::Videos { roots } => {
            let mut emitter = VideoEmitter::new(
                ArtifactStore::for_kind(&settings, ArtifactKind::Video),
                TrainerRenderer::new(settings.trainer.clone(), settings.render.clone()),
                settings.outputs_root.clone(),
            )
            .with_pause(Duration::from_millis(settings.render.pause_between_iterations_ms));
            let batch = emit_all(&settings, roots, &mut emitter);
            Ok(batch_json(&batch))
        }
        Commands::Checkpoints { roots } => {
            let mut emitter = CheckpointEmitter::new(ArtifactStore::for_kind(&settings, ArtifactKind::Checkpoint));
            let batch = emit_all(&settings, roots, &mut emitter);
            Ok(batch_json(&batch))
        }
        Commands::Plots { roots } => {
            let plots = settings.plots_dir();
            let mut written = Vec::new();
            let batch = run_batch(&task_roots(&settings, roots), |root| {
                let index = TaskRunIndex::open(root, IndexOptions::from(&settings))?;
                written.extend(report::write_performance(&index, &plots)?);
                Ok(())
            });
            let mut payload = batch_json(&batch);
            payload["written"] = json!(written);
            Ok(payload)
        }
        Commands::Compare => {
            let indices: Vec<TaskRunIndex> = task_roots(&settings, &[])
                .iter()
                .filter_map(|root| match TaskRunIndex::open(root, IndexOptions::from(&settings)) {
                    Ok(index) => Some(index),
                    Err(e) => {
                        warn!(root = %root.display(), error = %e, "skipping task root");
                        None
                    }
                })
                .collect();
            let comparisons = report::compare_tasks(&indices);
            let written = report::write_comparisons(&comparisons, &settings.plots_dir())?;
            Ok(json!({ "ok": true, "tasks": comparisons.len(), "written": written }))
        }
        Commands::Results => {
            let sections = report::collect_results(&settings.results_root);
            if !cli.json {
                print!("{}", report::render_results(&sections));
            }
            let folders: usize = sections.iter().map(|(_, f)| f.len()).sum();
            Ok(json!({ "ok": true, "folders": folders }))
        }
        Commands::Gifs => {
            let r = media::convert_videos_to_gifs(&settings.videos_dir(), &settings.gifs_dir(), &settings.ffmpeg_program)?;
            Ok(json!({ "ok": true, "converted": r.converted, "skipped": r.skipped, "failed": r.failed }))
        }
        Commands::Sanitize { only } => {
            let r = sanitize::copy_and_sanitize(&settings.sanitize, only.as_deref())?;
            Ok(json!({
                "ok": true,
                "copied": r.copied,
                "rewritten_logs": r.rewritten_logs,
                "renamed": r.renamed
            }))
        }
        Commands::Evaluate { root } => {
            let mut probe = NvidiaSmi::new(&settings.gpu);
            let summary = EvalCampaign::new(&settings, &mut probe).run(root)?;
            Ok(json!({ "ok": true, "final_eval": summary }))
        }
        Commands::Gpu => {
            let gpus = NvidiaSmi::new(&settings.gpu).query()?;
            let rows: Vec<Value> = gpus
                .iter()
                .map(|g| json!({ "index": g.index, "free_mb": g.free_mb }))
                .collect();
            Ok(json!({ "ok": true, "gpus": rows }))
        }
    }
}

fn task_roots(settings: &HarnessSettings, explicit: &[PathBuf]) -> Vec<PathBuf> {
    if explicit.is_empty() {
        discover_task_roots(&settings.tasks_glob_roots)
    } else {
        explicit.to_vec()
    }
}

fn emit_all(settings: &HarnessSettings, roots: &[PathBuf], emitter: &mut dyn Emitter) -> BatchReport {
    run_batch(&task_roots(settings, roots), |root: &Path| {
        let index = TaskRunIndex::open(root, IndexOptions::from(settings))?;
        let outcomes = emit_task(&mut *emitter, &index);
        let written = outcomes
            .iter()
            .filter(|(_, o)| matches!(o, EmitOutcome::Written(_)))
            .count();
        info!(root = %root.display(), written, groups = outcomes.len(), "task root done");
        Ok(())
    })
}

fn batch_json(batch: &BatchReport) -> Value {
    json!({
        "ok": batch.is_clean(),
        "succeeded": batch.succeeded,
        "failed": batch
            .failed
            .iter()
            .map(|(root, err)| json!({ "root": root, "error": err }))
            .collect::<Vec<_>>()
    })
}

fn print_summary(payload: &Value) {
    let Some(map) = payload.as_object() else {
        println!("{}", payload);
        return;
    };
    for (key, value) in map {
        match value {
            Value::Array(items) => {
                println!("{}: {}", key, items.len());
                for item in items {
                    match item {
                        Value::String(s) => println!("  {}", s),
                        other => println!("  {}", other),
                    }
                }
            }
            Value::String(s) => println!("{}: {}", key, s),
            other => println!("{}: {}", key, other),
        }
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}
