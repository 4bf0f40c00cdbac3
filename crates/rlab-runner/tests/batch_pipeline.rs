use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::Result;
use rlab_events::writer::EventWriter;
use rlab_runner::artifact::{emit_task, EmitOutcome};
use rlab_runner::process::Renderer;
use rlab_runner::{
    discover_task_roots, run_batch, ArtifactKind, ArtifactStore, CheckpointEmitter, HarnessSettings,
    IndexOptions, TaskRunIndex, VideoEmitter,
};

struct CountingRenderer {
    calls: Rc<Cell<usize>>,
}

impl Renderer for CountingRenderer {
    fn render(&mut self, task_name: &str, checkpoint: &Path, run_dir: &Path) -> Result<()> {
        self.calls.set(self.calls.get() + 1);
        let folder = run_dir.join("videos").join(format!("{}-render", task_name));
        fs::create_dir_all(&folder)?;
        fs::write(folder.join("rl-video-step-0.mp4"), fs::read(checkpoint)?)?;
        Ok(())
    }
}

fn write_policy(root: &Path, name: &str, success: f32, checkpoint: &str) {
    let run = root.join(name).join("runs").join(format!("{}-run", name));
    let mut writer = EventWriter::create(&run.join("summaries"), "DESKTOP-TEST001").expect("writer");
    writer.write_scalar("consecutive_successes", 0, 0.0).expect("write");
    writer.write_scalar("consecutive_successes", 100, success).expect("write");
    writer.flush().expect("flush");
    fs::create_dir_all(run.join("nn")).expect("nn");
    fs::write(run.join("nn").join(checkpoint), name).expect("checkpoint");
}

fn write_config(root: &Path, yaml: &str) {
    fs::create_dir_all(root.join(".hydra")).expect("hydra");
    fs::write(root.join(".hydra").join("config.yaml"), yaml).expect("config");
}

fn build_results(base: &Path) -> HarnessSettings {
    let eureka = base.join("eureka");
    let good = eureka.join("2025-01-17_21-43-31");
    write_config(
        &good,
        "iteration: 2\nsample: 2\nnum_eval: 1\nsuffix: GPT\nmax_iterations: 3000\nenv:\n  task: ShadowHand\n",
    );
    let scores = [0.1, 0.4, 0.8, 0.3, 0.6];
    for (i, s) in scores.iter().enumerate() {
        write_policy(&good, &format!("policy-2025-01-17_22-0{}-00", i), *s, "ShadowHandGPT.pth");
    }
    let broken = eureka.join("2025-01-18_19-07-32");
    write_config(&broken, "sample: 2\nnum_eval: 1\nenv: {task: Ant}\n");

    HarnessSettings {
        results_root: base.join("artifacts"),
        tasks_glob_roots: vec![eureka, base.join("human_baseline")],
        outputs_root: base.join("outputs"),
        save_metadata: true,
        ..HarnessSettings::default()
    }
}

fn names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .expect("list")
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

#[test]
fn batch_emits_artifacts_once_and_survives_broken_roots() {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = build_results(dir.path());
    let roots = discover_task_roots(&settings.tasks_glob_roots);
    assert_eq!(roots.len(), 2);

    let calls = Rc::new(Cell::new(0));
    let mut videos = VideoEmitter::new(
        ArtifactStore::for_kind(&settings, ArtifactKind::Video),
        CountingRenderer { calls: calls.clone() },
        settings.outputs_root.clone(),
    );
    let mut checkpoints = CheckpointEmitter::new(ArtifactStore::for_kind(&settings, ArtifactKind::Checkpoint));

    let mut run = || {
        run_batch(&roots, |root| {
            let index = TaskRunIndex::open(root, IndexOptions::from(&settings))?;
            emit_task(&mut checkpoints, &index);
            let outcomes = emit_task(&mut videos, &index);
            assert_eq!(outcomes.len(), 3);
            Ok(())
        })
    };

    let first = run();
    assert_eq!(first.succeeded, vec![roots[0].clone()]);
    assert_eq!(first.failed.len(), 1);
    assert!(first.failed[0].1.contains("iteration"), "{}", first.failed[0].1);
    assert_eq!(calls.get(), 3);

    let prefix = "ShadowHandGPT_epoch_3000";
    assert_eq!(
        names(&settings.videos_dir()),
        vec![
            format!("{}_eval.mp4", prefix),
            format!("{}_eval_task_folder.txt", prefix),
            format!("{}_iter0.mp4", prefix),
            format!("{}_iter0_task_folder.txt", prefix),
            format!("{}_iter1.mp4", prefix),
            format!("{}_iter1_task_folder.txt", prefix),
        ]
    );
    let best_iter1 = fs::read_to_string(settings.checkpoints_dir().join(format!("{}_iter1.pth", prefix)))
        .expect("checkpoint");
    assert_eq!(best_iter1, "policy-2025-01-17_22-02-00");

    let second = run();
    assert_eq!(second.succeeded.len(), 1);
    assert_eq!(calls.get(), 3, "existing videos must not be rendered again");
}

#[test]
fn reruns_report_existing_artifacts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = build_results(dir.path());
    let root: PathBuf = discover_task_roots(&settings.tasks_glob_roots)
        .into_iter()
        .next()
        .expect("root");
    let index = TaskRunIndex::open(&root, IndexOptions::from(&settings)).expect("open");
    let mut checkpoints = CheckpointEmitter::new(ArtifactStore::for_kind(&settings, ArtifactKind::Checkpoint));
    let first = emit_task(&mut checkpoints, &index);
    assert!(first.iter().all(|(_, o)| matches!(o, EmitOutcome::Written(_))));
    let second = emit_task(&mut checkpoints, &index);
    assert!(second.iter().all(|(_, o)| matches!(o, EmitOutcome::AlreadyExists(_))));
}
