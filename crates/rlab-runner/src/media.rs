use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};
use tracing::{error, info};

use crate::ensure_dir;
use crate::process::files_with_extension;

/// Drops the left quarter (a side panel in the rendered viewer), limits the
/// width to 320 px and caps the frame rate at 10 fps.
const GIF_FILTER: &str = "crop=iw*3/4:ih:iw/4:0,fps='min(10,source_fps)',scale='min(320,iw)':-2:flags=lanczos";

pub fn gif_args(video: &Path, gif: &Path) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-i".to_string(),
        video.display().to_string(),
        "-vf".to_string(),
        GIF_FILTER.to_string(),
        gif.display().to_string(),
    ]
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GifReport {
    pub converted: usize,
    pub skipped: usize,
    pub failed: usize,
}

fn convert(ffmpeg: &str, video: &Path, gif: &Path) -> Result<()> {
    let output = Command::new(ffmpeg)
        .args(gif_args(video, gif))
        .output()
        .with_context(|| format!("failed to run {}", ffmpeg))?;
    if !output.status.success() {
        bail!(
            "{} exited with {}: {}",
            ffmpeg,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Converts every `*.mp4` in `videos_dir` that has no GIF in `gifs_dir` yet.
pub fn convert_videos_to_gifs(videos_dir: &Path, gifs_dir: &Path, ffmpeg: &str) -> Result<GifReport> {
    ensure_dir(gifs_dir)?;
    let videos = files_with_extension(videos_dir, "mp4");
    info!(count = videos.len(), dir = %videos_dir.display(), "found videos");
    let mut report = GifReport::default();
    for video in videos {
        let stem = video
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let gif = gifs_dir.join(format!("{}.gif", stem));
        if gif.exists() {
            info!(video = %video.display(), "gif exists, skipping");
            report.skipped += 1;
            continue;
        }
        match convert(ffmpeg, &video, &gif) {
            Ok(()) => {
                let size = |p: &Path| fs::metadata(p).map(|m| m.len()).unwrap_or(0);
                info!(gif = %gif.display(), video_bytes = size(&video), gif_bytes = size(&gif), "created gif");
                report.converted += 1;
            }
            Err(e) => {
                error!(video = %video.display(), error = %format!("{:#}", e), "gif conversion failed");
                report.failed += 1;
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ffmpeg_arguments_name_input_and_output() {
        let args = gif_args(Path::new("v/Ant_eval.mp4"), Path::new("g/Ant_eval.gif"));
        assert_eq!(args[4], "v/Ant_eval.mp4");
        assert_eq!(args.last().map(String::as_str), Some("g/Ant_eval.gif"));
        assert!(args[6].starts_with("crop=iw*3/4"), "{}", args[6]);
        // Slow recordings keep their own rate.
        assert!(args[6].contains("fps='min(10,source_fps)'"), "{}", args[6]);
    }

    #[test]
    fn existing_gifs_are_skipped_and_failures_counted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let videos = dir.path().join("videos");
        let gifs = dir.path().join("gifs");
        fs::create_dir_all(&videos).expect("mkdir");
        fs::create_dir_all(&gifs).expect("mkdir");
        fs::write(videos.join("done.mp4"), b"x").expect("write");
        fs::write(gifs.join("done.gif"), b"x").expect("write");
        fs::write(videos.join("todo.mp4"), b"x").expect("write");
        let report = convert_videos_to_gifs(&videos, &gifs, "/nonexistent/ffmpeg").expect("convert");
        assert_eq!(report, GifReport { converted: 0, skipped: 1, failed: 1 });
    }
}
