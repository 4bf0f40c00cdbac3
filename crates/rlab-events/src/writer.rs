//! Minimal scalar event-file writer, mirroring the trainer's own summary
//! writer closely enough that [`crate::load_scalars`] reads its output the
//! same way. Used to build event-log fixtures.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use prost::Message;

use crate::proto::{Event, Summary, SummaryValue};
use crate::record::frame;

const FILE_VERSION: &str = "brain.Event:2";

pub struct EventWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

fn wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl EventWriter {
    /// Creates `events.out.tfevents.<secs>.<host>` inside `dir`.
    pub fn create(dir: &Path, host: &str) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let secs = wall_time() as u64;
        Self::create_at(&dir.join(format!("events.out.tfevents.{}.{}", secs, host)))
    }

    pub fn create_at(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = Self {
            path: path.to_path_buf(),
            out: BufWriter::new(File::create(path)?),
        };
        writer.write_event(&Event {
            wall_time: wall_time(),
            file_version: FILE_VERSION.to_string(),
            ..Default::default()
        })?;
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_scalar(&mut self, tag: &str, step: i64, value: f32) -> io::Result<()> {
        self.write_event(&Event {
            wall_time: wall_time(),
            step,
            summary: Some(Summary {
                value: vec![SummaryValue {
                    tag: tag.to_string(),
                    simple_value: Some(value),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        })
    }

    pub fn write_event(&mut self, event: &Event) -> io::Result<()> {
        self.write_record(&event.encode_to_vec())
    }

    /// Frames `data` with valid checksums, whatever it holds.
    pub fn write_record(&mut self, data: &[u8]) -> io::Result<()> {
        self.out.write_all(&frame(data))
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

impl Drop for EventWriter {
    fn drop(&mut self) {
        let _ = self.out.flush();
    }
}
