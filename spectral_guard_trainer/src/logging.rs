use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use spectral_guard_core::StepReport;

/// JSON-lines sink for step and evaluation records.
pub struct RunLog {
    dir: PathBuf,
}

impl RunLog {
    pub fn create<P: AsRef<Path>>(dir: P) -> io::Result<Self> {
        fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
        })
    }

    pub fn log_step(&self, report: &StepReport, filter_scalars: &BTreeMap<String, f32>) -> io::Result<()> {
        let entry = StepLogEntry {
            iteration: report.iteration,
            losses: &report.losses,
            filter_scalars,
            timestamp_ms: timestamp_ms(),
        };
        append_json_line(self.dir.join("run.jsonl"), &entry)
    }

    pub fn log_evaluation(&self, iteration: u64, mode: &str, psnr: f32, l_pix: f32) -> io::Result<()> {
        let entry = EvaluationLogEntry {
            iteration,
            mode,
            // JSON has no infinity
            psnr: psnr.is_finite().then_some(psnr),
            l_pix,
            timestamp_ms: timestamp_ms(),
        };
        append_json_line(self.dir.join("eval.jsonl"), &entry)
    }
}

fn timestamp_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

fn append_json_line<P: AsRef<Path>, T: Serialize>(path: P, value: &T) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    serde_json::to_writer(&mut file, value).map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
    file.write_all(b"\n")
}

#[derive(Debug, Serialize)]
struct StepLogEntry<'a> {
    iteration: u64,
    losses: &'a BTreeMap<String, f32>,
    filter_scalars: &'a BTreeMap<String, f32>,
    timestamp_ms: u128,
}

#[derive(Debug, Serialize)]
struct EvaluationLogEntry<'a> {
    iteration: u64,
    mode: &'a str,
    psnr: Option<f32>,
    l_pix: f32,
    timestamp_ms: u128,
}
