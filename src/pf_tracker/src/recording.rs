//! JSON-lines recorder: one `{"time", "x", "y", "r"}` object per tick.

use anyhow::{Context, Result};
use pf_engine::{Record, Recorder};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

pub struct JsonLinesRecorder {
    writer: BufWriter<File>,
    written: usize,
    errors: usize,
}

impl JsonLinesRecorder {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        Ok(Self {
            writer: BufWriter::new(file),
            written: 0,
            errors: 0,
        })
    }

    fn write_record(&mut self, record: &Record) -> Result<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }
}

impl Recorder for JsonLinesRecorder {
    fn record(&mut self, time: u32, target: [f32; 3]) {
        let record = Record {
            time,
            x: target[0],
            y: target[1],
            r: target[2],
        };
        match self.write_record(&record) {
            Ok(()) => self.written += 1,
            Err(e) => {
                // only the first failure is logged
                if self.errors == 0 {
                    tracing::error!(time, "recording write failed: {e:#}");
                }
                self.errors += 1;
            }
        }
    }

    fn finalise(&mut self) {
        if let Err(e) = self.writer.flush() {
            tracing::error!("recording flush failed: {e}");
            self.errors += 1;
        }
        tracing::info!(
            written = self.written,
            errors = self.errors,
            "recording finalised"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_one_object_per_line() {
        let path = std::env::temp_dir().join(format!("pf_tracker_rec_{}.jsonl", std::process::id()));
        {
            let mut recorder = JsonLinesRecorder::create(&path).unwrap();
            recorder.record(0, [1.0, 2.0, 3.0]);
            recorder.record(1, [4.5, 5.0, 6.0]);
            recorder.finalise();
        }
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).ok();

        let records: Vec<Record> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[1],
            Record {
                time: 1,
                x: 4.5,
                y: 5.0,
                r: 6.0
            }
        );
    }

    #[test]
    fn test_create_in_missing_directory_fails() {
        let path = std::env::temp_dir()
            .join("pf_tracker_no_such_dir")
            .join("out.jsonl");
        assert!(JsonLinesRecorder::create(&path).is_err());
    }
}
