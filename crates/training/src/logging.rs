//! Stdout progress lines and TensorBoard scalar event files.

use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::{BufMut, BytesMut};
use prost::Message;

use crate::{
    evaluation::EvaluationReport,
    metrics::{Metrics, StepSnapshot},
    TrainingError,
};

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    pub tensorboard_dir: Option<PathBuf>,
    /// Events buffered before the event file is flushed.
    pub tensorboard_flush_every_n: usize,
}

impl LoggingSettings {
    pub fn from_config(
        enable_stdout: bool,
        tensorboard_dir: Option<PathBuf>,
        flush_every: usize,
    ) -> Self {
        Self {
            enable_stdout,
            tensorboard_dir,
            tensorboard_flush_every_n: flush_every.max(1),
        }
    }
}

/// Stdout lines plus optional TensorBoard scalars for training and evaluation.
pub struct Logger {
    settings: LoggingSettings,
    events: Option<EventFile>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, TrainingError> {
        let events = match settings.tensorboard_dir.as_deref() {
            Some(dir) => Some(EventFile::create(dir, settings.tensorboard_flush_every_n)?),
            None => None,
        };
        Ok(Self { settings, events })
    }

    pub fn log_training_step(
        &mut self,
        step: usize,
        lr: f64,
        snapshot: &StepSnapshot,
        metrics: &Metrics,
    ) {
        if self.settings.enable_stdout {
            println!(
                "train step={} loss={:.4} {} tokens={} tok/s={:.1} grad_norm={:.3} lr={:.5e}",
                step,
                snapshot.step_loss,
                format_metrics(metrics),
                snapshot.tokens,
                snapshot.step_tokens_per_sec,
                snapshot.raw_grad_norm,
                lr
            );
        }

        let mut scalars = vec![
            ("train/loss".to_string(), snapshot.step_loss),
            ("train/loss_ema".to_string(), snapshot.loss),
            ("train/tokens_per_sec".to_string(), snapshot.tokens_per_sec),
            ("train/grad_norm".to_string(), snapshot.raw_grad_norm),
            ("train/learning_rate".to_string(), lr),
        ];
        scalars.extend(metrics.iter().map(|(key, value)| (format!("train/{key}"), *value)));
        self.record(step, &scalars);
    }

    pub fn log_evaluation(&mut self, report: &EvaluationReport) {
        if self.settings.enable_stdout {
            let optional = |value: Option<f64>| {
                value.map_or_else(|| "-".to_string(), |value| format!("{value:.4}"))
            };
            println!(
                "eval step={} {} iw_ll/word={} iw_ll_x_gen/word={} d_ks={}",
                report.step,
                format_metrics(&report.metrics),
                optional(report.iw_ll_per_word),
                optional(report.iw_ll_x_gen_per_word),
                optional(report.d_ks)
            );
        }

        let mut scalars: Vec<(String, f64)> = report
            .metrics
            .iter()
            .map(|(key, value)| (format!("eval/{key}"), *value))
            .collect();
        for (tag, value) in [
            ("eval/iw_ll_per_word", report.iw_ll_per_word),
            ("eval/iw_ll_x_gen_per_word", report.iw_ll_x_gen_per_word),
            ("eval/d_ks", report.d_ks),
        ] {
            if let Some(value) = value {
                scalars.push((tag.to_string(), value));
            }
        }
        self.record(report.step, &scalars);
    }

    pub fn flush(&mut self) {
        if let Some(events) = self.events.as_mut() {
            if let Err(err) = events.flush() {
                log::warn!("{err}");
            }
        }
    }

    fn record(&mut self, step: usize, scalars: &[(String, f64)]) {
        if let Some(events) = self.events.as_mut() {
            if let Err(err) = events.append_scalars(step as i64, scalars) {
                log::warn!("dropping tensorboard scalars for step {step}: {err}");
            }
        }
    }
}

fn format_metrics(metrics: &Metrics) -> String {
    metrics
        .iter()
        .map(|(key, value)| format!("{key}={value:.4}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Append-only `events.out.tfevents.*` file. Each logging call becomes one
/// event carrying all of that step's scalars.
struct EventFile {
    writer: BufWriter<File>,
    path: PathBuf,
    flush_every: usize,
    unflushed: usize,
}

impl EventFile {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir)?;
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let path = dir.join(format!("events.out.tfevents.{created}.{host}"));
        let file = File::create(&path).map_err(|err| {
            TrainingError::initialization(format!(
                "cannot create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        log::info!("writing tensorboard events to {}", path.display());
        Ok(Self {
            writer: BufWriter::new(file),
            path,
            flush_every: flush_every.max(1),
            unflushed: 0,
        })
    }

    fn append_scalars(&mut self, step: i64, scalars: &[(String, f64)]) -> Result<(), TrainingError> {
        if scalars.is_empty() {
            return Ok(());
        }
        let event = Event {
            wall_time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs_f64())
                .unwrap_or_default(),
            step,
            summary: Some(Summary {
                value: scalars
                    .iter()
                    .map(|(tag, value)| SummaryValue {
                        tag: tag.clone(),
                        simple_value: Some(*value as f32),
                    })
                    .collect(),
            }),
        };
        self.writer.write_all(&frame_record(&event.encode_to_vec()))?;
        self.unflushed += 1;
        if self.unflushed >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("cannot flush {}: {err}", self.path.display()))
        })?;
        self.unflushed = 0;
        Ok(())
    }
}

impl Drop for EventFile {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// TFRecord framing: `len u64 | crc(len) u32 | payload | crc(payload) u32`,
/// little endian, with masked CRC32-C.
fn frame_record(payload: &[u8]) -> BytesMut {
    let mut record = BytesMut::with_capacity(payload.len() + 16);
    let len = (payload.len() as u64).to_le_bytes();
    record.put_slice(&len);
    record.put_u32_le(masked_crc32c(&len));
    record.put_slice(payload);
    record.put_u32_le(masked_crc32c(payload));
    record
}

fn masked_crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data).rotate_right(15).wrapping_add(0xa282_ead8)
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<SummaryValue>,
}

#[derive(Clone, PartialEq, Message)]
struct SummaryValue {
    #[prost(string, tag = "1")]
    tag: String,
    #[prost(float, optional, tag = "2")]
    simple_value: Option<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_checksums_use_the_castagnoli_polynomial() {
        assert_eq!(crc32c::crc32c(b"123456789"), 0xe306_9283);
        let expected = 0xe306_9283u32.rotate_right(15).wrapping_add(0xa282_ead8);
        assert_eq!(masked_crc32c(b"123456789"), expected);
    }

    #[test]
    fn records_are_length_prefixed() {
        let record = frame_record(b"abc");
        assert_eq!(record.len(), 8 + 4 + 3 + 4);
        assert_eq!(&record[..8], &3u64.to_le_bytes());
        assert_eq!(&record[12..15], b"abc");
    }

    #[test]
    fn evaluation_scalars_reach_the_event_file() -> Result<(), TrainingError> {
        let dir = tempfile::tempdir()?;
        let mut logger = Logger::new(LoggingSettings::from_config(
            false,
            Some(dir.path().to_path_buf()),
            1,
        ))?;
        let report = EvaluationReport {
            step: 3,
            metrics: Metrics::from([("rate".to_string(), 1.5)]),
            iw_ll_per_word: Some(-4.0),
            ..EvaluationReport::default()
        };
        logger.log_evaluation(&report);
        logger.flush();

        let files: Vec<_> = fs::read_dir(dir.path())?.collect::<Result<_, _>>()?;
        assert_eq!(files.len(), 1);
        let bytes = fs::read(files[0].path())?;
        let len = u64::from_le_bytes(bytes[..8].try_into().map_err(|_| {
            TrainingError::runtime("short record")
        })?) as usize;
        let event = Event::decode(&bytes[12..12 + len])
            .map_err(|err| TrainingError::runtime(err.to_string()))?;
        assert_eq!(event.step, 3);
        let tags: Vec<&str> = event
            .summary
            .iter()
            .flat_map(|summary| summary.value.iter().map(|value| value.tag.as_str()))
            .collect();
        assert_eq!(tags, vec!["eval/rate", "eval/iw_ll_per_word"]);
        Ok(())
    }
}
