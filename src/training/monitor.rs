//! Observational sinks for training metrics and text samples.
//!
//! Sinks only receive data; nothing they do feeds back into training.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;

use serde::Serialize;

use crate::error::Result;

/// Receiver for tagged scalars and text, keyed by global step.
pub trait MonitorSink {
    /// # Errors
    /// Returns an error if the record cannot be written.
    fn scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()>;

    /// # Errors
    /// Returns an error if the record cannot be written.
    fn text(&mut self, tag: &str, value: &str, step: usize) -> Result<()>;

    /// # Errors
    /// Returns an error if buffered records cannot be written.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Forwards every record to the `log` facade at `info` level.
#[derive(Debug, Default)]
pub struct LogSink;

impl MonitorSink for LogSink {
    fn scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        log::info!("[step {step}] {tag} = {value:.4}");
        Ok(())
    }

    fn text(&mut self, tag: &str, value: &str, step: usize) -> Result<()> {
        log::info!("[step {step}] {tag}: {value}");
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Record<'a> {
    Scalar {
        tag: &'a str,
        step: usize,
        elapsed_seconds: f64,
        value: f64,
    },
    Text {
        tag: &'a str,
        step: usize,
        elapsed_seconds: f64,
        value: &'a str,
    },
}

/// Appends one JSON object per record to a file.
pub struct JsonlSink {
    writer: BufWriter<File>,
    start_time: Instant,
}

impl JsonlSink {
    /// Open `path` for appending, creating it if needed.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            start_time: Instant::now(),
        })
    }

    fn write(&mut self, record: &Record<'_>) -> Result<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }
}

impl MonitorSink for JsonlSink {
    fn scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        let elapsed_seconds = self.start_time.elapsed().as_secs_f64();
        self.write(&Record::Scalar {
            tag,
            step,
            elapsed_seconds,
            value,
        })
    }

    fn text(&mut self, tag: &str, value: &str, step: usize) -> Result<()> {
        let elapsed_seconds = self.start_time.elapsed().as_secs_f64();
        self.write(&Record::Text {
            tag,
            step,
            elapsed_seconds,
            value,
        })
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Sends every record to each inner sink in order.
#[derive(Default)]
pub struct FanOut {
    sinks: Vec<Box<dyn MonitorSink>>,
}

impl FanOut {
    #[must_use]
    pub fn new(sinks: Vec<Box<dyn MonitorSink>>) -> Self {
        Self { sinks }
    }
}

impl MonitorSink for FanOut {
    fn scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        self.sinks
            .iter_mut()
            .try_for_each(|s| s.scalar(tag, value, step))
    }

    fn text(&mut self, tag: &str, value: &str, step: usize) -> Result<()> {
        self.sinks.iter_mut().try_for_each(|s| s.text(tag, value, step))
    }

    fn flush(&mut self) -> Result<()> {
        self.sinks.iter_mut().try_for_each(|s| s.flush())
    }
}
