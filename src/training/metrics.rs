use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

/// Destination for scalar training metrics
pub trait MetricsSink {
    /// Record `value` under `name` at `step`
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> io::Result<()>;

    /// Flush buffered records
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One recorded scalar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarRecord {
    pub name: String,
    pub value: f64,
    pub step: usize,
}

/// Keeps every record in memory
#[derive(Debug, Default)]
pub struct MemoryMetricsSink {
    records: Vec<ScalarRecord>,
}

impl MemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far
    pub fn records(&self) -> &[ScalarRecord] {
        &self.records
    }

    /// Records with the given name
    pub fn series(&self, name: &str) -> Vec<&ScalarRecord> {
        self.records.iter().filter(|r| r.name == name).collect()
    }
}

impl MetricsSink for MemoryMetricsSink {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> io::Result<()> {
        self.records.push(ScalarRecord {
            name: name.to_string(),
            value,
            step,
        });
        Ok(())
    }
}

/// Appends `name,value,step` rows to a CSV file
pub struct CsvMetricsSink {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl CsvMetricsSink {
    /// Create or truncate the file at `path`
    pub fn create<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let writer = csv::Writer::from_path(&path)
            .with_context(|| format!("Failed to create metrics file: {:?}", path))?;
        Ok(Self { path, writer })
    }

    /// File being written
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricsSink for CsvMetricsSink {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> io::Result<()> {
        let record = ScalarRecord {
            name: name.to_string(),
            value,
            step,
        };
        self.writer.serialize(record)?;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Logs every scalar at debug level
#[derive(Debug, Default)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> io::Result<()> {
        tracing::debug!(step, value, "{}", name);
        Ok(())
    }
}
