use anyhow::{Context, Result};
use csv::{Writer, WriterBuilder};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::models::{Environment, ExportBatch, MetricRecord, Section};

/// Local durable artifact for one (section, environment): appended to on every run.
pub struct CsvExporter {
    writer: Writer<File>,
    path: PathBuf,
    needs_header: bool,
}

pub fn artifact_path(dir: &Path, section: Section, environment: Environment) -> PathBuf {
    dir.join(format!("{}_{}_data.csv", section, environment))
}

impl CsvExporter {
    pub fn open(dir: &Path, section: Section, environment: Environment) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        let path = artifact_path(dir, section, environment);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        let needs_header = file.metadata()?.len() == 0;
        let writer = WriterBuilder::new().has_headers(false).from_writer(file);
        Ok(Self {
            writer,
            path,
            needs_header,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_header(&mut self) -> Result<()> {
        if self.needs_header {
            self.writer.write_record(MetricRecord::HEADER)?;
            self.needs_header = false;
        }
        Ok(())
    }

    pub fn write_record(&mut self, record: &MetricRecord) -> Result<()> {
        self.writer.write_record(record.to_row())?;
        Ok(())
    }

    pub fn write_batch(&mut self, batch: &ExportBatch) -> Result<()> {
        self.write_header()?;
        for record in &batch.records {
            self.write_record(record)?;
        }
        self.writer.flush()?;
        Ok(())
    }

    pub fn finalize(mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
