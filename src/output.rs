//! Report sinks

use crate::error::Result;
use crate::results::Report;
use serde::Deserialize;
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::info;

/// Serialization format of the report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Yaml,
}

impl From<&str> for OutputFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "yaml" | "yml" => OutputFormat::Yaml,
            _ => OutputFormat::Json, // Default
        }
    }
}

/// Where the report is written
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OutputTarget {
    #[default]
    Stdout,
    /// Created, or truncated if it exists
    File(PathBuf),
}

impl OutputTarget {
    pub fn from_path(path: Option<PathBuf>) -> Self {
        match path {
            Some(path) => OutputTarget::File(path),
            None => OutputTarget::Stdout,
        }
    }

    /// Serialize `report` and write it to the target
    pub fn write(&self, report: &Report, format: OutputFormat) -> Result<()> {
        match self {
            OutputTarget::Stdout => {
                let stdout = io::stdout();
                let mut handle = stdout.lock();
                write_report(&mut handle, report, format)
            }
            OutputTarget::File(path) => {
                let mut file = File::create(path)?;
                write_report(&mut file, report, format)?;
                file.sync_all()?;
                info!("Report written to {}", path.display());
                Ok(())
            }
        }
    }
}

/// Write `report` to any writer, newline terminated
pub fn write_report<W: Write>(writer: &mut W, report: &Report, format: OutputFormat) -> Result<()> {
    let body = match format {
        OutputFormat::Json => report.to_json()?,
        OutputFormat::Yaml => report.to_yaml()?,
    };
    writer.write_all(body.as_bytes())?;
    if !body.ends_with('\n') {
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}
