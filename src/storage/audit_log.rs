//! Append-only audit log
//!
//! One CSV row per processed prediction record, flushed and synced before
//! the next tick starts. Rows are never rewritten. In append mode the file
//! carries over between sessions and the last cumulative volume of every
//! pump is read back on open, so the volume ceiling survives a restart. The
//! newest row timestamp is read back too, so records audited before the
//! restart are not processed twice.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::{AuditLogEntry, AUDIT_TIMESTAMP_FORMAT};

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit log {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("audit log {}: {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// How a new process session treats an existing audit file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditMode {
    /// Keep appending to the same file
    #[default]
    Append,
    /// Open a fresh file named by session start time
    Session,
}

pub struct AuditLog {
    path: PathBuf,
    writer: csv::Writer<File>,
    recovered: Recovered,
    rows_written: u64,
}

/// What an existing log says about the previous session.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Recovered {
    /// Last `cumulative_dispensed` per `pump_id`
    pub cumulative: HashMap<String, f64>,
    /// Newest row timestamp
    pub last_timestamp: Option<NaiveDateTime>,
}

impl AuditLog {
    /// Open the audit log for a session starting at `session_start`.
    pub fn open(
        dir: &Path,
        file_name: &str,
        mode: AuditMode,
        session_start: NaiveDateTime,
    ) -> Result<Self, AuditError> {
        fs::create_dir_all(dir).map_err(|source| AuditError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = match mode {
            AuditMode::Append => dir.join(file_name),
            AuditMode::Session => dir.join(session_file_name(file_name, session_start)),
        };
        Self::open_path(path)
    }

    /// Open (or create) the log at an exact path.
    pub fn open_path(path: PathBuf) -> Result<Self, AuditError> {
        let recovered = if path.exists() {
            recover(&path)?
        } else {
            Recovered::default()
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| AuditError::Io {
                path: path.clone(),
                source,
            })?;
        let is_empty = file
            .metadata()
            .map_err(|source| AuditError::Io {
                path: path.clone(),
                source,
            })?
            .len()
            == 0;

        let writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        let mut log = Self {
            path,
            writer,
            recovered,
            rows_written: 0,
        };

        if is_empty {
            log.write_row(AuditLogEntry::HEADER)?;
        } else if !log.recovered.cumulative.is_empty() {
            info!(
                path = %log.path.display(),
                pumps = log.recovered.cumulative.len(),
                last = ?log.recovered.last_timestamp,
                "Recovered cumulative volumes from existing audit log"
            );
        }
        info!(path = %log.path.display(), "Audit log open");
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last cumulative volume per pump found in the file at open.
    pub fn recovered_cumulative(&self, pump_id: &str) -> Option<f64> {
        self.recovered.cumulative.get(pump_id).copied()
    }

    /// Newest row timestamp found in the file at open.
    pub fn last_timestamp(&self) -> Option<NaiveDateTime> {
        self.recovered.last_timestamp
    }

    /// Rows appended by this session, header excluded.
    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    /// Append one entry and make it durable before returning.
    pub fn append(&mut self, entry: &AuditLogEntry) -> Result<(), AuditError> {
        self.write_row(entry.to_fields())?;
        self.rows_written += 1;
        debug!(
            pump = %entry.pump_id,
            output = entry.output,
            cumulative = entry.cumulative_dispensed,
            outcome = %entry.outcome,
            "Audit row written"
        );
        Ok(())
    }

    fn write_row<I, T>(&mut self, fields: I) -> Result<(), AuditError>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        self.writer
            .write_record(fields)
            .map_err(|source| AuditError::Csv {
                path: self.path.clone(),
                source,
            })?;
        self.writer
            .flush()
            .and_then(|()| self.writer.get_ref().sync_data())
            .map_err(|source| AuditError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

/// `<stem>_<YYYYmmdd_HHMMSS>.<ext>` for session mode.
fn session_file_name(file_name: &str, session_start: NaiveDateTime) -> String {
    let path = Path::new(file_name);
    let stem = path
        .file_stem()
        .map_or_else(|| "audit".into(), |s| s.to_string_lossy());
    let ext = path
        .extension()
        .map_or_else(|| "csv".into(), |e| e.to_string_lossy());
    format!("{stem}_{}.{ext}", session_start.format("%Y%m%d_%H%M%S"))
}

/// Last `cumulative_dispensed` per `pump_id` and the newest timestamp in an
/// existing log.
pub fn recover(path: &Path) -> Result<Recovered, AuditError> {
    let csv_err = |source: csv::Error| AuditError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(csv_err)?;

    let headers = reader.headers().map_err(csv_err)?.clone();
    let column = |name: &str| headers.iter().position(|h| h.trim() == name);
    let (Some(pump_col), Some(cum_col)) = (column("pump_id"), column("cumulative_dispensed")) else {
        if !headers.is_empty() {
            warn!(path = %path.display(), "Audit log has no pump_id column; cumulative volume starts at zero");
        }
        return Ok(Recovered::default());
    };
    let time_col = column("timestamp");

    let mut recovered = Recovered::default();
    for (line, record) in reader.records().enumerate() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                warn!(path = %path.display(), line = line + 2, error = %e, "Unreadable audit row skipped");
                continue;
            }
        };
        let stamped = time_col
            .and_then(|col| record.get(col))
            .and_then(|t| NaiveDateTime::parse_from_str(t.trim(), AUDIT_TIMESTAMP_FORMAT).ok());
        if let Some(t) = stamped {
            recovered.last_timestamp = Some(recovered.last_timestamp.map_or(t, |last| last.max(t)));
        }
        let (Some(pump), Some(cum)) = (record.get(pump_col), record.get(cum_col)) else {
            continue;
        };
        match cum.trim().parse::<f64>() {
            Ok(v) if v.is_finite() => {
                recovered.cumulative.insert(pump.to_string(), v);
            }
            _ => warn!(path = %path.display(), line = line + 2, value = cum, "Bad cumulative value skipped"),
        }
    }
    Ok(recovered)
}
