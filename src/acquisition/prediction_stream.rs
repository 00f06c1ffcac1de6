//! Prediction stream tailer
//!
//! Follows the single append-only results file written by the chemometric
//! engine. The first line is a comma-separated header of predicted-value
//! labels; every later line is
//!
//! ```text
//! <spectrum name> \t <date> \t <time> \t v0, v1, ..., vn
//! ```
//!
//! The stream keeps a byte cursor and only ever consumes complete,
//! newline-terminated lines. A trailing partial line is left in place until
//! the engine finishes writing it. Malformed body lines are reported and
//! skipped, and the cursor moves past them so they are never revisited.
//!
//! With [`PredictionStream::skip_backlog`] the body lines already in the
//! file at the first poll are consumed without being emitted. The header is
//! still emitted, so a restarted controller resolves its tracked value and
//! acts only on predictions written after it started.

use chrono::NaiveDateTime;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::{PredictionHeader, PredictionRecord};

/// Date/time layouts the engine is known to write, tried in order.
const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %I:%M:%S %p",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %H:%M:%S%.f",
];

// ============================================================================
// Errors
// ============================================================================

/// A prediction line that could not be turned into a record.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StreamFormatError {
    #[error("line at byte {offset}: expected {expected} values to match the header, found {found}")]
    ValueCount {
        offset: u64,
        expected: usize,
        found: usize,
    },

    #[error("line at byte {offset}: expected 4 tab-separated fields, found {found}")]
    FieldCount { offset: u64, found: usize },

    #[error("line at byte {offset}: unrecognised timestamp '{raw}'")]
    Timestamp { offset: u64, raw: String },

    #[error("line at byte {offset}: value '{raw}' is not numeric")]
    Value { offset: u64, raw: String },

    #[error("line at byte {offset}: header contains no labels")]
    EmptyHeader { offset: u64 },
}

impl StreamFormatError {
    /// Byte offset of the start of the offending line.
    pub fn offset(&self) -> u64 {
        match self {
            Self::ValueCount { offset, .. }
            | Self::FieldCount { offset, .. }
            | Self::Timestamp { offset, .. }
            | Self::Value { offset, .. }
            | Self::EmptyHeader { offset } => *offset,
        }
    }
}

// ============================================================================
// Poll Result
// ============================================================================

/// Everything newly consumed by one poll.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StreamPoll {
    /// Header, if it was parsed during this poll
    pub header: Option<PredictionHeader>,
    /// New records in file order
    pub records: Vec<PredictionRecord>,
    /// Lines skipped during this poll
    pub errors: Vec<StreamFormatError>,
}

impl StreamPoll {
    pub fn is_empty(&self) -> bool {
        self.header.is_none() && self.records.is_empty() && self.errors.is_empty()
    }
}

/// Running totals for one stream instance.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamStats {
    pub lines_consumed: u64,
    pub records_emitted: u64,
    pub format_errors: u64,
    /// Records found at startup and dropped by `skip_backlog`
    pub backlog_skipped: u64,
}

// ============================================================================
// Prediction Stream
// ============================================================================

/// Cursor over the engine's results file. The only thing allowed to advance it.
#[derive(Debug)]
pub struct PredictionStream {
    path: PathBuf,
    cursor: u64,
    header: Option<PredictionHeader>,
    shrink_reported: bool,
    skip_backlog: bool,
    stats: StreamStats,
}

impl PredictionStream {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cursor: 0,
            header: None,
            shrink_reported: false,
            skip_backlog: false,
            stats: StreamStats::default(),
        }
    }

    /// Drop the records already in the file at the first poll.
    ///
    /// If the file does not exist yet at the first poll, everything it later
    /// receives is new and nothing is dropped.
    pub fn skip_backlog(mut self, skip: bool) -> Self {
        self.skip_backlog = skip;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes consumed so far.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn header(&self) -> Option<&PredictionHeader> {
        self.header.as_ref()
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    /// Read whatever was appended since the last poll.
    ///
    /// A missing file yields an empty poll: the engine has not started yet.
    pub fn poll(&mut self) -> io::Result<StreamPoll> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.skip_backlog = false;
                return Ok(StreamPoll::default());
            }
            Err(e) => return Err(e),
        };
        let backlog = std::mem::take(&mut self.skip_backlog);

        let len = file.metadata()?.len();
        if len < self.cursor {
            if !self.shrink_reported {
                warn!(
                    path = %self.path.display(),
                    cursor = self.cursor,
                    len,
                    "Prediction file shrank below the read cursor; holding position"
                );
                self.shrink_reported = true;
            }
            return Ok(StreamPoll::default());
        }
        if len == self.cursor {
            return Ok(StreamPoll::default());
        }

        file.seek(SeekFrom::Start(self.cursor))?;
        let mut appended = Vec::new();
        file.take(len - self.cursor).read_to_end(&mut appended)?;

        let mut poll = self.consume(&appended);
        if backlog && !poll.records.is_empty() {
            let skipped = poll.records.len() as u64;
            self.stats.records_emitted -= skipped;
            self.stats.backlog_skipped += skipped;
            poll.records.clear();
            info!(
                path = %self.path.display(),
                skipped,
                cursor = self.cursor,
                "Existing predictions skipped; acting on new lines only"
            );
        }
        Ok(poll)
    }

    /// Parse the complete lines at the start of `appended`, which must begin
    /// exactly at the cursor.
    fn consume(&mut self, appended: &[u8]) -> StreamPoll {
        let mut poll = StreamPoll::default();
        let mut start = 0usize;

        while let Some(newline) = appended[start..].iter().position(|b| *b == b'\n') {
            let end = start + newline;
            let line_offset = self.cursor;
            let raw = String::from_utf8_lossy(&appended[start..end]);
            let line = raw.trim_end_matches('\r');

            self.cursor += (end - start + 1) as u64;
            self.stats.lines_consumed += 1;
            start = end + 1;

            if line.trim().is_empty() {
                continue;
            }

            match &self.header {
                None => match parse_header(line, line_offset) {
                    Ok(header) => {
                        info!(
                            path = %self.path.display(),
                            labels = ?header.labels,
                            "Prediction header parsed"
                        );
                        poll.header = Some(header.clone());
                        self.header = Some(header);
                    }
                    Err(e) => {
                        warn!(error = %e, "Skipping malformed prediction header");
                        self.stats.format_errors += 1;
                        poll.errors.push(e);
                    }
                },
                Some(header) => match parse_record(line, line_offset, self.cursor, header.len()) {
                    Ok(record) => {
                        debug!(offset = record.offset, timestamp = %record.timestamp, "Prediction record");
                        self.stats.records_emitted += 1;
                        poll.records.push(record);
                    }
                    Err(e) => {
                        warn!(error = %e, "Skipping malformed prediction line");
                        self.stats.format_errors += 1;
                        poll.errors.push(e);
                    }
                },
            }
        }

        poll
    }
}

// ============================================================================
// Line Parsing
// ============================================================================

/// Parse the header line into trimmed labels.
fn parse_header(line: &str, offset: u64) -> Result<PredictionHeader, StreamFormatError> {
    let line = line.trim_start_matches('\u{feff}');
    let labels: Vec<String> = line.split(',').map(|l| l.trim().to_string()).collect();
    if labels.iter().all(String::is_empty) {
        return Err(StreamFormatError::EmptyHeader { offset });
    }
    Ok(PredictionHeader::new(labels))
}

/// Parse one body line into a record ending at `end_offset`.
fn parse_record(
    line: &str,
    offset: u64,
    end_offset: u64,
    expected: usize,
) -> Result<PredictionRecord, StreamFormatError> {
    let fields: Vec<&str> = line.splitn(4, '\t').collect();
    if fields.len() != 4 {
        return Err(StreamFormatError::FieldCount {
            offset,
            found: fields.len(),
        });
    }

    let timestamp = parse_timestamp(fields[1].trim(), fields[2].trim()).ok_or_else(|| {
        StreamFormatError::Timestamp {
            offset,
            raw: format!("{} {}", fields[1].trim(), fields[2].trim()),
        }
    })?;

    let values = fields[3]
        .split(',')
        .map(str::trim)
        .map(|v| {
            v.parse::<f64>().map_err(|_| StreamFormatError::Value {
                offset,
                raw: v.to_string(),
            })
        })
        .collect::<Result<Vec<f64>, _>>()?;

    if values.len() != expected {
        return Err(StreamFormatError::ValueCount {
            offset,
            expected,
            found: values.len(),
        });
    }

    Ok(PredictionRecord {
        timestamp,
        values,
        offset: end_offset,
        source_name: fields[0].trim().to_string(),
    })
}

/// Combine the engine's date and time fields.
pub fn parse_timestamp(date: &str, time: &str) -> Option<NaiveDateTime> {
    let combined = format!("{date} {time}");
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&combined, fmt).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::TempDir;

    fn append(path: &Path, text: &str) {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    fn stream() -> (TempDir, PathBuf, PredictionStream) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("AutoSave.txt");
        let stream = PredictionStream::new(&path);
        (dir, path, stream)
    }

    #[test]
    fn parses_header_then_record() {
        let (_dir, path, mut stream) = stream();
        append(&path, "Glucose,Xylose\ns1.txt\t2024-01-01\t00:00:00\t1.2,0.4\n");

        let poll = stream.poll().unwrap();

        assert_eq!(poll.header.unwrap().labels, vec!["Glucose", "Xylose"]);
        assert_eq!(poll.records.len(), 1);
        let record = &poll.records[0];
        assert_eq!(
            record.timestamp,
            NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap()
        );
        assert_eq!(record.values, vec![1.2, 0.4]);
        assert_eq!(record.source_name, "s1.txt");
        assert_eq!(record.offset, stream.cursor());
    }

    #[test]
    fn missing_file_is_empty_poll() {
        let (_dir, _path, mut stream) = stream();
        assert!(stream.poll().unwrap().is_empty());
        assert_eq!(stream.cursor(), 0);
    }

    #[test]
    fn partial_line_waits_for_newline() {
        let (_dir, path, mut stream) = stream();
        append(&path, "Glucose,Xylose\ns1.txt\t2024-01-01\t00:00:00\t1.2,");

        let first = stream.poll().unwrap();
        assert!(first.header.is_some());
        assert!(first.records.is_empty());
        assert_eq!(stream.cursor(), "Glucose,Xylose\n".len() as u64);

        append(&path, "0.4\n");
        let second = stream.poll().unwrap();
        assert_eq!(second.records.len(), 1);
        assert_eq!(second.records[0].values, vec![1.2, 0.4]);
    }

    #[test]
    fn value_count_mismatch_is_skipped() {
        let (_dir, path, mut stream) = stream();
        append(
            &path,
            "Glucose,Xylose\n\
             bad.txt\t2024-01-01\t00:00:00\t1.0,2.0,3.0\n\
             good.txt\t2024-01-01\t00:01:00\t1.5,0.5\n",
        );

        let poll = stream.poll().unwrap();

        assert_eq!(poll.errors.len(), 1);
        assert!(matches!(
            poll.errors[0],
            StreamFormatError::ValueCount {
                expected: 2,
                found: 3,
                ..
            }
        ));
        assert_eq!(poll.records.len(), 1);
        assert_eq!(poll.records[0].source_name, "good.txt");
        assert_eq!(stream.stats().format_errors, 1);

        // Nothing is re-read on the next poll.
        assert!(stream.poll().unwrap().is_empty());
    }

    #[test]
    fn offsets_strictly_increase_across_polls() {
        let (_dir, path, mut stream) = stream();
        append(&path, "A\n");
        let mut seen = Vec::new();
        for i in 0..5 {
            append(&path, &format!("s{i}.txt\t2024-01-01\t00:0{i}:00\t{i}.0\n"));
            if i % 2 == 0 {
                append(&path, "\r\n");
            }
            seen.extend(stream.poll().unwrap().records.into_iter().map(|r| r.offset));
        }
        assert_eq!(seen.len(), 5);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn no_records_before_header() {
        let (_dir, path, mut stream) = stream();
        append(&path, "\n\n");
        let poll = stream.poll().unwrap();
        assert!(poll.header.is_none());
        assert!(poll.records.is_empty());
        assert!(stream.header().is_none());
    }

    #[test]
    fn header_labels_are_trimmed() {
        let (_dir, path, mut stream) = stream();
        append(&path, "\u{feff}Glucose, Xylose, Itaconic Acid\r\n");
        let header = stream.poll().unwrap().header.unwrap();
        assert_eq!(header.labels, vec!["Glucose", "Xylose", "Itaconic Acid"]);
    }

    #[test]
    fn us_twelve_hour_timestamps() {
        let ts = parse_timestamp("01/31/2024", "01:02:03 PM").unwrap();
        assert_eq!(
            ts,
            NaiveDate::from_ymd_opt(2024, 1, 31)
                .unwrap()
                .and_hms_opt(13, 2, 3)
                .unwrap()
        );
        assert!(parse_timestamp("2024-13-01", "00:00:00").is_none());
    }

    #[test]
    fn bad_timestamp_and_value_are_reported() {
        let (_dir, path, mut stream) = stream();
        append(
            &path,
            "A\n\
             x\tyesterday\tnoon\t1.0\n\
             x\t2024-01-01\t00:00:00\tabc\n\
             only\ttwo\n",
        );
        let poll = stream.poll().unwrap();
        assert!(poll.records.is_empty());
        assert!(matches!(poll.errors[0], StreamFormatError::Timestamp { .. }));
        assert!(matches!(poll.errors[1], StreamFormatError::Value { .. }));
        assert!(matches!(
            poll.errors[2],
            StreamFormatError::FieldCount { found: 2, .. }
        ));
        assert!(poll.errors.windows(2).all(|w| w[0].offset() < w[1].offset()));
    }

    #[test]
    fn empty_value_cell_is_rejected() {
        let (_dir, path, mut stream) = stream();
        append(
            &path,
            "Glucose,Xylose,Lactate
             gap.txt	2024-01-01	00:00:00	1.2,,0.4
             tail.txt	2024-01-01	00:01:00	1.2,0.4,
             ok.txt	2024-01-01	00:02:00	1.2,0.3,0.4
",
        );

        let poll = stream.poll().unwrap();

        assert_eq!(poll.errors.len(), 2);
        assert!(poll
            .errors
            .iter()
            .all(|e| matches!(e, StreamFormatError::Value { raw, .. } if raw.is_empty())));
        assert_eq!(poll.records.len(), 1);
        assert_eq!(poll.records[0].values, vec![1.2, 0.3, 0.4]);
    }

    #[test]
    fn backlog_is_consumed_without_emitting_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("AutoSave.txt");
        append(
            &path,
            "Glucose
             old1.txt	2024-01-01	00:00:00	1.0
             old2.txt	2024-01-01	00:01:00	2.0
",
        );
        let mut stream = PredictionStream::new(&path).skip_backlog(true);

        let first = stream.poll().unwrap();
        assert_eq!(first.header.unwrap().labels, vec!["Glucose"]);
        assert!(first.records.is_empty());
        assert_eq!(stream.stats().backlog_skipped, 2);
        assert_eq!(stream.stats().records_emitted, 0);

        append(&path, "new.txt	2024-01-01	00:02:00	3.0
");
        let second = stream.poll().unwrap();
        assert_eq!(second.records.len(), 1);
        assert_eq!(second.records[0].source_name, "new.txt");
    }

    #[test]
    fn backlog_skip_ignores_a_file_created_later() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("AutoSave.txt");
        let mut stream = PredictionStream::new(&path).skip_backlog(true);
        assert!(stream.poll().unwrap().is_empty());

        append(&path, "Glucose
first.txt	2024-01-01	00:00:00	1.0
");
        let poll = stream.poll().unwrap();

        assert_eq!(poll.records.len(), 1);
        assert_eq!(stream.stats().backlog_skipped, 0);
    }

    #[test]
    fn shrinking_file_holds_cursor() {
        let (_dir, path, mut stream) = stream();
        append(&path, "A\nx\t2024-01-01\t00:00:00\t1.0\n");
        stream.poll().unwrap();
        let cursor = stream.cursor();

        std::fs::write(&path, "A\n").unwrap();
        assert!(stream.poll().unwrap().is_empty());
        assert_eq!(stream.cursor(), cursor);
    }
}
