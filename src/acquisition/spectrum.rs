//! Raw spectrum reformatter
//!
//! Turns one raw spectrometer export into the layout the prediction engine
//! reads. Raw exports are tab-separated with a fixed metadata block on top
//! (rows 1–23); spectral rows follow, with the Raman shift in column 2 and
//! the dark-subtracted intensity in column 4.
//!
//! Output is written to a temporary name and renamed into place so the
//! engine never sees a half-written file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::defaults;
use crate::types::RawSpectrum;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum SpectrumError {
    /// Data region too short, missing columns or non-numeric cells
    #[error("malformed spectrum {}: {reason}", .path.display())]
    MalformedSpectrum { path: PathBuf, reason: String },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl SpectrumError {
    fn malformed(path: &Path, reason: impl Into<String>) -> Self {
        Self::MalformedSpectrum {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

// ============================================================================
// Layout
// ============================================================================

/// File layout written for the prediction engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SpectrumOutputFormat {
    /// Tab-separated `shift<TAB>intensity` rows, `.txt`
    #[default]
    TwoColumn,
    /// InStep `.dat` block: `#d`, `#c` shift axis and `#s` sample row
    Instep,
}

impl SpectrumOutputFormat {
    fn extension(self) -> &'static str {
        match self {
            Self::TwoColumn => "txt",
            Self::Instep => "dat",
        }
    }
}

/// Where the spectral data sits inside a raw export. Rows and columns are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectrumLayout {
    pub data_start_row: usize,
    pub shift_column: usize,
    pub intensity_column: usize,
    /// Fewer data rows than this is malformed
    pub min_points: usize,
}

impl Default for SpectrumLayout {
    fn default() -> Self {
        Self {
            data_start_row: defaults::SPECTRUM_DATA_START_ROW,
            shift_column: defaults::SPECTRUM_SHIFT_COLUMN,
            intensity_column: defaults::SPECTRUM_INTENSITY_COLUMN,
            min_points: 1,
        }
    }
}

// ============================================================================
// Reformatter
// ============================================================================

#[derive(Debug, Clone)]
pub struct SpectrumReformatter {
    output_dir: PathBuf,
    layout: SpectrumLayout,
    format: SpectrumOutputFormat,
}

impl SpectrumReformatter {
    pub fn new(
        output_dir: impl Into<PathBuf>,
        layout: SpectrumLayout,
        format: SpectrumOutputFormat,
    ) -> Self {
        Self {
            output_dir: output_dir.into(),
            layout,
            format,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Placeholder sample id derived from the source file name.
    pub fn sample_id(source: &Path) -> String {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "spectrum".to_string());
        format!("{stem}{}", defaults::SAMPLE_ID_SUFFIX)
    }

    /// Where the reformatted version of `source` is written.
    pub fn output_path(&self, source: &Path) -> PathBuf {
        self.output_dir.join(format!(
            "{}.{}",
            Self::sample_id(source),
            self.format.extension()
        ))
    }

    /// True if `source` already has a reformatted output.
    pub fn is_reformatted(&self, source: &Path) -> bool {
        self.output_path(source).exists()
    }

    /// Read and validate a raw export.
    pub fn read(&self, source: &Path) -> Result<RawSpectrum, SpectrumError> {
        let text = fs::read_to_string(source).map_err(|e| SpectrumError::io(source, e))?;
        self.parse(source, &text)
    }

    fn parse(&self, source: &Path, text: &str) -> Result<RawSpectrum, SpectrumError> {
        let layout = &self.layout;
        let shift_idx = layout.shift_column.saturating_sub(1);
        let intensity_idx = layout.intensity_column.saturating_sub(1);
        let skip = layout.data_start_row.saturating_sub(1);

        let mut lines = text.lines();
        let header_rows = lines.by_ref().take(skip).count();
        if header_rows < skip {
            return Err(SpectrumError::malformed(
                source,
                format!("only {header_rows} rows, data expected from row {}", layout.data_start_row),
            ));
        }

        let mut points = Vec::new();
        for (i, line) in lines.enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let row = layout.data_start_row + i;
            let cells: Vec<&str> = line.split('\t').collect();
            let cell = |idx: usize, name: &str| -> Result<f64, SpectrumError> {
                let raw = cells.get(idx).ok_or_else(|| {
                    SpectrumError::malformed(
                        source,
                        format!("row {row}: missing {name} column {}", idx + 1),
                    )
                })?;
                raw.trim().parse::<f64>().map_err(|_| {
                    SpectrumError::malformed(
                        source,
                        format!("row {row}: {name} '{}' is not numeric", raw.trim()),
                    )
                })
            };
            points.push((cell(shift_idx, "shift")?, cell(intensity_idx, "intensity")?));
        }

        if points.len() < layout.min_points.max(1) {
            return Err(SpectrumError::malformed(
                source,
                format!(
                    "data region has {} rows, expected at least {}",
                    points.len(),
                    layout.min_points.max(1)
                ),
            ));
        }

        Ok(RawSpectrum {
            source: source.to_path_buf(),
            sample_id: Self::sample_id(source),
            points,
        })
    }

    /// Write a parsed spectrum and return the output path.
    pub fn write(&self, spectrum: &RawSpectrum) -> Result<PathBuf, SpectrumError> {
        fs::create_dir_all(&self.output_dir).map_err(|e| SpectrumError::io(&self.output_dir, e))?;

        let target = self.output_path(&spectrum.source);
        let staging = target.with_extension("partial");
        let body = match self.format {
            SpectrumOutputFormat::TwoColumn => render_two_column(spectrum),
            SpectrumOutputFormat::Instep => render_instep(spectrum),
        };

        let mut file = fs::File::create(&staging).map_err(|e| SpectrumError::io(&staging, e))?;
        file.write_all(body.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|e| SpectrumError::io(&staging, e))?;
        drop(file);
        fs::rename(&staging, &target).map_err(|e| SpectrumError::io(&target, e))?;

        debug!(path = %target.display(), points = spectrum.len(), "Spectrum written");
        Ok(target)
    }

    /// Read `source` and write its reformatted version.
    pub fn reformat(&self, source: &Path) -> Result<PathBuf, SpectrumError> {
        let spectrum = self.read(source)?;
        let target = self.write(&spectrum)?;
        info!(
            source = %source.display(),
            output = %target.display(),
            sample = %spectrum.sample_id,
            points = spectrum.len(),
            "Spectrum reformatted"
        );
        Ok(target)
    }
}

fn render_two_column(spectrum: &RawSpectrum) -> String {
    let mut out = String::with_capacity(spectrum.len() * 24);
    for (shift, intensity) in &spectrum.points {
        out.push_str(&format!("{shift}\t{intensity}\n"));
    }
    out
}

fn render_instep(spectrum: &RawSpectrum) -> String {
    format!(
        "#d, {}x1\n#c, {}\n#s, S1, {}\n",
        spectrum.len(),
        join_fixed(spectrum.shifts()),
        join_fixed(spectrum.intensities()),
    )
}

fn join_fixed(values: impl Iterator<Item = f64>) -> String {
    values
        .map(|v| format!("{v:.4}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn raw_export(rows: &[(&str, &str)]) -> String {
        let mut text = String::new();
        for i in 1..=23 {
            text.push_str(&format!("Meta{i}\tvalue\n"));
        }
        for (shift, intensity) in rows {
            text.push_str(&format!("0\t{shift}\t999\t{intensity}\t7\n"));
        }
        text
    }

    fn reformatter(dir: &TempDir, format: SpectrumOutputFormat) -> SpectrumReformatter {
        SpectrumReformatter::new(dir.path().join("Output"), SpectrumLayout::default(), format)
    }

    #[test]
    fn extracts_shift_and_dark_subtracted_columns() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("scan_001.txt");
        fs::write(&src, raw_export(&[("200.5", "10"), ("201.0", "12.5")])).unwrap();

        let out = reformatter(&dir, SpectrumOutputFormat::TwoColumn)
            .reformat(&src)
            .unwrap();

        assert_eq!(out, dir.path().join("Output").join("scan_001_proc.txt"));
        assert_eq!(fs::read_to_string(out).unwrap(), "200.5\t10\n201\t12.5\n");
    }

    #[test]
    fn instep_layout() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("scan.txt");
        fs::write(&src, raw_export(&[("200", "1"), ("201", "2")])).unwrap();

        let out = reformatter(&dir, SpectrumOutputFormat::Instep)
            .reformat(&src)
            .unwrap();

        assert_eq!(out.extension().unwrap(), "dat");
        assert_eq!(
            fs::read_to_string(out).unwrap(),
            "#d, 2x1\n#c, 200.0000,201.0000\n#s, S1, 1.0000,2.0000\n"
        );
    }

    #[test]
    fn short_file_is_malformed() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("short.txt");
        fs::write(&src, "only\nthree\nrows\n").unwrap();

        let err = reformatter(&dir, SpectrumOutputFormat::TwoColumn)
            .reformat(&src)
            .unwrap_err();
        assert!(matches!(err, SpectrumError::MalformedSpectrum { .. }));
    }

    #[test]
    fn empty_data_region_is_malformed() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("empty.txt");
        fs::write(&src, raw_export(&[])).unwrap();

        let err = reformatter(&dir, SpectrumOutputFormat::TwoColumn)
            .read(&src)
            .unwrap_err();
        assert!(err.to_string().contains("0 rows"));
    }

    #[test]
    fn non_numeric_cell_is_malformed_and_nothing_written() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("bad.txt");
        fs::write(&src, raw_export(&[("200", "1"), ("abc", "2")])).unwrap();
        let r = reformatter(&dir, SpectrumOutputFormat::TwoColumn);

        let err = r.reformat(&src).unwrap_err();

        assert!(err.to_string().contains("row 25"));
        assert!(!r.is_reformatted(&src));
    }

    #[test]
    fn sample_id_differs_from_source_name() {
        let id = SpectrumReformatter::sample_id(Path::new("/raw/20240101_0800.txt"));
        assert_eq!(id, "20240101_0800_proc");
    }
}
