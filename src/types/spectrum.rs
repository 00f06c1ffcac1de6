//! Raw spectrometer data

use std::path::PathBuf;

/// One spectrum read from a raw spectrometer export.
///
/// Built once per newly observed source file and consumed by the
/// reformatter to produce exactly one engine input file.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSpectrum {
    /// File the spectrum was read from
    pub source: PathBuf,
    /// Placeholder sample identifier used for the reformatted output
    pub sample_id: String,
    /// (Raman shift in cm⁻¹, dark-subtracted intensity) pairs in file order
    pub points: Vec<(f64, f64)>,
}

impl RawSpectrum {
    /// Number of spectral samples.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Raman shift axis.
    pub fn shifts(&self) -> impl Iterator<Item = f64> + '_ {
        self.points.iter().map(|(shift, _)| *shift)
    }

    /// Dark-subtracted intensities.
    pub fn intensities(&self) -> impl Iterator<Item = f64> + '_ {
        self.points.iter().map(|(_, intensity)| *intensity)
    }
}
