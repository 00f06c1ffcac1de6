//! Data acquisition module
//!
//! Handles both file-based inputs of the control loop: raw spectra dropped by
//! the spectrometer (reformatted for the prediction engine) and the engine's
//! growing prediction file.

pub mod prediction_stream;
pub mod raw_watcher;
pub mod spectrum;

pub use prediction_stream::{PredictionStream, StreamFormatError, StreamPoll, StreamStats};
pub use raw_watcher::RawSpectrumWatcher;
pub use spectrum::{SpectrumError, SpectrumLayout, SpectrumOutputFormat, SpectrumReformatter};
