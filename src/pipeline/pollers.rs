//! File pollers
//!
//! Two interval loops feed the pipeline: one tails the prediction file and
//! forwards new lines to the pump worker, the other reformats raw spectra
//! for the prediction engine. Both stop on cancellation.

use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::worker::OperatorHandle;
use crate::acquisition::{PredictionStream, RawSpectrumWatcher, SpectrumReformatter};

// ============================================================================
// Prediction Poller
// ============================================================================

pub struct PredictionPoller {
    stream: PredictionStream,
    handle: OperatorHandle,
    period: Duration,
}

impl PredictionPoller {
    pub fn new(stream: PredictionStream, handle: OperatorHandle, period: Duration) -> Self {
        Self {
            stream,
            handle,
            period,
        }
    }

    /// Poll once and forward anything new. Returns false once the worker is gone.
    pub async fn tick(&mut self) -> bool {
        let poll = match self.stream.poll() {
            Ok(poll) => poll,
            Err(e) => {
                warn!(path = %self.stream.path().display(), error = %e, "Prediction file read failed");
                return true;
            }
        };

        for err in &poll.errors {
            warn!(path = %self.stream.path().display(), error = %err, "Prediction line skipped");
        }
        if poll.header.is_none() && poll.records.is_empty() {
            return true;
        }

        debug!(records = poll.records.len(), cursor = self.stream.cursor(), "New predictions");
        if self.handle.submit(poll).await.is_err() {
            debug!("Pump worker gone, prediction poller stopping");
            return false;
        }
        true
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!(path = %self.stream.path().display(), "Prediction poller started");
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !self.tick().await {
                break;
            }
        }

        let stats = self.stream.stats();
        info!(?stats, "Prediction poller stopped");
    }
}

// ============================================================================
// Spectrum Poller
// ============================================================================

pub struct SpectrumPoller {
    watcher: RawSpectrumWatcher,
    reformatter: SpectrumReformatter,
    period: Duration,
    reformatted: u64,
}

impl SpectrumPoller {
    pub fn new(watcher: RawSpectrumWatcher, reformatter: SpectrumReformatter, period: Duration) -> Self {
        Self {
            watcher,
            reformatter,
            period,
            reformatted: 0,
        }
    }

    /// Rescan once and reformat the next settled file, if any. Returns
    /// whether an output file was written.
    ///
    /// Each call is one settle poll for the watcher, so at most one file is
    /// handled per tick. A file that fails to reformat is logged and not retried.
    pub async fn tick(&mut self) -> bool {
        let source = match self.watcher.poll_next() {
            Ok(Some(path)) => path,
            Ok(None) => return false,
            Err(e) => {
                warn!(dir = %self.watcher.dir().display(), error = %e, "Raw spectrum scan failed");
                return false;
            }
        };

        if self.reformatter.is_reformatted(&source) {
            debug!(path = %source.display(), "Already reformatted, skipping");
            return false;
        }

        let reformatter = self.reformatter.clone();
        let job = source.clone();
        match tokio::task::spawn_blocking(move || reformatter.reformat(&job)).await {
            Ok(Ok(_)) => {
                self.reformatted += 1;
                true
            }
            Ok(Err(e)) => {
                warn!(path = %source.display(), error = %e, "Spectrum not reformatted");
                false
            }
            Err(e) => {
                warn!(path = %source.display(), error = %e, "Reformat task failed");
                false
            }
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            dir = %self.watcher.dir().display(),
            output = %self.reformatter.output_dir().display(),
            "Spectrum poller started"
        );
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.tick().await;
        }

        info!(reformatted = self.reformatted, "Spectrum poller stopped");
    }
}
