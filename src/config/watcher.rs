//! Polling-based config file watcher.
//!
//! Checks the config file's mtime on an interval. When a change is detected,
//! debounces for 500ms (editors often write in stages), reloads and
//! validates the file, and sends what changed via an mpsc channel. Only the
//! `[pid]` section is applied live; other sections are reported as needing
//! a restart.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{ControlConfig, PidSection};

/// Events emitted by the config watcher.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigEvent {
    /// File reloaded and valid.
    Reloaded {
        /// New `[pid]` section, present only when it changed
        pid: Option<PidSection>,
        /// Changed sections that take effect on the next start
        restart_required: Vec<&'static str>,
    },
    /// Reload failed; the previous config stays in force.
    Error(String),
}

/// Debounce delay after detecting a change.
const DEBOUNCE_DELAY: Duration = Duration::from_millis(500);

pub struct ConfigWatcher {
    path: PathBuf,
    interval: Duration,
    current: ControlConfig,
}

impl ConfigWatcher {
    /// Watch `path`, diffing reloads against `current` (the config in force).
    pub fn new(path: PathBuf, interval: Duration, current: ControlConfig) -> Self {
        Self {
            path,
            interval,
            current,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file now. On success the reloaded config becomes the
    /// baseline for the next diff.
    pub fn reload(&mut self) -> ConfigEvent {
        match ControlConfig::load_from_file(&self.path) {
            Ok(next) => {
                let pid = (next.pid != self.current.pid).then(|| next.pid.clone());
                let restart_required = next.restart_required_changes(&self.current);
                self.current = next;
                ConfigEvent::Reloaded {
                    pid,
                    restart_required,
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Config hot-reload failed, keeping previous config");
                ConfigEvent::Error(e.to_string())
            }
        }
    }

    /// Poll until `cancel` fires or the receiver goes away.
    pub async fn run(mut self, tx: mpsc::Sender<ConfigEvent>, cancel: CancellationToken) {
        tracing::info!(path = %self.path.display(), "Config watcher started");

        let mut last_mtime = get_mtime(&self.path);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.interval) => {}
            }

            let Some(current) = get_mtime(&self.path) else {
                if last_mtime.is_some() {
                    tracing::warn!(
                        path = %self.path.display(),
                        "Config file not accessible, keeping current config"
                    );
                    last_mtime = None;
                }
                continue;
            };

            if last_mtime == Some(current) {
                continue;
            }

            tokio::time::sleep(DEBOUNCE_DELAY).await;
            if get_mtime(&self.path) != Some(current) {
                // Still being written; pick it up next cycle
                continue;
            }
            last_mtime = Some(current);

            let event = self.reload();
            if matches!(
                &event,
                ConfigEvent::Reloaded { pid: None, restart_required } if restart_required.is_empty()
            ) {
                tracing::debug!("Config file touched without changes");
                continue;
            }
            if tx.send(event).await.is_err() {
                tracing::debug!("Config watcher channel closed, stopping");
                break;
            }
        }

        tracing::info!("Config watcher stopped");
    }
}

/// Read the modification time of a file, returning None on any error.
fn get_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok().and_then(|m| m.modified().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn pid_change_is_applied_live() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raman_pid.toml");
        fs::write(&path, "[pid]\nsetpoint = 10.0\n").unwrap();
        let initial = ControlConfig::load_from_file(&path).unwrap();
        let mut watcher = ConfigWatcher::new(path.clone(), Duration::from_secs(1), initial);

        fs::write(&path, "[pid]\nsetpoint = 12.0\n").unwrap();
        let ConfigEvent::Reloaded {
            pid,
            restart_required,
        } = watcher.reload()
        else {
            panic!("reload failed");
        };
        assert_eq!(pid.unwrap().setpoint, 12.0);
        assert!(restart_required.is_empty());
    }

    #[test]
    fn other_sections_need_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raman_pid.toml");
        fs::write(&path, "").unwrap();
        let mut watcher =
            ConfigWatcher::new(path.clone(), Duration::from_secs(1), ControlConfig::default());

        fs::write(&path, "[polling]\nprediction_interval_ms = 250\n").unwrap();
        assert_eq!(
            watcher.reload(),
            ConfigEvent::Reloaded {
                pid: None,
                restart_required: vec!["polling"],
            }
        );
    }

    #[test]
    fn invalid_file_keeps_previous_baseline() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raman_pid.toml");
        fs::write(&path, "[pid]\noutput_min = 9.0\noutput_max = 1.0\n").unwrap();
        let mut watcher =
            ConfigWatcher::new(path.clone(), Duration::from_secs(1), ControlConfig::default());

        assert!(matches!(watcher.reload(), ConfigEvent::Error(_)));

        fs::write(&path, "[pid]\nkp = 0.5\n").unwrap();
        let ConfigEvent::Reloaded { pid, .. } = watcher.reload() else {
            panic!("reload failed");
        };
        assert_eq!(pid.unwrap().kp, 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_cancel() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raman_pid.toml");
        fs::write(&path, "").unwrap();
        let watcher = ConfigWatcher::new(path, Duration::from_secs(2), ControlConfig::default());
        let (tx, _rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(watcher.run(tx, cancel.clone()));
        cancel.cancel();
        task.await.unwrap();
    }
}
