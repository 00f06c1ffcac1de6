//! Control Loop Integration Tests
//!
//! Drives the whole loop in-process: a prediction file on disk is tailed by
//! the prediction poller, handed to the pump worker and dispensed on a
//! simulated pump, with every record landing in the audit log.

use chrono::Local;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use raman_pid::acquisition::PredictionStream;
use raman_pid::clock::ElapsedTimeClock;
use raman_pid::control::PidConfigStore;
use raman_pid::pipeline::{
    ControlOrchestrator, ControlState, OperatorHandle, OrchestratorSettings, PredictionPoller,
    PumpWorker,
};
use raman_pid::pump::{SimulatedPump, SimulatedPumpHandle};
use raman_pid::storage::{AuditLog, AuditMode};
use raman_pid::types::{Direction, PidConfig, PumpConfigDraft, TrackedValue};

const HEADER: &str = "Glucose,Lactate\n";

fn line(minute: u32, glucose: f64) -> String {
    format!("scan_{minute}.txt\t2024-05-01\t09:{minute:02}:00\t{glucose},1.5\n")
}

fn append(path: &Path, text: &str) {
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    f.write_all(text.as_bytes()).unwrap();
}

fn pid() -> PidConfig {
    PidConfig {
        setpoint: 10.0,
        kp: 0.1,
        ki: 0.0,
        kd: 0.0,
        output_min: 0.0,
        output_max: 0.5,
        max_cumulative_volume: 100.0,
        proportional_on_measurement: false,
        tracked: TrackedValue::Label("Glucose".to_string()),
    }
}

fn draft() -> PumpConfigDraft {
    PumpConfigDraft {
        port: Some("SIM0".to_string()),
        volume_per_rev: Some(0.5),
        speed_rpm: Some(50.0),
        direction: Some(Direction::Clockwise),
    }
}

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

struct Loop {
    handle: OperatorHandle,
    pump: SimulatedPumpHandle,
    cancel: CancellationToken,
    worker: JoinHandle<ControlOrchestrator>,
    poller: PredictionPoller,
}

async fn build_orchestrator(
    data_dir: &Path,
    dispense_timeout: Duration,
) -> (ControlOrchestrator, SimulatedPumpHandle, Arc<ElapsedTimeClock>) {
    let clock = Arc::new(ElapsedTimeClock::new());
    let audit = AuditLog::open(
        data_dir,
        "audit.csv",
        AuditMode::Append,
        Local::now().naive_local(),
    )
    .unwrap();
    let store = Arc::new(PidConfigStore::new(pid()).unwrap());
    let mut orchestrator = ControlOrchestrator::new(
        store,
        clock.clone(),
        audit,
        OrchestratorSettings {
            dispense_timeout,
            start_enabled: true,
            ..OrchestratorSettings::default()
        },
    );
    let (sim, pump) = SimulatedPump::new("feed", &["SIM0"]);
    orchestrator.add_pump(Box::new(sim)).unwrap();
    orchestrator.configure_pump("feed", &draft()).unwrap();
    orchestrator.connect("feed", None).await.unwrap();
    (orchestrator, pump, clock)
}

async fn start_loop(dir: &TempDir, predictions: PathBuf, dispense_timeout: Duration) -> Loop {
    start_loop_on(dir, PredictionStream::new(predictions), dispense_timeout).await
}

async fn start_loop_on(dir: &TempDir, stream: PredictionStream, dispense_timeout: Duration) -> Loop {
    let (orchestrator, pump, clock) = build_orchestrator(dir.path(), dispense_timeout).await;
    let cancel = CancellationToken::new();
    let (worker, handle) = PumpWorker::new(orchestrator, clock, 16, cancel.clone());
    let worker = tokio::spawn(worker.run());
    let poller = PredictionPoller::new(
        stream,
        handle.clone(),
        Duration::from_secs(1),
    );
    Loop {
        handle,
        pump,
        cancel,
        worker,
        poller,
    }
}

fn audit_lines(dir: &TempDir) -> Vec<String> {
    fs::read_to_string(dir.path().join("audit.csv"))
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn predictions_on_disk_drive_the_pump() {
    let dir = TempDir::new().unwrap();
    let predictions = dir.path().join("AutoSave.txt");
    append(&predictions, &format!("{HEADER}{}{}", line(1, 8.0), line(2, 6.0)));

    let mut lp = start_loop(&dir, predictions.clone(), Duration::from_secs(1)).await;
    assert!(lp.poller.tick().await);

    let status = lp.handle.status().await.unwrap();
    assert_eq!(status.state, ControlState::Active);
    assert_eq!(status.records_processed, 2);
    assert_eq!(lp.pump.dispensed(), vec![0.2, 0.4]);

    // Only the appended line is read on the next poll
    append(&predictions, &line(3, 9.0));
    assert!(lp.poller.tick().await);
    let status = lp.handle.status().await.unwrap();
    assert_eq!(status.records_processed, 3);
    assert!(approx(status.pumps[0].cumulative_dispensed, 0.7));

    lp.cancel.cancel();
    let orchestrator = lp.worker.await.unwrap();
    assert!(orchestrator.state().is_stopped());

    let rows = audit_lines(&dir);
    assert_eq!(rows.len(), 4);
    assert!(rows[1].contains(",feed,dispensed,"));
    assert!(rows[3].contains(",9,"));
}

#[tokio::test]
async fn cumulative_volume_survives_restart() {
    let dir = TempDir::new().unwrap();
    let predictions = dir.path().join("AutoSave.txt");
    append(&predictions, &format!("{HEADER}{}", line(1, 5.0)));

    let mut lp = start_loop(&dir, predictions, Duration::from_secs(1)).await;
    lp.poller.tick().await;
    lp.handle.status().await.unwrap();
    lp.cancel.cancel();
    lp.worker.await.unwrap();

    let (orchestrator, _pump, _clock) = build_orchestrator(dir.path(), Duration::from_secs(1)).await;
    let status = orchestrator.status();
    assert!(approx(status.pumps[0].cumulative_dispensed, 0.5));
}

async fn first_run(dir: &TempDir, predictions: &Path) {
    append(predictions, &format!("{HEADER}{}{}", line(1, 8.0), line(2, 6.0)));
    let mut lp = start_loop(dir, predictions.to_path_buf(), Duration::from_secs(1)).await;
    lp.poller.tick().await;
    assert_eq!(lp.pump.dispensed(), vec![0.2, 0.4]);
    lp.cancel.cancel();
    lp.worker.await.unwrap();
}

#[tokio::test]
async fn restart_starts_after_the_existing_predictions() {
    let dir = TempDir::new().unwrap();
    let predictions = dir.path().join("AutoSave.txt");
    first_run(&dir, &predictions).await;

    let stream = PredictionStream::new(&predictions).skip_backlog(true);
    let mut lp = start_loop_on(&dir, stream, Duration::from_secs(1)).await;
    lp.poller.tick().await;
    let status = lp.handle.status().await.unwrap();
    assert_eq!(status.records_processed, 0);
    assert_eq!(status.tracked.as_deref(), Some("Glucose"));
    assert!(lp.pump.dispensed().is_empty());

    append(&predictions, &line(3, 9.0));
    lp.poller.tick().await;
    let status = lp.handle.status().await.unwrap();
    assert_eq!(lp.pump.dispensed(), vec![0.1]);
    assert!(approx(status.pumps[0].cumulative_dispensed, 0.7));

    lp.cancel.cancel();
    lp.worker.await.unwrap();
    assert_eq!(audit_lines(&dir).len(), 4);
}

#[tokio::test]
async fn replayed_file_does_not_dispense_audited_records_twice() {
    let dir = TempDir::new().unwrap();
    let predictions = dir.path().join("AutoSave.txt");
    first_run(&dir, &predictions).await;

    let mut lp = start_loop(&dir, predictions.clone(), Duration::from_secs(1)).await;
    lp.poller.tick().await;
    let status = lp.handle.status().await.unwrap();
    assert_eq!(status.records_processed, 0);
    assert!(lp.pump.dispensed().is_empty());

    append(&predictions, &line(3, 9.0));
    lp.poller.tick().await;
    assert_eq!(lp.pump.dispensed(), vec![0.1]);

    lp.cancel.cancel();
    lp.worker.await.unwrap();
    let rows = audit_lines(&dir);
    assert_eq!(rows.len(), 4);
    assert_eq!(rows.iter().filter(|r| r.starts_with("2024-05-01 09:02:00")).count(), 1);
}

#[tokio::test]
async fn stalled_pump_faults_and_operator_reconnect_recovers() {
    let dir = TempDir::new().unwrap();
    let predictions = dir.path().join("AutoSave.txt");
    append(&predictions, &format!("{HEADER}{}", line(1, 8.0)));

    let mut lp = start_loop(&dir, predictions.clone(), Duration::from_millis(50)).await;
    lp.pump.hang_next_dispense();
    lp.poller.tick().await;

    let status = lp.handle.status().await.unwrap();
    assert!(status.state.is_faulted());
    assert_eq!(status.pumps[0].cumulative_dispensed, 0.2);

    append(&predictions, &line(2, 8.0));
    lp.poller.tick().await;
    assert!(lp.pump.dispensed().is_empty());

    lp.handle.connect("feed", None).await.unwrap();
    append(&predictions, &line(3, 8.0));
    lp.poller.tick().await;
    let status = lp.handle.status().await.unwrap();
    assert_eq!(status.state, ControlState::Active);
    assert_eq!(lp.pump.dispensed(), vec![0.2]);

    lp.cancel.cancel();
    lp.worker.await.unwrap();

    let rows = audit_lines(&dir);
    assert_eq!(rows.len(), 4);
    assert!(rows[1].contains("failed: "));
    assert!(rows[2].contains("skipped: faulted"));
    assert!(rows[3].contains("dispensed"));
}

#[tokio::test]
async fn malformed_lines_are_skipped_without_audit_rows() {
    let dir = TempDir::new().unwrap();
    let predictions = dir.path().join("AutoSave.txt");
    append(
        &predictions,
        &format!("{HEADER}garbage line\n{}scan_x\tnot-a-date\t09:00:00\t1,2\n", line(1, 8.0)),
    );

    let mut lp = start_loop(&dir, predictions, Duration::from_secs(1)).await;
    lp.poller.tick().await;

    let status = lp.handle.status().await.unwrap();
    assert_eq!(status.records_processed, 1);

    lp.cancel.cancel();
    lp.worker.await.unwrap();
    assert_eq!(audit_lines(&dir).len(), 2);
}

#[tokio::test]
async fn disabling_control_still_audits_every_record() {
    let dir = TempDir::new().unwrap();
    let predictions = dir.path().join("AutoSave.txt");
    append(&predictions, HEADER);

    let mut lp = start_loop(&dir, predictions.clone(), Duration::from_secs(1)).await;
    lp.poller.tick().await;
    lp.handle.set_enabled(false).await.unwrap();

    append(&predictions, &format!("{}{}", line(1, 2.0), line(2, 3.0)));
    lp.poller.tick().await;
    let status = lp.handle.status().await.unwrap();
    assert!(!status.enabled);
    assert_eq!(status.records_processed, 2);
    assert!(lp.pump.dispensed().is_empty());

    lp.cancel.cancel();
    lp.worker.await.unwrap();
    let rows = audit_lines(&dir);
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[1].split(',').nth(2), Some("Disabled"));
    assert!(rows[2].contains("skipped: disabled"));
}
