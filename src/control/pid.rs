//! PID Controller
//!
//! Maps the tracked prediction to a bounded dose per tick. Each tick:
//!
//! 1. P, I and D terms from the measurement and the time since the last tick
//! 2. Output rounded to the pump resolution and clamped to `[output_min, output_max]`
//! 3. Output reduced to what remains under `max_cumulative_volume` (cap-limited)
//! 4. Cumulative volume advanced by exactly the final output
//!
//! In proportional-on-measurement mode the proportional term accumulates
//! `-kp * Δmeasurement` and the derivative acts on measurement, so setpoint
//! changes do not kick the output. The integral always integrates error and is
//! clamped to the output limits to prevent windup.

use arc_swap::ArcSwap;
use chrono::NaiveDateTime;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

use super::ControlError;
use crate::config::defaults::PID_OUTPUT_RESOLUTION;
use crate::types::{DispenseDecision, PidConfig, PidState, ResolvedTracking, TrackedValue};

// ============================================================================
// Configuration Store
// ============================================================================

/// Live PID configuration shared between the operator, the config watcher and
/// the controllers.
///
/// Replacement is whole-config only and validated first. Ticks take a single
/// snapshot with [`PidConfigStore::load`], so a swap never lands mid-tick.
#[derive(Debug)]
pub struct PidConfigStore {
    current: ArcSwap<PidConfig>,
    tracking_lock: OnceLock<TrackedValue>,
}

impl PidConfigStore {
    pub fn new(config: PidConfig) -> Result<Self, ControlError> {
        let errors = config.validation_errors();
        if !errors.is_empty() {
            return Err(ControlError::InvalidConfig(errors));
        }
        Ok(Self {
            current: ArcSwap::from_pointee(config),
            tracking_lock: OnceLock::new(),
        })
    }

    /// Snapshot of the active configuration.
    pub fn load(&self) -> Arc<PidConfig> {
        self.current.load_full()
    }

    /// Swap in a complete new configuration.
    ///
    /// Rejected when invalid, or when it retargets a loop whose tracked
    /// identifier has already been resolved for this run.
    pub fn replace(&self, config: PidConfig) -> Result<(), ControlError> {
        let errors = config.validation_errors();
        if !errors.is_empty() {
            warn!(errors = ?errors, "Rejected PID configuration update");
            return Err(ControlError::InvalidConfig(errors));
        }
        if let Some(locked) = self.tracking_lock.get() {
            if *locked != config.tracked {
                warn!(locked = %locked, requested = %config.tracked, "Rejected tracked identifier change");
                return Err(ControlError::TrackedIdentifierLocked {
                    locked: locked.clone(),
                    requested: config.tracked,
                });
            }
        }

        info!(
            setpoint = config.setpoint,
            kp = config.kp,
            ki = config.ki,
            kd = config.kd,
            output_min = config.output_min,
            output_max = config.output_max,
            max_cumulative_volume = config.max_cumulative_volume,
            "PID configuration replaced"
        );
        self.current.store(Arc::new(config));
        Ok(())
    }

    /// Pin the tracked identifier once the header has been resolved.
    ///
    /// Returns false if it was already pinned.
    pub fn lock_tracking(&self, tracked: TrackedValue) -> bool {
        self.tracking_lock.set(tracked).is_ok()
    }

    pub fn locked_tracking(&self) -> Option<&TrackedValue> {
        self.tracking_lock.get()
    }
}

// ============================================================================
// Controller
// ============================================================================

/// PID loop for one pump. Owns its `PidState` exclusively.
#[derive(Debug)]
pub struct PidController {
    config: Arc<PidConfigStore>,
    state: PidState,
    tracking: Option<ResolvedTracking>,
    enabled: bool,
}

impl PidController {
    pub fn new(config: Arc<PidConfigStore>, enabled: bool) -> Self {
        Self::with_state(config, PidState::default(), enabled)
    }

    /// Start from existing state, e.g. cumulative volume recovered from the audit log.
    pub fn with_state(config: Arc<PidConfigStore>, state: PidState, enabled: bool) -> Self {
        Self {
            config,
            state,
            tracking: None,
            enabled,
        }
    }

    /// Bind the loop to a resolved header column. Ticks are refused until this happens.
    pub fn bind_tracking(&mut self, tracking: ResolvedTracking) {
        debug!(index = tracking.index, label = %tracking.label, "Controller bound to tracked column");
        self.tracking = Some(tracking);
    }

    pub fn tracking(&self) -> Option<&ResolvedTracking> {
        self.tracking.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        self.tracking.is_some()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Turn automatic control on or off.
    ///
    /// Switching on clears integral and derivative memory so the loop restarts
    /// from the next measurement. Cumulative volume is kept.
    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled && !self.enabled {
            self.state = PidState::resumed(self.state.cumulative_dispensed);
        }
        if enabled != self.enabled {
            info!(enabled, "PID automatic mode changed");
        }
        self.enabled = enabled;
    }

    pub fn state(&self) -> &PidState {
        &self.state
    }

    pub fn cumulative_dispensed(&self) -> f64 {
        self.state.cumulative_dispensed
    }

    /// Run one control step for `measurement` observed at `now`.
    pub fn tick(
        &mut self,
        measurement: f64,
        now: NaiveDateTime,
    ) -> Result<DispenseDecision, ControlError> {
        self.tick_metered(measurement, now, |volume| volume)
    }

    /// Like [`tick`](Self::tick), but the capped output is passed through
    /// `meter` (the largest volume the pump can actually deliver) before it
    /// is counted. The metered output never exceeds the capped one.
    pub fn tick_metered(
        &mut self,
        measurement: f64,
        now: NaiveDateTime,
        meter: impl FnOnce(f64) -> f64,
    ) -> Result<DispenseDecision, ControlError> {
        if self.tracking.is_none() {
            return Err(ControlError::NotReady);
        }
        if !measurement.is_finite() {
            return Err(ControlError::InvalidMeasurement(measurement));
        }

        let config = self.config.load();
        let cumulative = self.state.cumulative_dispensed;

        if !self.enabled {
            return Ok(DispenseDecision {
                timestamp: now,
                measurement,
                raw_output: 0.0,
                clamped_output: 0.0,
                output: 0.0,
                cap_limited: false,
                cumulative_dispensed: cumulative,
                enabled: false,
                config,
            });
        }

        let limits = (config.output_min, config.output_max);
        let dt = self
            .state
            .last_tick
            .map(|last| (now - last).num_milliseconds() as f64 / 1000.0)
            .filter(|dt| *dt > 0.0)
            .unwrap_or(0.0);

        let error = config.setpoint - measurement;
        let d_input = measurement - self.state.last_measurement.unwrap_or(measurement);
        let d_error = error - self.state.last_error.unwrap_or(error);

        let proportional = if config.proportional_on_measurement {
            clamp(self.state.proportional - config.kp * d_input, limits)
        } else {
            config.kp * error
        };

        let integral = clamp(self.state.integral + config.ki * error * dt, limits);

        let derivative = if dt > 0.0 {
            if config.proportional_on_measurement {
                -config.kd * d_input / dt
            } else {
                config.kd * d_error / dt
            }
        } else {
            0.0
        };

        let raw_output = proportional + integral + derivative;
        let clamped_output = if raw_output.is_finite() {
            clamp(round_to_resolution(raw_output), limits)
        } else {
            config.output_min
        };

        let remaining = floor_to_resolution(config.max_cumulative_volume - cumulative);
        let (capped, cap_limited) = if clamped_output > remaining {
            (remaining, true)
        } else {
            (clamped_output, false)
        };
        let output = match meter(capped) {
            metered if metered.is_finite() => metered.max(0.0).min(capped),
            _ => 0.0,
        };
        let cumulative_dispensed =
            accumulate(cumulative, output, config.max_cumulative_volume);

        self.state = PidState {
            integral,
            proportional,
            last_measurement: Some(measurement),
            last_error: Some(error),
            cumulative_dispensed,
            last_tick: Some(now),
        };

        if cap_limited {
            warn!(
                clamped_output,
                output,
                cumulative_dispensed,
                max_cumulative_volume = config.max_cumulative_volume,
                "Dose cap-limited by cumulative volume ceiling"
            );
        }
        debug!(
            measurement,
            error,
            proportional,
            integral,
            derivative,
            raw_output,
            output,
            "PID tick"
        );

        Ok(DispenseDecision {
            timestamp: now,
            measurement,
            raw_output,
            clamped_output,
            output,
            cap_limited,
            cumulative_dispensed,
            enabled: true,
            config,
        })
    }
}

/// `cumulative + output`, never above the ceiling. Float noise within a
/// hair of the ceiling lands exactly on it.
fn accumulate(cumulative: f64, output: f64, max_cumulative_volume: f64) -> f64 {
    let ceiling = max_cumulative_volume.max(cumulative);
    let total = cumulative + output;
    if (ceiling - total).abs() < 1e-9 {
        ceiling
    } else {
        total.min(ceiling)
    }
}

fn clamp(value: f64, (lower, upper): (f64, f64)) -> f64 {
    value.max(lower).min(upper)
}

fn resolution_scale() -> f64 {
    (1.0 / PID_OUTPUT_RESOLUTION).round()
}

/// Nearest multiple of the pump resolution.
fn round_to_resolution(value: f64) -> f64 {
    let scale = resolution_scale();
    (value * scale).round() / scale
}

/// Largest multiple of the pump resolution not above `value`, never negative.
///
/// A small tolerance absorbs float error such as `10.0 - 9.8 = 0.19999999999999929`.
fn floor_to_resolution(value: f64) -> f64 {
    let scale = resolution_scale();
    ((value * scale + 1e-6).floor() / scale).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PredictionHeader, TrackedValue};
    use chrono::{Duration, NaiveDate};

    fn t0() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn p_only(kp: f64, setpoint: f64) -> PidConfig {
        PidConfig {
            setpoint,
            kp,
            ki: 0.0,
            kd: 0.0,
            output_min: 0.0,
            output_max: 0.5,
            max_cumulative_volume: 10.0,
            proportional_on_measurement: false,
            tracked: TrackedValue::Label("Glucose".to_string()),
        }
    }

    fn bound(config: PidConfig, state: PidState) -> (Arc<PidConfigStore>, PidController) {
        let store = Arc::new(PidConfigStore::new(config).unwrap());
        let mut pid = PidController::with_state(Arc::clone(&store), state, true);
        let header = PredictionHeader::new(vec!["Glucose".into(), "Xylose".into()]);
        pid.bind_tracking(header.resolve(&store.load().tracked).unwrap());
        (store, pid)
    }

    #[test]
    fn clamp_then_cap_near_ceiling() {
        let (_, mut pid) = bound(p_only(1.0, 1.0), PidState::resumed(9.8));

        let decision = pid.tick(0.4, t0()).unwrap();

        assert!((decision.raw_output - 0.6).abs() < 1e-12);
        assert_eq!(decision.clamped_output, 0.5);
        assert!((decision.output - 0.2).abs() < 1e-12);
        assert!(decision.cap_limited);
        assert_eq!(decision.cumulative_dispensed, 10.0);
        assert_eq!(pid.cumulative_dispensed(), 10.0);
    }

    #[test]
    fn cap_counts_only_what_was_dispensed() {
        let (_, mut pid) = bound(p_only(1.0, 1.0), PidState::resumed(9.805));

        let decision = pid.tick(0.4, t0()).unwrap();

        assert!(decision.cap_limited);
        assert!((decision.output - 0.19).abs() < 1e-12);
        assert!((decision.cumulative_dispensed - 9.995).abs() < 1e-12);
        assert!((pid.cumulative_dispensed() - 9.995).abs() < 1e-12);
    }

    #[test]
    fn metered_output_is_what_gets_counted() {
        let (_, mut pid) = bound(p_only(0.1, 10.0), PidState::resumed(1.0));

        // 0.2 mL requested, pump can only meter 0.18
        let decision = pid
            .tick_metered(8.0, t0(), |v| (v * 100.0 / 3.0).floor() * 3.0 / 100.0)
            .unwrap();

        assert!((decision.clamped_output - 0.2).abs() < 1e-12);
        assert!((decision.output - 0.18).abs() < 1e-12);
        assert!((decision.cumulative_dispensed - 1.18).abs() < 1e-12);
        assert!(!decision.cap_limited);
    }

    #[test]
    fn meter_cannot_raise_or_poison_the_output() {
        let (_, mut pid) = bound(p_only(0.1, 10.0), PidState::default());
        let raised = pid.tick_metered(8.0, t0(), |v| v * 2.0).unwrap();
        assert!((raised.output - 0.2).abs() < 1e-12);

        let poisoned = pid
            .tick_metered(8.0, t0() + Duration::seconds(60), |_| f64::NAN)
            .unwrap();
        assert_eq!(poisoned.output, 0.0);
        assert!((pid.cumulative_dispensed() - 0.2).abs() < 1e-12);
    }

    #[test]
    fn at_ceiling_output_is_zero() {
        let (_, mut pid) = bound(p_only(1.0, 1.0), PidState::resumed(10.0));
        let decision = pid.tick(0.0, t0()).unwrap();
        assert_eq!(decision.output, 0.0);
        assert!(decision.cap_limited);
        assert_eq!(decision.cumulative_dispensed, 10.0);
    }

    #[test]
    fn cumulative_monotone_and_bounded() {
        let mut config = p_only(0.3, 5.0);
        config.ki = 0.01;
        config.kd = 0.5;
        let (_, mut pid) = bound(config, PidState::default());

        let mut previous = 0.0;
        for i in 0..200 {
            let measurement = (f64::from(i) * 0.37).sin() * 4.0 + 3.0;
            let now = t0() + Duration::seconds(i64::from(i) * 30);
            let decision = pid.tick(measurement, now).unwrap();
            assert!(decision.output >= 0.0);
            assert!(decision.output <= 0.5);
            assert!(decision.cumulative_dispensed >= previous);
            assert!(decision.cumulative_dispensed <= 10.0);
            assert!((decision.cumulative_dispensed - previous - decision.output).abs() < 1e-9);
            previous = decision.cumulative_dispensed;
        }
        assert_eq!(previous, 10.0);
    }

    #[test]
    fn refuses_tick_before_resolution() {
        let store = Arc::new(PidConfigStore::new(p_only(1.0, 1.0)).unwrap());
        let mut pid = PidController::with_state(store, PidState::resumed(2.0), true);

        assert_eq!(pid.tick(0.4, t0()), Err(ControlError::NotReady));
        assert_eq!(pid.state(), &PidState::resumed(2.0));
    }

    #[test]
    fn non_finite_measurement_leaves_state_alone() {
        let (_, mut pid) = bound(p_only(1.0, 1.0), PidState::default());
        assert!(matches!(
            pid.tick(f64::NAN, t0()),
            Err(ControlError::InvalidMeasurement(_))
        ));
        assert_eq!(pid.state(), &PidState::default());
    }

    #[test]
    fn disabled_outputs_zero_without_mutation() {
        let (_, mut pid) = bound(p_only(1.0, 1.0), PidState::resumed(3.0));
        pid.set_enabled(false);
        let before = pid.state().clone();

        let decision = pid.tick(0.0, t0()).unwrap();

        assert!(!decision.enabled);
        assert_eq!(decision.output, 0.0);
        assert_eq!(decision.cumulative_dispensed, 3.0);
        assert_eq!(pid.state(), &before);
    }

    #[test]
    fn enabling_resets_memory_but_keeps_volume() {
        let mut config = p_only(0.1, 5.0);
        config.ki = 0.1;
        let (_, mut pid) = bound(config, PidState::default());
        pid.tick(1.0, t0()).unwrap();
        pid.tick(1.0, t0() + Duration::seconds(1)).unwrap();
        let dispensed = pid.cumulative_dispensed();
        assert!(pid.state().integral > 0.0);

        pid.set_enabled(false);
        pid.set_enabled(true);

        assert_eq!(pid.state().integral, 0.0);
        assert_eq!(pid.state().last_measurement, None);
        assert_eq!(pid.cumulative_dispensed(), dispensed);
    }

    #[test]
    fn integral_accumulates_over_record_time() {
        let mut config = p_only(0.0, 2.0);
        config.ki = 0.01;
        config.output_max = 5.0;
        config.max_cumulative_volume = 100.0;
        let (_, mut pid) = bound(config, PidState::default());

        // First tick has no elapsed time, so no integral contribution.
        let first = pid.tick(1.0, t0()).unwrap();
        assert_eq!(first.raw_output, 0.0);

        // error 1.0 over 10 s with ki 0.01 -> 0.1
        let second = pid.tick(1.0, t0() + Duration::seconds(10)).unwrap();
        assert!((second.raw_output - 0.1).abs() < 1e-12);
        assert!((pid.state().integral - 0.1).abs() < 1e-12);
    }

    #[test]
    fn integral_is_clamped_against_windup() {
        let mut config = p_only(0.0, 100.0);
        config.ki = 1.0;
        config.output_max = 0.5;
        config.max_cumulative_volume = 1_000.0;
        let (_, mut pid) = bound(config, PidState::default());

        for i in 0..10 {
            pid.tick(0.0, t0() + Duration::seconds(i * 60)).unwrap();
        }
        assert_eq!(pid.state().integral, 0.5);
    }

    #[test]
    fn proportional_on_measurement_ignores_setpoint_step() {
        let mut config = p_only(0.1, 10.0);
        config.proportional_on_measurement = true;
        config.output_min = 0.0;
        config.output_max = 5.0;
        config.max_cumulative_volume = 100.0;
        let (store, mut pid) = bound(config.clone(), PidState::default());

        let first = pid.tick(5.0, t0()).unwrap();
        assert_eq!(first.raw_output, 0.0);

        // Setpoint jump produces no proportional kick.
        config.setpoint = 50.0;
        store.replace(config).unwrap();
        let second = pid.tick(5.0, t0() + Duration::seconds(1)).unwrap();
        assert_eq!(second.raw_output, 0.0);

        // A falling measurement raises the accumulated proportional term.
        let third = pid.tick(3.0, t0() + Duration::seconds(2)).unwrap();
        assert!((third.raw_output - 0.2).abs() < 1e-12);
    }

    #[test]
    fn derivative_on_error_without_pom() {
        let mut config = p_only(0.0, 10.0);
        config.kd = 2.0;
        config.output_max = 5.0;
        config.max_cumulative_volume = 100.0;
        let (_, mut pid) = bound(config, PidState::default());

        pid.tick(8.0, t0()).unwrap();
        // error 2 -> 4 over 2 s: kd * 2 / 2 = 2.0
        let decision = pid.tick(6.0, t0() + Duration::seconds(2)).unwrap();
        assert!((decision.raw_output - 2.0).abs() < 1e-12);
    }

    #[test]
    fn output_rounded_to_pump_resolution() {
        let mut config = p_only(1.0, 1.0);
        config.max_cumulative_volume = 100.0;
        let (_, mut pid) = bound(config, PidState::default());
        let decision = pid.tick(0.6666, t0()).unwrap();
        assert!((decision.clamped_output - 0.33).abs() < 1e-12);
        assert!((decision.output - 0.33).abs() < 1e-12);
    }

    #[test]
    fn tick_uses_snapshot_taken_at_start() {
        let (store, mut pid) = bound(p_only(1.0, 1.0), PidState::default());
        let decision = pid.tick(0.9, t0()).unwrap();
        assert_eq!(decision.config.setpoint, 1.0);

        let mut next = p_only(1.0, 1.2);
        next.max_cumulative_volume = 20.0;
        store.replace(next).unwrap();

        // The earlier decision still reports the configuration it ran under.
        assert_eq!(decision.config.setpoint, 1.0);
        let later = pid.tick(0.9, t0() + Duration::seconds(1)).unwrap();
        assert_eq!(later.config.setpoint, 1.2);
    }

    #[test]
    fn store_rejects_invalid_and_retargeting_configs() {
        let store = PidConfigStore::new(p_only(1.0, 1.0)).unwrap();

        let mut negative = p_only(1.0, 1.0);
        negative.output_min = -1.0;
        assert!(matches!(
            store.replace(negative),
            Err(ControlError::InvalidConfig(_))
        ));

        assert!(store.lock_tracking(TrackedValue::Label("Glucose".into())));
        assert!(!store.lock_tracking(TrackedValue::Index(1)));

        let mut retarget = p_only(1.0, 1.0);
        retarget.tracked = TrackedValue::Label("Xylose".into());
        assert!(matches!(
            store.replace(retarget),
            Err(ControlError::TrackedIdentifierLocked { .. })
        ));
        assert_eq!(store.load().setpoint, 1.0);
    }
}
