//! RF amplitude ramping with quench detection.
//!
//! The [`AmplitudeRampWorker`] walks a cavity's amplitude from a start value
//! to an end value in bounded increments, holding each level for a fixed time
//! and watching for a quench after every hold. Parameters are validated
//! before any hardware write; any violation is reported as a parameter error
//! and the run never starts.
//!
//! A detected fault is terminal for the run: the worker stops immediately,
//! attempts a safe turn-off, and reports the fault. It never retries within
//! the same run; any bounded retry policy lives in the caller. Cancellation
//! during a hold takes the identical shutdown path but is reported with a
//! distinct `Aborted` status. A secondary failure during the safety turn-off
//! is caught and downgraded to a log line so the caller always receives a
//! terminal status.

use crate::abort::POLL_INTERVAL;
use crate::cavity::Cavity;
use crate::error::{SetupError, SetupResult};
use crate::status::ProcedureStatus;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Fraction of the setpoint below which the actual amplitude means the
/// cavity quenched without latching.
pub const QUENCH_AMP_THRESHOLD: f64 = 0.7;
/// A real quench drops the loaded Q below this fraction of the reference.
pub const LOADED_Q_CHANGE_FOR_QUENCH: f64 = 0.6;
/// Bounded window for confirming a latched quench against the loaded Q.
pub const QUENCH_CONFIRM_WINDOW: Duration = Duration::from_secs(30);

/// Ramp parameters, validated before any hardware write.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RampParams {
    /// First amplitude level, MV.
    pub start_amp: f64,
    /// Final amplitude level, MV.
    pub end_amp: f64,
    /// Increment per step, MV. Must be positive.
    pub step_size: f64,
    /// Hold time at each level. Must be positive.
    pub step_time: Duration,
}

impl RampParams {
    /// Check the invariants `step_size > 0`, `step_time > 0` and
    /// `start_amp <= end_amp`.
    pub fn validate(&self) -> SetupResult<()> {
        if self.step_size <= 0.0 {
            return Err(SetupError::Configuration(
                "step size must be > 0".into(),
            ));
        }
        if self.step_time <= Duration::ZERO {
            return Err(SetupError::Configuration(
                "time between steps must be > 0".into(),
            ));
        }
        if self.start_amp > self.end_amp {
            return Err(SetupError::Configuration(
                "starting amplitude must be <= ending amplitude".into(),
            ));
        }
        Ok(())
    }

    /// Number of holds a fault-free run performs.
    pub fn expected_holds(&self) -> usize {
        ((self.end_amp - self.start_amp) / self.step_size).ceil() as usize
    }
}

/// Record of one ramp step: the driving amplitude and the sensor samples
/// accumulated while holding it. Frozen once the ramp advances.
#[derive(Debug)]
pub struct AmplitudeStep {
    amplitude: f64,
    samples: Vec<f64>,
    average: OnceLock<f64>,
}

impl AmplitudeStep {
    fn new(amplitude: f64) -> Self {
        Self {
            amplitude,
            samples: Vec::new(),
            average: OnceLock::new(),
        }
    }

    /// Driving amplitude of this step, MV.
    pub fn amplitude(&self) -> f64 {
        self.amplitude
    }

    /// Sensor samples accumulated during the hold.
    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    /// Mean of the samples, computed lazily and cached once materialized.
    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(*self.average.get_or_init(|| {
            self.samples.iter().sum::<f64>() / self.samples.len() as f64
        }))
    }
}

/// Accumulated record of one ramp run.
#[derive(Debug, Default)]
pub struct DataRun {
    steps: Vec<AmplitudeStep>,
}

impl DataRun {
    /// Frozen per-level records, in ramp order.
    pub fn steps(&self) -> &[AmplitudeStep] {
        &self.steps
    }
}

/// Terminal result of one ramp run.
#[derive(Debug)]
pub struct RampOutcome {
    /// `Complete`, `Aborted`, or `Error`.
    pub status: ProcedureStatus,
    /// Operator-facing description of how the run ended.
    pub message: String,
    /// Everything recorded before the run ended.
    pub run: DataRun,
}

/// Steps a cavity's RF amplitude from start to end, watching for quenches.
pub struct AmplitudeRampWorker<'a> {
    cavity: &'a Cavity,
    params: RampParams,
    confirm_window: Duration,
}

impl<'a> AmplitudeRampWorker<'a> {
    /// Build a worker for `cavity`. Nothing is validated or written yet.
    pub fn new(cavity: &'a Cavity, params: RampParams) -> Self {
        Self {
            cavity,
            params,
            confirm_window: QUENCH_CONFIRM_WINDOW,
        }
    }

    /// Override the latch confirmation window (defaults to
    /// [`QUENCH_CONFIRM_WINDOW`]).
    pub fn with_confirm_window(mut self, window: Duration) -> Self {
        self.confirm_window = window;
        self
    }

    /// Run the ramp to a terminal status.
    ///
    /// Every path through this function ends in exactly one terminal status:
    /// `Complete`, `Aborted` (cooperative cancellation), or `Error`
    /// (parameter error, quench, or unexpected failure). The safety turn-off
    /// runs on both failure paths; its own failures are downgraded to logs.
    pub async fn run(self) -> RampOutcome {
        let RampParams {
            start_amp,
            end_amp,
            step_size,
            step_time,
        } = self.params;
        self.cavity.emit(
            ProcedureStatus::Running,
            0,
            format!(
                "Starting {} ramp: {start_amp} -> {end_amp} MV, step={step_size} MV, wait={}s",
                self.cavity.name(),
                step_time.as_secs_f64()
            ),
        );

        if let Err(e) = self.params.validate() {
            // Parameter errors are reported before any hardware write.
            let message = format!("{}: {e}", self.cavity.name());
            self.cavity.emit(ProcedureStatus::Error, 0, message.clone());
            return RampOutcome {
                status: ProcedureStatus::Error,
                message,
                run: DataRun::default(),
            };
        }

        let mut run = DataRun::default();
        match self.ramp(&mut run).await {
            Ok(()) => {
                let message = format!("{} ramp finished at {end_amp} MV", self.cavity.name());
                self.cavity.emit(ProcedureStatus::Complete, 100, message.clone());
                RampOutcome {
                    status: ProcedureStatus::Complete,
                    message,
                    run,
                }
            }
            Err(e) if e.is_abort() => {
                self.cavity.safe_off();
                let message = format!("{} ramp aborted: {e}", self.cavity.name());
                self.cavity.emit(ProcedureStatus::Aborted, 0, message.clone());
                RampOutcome {
                    status: ProcedureStatus::Aborted,
                    message,
                    run,
                }
            }
            Err(e) => {
                self.cavity.safe_off();
                let message = format!("{}: {e}", self.cavity.name());
                self.cavity.emit(ProcedureStatus::Error, 0, message.clone());
                RampOutcome {
                    status: ProcedureStatus::Error,
                    message,
                    run,
                }
            }
        }
    }

    /// Ramp body used by the cavity setup stage, which supplies its own
    /// terminal status handling.
    pub(crate) async fn execute(&self) -> SetupResult<DataRun> {
        self.params.validate()?;
        let mut run = DataRun::default();
        self.ramp(&mut run).await?;
        Ok(run)
    }

    async fn ramp(&self, run: &mut DataRun) -> SetupResult<()> {
        let RampParams {
            start_amp,
            end_amp,
            step_size,
            step_time,
        } = self.params;

        self.cavity.abort_state().check_abort(self.cavity.name())?;
        self.cavity.set_ades(start_amp)?;

        let mut amplitude = start_amp;
        while amplitude < end_amp - f64::EPSILON {
            self.cavity.abort_state().check_abort(self.cavity.name())?;

            // No overshoot: the last level is exactly the end amplitude.
            amplitude = (amplitude + step_size).min(end_amp);
            self.cavity.set_ades(amplitude)?;
            debug!(cavity = %self.cavity.name(), amplitude, "holding ramp level");

            let mut step = AmplitudeStep::new(amplitude);
            self.hold(step_time, &mut step).await?;
            self.check_for_quench(amplitude).await?;
            run.steps.push(step);
        }
        Ok(())
    }

    /// Hold the current level, polling abort and sampling the cavity sensor
    /// every [`POLL_INTERVAL`].
    async fn hold(&self, step_time: Duration, step: &mut AmplitudeStep) -> SetupResult<()> {
        let mut remaining = step_time;
        while remaining > Duration::ZERO {
            self.cavity.abort_state().check_abort(self.cavity.name())?;
            let slice = remaining.min(POLL_INTERVAL);
            tokio::time::sleep(slice).await;
            remaining = remaining.saturating_sub(slice);
            step.samples.push(self.cavity.cavity_power()?);
        }
        Ok(())
    }

    /// Fault check after each hold.
    ///
    /// An uncaught quench (actual amplitude collapsing below the setpoint
    /// while RF is nominally on) is always real. A latched quench is
    /// confirmed against the loaded-Q drop within a bounded window; an
    /// unconfirmed latch is treated as a measurement artifact, reset, and
    /// the ramp continues.
    async fn check_for_quench(&self, amplitude: f64) -> SetupResult<()> {
        if self.cavity.is_on()? {
            let ades = self.cavity.ades()?;
            let aact = self.cavity.aact()?;
            if ades > 0.0 && aact <= QUENCH_AMP_THRESHOLD * ades {
                return Err(SetupError::Quench(format!(
                    "{} quenched at {amplitude:.1} MV (AACT {aact:.2} below {:.0}% of setpoint)",
                    self.cavity.name(),
                    QUENCH_AMP_THRESHOLD * 100.0
                )));
            }
        }

        if !self.cavity.quench_latched()? {
            return Ok(());
        }

        info!(cavity = %self.cavity.name(), amplitude, "quench latch set, validating");
        let reference = self.cavity.loaded_q_reference()?;
        let threshold = LOADED_Q_CHANGE_FOR_QUENCH * reference;
        let started = Instant::now();
        loop {
            self.cavity.abort_state().check_abort(self.cavity.name())?;
            let loaded_q = self.cavity.loaded_q()?;
            if reference > 0.0 && loaded_q < threshold {
                return Err(SetupError::Quench(format!(
                    "{} quenched at {amplitude:.1} MV (loaded Q {loaded_q:.2e} below {threshold:.2e})",
                    self.cavity.name()
                )));
            }
            if started.elapsed() > self.confirm_window {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        // Fake quench: the latch tripped but the loaded Q never moved.
        warn!(
            cavity = %self.cavity.name(),
            amplitude,
            "quench latch not confirmed by loaded Q, resetting"
        );
        self.cavity.reset_interlocks()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_validation() {
        let good = RampParams {
            start_amp: 0.5,
            end_amp: 2.0,
            step_size: 0.1,
            step_time: Duration::from_millis(10),
        };
        assert!(good.validate().is_ok());
        assert_eq!(good.expected_holds(), 15);

        let bad_step = RampParams { step_size: 0.0, ..good };
        assert!(bad_step.validate().is_err());

        let backwards = RampParams {
            start_amp: 3.0,
            ..good
        };
        assert!(backwards.validate().is_err());
    }

    #[test]
    fn test_amplitude_step_average_is_cached() {
        let mut step = AmplitudeStep::new(1.0);
        assert_eq!(step.average(), None);
        step.samples.extend([1.0, 2.0, 3.0]);
        assert_eq!(step.average(), Some(2.0));
        // Later samples cannot change a materialized average.
        step.samples.push(100.0);
        assert_eq!(step.average(), Some(2.0));
    }
}
