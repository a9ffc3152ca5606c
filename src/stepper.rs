//! Stepper tuner motion control.
//!
//! Drives a single cavity tuner motor through bounded, speed-limited,
//! checkable moves. A move request is validated against the stored limits
//! before any hardware write; during actuation the controller polls the motor
//! at [`POLL_INTERVAL`], re-checking the abort flag and (optionally) the
//! detune interlock, and re-reads the hardware signed step counter on every
//! exit path so position bookkeeping stays consistent even when a move is cut
//! short.
//!
//! Named targets (park, cold landing) resolve to step counts through the
//! per-cavity calibration constant `park_detune / hz_per_microstep`, computed
//! once and cached.

use crate::abort::{AbortState, POLL_INTERVAL};
use crate::channel::{ChannelAccess, ChannelValue};
use crate::error::{SetupError, SetupResult};
use crate::persist::PositionStore;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Grace period for the motor to report movement after a move command.
const MOTOR_SPINUP: Duration = Duration::from_millis(400);

/// Limits applied to every move request.
#[derive(Clone, Debug)]
pub struct StepperLimits {
    /// Hard ceiling on commanded speed, steps/second.
    pub max_speed: u32,
    /// Hard ceiling on the step delta of a single request.
    pub max_steps_per_move: i64,
    /// Detune magnitude (Hz) that trips the interlock mid-move.
    pub detune_interlock_hz: f64,
    /// Detune a parked cavity sits at, for the park target.
    pub park_detune_hz: f64,
}

/// What a finished (or cut-short) move actually did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MoveReport {
    /// Signed steps the caller asked for.
    pub requested: i64,
    /// Signed position read back from the hardware counter afterwards.
    pub position: i64,
}

/// Motion controller for one cavity's stepper tuner.
pub struct StepperTuner {
    cavity_name: String,
    harmonic_linearizer: bool,
    abort: Arc<AbortState>,
    service: Arc<dyn ChannelAccess>,
    store: Arc<PositionStore>,
    limits: StepperLimits,
    park_target: OnceLock<i64>,
    cold_target: OnceLock<i64>,

    // Channel bindings, computed once from the cavity prefix.
    ch_move_pos: String,
    ch_move_neg: String,
    ch_abort_req: String,
    ch_step_des: String,
    ch_speed: String,
    ch_motor_moving: String,
    ch_step_signed: String,
    ch_limit_a: String,
    ch_limit_b: String,
    ch_scale: String,
    ch_steps_cold: String,
    ch_detune: String,
}

impl StepperTuner {
    /// Bind every stepper channel under `cavity_prefix` and return the
    /// controller. Fails if any binding cannot be established.
    pub fn new(
        cavity_name: &str,
        cavity_prefix: &str,
        harmonic_linearizer: bool,
        abort: Arc<AbortState>,
        service: Arc<dyn ChannelAccess>,
        store: Arc<PositionStore>,
        limits: StepperLimits,
    ) -> SetupResult<Self> {
        let step = |suffix: &str| format!("{cavity_prefix}STEP:{suffix}");
        let tuner = Self {
            cavity_name: cavity_name.to_string(),
            harmonic_linearizer,
            abort,
            ch_move_pos: step("MOV_REQ_POS"),
            ch_move_neg: step("MOV_REQ_NEG"),
            ch_abort_req: step("ABORT_REQ"),
            ch_step_des: step("NSTEPS"),
            ch_speed: step("VELO"),
            ch_motor_moving: step("STAT_MOV"),
            ch_step_signed: step("REG_TOTSGN"),
            ch_limit_a: step("STAT_LIMA"),
            ch_limit_b: step("STAT_LIMB"),
            ch_scale: step("SCALE"),
            ch_steps_cold: step("NSTEPS_COLD"),
            ch_detune: format!("{cavity_prefix}DFBEST"),
            service,
            store,
            limits,
            park_target: OnceLock::new(),
            cold_target: OnceLock::new(),
        };
        for name in [
            &tuner.ch_move_pos,
            &tuner.ch_move_neg,
            &tuner.ch_abort_req,
            &tuner.ch_step_des,
            &tuner.ch_speed,
            &tuner.ch_motor_moving,
            &tuner.ch_step_signed,
            &tuner.ch_limit_a,
            &tuner.ch_limit_b,
            &tuner.ch_scale,
            &tuner.ch_steps_cold,
            &tuner.ch_detune,
        ] {
            tuner.service.bind(name)?;
        }
        Ok(tuner)
    }

    fn get_f64(&self, name: &str) -> SetupResult<f64> {
        self.service.get(name)?.as_f64().ok_or_else(|| {
            SetupError::Channel(format!("{name}: non-numeric value"))
        })
    }

    fn get_i64(&self, name: &str) -> SetupResult<i64> {
        self.service.get(name)?.as_i64().ok_or_else(|| {
            SetupError::Channel(format!("{name}: non-numeric value"))
        })
    }

    /// Hardware signed step counter.
    pub fn signed_position(&self) -> SetupResult<i64> {
        self.get_i64(&self.ch_step_signed)
    }

    /// Re-read the hardware counter and persist it. Called after every move
    /// chunk and on every early-termination path.
    fn record_position(&self) -> SetupResult<i64> {
        let position = self.signed_position()?;
        self.store.record(&self.cavity_name, position)?;
        Ok(position)
    }

    /// Limits this controller validates every request against.
    pub fn limits(&self) -> &StepperLimits {
        &self.limits
    }

    /// Frequency shift per microstep, from the tuner calibration channel.
    pub(crate) fn hz_per_microstep(&self) -> SetupResult<f64> {
        let scale = self.get_f64(&self.ch_scale)?.abs();
        if scale <= 0.0 {
            return Err(SetupError::Configuration(format!(
                "{}: tuner scale not calibrated",
                self.cavity_name
            )));
        }
        Ok(scale)
    }

    /// Absolute step count of the park position, derived once from the park
    /// detune and the per-cavity scale.
    pub fn park_target(&self) -> SetupResult<i64> {
        if let Some(cached) = self.park_target.get() {
            return Ok(*cached);
        }
        let target = (self.limits.park_detune_hz / self.hz_per_microstep()?).round() as i64;
        Ok(*self.park_target.get_or_init(|| target))
    }

    /// Absolute step count of the cold-landing position, recorded by the
    /// tuning application in hardware.
    pub fn cold_target(&self) -> SetupResult<i64> {
        if let Some(cached) = self.cold_target.get() {
            return Ok(*cached);
        }
        let target = self.get_i64(&self.ch_steps_cold)?;
        Ok(*self.cold_target.get_or_init(|| target))
    }

    /// Move to the park position at full speed, without the detune check
    /// (parked cavities are far off resonance by definition).
    pub async fn move_to_park(&self) -> SetupResult<MoveReport> {
        let delta = self.park_target()? - self.signed_position()?;
        info!(cavity = %self.cavity_name, delta, "moving tuner to park");
        self.move_steps(delta, delta.abs().max(1), self.limits.max_speed, false)
            .await
    }

    /// Move to the recorded cold-landing position.
    pub async fn move_to_cold_landing(&self, check_detune: bool) -> SetupResult<MoveReport> {
        let delta = self.cold_target()? - self.signed_position()?;
        info!(cavity = %self.cavity_name, delta, "moving tuner to cold landing");
        self.move_steps(delta, delta.abs().max(1), self.limits.max_speed, check_detune)
            .await
    }

    /// Move `num_steps` (positive lengthens the cavity), bounded by
    /// `max_steps` and `speed`.
    ///
    /// Bounds are validated before any hardware write; a violation is a
    /// configuration error and nothing moves. Requests larger than the hard
    /// per-command limit are issued as a sequence of chunks. During each
    /// chunk the abort flag and (if `check_detune`) the detune channel are
    /// sampled every [`POLL_INTERVAL`]; either stops the motor, and the
    /// hardware position is recorded before the error is returned.
    pub async fn move_steps(
        &self,
        num_steps: i64,
        max_steps: i64,
        speed: u32,
        check_detune: bool,
    ) -> SetupResult<MoveReport> {
        self.abort.check_abort(&self.cavity_name)?;

        let max_steps = max_steps.abs();
        if speed == 0 || speed > self.limits.max_speed {
            return Err(SetupError::Configuration(format!(
                "{}: requested speed {speed} outside 1..={} steps/s",
                self.cavity_name, self.limits.max_speed
            )));
        }
        if num_steps == 0 {
            debug!(cavity = %self.cavity_name, "zero-step move request, nothing to do");
            return Ok(MoveReport {
                requested: 0,
                position: self.signed_position()?,
            });
        }
        if num_steps.abs() > max_steps {
            return Err(SetupError::Configuration(format!(
                "{}: requested {num_steps} steps exceeds bound {max_steps}",
                self.cavity_name
            )));
        }

        self.service
            .put(&self.ch_speed, ChannelValue::Int(i64::from(speed)))?;

        let chunk_limit = self.limits.max_steps_per_move.max(1);
        let direction = num_steps.signum();
        let mut remaining = num_steps.abs();
        let mut position = self.signed_position()?;

        while remaining > 0 {
            let chunk = remaining.min(chunk_limit);
            self.service
                .put(&self.ch_step_des, ChannelValue::Int(chunk))?;
            self.issue_move(direction * chunk)?;

            // Give the motor a moment to report movement.
            let result = match self.abort.sleep_checked(MOTOR_SPINUP, &self.cavity_name).await {
                Ok(()) => self.watch_move(check_detune).await,
                Err(abort) => {
                    self.halt_motor();
                    Err(abort)
                }
            };
            let recorded = self.record_position();
            result?;
            position = recorded?;

            if self.on_limit_switch()? {
                return Err(SetupError::Stepper(format!(
                    "{} stepper motor on limit switch",
                    self.cavity_name
                )));
            }
            remaining -= chunk;
        }

        Ok(MoveReport {
            requested: num_steps,
            position,
        })
    }

    /// Pulse the directional move channel. Harmonic-linearizer tuners move
    /// the opposite direction for the same physical effect.
    fn issue_move(&self, num_steps: i64) -> SetupResult<()> {
        let effective = if self.harmonic_linearizer {
            -num_steps
        } else {
            num_steps
        };
        debug!(
            cavity = %self.cavity_name,
            steps = effective.abs(),
            positive = effective > 0,
            "issuing stepper move command"
        );
        if effective > 0 {
            self.service.put(&self.ch_move_pos, ChannelValue::Int(1))
        } else {
            self.service.put(&self.ch_move_neg, ChannelValue::Int(1))
        }
    }

    /// Poll until the motor stops, enforcing abort and the detune interlock.
    ///
    /// Any reason to stop watching also stops the motor: the chunk was
    /// already commanded, so losing the supervision channels must not let it
    /// run to completion unobserved.
    async fn watch_move(&self, check_detune: bool) -> SetupResult<()> {
        loop {
            let moving = self.halting_on_err(self.motor_moving())?;
            if !moving {
                return Ok(());
            }
            if let Err(abort) = self.abort.check_abort(&self.cavity_name) {
                self.halt_motor();
                return Err(abort);
            }
            if check_detune {
                let detune = self.halting_on_err(self.get_f64(&self.ch_detune))?;
                if detune.abs() > self.limits.detune_interlock_hz {
                    self.halt_motor();
                    return Err(SetupError::DetuneInterlock(format!(
                        "{}: detune {detune:.0} Hz beyond {:.0} Hz during move",
                        self.cavity_name, self.limits.detune_interlock_hz
                    )));
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Stop the motor before propagating a supervision read failure.
    fn halting_on_err<T>(&self, result: SetupResult<T>) -> SetupResult<T> {
        if result.is_err() {
            self.halt_motor();
        }
        result
    }

    /// Best-effort hardware stop; a failure here must not mask the condition
    /// that made us stop.
    fn halt_motor(&self) {
        if let Err(e) = self.service.put(&self.ch_abort_req, ChannelValue::Int(1)) {
            warn!(cavity = %self.cavity_name, error = %e, "failed to halt stepper motor");
        }
    }

    fn motor_moving(&self) -> SetupResult<bool> {
        Ok(self.get_i64(&self.ch_motor_moving)? == 1)
    }

    fn on_limit_switch(&self) -> SetupResult<bool> {
        Ok(self.get_i64(&self.ch_limit_a)? == 1 || self.get_i64(&self.ch_limit_b)? == 1)
    }
}
