//! Cavity-level setup and shutdown procedures.
//!
//! A [`Cavity`] is the lowest controllable unit of the hierarchy. It owns its
//! channel bindings (computed once from its position and bound at
//! construction), its abort state, its stepper tuner, and the stage-request
//! flags that select which optional sub-procedures a setup run performs.
//!
//! The procedure state machine is
//! `IDLE → RUNNING{CAL, TUNE, CHAR, RAMP} → {COMPLETE, ABORTED, ERROR}`.
//! Stage order is fixed: SSA calibration precedes tuning, tuning precedes
//! characterization, characterization precedes the RF ramp. Individual stages
//! can only be skipped, never reordered. The abort flag is polled before each
//! stage and inside every stage wait; an abort stops the run immediately,
//! turns RF and SSA off, and reports `Aborted`. A stage fault reports `Error`
//! after the same best-effort safety shutdown, and a secondary failure during
//! that shutdown is logged rather than re-raised so cleanup can never mask
//! the original fault.

use crate::abort::{AbortState, POLL_INTERVAL};
use crate::channel::{ChannelAccess, ChannelValue};
use crate::config::{RampSettings, Settings};
use crate::error::{SetupError, SetupResult};
use crate::persist::PositionStore;
use crate::ramp::{AmplitudeRampWorker, RampParams};
use crate::status::{ProcedureStatus, StatusReport, StatusSink};
use crate::stepper::{StepperLimits, StepperTuner};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Hardware-mode value meaning the cavity is usable.
pub const HW_MODE_ONLINE: i64 = 0;
/// Amplitude-feedback mode the ramp runs in.
pub const RF_MODE_SELA: i64 = 0;
/// Phase-and-amplitude feedback mode selected after a successful ramp.
pub const RF_MODE_SELAP: i64 = 1;
/// Detune tolerance for "on resonance", Hz.
pub const TUNE_TOLERANCE_HZ: f64 = 50.0;
/// Upper bound on tune iterations before giving up.
const MAX_TUNE_ATTEMPTS: u32 = 10;
/// Bounded wait for SSA calibration and characterization results.
const RESULT_TIMEOUT: Duration = Duration::from_secs(120);
/// Bounded wait for the RF mode to settle after a mode request.
const MODE_TIMEOUT: Duration = Duration::from_secs(10);
/// Amplitude the ramp starts from when the cavity was off, MV.
const RAMP_FLOOR_MV: f64 = 2.0;

/// Optional sub-procedures of a setup run.
///
/// Plain data: seeded by an operator or bulk-copied from a template before a
/// run, snapshot-consumed when the run starts, never mutated by the procedure
/// itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct StageRequests {
    /// Run SSA calibration.
    pub ssa_cal: bool,
    /// Tune the cavity to resonance.
    pub tune: bool,
    /// Run cavity characterization.
    pub characterize: bool,
    /// Ramp the RF amplitude to the stored target.
    pub ramp: bool,
}

impl Default for StageRequests {
    fn default() -> Self {
        Self {
            ssa_cal: true,
            tune: true,
            characterize: true,
            ramp: true,
        }
    }
}

/// One cavity of the containment hierarchy, with its procedures.
pub struct Cavity {
    name: String,
    linac_name: String,
    cryomodule_name: String,
    number: u8,
    abort: Arc<AbortState>,
    service: Arc<dyn ChannelAccess>,
    sink: Arc<dyn StatusSink>,
    requests: Mutex<StageRequests>,
    stepper: StepperTuner,
    ramp_defaults: RampSettings,

    ch_abort: String,
    ch_ades: String,
    ch_aact: String,
    ch_acon: String,
    ch_rf_ctrl: String,
    ch_rf_state: String,
    ch_rf_mode: String,
    ch_rf_mode_ctrl: String,
    ch_hw_mode: String,
    ch_intlk_reset: String,
    ch_detune: String,
    ch_quench_latch: String,
    ch_qloaded: String,
    ch_qloaded_ref: String,
    ch_cav_power: String,
    ch_char_start: String,
    ch_char_status: String,
    ch_probe_q_calc: String,
    ch_ssa_on: String,
    ch_ssa_off: String,
    ch_ssa_cal_start: String,
    ch_ssa_cal_status: String,
    ch_ssa_drive: String,
    ch_ssa_drive_max: String,
    ch_rack_dac: [String; 2],
}

impl Cavity {
    /// Construct cavity `number` (1-8) of `cryomodule_name`, binding every
    /// channel it will ever touch. Any binding failure fails construction.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        linac_name: &str,
        cryomodule_name: &str,
        number: u8,
        harmonic_linearizer: bool,
        rack_prefix: &str,
        service: Arc<dyn ChannelAccess>,
        sink: Arc<dyn StatusSink>,
        store: Arc<PositionStore>,
        settings: &Settings,
    ) -> SetupResult<Arc<Self>> {
        let name = format!("CM{cryomodule_name} cavity {number}");
        let prefix = format!("ACCL:{linac_name}:{cryomodule_name}{number}0:");
        let ch = |suffix: &str| format!("{prefix}{suffix}");

        let abort = AbortState::new();
        let stepper = StepperTuner::new(
            &name,
            &prefix,
            harmonic_linearizer,
            Arc::clone(&abort),
            Arc::clone(&service),
            store,
            StepperLimits {
                max_speed: settings.stepper.max_speed,
                max_steps_per_move: settings.stepper.max_steps_per_move,
                detune_interlock_hz: settings.stepper.detune_interlock_hz,
                park_detune_hz: settings.stepper.park_detune_hz,
            },
        )?;

        let cavity = Self {
            name,
            linac_name: linac_name.to_string(),
            cryomodule_name: cryomodule_name.to_string(),
            number,
            abort,
            sink,
            requests: Mutex::new(StageRequests::default()),
            stepper,
            ramp_defaults: settings.ramp.clone(),
            ch_abort: ch("AUTO:ABORT"),
            ch_ades: ch("ADES"),
            ch_aact: ch("AACT"),
            ch_acon: ch("ACON"),
            ch_rf_ctrl: ch("RF:CTRL"),
            ch_rf_state: ch("RF:STATE"),
            ch_rf_mode: ch("RFMODE"),
            ch_rf_mode_ctrl: ch("RFMODECTRL"),
            ch_hw_mode: ch("HWMODE"),
            ch_intlk_reset: ch("INTLK_RESET_ALL"),
            ch_detune: ch("DFBEST"),
            ch_quench_latch: ch("QUENCH_LTCH"),
            ch_qloaded: ch("QLOADED"),
            ch_qloaded_ref: ch("QLOADED_REF"),
            ch_cav_power: ch("CAV:PWRMEAN"),
            ch_char_start: ch("PROBECALSTRT"),
            ch_char_status: ch("PROBECALSTS"),
            ch_probe_q_calc: ch("QPROBE_CALC"),
            ch_ssa_on: ch("SSA:PowerOn"),
            ch_ssa_off: ch("SSA:PowerOff"),
            ch_ssa_cal_start: ch("SSA:CALSTRT"),
            ch_ssa_cal_status: ch("SSA:CALSTS"),
            ch_ssa_drive: ch("SSA:DRV"),
            ch_ssa_drive_max: ch("SSA:DRV_MAX"),
            ch_rack_dac: [
                format!("{rack_prefix}RFS1:DAC_AMP"),
                format!("{rack_prefix}RFS2:DAC_AMP"),
            ],
            service,
        };

        for channel in [
            &cavity.ch_abort,
            &cavity.ch_ades,
            &cavity.ch_aact,
            &cavity.ch_acon,
            &cavity.ch_rf_ctrl,
            &cavity.ch_rf_state,
            &cavity.ch_rf_mode,
            &cavity.ch_rf_mode_ctrl,
            &cavity.ch_hw_mode,
            &cavity.ch_intlk_reset,
            &cavity.ch_detune,
            &cavity.ch_quench_latch,
            &cavity.ch_qloaded,
            &cavity.ch_qloaded_ref,
            &cavity.ch_cav_power,
            &cavity.ch_char_start,
            &cavity.ch_char_status,
            &cavity.ch_probe_q_calc,
            &cavity.ch_ssa_on,
            &cavity.ch_ssa_off,
            &cavity.ch_ssa_cal_start,
            &cavity.ch_ssa_cal_status,
            &cavity.ch_ssa_drive,
            &cavity.ch_ssa_drive_max,
            &cavity.ch_rack_dac[0],
            &cavity.ch_rack_dac[1],
        ] {
            cavity.service.bind(channel)?;
        }

        Ok(Arc::new(cavity))
    }

    /// Display name, e.g. "CM01 cavity 3".
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Linac section this cavity sits in.
    pub fn linac_name(&self) -> &str {
        &self.linac_name
    }

    /// Cryomodule this cavity sits in.
    pub fn cryomodule_name(&self) -> &str {
        &self.cryomodule_name
    }

    /// Cavity number within the cryomodule, 1-8.
    pub fn number(&self) -> u8 {
        self.number
    }

    /// This cavity's abort/running state.
    pub fn abort_state(&self) -> &Arc<AbortState> {
        &self.abort
    }

    /// The tuner motor attached to this cavity.
    pub fn stepper(&self) -> &StepperTuner {
        &self.stepper
    }

    /// Replace the stage-request flags for the next run.
    pub fn set_requests(&self, requests: StageRequests) {
        if let Ok(mut current) = self.requests.lock() {
            *current = requests;
        }
    }

    /// Current stage-request flags.
    pub fn requests(&self) -> StageRequests {
        self.requests.lock().map(|r| *r).unwrap_or_default()
    }

    // -------------------------------------------------------------------------
    // Channel helpers
    // -------------------------------------------------------------------------

    fn get_f64(&self, name: &str) -> SetupResult<f64> {
        self.service
            .get(name)?
            .as_f64()
            .ok_or_else(|| SetupError::Channel(format!("{name}: non-numeric value")))
    }

    fn get_i64(&self, name: &str) -> SetupResult<i64> {
        self.service
            .get(name)?
            .as_i64()
            .ok_or_else(|| SetupError::Channel(format!("{name}: non-numeric value")))
    }

    fn put_f64(&self, name: &str, value: f64) -> SetupResult<()> {
        self.service.put(name, ChannelValue::Float(value))
    }

    fn put_i64(&self, name: &str, value: i64) -> SetupResult<()> {
        self.service.put(name, ChannelValue::Int(value))
    }

    /// Emit a status report for this cavity.
    pub(crate) fn emit(&self, status: ProcedureStatus, progress: u8, message: impl Into<String>) {
        self.sink
            .emit(StatusReport::new(&self.name, status, progress, message));
    }

    /// Poll `name` every [`POLL_INTERVAL`] until `pred` accepts its value,
    /// honoring abort and a bounded wait.
    async fn wait_for(
        &self,
        name: &str,
        pred: impl Fn(i64) -> bool,
        timeout: Duration,
        what: &str,
    ) -> SetupResult<i64> {
        let started = Instant::now();
        loop {
            self.abort.check_abort(&self.name)?;
            let value = self.get_i64(name)?;
            if pred(value) {
                return Ok(value);
            }
            if started.elapsed() > timeout {
                return Err(SetupError::Timeout(format!(
                    "{}: {what} not reached within {timeout:?}",
                    self.name
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    // -------------------------------------------------------------------------
    // Abort plumbing
    // -------------------------------------------------------------------------

    /// Request a cooperative abort of whatever is running on this cavity.
    pub fn request_abort(&self) {
        if self.abort.is_running() {
            self.emit(
                ProcedureStatus::Running,
                0,
                format!("Requesting safe abort for {}", self.name),
            );
        }
        self.abort.request_abort();
        if let Err(e) = self.put_i64(&self.ch_abort, 1) {
            warn!(cavity = %self.name, error = %e, "failed to mirror abort request");
        }
    }

    /// Clear a pending abort. The channel mirror write can fail; callers
    /// fanning out over many cavities must tolerate that per leaf.
    pub fn clear_abort(&self) -> SetupResult<()> {
        self.abort.clear_abort();
        self.put_i64(&self.ch_abort, 0)
    }

    // -------------------------------------------------------------------------
    // Hardware primitives shared by the stages and the ramp worker
    // -------------------------------------------------------------------------

    pub(crate) fn is_online(&self) -> SetupResult<bool> {
        Ok(self.get_i64(&self.ch_hw_mode)? == HW_MODE_ONLINE)
    }

    pub(crate) fn turn_off(&self) -> SetupResult<()> {
        self.put_i64(&self.ch_rf_ctrl, 0)
    }

    pub(crate) fn turn_on(&self) -> SetupResult<()> {
        self.put_i64(&self.ch_rf_ctrl, 1)
    }

    pub(crate) fn is_on(&self) -> SetupResult<bool> {
        Ok(self.get_i64(&self.ch_rf_state)? == 1)
    }

    pub(crate) fn rf_mode(&self) -> SetupResult<i64> {
        self.get_i64(&self.ch_rf_mode)
    }

    pub(crate) fn ssa_on(&self) -> SetupResult<()> {
        self.put_i64(&self.ch_ssa_on, 1)
    }

    pub(crate) fn ssa_off(&self) -> SetupResult<()> {
        self.put_i64(&self.ch_ssa_off, 1)
    }

    pub(crate) fn reset_interlocks(&self) -> SetupResult<()> {
        self.put_i64(&self.ch_intlk_reset, 1)
    }

    pub(crate) fn ades(&self) -> SetupResult<f64> {
        self.get_f64(&self.ch_ades)
    }

    pub(crate) fn set_ades(&self, value: f64) -> SetupResult<()> {
        self.put_f64(&self.ch_ades, value)
    }

    pub(crate) fn aact(&self) -> SetupResult<f64> {
        self.get_f64(&self.ch_aact)
    }

    pub(crate) fn cavity_power(&self) -> SetupResult<f64> {
        self.get_f64(&self.ch_cav_power)
    }

    pub(crate) fn quench_latched(&self) -> SetupResult<bool> {
        Ok(self.get_i64(&self.ch_quench_latch)? == 1)
    }

    pub(crate) fn loaded_q(&self) -> SetupResult<f64> {
        self.get_f64(&self.ch_qloaded)
    }

    pub(crate) fn loaded_q_reference(&self) -> SetupResult<f64> {
        self.get_f64(&self.ch_qloaded_ref)
    }

    /// RF and SSA off; every failure is downgraded to a log line so cleanup
    /// never masks the fault that triggered it.
    pub(crate) fn safe_off(&self) {
        if let Err(e) = self.turn_off() {
            warn!(cavity = %self.name, error = %e, "safety RF turn-off failed");
        }
        if let Err(e) = self.ssa_off() {
            warn!(cavity = %self.name, error = %e, "safety SSA turn-off failed");
        }
    }

    // -------------------------------------------------------------------------
    // Procedures
    // -------------------------------------------------------------------------

    /// Run the setup sequence, executing only the requested stages in fixed
    /// order. Returns the terminal status that was reported.
    pub async fn setup(&self) -> ProcedureStatus {
        let Some(_guard) = self.abort.try_start() else {
            self.emit(
                ProcedureStatus::Running,
                0,
                format!("{} script already running", self.name),
            );
            return ProcedureStatus::Running;
        };

        match self.is_online() {
            Ok(true) => {}
            Ok(false) => {
                self.emit(
                    ProcedureStatus::Error,
                    0,
                    format!("{} not online, not setting up", self.name),
                );
                return ProcedureStatus::Error;
            }
            Err(e) => {
                self.emit(ProcedureStatus::Error, 0, e.to_string());
                return ProcedureStatus::Error;
            }
        }

        if let Err(e) = self.clear_abort() {
            self.emit(ProcedureStatus::Error, 0, e.to_string());
            return ProcedureStatus::Error;
        }

        let requests = self.requests();
        self.emit(ProcedureStatus::Running, 0, format!("Starting {} setup", self.name));

        match self.run_setup_stages(requests).await {
            Ok(()) => {
                self.emit(
                    ProcedureStatus::Complete,
                    100,
                    format!("{} setup complete", self.name),
                );
                ProcedureStatus::Complete
            }
            Err(e) if e.is_abort() => {
                self.safe_off();
                self.emit(ProcedureStatus::Aborted, 0, e.to_string());
                ProcedureStatus::Aborted
            }
            Err(e) => {
                if e.is_interlock() {
                    tracing::error!(cavity = %self.name, error = %e, "safety interlock tripped");
                }
                self.safe_off();
                self.emit(ProcedureStatus::Error, 0, e.to_string());
                ProcedureStatus::Error
            }
        }
    }

    async fn run_setup_stages(&self, requests: StageRequests) -> SetupResult<()> {
        // Not turning RF off first can cause problems if an interlock is
        // tripped while the requested state is on.
        self.emit(
            ProcedureStatus::Running,
            0,
            format!("Turning {} off before starting setup", self.name),
        );
        self.turn_off()?;
        self.emit(
            ProcedureStatus::Running,
            5,
            format!("Turning on {} SSA if not on already", self.name),
        );
        self.ssa_on()?;
        self.emit(
            ProcedureStatus::Running,
            10,
            format!("Resetting {} interlocks", self.name),
        );
        self.reset_interlocks()?;
        self.capture_target_amplitude()?;
        self.emit(ProcedureStatus::Running, 15, "Interlocks reset");

        self.abort.check_abort(&self.name)?;
        if requests.ssa_cal {
            self.stage_ssa_calibration().await?;
        }
        self.emit(ProcedureStatus::Running, 25, "SSA calibration stage done");

        self.abort.check_abort(&self.name)?;
        if requests.tune {
            self.stage_auto_tune().await?;
        }
        self.emit(ProcedureStatus::Running, 50, "Tuning stage done");

        self.abort.check_abort(&self.name)?;
        if requests.characterize {
            self.stage_characterization().await?;
        }
        self.emit(ProcedureStatus::Running, 75, "Characterization stage done");

        self.abort.check_abort(&self.name)?;
        if requests.ramp {
            self.stage_ramp().await?;
        }
        Ok(())
    }

    /// Independent of `setup()`: turn RF and the amplifier supply off.
    /// Returns the terminal status that was reported.
    pub async fn shut_down(&self) -> ProcedureStatus {
        let Some(_guard) = self.abort.try_start() else {
            self.emit(
                ProcedureStatus::Running,
                0,
                format!("{} script already running", self.name),
            );
            return ProcedureStatus::Running;
        };

        if let Err(e) = self.clear_abort() {
            warn!(cavity = %self.name, error = %e, "could not clear abort before shutdown");
        }

        self.emit(
            ProcedureStatus::Running,
            0,
            format!("Turning {} RF off", self.name),
        );
        let result = self.turn_off().and_then(|()| {
            self.emit(
                ProcedureStatus::Running,
                50,
                format!("Turning {} SSA off", self.name),
            );
            self.ssa_off()
        });
        match result {
            Ok(()) => {
                self.emit(
                    ProcedureStatus::Complete,
                    100,
                    format!("{} RF and SSA off", self.name),
                );
                ProcedureStatus::Complete
            }
            Err(e) => {
                self.emit(ProcedureStatus::Error, 0, e.to_string());
                ProcedureStatus::Error
            }
        }
    }

    // -------------------------------------------------------------------------
    // Stages
    // -------------------------------------------------------------------------

    /// Store the current design amplitude as the ramp target.
    fn capture_target_amplitude(&self) -> SetupResult<()> {
        let ades = self.ades()?;
        self.put_f64(&self.ch_acon, ades)
    }

    async fn stage_ssa_calibration(&self) -> SetupResult<()> {
        self.emit(
            ProcedureStatus::Running,
            15,
            format!("Running {} SSA calibration", self.name),
        );
        self.turn_off()?;
        // Zero both rack DACs so the calibration sees a quiet drive chain.
        for dac in &self.ch_rack_dac {
            self.service.put(dac, ChannelValue::Float(0.0))?;
        }
        self.emit(ProcedureStatus::Running, 20, "Rack DAC amplitudes zeroed");

        let drive_max = self.get_f64(&self.ch_ssa_drive_max)?;
        self.put_f64(&self.ch_ssa_drive, drive_max)?;
        self.put_i64(&self.ch_ssa_cal_start, 1)?;
        // CALSTS: 0 = complete, 1 = running, 2 = fault.
        let status = self
            .wait_for(
                &self.ch_ssa_cal_status,
                |v| v != 1,
                RESULT_TIMEOUT,
                "SSA calibration result",
            )
            .await?;
        if status == 2 {
            return Err(SetupError::Channel(format!(
                "{}: SSA calibration reported a fault",
                self.name
            )));
        }
        self.emit(
            ProcedureStatus::Running,
            25,
            format!("{} SSA calibrated", self.name),
        );
        Ok(())
    }

    async fn stage_auto_tune(&self) -> SetupResult<()> {
        self.emit(
            ProcedureStatus::Running,
            25,
            format!("Tuning {} to resonance", self.name),
        );
        for _ in 0..MAX_TUNE_ATTEMPTS {
            self.abort.check_abort(&self.name)?;
            let detune = self.get_f64(&self.ch_detune)?;
            if detune.abs() <= TUNE_TOLERANCE_HZ {
                self.emit(
                    ProcedureStatus::Running,
                    50,
                    format!("{} tuned to resonance", self.name),
                );
                return Ok(());
            }
            let steps = -(detune / self.stepper.hz_per_microstep()?).round() as i64;
            info!(cavity = %self.name, detune, steps, "correcting detune");
            self.stepper
                .move_steps(
                    steps,
                    steps.abs().max(1),
                    self.stepper.limits().max_speed,
                    true,
                )
                .await?;
        }
        Err(SetupError::Timeout(format!(
            "{}: detune not within {TUNE_TOLERANCE_HZ} Hz after {MAX_TUNE_ATTEMPTS} moves",
            self.name
        )))
    }

    async fn stage_characterization(&self) -> SetupResult<()> {
        self.emit(
            ProcedureStatus::Running,
            50,
            format!("Running {} characterization", self.name),
        );
        self.put_i64(&self.ch_char_start, 1)?;
        // PROBECALSTS: 0 = complete, 1 = running, 2 = fault.
        let status = self
            .wait_for(
                &self.ch_char_status,
                |v| v != 1,
                RESULT_TIMEOUT,
                "characterization result",
            )
            .await?;
        if status == 2 {
            return Err(SetupError::Channel(format!(
                "{}: characterization reported a fault",
                self.name
            )));
        }
        self.emit(ProcedureStatus::Running, 60, "Characterization finished");
        self.put_i64(&self.ch_probe_q_calc, 1)?;
        self.emit(
            ProcedureStatus::Running,
            70,
            format!("{} characterized", self.name),
        );
        Ok(())
    }

    async fn stage_ramp(&self) -> SetupResult<()> {
        let target = self.get_f64(&self.ch_acon)?;
        if target <= 0.0 {
            return Err(SetupError::Configuration(format!(
                "Cannot ramp {} to {target} MV",
                self.name
            )));
        }

        // Start low if the cavity was off or out of the feedback mode the
        // ramp runs in.
        if !self.is_on()? || self.rf_mode()? != RF_MODE_SELAP {
            self.set_ades(target.min(RAMP_FLOOR_MV))?;
        }
        self.turn_on()?;
        self.emit(ProcedureStatus::Running, 80, format!("{} RF on", self.name));

        self.put_i64(&self.ch_rf_mode_ctrl, RF_MODE_SELA)?;
        self.wait_for(&self.ch_rf_mode, |v| v == RF_MODE_SELA, MODE_TIMEOUT, "SELA mode")
            .await?;

        self.emit(
            ProcedureStatus::Running,
            85,
            format!("Walking {} to {target} MV", self.name),
        );
        let params = RampParams {
            start_amp: self.ades()?.min(target),
            end_amp: target,
            step_size: self.ramp_defaults.step_size,
            step_time: Duration::from_secs_f64(self.ramp_defaults.step_time_secs),
        };
        let worker = AmplitudeRampWorker::new(self, params);
        worker.execute().await?;
        self.emit(
            ProcedureStatus::Running,
            95,
            format!("{} ramped up to {target} MV", self.name),
        );

        self.put_i64(&self.ch_rf_mode_ctrl, RF_MODE_SELAP)?;
        Ok(())
    }
}
