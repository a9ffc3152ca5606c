//! Application configuration.
//!
//! Settings are loaded with the `config` crate from an optional TOML file and
//! `SRF_SETUP_`-prefixed environment variables, then deserialized into
//! [`Settings`]. Every field has a default matching the production machine,
//! so `Settings::default()` is a fully usable configuration.
//!
//! # Example
//!
//! ```toml
//! [stepper]
//! max_speed = 20000
//! max_steps_per_move = 1000000
//!
//! [ramp]
//! step_size = 0.1
//! step_time_secs = 0.5
//!
//! [[machine.linacs]]
//! name = "L0B"
//! cryomodules = ["01"]
//! ```
//!
//! # Environment overrides
//!
//! ```text
//! SRF_SETUP_STEPPER__MAX_SPEED=15000
//! SRF_SETUP_RAMP__STEP_SIZE=0.2
//! ```

use crate::error::{SetupError, SetupResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level application settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Containment hierarchy to construct at startup.
    pub machine: MachineLayout,
    /// Stepper tuner limits and calibration defaults.
    pub stepper: StepperSettings,
    /// Default amplitude ramp parameters.
    pub ramp: RampSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            machine: MachineLayout::default(),
            stepper: StepperSettings::default(),
            ramp: RampSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from `path` (if given) and the environment, on top of
    /// the built-in defaults.
    pub fn new(path: Option<&Path>) -> SetupResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let loaded: Settings = builder
            .add_source(
                config::Environment::with_prefix("SRF_SETUP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| SetupError::Configuration(e.to_string()))?
            .try_deserialize()
            .map_err(|e| SetupError::Configuration(e.to_string()))?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Semantic validation beyond what deserialization can catch.
    pub fn validate(&self) -> SetupResult<()> {
        if self.stepper.max_speed == 0 {
            return Err(SetupError::Configuration(
                "stepper.max_speed must be positive".into(),
            ));
        }
        if self.stepper.max_steps_per_move <= 0 {
            return Err(SetupError::Configuration(
                "stepper.max_steps_per_move must be positive".into(),
            ));
        }
        if self.ramp.step_size <= 0.0 {
            return Err(SetupError::Configuration(
                "ramp.step_size must be positive".into(),
            ));
        }
        if self.machine.linacs.is_empty() {
            return Err(SetupError::Configuration(
                "machine.linacs must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Names of the linacs and the cryomodules inside each.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineLayout {
    /// Linac sections in beamline order.
    pub linacs: Vec<LinacLayout>,
}

/// One linac section and its cryomodules.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LinacLayout {
    /// Section name, e.g. "L1B".
    pub name: String,
    /// Cryomodule names, e.g. "02" or "H1". Names starting with 'H' are
    /// harmonic linearizers (inverted tuner direction, excludable in bulk
    /// operations).
    pub cryomodules: Vec<String>,
}

impl Default for MachineLayout {
    fn default() -> Self {
        let cm_range = |range: std::ops::RangeInclusive<u32>| {
            range.map(|n| format!("{n:02}")).collect::<Vec<_>>()
        };
        Self {
            linacs: vec![
                LinacLayout {
                    name: "L0B".into(),
                    cryomodules: vec!["01".into()],
                },
                LinacLayout {
                    name: "L1B".into(),
                    cryomodules: vec!["02".into(), "03".into(), "H1".into(), "H2".into()],
                },
                LinacLayout {
                    name: "L2B".into(),
                    cryomodules: cm_range(4..=15),
                },
                LinacLayout {
                    name: "L3B".into(),
                    cryomodules: cm_range(16..=35),
                },
            ],
        }
    }
}

/// Stepper tuner limits, as defined by the tuner experts.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StepperSettings {
    /// Hard ceiling on motor speed in steps/second.
    pub max_speed: u32,
    /// Default commanded speed in steps/second.
    pub default_speed: u32,
    /// Largest step delta allowed in a single move chunk.
    pub max_steps_per_move: i64,
    /// Detune magnitude (Hz) beyond which a checked move trips the interlock.
    pub detune_interlock_hz: f64,
    /// Detune (Hz) a parked cavity sits at, used with the per-cavity scale to
    /// derive the park step target.
    pub park_detune_hz: f64,
    /// Where to persist signed step positions. Defaults to
    /// `<data dir>/srf_setup/stepper_positions.json`.
    pub position_file: Option<PathBuf>,
}

impl Default for StepperSettings {
    fn default() -> Self {
        Self {
            max_speed: 20_000,
            default_speed: 20_000,
            max_steps_per_move: 1_000_000,
            detune_interlock_hz: 200_000.0,
            park_detune_hz: 10_000.0,
            position_file: None,
        }
    }
}

impl StepperSettings {
    /// Resolve the position-store path, falling back to the platform data dir.
    pub fn position_file_path(&self) -> PathBuf {
        self.position_file.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("srf_setup")
                .join("stepper_positions.json")
        })
    }
}

/// Default amplitude ramp parameters for the setup RF ramp stage.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RampSettings {
    /// Amplitude increment per step, MV.
    pub step_size: f64,
    /// Hold time at each level, seconds.
    pub step_time_secs: f64,
}

impl Default for RampSettings {
    fn default() -> Self {
        Self {
            step_size: 0.1,
            step_time_secs: 0.5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.machine.linacs.len(), 4);
        // L3B carries CM16 through CM35.
        assert_eq!(settings.machine.linacs[3].cryomodules.len(), 20);
    }

    #[test]
    fn test_invalid_step_size_rejected() {
        let mut settings = Settings::default();
        settings.ramp.step_size = 0.0;
        assert!(matches!(
            settings.validate(),
            Err(SetupError::Configuration(_))
        ));
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(
            &path,
            "[stepper]\nmax_speed = 15000\n\n[ramp]\nstep_size = 0.2\n",
        )
        .unwrap();

        let settings = Settings::new(Some(&path)).unwrap();
        assert_eq!(settings.stepper.max_speed, 15_000);
        assert_eq!(settings.ramp.step_size, 0.2);
        // Untouched sections keep their defaults.
        assert_eq!(settings.machine.linacs.len(), 4);
    }
}
