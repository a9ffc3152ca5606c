//! Custom error types for the application.
//!
//! This module defines the primary error type, `SetupError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to classify the failure modes of a live accelerator
//! procedure:
//!
//! - **`Configuration`**: invalid move or ramp parameters, or a semantically
//!   invalid settings file. Caught before any hardware write is issued and
//!   never retried.
//! - **`Channel`**: a hardware control channel could not be bound, read, or
//!   written.
//! - **`Aborted`**: cooperative cancellation. Expected and non-fatal; always
//!   followed by a best-effort safety shutdown.
//! - **`DetuneInterlock`** / **`Quench`**: safety interlocks tripping during
//!   motion or an amplitude ramp. Expected operational faults, reported with
//!   elevated severity; any retry policy lives above this crate.
//! - **`Stepper`**: the tuner motor stopped for a bad reason (limit switch).
//! - **`Timeout`**: a bounded wait expired without the hardware reaching the
//!   expected state.
//!
//! All of these are caught at the stage boundary inside the cavity procedure
//! and converted into a terminal [`ProcedureStatus`](crate::status::ProcedureStatus);
//! none propagate past the procedure as a raw error.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type SetupResult<T> = std::result::Result<T, SetupError>;

/// Error taxonomy for cavity setup, tuning, and ramp procedures.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Aborted: {0}")]
    Aborted(String),

    #[error("Detune interlock tripped: {0}")]
    DetuneInterlock(String),

    #[error("Quench detected: {0}")]
    Quench(String),

    #[error("Stepper fault: {0}")]
    Stepper(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl SetupError {
    /// Whether this error represents a cooperative abort rather than a fault.
    pub fn is_abort(&self) -> bool {
        matches!(self, SetupError::Aborted(_))
    }

    /// Whether this error is a safety interlock (detune drift or quench).
    pub fn is_interlock(&self) -> bool {
        matches!(self, SetupError::DetuneInterlock(_) | SetupError::Quench(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SetupError::Quench("CM01 cavity 3 at 1.4 MV".to_string());
        assert_eq!(err.to_string(), "Quench detected: CM01 cavity 3 at 1.4 MV");
    }

    #[test]
    fn test_classification() {
        assert!(SetupError::Aborted("op requested".into()).is_abort());
        assert!(SetupError::DetuneInterlock("drifted".into()).is_interlock());
        assert!(!SetupError::Configuration("bad speed".into()).is_interlock());
    }
}
