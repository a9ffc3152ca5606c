//! Procedure status reporting.
//!
//! Every node in the hierarchy reports progress through a [`StatusSink`]:
//! a fire-and-forget consumer of [`StatusReport`]s. External displays (status
//! boards, heatmaps) subscribe to the sink; nothing in the orchestration core
//! ever reads a status back, so status is strictly an output of the state
//! machine and never an input to it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Terminal and in-flight states of a cavity procedure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcedureStatus {
    /// No procedure has run on this node yet.
    NotStarted,
    /// A procedure is currently executing.
    Running,
    /// The procedure finished every requested stage.
    Complete,
    /// The procedure stopped on a cooperative abort.
    Aborted,
    /// The procedure stopped on a fault.
    Error,
}

/// A single progress/status emission from a node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Identifier of the emitting node (e.g. "CM01 cavity 3").
    pub node: String,
    /// Procedure state at the time of emission.
    pub status: ProcedureStatus,
    /// Coarse progress, 0-100.
    pub progress: u8,
    /// Free-text operator-facing message.
    pub message: String,
    /// When the report was emitted.
    pub timestamp: DateTime<Utc>,
}

impl StatusReport {
    /// Build a report for `node`.
    pub fn new(
        node: impl Into<String>,
        status: ProcedureStatus,
        progress: u8,
        message: impl Into<String>,
    ) -> Self {
        Self {
            node: node.into(),
            status,
            progress,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Fire-and-forget consumer of status reports.
///
/// Implementations must not block: procedures emit from inside their polling
/// loops and expect the call to return promptly. No response is expected.
pub trait StatusSink: Send + Sync {
    /// Deliver one report. Delivery failures are the sink's problem.
    fn emit(&self, report: StatusReport);
}

/// Sink that forwards reports to the `tracing` subscriber.
///
/// Severity tracks the procedure state: faults log at `error`, aborts at
/// `warn`, everything else at `info`.
#[derive(Debug, Default)]
pub struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn emit(&self, report: StatusReport) {
        match report.status {
            ProcedureStatus::Error => tracing::error!(
                node = %report.node,
                progress = report.progress,
                "{}",
                report.message
            ),
            ProcedureStatus::Aborted => tracing::warn!(
                node = %report.node,
                progress = report.progress,
                "{}",
                report.message
            ),
            _ => tracing::info!(
                node = %report.node,
                progress = report.progress,
                "{}",
                report.message
            ),
        }
    }
}

/// Sink that records every report for later inspection.
///
/// Used by the integration tests to assert on the exact status sequence a
/// procedure produced.
#[derive(Debug, Default)]
pub struct CaptureStatusSink {
    reports: Mutex<Vec<StatusReport>>,
}

impl CaptureStatusSink {
    /// Create an empty capture sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything emitted so far.
    pub fn reports(&self) -> Vec<StatusReport> {
        self.reports.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Last report emitted for `node`, if any.
    pub fn last_for(&self, node: &str) -> Option<StatusReport> {
        self.reports()
            .into_iter()
            .filter(|r| r.node == node)
            .next_back()
    }
}

impl StatusSink for CaptureStatusSink {
    fn emit(&self, report: StatusReport) {
        if let Ok(mut reports) = self.reports.lock() {
            reports.push(report);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_sink_records_in_order() {
        let sink = CaptureStatusSink::new();
        sink.emit(StatusReport::new("cav1", ProcedureStatus::Running, 0, "start"));
        sink.emit(StatusReport::new("cav1", ProcedureStatus::Complete, 100, "done"));
        let reports = sink.reports();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1].status, ProcedureStatus::Complete);
        assert_eq!(
            sink.last_for("cav1").map(|r| r.progress),
            Some(100)
        );
    }
}
