//! Command fan-out over the containment hierarchy.
//!
//! The [`SetupOrchestrator`] resolves an operator target to a set of cavities
//! and propagates one command to all of them. Long-running procedures (setup,
//! shutdown) run concurrently, one task per cavity, and the orchestrator
//! joins them all before reporting; a failure on one cavity never stops the
//! others. `ClearAbort` is a quick channel write and runs inline.

use crate::cavity::{Cavity, StageRequests};
use crate::error::SetupResult;
use crate::hierarchy::Machine;
use crate::status::ProcedureStatus;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// A command an operator can send to any scope of the hierarchy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SetupCommand {
    /// Run the setup sequence. `requests` overrides each cavity's stage
    /// flags when given; otherwise the flags already seeded on each cavity
    /// are used.
    Setup { requests: Option<StageRequests> },
    /// Turn RF and SSA off.
    Shutdown,
    /// Clear a pending abort so the next command is accepted.
    ClearAbort,
}

/// What happened on one cavity during a propagation.
#[derive(Clone, Debug)]
pub struct LeafOutcome {
    /// Cavity display name.
    pub cavity: String,
    /// Terminal status of the command on this cavity.
    pub status: ProcedureStatus,
    /// Failure detail when `status` is `Error`.
    pub detail: Option<String>,
}

/// Per-leaf outcomes of one propagated command.
#[derive(Debug, Default)]
pub struct PropagationReport {
    outcomes: Vec<LeafOutcome>,
}

impl PropagationReport {
    /// Outcomes in cavity order.
    pub fn outcomes(&self) -> &[LeafOutcome] {
        &self.outcomes
    }

    /// True when every cavity reached `Complete`.
    pub fn all_complete(&self) -> bool {
        self.outcomes
            .iter()
            .all(|o| o.status == ProcedureStatus::Complete)
    }

    /// The cavities that ended in `Error`.
    ///
    /// An "already running" rejection reports `Running` and is not a
    /// failure: the command was declined, not faulted.
    pub fn failures(&self) -> impl Iterator<Item = &LeafOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.status == ProcedureStatus::Error)
    }

    /// The cavities that declined the command because a procedure was
    /// already running.
    pub fn rejections(&self) -> impl Iterator<Item = &LeafOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.status == ProcedureStatus::Running)
    }
}

/// Propagates operator commands down the hierarchy.
pub struct SetupOrchestrator {
    machine: Arc<Machine>,
    exclusions: HashSet<String>,
}

impl SetupOrchestrator {
    /// Wrap `machine` with no exclusions.
    pub fn new(machine: Arc<Machine>) -> Self {
        Self {
            machine,
            exclusions: HashSet::new(),
        }
    }

    /// Cryomodules (by short name or label) to skip in machine and linac
    /// scopes. Directly targeting an excluded cryomodule still works.
    pub fn with_exclusions(mut self, exclusions: impl IntoIterator<Item = String>) -> Self {
        self.exclusions = exclusions.into_iter().collect();
        self
    }

    /// The machine this orchestrator commands.
    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    /// Request a cooperative abort on every cavity under `target`.
    ///
    /// Abort requests are flag writes, not procedures, so they are delivered
    /// inline and never wait for the running work to notice them.
    pub fn request_abort(&self, target: &str) -> SetupResult<()> {
        let cavities = self.machine.resolve(target, &self.exclusions)?;
        info!(target, count = cavities.len(), "requesting abort");
        for cavity in &cavities {
            cavity.request_abort();
        }
        Ok(())
    }

    /// Resolve `target` and propagate `command` to every cavity under it.
    ///
    /// Cavities outside the resolved scope are left entirely untouched. The
    /// returned report carries one outcome per cavity; resolution failure is
    /// the only error this function itself returns.
    pub async fn propagate(
        &self,
        target: &str,
        command: SetupCommand,
    ) -> SetupResult<PropagationReport> {
        let cavities = self.machine.resolve(target, &self.exclusions)?;
        info!(target, count = cavities.len(), ?command, "propagating command");

        let outcomes = match command {
            SetupCommand::Setup { requests } => {
                if let Some(requests) = requests {
                    for cavity in &cavities {
                        cavity.set_requests(requests);
                    }
                }
                self.run_concurrently(&cavities, |cavity| async move { cavity.setup().await })
                    .await
            }
            SetupCommand::Shutdown => {
                self.run_concurrently(&cavities, |cavity| async move { cavity.shut_down().await })
                    .await
            }
            SetupCommand::ClearAbort => cavities
                .iter()
                .map(|cavity| match cavity.clear_abort() {
                    Ok(()) => LeafOutcome {
                        cavity: cavity.name().to_string(),
                        status: ProcedureStatus::Complete,
                        detail: None,
                    },
                    Err(e) => {
                        warn!(cavity = %cavity.name(), error = %e, "clear abort failed");
                        LeafOutcome {
                            cavity: cavity.name().to_string(),
                            status: ProcedureStatus::Error,
                            detail: Some(e.to_string()),
                        }
                    }
                })
                .collect(),
        };

        Ok(PropagationReport { outcomes })
    }

    /// Run `procedure` on every cavity concurrently and join them all.
    async fn run_concurrently<F, Fut>(
        &self,
        cavities: &[Arc<Cavity>],
        procedure: F,
    ) -> Vec<LeafOutcome>
    where
        F: Fn(Arc<Cavity>) -> Fut,
        Fut: std::future::Future<Output = ProcedureStatus> + Send + 'static,
    {
        let names: Vec<String> = cavities.iter().map(|c| c.name().to_string()).collect();
        let handles: Vec<_> = cavities
            .iter()
            .map(|cavity| tokio::spawn(procedure(Arc::clone(cavity))))
            .collect();

        join_all(handles)
            .await
            .into_iter()
            .zip(names)
            .map(|(result, cavity)| match result {
                Ok(status) => LeafOutcome {
                    cavity,
                    status,
                    detail: None,
                },
                Err(e) => LeafOutcome {
                    cavity,
                    status: ProcedureStatus::Error,
                    detail: Some(format!("task failed: {e}")),
                },
            })
            .collect()
    }
}
