//! Abortable-procedure capability.
//!
//! Every node in the containment hierarchy carries an [`AbortState`]: a pair
//! of atomics giving it a cooperative abort flag and a re-entry guard. The two
//! invariants enforced here are the load-bearing ones of the whole system:
//!
//! - `script_running` is claimed with a single compare-and-swap
//!   ([`AbortState::try_start`]) so two near-simultaneous start requests can
//!   never both win, and is released by an RAII [`RunGuard`] on every exit
//!   path (return, abort, fault, panic unwind).
//! - `abort_requested` has one-writer/many-reader semantics and is observed
//!   by running procedures within one [`POLL_INTERVAL`]; long waits go
//!   through [`AbortState::sleep_checked`], which slices the wait so nothing
//!   ever blocks uninterruptibly.

use crate::error::{SetupError, SetupResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Bound on how stale an abort observation can be.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Abort flag plus running guard for one hierarchy node.
#[derive(Debug, Default)]
pub struct AbortState {
    abort_requested: AtomicBool,
    script_running: AtomicBool,
}

impl AbortState {
    /// Create a fresh state (not running, no abort pending).
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Request a cooperative abort of whatever is running on this node.
    ///
    /// Safe to call from any thread; the running procedure observes it at its
    /// next poll point.
    pub fn request_abort(&self) {
        self.abort_requested.store(true, Ordering::SeqCst);
    }

    /// Clear a pending abort request.
    pub fn clear_abort(&self) {
        self.abort_requested.store(false, Ordering::SeqCst);
    }

    /// Whether an abort is currently pending.
    pub fn abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::SeqCst)
    }

    /// Whether a procedure currently holds the running guard.
    pub fn is_running(&self) -> bool {
        self.script_running.load(Ordering::SeqCst)
    }

    /// Atomically claim the running guard.
    ///
    /// Returns `None` if a procedure is already running. That outcome is a
    /// control decision, not an error: callers report it as a status message
    /// and leave the running procedure alone.
    pub fn try_start(self: &Arc<Self>) -> Option<RunGuard> {
        self.script_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunGuard {
                state: Arc::clone(self),
            })
    }

    /// Fail fast if an abort has been requested.
    ///
    /// Consumes the request (mirroring the original consume-on-observation
    /// behavior) so a stale flag cannot kill the next run.
    pub fn check_abort(&self, who: &str) -> SetupResult<()> {
        if self.abort_requested() {
            self.clear_abort();
            return Err(SetupError::Aborted(format!("Abort requested for {who}")));
        }
        Ok(())
    }

    /// Sleep for `duration`, polling the abort flag every [`POLL_INTERVAL`].
    pub async fn sleep_checked(&self, duration: Duration, who: &str) -> SetupResult<()> {
        let mut remaining = duration;
        while remaining > Duration::ZERO {
            self.check_abort(who)?;
            let slice = remaining.min(POLL_INTERVAL);
            tokio::time::sleep(slice).await;
            remaining = remaining.saturating_sub(slice);
        }
        self.check_abort(who)
    }
}

/// Scoped ownership of a node's `script_running` flag.
///
/// Dropping the guard releases the flag, which is what guarantees release on
/// every exit path of a procedure body.
#[derive(Debug)]
pub struct RunGuard {
    state: Arc<AbortState>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.state.script_running.store(false, Ordering::SeqCst);
    }
}
