//! Concurrent fan-out with partial-failure handling.
//!
//! [`Dispatcher::execute`] walks a ranked list of backends and keeps up to
//! `fan_out` calls running at once, each in its own task under a slice of
//! the request deadline. Completions are collected as they arrive. The
//! caller is unblocked as soon as `min_success` results are in, or when
//! the deadline fires; calls still running at that point carry on in the
//! background and record their outcome in the [`MetricsStore`].
//!
//! When a call fails and the calls still running can no longer reach
//! `min_success`, the next backend in the ranking is launched, so a
//! single-backend dispatch (`fan_out = 1`) is sequential failover.
//! Backends at their `max_in_flight` limit are skipped.

mod call;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::OrchesityError;
use crate::backend::BackendSlot;
use crate::scoring::MetricsStore;
use crate::types::{
    BackendFailure, BackendId, BackendResult, DispatchStatus, ErrorKind, GenerationParams,
};

use call::{CallContext, Report};

/// Default time a call may keep running after its caller stopped waiting.
pub const DEFAULT_LATE_COMPLETION_GRACE: Duration = Duration::from_secs(60);

/// Longest deadline a dispatch honours. Longer budgets are capped.
pub const MAX_DEADLINE: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Per-call limits applied by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchSettings {
    /// Cap on a single call's slice. `None` lets a call use the whole
    /// remaining deadline.
    pub backend_timeout: Option<Duration>,
    /// How long a timed-out call is still polled to record its outcome.
    pub late_completion_grace: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            backend_timeout: None,
            late_completion_grace: DEFAULT_LATE_COMPLETION_GRACE,
        }
    }
}

/// One dispatch: what to send, and how many answers are enough.
#[derive(Debug, Clone)]
pub struct DispatchPlan {
    pub prompt: Arc<str>,
    pub params: Arc<GenerationParams>,
    /// Calls kept running concurrently.
    pub fan_out: usize,
    /// Successes that satisfy the request.
    pub min_success: usize,
    /// Wall-clock budget for the whole dispatch, capped at [`MAX_DEADLINE`].
    pub deadline: Duration,
}

/// Everything the dispatcher learned before unblocking the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub status: DispatchStatus,
    /// Successes in completion order.
    pub results: Vec<BackendResult>,
    pub errors: Vec<BackendFailure>,
    /// Calls still running when the caller was unblocked early.
    pub pending: Vec<BackendId>,
    /// Calls actually started.
    pub launched: usize,
}

impl DispatchOutcome {
    fn classify(
        results: Vec<BackendResult>,
        errors: Vec<BackendFailure>,
        pending: Vec<BackendId>,
        launched: usize,
    ) -> Self {
        let status = if results.is_empty() {
            if !errors.is_empty() && errors.iter().all(|e| e.kind == ErrorKind::Timeout) {
                DispatchStatus::TimedOut
            } else {
                DispatchStatus::AllFailed
            }
        } else if errors.is_empty() && pending.is_empty() {
            DispatchStatus::Completed
        } else {
            DispatchStatus::PartialSuccess
        };
        Self {
            status,
            results,
            errors,
            pending,
            launched,
        }
    }

    /// Convert a zero-success outcome into the caller-facing error.
    pub fn into_result(self) -> crate::Result<Self> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(OrchesityError::AllBackendsFailed {
                timed_out: self.status == DispatchStatus::TimedOut,
                errors: self.errors,
            })
        }
    }
}

/// Executes dispatch plans and feeds every outcome to the metrics store.
#[derive(Debug)]
pub struct Dispatcher {
    store: Arc<MetricsStore>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(store: Arc<MetricsStore>, settings: DispatchSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Run `plan` against `ranked`, best backend first.
    #[instrument(
        name = "dispatch",
        skip_all,
        fields(candidates = ranked.len(), fan_out = plan.fan_out, min_success = plan.min_success)
    )]
    pub async fn execute(&self, ranked: &[Arc<BackendSlot>], plan: &DispatchPlan) -> DispatchOutcome {
        let deadline = Instant::now() + plan.deadline.min(MAX_DEADLINE);
        let fan_out = plan.fan_out.max(1);
        let min_success = plan.min_success.max(1);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut queue = ranked.iter();
        let mut running: Vec<(BackendId, Instant)> = Vec::new();
        let mut results = Vec::new();
        let mut errors = Vec::new();
        let mut launched = 0;

        while running.len() < fan_out {
            match self.launch_next(&mut queue, plan, deadline, &tx) {
                Some(id) => {
                    running.push((id, Instant::now()));
                    launched += 1;
                }
                None => break,
            }
        }

        while results.len() < min_success && !running.is_empty() {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(report)) => {
                    let Report { backend, outcome } = report;
                    running.retain(|(id, _)| id != &backend);
                    match outcome {
                        Ok(result) => results.push(result),
                        Err(failure) => errors.push(failure),
                    }
                    // refill only when the running calls cannot reach the threshold
                    while results.len() + running.len() < min_success {
                        match self.launch_next(&mut queue, plan, deadline, &tx) {
                            Some(id) => {
                                debug!(backend = %id, "failing over");
                                running.push((id, Instant::now()));
                                launched += 1;
                            }
                            None => break,
                        }
                    }
                }
                // unreachable while `tx` is alive
                Ok(None) => break,
                Err(_) => {
                    for (backend, started) in running.drain(..) {
                        let after = started.elapsed();
                        let err = OrchesityError::BackendTimeout {
                            backend: backend.clone(),
                            after,
                        };
                        errors.push(BackendFailure {
                            backend,
                            kind: ErrorKind::Timeout,
                            message: err.to_string(),
                            latency: after,
                        });
                    }
                }
            }
        }

        let pending: Vec<BackendId> = running.into_iter().map(|(id, _)| id).collect();
        let outcome = DispatchOutcome::classify(results, errors, pending, launched);
        debug!(
            status = outcome.status.as_str(),
            successes = outcome.results.len(),
            failures = outcome.errors.len(),
            pending = outcome.pending.len(),
            "dispatch finished"
        );
        outcome
    }

    /// Start the next backend in `queue` that has capacity.
    fn launch_next<'a>(
        &self,
        queue: &mut impl Iterator<Item = &'a Arc<BackendSlot>>,
        plan: &DispatchPlan,
        deadline: Instant,
        tx: &mpsc::UnboundedSender<Report>,
    ) -> Option<BackendId> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }
        for slot in queue.by_ref() {
            let Some(guard) = slot.try_acquire() else {
                debug!(backend = %slot.id(), "backend at capacity, skipping");
                continue;
            };
            let slice = self
                .settings
                .backend_timeout
                .map_or(remaining, |cap| cap.min(remaining));
            let ctx = CallContext {
                store: Arc::clone(&self.store),
                prompt: Arc::clone(&plan.prompt),
                params: Arc::clone(&plan.params),
                slice,
                grace: self.settings.late_completion_grace,
                reports: tx.clone(),
            };
            tokio::spawn(call::run(guard, ctx));
            return Some(slot.id().clone());
        }
        None
    }
}
