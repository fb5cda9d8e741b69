//! Bounded-concurrency executor for sync actions.
//!
//! Directory creation runs inline on the dispatcher, so nothing below a new
//! directory is dispatched before it exists. Every other transfer takes an
//! owned semaphore permit and runs on the blocking pool; the permit is
//! released when the task ends, whatever the result.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::error::DriveError;
use crate::sync::plan::{error_path, ActionKind, SyncAction};

/// Performs one action against the store or the local filesystem.
///
/// Returns the number of bytes transferred.
pub trait ActionRunner: Send + Sync + 'static {
    fn run(&self, action: &SyncAction) -> Result<u64, DriveError>;
}

/// Completion of one action, or of a path the differ could not handle.
#[derive(Debug)]
pub struct Outcome {
    pub path: String,
    /// `None` for errors raised before anything was dispatched.
    pub kind: Option<ActionKind>,
    pub result: Result<u64, DriveError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Fatal,
    Cancelled,
}

#[derive(Debug, Default)]
pub struct ExecutionSummary {
    pub completed: u64,
    pub failed: u64,
    pub stopped: Option<StopReason>,
}

impl ExecutionSummary {
    fn count(&mut self, outcome: &Outcome) {
        match &outcome.result {
            Ok(_) => self.completed += 1,
            Err(e) => {
                self.failed += 1;
                if e.is_fatal() {
                    self.stopped = Some(StopReason::Fatal);
                }
            }
        }
    }
}

pub struct TransferScheduler {
    concurrency: usize,
    cancel: CancellationToken,
}

impl TransferScheduler {
    pub fn new(concurrency: usize, cancel: CancellationToken) -> Self {
        Self {
            concurrency: concurrency.max(1),
            cancel,
        }
    }

    /// Run every action, at most `concurrency` transfers at a time.
    ///
    /// Failures are reported through `on_outcome` and do not stop the run.
    /// A fatal error or cancellation stops new dispatch; tasks already in
    /// flight are always drained before this returns.
    pub async fn execute<I, R, F>(
        &self,
        actions: I,
        runner: Arc<R>,
        mut on_outcome: F,
    ) -> ExecutionSummary
    where
        I: IntoIterator<Item = Result<SyncAction, DriveError>>,
        R: ActionRunner,
        F: FnMut(Outcome),
    {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks: JoinSet<Outcome> = JoinSet::new();
        // What each running task is working on, so a panic can still be reported.
        let mut in_flight: HashMap<Id, (String, ActionKind)> = HashMap::new();
        let mut summary = ExecutionSummary::default();

        let mut deliver = |outcome: Outcome, summary: &mut ExecutionSummary| {
            summary.count(&outcome);
            on_outcome(outcome);
        };

        for item in actions {
            while let Some(joined) = tasks.try_join_next_with_id() {
                deliver(joined_outcome(joined, &mut in_flight), &mut summary);
            }
            if summary.stopped.is_some() {
                break;
            }
            if self.cancel.is_cancelled() {
                summary.stopped = Some(StopReason::Cancelled);
                break;
            }

            let action = match item {
                Ok(action) => action,
                Err(e) => {
                    let outcome = Outcome {
                        path: error_path(&e),
                        kind: None,
                        result: Err(e),
                    };
                    deliver(outcome, &mut summary);
                    continue;
                }
            };
            let kind = action.kind();
            let path = action.path().to_string();

            if kind.is_immediate() {
                let result = runner.run(&action);
                deliver(Outcome { path, kind: Some(kind), result }, &mut summary);
                continue;
            }

            if kind.creates_directory() {
                let runner = runner.clone();
                let dir_path = path.clone();
                let joined = tokio::task::spawn_blocking(move || {
                    let result = runner.run(&action);
                    Outcome { path, kind: Some(kind), result }
                })
                .await;
                let outcome = joined.unwrap_or_else(|e| task_failed(dir_path, Some(kind), e));
                deliver(outcome, &mut summary);
                continue;
            }

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = self.cancel.cancelled() => {
                    summary.stopped = Some(StopReason::Cancelled);
                    break;
                }
            };
            tracing::trace!(path = %path, "Dispatching {}", kind.label());
            let runner = runner.clone();
            let task_path = path.clone();
            let handle = tasks.spawn_blocking(move || {
                let _permit = permit;
                let result = runner.run(&action);
                Outcome { path, kind: Some(kind), result }
            });
            in_flight.insert(handle.id(), (task_path, kind));
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            deliver(joined_outcome(joined, &mut in_flight), &mut summary);
        }

        if let Some(reason) = summary.stopped {
            tracing::warn!(?reason, "Dispatch stopped early");
        }
        summary
    }
}

fn joined_outcome(
    joined: Result<(Id, Outcome), JoinError>,
    in_flight: &mut HashMap<Id, (String, ActionKind)>,
) -> Outcome {
    match joined {
        Ok((id, outcome)) => {
            in_flight.remove(&id);
            outcome
        }
        Err(e) => match in_flight.remove(&e.id()) {
            Some((path, kind)) => task_failed(path, Some(kind), e),
            None => task_failed(String::new(), None, e),
        },
    }
}

fn task_failed(path: String, kind: Option<ActionKind>, err: JoinError) -> Outcome {
    tracing::error!(path = %path, "Transfer task failed: {}", err);
    Outcome {
        path,
        kind,
        result: Err(DriveError::Sync(format!("transfer task failed: {}", err))),
    }
}
