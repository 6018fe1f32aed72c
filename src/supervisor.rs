//! Concurrent task supervision.
//!
//! The supervisor owns one executor per selected task, fails fast on the
//! first failure by cancelling the shared run scope, and reports the first
//! failure in completion order once every executor has returned.

use std::collections::HashMap;

use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::TaskSpec;
use crate::events::{BusSender, TaskStatus};
use crate::executor::{self, TaskOutcome};

/// The failure a run is reported with: the first failing task.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("task '{task}': {message}")]
pub struct TaskFailure {
    pub task: String,
    pub message: String,
}

/// Lifecycle of one task slot. `Idle → Running` at spawn, one terminal state
/// when its executor returns; no other transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Running,
    ExitedSuccess,
    ExitedFailure,
    Cancelled,
}

/// Per-task mutable state, created on supervisor entry and dropped on exit.
#[derive(Debug)]
struct TaskRuntime {
    state: TaskState,
}

pub struct Supervisor {
    bus: BusSender,
}

impl Supervisor {
    pub fn new(bus: BusSender) -> Self {
        Self { bus }
    }

    /// Launches every selected task concurrently and waits for all of them.
    ///
    /// On the first failure the run scope is cancelled, which quiesces the
    /// remaining executors through their termination path. The selection
    /// order only decides spawn order, not scheduling.
    pub async fn run(
        &self,
        specs: Vec<TaskSpec>,
        token: CancellationToken,
    ) -> Result<(), TaskFailure> {
        let mut runtimes: HashMap<String, TaskRuntime> = specs
            .iter()
            .map(|spec| {
                (
                    spec.name.clone(),
                    TaskRuntime {
                        state: TaskState::Idle,
                    },
                )
            })
            .collect();

        let mut set = JoinSet::new();
        for spec in specs {
            let child = token.child_token();
            let bus = self.bus.clone();
            if let Some(runtime) = runtimes.get_mut(&spec.name) {
                runtime.state = TaskState::Running;
            }
            set.spawn(async move {
                let outcome = executor::run_task(&spec, child, bus).await;
                (spec.name, outcome)
            });
        }

        let mut first_failure: Option<TaskFailure> = None;
        while let Some(joined) = set.join_next().await {
            let (name, outcome) = match joined {
                Ok(result) => result,
                Err(err) => {
                    tracing::error!(error = %err, "executor task aborted");
                    continue;
                }
            };

            if let Some(runtime) = runtimes.get_mut(&name) {
                runtime.state = match outcome {
                    TaskOutcome::Success => TaskState::ExitedSuccess,
                    TaskOutcome::Failed(_) => TaskState::ExitedFailure,
                    TaskOutcome::Cancelled => TaskState::Cancelled,
                };
            }

            // A cancelled slot counts against whichever party cancelled it:
            // fail-fast shows as failed, operator shutdown as done.
            let status = match &outcome {
                TaskOutcome::Success => TaskStatus::Done,
                TaskOutcome::Failed(_) => TaskStatus::Failed,
                TaskOutcome::Cancelled if first_failure.is_some() => TaskStatus::Failed,
                TaskOutcome::Cancelled => TaskStatus::Done,
            };
            self.bus.status(&name, status).await;

            if let TaskOutcome::Failed(message) = outcome {
                if first_failure.is_none() {
                    first_failure = Some(TaskFailure {
                        task: name,
                        message,
                    });
                    token.cancel();
                } else {
                    tracing::info!(task = %name, %message, "task failed during shutdown");
                }
            }
        }

        let cancelled = runtimes
            .values()
            .filter(|runtime| runtime.state == TaskState::Cancelled)
            .count();
        tracing::debug!(tasks = runtimes.len(), cancelled, "all executors returned");

        match first_failure {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{self, Event};
    use std::time::{Duration, Instant};
    use tokio::sync::mpsc;

    fn spec(name: &str, command: &str) -> TaskSpec {
        TaskSpec {
            name: name.to_string(),
            command: command.to_string(),
            working_dir: None,
            env: HashMap::new(),
            use_shell: true,
            watch: false,
        }
    }

    async fn statuses(rx: &mut mpsc::Receiver<Event>) -> Vec<(String, TaskStatus)> {
        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            if let Event::Status { task, status } = event {
                seen.push((task, status));
            }
        }
        seen
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn all_successes_return_ok() {
        let (bus, mut rx) = events::bus();
        let supervisor = Supervisor::new(bus);
        let result = supervisor
            .run(
                vec![spec("hello", "echo hello"), spec("world", "echo world")],
                CancellationToken::new(),
            )
            .await;
        assert!(result.is_ok());
        drop(supervisor);
        let seen = statuses(&mut rx).await;
        assert!(seen.contains(&("hello".to_string(), TaskStatus::Done)));
        assert!(seen.contains(&("world".to_string(), TaskStatus::Done)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn first_failure_cancels_the_rest() {
        let (bus, mut rx) = events::bus();
        let supervisor = Supervisor::new(bus);
        let started = Instant::now();
        let result = supervisor
            .run(
                vec![spec("bad", "exit 7"), spec("slow", "sleep 30")],
                CancellationToken::new(),
            )
            .await;
        let failure = result.unwrap_err();
        assert_eq!(failure.task, "bad");
        assert!(failure.message.contains("7"));
        // The sleeper must be interrupted well before its own runtime.
        assert!(started.elapsed() < Duration::from_secs(10));
        drop(supervisor);
        let seen = statuses(&mut rx).await;
        assert!(seen.contains(&("bad".to_string(), TaskStatus::Failed)));
        // Cancelled by fail-fast, so reported as failed.
        assert!(seen.contains(&("slow".to_string(), TaskStatus::Failed)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reports_first_failure_by_completion_order() {
        let (bus, _rx) = events::bus();
        let supervisor = Supervisor::new(bus);
        let result = supervisor
            .run(
                vec![
                    spec("late", "sleep 1; exit 1"),
                    spec("early", "sleep 0.1; exit 2"),
                ],
                CancellationToken::new(),
            )
            .await;
        assert_eq!(result.unwrap_err().task, "early");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shutdown_cancellation_reports_done() {
        let (bus, mut rx) = events::bus();
        let supervisor = Supervisor::new(bus);
        let token = CancellationToken::new();
        let stopper = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                token.cancel();
            })
        };
        let result = supervisor.run(vec![spec("svc", "sleep 30")], token).await;
        stopper.await.unwrap();
        assert!(result.is_ok());
        drop(supervisor);
        let seen = statuses(&mut rx).await;
        assert!(seen.contains(&("svc".to_string(), TaskStatus::Done)));
    }
}
