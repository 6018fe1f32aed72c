//! File watching and restart-on-change.
//!
//! The watch layer wraps executors with cancel-and-respawn semantics. A
//! single recursive registration feeds one global debounce window; when the
//! window closes, every watched task receives a restart pulse through a
//! single-slot coalescing mailbox and its per-task loop cancels and relaunches
//! the executor.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::TaskSpec;
use crate::events::{BusSender, StreamKind, TaskStatus};
use crate::executor::{self, TaskOutcome};

/// Quiet period after the last significant filesystem event before restart
/// pulses are emitted.
pub const DEBOUNCE: Duration = Duration::from_millis(500);

/// Directory names never descended into, besides anything dot-prefixed.
const EXCLUDED_DIRS: [&str; 4] = ["node_modules", "vendor", "dist", "build"];

pub struct WatchLayer {
    bus: BusSender,
}

impl WatchLayer {
    pub fn new(bus: BusSender) -> Self {
        Self { bus }
    }

    /// Runs the selected tasks with restart-on-change for the watched ones.
    ///
    /// Watched means the per-task `watch` flag, or every task when
    /// `global_watch` is set. Non-watched tasks run exactly once and end
    /// their slot. Task failures here are reported but do not end the run;
    /// watch mode runs until the root scope is cancelled (or every slot has
    /// terminated).
    pub async fn run(
        &self,
        specs: Vec<TaskSpec>,
        global_watch: bool,
        token: CancellationToken,
    ) -> Result<()> {
        let (fs_tx, fs_rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    let _ = fs_tx.send(event);
                }
                Err(err) => tracing::warn!(error = %err, "file watch error"),
            },
            notify::Config::default(),
        )
        .context("failed to create file watcher")?;

        let mut visited = HashSet::new();
        let mut pulse_txs = Vec::new();
        let mut slots = Vec::new();
        for spec in specs {
            if global_watch || spec.watch {
                let dir = spec
                    .working_dir
                    .clone()
                    .unwrap_or_else(|| PathBuf::from("."));
                register_tree(&mut watcher, &dir, &mut visited).with_context(|| {
                    format!("failed to watch directory for task '{}'", spec.name)
                })?;
                tracing::info!(task = %spec.name, dir = %dir.display(), "watching directory");
                let (tx, rx) = mpsc::channel(1);
                pulse_txs.push(tx);
                slots.push((spec, Some(rx)));
            } else {
                slots.push((spec, None));
            }
        }

        let debouncer = tokio::spawn(debounce_loop(fs_rx, pulse_txs, token.clone()));

        let mut set = JoinSet::new();
        for (spec, pulses) in slots {
            set.spawn(task_loop(spec, pulses, token.clone(), self.bus.clone()));
        }
        while set.join_next().await.is_some() {}

        debouncer.abort();
        drop(watcher);
        Ok(())
    }
}

/// Registers `root` and every non-excluded subdirectory individually.
///
/// The shared `visited` set holds canonical paths, which both breaks symlink
/// loops and deduplicates overlapping task directories. Only the root itself
/// failing is fatal; deeper failures are logged and skipped.
fn register_tree(
    watcher: &mut RecommendedWatcher,
    root: &Path,
    visited: &mut HashSet<PathBuf>,
) -> Result<()> {
    let canonical = root
        .canonicalize()
        .with_context(|| format!("cannot resolve {}", root.display()))?;
    if visited.insert(canonical.clone()) {
        watcher
            .watch(&canonical, RecursiveMode::NonRecursive)
            .with_context(|| format!("cannot watch {}", canonical.display()))?;
        register_children(watcher, &canonical, visited);
    }
    Ok(())
}

fn register_children(
    watcher: &mut RecommendedWatcher,
    dir: &Path,
    visited: &mut HashSet<PathBuf>,
) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::debug!(dir = %dir.display(), error = %err, "cannot list directory");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name();
        if is_excluded_dir(&name.to_string_lossy()) {
            continue;
        }
        let Ok(canonical) = path.canonicalize() else {
            continue;
        };
        if !visited.insert(canonical) {
            continue;
        }
        if let Err(err) = watcher.watch(&path, RecursiveMode::NonRecursive) {
            tracing::debug!(dir = %path.display(), error = %err, "failed to watch directory");
            continue;
        }
        register_children(watcher, &path, visited);
    }
}

fn is_excluded_dir(name: &str) -> bool {
    name.starts_with('.') || EXCLUDED_DIRS.contains(&name)
}

/// Create and data-write events count; remove, rename and metadata changes
/// do not. Two writes to the same file both count.
fn is_significant(event: &notify::Event) -> bool {
    use notify::event::ModifyKind;
    use notify::EventKind;
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any)
    )
}

/// Turns raw filesystem events into restart pulses.
///
/// A significant event opens a global debounce window, each further one
/// extends it; when it closes, one pulse goes to every watched task. A full
/// mailbox absorbs the pulse, so a task never queues more than one restart.
async fn debounce_loop(
    mut events: mpsc::UnboundedReceiver<notify::Event>,
    mailboxes: Vec<mpsc::Sender<()>>,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => return,
            event = events.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };
        if !is_significant(&event) {
            continue;
        }
        tracing::debug!(paths = ?event.paths, "file changed");

        let mut deadline = Instant::now() + DEBOUNCE;
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep_until(deadline) => break,
                event = events.recv() => match event {
                    Some(event) => {
                        if is_significant(&event) {
                            deadline = Instant::now() + DEBOUNCE;
                        }
                    }
                    None => break,
                },
            }
        }

        for mailbox in &mailboxes {
            let _ = mailbox.try_send(());
        }
    }
}

/// Drives one task slot: `running` while the executor is live, `draining`
/// once a pulse cancels it, `cooldown` after a natural exit. A slot with no
/// mailbox runs exactly once.
async fn task_loop(
    spec: TaskSpec,
    mut pulses: Option<mpsc::Receiver<()>>,
    root: CancellationToken,
    bus: BusSender,
) {
    loop {
        let scope = root.child_token();
        let exec = executor::run_task(&spec, scope.clone(), bus.clone());
        tokio::pin!(exec);

        let finished = match pulses.as_mut() {
            Some(rx) => {
                tokio::select! {
                    outcome = &mut exec => Some(outcome),
                    pulse = rx.recv() => match pulse {
                        Some(()) => None,
                        // Pulse source gone; just let the run finish.
                        None => Some(exec.as_mut().await),
                    },
                }
            }
            None => Some(exec.as_mut().await),
        };

        match finished {
            Some(outcome) => {
                report(&bus, &spec.name, &outcome, &root).await;
                if root.is_cancelled() {
                    return;
                }
                let Some(rx) = pulses.as_mut() else {
                    return;
                };
                tokio::select! {
                    _ = root.cancelled() => return,
                    pulse = rx.recv() => {
                        if pulse.is_none() {
                            return;
                        }
                    }
                }
                bus.log(&spec.name, "Restarted".to_string(), StreamKind::Stdout)
                    .await;
            }
            None => {
                scope.cancel();
                let _ = exec.as_mut().await;
                if root.is_cancelled() {
                    return;
                }
                // Pulses that arrived while draining collapse into this
                // restart.
                if let Some(rx) = pulses.as_mut() {
                    while rx.try_recv().is_ok() {}
                }
                bus.log(&spec.name, "Restarted".to_string(), StreamKind::Stdout)
                    .await;
            }
        }
    }
}

async fn report(bus: &BusSender, task: &str, outcome: &TaskOutcome, root: &CancellationToken) {
    match outcome {
        TaskOutcome::Success => bus.status(task, TaskStatus::Done).await,
        TaskOutcome::Failed(message) => {
            tracing::info!(task, %message, "task failed");
            bus.status(task, TaskStatus::Failed).await;
        }
        TaskOutcome::Cancelled => {
            let status = if root.is_cancelled() {
                TaskStatus::Done
            } else {
                TaskStatus::Failed
            };
            bus.status(task, status).await;
        }
    }
}
