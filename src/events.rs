//! Event definitions and the bus connecting tasks to the active sink.
//!
//! Every line a child process writes, and every status change the supervisor
//! reports, travels over one bounded channel with many producers and exactly
//! one consumer (the prefix sink or the dashboard, never both).

use std::time::SystemTime;

use tokio::sync::mpsc;

/// Indicates the source stream of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

/// One line of output from a task, without its trailing newline.
#[derive(Debug, Clone)]
pub struct LogEvent {
    /// Name of the task that produced the line.
    pub task: String,
    /// Line content, trailing newline (and carriage return) stripped.
    pub line: String,
    /// The stream it originated from (stdout/stderr).
    pub stream: StreamKind,
    /// When the line was read off the pipe.
    pub time: SystemTime,
}

/// Task status as shown by the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Not started, or started but silent so far.
    Idle,
    /// At least one line of output has been seen.
    Running,
    /// Finished without failure.
    Done,
    /// Failed, or was cancelled because another task failed.
    Failed,
}

/// Represents an event on the bus.
#[derive(Debug, Clone)]
pub enum Event {
    /// A line of output (stdout or stderr) from a task.
    Log(LogEvent),
    /// A terminal status reported by the supervisor when an executor returns.
    Status { task: String, status: TaskStatus },
}

/// Default bus capacity. Producers block in arrival order once this many
/// events are queued ahead of the consumer.
pub const BUS_CAPACITY: usize = 256;

/// Creates the event bus: a publish handle plus the single consumer end.
pub fn bus() -> (BusSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(BUS_CAPACITY);
    (BusSender { tx }, rx)
}

/// Cloneable publish handle to the event bus.
///
/// Publishing never errors: once the consumer is gone, events are discarded
/// so producers keep draining child pipes instead of deadlocking them.
#[derive(Clone)]
pub struct BusSender {
    tx: mpsc::Sender<Event>,
}

impl BusSender {
    /// Publishes a log line for a task.
    pub async fn log(&self, task: &str, line: String, stream: StreamKind) {
        let _ = self
            .tx
            .send(Event::Log(LogEvent {
                task: task.to_string(),
                line,
                stream,
                time: SystemTime::now(),
            }))
            .await;
    }

    /// Publishes a terminal status for a task.
    pub async fn status(&self, task: &str, status: TaskStatus) {
        let _ = self
            .tx
            .send(Event::Status {
                task: task.to_string(),
                status,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bus_delivers_in_order() {
        let (tx, mut rx) = bus();
        tx.log("api", "one".into(), StreamKind::Stdout).await;
        tx.log("api", "two".into(), StreamKind::Stderr).await;
        drop(tx);

        match rx.recv().await.unwrap() {
            Event::Log(ev) => {
                assert_eq!(ev.task, "api");
                assert_eq!(ev.line, "one");
                assert_eq!(ev.stream, StreamKind::Stdout);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match rx.recv().await.unwrap() {
            Event::Log(ev) => assert_eq!(ev.line, "two"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn publish_after_consumer_drop_is_discarded() {
        let (tx, rx) = bus();
        drop(rx);
        // Must not error or hang.
        tx.log("api", "into the void".into(), StreamKind::Stdout).await;
        tx.status("api", TaskStatus::Done).await;
    }
}
