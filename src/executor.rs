//! Task execution.
//!
//! This module owns the lifecycle of a single child process: spawning it in
//! its own process group, pumping stdout and stderr through line splitters
//! onto the event bus, terminating the group when the surrounding scope is
//! cancelled, and reaping the child before reporting an outcome.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::TaskSpec;
use crate::events::{BusSender, StreamKind};

/// Time between the interrupt signal and the forced kill.
pub const GRACE: Duration = Duration::from_secs(5);

/// Longest line emitted as a single event; anything longer is split at this
/// boundary rather than dropped. Also bounds the splitter's buffer.
pub const MAX_LINE_LEN: usize = 64 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// Terminal result of one task execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The child exited with status zero.
    Success,
    /// Spawn failure, or a non-zero exit while the run was still live.
    Failed(String),
    /// The child was terminated because the scope was cancelled.
    Cancelled,
}

/// Runs one task to completion under a cancellation scope.
///
/// Returns only after the child has been reaped and both stdio pipes have hit
/// EOF, so no output can race with process exit. Restart is not this
/// function's concern; a failed task is reported, never retried.
pub async fn run_task(spec: &TaskSpec, token: CancellationToken, bus: BusSender) -> TaskOutcome {
    if token.is_cancelled() {
        return TaskOutcome::Cancelled;
    }

    let mut command = match build_command(spec) {
        Ok(command) => command,
        Err(message) => return TaskOutcome::Failed(message),
    };

    tracing::info!(task = %spec.name, command = %spec.command, "starting");
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => return TaskOutcome::Failed(format!("failed to start: {}", err)),
    };
    let pid = child.id();

    // Fires once the scope is cancelled: interrupt the whole process group,
    // then escalate after the grace period. Aborted as soon as the child is
    // reaped so a recycled pid is never signalled.
    let killer = {
        let token = token.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            if let Some(pid) = pid {
                signal_group(pid, TermSignal::Interrupt);
                tokio::time::sleep(GRACE).await;
                signal_group(pid, TermSignal::Kill);
            }
        })
    };

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    tokio::join!(
        async {
            if let Some(reader) = stdout {
                pump_lines(&spec.name, StreamKind::Stdout, reader, &bus).await;
            }
        },
        async {
            if let Some(reader) = stderr {
                pump_lines(&spec.name, StreamKind::Stderr, reader, &bus).await;
            }
        },
    );

    let status = child.wait().await;
    killer.abort();

    match status {
        Err(err) => TaskOutcome::Failed(format!("wait failed: {}", err)),
        Ok(status) if status.success() => TaskOutcome::Success,
        Ok(_) if token.is_cancelled() => TaskOutcome::Cancelled,
        Ok(status) => TaskOutcome::Failed(describe_exit(status)),
    }
}

fn build_command(spec: &TaskSpec) -> Result<Command, String> {
    let mut command = if spec.use_shell {
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg(&spec.command);
        command
    } else {
        let mut parts = shell_words::split(&spec.command)
            .map_err(|err| format!("failed to parse command: {}", err))?;
        if parts.is_empty() {
            return Err("empty command".to_string());
        }
        let program = parts.remove(0);
        let mut command = Command::new(program);
        command.args(parts);
        command
    };

    if let Some(dir) = &spec.working_dir {
        command.current_dir(dir);
    }
    if !spec.env.is_empty() {
        command.envs(&spec.env);
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command.kill_on_drop(true);

    // The child leads its own process group so a signal to prun does not
    // traverse to it, and so the whole subtree can be terminated at once.
    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            let _ = libc::setpgid(0, 0);
            Ok(())
        });
    }

    Ok(command)
}

fn describe_exit(status: std::process::ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exited with code {}", code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("terminated by signal {}", signal);
        }
    }
    "terminated without exit code".to_string()
}

#[derive(Debug, Clone, Copy)]
enum TermSignal {
    Interrupt,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: TermSignal) {
    let sig = match signal {
        TermSignal::Interrupt => libc::SIGINT,
        TermSignal::Kill => libc::SIGKILL,
    };
    unsafe {
        let pid = pid as i32;
        let _ = libc::kill(-pid, sig);
        let _ = libc::kill(pid, sig);
    }
}

// Without process groups the kill_on_drop backstop is all we have.
#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: TermSignal) {}

/// Reads a pipe to EOF and publishes one event per line.
///
/// Lines longer than [`MAX_LINE_LEN`] are split at the limit; the buffer
/// never grows past it. A trailing segment without a newline is emitted as a
/// final event. Read errors other than EOF are treated as EOF.
async fn pump_lines<R>(task: &str, stream: StreamKind, mut reader: R, bus: &BusSender)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut pending: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                tracing::debug!(task, ?stream, error = %err, "pipe read error, treating as EOF");
                break;
            }
        };
        pending.extend_from_slice(&chunk[..n]);
        flush_complete_lines(task, stream, &mut pending, bus).await;
    }
    if !pending.is_empty() {
        bus.log(task, decode(&pending), stream).await;
    }
}

async fn flush_complete_lines(
    task: &str,
    stream: StreamKind,
    pending: &mut Vec<u8>,
    bus: &BusSender,
) {
    loop {
        if let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            bus.log(task, decode(&line), stream).await;
        } else if pending.len() >= MAX_LINE_LEN {
            let head: Vec<u8> = pending.drain(..MAX_LINE_LEN).collect();
            bus.log(task, decode(&head), stream).await;
        } else {
            return;
        }
    }
}

fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{self, Event, LogEvent};
    use std::collections::HashMap;
    use std::time::Instant;
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

    async fn drain_logs(rx: &mut mpsc::Receiver<Event>) -> Vec<LogEvent> {
        let mut logs = Vec::new();
        while let Some(event) = rx.recv().await {
            if let Event::Log(log) = event {
                logs.push(log);
            }
        }
        logs
    }

    #[tokio::test]
    async fn splitter_emits_one_event_per_line() {
        let (bus, mut rx) = events::bus();
        let input: &[u8] = b"alpha\nbeta\ngamma\n";
        pump_lines("t", StreamKind::Stdout, input, &bus).await;
        drop(bus);
        let logs = drain_logs(&mut rx).await;
        let lines: Vec<&str> = logs.iter().map(|l| l.line.as_str()).collect();
        assert_eq!(lines, vec!["alpha", "beta", "gamma"]);
    }

    #[tokio::test]
    async fn splitter_emits_trailing_partial_line() {
        let (bus, mut rx) = events::bus();
        let input: &[u8] = b"complete\npartial";
        pump_lines("t", StreamKind::Stdout, input, &bus).await;
        drop(bus);
        let logs = drain_logs(&mut rx).await;
        let lines: Vec<&str> = logs.iter().map(|l| l.line.as_str()).collect();
        assert_eq!(lines, vec!["complete", "partial"]);
    }

    #[tokio::test]
    async fn splitter_strips_carriage_returns() {
        let (bus, mut rx) = events::bus();
        let input: &[u8] = b"windows\r\nunix\n";
        pump_lines("t", StreamKind::Stdout, input, &bus).await;
        drop(bus);
        let logs = drain_logs(&mut rx).await;
        let lines: Vec<&str> = logs.iter().map(|l| l.line.as_str()).collect();
        assert_eq!(lines, vec!["windows", "unix"]);
    }

    #[tokio::test]
    async fn splitter_splits_oversize_lines_instead_of_dropping() {
        let (bus, mut rx) = events::bus();
        let mut input = vec![b'x'; MAX_LINE_LEN + 10];
        input.push(b'\n');
        pump_lines("t", StreamKind::Stdout, input.as_slice(), &bus).await;
        drop(bus);
        let logs = drain_logs(&mut rx).await;
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].line.len(), MAX_LINE_LEN);
        assert_eq!(logs[1].line.len(), 10);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_command_and_captures_both_streams() {
        let (bus, mut rx) = events::bus();
        let spec = spec("echoes", "echo out; echo err 1>&2");
        let outcome = run_task(&spec, CancellationToken::new(), bus).await;
        assert_eq!(outcome, TaskOutcome::Success);
        let logs = drain_logs(&mut rx).await;
        assert!(logs
            .iter()
            .any(|l| l.line == "out" && l.stream == StreamKind::Stdout));
        assert!(logs
            .iter()
            .any(|l| l.line == "err" && l.stream == StreamKind::Stderr));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn preserves_line_order_within_a_stream() {
        let (bus, mut rx) = events::bus();
        let spec = spec("counter", "printf 'one\\ntwo\\nthree\\n'");
        let outcome = run_task(&spec, CancellationToken::new(), bus).await;
        assert_eq!(outcome, TaskOutcome::Success);
        let logs = drain_logs(&mut rx).await;
        let lines: Vec<&str> = logs.iter().map(|l| l.line.as_str()).collect();
        assert_eq!(lines, vec!["one", "two", "three"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_is_a_failure() {
        let (bus, _rx) = events::bus();
        let spec = spec("bad", "exit 3");
        let outcome = run_task(&spec, CancellationToken::new(), bus).await;
        match outcome {
            TaskOutcome::Failed(message) => assert!(message.contains("3")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_binary_is_a_failure() {
        let (bus, _rx) = events::bus();
        let mut spec = spec("ghost", "/definitely/not/a/binary");
        spec.use_shell = false;
        let outcome = run_task(&spec, CancellationToken::new(), bus).await;
        match outcome {
            TaskOutcome::Failed(message) => assert!(message.contains("failed to start")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_interrupts_and_reports_cancelled() {
        let (bus, _rx) = events::bus();
        let spec = spec("sleeper", "sleep 30");
        let token = CancellationToken::new();
        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                token.cancel();
            })
        };
        let started = Instant::now();
        let outcome = run_task(&spec, token, bus).await;
        canceller.await.unwrap();
        assert_eq!(outcome, TaskOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn applies_env_and_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let (bus, mut rx) = events::bus();
        let mut spec = spec("envy", "echo \"$PRUN_TEST_VALUE\"; pwd");
        spec.env
            .insert("PRUN_TEST_VALUE".to_string(), "forty-two".to_string());
        spec.working_dir = Some(dir.path().to_path_buf());
        let outcome = run_task(&spec, CancellationToken::new(), bus).await;
        assert_eq!(outcome, TaskOutcome::Success);
        let logs = drain_logs(&mut rx).await;
        let lines: Vec<&str> = logs.iter().map(|l| l.line.as_str()).collect();
        assert_eq!(lines[0], "forty-two");
        let reported = std::fs::canonicalize(lines[1]).unwrap();
        assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());
    }
}
