//! prun: run multiple commands in parallel.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, loads the task manifest, and wires the supervisor (or the watch
//! layer) to the selected output sink.

mod config;
mod dashboard;
mod events;
mod executor;
mod output;
mod signals;
mod supervisor;
mod watch;

use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use crate::config::ConfigError;
use crate::dashboard::Dashboard;
use crate::output::PrefixSink;
use crate::supervisor::Supervisor;
use crate::watch::WatchLayer;

const EXIT_RUN_FAILED: i32 = 1;
const EXIT_CONFIG_NOT_FOUND: i32 = 2;
const EXIT_CONFIG_PARSE: i32 = 3;
const EXIT_INTERRUPTED: i32 = 130;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "prun",
    version,
    about = "Run multiple commands in parallel with labelled output",
    after_help = "Examples:\n  prun                  Run all tasks defined in prun.toml\n  prun app server       Run only 'app' and 'server'\n  prun -w               Restart every task on file changes\n  prun -i -w            Interactive dashboard with file watching\n  prun -c dev.toml      Use dev.toml instead of prun.toml"
)]
struct Cli {
    /// Path to the task manifest.
    #[arg(short, long, default_value = "prun.toml")]
    config: PathBuf,
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,
    /// List configured tasks and exit.
    #[arg(short, long)]
    list: bool,
    /// Run in interactive dashboard mode.
    #[arg(short, long)]
    interactive: bool,
    /// Watch files and restart all tasks on changes.
    #[arg(short, long)]
    watch: bool,
    /// Task names to run; empty means every task from the manifest.
    tasks: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let code = run(cli).await;
    std::process::exit(code);
}

async fn run(cli: Cli) -> i32 {
    let manifest = match config::load_manifest(&cli.config) {
        Ok(manifest) => manifest,
        Err(err) => {
            eprintln!("prun: {}", err);
            return exit_code_for(&err);
        }
    };

    if cli.list {
        println!("Configured tasks:");
        for name in &manifest.order {
            if let Some(spec) = manifest.get(name) {
                println!("  {}: {}", name, spec.command);
            }
        }
        return 0;
    }

    let selected = match manifest.select(&cli.tasks) {
        Ok(selected) => selected,
        Err(err) => {
            eprintln!("prun: {}", err);
            return EXIT_RUN_FAILED;
        }
    };
    if selected.is_empty() {
        eprintln!("prun: no tasks to run");
        return 0;
    }

    let specs = manifest.specs_for(&selected);
    let watch_mode = cli.watch || specs.iter().any(|spec| spec.watch);
    let (bus, bus_rx) = events::bus();
    let root = CancellationToken::new();

    if cli.interactive {
        return run_interactive(specs, selected, watch_mode, cli.watch, bus, bus_rx, root).await;
    }

    signals::spawn_router(root.clone());
    let sink = tokio::spawn(PrefixSink::new().run(bus_rx));

    let run_token = root.child_token();
    let result = if watch_mode {
        tracing::debug!("watch mode enabled");
        WatchLayer::new(bus.clone())
            .run(specs, cli.watch, run_token)
            .await
            .map_err(|err| err.to_string())
    } else {
        Supervisor::new(bus.clone())
            .run(specs, run_token)
            .await
            .map_err(|err| err.to_string())
    };

    // Close the bus so the sink flushes every remaining event and exits.
    drop(bus);
    let _ = sink.await;

    if root.is_cancelled() {
        return EXIT_INTERRUPTED;
    }
    match result {
        Ok(()) => 0,
        Err(message) => {
            eprintln!("prun: {}", message);
            EXIT_RUN_FAILED
        }
    }
}

async fn run_interactive(
    specs: Vec<config::TaskSpec>,
    task_names: Vec<String>,
    watch_mode: bool,
    global_watch: bool,
    bus: events::BusSender,
    bus_rx: tokio::sync::mpsc::Receiver<events::Event>,
    root: CancellationToken,
) -> i32 {
    let run_token = root.child_token();
    let runner = tokio::spawn(async move {
        if watch_mode {
            WatchLayer::new(bus)
                .run(specs, global_watch, run_token)
                .await
                .map_err(|err| err.to_string())
        } else {
            Supervisor::new(bus)
                .run(specs, run_token)
                .await
                .map_err(|err| err.to_string())
        }
    });

    let interrupted = match Dashboard::new(task_names).run(bus_rx, root).await {
        Ok(interrupted) => interrupted,
        Err(err) => {
            eprintln!("prun: dashboard error: {}", err);
            return EXIT_RUN_FAILED;
        }
    };
    let result = runner.await;

    if interrupted {
        return EXIT_INTERRUPTED;
    }
    match result {
        Ok(Ok(())) => 0,
        Ok(Err(message)) => {
            eprintln!("prun: {}", message);
            EXIT_RUN_FAILED
        }
        Err(_) => EXIT_RUN_FAILED,
    }
}

fn exit_code_for(err: &ConfigError) -> i32 {
    match err {
        ConfigError::NotFound(_) => EXIT_CONFIG_NOT_FOUND,
        ConfigError::Parse { .. } | ConfigError::Invalid(_) => EXIT_CONFIG_PARSE,
        ConfigError::UnknownTask(_) => EXIT_RUN_FAILED,
    }
}

fn init_tracing(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        std::env::var("PRUN_LOG")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(tracing::Level::WARN)
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags_and_positional_tasks() {
        let cli = Cli::try_parse_from(["prun", "-v", "-w", "app", "server"]).unwrap();
        assert!(cli.verbose);
        assert!(cli.watch);
        assert!(!cli.interactive);
        assert_eq!(cli.config, PathBuf::from("prun.toml"));
        assert_eq!(cli.tasks, vec!["app", "server"]);
    }

    #[test]
    fn parses_long_config_flag() {
        let cli = Cli::try_parse_from(["prun", "--config", "dev.toml", "--list"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("dev.toml"));
        assert!(cli.list);
        assert!(cli.tasks.is_empty());
    }

    fn write_manifest(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("prun.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    fn cli_for(path: &PathBuf, extra: &[&str]) -> Cli {
        let mut args = vec!["prun", "-c", path.to_str().unwrap()];
        args.extend(extra);
        Cli::try_parse_from(args).unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn whole_manifest_runs_to_success() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(
            &dir,
            r#"
tasks = ["hello", "world"]

[task.hello]
cmd = "echo hello"

[task.world]
cmd = "echo world"
"#,
        );
        assert_eq!(run(cli_for(&path, &[])).await, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn positional_selection_runs_only_named_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(
            &dir,
            r#"
tasks = ["hello", "boom"]

[task.hello]
cmd = "echo hello"

[task.boom]
cmd = "exit 9"
"#,
        );
        // Only the healthy task is selected, so the run succeeds.
        assert_eq!(run(cli_for(&path, &["hello"])).await, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_task_exits_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(
            &dir,
            r#"
tasks = ["ok", "boom"]

[task.ok]
cmd = "echo fine"

[task.boom]
cmd = "exit 9"
"#,
        );
        assert_eq!(run(cli_for(&path, &[])).await, EXIT_RUN_FAILED);
    }

    #[tokio::test]
    async fn missing_manifest_exits_two() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prun.toml");
        let cli = Cli::try_parse_from(["prun", "-c", path.to_str().unwrap()]).unwrap();
        assert_eq!(run(cli).await, EXIT_CONFIG_NOT_FOUND);
    }

    #[tokio::test]
    async fn unparseable_manifest_exits_three() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(&dir, "tasks = [[");
        assert_eq!(run(cli_for(&path, &[])).await, EXIT_CONFIG_PARSE);
    }

    #[tokio::test]
    async fn unknown_task_name_exits_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(
            &dir,
            r#"
tasks = ["hello"]

[task.hello]
cmd = "echo hello"
"#,
        );
        assert_eq!(run(cli_for(&path, &["ghost"])).await, EXIT_RUN_FAILED);
    }

    #[tokio::test]
    async fn empty_selection_exits_zero_without_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(&dir, "tasks = []\n");
        assert_eq!(run(cli_for(&path, &[])).await, 0);
    }

    #[tokio::test]
    async fn list_mode_exits_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(
            &dir,
            r#"
tasks = ["hello"]

[task.hello]
cmd = "echo hello"
"#,
        );
        assert_eq!(run(cli_for(&path, &["--list"])).await, 0);
    }

    #[test]
    fn config_errors_map_to_documented_exit_codes() {
        assert_eq!(
            exit_code_for(&ConfigError::NotFound(PathBuf::from("prun.toml"))),
            EXIT_CONFIG_NOT_FOUND
        );
        assert_eq!(
            exit_code_for(&ConfigError::Invalid("bad".to_string())),
            EXIT_CONFIG_PARSE
        );
        assert_eq!(
            exit_code_for(&ConfigError::UnknownTask("ghost".to_string())),
            EXIT_RUN_FAILED
        );
    }
}
