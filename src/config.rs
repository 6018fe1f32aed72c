//! Configuration management for prun.
//!
//! This module defines the structure of the `prun.toml` manifest and provides
//! functionality to load, validate and select tasks from it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Errors produced while loading or using the manifest.
///
/// `main` maps these onto process exit codes: [`ConfigError::NotFound`] is
/// exit 2, [`ConfigError::Parse`] and [`ConfigError::Invalid`] are exit 3,
/// [`ConfigError::UnknownTask`] is exit 1.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no {} found — run `prun --help` to see usage", .0.display())]
    NotFound(PathBuf),

    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("{0}")]
    Invalid(String),

    #[error("task '{0}' not defined in config")]
    UnknownTask(String),
}

/// Specification of a single task, immutable after load.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// Unique task name (the table key under `[task.<name>]`).
    pub name: String,
    /// Command line, interpreted by the shell unless `shell = false`.
    pub command: String,
    /// Working directory for the child; defaults to prun's own.
    pub working_dir: Option<PathBuf>,
    /// Extra environment merged over the inherited one.
    pub env: HashMap<String, String>,
    /// Run via `sh -c` (default) or tokenise and exec directly.
    pub use_shell: bool,
    /// Restart this task on file changes.
    pub watch: bool,
}

/// The parsed and validated `prun.toml`.
#[derive(Debug, Clone)]
pub struct Manifest {
    /// Task names in declaration order. Defines launch and display order,
    /// not scheduling priority.
    pub order: Vec<String>,
    specs: HashMap<String, TaskSpec>,
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    #[serde(default)]
    tasks: Vec<String>,
    #[serde(default, rename = "task")]
    task_defs: HashMap<String, RawTask>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTask {
    #[serde(default)]
    cmd: String,
    path: Option<PathBuf>,
    env: Option<HashMap<String, String>>,
    shell: Option<bool>,
    watch: Option<bool>,
    // Accepted by an older manifest revision; no longer drives anything, so
    // it is rejected rather than silently ignored.
    restart: Option<toml::Value>,
}

/// Loads and validates the manifest from a file path.
pub fn load_manifest(path: &Path) -> Result<Manifest, ConfigError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        Err(err) => {
            return Err(ConfigError::Invalid(format!(
                "failed to read {}: {}",
                path.display(),
                err
            )));
        }
    };
    let raw: RawManifest = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    validate(raw)
}

fn validate(raw: RawManifest) -> Result<Manifest, ConfigError> {
    for name in &raw.tasks {
        if !raw.task_defs.contains_key(name) {
            return Err(ConfigError::Invalid(format!(
                "task '{}' listed but not defined",
                name
            )));
        }
    }

    let mut specs = HashMap::with_capacity(raw.task_defs.len());
    for (name, def) in raw.task_defs {
        if def.cmd.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "task '{}' missing required 'cmd' field",
                name
            )));
        }
        if def.restart.is_some() {
            return Err(ConfigError::Invalid(format!(
                "task '{}': the 'restart' field is not supported, use 'watch = true' instead",
                name
            )));
        }
        specs.insert(
            name.clone(),
            TaskSpec {
                name,
                command: def.cmd,
                working_dir: def.path,
                env: def.env.unwrap_or_default(),
                use_shell: def.shell.unwrap_or(true),
                watch: def.watch.unwrap_or(false),
            },
        );
    }

    Ok(Manifest {
        order: raw.tasks,
        specs,
    })
}

impl Manifest {
    /// Looks up a task spec by name.
    pub fn get(&self, name: &str) -> Option<&TaskSpec> {
        self.specs.get(name)
    }

    /// Resolves the set of tasks to run.
    ///
    /// Empty `args` means every task from the manifest order; otherwise each
    /// requested name is validated against the task table.
    pub fn select(&self, args: &[String]) -> Result<Vec<String>, ConfigError> {
        if args.is_empty() {
            return Ok(self.order.clone());
        }
        for name in args {
            if !self.specs.contains_key(name) {
                return Err(ConfigError::UnknownTask(name.clone()));
            }
        }
        Ok(args.to_vec())
    }

    /// Returns the specs for an already-validated selection, in order.
    pub fn specs_for(&self, names: &[String]) -> Vec<TaskSpec> {
        names
            .iter()
            .filter_map(|name| self.specs.get(name).cloned())
            .collect()
    }
}
