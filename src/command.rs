// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Synchronous external command execution.
//!
//! Everything the engine does to the outside world goes through a
//! [`CommandRunner`]: zfs invocations, ssh-wrapped remote invocations, and
//! pre/post hooks. The trait seam keeps the rest of the engine testable
//! without a ZFS pool — tests drive it with a [`ScriptedRunner`].
//!
//! # Remote execution
//!
//! A [`CommandSpec`] may carry an endpoint prefix (a rendered remote-shell
//! command such as `ssh -l root -p 22 host`). The final shell line is then
//! `{endpoint} '{command}'`; output parsing is identical to the local case.
//!
//! # Output sanitizing
//!
//! Stdout is filtered to the character set ZFS listings can produce
//! (`\n`, `\t`, `@`, space, alphanumerics, `_\.:/-`). Anything else is
//! stripped before parsing.

use crate::error::{EngineError, Result};
use regex::Regex;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, OnceLock};
use tracing::debug;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// One external command invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    /// The command line, without any remote-execution wrapper.
    pub command: String,

    /// Optional remote-execution wrapper (e.g. `ssh -l root -p 22 host`).
    /// When set, the command is quoted and piped through it.
    pub endpoint: Option<String>,

    /// If the command exits nonzero but stderr contains this substring,
    /// treat the invocation as successful (expected-ignorable error).
    pub ignore_stderr: Option<String>,

    /// Log the full command line at debug level before executing.
    pub log_command: bool,
}

impl CommandSpec {
    /// A local command with no wrapper.
    pub fn local(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    /// A command executed at the given endpoint; an empty endpoint string
    /// means local.
    pub fn at(command: impl Into<String>, endpoint: &str) -> Self {
        Self {
            command: command.into(),
            endpoint: if endpoint.is_empty() {
                None
            } else {
                Some(endpoint.to_string())
            },
            ..Default::default()
        }
    }

    /// Tolerate a nonzero exit whose stderr contains `needle`.
    pub fn ignoring(mut self, needle: impl Into<String>) -> Self {
        let needle = needle.into();
        if !needle.is_empty() {
            self.ignore_stderr = Some(needle);
        }
        self
    }

    /// Enable debug logging of the command line.
    pub fn logged(mut self, log_command: bool) -> Self {
        self.log_command = log_command;
        self
    }

    /// The final shell line, with the remote wrapper applied if present.
    pub fn shell_line(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => format!("{} '{}'", endpoint, self.command),
            None => self.command.clone(),
        }
    }
}

/// Trait defining how the engine executes external commands.
///
/// Implementations must execute the command synchronously from the caller's
/// perspective (the future resolves when the subprocess has exited) and
/// return sanitized stdout.
pub trait CommandRunner: Send + Sync + 'static {
    /// Execute a command, returning its sanitized stdout.
    ///
    /// Nonzero exit raises [`EngineError::CommandFailed`] unless stderr
    /// matches the spec's ignorable pattern.
    fn run(&self, spec: CommandSpec) -> BoxFuture<'_, String>;
}

fn sanitize_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[^\n\t@ a-zA-Z0-9_\\.:/\-]+").expect("static pattern"))
}

/// Strip characters outside the expected listing character set.
pub fn sanitize_output(raw: &str) -> String {
    sanitize_pattern().replace_all(raw, "").into_owned()
}

/// Subprocess-backed runner: executes each spec via `sh -c`.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner;

impl ShellRunner {
    pub fn new() -> Self {
        Self
    }
}

impl CommandRunner for ShellRunner {
    fn run(&self, spec: CommandSpec) -> BoxFuture<'_, String> {
        Box::pin(async move {
            let line = spec.shell_line();
            if spec.log_command {
                debug!(command = %line, "Executing command");
            }

            let output = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&line)
                .current_dir("/")
                .output()
                .await?;

            let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            let stderr = String::from_utf8_lossy(&output.stderr)
                .trim()
                .to_string();

            if !output.status.success() {
                let ignorable = spec
                    .ignore_stderr
                    .as_deref()
                    .is_some_and(|needle| stderr.contains(needle));
                if !ignorable {
                    return Err(EngineError::CommandFailed {
                        command: line,
                        exit_code: output.status.code().unwrap_or(-1),
                        stderr,
                    });
                }
            }

            Ok(sanitize_output(&stdout))
        })
    }
}

/// Canned response for one [`ScriptedRunner`] rule.
#[derive(Debug, Clone)]
enum ScriptedResponse {
    Output(String),
    Failure { exit_code: i32, stderr: String },
}

/// A scripted runner for tests and standalone dry runs.
///
/// Rules are substring matches against the final shell line, checked in
/// registration order; the first match wins. Lines with no matching rule
/// succeed with empty output. Every executed line is recorded.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<(String, ScriptedResponse)>>,
    executed: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Respond to lines containing `needle` with `output`.
    pub fn respond(&self, needle: impl Into<String>, output: impl Into<String>) {
        self.rules
            .lock()
            .expect("rules lock")
            .push((needle.into(), ScriptedResponse::Output(output.into())));
    }

    /// Fail lines containing `needle` with the given exit code and stderr.
    pub fn fail(&self, needle: impl Into<String>, exit_code: i32, stderr: impl Into<String>) {
        self.rules.lock().expect("rules lock").push((
            needle.into(),
            ScriptedResponse::Failure {
                exit_code,
                stderr: stderr.into(),
            },
        ));
    }

    /// Drop every rule; recorded lines are kept. Lets a test re-script the
    /// world between cycles.
    pub fn clear_rules(&self) {
        self.rules.lock().expect("rules lock").clear();
    }

    /// All shell lines executed so far, in order.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().expect("executed lock").clone()
    }

    /// Count of executed lines containing `needle`.
    pub fn count_containing(&self, needle: &str) -> usize {
        self.executed()
            .iter()
            .filter(|line| line.contains(needle))
            .count()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, spec: CommandSpec) -> BoxFuture<'_, String> {
        Box::pin(async move {
            let line = spec.shell_line();
            self.executed.lock().expect("executed lock").push(line.clone());

            let response = {
                let rules = self.rules.lock().expect("rules lock");
                rules
                    .iter()
                    .find(|(needle, _)| line.contains(needle.as_str()))
                    .map(|(_, response)| response.clone())
            };

            match response {
                Some(ScriptedResponse::Output(output)) => Ok(output),
                Some(ScriptedResponse::Failure { exit_code, stderr }) => {
                    let ignorable = spec
                        .ignore_stderr
                        .as_deref()
                        .is_some_and(|needle| stderr.contains(needle));
                    if ignorable {
                        Ok(String::new())
                    } else {
                        Err(EngineError::CommandFailed {
                            command: line,
                            exit_code,
                            stderr,
                        })
                    }
                }
                None => Ok(String::new()),
            }
        })
    }
}
