//! External command execution shared by CLI-driven backends.
//!
//! Backends never spawn processes directly; they go through a
//! [`CommandRunner`] so tests can script every invocation.

use std::ffi::OsString;
use std::process::Command;

use thiserror::Error;

/// Exit status and captured streams of a finished command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code, or `None` when the process was killed by a signal.
    pub code: Option<i32>,
    /// Everything written to stdout.
    pub stdout: String,
    /// Everything written to stderr.
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited with status 0.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Converts a non-zero exit into [`CommandError::Failure`].
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Failure`] when the exit code is not zero.
    pub fn into_success(self, program: &str) -> Result<Self, CommandError> {
        if self.is_success() {
            return Ok(self);
        }
        Err(CommandError::failure(program, &self))
    }
}

/// Errors raised while running external commands.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CommandError {
    /// The program could not be started at all.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that was invoked.
        program: String,
        /// Spawn error reported by the OS.
        message: String,
    },
    /// Raised when a command completes with a non-zero exit code.
    #[error("{program} exited with status {status_text}: {stderr}")]
    Failure {
        /// Program that was invoked.
        program: String,
        /// Raw exit code, if any.
        status: Option<i32>,
        /// Exit code rendered for messages.
        status_text: String,
        /// Trimmed stderr of the command.
        stderr: String,
    },
}

impl CommandError {
    /// Builds a [`CommandError::Failure`] from captured output.
    #[must_use]
    pub fn failure(program: &str, output: &CommandOutput) -> Self {
        let status_text = output
            .code
            .map_or_else(|| String::from("unknown"), |code| code.to_string());
        Self::Failure {
            program: program.to_owned(),
            status: output.code,
            status_text,
            stderr: output.stderr.trim().to_owned(),
        }
    }
}

/// Seam through which every external program is run.
pub trait CommandRunner {
    /// Runs `program` to completion and captures its output.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Spawn`] if the command cannot be started.
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError>;
}

/// Runs programs as child processes of the current one.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|err| CommandError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Converts borrowed string arguments into the owned form runners expect.
#[must_use]
pub fn os_args(args: &[&str]) -> Vec<OsString> {
    args.iter().map(OsString::from).collect()
}
