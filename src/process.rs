//! External command execution.
//!
//! Every host tool goes through [`Cmd`], which logs the command line,
//! captures stdout/stderr and turns a non-zero exit into a
//! [`CommandFailure`] carrying the tool's own diagnostic output.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::Path;
use std::process::{Command, ExitStatus};

/// Output of a finished command.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// A command that could not be started or exited non-zero.
#[derive(Debug, Clone)]
pub struct CommandFailure {
    pub program: String,
    /// Exit code, `None` if the process could not be spawned or was killed.
    pub code: Option<i32>,
    /// The tool's stderr (or stdout if stderr was empty), verbatim.
    pub diagnostic: String,
    pub context: Option<String>,
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(context) = &self.context {
            write!(f, "{context}: ")?;
        }
        match self.code {
            Some(code) => write!(f, "{} exited with status {code}", self.program)?,
            None => write!(f, "{} did not run to completion", self.program)?,
        }
        if !self.diagnostic.is_empty() {
            write!(f, "\n{}", self.diagnostic)?;
        }
        Ok(())
    }
}

impl std::error::Error for CommandFailure {}

/// Builder for a host command.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    error_msg: Option<String>,
    allow_fail: bool,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            error_msg: None,
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    /// A directory argument with a trailing slash (rsync "contents of").
    pub fn arg_dir_contents(self, path: &Path) -> Self {
        let mut arg = path.as_os_str().to_os_string();
        if !arg.to_string_lossy().ends_with('/') {
            arg.push("/");
        }
        self.arg(arg)
    }

    /// Prefix for the failure message.
    pub fn error_msg(mut self, msg: &str) -> Self {
        self.error_msg = Some(msg.to_string());
        self
    }

    /// Return the result even when the exit status is non-zero.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }

    pub fn run(self) -> Result<CommandResult, CommandFailure> {
        tracing::debug!("running: {}", self.command_line());

        let output = Command::new(&self.program)
            .args(&self.args)
            .output()
            .map_err(|e| CommandFailure {
                program: self.program.clone(),
                code: None,
                diagnostic: format!("failed to start: {e}"),
                context: self.error_msg.clone(),
            })?;

        let result = CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if result.success() || self.allow_fail {
            return Ok(result);
        }

        let diagnostic = if result.stderr.trim().is_empty() {
            result.stdout.trim().to_string()
        } else {
            result.stderr.trim().to_string()
        };
        Err(CommandFailure {
            program: self.program,
            code: result.status.code(),
            diagnostic,
            context: self.error_msg,
        })
    }
}

/// Whether `program` resolves on `PATH`.
pub fn exists(program: &str) -> bool {
    which::which(program).is_ok()
}
