//! Subprocess invocation.
//!
//! [`Cmd`] is a small builder over [`std::process::Command`] that always
//! captures stdout/stderr and turns a non-zero exit into
//! [`ComposeError::Subprocess`].
//!
//! ```rust,ignore
//! use uki_compose::process::Cmd;
//!
//! let result = Cmd::new("veritysetup")
//!     .args(["format", "--hash=sha256"])
//!     .arg_path(&data)
//!     .arg_path(&hash)
//!     .run()?;
//! println!("{}", result.stdout);
//! ```

use std::ffi::{OsStr, OsString};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;

use tracing::debug;

use crate::error::{ComposeError, IoContext, Result};

/// Captured output of a finished command.
#[derive(Debug, Clone)]
pub struct CmdResult {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CmdResult {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Builder for a single external command invocation.
#[derive(Debug)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    stdin: Option<Vec<u8>>,
    stderr_file: Option<PathBuf>,
    error_msg: Option<String>,
}

impl Cmd {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            stdin: None,
            stderr_file: None,
            error_msg: None,
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

    /// Feed these bytes to the child's stdin.
    ///
    /// Written from a separate thread while the output is drained, so the
    /// input may be larger than a pipe buffer.
    pub fn stdin_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(bytes.into());
        self
    }

    /// Send stderr to `path` instead of a pipe; [`CmdResult::stderr`] is
    /// read back from it once the command exits.
    ///
    /// Needed for commands that fork a daemon: the daemon inherits stderr,
    /// and a pipe would not reach EOF until the daemon exits.
    pub fn stderr_file(mut self, path: &Path) -> Self {
        self.stderr_file = Some(path.to_path_buf());
        self
    }

    /// Label used in place of the bare command line when the command fails.
    pub fn error_msg(mut self, msg: &str) -> Self {
        self.error_msg = Some(msg.to_string());
        self
    }

    /// Human-readable command line, for logs and error messages.
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Run to completion, capturing stdout and stderr.
    pub fn run(self) -> Result<CmdResult> {
        let cmdline = self.display();
        debug!(command = %cmdline, "running");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).stdout(Stdio::piped());
        match &self.stderr_file {
            Some(path) => {
                let file = File::create(path)
                    .io_context(|| format!("creating '{}'", path.display()))?;
                cmd.stderr(file);
            }
            None => {
                cmd.stderr(Stdio::piped());
            }
        }
        cmd.stdin(if self.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = cmd
            .spawn()
            .io_context(|| format!("spawning '{cmdline}'"))?;
        let writer = match (self.stdin, child.stdin.take()) {
            (Some(bytes), Some(mut stdin)) => Some(thread::spawn(move || stdin.write_all(&bytes))),
            _ => None,
        };
        let output = child
            .wait_with_output()
            .io_context(|| format!("waiting for '{cmdline}'"))?;
        if let Some(writer) = writer {
            let written = writer
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("stdin writer panicked")));
            match written {
                // A child that exits without reading is judged by its status.
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
                other => other.io_context(|| format!("writing stdin of '{cmdline}'"))?,
            }
        }

        let stderr = match &self.stderr_file {
            Some(path) => fs::read(path).unwrap_or_default(),
            None => output.stderr,
        };
        let result = CmdResult {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        };

        if result.success() {
            return Ok(result);
        }
        Err(ComposeError::Subprocess {
            command: self.error_msg.unwrap_or(cmdline),
            code: result.code,
            stdout: result.stdout,
            stderr: result.stderr,
        })
    }
}

/// Whether `program` resolves on `PATH` (or is an existing path).
pub fn exists(program: &str) -> bool {
    which::which(program).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout() {
        let result = Cmd::new("sh").args(["-c", "echo hello"]).run().unwrap();
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[test]
    fn nonzero_exit_is_typed_failure() {
        let err = Cmd::new("sh")
            .args(["-c", "echo out; echo bad >&2; exit 3"])
            .run()
            .unwrap_err();
        match err {
            ComposeError::Subprocess {
                code,
                stdout,
                stderr,
                ..
            } => {
                assert_eq!(code, Some(3));
                assert_eq!(stdout.trim(), "out");
                assert_eq!(stderr.trim(), "bad");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn error_msg_replaces_command_line() {
        let err = Cmd::new("sh")
            .args(["-c", "exit 1"])
            .error_msg("probe failed")
            .run()
            .unwrap_err();
        assert!(err.to_string().starts_with("probe failed"));
    }

    #[test]
    fn stdin_is_forwarded() {
        let result = Cmd::new("cat").stdin_bytes("piped\n").run().unwrap();
        assert_eq!(result.stdout, "piped\n");
    }

    #[test]
    fn stdin_larger_than_a_pipe_buffer_does_not_block() {
        let input: Vec<u8> = (0..1024 * 1024).map(|i| b'a' + (i % 26) as u8).collect();
        let result = Cmd::new("cat").stdin_bytes(input.clone()).run().unwrap();
        assert_eq!(result.stdout.len(), input.len());
        assert_eq!(result.stdout.as_bytes(), &input[..]);
    }

    #[test]
    fn stderr_file_collects_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("stderr.log");
        let err = Cmd::new("sh")
            .args(["-c", "echo out; echo bad >&2; exit 2"])
            .stderr_file(&log)
            .run()
            .unwrap_err();
        match err {
            ComposeError::Subprocess { code, stderr, .. } => {
                assert_eq!(code, Some(2));
                assert_eq!(stderr.trim(), "bad");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(std::fs::read_to_string(&log).unwrap().trim(), "bad");
    }

    #[test]
    fn background_child_holding_stderr_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let start = std::time::Instant::now();
        let result = Cmd::new("sh")
            .args(["-c", "( exec >/dev/null; sleep 8 ) & echo started"])
            .stderr_file(&dir.path().join("stderr.log"))
            .run()
            .unwrap();
        assert_eq!(result.stdout.trim(), "started");
        assert!(start.elapsed() < std::time::Duration::from_secs(4));
    }

    #[test]
    fn missing_program_is_io_error() {
        let err = Cmd::new("definitely_not_a_real_command_12345")
            .run()
            .unwrap_err();
        assert!(matches!(err, ComposeError::Io { .. }));
    }

    #[test]
    fn exists_finds_sh() {
        assert!(exists("sh"));
        assert!(!exists("definitely_not_a_real_command_12345"));
    }
}
