//! Error family shared by every pipeline component.
//!
//! Each variant is a distinct failure kind. None of them is recovered from
//! locally: the orchestrator aborts the run on the first one it sees and the
//! caller re-invokes the process once the underlying condition is fixed.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T, E = ComposeError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ComposeError {
    /// An external tool exited with a non-zero status (or was killed).
    #[error("{command} failed (exit {}): {}", .code.map_or_else(|| "signal".to_string(), |c| c.to_string()), summarize(.stderr, .stdout))]
    Subprocess {
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// Tool output was missing an expected marker, repeated one, or carried a
    /// value that failed its sanity check.
    #[error("cannot parse {source_name}: {message}")]
    Parse {
        source_name: String,
        message: String,
    },

    /// The number of candidates differs from the number required (usually one).
    #[error("expected {expected} {what}, found {}: [{}]", .found.len(), .found.join(", "))]
    AmbiguousArtifact {
        what: String,
        expected: usize,
        found: Vec<String>,
    },

    /// The disk image violates the partition layout contract.
    #[error("invalid disk image: {0}")]
    InvalidImage(String),

    /// The remote job ended in a non-success state, or the API refused a request.
    #[error("compose {job_id} failed: {status}")]
    RemoteJob { job_id: String, status: String },

    /// A required checkpoint artifact, archive member or configuration file is missing.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid configuration {}: {message}", .path.display())]
    Config { path: PathBuf, message: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("HTTP request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("malformed JSON from {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ComposeError {
    pub fn parse(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Zero or several candidates where exactly one was required.
    pub fn ambiguous(what: impl Into<String>, found: Vec<String>) -> Self {
        Self::count_mismatch(what, 1, found)
    }

    pub fn count_mismatch(what: impl Into<String>, expected: usize, found: Vec<String>) -> Self {
        Self::AmbiguousArtifact {
            what: what.into(),
            expected,
            found,
        }
    }
}

/// Attach a human-readable context to `io::Error`s, in the spirit of
/// `anyhow::Context` but producing a typed [`ComposeError::Io`].
pub trait IoContext<T> {
    fn io_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T> IoContext<T> for std::result::Result<T, io::Error> {
    fn io_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|source| ComposeError::Io {
            context: f().into(),
            source,
        })
    }
}

fn summarize(stderr: &str, stdout: &str) -> String {
    let text = if stderr.trim().is_empty() { stdout } else { stderr };
    let text = text.trim();
    if text.is_empty() {
        "(no output)".to_string()
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subprocess_message_prefers_stderr() {
        let err = ComposeError::Subprocess {
            command: "veritysetup format".into(),
            code: Some(1),
            stdout: "ignored".into(),
            stderr: "Device root.img is too small.\n".into(),
        };
        assert_eq!(
            err.to_string(),
            "veritysetup format failed (exit 1): Device root.img is too small."
        );
    }

    #[test]
    fn subprocess_message_without_exit_code() {
        let err = ComposeError::Subprocess {
            command: "objcopy".into(),
            code: None,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert_eq!(err.to_string(), "objcopy failed (exit signal): (no output)");
    }

    #[test]
    fn ambiguous_lists_candidates() {
        let err = ComposeError::ambiguous(
            "kernel image",
            vec!["vmlinuz-6.8.5".into(), "vmlinuz-6.9.1".into()],
        );
        assert_eq!(
            err.to_string(),
            "expected 1 kernel image, found 2: [vmlinuz-6.8.5, vmlinuz-6.9.1]"
        );
    }
}
