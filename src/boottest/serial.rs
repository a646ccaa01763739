//! Serial console watcher.
//!
//! Console output arrives as raw chunks, not lines: a getty prompt such as
//! `host login: ` is never followed by a newline.

use std::io::{self, Read};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::{ComposeError, Result};

/// Any of these on the console means the system came up.
pub const SUCCESS_PATTERNS: &[&str] = &["___BOOT_OK___", "login:"];

/// Any of these means it did not. Checked before the success patterns.
pub const FAILURE_PATTERNS: &[&str] = &[
    "Kernel panic",
    "not syncing",
    "VFS: Cannot open root device",
    "verity: Data device lookup failed",
    "is corrupted",
    "Verity device detected corruption",
    "Failed to start systemd-veritysetup",
    "emergency shell",
    "Emergency mode",
    "No bootable device",
    "Boot Failed",
];

/// Lines of console output quoted in errors.
const CONTEXT_LINES: usize = 30;

const POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
pub struct WatchLimits {
    /// Whole boot must finish within this.
    pub timeout: Duration,
    /// Fail when the console is silent for this long.
    pub stall: Duration,
}

/// How far the boot got, from console markers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Progress {
    firmware: bool,
    kernel: bool,
    userspace: bool,
}

impl Progress {
    fn observe(&mut self, line: &str) {
        if line.contains("BdsDxe") || line.contains("UEFI") || line.contains("EFI stub") {
            self.firmware = true;
        }
        if line.contains("Linux version") || line.contains("Booting Linux") {
            self.kernel = true;
        }
        if line.contains("systemd[1]") || line.contains("Welcome to") {
            self.userspace = true;
        }
    }

    fn describe(&self) -> &'static str {
        if self.userspace {
            "userspace started but stalled"
        } else if self.kernel {
            "kernel started but init stalled"
        } else if self.firmware {
            "firmware ran but kernel stalled"
        } else {
            "no console output"
        }
    }
}

/// Forward everything `reader` produces to `tx` until EOF.
///
/// Sends each read as it arrives, holding back only a UTF-8 sequence split
/// across reads.
pub fn pump_console<R: Read>(mut reader: R, tx: Sender<String>) {
    let mut buf = [0u8; 4096];
    let mut carry: Vec<u8> = Vec::new();
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        };
        carry.extend_from_slice(&buf[..n]);
        let complete = carry.len() - incomplete_utf8_tail(&carry);
        let text = String::from_utf8_lossy(&carry[..complete]).into_owned();
        carry.drain(..complete);
        if !text.is_empty() && tx.send(text).is_err() {
            return;
        }
    }
    if !carry.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&carry).into_owned());
    }
}

fn incomplete_utf8_tail(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Err(e) if e.error_len().is_none() => bytes.len() - e.valid_up_to(),
        _ => 0,
    }
}

/// First failure pattern in `text`, else first success pattern.
fn classify(text: &str) -> Option<std::result::Result<&'static str, &'static str>> {
    if let Some(pattern) = FAILURE_PATTERNS.iter().find(|p| text.contains(*p)) {
        return Some(Err(*pattern));
    }
    SUCCESS_PATTERNS.iter().find(|p| text.contains(*p)).map(|p| Ok(*p))
}

/// Consume console output until a success or failure marker shows up.
///
/// Markers are matched against complete lines and against the unterminated
/// tail. Returns the success pattern that matched. The sender hanging up
/// (the emulator exited) before either is a failure.
pub fn watch_serial(console: &Receiver<String>, limits: WatchLimits) -> Result<&'static str> {
    let start = Instant::now();
    let mut last_output = Instant::now();
    let mut progress = Progress::default();
    let mut transcript: Vec<String> = Vec::new();
    let mut pending = String::new();

    let settle = |verdict: std::result::Result<&'static str, &'static str>,
                  transcript: &[String]| match verdict {
        Ok(pattern) => {
            info!(
                pattern,
                elapsed_secs = start.elapsed().as_secs_f64(),
                "boot test passed"
            );
            Ok(pattern)
        }
        Err(pattern) => Err(boot_failure(format!("matched '{pattern}'"), transcript)),
    };

    loop {
        if start.elapsed() > limits.timeout {
            return Err(boot_failure(
                format!("no boot within {}s ({})", limits.timeout.as_secs(), progress.describe()),
                &transcript,
            ));
        }
        if last_output.elapsed() > limits.stall {
            return Err(boot_failure(
                format!(
                    "console silent for {:?}: {}",
                    limits.stall,
                    progress.describe()
                ),
                &transcript,
            ));
        }

        match console.recv_timeout(POLL.min(limits.stall)) {
            Ok(chunk) => {
                last_output = Instant::now();
                pending.push_str(&chunk);

                while let Some(end) = pending.find('\n') {
                    let line: String = pending.drain(..=end).collect();
                    let line = line.trim_end_matches(['\r', '\n']).to_string();
                    debug!(target: "serial", "{line}");
                    progress.observe(&line);
                    let verdict = classify(&line);
                    transcript.push(line);
                    if let Some(verdict) = verdict {
                        return settle(verdict, &transcript);
                    }
                }

                if let Some(verdict) = classify(&pending) {
                    debug!(target: "serial", "{pending}");
                    transcript.push(std::mem::take(&mut pending));
                    return settle(verdict, &transcript);
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                if !pending.is_empty() {
                    progress.observe(&pending);
                    transcript.push(std::mem::take(&mut pending));
                }
                return Err(boot_failure(
                    format!("emulator exited early ({})", progress.describe()),
                    &transcript,
                ));
            }
        }
    }
}

fn boot_failure(reason: String, transcript: &[String]) -> ComposeError {
    let tail = &transcript[transcript.len().saturating_sub(CONTEXT_LINES)..];
    ComposeError::Subprocess {
        command: "boot test".to_string(),
        code: None,
        stdout: tail.join("\n"),
        stderr: reason,
    }
}
