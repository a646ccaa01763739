//! [`VirtualDiskReader`] over `guestfish` in remote-control mode.
//!
//! `guestfish --listen` starts a daemon holding the appliance and prints
//! its pid; every further command is a short `guestfish --remote=PID`
//! invocation. The appliance boots once per image instead of once per
//! command.
//!
//! The daemon keeps the stderr of the `--listen` invocation open for its
//! whole life, so that stderr goes to `<image>.guestfish.log` rather than a
//! pipe.

use std::path::Path;

use tracing::{debug, warn};

use super::{VirtualDiskBackend, VirtualDiskReader};
use crate::error::{ComposeError, Result};
use crate::process::{Cmd, CmdResult};

const PID_VAR: &str = "GUESTFISH_PID=";

/// Attaches images with the `guestfish` found at `program`.
#[derive(Debug, Clone)]
pub struct GuestfishBackend {
    program: String,
}

impl GuestfishBackend {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }
}

impl VirtualDiskBackend for GuestfishBackend {
    fn attach(&self, image: &Path) -> Result<Box<dyn VirtualDiskReader>> {
        Ok(Box::new(Guestfish::launch(&self.program, image)?))
    }
}

/// A running guestfish daemon with one image attached read-only.
///
/// The daemon is told to exit when this is dropped.
#[derive(Debug)]
pub struct Guestfish {
    program: String,
    pid: u32,
}

impl Guestfish {
    pub fn launch(program: &str, image: &Path) -> Result<Self> {
        let listen = Cmd::new(program)
            .args(["--listen", "--ro", "-a"])
            .arg_path(image)
            .stderr_file(&image.with_extension("guestfish.log"))
            .error_msg("guestfish --listen failed")
            .run()?;
        let pid = parse_listen_pid(&listen.stdout)?;
        debug!(pid, image = %image.display(), "guestfish daemon started");

        let fish = Self {
            program: program.to_string(),
            pid,
        };
        fish.remote(&["run"])?;
        Ok(fish)
    }

    fn command(&self) -> Cmd {
        Cmd::new(&self.program)
            .arg(format!("--remote={}", self.pid))
            .arg("--")
    }

    fn remote(&self, args: &[&str]) -> Result<CmdResult> {
        self.command().args(args).run()
    }

    fn lines(&self, args: &[&str]) -> Result<Vec<String>> {
        let output = self.remote(args)?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

impl VirtualDiskReader for Guestfish {
    fn inspect_os(&mut self) -> Result<Vec<String>> {
        self.lines(&["inspect-os"])
    }

    fn list_partitions(&mut self) -> Result<Vec<String>> {
        self.lines(&["list-partitions"])
    }

    fn vfs_type(&mut self, device: &str) -> Result<String> {
        Ok(self.remote(&["vfs-type", device])?.stdout.trim().to_string())
    }

    fn mount_ro(&mut self, device: &str, mountpoint: &str) -> Result<()> {
        self.remote(&["mount-ro", device, mountpoint])?;
        Ok(())
    }

    fn list_dir(&mut self, dir: &str) -> Result<Vec<String>> {
        self.lines(&["ls", dir])
    }

    fn download(&mut self, remote: &str, local: &Path) -> Result<()> {
        self.command()
            .args(["download", remote])
            .arg_path(local)
            .run()?;
        Ok(())
    }

    fn umount_all(&mut self) -> Result<()> {
        self.remote(&["umount-all"])?;
        Ok(())
    }
}

impl Drop for Guestfish {
    fn drop(&mut self) {
        if let Err(e) = self.remote(&["exit"]) {
            warn!(pid = self.pid, error = %e, "guestfish daemon did not exit cleanly");
        }
    }
}

/// Pid from `GUESTFISH_PID=1234; export GUESTFISH_PID`.
fn parse_listen_pid(stdout: &str) -> Result<u32> {
    let value = stdout
        .split(|c: char| c == ';' || c.is_whitespace())
        .find_map(|token| token.strip_prefix(PID_VAR))
        .ok_or_else(|| ComposeError::parse("guestfish --listen output", "no GUESTFISH_PID"))?;
    value.parse().map_err(|_| {
        ComposeError::parse(
            "guestfish --listen output",
            format!("GUESTFISH_PID '{value}' is not a pid"),
        )
    })
}
