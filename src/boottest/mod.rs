//! Boot the composed image in QEMU.
//!
//! The test disk under `<workdir>/test/` is scratch output: it is rebuilt on
//! every run and never recorded as a checkpoint.

pub mod disk;
pub mod serial;

pub use disk::{build_test_disk, TestDiskLayout};
pub use serial::{pump_console, watch_serial, WatchLimits, FAILURE_PATTERNS, SUCCESS_PATTERNS};

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::TestConfig;
use crate::error::{ComposeError, IoContext, Result};

pub const TEST_DIR: &str = "test";

const QEMU: &str = "qemu-system-x86_64";

/// Console silence tolerated before the boot counts as hung.
const STALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Build the test disk and boot it, watching the serial console.
pub fn run_boot_test(store: &CheckpointStore, settings: &TestConfig) -> Result<()> {
    let ovmf = find_ovmf()
        .ok_or_else(|| ComposeError::NotFound("OVMF firmware (UEFI boot is required)".into()))?;
    let disk = build_test_disk(store, &store.root().join(TEST_DIR))?;

    info!(
        disk = %disk.display(),
        firmware = %ovmf.display(),
        timeout_secs = settings.timeout_secs,
        "booting test disk"
    );
    let mut qemu = QemuBuilder::new(settings.memory_gb)
        .disk(disk)
        .uefi(ovmf)
        .build();
    let mut child = KillOnDrop(
        qemu.spawn()
            .io_context(|| format!("spawning '{QEMU}'"))?,
    );
    let stdout = child
        .0
        .stdout
        .take()
        .ok_or_else(|| ComposeError::Io {
            context: format!("capturing '{QEMU}' serial output"),
            source: std::io::Error::other("stdout not piped"),
        })?;

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || pump_console(stdout, tx));

    watch_serial(
        &rx,
        WatchLimits {
            timeout: Duration::from_secs(settings.timeout_secs),
            stall: STALL_TIMEOUT,
        },
    )?;
    Ok(())
}

/// Headless QEMU invocation for the test disk.
#[derive(Debug, Default)]
pub struct QemuBuilder {
    disk: Option<PathBuf>,
    ovmf: Option<PathBuf>,
    memory_gb: u32,
}

impl QemuBuilder {
    pub fn new(memory_gb: u32) -> Self {
        Self {
            memory_gb,
            ..Default::default()
        }
    }

    pub fn disk(mut self, path: PathBuf) -> Self {
        self.disk = Some(path);
        self
    }

    pub fn uefi(mut self, ovmf_path: PathBuf) -> Self {
        self.ovmf = Some(ovmf_path);
        self
    }

    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if Path::new("/dev/kvm").exists() {
            args.extend(["-enable-kvm", "-cpu", "host"].map(String::from));
        } else {
            args.extend(["-cpu", "max"].map(String::from));
        }
        args.extend(["-smp", "2", "-m"].map(String::from));
        args.push(format!("{}G", self.memory_gb));

        if let Some(ovmf) = &self.ovmf {
            args.push("-drive".into());
            args.push(format!(
                "if=pflash,format=raw,readonly=on,file={}",
                ovmf.display()
            ));
        }
        if let Some(disk) = &self.disk {
            // Snapshot mode keeps the guest from writing to the test disk.
            args.push("-drive".into());
            args.push(format!("file={},format=raw,if=virtio,snapshot=on", disk.display()));
        }
        args.extend(
            ["-nographic", "-serial", "mon:stdio", "-no-reboot", "-nic", "none"].map(String::from),
        );
        args
    }

    pub fn build(self) -> Command {
        let mut cmd = Command::new(QEMU);
        cmd.args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        cmd
    }
}

/// Find OVMF firmware for UEFI boot.
pub fn find_ovmf() -> Option<PathBuf> {
    let candidates = [
        // Fedora/RHEL
        "/usr/share/edk2/ovmf/OVMF_CODE.fd",
        "/usr/share/OVMF/OVMF_CODE.fd",
        // Debian/Ubuntu
        "/usr/share/OVMF/OVMF_CODE_4M.fd",
        "/usr/share/qemu/OVMF.fd",
        // Arch
        "/usr/share/edk2-ovmf/x64/OVMF_CODE.fd",
    ];
    candidates.into_iter().map(PathBuf::from).find(|p| p.exists())
}

struct KillOnDrop(Child);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        if let Err(e) = self.0.kill() {
            if e.kind() != std::io::ErrorKind::InvalidInput {
                warn!(error = %e, "stopping emulator failed");
            }
        }
        let _ = self.0.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qemu_args_boot_headless_from_firmware() {
        let args = QemuBuilder::new(4)
            .disk(PathBuf::from("/w/test/disk.raw"))
            .uefi(PathBuf::from("/fw/OVMF_CODE.fd"))
            .args();

        let pos = |needle: &str| args.iter().position(|a| a == needle);
        let memory = pos("-m").unwrap();
        assert_eq!(args[memory + 1], "4G");
        assert!(args.contains(&"if=pflash,format=raw,readonly=on,file=/fw/OVMF_CODE.fd".to_string()));
        assert!(args.contains(&"file=/w/test/disk.raw,format=raw,if=virtio,snapshot=on".to_string()));
        assert!(pos("-nographic").is_some());
        assert!(pos("-no-reboot").is_some());
        // Never a direct kernel boot: the image must go through the firmware.
        assert!(pos("-kernel").is_none());
    }
}
