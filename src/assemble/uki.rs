//! Unified kernel image: EFI stub + os-release + command line + kernel + initrd.

use std::fs;
use std::io;
use std::path::Path;

use tracing::info;

use crate::checkpoint::{Artifact, CheckpointStore};
use crate::error::{ComposeError, IoContext, Result};
use crate::process::Cmd;

/// PE section, checkpoint holding its payload, and virtual address.
pub const SECTIONS: [(&str, Artifact, u64); 4] = [
    (".osrel", Artifact::OsRelease, 0x20000),
    (".cmdline", Artifact::CommandLine, 0x30000),
    (".linux", Artifact::Kernel, 0x2000000),
    (".initrd", Artifact::Initrd, 0x3000000),
];

/// `source` with `VERSION_ID` set to `version`.
pub fn render_os_release(source: &str, version: &str) -> String {
    let version_line = format!("VERSION_ID={}", quote_value(version));
    let mut out = String::with_capacity(source.len() + version_line.len());
    let mut replaced = false;
    for line in source.lines() {
        if line.trim_start().starts_with("VERSION_ID=") {
            if !replaced {
                out.push_str(&version_line);
                out.push('\n');
                replaced = true;
            }
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    if !replaced {
        out.push_str(&version_line);
        out.push('\n');
    }
    out
}

/// os-release values only need quoting when they carry shell-special text.
fn quote_value(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '+' | '~'));
    if plain {
        return value.to_string();
    }
    let mut quoted = String::from("\"");
    for c in value.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Commit the `os-release` checkpoint from `source` with the run's version.
pub fn write_os_release(store: &CheckpointStore, source: &Path, version: &str) -> Result<()> {
    if store.exists(Artifact::OsRelease) {
        return Ok(());
    }
    let text = match fs::read_to_string(source) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(ComposeError::NotFound(format!(
                "os-release file '{}'",
                source.display()
            )))
        }
        Err(e) => return Err(e).io_context(|| format!("reading '{}'", source.display())),
    };
    store.write_string(Artifact::OsRelease, &render_os_release(&text, version))
}

/// Commit `boot.efi` built with `objcopy` over `stub`.
pub fn build_boot_executable(store: &CheckpointStore, stub: &Path, objcopy: &str) -> Result<()> {
    if store.exists(Artifact::BootExecutable) {
        return Ok(());
    }
    if !stub.is_file() {
        return Err(ComposeError::NotFound(format!(
            "EFI stub '{}'",
            stub.display()
        )));
    }
    for (_, artifact, _) in SECTIONS {
        if !store.exists(artifact) {
            return Err(ComposeError::NotFound(format!("checkpoint '{artifact}'")));
        }
    }

    info!(stub = %stub.display(), "building unified kernel image");
    store.write_atomic_path(Artifact::BootExecutable, |out| {
        let mut cmd = Cmd::new(objcopy);
        for (section, artifact, vma) in SECTIONS {
            cmd = cmd
                .arg("--add-section")
                .arg(format!("{section}={}", store.path(artifact).display()))
                .arg("--change-section-vma")
                .arg(format!("{section}=0x{vma:x}"));
        }
        cmd.arg_path(stub)
            .arg_path(out)
            .error_msg("objcopy (unified kernel image)")
            .run()?;
        Ok(())
    })
}
