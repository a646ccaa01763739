//! Kernel command line for a verity-protected root.

use std::fmt;

use crate::checkpoint::{Artifact, CheckpointStore};
use crate::error::{ComposeError, Result};
use crate::integrity::report::{is_canonical_uuid, is_root_hash};
use crate::integrity::IntegrityTable;

const COMMON_PARAMS: &[&str] = &[
    "ro",
    "rd.luks=0",
    "rd.lvm=0",
    "rd.md=0",
    "rd.dm=0",
    "console=tty0",
    "console=ttyS0,115200n8",
    "LANG=C.UTF-8",
];

const DEBUG_PARAMS: &[&str] = &[
    "rd.shell=1",
    "systemd.debug_shell=ttyS0",
    "rd.timeout=600",
    "systemd.default_timeout_start_sec=600",
];

const PRODUCTION_PARAMS: &[&str] = &["quiet", "loglevel=3", "rd.emergency=reboot", "panic=30"];

/// Ordered kernel parameters. The same inputs always give the same line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootCommandLine {
    params: Vec<String>,
}

impl BootCommandLine {
    pub fn new(uuid: &str, root_hash: &str, debug: bool) -> Result<Self> {
        if !is_canonical_uuid(uuid) {
            return Err(ComposeError::parse(
                "verity UUID",
                format!("'{uuid}' is not a canonical UUID"),
            ));
        }
        if !is_root_hash(root_hash) {
            return Err(ComposeError::parse(
                "root hash",
                format!("'{root_hash}' is not a 64-character hex digest"),
            ));
        }

        let mut params = vec![
            "root=/dev/mapper/root".to_string(),
            format!("roothash={root_hash}"),
            "systemd.verity_root_data=PARTLABEL=root".to_string(),
            format!("systemd.verity_root_hash=UUID={uuid}"),
        ];
        params.extend(COMMON_PARAMS.iter().map(|p| p.to_string()));
        let mode = if debug { DEBUG_PARAMS } else { PRODUCTION_PARAMS };
        params.extend(mode.iter().map(|p| p.to_string()));
        Ok(Self { params })
    }

    pub fn from_table(table: &IntegrityTable, debug: bool) -> Result<Self> {
        Self::new(&table.uuid, &table.root_hash, debug)
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }
}

impl fmt::Display for BootCommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.params.join(" "))
    }
}

/// Commit the `cmdline` checkpoint (newline-terminated) and return the line.
pub fn write_command_line(
    store: &CheckpointStore,
    table: &IntegrityTable,
    debug: bool,
) -> Result<String> {
    if store.exists(Artifact::CommandLine) {
        return store.read_to_string(Artifact::CommandLine);
    }
    let line = BootCommandLine::from_table(table, debug)?.to_string();
    store.write_string(Artifact::CommandLine, &format!("{line}\n"))?;
    Ok(line)
}
