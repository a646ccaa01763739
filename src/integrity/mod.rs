//! dm-verity hash tree for the extracted root volume.
//!
//! `veritysetup format` builds the hash volume and reports the root hash and
//! the hash volume's UUID; [`report`] parses that text. Running the formatter
//! over a multi-gigabyte volume is slow, so the result is checkpointed:
//!
//! 1. `hash.img` - the hash volume itself
//! 2. `verity-uuid` - the volume identifier
//! 3. `roothash` - committed last, marks the table complete
//!
//! If a previous run was interrupted after (1) the committed hash volume is
//! authoritative: its UUID and salt are read back with `veritysetup dump`
//! and the root hash is re-derived from them instead of formatting anew.

pub mod report;

use std::fs;
use std::path::Path;

use tracing::{info, warn};

use crate::checkpoint::{Artifact, CheckpointStore};
use crate::config::ToolsConfig;
use crate::error::{ComposeError, Result};
use crate::process::Cmd;
use report::{is_canonical_uuid, is_root_hash, FormatReport};

pub const HASH_ALGORITHM: &str = "sha256";
pub const DATA_BLOCK_SIZE: u32 = 4096;
pub const HASH_BLOCK_SIZE: u32 = 4096;

/// Root hash and hash-volume identifier of the root volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityTable {
    pub uuid: String,
    pub root_hash: String,
}

/// Build (or load) the integrity table for the checkpointed root volume.
pub fn build_integrity_table(
    store: &CheckpointStore,
    tools: &ToolsConfig,
) -> Result<IntegrityTable> {
    if store.exists(Artifact::RootHash) {
        return load_integrity_table(store);
    }
    if !store.exists(Artifact::RootVolume) {
        return Err(ComposeError::NotFound(format!(
            "checkpoint '{}' (extract the disk image first)",
            Artifact::RootVolume
        )));
    }

    let table = if store.exists(Artifact::HashVolume) {
        warn!("hash volume committed without root hash; re-deriving from hash volume");
        recover_from_hash_volume(store, tools)?
    } else {
        format_into_store(store, tools)?
    };

    if !store.exists(Artifact::VerityUuid) {
        store.write_string(Artifact::VerityUuid, &format!("{}\n", table.uuid))?;
    }
    store.write_string(Artifact::RootHash, &format!("{}\n", table.root_hash))?;
    info!(uuid = %table.uuid, root_hash = %table.root_hash, "integrity table committed");
    Ok(table)
}

/// Load a previously committed table.
pub fn load_integrity_table(store: &CheckpointStore) -> Result<IntegrityTable> {
    let uuid = store.read_to_string(Artifact::VerityUuid)?;
    let root_hash = store.read_to_string(Artifact::RootHash)?;
    if !is_canonical_uuid(&uuid) {
        return Err(ComposeError::parse(
            format!("checkpoint '{}'", Artifact::VerityUuid),
            format!("'{uuid}' is not a canonical UUID"),
        ));
    }
    if !is_root_hash(&root_hash) {
        return Err(ComposeError::parse(
            format!("checkpoint '{}'", Artifact::RootHash),
            format!("'{root_hash}' is not a {}-character hex digest", report::ROOT_HASH_LEN),
        ));
    }
    Ok(IntegrityTable { uuid, root_hash })
}

fn format_into_store(store: &CheckpointStore, tools: &ToolsConfig) -> Result<IntegrityTable> {
    let root = store.path(Artifact::RootVolume);
    // Reuse an identifier that outlived an interrupted run so the hash
    // volume and `verity-uuid` can never disagree.
    let uuid = if store.exists(Artifact::VerityUuid) {
        Some(store.read_to_string(Artifact::VerityUuid)?)
    } else {
        None
    };

    info!(root = %root.display(), "formatting dm-verity hash tree");
    let mut formatted = None;
    store.write_atomic_path(Artifact::HashVolume, |hash_tmp| {
        let report = format_hash_tree(tools, &root, hash_tmp, uuid.as_deref(), None)?;
        verify_hash_volume_uuid(tools, hash_tmp, &report.uuid)?;
        formatted = Some(report);
        Ok(())
    })?;

    let report = formatted.ok_or_else(|| {
        ComposeError::parse("veritysetup format report", "formatter produced no report")
    })?;
    Ok(IntegrityTable {
        uuid: report.uuid,
        root_hash: report.root_hash,
    })
}

fn recover_from_hash_volume(
    store: &CheckpointStore,
    tools: &ToolsConfig,
) -> Result<IntegrityTable> {
    let hash = store.path(Artifact::HashVolume);
    let dump = Cmd::new(&tools.veritysetup)
        .arg("dump")
        .arg_path(&hash)
        .run()?;
    let header = report::parse_dump_report(&dump.stdout)?;

    if store.exists(Artifact::VerityUuid) {
        let committed = store.read_to_string(Artifact::VerityUuid)?;
        if !committed.eq_ignore_ascii_case(&header.uuid) {
            return Err(ComposeError::parse(
                "veritysetup dump report",
                format!(
                    "hash volume UUID {} does not match committed {committed}",
                    header.uuid
                ),
            ));
        }
    }

    // Same data, salt, UUID and parameters give the same root hash.
    let scratch = store.scratch_path("hash-rederive");
    let rederived = format_hash_tree(
        tools,
        &store.path(Artifact::RootVolume),
        &scratch,
        Some(&header.uuid),
        Some(&header.salt),
    );
    let _ = fs::remove_file(&scratch);
    let rederived = rederived?;

    Ok(IntegrityTable {
        uuid: header.uuid,
        root_hash: rederived.root_hash,
    })
}

/// Run `veritysetup format` and parse its report.
fn format_hash_tree(
    tools: &ToolsConfig,
    data: &Path,
    hash: &Path,
    uuid: Option<&str>,
    salt: Option<&str>,
) -> Result<FormatReport> {
    let mut cmd = Cmd::new(&tools.veritysetup).args([
        "format".to_string(),
        format!("--hash={HASH_ALGORITHM}"),
        format!("--data-block-size={DATA_BLOCK_SIZE}"),
        format!("--hash-block-size={HASH_BLOCK_SIZE}"),
    ]);
    if let Some(uuid) = uuid {
        cmd = cmd.arg(format!("--uuid={uuid}"));
    }
    if let Some(salt) = salt {
        cmd = cmd.arg(format!("--salt={salt}"));
    }
    let output = cmd.arg_path(data).arg_path(hash).run()?;
    report::parse_format_report(&output.stdout)
}

/// Probe the hash volume independently and make sure it carries the UUID
/// the formatter reported.
fn verify_hash_volume_uuid(tools: &ToolsConfig, hash: &Path, expected: &str) -> Result<()> {
    let output = Cmd::new(&tools.blkid).arg("-p").arg_path(hash).run()?;
    let probed = report::parse_blkid_uuid(&output.stdout)?;
    if probed.eq_ignore_ascii_case(expected) {
        return Ok(());
    }
    Err(ComposeError::parse(
        "blkid output",
        format!("hash volume UUID {probed} does not match reported {expected}"),
    ))
}
