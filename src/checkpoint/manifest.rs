//! `run-manifest.json`: a summary of the artifacts a run left behind.
//!
//! Unlike checkpoints the manifest is rewritten at the end of every
//! successful run, so it always describes the latest invocation.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use super::{Artifact, CheckpointStore};
use crate::error::{ComposeError, IoContext, Result};

const RUN_MANIFEST_FILENAME: &str = "run-manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactRecord {
    pub name: String,
    pub size_bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub version: String,
    pub debug: bool,
    pub status: String,
    pub created_at_utc: String,
    pub finished_at_utc: Option<String>,
    pub artifacts: Vec<ArtifactRecord>,
}

pub fn manifest_path(workdir: &Path) -> PathBuf {
    workdir.join(RUN_MANIFEST_FILENAME)
}

/// Describe every committed artifact in `store`.
pub fn collect_records(store: &CheckpointStore) -> Result<Vec<ArtifactRecord>> {
    let mut records = Vec::new();
    for artifact in Artifact::ALL {
        if !store.exists(artifact) {
            continue;
        }
        let (sha256, size_bytes) = sha256_file(&store.path(artifact))?;
        records.push(ArtifactRecord {
            name: artifact.file_name().to_string(),
            size_bytes,
            sha256,
        });
    }
    Ok(records)
}

/// Write the manifest (replacing any previous one) via temp file + rename.
pub fn write_manifest(store: &CheckpointStore, manifest: &RunManifest) -> Result<()> {
    let path = manifest_path(store.root());
    let bytes = serde_json::to_vec_pretty(manifest).map_err(|source| ComposeError::Json {
        context: "run manifest".to_string(),
        source,
    })?;
    let tmp = store.scratch_path(RUN_MANIFEST_FILENAME);
    fs::write(&tmp, bytes).io_context(|| format!("writing '{}'", tmp.display()))?;
    fs::rename(&tmp, &path)
        .io_context(|| format!("renaming '{}' -> '{}'", tmp.display(), path.display()))
}

pub fn load_manifest(workdir: &Path) -> Result<Option<RunManifest>> {
    let path = manifest_path(workdir);
    if !path.is_file() {
        return Ok(None);
    }
    let bytes = fs::read(&path).io_context(|| format!("reading '{}'", path.display()))?;
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| ComposeError::Json {
            context: path.display().to_string(),
            source,
        })
}

/// Current UTC time as RFC 3339.
pub fn utc_now() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| OffsetDateTime::now_utc().unix_timestamp().to_string())
}

fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let f = File::open(path).io_context(|| format!("opening '{}'", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    let mut size = 0u64;
    loop {
        let n = r
            .read(&mut buf)
            .io_context(|| format!("hashing '{}'", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}
