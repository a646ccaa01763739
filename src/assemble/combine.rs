//! Root volume and hash volume in one compressed file.

use std::fs::File;

use tracing::info;

use crate::checkpoint::{Artifact, CheckpointStore};
use crate::codec::{self, Compression};
use crate::error::{ComposeError, IoContext, Result};

/// Commit `combined.img`: `root.img` followed by `hash.img`, compressed.
pub fn combine_volumes(store: &CheckpointStore, compression: Compression, xz_tool: &str) -> Result<()> {
    if store.exists(Artifact::CombinedVolume) {
        return Ok(());
    }
    let mut root = open_checkpoint(store, Artifact::RootVolume)?;
    let mut hash = open_checkpoint(store, Artifact::HashVolume)?;

    info!(compression = %compression, "combining root and hash volumes");
    let mut consumed = 0;
    store.write_atomic(Artifact::CombinedVolume, |out| {
        consumed = codec::compress(compression, xz_tool, &mut [&mut root, &mut hash], out)?;
        Ok(())
    })?;
    info!(bytes = consumed, "combined volume committed");
    Ok(())
}

fn open_checkpoint(store: &CheckpointStore, artifact: Artifact) -> Result<File> {
    if !store.exists(artifact) {
        return Err(ComposeError::NotFound(format!("checkpoint '{artifact}'")));
    }
    let path = store.path(artifact);
    File::open(&path).io_context(|| format!("opening '{}'", path.display()))
}
