//! Boot artifacts out of the composed disk image.
//!
//! The image must have the layout the compose produces:
//!
//! | # | content                        |
//! |---|--------------------------------|
//! | 1 | EFI system partition (`vfat`)  |
//! | 2 | `/boot`                        |
//! | 3 | root filesystem                |
//!
//! Kernel, initramfs and symbol map are copied out of `/boot`; partition 3
//! is copied out whole as the root volume the hash tree is built over.

mod guestfish;

pub use guestfish::{Guestfish, GuestfishBackend};

use std::path::Path;

use tracing::{info, warn};

use crate::checkpoint::{Artifact, CheckpointStore};
use crate::error::{ComposeError, Result};

pub const EXPECTED_PARTITIONS: usize = 3;
pub const ESP_FS_TYPE: &str = "vfat";

/// Read-only access to the contents of a disk image.
///
/// Paths are guest paths; devices are the names [`list_partitions`]
/// returns.
///
/// [`list_partitions`]: VirtualDiskReader::list_partitions
pub trait VirtualDiskReader {
    /// Root devices of the operating systems found in the image.
    fn inspect_os(&mut self) -> Result<Vec<String>>;
    fn list_partitions(&mut self) -> Result<Vec<String>>;
    fn vfs_type(&mut self, device: &str) -> Result<String>;
    fn mount_ro(&mut self, device: &str, mountpoint: &str) -> Result<()>;
    fn list_dir(&mut self, dir: &str) -> Result<Vec<String>>;
    /// Copy a guest file or device to `local`.
    fn download(&mut self, remote: &str, local: &Path) -> Result<()>;
    fn umount_all(&mut self) -> Result<()>;
}

/// Opens images for reading.
pub trait VirtualDiskBackend {
    fn attach(&self, image: &Path) -> Result<Box<dyn VirtualDiskReader>>;
}

/// What to copy out of `/boot`.
#[derive(Debug, Clone, Copy)]
pub struct ExtractOptions {
    pub require_symbol_map: bool,
}

impl ExtractOptions {
    pub fn outputs(&self) -> Vec<Artifact> {
        let mut outputs = vec![Artifact::Kernel, Artifact::Initrd];
        if self.require_symbol_map {
            outputs.push(Artifact::SymbolMap);
        }
        outputs.push(Artifact::RootVolume);
        outputs
    }
}

/// Guest paths selected in `/boot`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootFiles {
    pub kernel: String,
    pub initrd: String,
    pub symbol_map: Option<String>,
}

/// Copy kernel, initramfs, symbol map and root volume into the store.
pub fn extract_boot_artifacts(
    store: &CheckpointStore,
    backend: &dyn VirtualDiskBackend,
    options: ExtractOptions,
) -> Result<()> {
    if options.outputs().iter().all(|a| store.exists(*a)) {
        return Ok(());
    }
    let image = store.path(Artifact::RawImage);
    if !store.exists(Artifact::RawImage) {
        return Err(ComposeError::NotFound(format!(
            "checkpoint '{}'",
            Artifact::RawImage
        )));
    }

    let mut reader = backend.attach(&image)?;
    let reader = reader.as_mut();

    let root = single_os_root(reader)?;
    let partitions = reader.list_partitions()?;
    if partitions.len() != EXPECTED_PARTITIONS {
        return Err(ComposeError::count_mismatch(
            "partitions",
            EXPECTED_PARTITIONS,
            partitions,
        ));
    }
    let esp_type = reader.vfs_type(&partitions[0])?;
    if esp_type != ESP_FS_TYPE {
        return Err(ComposeError::InvalidImage(format!(
            "partition 1 ({}) has filesystem '{esp_type}', expected '{ESP_FS_TYPE}'",
            partitions[0]
        )));
    }
    if root != partitions[2] {
        return Err(ComposeError::InvalidImage(format!(
            "operating system root is {root}, expected partition 3 ({})",
            partitions[2]
        )));
    }

    let copied = copy_out(store, reader, &partitions, options);
    let unmounted = reader.umount_all();
    if let Err(e) = &unmounted {
        warn!(error = %e, "unmounting guest filesystems failed");
    }
    copied?;
    unmounted
}

fn single_os_root(reader: &mut dyn VirtualDiskReader) -> Result<String> {
    let mut roots = reader.inspect_os()?;
    if roots.len() != 1 {
        return Err(ComposeError::ambiguous("operating system root", roots));
    }
    Ok(roots.remove(0))
}

fn copy_out(
    store: &CheckpointStore,
    reader: &mut dyn VirtualDiskReader,
    partitions: &[String],
    options: ExtractOptions,
) -> Result<()> {
    reader.mount_ro(&partitions[2], "/")?;
    reader.mount_ro(&partitions[1], "/boot")?;

    let listing = reader.list_dir("/boot")?;
    let files = select_boot_files(&listing, options.require_symbol_map)?;
    info!(kernel = %files.kernel, initrd = %files.initrd, "boot files located");

    let mut wanted = vec![
        (Artifact::Kernel, files.kernel),
        (Artifact::Initrd, files.initrd),
    ];
    if let Some(map) = files.symbol_map {
        wanted.push((Artifact::SymbolMap, map));
    }
    for (artifact, remote) in wanted {
        if store.exists(artifact) {
            continue;
        }
        store.write_atomic_path(artifact, |tmp| reader.download(&remote, tmp))?;
    }

    if !store.exists(Artifact::RootVolume) {
        info!(device = %partitions[2], "copying root volume");
        store.write_atomic_path(Artifact::RootVolume, |tmp| {
            reader.download(&partitions[2], tmp)
        })?;
    }
    Ok(())
}

/// Pick the kernel, initramfs and symbol map from a `/boot` listing.
///
/// Rescue images are never candidates.
pub fn select_boot_files(listing: &[String], require_symbol_map: bool) -> Result<BootFiles> {
    let kernel = single_match(listing, "vmlinuz-", "", "kernel image")?;
    let initrd = single_match(listing, "initramfs-", ".img", "initramfs image")?;
    let symbol_map = if require_symbol_map {
        Some(single_match(listing, "System.map-", "", "kernel symbol map")?)
    } else {
        None
    };
    Ok(BootFiles {
        kernel: format!("/boot/{kernel}"),
        initrd: format!("/boot/{initrd}"),
        symbol_map: symbol_map.map(|name| format!("/boot/{name}")),
    })
}

fn single_match(listing: &[String], prefix: &str, suffix: &str, what: &str) -> Result<String> {
    let mut found: Vec<String> = listing
        .iter()
        .filter(|name| name.starts_with(prefix) && name.ends_with(suffix))
        .filter(|name| !name.contains("rescue"))
        .cloned()
        .collect();
    if found.len() != 1 {
        found.sort();
        return Err(ComposeError::ambiguous(what, found));
    }
    Ok(found.remove(0))
}
