//! Sparse GPT test disk, assembled without root privileges.
//!
//! Layout: ESP holding `boot.efi` as the removable-media loader, then the
//! root volume and the hash volume, each in a partition whose GPT name the
//! kernel command line refers to.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::checkpoint::{Artifact, CheckpointStore};
use crate::error::{ComposeError, IoContext, Result};
use crate::process::Cmd;

const SECTOR_SIZE: u64 = 512;
const MIB: u64 = 1024 * 1024;

/// First partition starts 1 MiB in (GPT header + alignment).
const FIRST_PARTITION_MIB: u64 = 1;

/// Room for the backup GPT at the end of the disk.
const TRAILER_MIB: u64 = 1;

/// FAT32 wants at least ~33 MiB; leave headroom for the loader.
const MIN_ESP_MIB: u64 = 64;
const ESP_SLACK_MIB: u64 = 16;

pub const ESP_LOADER_PATH: &str = "EFI/BOOT/BOOTX64.EFI";

/// One partition, in MiB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpan {
    pub name: &'static str,
    pub type_code: &'static str,
    pub start_mib: u64,
    pub size_mib: u64,
}

impl PartitionSpan {
    pub fn end_mib(&self) -> u64 {
        self.start_mib + self.size_mib
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestDiskLayout {
    pub esp: PartitionSpan,
    pub root: PartitionSpan,
    pub hash: PartitionSpan,
}

impl TestDiskLayout {
    /// Lay out partitions big enough for the given payload sizes.
    pub fn for_payloads(loader_bytes: u64, root_bytes: u64, hash_bytes: u64) -> Self {
        let esp_mib = (mib_ceil(loader_bytes) + ESP_SLACK_MIB).max(MIN_ESP_MIB);
        let esp = PartitionSpan {
            name: "esp",
            type_code: "U",
            start_mib: FIRST_PARTITION_MIB,
            size_mib: esp_mib,
        };
        let root = PartitionSpan {
            name: "root",
            type_code: "L",
            start_mib: esp.end_mib(),
            size_mib: mib_ceil(root_bytes).max(1),
        };
        let hash = PartitionSpan {
            name: "hash",
            type_code: "L",
            start_mib: root.end_mib(),
            size_mib: mib_ceil(hash_bytes).max(1),
        };
        Self { esp, root, hash }
    }

    pub fn partitions(&self) -> [&PartitionSpan; 3] {
        [&self.esp, &self.root, &self.hash]
    }

    pub fn disk_bytes(&self) -> u64 {
        (self.hash.end_mib() + TRAILER_MIB) * MIB
    }

    /// `sfdisk` input describing this layout.
    pub fn sfdisk_script(&self) -> String {
        let mut script = String::from("label: gpt\n");
        for part in self.partitions() {
            script.push_str(&format!(
                "start={}, size={}, type={}, name=\"{}\"\n",
                part.start_mib * MIB / SECTOR_SIZE,
                part.size_mib * MIB / SECTOR_SIZE,
                part.type_code,
                part.name
            ));
        }
        script
    }
}

fn mib_ceil(bytes: u64) -> u64 {
    bytes.div_ceil(MIB)
}

/// Build `<dir>/disk.raw` from the committed boot executable and volumes.
/// `dir` is scratch space and is recreated on every call.
pub fn build_test_disk(store: &CheckpointStore, dir: &Path) -> Result<PathBuf> {
    let loader = committed(store, Artifact::BootExecutable)?;
    let root = committed(store, Artifact::RootVolume)?;
    let hash = committed(store, Artifact::HashVolume)?;

    let layout = TestDiskLayout::for_payloads(file_len(&loader)?, file_len(&root)?, file_len(&hash)?);

    if dir.exists() {
        fs::remove_dir_all(dir).io_context(|| format!("removing '{}'", dir.display()))?;
    }
    fs::create_dir_all(dir).io_context(|| format!("creating '{}'", dir.display()))?;

    let esp_image = dir.join("esp.img");
    create_esp(&esp_image, layout.esp.size_mib, &loader)?;

    let disk = dir.join("disk.raw");
    sparse_file(&disk, layout.disk_bytes())?;
    Cmd::new("sfdisk")
        .arg("--quiet")
        .arg_path(&disk)
        .stdin_bytes(layout.sfdisk_script())
        .error_msg("sfdisk (test disk partition table)")
        .run()?;

    for (image, part) in [(&esp_image, &layout.esp), (&root, &layout.root), (&hash, &layout.hash)] {
        info!(partition = part.name, offset_mib = part.start_mib, "writing test disk partition");
        splice(image, &disk, part)?;
    }
    Ok(disk)
}

fn committed(store: &CheckpointStore, artifact: Artifact) -> Result<PathBuf> {
    if !store.exists(artifact) {
        return Err(ComposeError::NotFound(format!("checkpoint '{artifact}'")));
    }
    Ok(store.path(artifact))
}

fn file_len(path: &Path) -> Result<u64> {
    fs::metadata(path)
        .map(|m| m.len())
        .io_context(|| format!("reading size of '{}'", path.display()))
}

fn sparse_file(path: &Path, len: u64) -> Result<()> {
    let file = File::create(path).io_context(|| format!("creating '{}'", path.display()))?;
    file.set_len(len)
        .io_context(|| format!("sizing '{}'", path.display()))
}

fn create_esp(image: &Path, size_mib: u64, loader: &Path) -> Result<()> {
    sparse_file(image, size_mib * MIB)?;
    Cmd::new("mkfs.vfat")
        .args(["-F", "32", "-n", "ESP"])
        .arg_path(image)
        .error_msg("mkfs.vfat (test disk ESP)")
        .run()?;
    for dir in ["EFI", "EFI/BOOT"] {
        Cmd::new("mmd")
            .arg("-i")
            .arg_path(image)
            .arg(format!("::{dir}"))
            .run()?;
    }
    Cmd::new("mcopy")
        .arg("-i")
        .arg_path(image)
        .arg_path(loader)
        .arg(format!("::{ESP_LOADER_PATH}"))
        .error_msg("mcopy (boot executable into ESP)")
        .run()?;
    Ok(())
}

fn splice(image: &Path, disk: &Path, part: &PartitionSpan) -> Result<()> {
    Cmd::new("dd")
        .arg(format!("if={}", image.display()))
        .arg(format!("of={}", disk.display()))
        .args(["bs=1M", "conv=notrunc,sparse"])
        .arg(format!("seek={}", part.start_mib))
        .error_msg(&format!("dd ({} partition)", part.name))
        .run()?;
    Ok(())
}
