//! Write-once artifact checkpoints inside a compose working directory.
//!
//! Every pipeline phase produces one or more named files under the working
//! directory. A phase is considered complete exactly when its artifacts
//! exist, so the store guarantees that an artifact is either absent or
//! complete:
//!
//! - producers write into `<workdir>/.tmp/` and the file is renamed onto its
//!   final name only after the producer returned `Ok`
//! - a failed producer leaves nothing behind but a temporary, which is
//!   discarded the next time the store is opened
//! - committed artifacts are never rewritten
//!
//! The store also holds an exclusive advisory lock on `<workdir>/.lock` for
//! as long as it is alive. Two runs sharing a working directory would defeat
//! the existence checks above.

pub mod manifest;

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::{ComposeError, IoContext, Result};

const TMP_DIR: &str = ".tmp";
const LOCK_FILE: &str = ".lock";

/// Named pipeline outputs, in the order the pipeline produces them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Artifact {
    ComposeId,
    ResultBundle,
    RawImage,
    Kernel,
    Initrd,
    SymbolMap,
    RootVolume,
    HashVolume,
    VerityUuid,
    RootHash,
    CombinedVolume,
    CommandLine,
    OsRelease,
    BootExecutable,
}

impl Artifact {
    pub const ALL: [Artifact; 14] = [
        Artifact::ComposeId,
        Artifact::ResultBundle,
        Artifact::RawImage,
        Artifact::Kernel,
        Artifact::Initrd,
        Artifact::SymbolMap,
        Artifact::RootVolume,
        Artifact::HashVolume,
        Artifact::VerityUuid,
        Artifact::RootHash,
        Artifact::CombinedVolume,
        Artifact::CommandLine,
        Artifact::OsRelease,
        Artifact::BootExecutable,
    ];

    /// File name under the working directory.
    pub const fn file_name(self) -> &'static str {
        match self {
            Artifact::ComposeId => "compose-id",
            Artifact::ResultBundle => "results.tar",
            Artifact::RawImage => "disk.raw",
            Artifact::Kernel => "vmlinuz",
            Artifact::Initrd => "initramfs.img",
            Artifact::SymbolMap => "System.map",
            Artifact::RootVolume => "root.img",
            Artifact::HashVolume => "hash.img",
            Artifact::VerityUuid => "verity-uuid",
            Artifact::RootHash => "roothash",
            Artifact::CombinedVolume => "combined.img",
            Artifact::CommandLine => "cmdline",
            Artifact::OsRelease => "os-release",
            Artifact::BootExecutable => "boot.efi",
        }
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

/// Checkpoint store rooted at a compose working directory.
#[derive(Debug)]
pub struct CheckpointStore {
    root: PathBuf,
    _lock: WorkdirLock,
}

impl CheckpointStore {
    /// Open (creating if needed) the store at `root`.
    ///
    /// Fails when another process holds the working directory.
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root.join(TMP_DIR))
            .io_context(|| format!("creating working directory '{}'", root.display()))?;
        let lock = WorkdirLock::acquire(&root.join(LOCK_FILE))?;
        let store = Self {
            root: root.to_path_buf(),
            _lock: lock,
        };
        store.discard_temporaries()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Final location of an artifact (whether or not it exists yet).
    pub fn path(&self, artifact: Artifact) -> PathBuf {
        self.root.join(artifact.file_name())
    }

    pub fn exists(&self, artifact: Artifact) -> bool {
        self.path(artifact).is_file()
    }

    pub fn read(&self, artifact: Artifact) -> Result<Vec<u8>> {
        let path = self.path(artifact);
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(ComposeError::NotFound(format!("checkpoint '{artifact}'")))
            }
            Err(e) => Err(e).io_context(|| format!("reading checkpoint '{}'", path.display())),
        }
    }

    /// Read a text artifact with surrounding whitespace trimmed.
    pub fn read_to_string(&self, artifact: Artifact) -> Result<String> {
        let bytes = self.read(artifact)?;
        String::from_utf8(bytes)
            .map(|s| s.trim().to_string())
            .map_err(|_| ComposeError::parse(format!("checkpoint '{artifact}'"), "not UTF-8"))
    }

    /// Commit an artifact whose bytes are written by `producer` into an open file.
    pub fn write_atomic<F>(&self, artifact: Artifact, producer: F) -> Result<()>
    where
        F: FnOnce(&mut File) -> Result<()>,
    {
        self.write_atomic_path(artifact, |tmp| {
            let mut file =
                File::create(tmp).io_context(|| format!("creating '{}'", tmp.display()))?;
            producer(&mut file)?;
            file.flush()
                .and_then(|_| file.sync_all())
                .io_context(|| format!("syncing '{}'", tmp.display()))
        })
    }

    /// Commit an artifact that `producer` creates itself at the given path.
    ///
    /// Used for external tools that insist on naming their own output file.
    pub fn write_atomic_path<F>(&self, artifact: Artifact, producer: F) -> Result<()>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        let dest = self.path(artifact);
        if dest.exists() {
            return Err(ComposeError::Io {
                context: format!("committing checkpoint '{}'", dest.display()),
                source: io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "checkpoint artifacts are write-once",
                ),
            });
        }

        let tmp = self.tmp_path(artifact);
        let produced = producer(&tmp).and_then(|()| {
            if tmp.is_file() {
                Ok(())
            } else {
                Err(ComposeError::NotFound(format!(
                    "output '{}' for checkpoint '{artifact}'",
                    tmp.display()
                )))
            }
        });
        if let Err(e) = produced {
            discard(&tmp);
            return Err(e);
        }

        fs::rename(&tmp, &dest).io_context(|| {
            format!("renaming '{}' -> '{}'", tmp.display(), dest.display())
        })?;
        debug!(artifact = %artifact, "checkpoint committed");
        Ok(())
    }

    /// Commit a small text artifact.
    pub fn write_string(&self, artifact: Artifact, content: &str) -> Result<()> {
        self.write_atomic(artifact, |file| {
            file.write_all(content.as_bytes())
                .io_context(|| format!("writing checkpoint '{artifact}'"))
        })
    }

    /// Scratch path under the store's temporary directory (same filesystem
    /// as the artifacts, so renames stay atomic).
    pub fn scratch_path(&self, name: &str) -> PathBuf {
        self.root.join(TMP_DIR).join(tmp_name(name))
    }

    fn tmp_path(&self, artifact: Artifact) -> PathBuf {
        self.scratch_path(artifact.file_name())
    }

    fn discard_temporaries(&self) -> Result<()> {
        let dir = self.root.join(TMP_DIR);
        for entry in fs::read_dir(&dir).io_context(|| format!("reading '{}'", dir.display()))? {
            let entry = entry.io_context(|| format!("reading '{}'", dir.display()))?;
            let path = entry.path();
            debug!(path = %path.display(), "discarding stale temporary");
            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            removed.io_context(|| format!("removing stale temporary '{}'", path.display()))?;
        }
        Ok(())
    }
}

/// Exclusive advisory lock on the working directory.
///
/// The lock file itself is left in place on drop: unlinking a file another
/// process is blocked on would let a third process lock a fresh inode.
#[derive(Debug)]
struct WorkdirLock {
    _file: File,
}

impl WorkdirLock {
    fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .io_context(|| format!("creating lock file '{}'", path.display()))?;
        file.try_lock_exclusive().io_context(|| {
            format!(
                "working directory is in use by another run (lock '{}')",
                path.display()
            )
        })?;
        Ok(Self { _file: file })
    }
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "could not remove temporary");
        }
    }
}

fn tmp_name(prefix: &str) -> String {
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{prefix}.{}-{n}", std::process::id())
}
