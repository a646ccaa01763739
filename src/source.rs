//! Git checkout of the image sources.
//!
//! The checkout lives at `<workdir>/source`. It is cloned on first use and
//! fetched + hard-reset to `origin/<branch>` afterwards, so local edits in
//! the working directory never leak into a compose.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{ComposeError, IoContext, Result};
use crate::process::Cmd;

pub const SOURCE_DIR: &str = "source";

pub fn source_dir(workdir: &Path) -> PathBuf {
    workdir.join(SOURCE_DIR)
}

/// Bring `dest` up to date with `origin/<branch>` of `url` and return the
/// commit id of `HEAD`.
pub fn refresh_source(git: &str, url: &str, branch: &str, dest: &Path) -> Result<String> {
    if dest.join(".git").is_dir() {
        info!(dest = %dest.display(), branch, "updating source checkout");
        Cmd::new(git)
            .arg("-C")
            .arg_path(dest)
            .args(["fetch", "--prune", "origin", branch])
            .error_msg(&format!("git fetch of '{branch}' failed"))
            .run()?;
        Cmd::new(git)
            .arg("-C")
            .arg_path(dest)
            .args(["reset", "--hard", &format!("origin/{branch}")])
            .error_msg(&format!("git reset to 'origin/{branch}' failed"))
            .run()?;
    } else {
        if dest.exists() {
            warn!(dest = %dest.display(), "removing incomplete source checkout");
            fs::remove_dir_all(dest).io_context(|| format!("removing '{}'", dest.display()))?;
        }
        info!(url, branch, dest = %dest.display(), "cloning source");
        Cmd::new(git)
            .args(["clone", "--branch", branch, url])
            .arg_path(dest)
            .error_msg(&format!("git clone of '{url}' failed"))
            .run()?;
    }

    let head = Cmd::new(git)
        .arg("-C")
        .arg_path(dest)
        .args(["rev-parse", "HEAD"])
        .run()?;
    let commit = head.stdout.trim().to_string();
    if !is_commit_id(&commit) {
        return Err(ComposeError::parse(
            "git rev-parse output",
            format!("'{commit}' is not a commit id"),
        ));
    }
    info!(commit = %commit, "source at");
    Ok(commit)
}

/// SHA-1 or SHA-256 object name.
fn is_commit_id(s: &str) -> bool {
    (s.len() == 40 || s.len() == 64) && s.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::tests::write_script;
    use tempfile::TempDir;

    const COMMIT: &str = "0123456789abcdef0123456789abcdef01234567";

    /// `git` stand-in: logs its arguments, `clone` creates `<dest>/.git`,
    /// `rev-parse` prints `$REV`.
    fn fake_git(dir: &Path, rev: &str) -> String {
        let log = dir.join("git.calls");
        write_script(
            dir,
            "git",
            &format!(
                r#"echo "$*" >> '{log}'
if [ "$1" = clone ]; then
  for last; do :; done
  mkdir -p "$last/.git"
  exit 0
fi
case "$3" in
  rev-parse) echo '{rev}' ;;
esac
"#,
                log = log.display()
            ),
        )
    }

    fn calls(dir: &Path) -> Vec<String> {
        fs::read_to_string(dir.join("git.calls"))
            .unwrap()
            .lines()
            .map(|l| l.split_whitespace().take(3).collect::<Vec<_>>().join(" "))
            .collect()
    }

    #[test]
    fn clones_then_fetches() {
        let bin = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let git = fake_git(bin.path(), COMMIT);
        let dest = source_dir(work.path());

        let commit = refresh_source(&git, "https://example.org/os.git", "main", &dest).unwrap();
        assert_eq!(commit, COMMIT);
        assert!(dest.join(".git").is_dir());

        refresh_source(&git, "https://example.org/os.git", "main", &dest).unwrap();
        let dest_arg = dest.display().to_string();
        assert_eq!(
            calls(bin.path()),
            vec![
                "clone --branch main".to_string(),
                format!("-C {dest_arg} rev-parse"),
                format!("-C {dest_arg} fetch"),
                format!("-C {dest_arg} reset"),
                format!("-C {dest_arg} rev-parse"),
            ]
        );
    }

    #[test]
    fn leftover_directory_is_recloned() {
        let bin = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let dest = source_dir(work.path());
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("stale"), "x").unwrap();

        refresh_source(&fake_git(bin.path(), COMMIT), "u", "main", &dest).unwrap();
        assert!(!dest.join("stale").exists());
        assert!(dest.join(".git").is_dir());
    }

    #[test]
    fn garbage_head_is_parse_error() {
        let bin = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let git = fake_git(bin.path(), "fatal: not a commit");
        let err = refresh_source(&git, "u", "main", &source_dir(work.path())).unwrap_err();
        assert!(matches!(err, ComposeError::Parse { .. }));
    }

    #[test]
    fn commit_id_shapes() {
        assert!(is_commit_id(COMMIT));
        assert!(is_commit_id(&"a".repeat(64)));
        assert!(!is_commit_id("abc123"));
    }
}
