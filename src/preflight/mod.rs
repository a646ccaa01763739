//! Preflight checks for compose runs.
//!
//! Validates that the host has every external tool a run will invoke
//! before the first phase starts, so a missing package shows up as one
//! complete list instead of a failure halfway through a compose.
//!
//! # Example
//!
//! ```rust,ignore
//! use uki_compose::preflight::{check_required_tools, required_tools};
//!
//! let tools = required_tools(&config, config.test.enabled);
//! if let Err(e) = check_required_tools(&tools) {
//!     eprintln!("{e}");
//! }
//! ```

use crate::codec::Compression;
use crate::config::ComposeConfig;
use crate::error::{ComposeError, Result};
use crate::process;

/// Tools the boot test uses. They are not configurable.
///
/// Each tuple is (command_name, package_name).
pub const BOOT_TEST_TOOLS: &[(&str, &str)] = &[
    ("sfdisk", "util-linux"),
    ("mkfs.vfat", "dosfstools"),
    ("mmd", "mtools"),
    ("mcopy", "mtools"),
    ("dd", "coreutils"),
    ("qemu-system-x86_64", "qemu-system-x86"),
];

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    process::exists(cmd)
}

/// Every (tool, package) a run with `config` needs.
pub fn required_tools(config: &ComposeConfig, boot_test: bool) -> Vec<(String, &'static str)> {
    let tools = &config.tools;
    let mut required = vec![
        (tools.guestfish.clone(), "guestfish"),
        (tools.veritysetup.clone(), "cryptsetup"),
        (tools.blkid.clone(), "util-linux"),
        (tools.objcopy.clone(), "binutils"),
    ];
    let xz_image = Compression::from_file_name(&config.service.image_suffix) == Compression::Xz;
    if xz_image || config.volume.compression == Compression::Xz {
        required.push((tools.xz.clone(), "xz"));
    }
    if config.source.url.is_some() {
        required.push((tools.git.clone(), "git"));
    }
    if boot_test {
        required.extend(BOOT_TEST_TOOLS.iter().map(|(t, p)| (t.to_string(), *p)));
    }
    required
}

/// Check that specific tools are available, reporting all missing ones at once.
pub fn check_required_tools<S: AsRef<str>>(tools: &[(S, &str)]) -> Result<()> {
    let missing: Vec<String> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool.as_ref()))
        .map(|(tool, package)| format!("  {} (install: {package})", tool.as_ref()))
        .collect();

    if !missing.is_empty() {
        return Err(ComposeError::NotFound(format!(
            "required host tools:\n{}",
            missing.join("\n")
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use std::path::Path;

    fn config(extra: &str) -> ComposeConfig {
        let text = format!("[blueprint]\ntemplate = \"bp.toml.in\"\n{extra}");
        parse_config(&text, Path::new("compose.toml"), Path::new("/etc/uki")).unwrap()
    }

    fn names(tools: &[(String, &str)]) -> Vec<String> {
        tools.iter().map(|(t, _)| t.clone()).collect()
    }

    #[test]
    fn test_command_exists() {
        assert!(command_exists("sh"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_check_required_tools_success() {
        let tools = &[("ls", "coreutils"), ("cat", "coreutils")];
        assert!(check_required_tools(tools).is_ok());
    }

    #[test]
    fn test_check_required_tools_lists_every_missing_tool() {
        let tools = &[
            ("nonexistent_command_xyz", "fake-package"),
            ("ls", "coreutils"),
            ("another_missing_tool", "other-package"),
        ];
        let err = check_required_tools(tools).unwrap_err().to_string();
        assert!(err.contains("nonexistent_command_xyz (install: fake-package)"), "{err}");
        assert!(err.contains("another_missing_tool (install: other-package)"), "{err}");
        assert!(!err.contains("  ls ("), "{err}");
    }

    #[test]
    fn defaults_need_xz_but_not_git() {
        let required = names(&required_tools(&config(""), false));
        assert!(required.contains(&"xz".to_string()));
        assert!(required.contains(&"veritysetup".to_string()));
        assert!(!required.contains(&"git".to_string()));
        assert!(!required.contains(&"sfdisk".to_string()));
    }

    #[test]
    fn configured_paths_and_options_are_honoured() {
        let cfg = config(
            "[service]\nimage_suffix = \"-disk.raw.gz\"\n\
             [volume]\ncompression = \"zstd\"\n\
             [source]\nurl = \"https://example.org/os.git\"\n\
             [tools]\nobjcopy = \"/opt/binutils/bin/objcopy\"\n",
        );
        let required = names(&required_tools(&cfg, true));
        assert!(!required.contains(&"xz".to_string()));
        assert!(required.contains(&"git".to_string()));
        assert!(required.contains(&"/opt/binutils/bin/objcopy".to_string()));
        assert!(required.contains(&"qemu-system-x86_64".to_string()));
    }
}
