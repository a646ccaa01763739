//! `compose.toml` loading.
//!
//! ```toml
//! [service]
//! base_url = "http://localhost/api/v1"
//! poll_interval_secs = 10
//!
//! [blueprint]
//! template = "blueprint.toml.in"
//!
//! [volume]
//! compression = "xz"
//! ```
//!
//! Only `blueprint.template` is mandatory. Relative paths are resolved
//! against the directory holding the config file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::codec::Compression;
use crate::error::{ComposeError, IoContext, Result};

pub const CONFIG_FILENAME: &str = "compose.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComposeConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    pub blueprint: BlueprintConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub kernel: KernelConfig,
    #[serde(default)]
    pub volume: VolumeConfig,
    #[serde(default)]
    pub boot: BootConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub test: TestConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// API root; endpoint paths such as `/compose` are appended to it.
    pub base_url: String,
    pub poll_interval_secs: u64,
    pub compose_type: String,
    pub branch: String,
    /// Suffix of the disk image member in the results archive; the member
    /// is `<compose id><suffix>` and the suffix's extension picks the codec.
    pub image_suffix: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost/api/v1".to_string(),
            poll_interval_secs: 10,
            compose_type: "raw".to_string(),
            branch: "master".to_string(),
            image_suffix: "-disk.raw.xz".to_string(),
        }
    }
}

impl ServiceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlueprintConfig {
    pub template: PathBuf,
}

/// Git repository whose HEAD is stamped into the blueprint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceConfig {
    pub url: Option<String>,
    pub branch: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: None,
            branch: "main".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    /// Require a `System.map-*` next to the kernel in `/boot`.
    pub require_symbol_map: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            require_symbol_map: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VolumeConfig {
    pub compression: Compression,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BootConfig {
    /// EFI stub the unified kernel image is built on.
    pub stub: PathBuf,
    /// os-release file embedded as the `.osrel` section.
    pub os_release: PathBuf,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            stub: PathBuf::from("/usr/lib/systemd/boot/efi/linuxx64.efi.stub"),
            os_release: PathBuf::from("/etc/os-release"),
        }
    }
}

/// External tool names or paths.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolsConfig {
    pub veritysetup: String,
    pub blkid: String,
    pub objcopy: String,
    pub xz: String,
    pub guestfish: String,
    pub git: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            veritysetup: "veritysetup".to_string(),
            blkid: "blkid".to_string(),
            objcopy: "objcopy".to_string(),
            xz: "xz".to_string(),
            guestfish: "guestfish".to_string(),
            git: "git".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TestConfig {
    /// Run the boot test after assembling the boot executable.
    pub enabled: bool,
    pub timeout_secs: u64,
    pub memory_gb: u32,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_secs: 300,
            memory_gb: 2,
        }
    }
}

/// `<config dir>/uki-compose/compose.toml`, when the platform has one.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("uki-compose").join(CONFIG_FILENAME))
}

/// Load and validate the config file at `path`.
pub fn load_config(path: &Path) -> Result<ComposeConfig> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(ComposeError::NotFound(format!(
                "config file '{}'",
                path.display()
            )))
        }
        Err(e) => return Err(e).io_context(|| format!("reading config '{}'", path.display())),
    };
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    parse_config(&text, path, base_dir)
}

/// Parse config text; `origin` names it in errors, `base_dir` anchors
/// relative paths.
pub fn parse_config(text: &str, origin: &Path, base_dir: &Path) -> Result<ComposeConfig> {
    let invalid = |message: String| ComposeError::Config {
        path: origin.to_path_buf(),
        message,
    };

    let mut config: ComposeConfig = toml::from_str(text).map_err(|e| invalid(e.to_string()))?;

    if config.service.poll_interval_secs == 0 {
        return Err(invalid("service.poll_interval_secs must be at least 1".into()));
    }
    if config.service.base_url.trim().is_empty() {
        return Err(invalid("service.base_url must not be empty".into()));
    }
    if config.service.image_suffix.trim().is_empty() {
        return Err(invalid("service.image_suffix must not be empty".into()));
    }
    if let Some(url) = &config.source.url {
        if url.trim().is_empty() {
            return Err(invalid("source.url must not be empty when set".into()));
        }
        if config.source.branch.trim().is_empty() {
            return Err(invalid("source.branch must not be empty".into()));
        }
    }

    config.blueprint.template = resolve_path(base_dir, &config.blueprint.template);
    config.boot.stub = resolve_path(base_dir, &config.boot.stub);
    config.boot.os_release = resolve_path(base_dir, &config.boot.os_release);
    Ok(config)
}

fn resolve_path(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn parse(text: &str) -> Result<ComposeConfig> {
        parse_config(text, Path::new("compose.toml"), Path::new("/etc/uki-compose"))
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse("[blueprint]\ntemplate = \"bp.toml.in\"\n").unwrap();
        assert_eq!(
            config.blueprint.template,
            PathBuf::from("/etc/uki-compose/bp.toml.in")
        );
        assert_eq!(config.service.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.service.image_suffix, "-disk.raw.xz");
        assert_eq!(config.volume.compression, Compression::Xz);
        assert!(config.kernel.require_symbol_map);
        assert!(!config.test.enabled);
        assert_eq!(config.tools.veritysetup, "veritysetup");
        assert!(config.source.url.is_none());
    }

    #[test]
    fn sections_override_defaults() {
        let config = parse(
            r#"
[service]
base_url = "http://composer:8080/api/v1"
poll_interval_secs = 2

[blueprint]
template = "/srv/bp.toml.in"

[volume]
compression = "zstd"

[kernel]
require_symbol_map = false

[boot]
stub = "stubs/linuxx64.efi.stub"

[tools]
veritysetup = "/usr/sbin/veritysetup"
"#,
        )
        .unwrap();
        assert_eq!(config.service.base_url, "http://composer:8080/api/v1");
        assert_eq!(config.service.poll_interval_secs, 2);
        assert_eq!(config.service.compose_type, "raw");
        assert_eq!(config.blueprint.template, PathBuf::from("/srv/bp.toml.in"));
        assert_eq!(config.volume.compression, Compression::Zstd);
        assert!(!config.kernel.require_symbol_map);
        assert_eq!(
            config.boot.stub,
            PathBuf::from("/etc/uki-compose/stubs/linuxx64.efi.stub")
        );
        assert_eq!(config.tools.veritysetup, "/usr/sbin/veritysetup");
        assert_eq!(config.tools.objcopy, "objcopy");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = parse("[blueprint]\ntemplate = \"a\"\n[volume]\ncompresion = \"xz\"\n").unwrap_err();
        assert!(matches!(err, ComposeError::Config { .. }));
    }

    #[test]
    fn unknown_compression_is_rejected() {
        let err = parse("[blueprint]\ntemplate = \"a\"\n[volume]\ncompression = \"lz4\"\n").unwrap_err();
        assert!(matches!(err, ComposeError::Config { .. }));
    }

    #[test]
    fn missing_template_is_rejected() {
        assert!(matches!(parse("").unwrap_err(), ComposeError::Config { .. }));
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let err = parse("[service]\npoll_interval_secs = 0\n[blueprint]\ntemplate = \"a\"\n").unwrap_err();
        assert!(err.to_string().contains("poll_interval_secs"));
    }

    #[test]
    fn missing_file_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let err = load_config(&tmp.path().join(CONFIG_FILENAME)).unwrap_err();
        assert!(matches!(err, ComposeError::NotFound(_)));
    }

    #[test]
    fn load_resolves_relative_to_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILENAME);
        fs::write(&path, "[blueprint]\ntemplate = \"bp.toml.in\"\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.blueprint.template, tmp.path().join("bp.toml.in"));
    }
}
