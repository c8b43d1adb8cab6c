//! Gateway configuration.
//!
//! Read from the TOML file named by `CUBICLE_CONFIG`, if set, then overridden
//! by `CUBICLE_LISTEN_ADDR` and `CUBICLE_DATABASE_URL`. Every field has a
//! default, so an empty file (or none at all) is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use cubicle_core::endpoint::{DEFAULT_CONTROL_BASE, DEFAULT_DISPLAY_BASE};
use cubicle_core::{CoreError, PortLayout};
use cubicle_runtime::{
    ComposeDriver, DescriptorStore, IsolationTemplate, OrchestratorSettings, DEFAULT_BUILD_TIMEOUT,
    DEFAULT_COMMAND_TIMEOUT, DEFAULT_QUOTA,
};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "CUBICLE_CONFIG";
/// Environment override for [`GatewayConfig::listen_addr`].
pub const LISTEN_ADDR_ENV: &str = "CUBICLE_LISTEN_ADDR";
/// Environment override for [`GatewayConfig::database_url`].
pub const DATABASE_URL_ENV: &str = "CUBICLE_DATABASE_URL";

/// Failures while loading configuration.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("cannot read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for [`GatewayConfig`].
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The port bases do not form a usable layout.
    #[error("invalid runtime port layout: {0}")]
    Ports(#[from] CoreError),
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[non_exhaustive]
pub struct GatewayConfig {
    /// Socket address the HTTP server binds.
    pub listen_addr: String,

    /// SQLite URL for the record store. Records are kept in memory when unset.
    pub database_url: Option<String>,

    /// Host name browsers use to reach VM endpoints.
    pub public_host: String,

    /// Container runtime and lifecycle settings.
    pub runtime: RuntimeConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:5000".to_owned(),
            database_url: None,
            public_host: "localhost".to_owned(),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load from the process environment.
    ///
    /// # Errors
    /// Returns [`ConfigError`] if the named file cannot be read or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` in place of the process environment.
    ///
    /// # Errors
    /// Returns [`ConfigError`] if the named file cannot be read or parsed.
    pub fn load_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match lookup(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        if let Some(addr) = lookup(LISTEN_ADDR_ENV) {
            config.listen_addr = addr;
        }
        if let Some(url) = lookup(DATABASE_URL_ENV) {
            config.database_url = Some(url);
        }
        Ok(config)
    }

    /// Parse a TOML config file.
    ///
    /// # Errors
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    /// Parse TOML text.
    ///
    /// # Errors
    /// Returns [`ConfigError::Parse`] on malformed input or unknown keys.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Orchestrator settings derived from this config.
    ///
    /// # Errors
    /// Returns [`ConfigError::Ports`] if the port bases overlap.
    pub fn orchestrator_settings(&self) -> Result<OrchestratorSettings, ConfigError> {
        let ports = PortLayout::new(self.runtime.display_base, self.runtime.control_base)?;
        Ok(OrchestratorSettings::new(self.runtime.quota, ports, self.public_host.clone()))
    }
}

/// The `[runtime]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[non_exhaustive]
pub struct RuntimeConfig {
    /// Container runtime executable.
    pub program: PathBuf,

    /// Arguments placed before every compose invocation.
    pub program_args: Vec<String>,

    /// Directory holding per-VM descriptors; created at startup.
    pub descriptor_dir: PathBuf,

    /// Sandbox image tag.
    pub image: String,

    /// Build context for the sandbox image.
    pub build_context: PathBuf,

    /// Isolation manifest (Dockerfile), relative to `build_context`.
    pub manifest: PathBuf,

    pub command_timeout_secs: u64,
    pub build_timeout_secs: u64,

    /// Maximum VMs per owner.
    pub quota: usize,

    pub display_base: u16,
    pub control_base: u16,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("docker"),
            program_args: vec!["compose".to_owned()],
            descriptor_dir: PathBuf::from("/var/lib/cubicle/descriptors"),
            image: "cubicle-desktop:latest".to_owned(),
            build_context: PathBuf::from("/usr/share/cubicle/sandbox"),
            manifest: PathBuf::from("Dockerfile"),
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT.as_secs(),
            build_timeout_secs: DEFAULT_BUILD_TIMEOUT.as_secs(),
            quota: DEFAULT_QUOTA,
            display_base: DEFAULT_DISPLAY_BASE,
            control_base: DEFAULT_CONTROL_BASE,
        }
    }
}

impl RuntimeConfig {
    #[must_use]
    pub fn descriptor_store(&self) -> DescriptorStore {
        DescriptorStore::new(self.descriptor_dir.clone())
    }

    #[must_use]
    pub fn template(&self) -> IsolationTemplate {
        IsolationTemplate::new(self.image.clone(), self.build_context.clone(), self.manifest.clone())
    }

    /// Compose driver sharing `descriptors` with the orchestrator.
    #[must_use]
    pub fn driver(&self, descriptors: DescriptorStore) -> ComposeDriver {
        ComposeDriver::new(self.program.clone(), self.program_args.clone(), descriptors).with_timeouts(
            Duration::from_secs(self.command_timeout_secs),
            Duration::from_secs(self.build_timeout_secs),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = match GatewayConfig::from_toml("") {
            Ok(c) => c,
            Err(e) => panic!("parse failed: {e}"),
        };
        assert_eq!(config, GatewayConfig::default());
        assert_eq!(config.listen_addr, "127.0.0.1:5000");
        assert_eq!(config.runtime.quota, 3);
        assert_eq!(config.runtime.program_args, ["compose"]);
    }

    #[test]
    fn partial_runtime_section_keeps_other_defaults() {
        let raw = r#"
            public_host = "sandbox.example.net"

            [runtime]
            program = "podman"
            quota = 5
        "#;
        let config = match GatewayConfig::from_toml(raw) {
            Ok(c) => c,
            Err(e) => panic!("parse failed: {e}"),
        };
        assert_eq!(config.public_host, "sandbox.example.net");
        assert_eq!(config.runtime.program, PathBuf::from("podman"));
        assert_eq!(config.runtime.quota, 5);
        assert_eq!(config.runtime.display_base, 6080);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(GatewayConfig::from_toml("listen = \"x\""), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn env_overrides_file_values() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir: {e}"),
        };
        let path = dir.path().join("cubicle.toml");
        if let Err(e) = std::fs::write(&path, "listen_addr = \"0.0.0.0:8000\"\n") {
            panic!("write: {e}");
        }
        let env: HashMap<&str, String> = HashMap::from([
            (CONFIG_ENV, path.display().to_string()),
            (DATABASE_URL_ENV, "sqlite://cubicle.db?mode=rwc".to_owned()),
        ]);
        let config = match GatewayConfig::load_with(|key| env.get(key).cloned()) {
            Ok(c) => c,
            Err(e) => panic!("load failed: {e}"),
        };
        assert_eq!(config.listen_addr, "0.0.0.0:8000");
        assert_eq!(config.database_url.as_deref(), Some("sqlite://cubicle.db?mode=rwc"));
    }

    #[test]
    fn missing_file_is_read_error() {
        let result = GatewayConfig::load_with(|key| (key == CONFIG_ENV).then(|| "/nonexistent/cubicle.toml".to_owned()));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn overlapping_port_bases_are_rejected() {
        let raw = "[runtime]\ndisplay_base = 5901\ncontrol_base = 5901\n";
        let config = match GatewayConfig::from_toml(raw) {
            Ok(c) => c,
            Err(e) => panic!("parse failed: {e}"),
        };
        assert!(matches!(config.orchestrator_settings(), Err(ConfigError::Ports(_))));
    }
}
