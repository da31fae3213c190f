//! Sandbox configuration
//!
//! Limits and I/O policy for a sandbox, built in code or loaded from TOML.
//! Defaults live in the `DEFAULT_CONFIG` constant rather than in global state.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::io::IoPolicy;
use crate::error::{Result, SandboxError};

const MIB: u64 = 1024 * 1024;

/// Limits used when a sandbox is created without a configuration:
/// 512 MB of guest memory, 10 s per run, inherited standard streams.
pub const DEFAULT_CONFIG: SandboxConfig = SandboxConfig {
    memory_limit_mb: 512,
    timeout_ms: 10_000,
    io_policy: IoPolicy::Inherited,
    fuel_limit: None,
    output_limit_bytes: 1024 * 1024,
    max_table_elements: 10_000,
    workspace_writable: false,
};

/// Run constraints for a sandbox
///
/// Fields are only readable through accessors; a sandbox keeps its
/// configuration unchanged for its whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SandboxConfig {
    /// Guest memory ceiling in MB (all linear memories combined)
    memory_limit_mb: u64,
    /// Wall-clock budget of one run in milliseconds
    timeout_ms: u64,
    /// Whether guest stdout/stderr are captured or inherited
    io_policy: IoPolicy,
    /// Optional instruction budget (wasmtime fuel)
    fuel_limit: Option<u64>,
    /// Capacity of the capture buffer in bytes
    output_limit_bytes: usize,
    /// Maximum number of table elements the guest may grow to
    max_table_elements: usize,
    /// Whether staged workspace files may be modified by the guest
    workspace_writable: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        DEFAULT_CONFIG
    }
}

impl SandboxConfig {
    /// Create a config with the given memory and time limits, other settings default
    pub fn new(memory_limit_mb: u64, timeout_ms: u64) -> Self {
        Self {
            memory_limit_mb,
            timeout_ms,
            ..DEFAULT_CONFIG
        }
    }

    pub fn with_io_policy(mut self, io_policy: IoPolicy) -> Self {
        self.io_policy = io_policy;
        self
    }

    pub fn with_fuel_limit(mut self, fuel: u64) -> Self {
        self.fuel_limit = Some(fuel);
        self
    }

    pub fn with_output_limit(mut self, bytes: usize) -> Self {
        self.output_limit_bytes = bytes;
        self
    }

    pub fn with_max_table_elements(mut self, elements: usize) -> Self {
        self.max_table_elements = elements;
        self
    }

    pub fn with_writable_workspace(mut self, writable: bool) -> Self {
        self.workspace_writable = writable;
        self
    }

    pub fn memory_limit_mb(&self) -> u64 {
        self.memory_limit_mb
    }

    /// Memory ceiling in bytes
    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_mb.saturating_mul(MIB)
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn io_policy(&self) -> IoPolicy {
        self.io_policy
    }

    pub fn fuel_limit(&self) -> Option<u64> {
        self.fuel_limit
    }

    pub fn output_limit_bytes(&self) -> usize {
        self.output_limit_bytes
    }

    pub fn max_table_elements(&self) -> usize {
        self.max_table_elements
    }

    pub fn workspace_writable(&self) -> bool {
        self.workspace_writable
    }

    /// Check that every limit is usable
    pub fn validate(&self) -> Result<()> {
        if self.memory_limit_mb == 0 {
            return Err(SandboxError::Configuration(
                "memory_limit_mb must be greater than zero".into(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(SandboxError::Configuration(
                "timeout_ms must be greater than zero".into(),
            ));
        }
        if self.fuel_limit == Some(0) {
            return Err(SandboxError::Configuration(
                "fuel_limit must be greater than zero when set".into(),
            ));
        }
        if self.output_limit_bytes == 0 {
            return Err(SandboxError::Configuration(
                "output_limit_bytes must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Parse a TOML document; missing keys take their default value
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: SandboxConfig = toml::from_str(content)
            .map_err(|e| SandboxError::Configuration(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }
}

/// Load and validate a sandbox configuration file
pub fn load_config(path: impl AsRef<Path>) -> Result<SandboxConfig> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .map_err(|e| SandboxError::host_io(format!("failed to read {:?}", path), e))?;
    let config = SandboxConfig::from_toml_str(&content)?;
    debug!("Loaded sandbox configuration from {:?}: {:?}", path, config);
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = SandboxConfig::default();
        assert_eq!(config, DEFAULT_CONFIG);
        assert_eq!(config.memory_limit_mb(), 512);
        assert_eq!(config.timeout_ms(), 10_000);
        assert_eq!(config.io_policy(), IoPolicy::Inherited);
        assert_eq!(config.fuel_limit(), None);
        assert!(!config.workspace_writable());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_new_keeps_other_defaults() {
        let config = SandboxConfig::new(100, 5000);
        assert_eq!(config.memory_limit_mb(), 100);
        assert_eq!(config.timeout_ms(), 5000);
        assert_eq!(config.memory_limit_bytes(), 100 * 1024 * 1024);
        assert_eq!(config.output_limit_bytes(), DEFAULT_CONFIG.output_limit_bytes());
    }

    #[test]
    fn test_builders() {
        let config = SandboxConfig::new(64, 250)
            .with_io_policy(IoPolicy::Captured)
            .with_fuel_limit(1_000_000)
            .with_output_limit(4096)
            .with_max_table_elements(128)
            .with_writable_workspace(true);

        assert_eq!(config.io_policy(), IoPolicy::Captured);
        assert_eq!(config.fuel_limit(), Some(1_000_000));
        assert_eq!(config.output_limit_bytes(), 4096);
        assert_eq!(config.max_table_elements(), 128);
        assert!(config.workspace_writable());
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        assert!(matches!(
            SandboxConfig::new(0, 1000).validate(),
            Err(SandboxError::Configuration(_))
        ));
        assert!(matches!(
            SandboxConfig::new(16, 0).validate(),
            Err(SandboxError::Configuration(_))
        ));
        assert!(matches!(
            SandboxConfig::new(16, 10).with_fuel_limit(0).validate(),
            Err(SandboxError::Configuration(_))
        ));
        assert!(matches!(
            SandboxConfig::new(16, 10).with_output_limit(0).validate(),
            Err(SandboxError::Configuration(_))
        ));
    }

    #[test]
    fn test_memory_limit_bytes_saturates() {
        let config = SandboxConfig::new(u64::MAX, 1);
        assert_eq!(config.memory_limit_bytes(), u64::MAX);
    }

    #[test]
    fn test_from_toml_partial() {
        let config = SandboxConfig::from_toml_str(
            r#"
memory_limit_mb = 64
io_policy = "captured"
"#,
        )
        .unwrap();

        assert_eq!(config.memory_limit_mb(), 64);
        assert_eq!(config.timeout_ms(), DEFAULT_CONFIG.timeout_ms());
        assert_eq!(config.io_policy(), IoPolicy::Captured);
    }

    #[test]
    fn test_from_toml_rejects_bad_values() {
        assert!(matches!(
            SandboxConfig::from_toml_str("timeout_ms = -5"),
            Err(SandboxError::Configuration(_))
        ));
        assert!(matches!(
            SandboxConfig::from_toml_str("timeout_ms = 0"),
            Err(SandboxError::Configuration(_))
        ));
        assert!(matches!(
            SandboxConfig::from_toml_str("cpu_limit = 3"),
            Err(SandboxError::Configuration(_))
        ));
    }

    #[test]
    fn test_load_config_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
memory_limit_mb = 32
timeout_ms = 750
fuel_limit = 5000000
workspace_writable = true
"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.memory_limit_mb(), 32);
        assert_eq!(config.timeout_ms(), 750);
        assert_eq!(config.fuel_limit(), Some(5_000_000));
        assert!(config.workspace_writable());
    }

    #[test]
    fn test_load_config_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_config(dir.path().join("missing.toml"));
        assert!(matches!(result, Err(SandboxError::HostIo { .. })));
    }
}
