//! Process-wide configuration for the bridge.
//!
//! Configuration is read once at startup (optionally from a TOML file, then
//! overridden by CLI flags / environment) and shared immutably afterwards.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Placeholder substituted with the (shell-quoted) package name.
pub const PACKAGE_PLACEHOLDER: &str = "{package}";

/// A named set of resources a sandbox may be created with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceProfile {
    /// Name the assistant refers to (e.g. `"default"`, `"gpu-t4"`).
    pub name: String,
    /// Requested CPU cores.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<u32>,
    /// Requested memory in megabytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u32>,
    /// GPU specification in `TYPE[:COUNT]` form, e.g. `"A100-40GB:2"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<String>,
}

impl ResourceProfile {
    /// Creates a profile with no explicit resources.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cpu: None,
            memory_mb: None,
            gpu: None,
        }
    }

    /// Sets the CPU core count.
    #[must_use]
    pub fn with_cpu(mut self, cpu: u32) -> Self {
        self.cpu = Some(cpu);
        self
    }

    /// Sets the memory limit in megabytes.
    #[must_use]
    pub fn with_memory_mb(mut self, memory_mb: u32) -> Self {
        self.memory_mb = Some(memory_mb);
        self
    }

    /// Sets the GPU specification.
    #[must_use]
    pub fn with_gpu(mut self, gpu: impl Into<String>) -> Self {
        self.gpu = Some(gpu.into());
        self
    }
}

/// Where and how to reach the remote sandbox provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderSettings {
    /// Base URL of the provider API.
    pub endpoint: Option<String>,
    /// Bearer token sent with every request.
    #[serde(skip_serializing)]
    pub token: Option<String>,
    /// Upper bound for provisioning/termination/snapshot round trips.
    pub request_timeout_seconds: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            token: None,
            request_timeout_seconds: 120,
        }
    }
}

/// Configuration for the whole bridge.
///
/// # Example
///
/// ```
/// use sandbox_session_bridge::config::BridgeConfig;
///
/// let config = BridgeConfig::default()
///     .with_max_timeout_seconds(7200)
///     .with_output_byte_cap(1024);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// Remote provider connection settings.
    pub provider: ProviderSettings,

    /// Largest `timeout_seconds` a sandbox may be created with.
    pub max_timeout_seconds: u64,

    /// Timeout applied when the caller does not pass one.
    pub default_timeout_seconds: u64,

    /// Per-stream byte cap for stdout/stderr handed back to the assistant.
    pub output_byte_cap: usize,

    /// Upper bound for a single foreground command round trip.
    pub command_timeout_seconds: u64,

    /// How often the background reaper looks for expired sandboxes.
    pub sweep_interval_seconds: u64,

    /// How long retired sandboxes stay queryable via `get_sandbox_status`.
    pub retired_retention_seconds: u64,

    /// Profile used when `create_sandbox` omits `resource_profile`.
    pub default_profile: String,

    /// Whitelist of resource profiles.
    pub profiles: Vec<ResourceProfile>,

    /// Shell command template used by `install_package`.
    pub install_command: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            provider: ProviderSettings::default(),
            max_timeout_seconds: 24 * 60 * 60,
            default_timeout_seconds: 20 * 60,
            output_byte_cap: 64 * 1024,
            command_timeout_seconds: 600,
            sweep_interval_seconds: 5,
            retired_retention_seconds: 60 * 60,
            default_profile: String::from("default"),
            profiles: vec![
                ResourceProfile::new("default")
                    .with_cpu(2)
                    .with_memory_mb(2048),
                ResourceProfile::new("cpu-large")
                    .with_cpu(8)
                    .with_memory_mb(16384),
                ResourceProfile::new("gpu-t4").with_gpu("T4"),
            ],
            install_command: format!("apt-get install -y {PACKAGE_PLACEHOLDER}"),
        }
    }
}

impl BridgeConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a TOML file and validates it.
    ///
    /// Keys missing from the file keep their default values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ReadFailed` if the file cannot be read,
    /// `ConfigError::ParseFailed` if it is not valid, or
    /// `ConfigError::Invalid` if validation fails.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
            path: path.display().to_string(),
            source: e,
        })?;

        let config = Self::from_toml_str(&content, &path.display().to_string())?;
        config.validate()?;
        Ok(config)
    }

    /// Parses configuration from TOML text without validating it.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ParseFailed` on malformed input.
    pub fn from_toml_str(content: &str, origin: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseFailed {
            path: origin.to_string(),
            reason: e.to_string(),
        })
    }

    /// Checks that values are internally consistent.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "max_timeout_seconds must be positive".into(),
            ));
        }
        if self.default_timeout_seconds == 0
            || self.default_timeout_seconds > self.max_timeout_seconds
        {
            return Err(ConfigError::Invalid(format!(
                "default_timeout_seconds must be between 1 and {}",
                self.max_timeout_seconds
            )));
        }
        if self.output_byte_cap == 0 {
            return Err(ConfigError::Invalid(
                "output_byte_cap must be positive".into(),
            ));
        }
        if self.command_timeout_seconds == 0 || self.sweep_interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "command_timeout_seconds and sweep_interval_seconds must be positive".into(),
            ));
        }
        if self.profile(&self.default_profile).is_none() {
            return Err(ConfigError::Invalid(format!(
                "default_profile '{}' is not among the configured profiles",
                self.default_profile
            )));
        }
        for (i, profile) in self.profiles.iter().enumerate() {
            if self.profiles[..i].iter().any(|p| p.name == profile.name) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate resource profile '{}'",
                    profile.name
                )));
            }
        }
        if !self.install_command.contains(PACKAGE_PLACEHOLDER) {
            return Err(ConfigError::Invalid(format!(
                "install_command must contain {PACKAGE_PLACEHOLDER}"
            )));
        }
        Ok(())
    }

    /// Looks up a whitelisted resource profile by name.
    #[must_use]
    pub fn profile(&self, name: &str) -> Option<&ResourceProfile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    /// Names of all whitelisted profiles.
    #[must_use]
    pub fn profile_names(&self) -> Vec<&str> {
        self.profiles.iter().map(|p| p.name.as_str()).collect()
    }

    /// Per-command round-trip limit.
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }

    /// Interval of the background reaper.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    /// Sets the provider endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.provider.endpoint = Some(endpoint.into());
        self
    }

    /// Sets the provider bearer token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.provider.token = Some(token.into());
        self
    }

    /// Sets the maximum sandbox timeout.
    #[must_use]
    pub fn with_max_timeout_seconds(mut self, seconds: u64) -> Self {
        self.max_timeout_seconds = seconds;
        self
    }

    /// Sets the stdout/stderr byte cap.
    #[must_use]
    pub fn with_output_byte_cap(mut self, cap: usize) -> Self {
        self.output_byte_cap = cap;
        self
    }

    /// Sets the per-command round-trip limit.
    #[must_use]
    pub fn with_command_timeout_seconds(mut self, seconds: u64) -> Self {
        self.command_timeout_seconds = seconds;
        self
    }

    /// Sets the reaper interval.
    #[must_use]
    pub fn with_sweep_interval_seconds(mut self, seconds: u64) -> Self {
        self.sweep_interval_seconds = seconds;
        self
    }

    /// Sets how long retired sandboxes remain queryable.
    #[must_use]
    pub fn with_retired_retention_seconds(mut self, seconds: u64) -> Self {
        self.retired_retention_seconds = seconds;
        self
    }

    /// Adds a resource profile to the whitelist.
    #[must_use]
    pub fn with_profile(mut self, profile: ResourceProfile) -> Self {
        self.profiles.push(profile);
        self
    }

    /// Sets the install command template.
    #[must_use]
    pub fn with_install_command(mut self, template: impl Into<String>) -> Self {
        self.install_command = template.into();
        self
    }
}
