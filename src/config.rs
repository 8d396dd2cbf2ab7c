//! Prober configuration
//!
//! The configuration is a single YAML document. Every list uses the singular
//! key (`probe`, `surfacer`, `server`) so a definition reads naturally:
//!
//! ```yaml
//! probe:
//!   - name: redis
//!     type: tcp
//!     port: 6379
//!     interval_msec: 10000
//!     targets:
//!       host_names: redis-1,redis-2
//! surfacer:
//!   - type: prometheus
//! ```

use crate::probes::ProbeType;
use crate::servers::ServerType;
use crate::surfacers::SurfacerType;
use crate::{CadenceError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_INTERVAL_MSEC: u64 = 2_000;
pub const DEFAULT_TIMEOUT_MSEC: u64 = 1_000;
pub const DEFAULT_SYSVARS_INTERVAL_MSEC: u64 = 10_000;
pub const DEFAULT_SURFACER_QUEUE_SIZE: usize = 10_000;
pub const DEFAULT_STATS_EXPORT_INTERVAL_MSEC: u64 = 10_000;

fn default_interval_msec() -> u64 {
    DEFAULT_INTERVAL_MSEC
}

fn default_timeout_msec() -> u64 {
    DEFAULT_TIMEOUT_MSEC
}

fn default_sysvars_interval_msec() -> u64 {
    DEFAULT_SYSVARS_INTERVAL_MSEC
}

fn default_queue_size() -> usize {
    DEFAULT_SURFACER_QUEUE_SIZE
}

fn default_stats_export_interval_msec() -> u64 {
    DEFAULT_STATS_EXPORT_INTERVAL_MSEC
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

/// Top-level configuration handed to the prober.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProberConfig {
    #[serde(default)]
    pub probe: Vec<ProbeDef>,

    #[serde(default)]
    pub surfacer: Vec<SurfacerDef>,

    #[serde(default)]
    pub server: Vec<ServerDef>,

    #[serde(default)]
    pub shared_targets: Vec<SharedTargetsDef>,

    #[serde(default)]
    pub global_targets_options: GlobalTargetsOptions,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rds_server: Option<RdsServerConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane: Option<ControlPlaneConfig>,

    #[serde(default = "default_sysvars_interval_msec")]
    pub sysvars_interval_msec: u64,

    /// Comma separated environment variable names exported with sysvars.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sysvars_env_var: Option<String>,

    #[serde(default)]
    pub disable_jitter: bool,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            probe: Vec::new(),
            surfacer: Vec::new(),
            server: Vec::new(),
            shared_targets: Vec::new(),
            global_targets_options: GlobalTargetsOptions::default(),
            rds_server: None,
            control_plane: None,
            sysvars_interval_msec: DEFAULT_SYSVARS_INTERVAL_MSEC,
            sysvars_env_var: None,
            disable_jitter: false,
        }
    }
}

impl ProberConfig {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading configuration");
        let text = std::fs::read_to_string(path).map_err(|e| {
            CadenceError::ConfigError(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: ProberConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Rendered form of the configuration, served to introspection callers.
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn sysvars_interval(&self) -> Duration {
        Duration::from_millis(self.sysvars_interval_msec)
    }

    /// Environment variable names listed in `sysvars_env_var`.
    pub fn sysvars_env_vars(&self) -> Vec<String> {
        self.sysvars_env_var
            .as_deref()
            .map(split_list)
            .unwrap_or_default()
    }

    /// Structural checks that do not need any runtime state.
    ///
    /// Duplicate probe names are left to the registry, which reports them
    /// as `AlreadyExists` when the second definition is added.
    pub fn validate(&self) -> Result<()> {
        for probe in &self.probe {
            probe.validate()?;
        }

        let mut shared = HashSet::new();
        for st in &self.shared_targets {
            if st.name.is_empty() {
                return Err(CadenceError::ConfigError(
                    "shared_targets entry without a name".to_string(),
                ));
            }
            if !shared.insert(st.name.as_str()) {
                return Err(CadenceError::ConfigError(format!(
                    "shared targets {} defined more than once",
                    st.name
                )));
            }
            st.targets.validate(&st.name)?;
        }

        for surfacer in &self.surfacer {
            if surfacer.surfacer_type == SurfacerType::File && surfacer.file_path.is_none() {
                return Err(CadenceError::ConfigError(
                    "file surfacer requires file_path".to_string(),
                ));
            }
            if surfacer.queue_size == 0 {
                return Err(CadenceError::ConfigError(
                    "surfacer queue_size must be positive".to_string(),
                ));
            }
        }

        if self.sysvars_interval_msec == 0 {
            return Err(CadenceError::ConfigError(
                "sysvars_interval_msec must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

/// Definition of one probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeDef {
    pub name: String,

    #[serde(rename = "type")]
    pub probe_type: ProbeType,

    #[serde(default = "default_interval_msec")]
    pub interval_msec: u64,

    #[serde(default = "default_timeout_msec")]
    pub timeout_msec: u64,

    /// Regex matched against the local hostname; the probe only runs on
    /// hosts that match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_on: Option<String>,

    #[serde(default)]
    pub targets: TargetsDef,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Extra labels attached to every event of this probe.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl ProbeDef {
    pub fn new(name: impl Into<String>, probe_type: ProbeType) -> Self {
        Self {
            name: name.into(),
            probe_type,
            interval_msec: DEFAULT_INTERVAL_MSEC,
            timeout_msec: DEFAULT_TIMEOUT_MSEC,
            run_on: None,
            targets: TargetsDef::default(),
            port: None,
            labels: BTreeMap::new(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval_msec = interval.as_millis() as u64;
        if self.timeout_msec > self.interval_msec {
            self.timeout_msec = self.interval_msec;
        }
        self
    }

    pub fn with_run_on(mut self, pattern: impl Into<String>) -> Self {
        self.run_on = Some(pattern.into());
        self
    }

    pub fn with_targets(mut self, targets: TargetsDef) -> Self {
        self.targets = targets;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_msec)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_msec)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(CadenceError::ConfigError(
                "probe definition without a name".to_string(),
            ));
        }
        if self.interval_msec == 0 {
            return Err(CadenceError::ConfigError(format!(
                "probe {}: interval_msec must be positive",
                self.name
            )));
        }
        if self.timeout_msec > self.interval_msec {
            return Err(CadenceError::ConfigError(format!(
                "probe {}: timeout_msec ({}) must not exceed interval_msec ({})",
                self.name, self.timeout_msec, self.interval_msec
            )));
        }
        self.targets.validate(&self.name)
    }
}

/// Where a probe's targets come from. At most one source may be set; none
/// means the probe has no targets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetsDef {
    /// Comma separated host names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_names: Option<String>,

    /// Name of a shared target set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_targets: Option<String>,

    /// Provider on the local discovery server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rds_provider: Option<String>,
}

impl TargetsDef {
    pub fn host_names(hosts: impl Into<String>) -> Self {
        Self {
            host_names: Some(hosts.into()),
            ..Default::default()
        }
    }

    pub fn shared(name: impl Into<String>) -> Self {
        Self {
            shared_targets: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn rds(provider: impl Into<String>) -> Self {
        Self {
            rds_provider: Some(provider.into()),
            ..Default::default()
        }
    }

    fn validate(&self, owner: &str) -> Result<()> {
        let sources = [
            self.host_names.is_some(),
            self.shared_targets.is_some(),
            self.rds_provider.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count();
        if sources > 1 {
            return Err(CadenceError::ConfigError(format!(
                "{}: only one of host_names, shared_targets, rds_provider may be set",
                owner
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurfacerDef {
    #[serde(rename = "type")]
    pub surfacer_type: SurfacerType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,

    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_prefix: Option<String>,
}

impl SurfacerDef {
    pub fn new(surfacer_type: SurfacerType) -> Self {
        Self {
            surfacer_type,
            name: None,
            file_path: None,
            queue_size: DEFAULT_SURFACER_QUEUE_SIZE,
            metrics_prefix: None,
        }
    }

    /// Configured name, or the type name.
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.surfacer_type.as_str().to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDef {
    #[serde(rename = "type")]
    pub server_type: ServerType,

    #[serde(default = "default_bind")]
    pub bind: String,

    pub port: u16,

    #[serde(default = "default_stats_export_interval_msec")]
    pub stats_export_interval_msec: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedTargetsDef {
    pub name: String,
    pub targets: TargetsDef,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalTargetsOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lame_duck_options: Option<LameDuckOptions>,
}

/// Sources of lame-duck (excluded) endpoint names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LameDuckOptions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,

    /// File with one endpoint name per line; `#` starts a comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RdsServerConfig {
    #[serde(default)]
    pub provider: Vec<RdsProviderDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RdsProviderDef {
    pub name: String,
    #[serde(default)]
    pub resource: Vec<ResourceDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    pub address: String,
}

/// Split a comma separated list, dropping empty items.
pub(crate) fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
