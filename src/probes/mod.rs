pub mod tcp;

use crate::config::ProbeDef;
use crate::targets::{self, Targets, TargetsEnv};
use crate::{CadenceError, Result};
use async_trait::async_trait;
use cadence_common::MeasurementEvent;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A probe worker.
///
/// `start` runs the probe until `token` is cancelled, writing measurements to
/// `tx`. Cancellation is cooperative: implementations must watch the token.
/// Failures of the probed system are reported as measurement values, never
/// as errors.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn start(&self, token: CancellationToken, tx: mpsc::Sender<MeasurementEvent>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeType {
    Tcp,
    UserDefined,
}

impl ProbeType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ProbeType::Tcp => "tcp",
            ProbeType::UserDefined => "user_defined",
        }
    }
}

impl std::fmt::Display for ProbeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Resolved settings a probe implementation is built from.
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    pub name: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub port: Option<u16>,
    pub targets: Arc<dyn Targets>,
    pub labels: BTreeMap<String, String>,
}

impl ProbeOptions {
    pub fn build(def: &ProbeDef, env: &TargetsEnv) -> Result<Self> {
        Ok(Self {
            name: def.name.clone(),
            interval: def.interval(),
            timeout: def.timeout(),
            port: def.port,
            targets: targets::build(&def.targets, env)?,
            labels: def.labels.clone(),
        })
    }
}

/// A registered probe: its definition plus the worker built from it.
pub struct ProbeInfo {
    pub name: String,
    pub probe_type: ProbeType,
    pub interval: Duration,
    pub timeout: Duration,
    definition: ProbeDef,
    worker: Arc<dyn Probe>,
}

impl ProbeInfo {
    pub fn worker(&self) -> Arc<dyn Probe> {
        Arc::clone(&self.worker)
    }

    pub fn definition(&self) -> &ProbeDef {
        &self.definition
    }

    pub fn snapshot(&self, running: bool) -> ProbeSnapshot {
        ProbeSnapshot {
            name: self.name.clone(),
            probe_type: self.probe_type,
            interval_msec: self.interval.as_millis() as u64,
            timeout_msec: self.timeout.as_millis() as u64,
            running,
            definition: self.definition.clone(),
        }
    }
}

impl std::fmt::Debug for ProbeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeInfo")
            .field("name", &self.name)
            .field("probe_type", &self.probe_type)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

/// Owned copy of a registered probe, safe to hand out and serialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeSnapshot {
    pub name: String,
    #[serde(rename = "type")]
    pub probe_type: ProbeType,
    pub interval_msec: u64,
    pub timeout_msec: u64,
    pub running: bool,
    pub definition: ProbeDef,
}

/// Builds probe workers from definitions.
#[derive(Clone, Default)]
pub struct ProbeFactory {
    user_defined: HashMap<String, Arc<dyn Probe>>,
}

impl ProbeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `probe` available to `user_defined` definitions named `name`.
    pub fn register_user_defined(&mut self, name: impl Into<String>, probe: Arc<dyn Probe>) {
        self.user_defined.insert(name.into(), probe);
    }

    pub fn create(&self, def: &ProbeDef, opts: ProbeOptions) -> Result<ProbeInfo> {
        let worker: Arc<dyn Probe> = match def.probe_type {
            ProbeType::Tcp => Arc::new(tcp::TcpProbe::new(opts)),
            ProbeType::UserDefined => self.user_defined.get(&def.name).cloned().ok_or_else(|| {
                CadenceError::Unknown(format!(
                    "no user-defined probe implementation registered for {}",
                    def.name
                ))
            })?,
        };

        Ok(ProbeInfo {
            name: def.name.clone(),
            probe_type: def.probe_type,
            interval: def.interval(),
            timeout: def.timeout(),
            definition: def.clone(),
            worker,
        })
    }
}

impl std::fmt::Debug for ProbeFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.user_defined.keys().collect();
        names.sort();
        f.debug_struct("ProbeFactory")
            .field("user_defined", &names)
            .finish()
    }
}
