//! Target resolution
//!
//! Turns a [`TargetsDef`] into something a probe can list endpoints from:
//! - `host_names`: a fixed list
//! - `shared_targets`: a set registered once at startup and reused by name
//! - `rds_provider`: resources served by the local discovery server
//!
//! When a lame-duck lister is available every resolved set filters out the
//! endpoints it reports.

pub mod lameduck;

use crate::config::{split_list, TargetsDef};
use crate::rds::RdsServer;
use crate::{CadenceError, Result};
use lameduck::Lister;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl Endpoint {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            port: None,
            labels: BTreeMap::new(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
}

pub trait Targets: Send + Sync + fmt::Debug {
    fn list_endpoints(&self) -> Vec<Endpoint>;
}

#[derive(Debug, Default)]
pub struct StaticTargets {
    endpoints: Vec<Endpoint>,
}

impl StaticTargets {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self { endpoints }
    }

    pub fn from_host_names(hosts: &str) -> Self {
        Self::new(split_list(hosts).into_iter().map(Endpoint::new).collect())
    }
}

impl Targets for StaticTargets {
    fn list_endpoints(&self) -> Vec<Endpoint> {
        self.endpoints.clone()
    }
}

#[derive(Debug)]
struct RdsTargets {
    server: Arc<RdsServer>,
    provider: String,
}

impl Targets for RdsTargets {
    fn list_endpoints(&self) -> Vec<Endpoint> {
        self.server
            .list_resources(&self.provider, None)
            .unwrap_or_default()
            .into_iter()
            .map(|r| Endpoint {
                name: r.ip.unwrap_or(r.name),
                port: r.port,
                labels: r.labels,
            })
            .collect()
    }
}

#[derive(Debug)]
struct LameDuckFiltered {
    inner: Arc<dyn Targets>,
    lister: Arc<dyn Lister>,
}

impl Targets for LameDuckFiltered {
    fn list_endpoints(&self) -> Vec<Endpoint> {
        self.inner
            .list_endpoints()
            .into_iter()
            .filter(|ep| !self.lister.is_lame_duck(&ep.name))
            .collect()
    }
}

/// Everything target resolution needs beyond the definition itself.
#[derive(Debug, Clone, Default)]
pub struct TargetsEnv {
    pub lame_duck: Option<Arc<dyn Lister>>,
    pub rds: Option<Arc<RdsServer>>,
    shared: HashMap<String, Arc<dyn Targets>>,
}

impl TargetsEnv {
    pub fn new(lame_duck: Option<Arc<dyn Lister>>, rds: Option<Arc<RdsServer>>) -> Self {
        Self {
            lame_duck,
            rds,
            shared: HashMap::new(),
        }
    }

    /// Register a shared target set under `name`.
    pub fn set_shared_targets(&mut self, name: &str, targets: Arc<dyn Targets>) -> Result<()> {
        if self.shared.contains_key(name) {
            return Err(CadenceError::AlreadyExists(format!("shared targets {}", name)));
        }
        self.shared.insert(name.to_string(), targets);
        Ok(())
    }

    pub fn shared_targets(&self, name: &str) -> Option<Arc<dyn Targets>> {
        self.shared.get(name).cloned()
    }
}

/// Resolve a targets definition.
pub fn build(def: &TargetsDef, env: &TargetsEnv) -> Result<Arc<dyn Targets>> {
    if let Some(name) = &def.shared_targets {
        // Shared sets were built with the same environment, lame-duck
        // filtering included.
        return env.shared_targets(name).ok_or_else(|| {
            CadenceError::InvalidArgument(format!("unknown shared targets {}", name))
        });
    }

    let targets: Arc<dyn Targets> = if let Some(hosts) = &def.host_names {
        Arc::new(StaticTargets::from_host_names(hosts))
    } else if let Some(provider) = &def.rds_provider {
        let server = env.rds.as_ref().ok_or_else(|| {
            CadenceError::InvalidArgument(format!(
                "rds_provider {} used without an rds_server",
                provider
            ))
        })?;
        if !server.has_provider(provider) {
            return Err(CadenceError::InvalidArgument(format!(
                "unknown rds provider {}",
                provider
            )));
        }
        Arc::new(RdsTargets {
            server: Arc::clone(server),
            provider: provider.clone(),
        })
    } else {
        Arc::new(StaticTargets::default())
    };

    Ok(match &env.lame_duck {
        Some(lister) => Arc::new(LameDuckFiltered {
            inner: targets,
            lister: Arc::clone(lister),
        }),
        None => targets,
    })
}

#[cfg(test)]
mod tests {
    use super::lameduck::StaticLister;
    use super::*;
    use crate::config::{RdsProviderDef, RdsServerConfig, ResourceDef};
    use crate::error::Code;

    fn names(targets: &Arc<dyn Targets>) -> Vec<String> {
        targets.list_endpoints().into_iter().map(|e| e.name).collect()
    }

    #[test]
    fn test_host_names() {
        let targets = build(&TargetsDef::host_names("a, b ,c"), &TargetsEnv::default()).unwrap();
        assert_eq!(names(&targets), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_empty_definition() {
        let targets = build(&TargetsDef::default(), &TargetsEnv::default()).unwrap();
        assert!(targets.list_endpoints().is_empty());
    }

    #[test]
    fn test_lame_duck_filtering() {
        let lister: Arc<dyn Lister> = Arc::new(StaticLister::new(["b"]));
        let env = TargetsEnv::new(Some(lister), None);
        let targets = build(&TargetsDef::host_names("a,b,c"), &env).unwrap();
        assert_eq!(names(&targets), vec!["a", "c"]);
    }

    #[test]
    fn test_shared_targets() {
        let mut env = TargetsEnv::default();
        let web = build(&TargetsDef::host_names("web-1,web-2"), &env).unwrap();
        env.set_shared_targets("web", web.clone()).unwrap();

        let err = env.set_shared_targets("web", web).unwrap_err();
        assert_eq!(err.code(), Code::AlreadyExists);

        let resolved = build(&TargetsDef::shared("web"), &env).unwrap();
        assert_eq!(names(&resolved), vec!["web-1", "web-2"]);

        let err = build(&TargetsDef::shared("db"), &env).unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[test]
    fn test_rds_targets() {
        let rds = RdsServer::new(&RdsServerConfig {
            provider: vec![RdsProviderDef {
                name: "static".into(),
                resource: vec![ResourceDef {
                    name: "web-1".into(),
                    ip: Some("10.0.0.7".into()),
                    port: Some(8080),
                    labels: BTreeMap::new(),
                }],
            }],
        })
        .unwrap();
        let env = TargetsEnv::new(None, Some(Arc::new(rds)));

        let targets = build(&TargetsDef::rds("static"), &env).unwrap();
        let endpoints = targets.list_endpoints();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].name, "10.0.0.7");
        assert_eq!(endpoints[0].port, Some(8080));

        assert!(build(&TargetsDef::rds("gce"), &env).is_err());
        assert!(build(&TargetsDef::rds("static"), &TargetsEnv::default()).is_err());
    }
}
