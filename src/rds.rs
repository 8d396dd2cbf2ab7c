//! Local resource discovery (RDS) server
//!
//! Serves statically configured resources grouped by provider. Probes use it
//! through `rds_provider` targets; remote callers reach it through the
//! control plane's `ListResources` request.

use crate::config::RdsServerConfig;
use crate::control::{ControlRequest, ControlResponse, ControlService};
use crate::{CadenceError, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::info;

pub const RDS_SERVICE: &str = "rds";

/// A discovered resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug)]
pub struct RdsServer {
    providers: HashMap<String, Vec<Resource>>,
}

impl RdsServer {
    pub fn new(config: &RdsServerConfig) -> Result<Self> {
        let mut providers = HashMap::new();
        for def in &config.provider {
            if def.name.is_empty() {
                return Err(CadenceError::InvalidArgument(
                    "rds provider without a name".to_string(),
                ));
            }
            let resources = def
                .resource
                .iter()
                .map(|r| Resource {
                    name: r.name.clone(),
                    ip: r.ip.clone(),
                    port: r.port,
                    labels: r.labels.clone(),
                })
                .collect();
            if providers.insert(def.name.clone(), resources).is_some() {
                return Err(CadenceError::InvalidArgument(format!(
                    "rds provider {} defined more than once",
                    def.name
                )));
            }
        }
        info!(providers = providers.len(), "RDS server initialized");
        Ok(Self { providers })
    }

    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_provider(&self, provider: &str) -> bool {
        self.providers.contains_key(provider)
    }

    /// Resources of a provider, optionally filtered by a name regex.
    pub fn list_resources(&self, provider: &str, name_filter: Option<&str>) -> Result<Vec<Resource>> {
        let resources = self
            .providers
            .get(provider)
            .ok_or_else(|| CadenceError::NotFound(format!("rds provider {}", provider)))?;

        let filter = name_filter
            .filter(|f| !f.is_empty())
            .map(Regex::new)
            .transpose()?;

        Ok(resources
            .iter()
            .filter(|r| filter.as_ref().map_or(true, |re| re.is_match(&r.name)))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ControlService for RdsServer {
    fn name(&self) -> &'static str {
        RDS_SERVICE
    }

    async fn handle(&self, request: ControlRequest) -> Result<ControlResponse> {
        match request {
            ControlRequest::ListResources {
                provider,
                name_filter,
            } => Ok(ControlResponse::Resources(
                self.list_resources(&provider, name_filter.as_deref())?,
            )),
            other => Err(CadenceError::Unimplemented(format!(
                "{} does not serve {}",
                RDS_SERVICE,
                other.kind()
            ))),
        }
    }
}
