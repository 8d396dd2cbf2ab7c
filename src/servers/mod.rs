pub mod udp;

use crate::config::ServerDef;
use crate::Result;
use async_trait::async_trait;
use cadence_common::MeasurementEvent;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// A wire server probes can target. Sockets are bound when the server is
/// built; `start` serves until `token` is cancelled.
#[async_trait]
pub trait Server: Send + Sync {
    async fn start(&self, token: CancellationToken, tx: mpsc::Sender<MeasurementEvent>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerType {
    Udp,
}

impl ServerType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ServerType::Udp => "udp",
        }
    }
}

impl std::fmt::Display for ServerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone)]
pub struct ServerInfo {
    pub server_type: ServerType,
    pub server: Arc<dyn Server>,
}

impl std::fmt::Debug for ServerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerInfo")
            .field("server_type", &self.server_type)
            .finish_non_exhaustive()
    }
}

pub async fn init(defs: &[ServerDef]) -> Result<Vec<ServerInfo>> {
    let mut servers = Vec::with_capacity(defs.len());
    for def in defs {
        let server: Arc<dyn Server> = match def.server_type {
            ServerType::Udp => Arc::new(udp::UdpServer::bind(def).await?),
        };
        info!(server_type = %def.server_type, port = def.port, "Server initialized");
        servers.push(ServerInfo {
            server_type: def.server_type,
            server,
        });
    }
    Ok(servers)
}
