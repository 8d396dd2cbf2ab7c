//! Control-plane service surface
//!
//! The control plane is the endpoint management tools talk to. Services
//! (the prober itself, the discovery server) attach to it by name and the
//! plane routes each [`ControlRequest`] to the service that owns it.
//!
//! A plane created with [`ControlPlane::bind`] also accepts TCP connections.
//! Each line a client sends is one JSON [`ControlRequest`]; the plane answers
//! every line with one JSON [`ControlReply`] line.

use crate::config::ProbeDef;
use crate::probes::ProbeSnapshot;
use crate::rds::{Resource, RDS_SERVICE};
use crate::{CadenceError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const PROBER_SERVICE: &str = "prober";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ControlRequest {
    AddProbe { probe: ProbeDef },
    RemoveProbe { name: String },
    StartProbe { name: String },
    StopProbe { name: String },
    ListProbes,
    GetConfig,
    ListResources {
        provider: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name_filter: Option<String>,
    },
}

impl ControlRequest {
    /// Name of the service that serves this request.
    pub fn service(&self) -> &'static str {
        match self {
            ControlRequest::ListResources { .. } => RDS_SERVICE,
            _ => PROBER_SERVICE,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ControlRequest::AddProbe { .. } => "add_probe",
            ControlRequest::RemoveProbe { .. } => "remove_probe",
            ControlRequest::StartProbe { .. } => "start_probe",
            ControlRequest::StopProbe { .. } => "stop_probe",
            ControlRequest::ListProbes => "list_probes",
            ControlRequest::GetConfig => "get_config",
            ControlRequest::ListResources { .. } => "list_resources",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", content = "data", rename_all = "snake_case")]
pub enum ControlResponse {
    Ok,
    Probes(Vec<ProbeSnapshot>),
    Config(String),
    Resources(Vec<Resource>),
}

/// What the TCP transport writes back for each request line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlReply {
    Ok(ControlResponse),
    Error { code: String, message: String },
}

impl ControlReply {
    pub fn error(err: &CadenceError) -> Self {
        ControlReply::Error {
            code: err.code().as_str().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<Result<ControlResponse>> for ControlReply {
    fn from(result: Result<ControlResponse>) -> Self {
        match result {
            Ok(response) => ControlReply::Ok(response),
            Err(e) => ControlReply::error(&e),
        }
    }
}

#[async_trait]
pub trait ControlService: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, request: ControlRequest) -> Result<ControlResponse>;
}

pub struct ControlPlane {
    local_addr: Option<SocketAddr>,
    listener: Mutex<Option<TcpListener>>,
    services: RwLock<HashMap<&'static str, Arc<dyn ControlService>>>,
}

impl ControlPlane {
    /// In-process plane; requests arrive only through [`ControlPlane::dispatch`].
    pub fn new() -> Self {
        Self {
            local_addr: None,
            listener: Mutex::new(None),
            services: RwLock::new(HashMap::new()),
        }
    }

    /// Bind the TCP endpoint. Connections queue until [`ControlPlane::serve`]
    /// runs.
    pub async fn bind(address: &str) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| CadenceError::init("control plane", format!("{}: {}", address, e)))?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "Control plane listening");
        Ok(Self {
            local_addr: Some(local_addr),
            listener: Mutex::new(Some(listener)),
            services: RwLock::new(HashMap::new()),
        })
    }

    /// Address the TCP endpoint is bound to, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Attach a service. Registering the same name twice is rejected.
    pub async fn register(&self, service: Arc<dyn ControlService>) -> Result<()> {
        let name = service.name();
        let mut services = self.services.write().await;
        if services.contains_key(name) {
            return Err(CadenceError::AlreadyExists(format!(
                "control service {}",
                name
            )));
        }
        services.insert(name, service);
        info!(service = name, "Control service registered");
        Ok(())
    }

    pub async fn service_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.services.read().await.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub async fn dispatch(&self, request: ControlRequest) -> Result<ControlResponse> {
        let service = self
            .services
            .read()
            .await
            .get(request.service())
            .cloned()
            .ok_or_else(|| {
                CadenceError::Unimplemented(format!("no {} service", request.service()))
            })?;
        debug!(service = service.name(), method = request.kind(), "Dispatching control request");
        service.handle(request).await
    }

    /// Accept connections until `token` is cancelled. Only the first call
    /// serves; later calls return at once.
    pub async fn serve(self: Arc<Self>, token: CancellationToken) {
        let Some(listener) = self.listener.lock().await.take() else {
            debug!("Control plane has no listener to serve");
            return;
        };

        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Control connection accepted");
                    let plane = Arc::clone(&self);
                    let token = token.clone();
                    tokio::spawn(async move {
                        if let Err(e) = plane.handle_connection(stream, token).await {
                            debug!(peer = %peer, error = %e, "Control connection closed");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Failed to accept control connection"),
            }
        }
        info!("Control plane stopped");
    }

    async fn handle_connection(&self, stream: TcpStream, token: CancellationToken) -> std::io::Result<()> {
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        loop {
            let line = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                return Ok(());
            };
            if line.trim().is_empty() {
                continue;
            }

            let reply = match serde_json::from_str::<ControlRequest>(&line) {
                Ok(request) => ControlReply::from(self.dispatch(request).await),
                Err(e) => ControlReply::error(&CadenceError::InvalidArgument(format!(
                    "malformed control request: {}",
                    e
                ))),
            };
            let mut out = serde_json::to_vec(&reply)?;
            out.push(b'\n');
            write.write_all(&out).await?;
        }
    }
}

impl Default for ControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}
