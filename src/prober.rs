//! The prober: builds every component from a [`ProberConfig`] and runs them.
//!
//! [`ProberBuilder::build`] does all fallible setup, in order:
//! 1. control plane (its TCP endpoint is bound here) and the prober's own
//!    control service
//! 2. discovery (RDS) server, attached to the control plane when there is one
//! 3. lame-duck lister (a missing lister only disables filtering)
//! 4. shared target sets
//! 5. probe registration
//! 6. servers and surfacers
//!
//! [`Prober::start`] then wires the event channel and launches everything.

use crate::config::{ProbeDef, ProberConfig};
use crate::control::{ControlPlane, ControlRequest, ControlResponse, ControlService, PROBER_SERVICE};
use crate::jitter::{interval_buckets, JitterScheduler};
use crate::lifecycle::ProbeController;
use crate::pipeline::{self, EventPipeline, PipelineStats};
use crate::probes::{Probe, ProbeFactory, ProbeSnapshot};
use crate::rds::RdsServer;
use crate::servers::{self, ServerInfo};
use crate::surfacers::{self, Surfacer, SurfacerInfo, SurfacerType};
use crate::sysvars::SysVars;
use crate::targets::lameduck::LameDuckService;
use crate::targets::{self, TargetsEnv};
use crate::{CadenceError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct ProberBuilder {
    config: ProberConfig,
    hostname: Option<String>,
    factory: ProbeFactory,
    surfacers: Vec<SurfacerInfo>,
    jitter_seed: Option<u64>,
}

impl ProberBuilder {
    pub fn new(config: ProberConfig) -> Self {
        Self {
            config,
            hostname: None,
            factory: ProbeFactory::new(),
            surfacers: Vec::new(),
            jitter_seed: None,
        }
    }

    /// Use `hostname` instead of the system hostname for `run_on` matching
    /// and sysvars.
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Implementation for the `user_defined` probe named `name`.
    pub fn user_defined_probe(mut self, name: impl Into<String>, probe: Arc<dyn Probe>) -> Self {
        self.factory.register_user_defined(name, probe);
        self
    }

    /// Add a surfacer after the configured ones. When any surfacer is added
    /// this way, an empty `surfacer` list no longer falls back to the
    /// default surfacers.
    pub fn surfacer(mut self, name: impl Into<String>, surfacer: Arc<dyn Surfacer>) -> Self {
        self.surfacers
            .push(SurfacerInfo::new(name, SurfacerType::UserDefined, surfacer));
        self
    }

    pub fn disable_jitter(mut self, disable: bool) -> Self {
        self.config.disable_jitter = disable;
        self
    }

    pub fn jitter_seed(mut self, seed: u64) -> Self {
        self.jitter_seed = Some(seed);
        self
    }

    pub async fn build(self) -> Result<Prober> {
        let config = self.config;
        let hostname = match self.hostname {
            Some(hostname) => hostname,
            None => local_hostname()?,
        };
        let text_config = config.to_text()?;
        let controller = Arc::new(ProbeController::new(hostname, self.factory));

        let control_plane = match &config.control_plane {
            Some(cp) => {
                let plane = Arc::new(ControlPlane::bind(&cp.address).await?);
                let service = ProberService::new(Arc::clone(&controller), text_config.clone());
                plane.register(Arc::new(service)).await?;
                Some(plane)
            }
            None => None,
        };

        let rds = match &config.rds_server {
            Some(rds_config) => {
                let server = Arc::new(RdsServer::new(rds_config)?);
                if let Some(plane) = &control_plane {
                    plane.register(server.clone()).await?;
                }
                Some(server)
            }
            None => None,
        };

        let lame_duck = match &config.global_targets_options.lame_duck_options {
            Some(opts) => match LameDuckService::init(opts)?.lister() {
                Ok(lister) => Some(lister),
                Err(e) => {
                    warn!(error = %e, "Lame-duck lister unavailable, lame-duck filtering disabled");
                    None
                }
            },
            None => None,
        };

        let mut env = TargetsEnv::new(lame_duck, rds.clone());
        for shared in &config.shared_targets {
            let resolved = targets::build(&shared.targets, &env)?;
            env.set_shared_targets(&shared.name, resolved)?;
        }
        controller.set_targets_env(env).await;

        for def in &config.probe {
            controller.add_probe(def.clone()).await?;
        }

        let servers = servers::init(&config.server).await?;

        let surfacers = if config.surfacer.is_empty() && !self.surfacers.is_empty() {
            self.surfacers
        } else {
            let mut all = surfacers::init(&config.surfacer).await?;
            all.extend(self.surfacers);
            all
        };

        info!(
            hostname = controller.hostname(),
            probes = controller.intervals().await.len(),
            surfacers = surfacers.len(),
            servers = servers.len(),
            "Prober initialized"
        );

        Ok(Prober {
            config,
            text_config,
            controller,
            control_plane,
            rds,
            servers,
            surfacers,
            pipeline_stats: Arc::new(PipelineStats::default()),
            jitter_seed: self.jitter_seed,
        })
    }
}

fn local_hostname() -> Result<String> {
    hostname::get()
        .map_err(|e| CadenceError::init("hostname", e))?
        .into_string()
        .map_err(|_| CadenceError::init("hostname", "hostname is not valid UTF-8"))
}

pub struct Prober {
    config: ProberConfig,
    text_config: String,
    controller: Arc<ProbeController>,
    control_plane: Option<Arc<ControlPlane>>,
    rds: Option<Arc<RdsServer>>,
    servers: Vec<ServerInfo>,
    surfacers: Vec<SurfacerInfo>,
    pipeline_stats: Arc<PipelineStats>,
    jitter_seed: Option<u64>,
}

impl Prober {
    pub fn builder(config: ProberConfig) -> ProberBuilder {
        ProberBuilder::new(config)
    }

    /// Launch the pipeline, sysvars, control plane, servers and probes.
    /// Everything runs until `token` is cancelled; the pipeline itself runs
    /// for the life of the process. Starting twice fails.
    pub async fn start(&self, token: CancellationToken) -> Result<()> {
        let (tx, rx) = pipeline::channel();
        self.controller.bind(token.clone(), tx.clone())?;

        let pipeline = EventPipeline::with_stats(self.surfacers.clone(), Arc::clone(&self.pipeline_stats));
        tokio::spawn(pipeline.run(rx));

        let sysvars = SysVars::init(self.controller.hostname(), &self.config.sysvars_env_vars());
        tokio::spawn(sysvars.run(self.config.sysvars_interval(), token.clone(), tx.clone()));

        if let Some(plane) = &self.control_plane {
            tokio::spawn(Arc::clone(plane).serve(token.clone()));
        }

        for info in &self.servers {
            let server = Arc::clone(&info.server);
            let token = token.clone();
            let tx = tx.clone();
            tokio::spawn(async move { server.start(token, tx).await });
        }

        if self.config.disable_jitter {
            info!("Starting all probes without jitter");
            self.controller.start_all_probes().await?;
        } else {
            let buckets = interval_buckets(self.controller.intervals().await);
            let scheduler = self
                .jitter_seed
                .map_or_else(JitterScheduler::new, JitterScheduler::with_seed);
            info!(buckets = buckets.len(), "Starting probes with jitter");
            scheduler.schedule(buckets, self.controller.clone(), token);
        }
        Ok(())
    }

    pub async fn add_probe(&self, def: ProbeDef) -> Result<()> {
        self.controller.add_probe(def).await
    }

    pub async fn remove_probe(&self, name: &str) -> Result<()> {
        self.controller.remove_probe(name).await
    }

    pub async fn start_probe(&self, name: &str) -> Result<()> {
        self.controller.start_probe(name).await
    }

    pub async fn start_all_probes(&self) -> Result<()> {
        self.controller.start_all_probes().await
    }

    pub async fn stop_probe(&self, name: &str) {
        self.controller.stop_probe(name).await
    }

    pub async fn stop_all_probes(&self) {
        self.controller.stop_all_probes().await
    }

    pub async fn is_running(&self, name: &str) -> bool {
        self.controller.is_running(name).await
    }

    pub async fn probes(&self) -> Vec<ProbeSnapshot> {
        self.controller.probes().await
    }

    /// The configuration this prober was built from, rendered as YAML.
    pub fn text_config(&self) -> &str {
        &self.text_config
    }

    pub fn hostname(&self) -> &str {
        self.controller.hostname()
    }

    pub fn control_plane(&self) -> Option<&Arc<ControlPlane>> {
        self.control_plane.as_ref()
    }

    pub fn rds(&self) -> Option<&Arc<RdsServer>> {
        self.rds.as_ref()
    }

    pub fn surfacers(&self) -> &[SurfacerInfo] {
        &self.surfacers
    }

    pub fn pipeline_stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.pipeline_stats)
    }
}

impl std::fmt::Debug for Prober {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prober")
            .field("controller", &self.controller)
            .field("surfacers", &self.surfacers)
            .field("servers", &self.servers)
            .finish_non_exhaustive()
    }
}

/// Serves prober requests arriving through the control plane.
pub struct ProberService {
    controller: Arc<ProbeController>,
    text_config: String,
}

impl ProberService {
    pub fn new(controller: Arc<ProbeController>, text_config: String) -> Self {
        Self {
            controller,
            text_config,
        }
    }
}

#[async_trait]
impl ControlService for ProberService {
    fn name(&self) -> &'static str {
        PROBER_SERVICE
    }

    async fn handle(&self, request: ControlRequest) -> Result<ControlResponse> {
        match request {
            ControlRequest::AddProbe { probe } => {
                let name = probe.name.clone();
                self.controller.add_probe(probe).await?;
                // Probes added at runtime start right away once the prober runs.
                if self.controller.is_bound() && self.controller.contains(&name).await {
                    self.controller.start_probe(&name).await?;
                }
                Ok(ControlResponse::Ok)
            }
            ControlRequest::RemoveProbe { name } => {
                self.controller.remove_probe(&name).await?;
                Ok(ControlResponse::Ok)
            }
            ControlRequest::StartProbe { name } => {
                self.controller.start_probe(&name).await?;
                Ok(ControlResponse::Ok)
            }
            ControlRequest::StopProbe { name } => {
                if !self.controller.contains(&name).await {
                    return Err(CadenceError::NotFound(format!("probe {}", name)));
                }
                self.controller.stop_probe(&name).await;
                Ok(ControlResponse::Ok)
            }
            ControlRequest::ListProbes => Ok(ControlResponse::Probes(self.controller.probes().await)),
            ControlRequest::GetConfig => Ok(ControlResponse::Config(self.text_config.clone())),
            other => Err(CadenceError::Unimplemented(format!(
                "{} does not serve {}",
                PROBER_SERVICE,
                other.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControlPlaneConfig;
    use crate::error::Code;
    use crate::probes::ProbeType;
    use cadence_common::MeasurementEvent;
    use tokio::sync::mpsc;

    struct Idle;

    #[async_trait]
    impl Probe for Idle {
        async fn start(&self, token: CancellationToken, _tx: mpsc::Sender<MeasurementEvent>) {
            token.cancelled().await;
        }
    }

    struct Discard;

    impl Surfacer for Discard {
        fn write(&self, _event: Arc<MeasurementEvent>) {}
    }

    async fn prober(config: ProberConfig) -> Prober {
        ProberBuilder::new(config)
            .hostname("prober-1")
            .user_defined_probe("p1", Arc::new(Idle))
            .user_defined_probe("p2", Arc::new(Idle))
            .surfacer("discard", Arc::new(Discard))
            .build()
            .await
            .unwrap()
    }

    fn with_control_plane() -> ProberConfig {
        ProberConfig {
            control_plane: Some(ControlPlaneConfig {
                address: "127.0.0.1:0".into(),
            }),
            disable_jitter: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_programmatic_surfacer_replaces_defaults() {
        let prober = prober(ProberConfig::default()).await;
        assert_eq!(prober.surfacers().len(), 1);
        assert_eq!(prober.surfacers()[0].name, "discard");
    }

    #[tokio::test]
    async fn test_control_service_lifecycle() {
        let prober = prober(with_control_plane()).await;
        let plane = Arc::clone(prober.control_plane().unwrap());
        prober.start(CancellationToken::new()).await.unwrap();

        let add = ControlRequest::AddProbe {
            probe: ProbeDef::new("p1", ProbeType::UserDefined),
        };
        assert_eq!(plane.dispatch(add).await.unwrap(), ControlResponse::Ok);
        assert!(prober.is_running("p1").await);

        match plane.dispatch(ControlRequest::ListProbes).await.unwrap() {
            ControlResponse::Probes(probes) => {
                assert_eq!(probes.len(), 1);
                assert!(probes[0].running);
            }
            other => panic!("unexpected response: {:?}", other),
        }

        let stop = |name: &str| ControlRequest::StopProbe { name: name.into() };
        assert_eq!(plane.dispatch(stop("p1")).await.unwrap(), ControlResponse::Ok);
        assert!(!prober.is_running("p1").await);
        let err = plane.dispatch(stop("ghost")).await.unwrap_err();
        assert_eq!(err.code(), Code::NotFound);

        let remove = ControlRequest::RemoveProbe { name: "p1".into() };
        plane.dispatch(remove.clone()).await.unwrap();
        assert_eq!(plane.dispatch(remove).await.unwrap_err().code(), Code::NotFound);
    }

    #[tokio::test]
    async fn test_get_config_and_unrouted_requests() {
        let prober = prober(with_control_plane()).await;
        let plane = prober.control_plane().unwrap();

        match plane.dispatch(ControlRequest::GetConfig).await.unwrap() {
            ControlResponse::Config(text) => {
                assert_eq!(text, prober.text_config());
                assert!(text.contains("disable_jitter: true"));
            }
            other => panic!("unexpected response: {:?}", other),
        }

        let err = plane
            .dispatch(ControlRequest::ListResources {
                provider: "static".into(),
                name_filter: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let prober = prober(ProberConfig::default()).await;
        prober.start(CancellationToken::new()).await.unwrap();
        let err = prober.start(CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
    }
}
