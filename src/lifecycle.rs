//! Probe registry and lifecycle control
//!
//! All registry state lives behind one mutex: the registered probes, the
//! cancellation handles of the running ones and the target environment new
//! probes are built against. A probe is running exactly when it has an
//! entry in `running`; that entry is created and removed inside the same
//! critical section that checks the registry.

use crate::config::ProbeDef;
use crate::host_filter::run_on_this_host;
use crate::jitter::ProbeStarter;
use crate::probes::{ProbeFactory, ProbeInfo, ProbeOptions, ProbeSnapshot};
use crate::targets::TargetsEnv;
use crate::{CadenceError, Result};
use async_trait::async_trait;
use cadence_common::MeasurementEvent;
use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Cancellation handle of a running probe.
struct RunningProbe {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl RunningProbe {
    fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

#[derive(Default)]
struct Registry {
    probes: BTreeMap<String, ProbeInfo>,
    running: HashMap<String, RunningProbe>,
    env: TargetsEnv,
}

/// Captured by [`ProbeController::bind`]: the parent token of every probe
/// run and the sender probes write to.
struct Runtime {
    token: CancellationToken,
    tx: mpsc::Sender<MeasurementEvent>,
}

pub struct ProbeController {
    hostname: String,
    factory: ProbeFactory,
    registry: Mutex<Registry>,
    runtime: OnceLock<Runtime>,
}

impl ProbeController {
    pub fn new(hostname: impl Into<String>, factory: ProbeFactory) -> Self {
        Self {
            hostname: hostname.into(),
            factory,
            registry: Mutex::new(Registry::default()),
            runtime: OnceLock::new(),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Replace the environment used to resolve targets of probes added from
    /// now on.
    pub async fn set_targets_env(&self, env: TargetsEnv) {
        self.registry.lock().await.env = env;
    }

    /// Bind the parent token and event sender. Probes can only be started
    /// afterwards; binding twice fails.
    pub fn bind(&self, token: CancellationToken, tx: mpsc::Sender<MeasurementEvent>) -> Result<()> {
        self.runtime
            .set(Runtime { token, tx })
            .map_err(|_| CadenceError::FailedPrecondition("prober already started".to_string()))
    }

    pub fn is_bound(&self) -> bool {
        self.runtime.get().is_some()
    }

    fn runtime(&self) -> Result<&Runtime> {
        self.runtime
            .get()
            .ok_or_else(|| CadenceError::FailedPrecondition("prober not started".to_string()))
    }

    /// Register a probe.
    ///
    /// A probe whose `run_on` does not match this host is skipped and the
    /// call succeeds.
    pub async fn add_probe(&self, def: ProbeDef) -> Result<()> {
        if !run_on_this_host(def.run_on.as_deref(), &self.hostname)? {
            info!(
                probe = %def.name,
                run_on = def.run_on.as_deref().unwrap_or_default(),
                "Probe not configured to run on this host, skipping"
            );
            return Ok(());
        }
        def.validate()?;

        let mut registry = self.registry.lock().await;
        if registry.probes.contains_key(&def.name) {
            return Err(CadenceError::AlreadyExists(format!("probe {}", def.name)));
        }

        let opts = ProbeOptions::build(&def, &registry.env)?;
        let probe = self.factory.create(&def, opts).map_err(|e| {
            CadenceError::Unknown(format!("error creating probe {}: {}", def.name, e))
        })?;

        info!(probe = %def.name, probe_type = %def.probe_type, "Probe added");
        registry.probes.insert(def.name, probe);
        Ok(())
    }

    /// Stop a probe if it is running and unregister it.
    pub async fn remove_probe(&self, name: &str) -> Result<()> {
        let mut registry = self.registry.lock().await;
        if registry.probes.remove(name).is_none() {
            return Err(CadenceError::NotFound(format!("probe {}", name)));
        }
        if let Some(running) = registry.running.remove(name) {
            running.token.cancel();
        }
        info!(probe = %name, "Probe removed");
        Ok(())
    }

    /// Start one probe. A probe that is already running is restarted.
    pub async fn start_probe(&self, name: &str) -> Result<()> {
        let runtime = self.runtime()?;
        let mut registry = self.registry.lock().await;
        if !registry.probes.contains_key(name) {
            return Err(CadenceError::NotFound(format!("probe {}", name)));
        }
        Self::spawn_locked(&mut registry, name, runtime);
        Ok(())
    }

    /// Start every registered probe that is not already running.
    pub async fn start_all_probes(&self) -> Result<()> {
        let runtime = self.runtime()?;
        let mut registry = self.registry.lock().await;
        let idle: Vec<String> = registry
            .probes
            .keys()
            .filter(|name| !registry.running.get(*name).is_some_and(RunningProbe::is_active))
            .cloned()
            .collect();
        for name in &idle {
            Self::spawn_locked(&mut registry, name, runtime);
        }
        Ok(())
    }

    fn spawn_locked(registry: &mut Registry, name: &str, runtime: &Runtime) {
        let Some(probe) = registry.probes.get(name) else {
            return;
        };
        let worker = probe.worker();

        if let Some(previous) = registry.running.remove(name) {
            previous.token.cancel();
            info!(probe = %name, "Restarting probe");
        }

        let token = runtime.token.child_token();
        let tx = runtime.tx.clone();
        let task = tokio::spawn({
            let token = token.clone();
            let name = name.to_string();
            async move {
                worker.start(token, tx).await;
                debug!(probe = %name, "Probe worker exited");
            }
        });

        info!(probe = %name, "Probe started");
        registry
            .running
            .insert(name.to_string(), RunningProbe { token, task });
    }

    /// Stop a probe. Stopping an unknown or idle probe only logs.
    pub async fn stop_probe(&self, name: &str) {
        let mut registry = self.registry.lock().await;
        if !registry.probes.contains_key(name) {
            error!(probe = %name, "Stop requested for a probe that does not exist");
            return;
        }
        match registry.running.remove(name) {
            Some(running) => {
                running.token.cancel();
                info!(probe = %name, "Probe stopped");
            }
            None => info!(probe = %name, "Probe was not running"),
        }
    }

    pub async fn stop_all_probes(&self) {
        let mut registry = self.registry.lock().await;
        let count = registry.running.len();
        for (_, running) in registry.running.drain() {
            running.token.cancel();
        }
        if count > 0 {
            info!(count, "Stopped all probes");
        }
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.registry.lock().await.probes.contains_key(name)
    }

    pub async fn is_running(&self, name: &str) -> bool {
        self.registry
            .lock()
            .await
            .running
            .get(name)
            .is_some_and(RunningProbe::is_active)
    }

    /// Owned copies of every registered probe, sorted by name.
    pub async fn probes(&self) -> Vec<ProbeSnapshot> {
        let registry = self.registry.lock().await;
        registry
            .probes
            .values()
            .map(|probe| {
                let running = registry
                    .running
                    .get(&probe.name)
                    .is_some_and(RunningProbe::is_active);
                probe.snapshot(running)
            })
            .collect()
    }

    /// Name and interval of every registered probe.
    pub async fn intervals(&self) -> Vec<(String, Duration)> {
        self.registry
            .lock()
            .await
            .probes
            .values()
            .map(|probe| (probe.name.clone(), probe.interval))
            .collect()
    }
}

impl std::fmt::Debug for ProbeController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeController")
            .field("hostname", &self.hostname)
            .field("bound", &self.is_bound())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ProbeStarter for ProbeController {
    async fn start_probe(&self, name: &str) -> Result<()> {
        ProbeController::start_probe(self, name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetsDef;
    use crate::error::Code;
    use crate::probes::{Probe, ProbeType};
    use cadence_common::MetricKind;
    use std::sync::Arc;

    /// Sends one event per start and then waits for cancellation.
    struct Beacon;

    #[async_trait]
    impl Probe for Beacon {
        async fn start(&self, token: CancellationToken, tx: mpsc::Sender<MeasurementEvent>) {
            let _ = tx.send(MeasurementEvent::new(MetricKind::Gauge)).await;
            token.cancelled().await;
        }
    }

    fn controller(names: &[&str]) -> ProbeController {
        let mut factory = ProbeFactory::new();
        for name in names {
            factory.register_user_defined(*name, Arc::new(Beacon));
        }
        ProbeController::new("prober-1.example.com", factory)
    }

    fn def(name: &str) -> ProbeDef {
        ProbeDef::new(name, ProbeType::UserDefined)
    }

    #[tokio::test]
    async fn test_add_visible_in_snapshot() {
        let c = controller(&["p1"]);
        c.add_probe(def("p1")).await.unwrap();

        let probes = c.probes().await;
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].name, "p1");
        assert!(!probes[0].running);
    }

    #[tokio::test]
    async fn test_run_on_other_host_is_noop() {
        let c = controller(&["p1"]);
        c.add_probe(def("p1").with_run_on("^db-")).await.unwrap();
        assert!(c.probes().await.is_empty());

        c.add_probe(def("p1").with_run_on("^prober-")).await.unwrap();
        assert!(c.contains("p1").await);
    }

    #[tokio::test]
    async fn test_invalid_run_on() {
        let c = controller(&["p1"]);
        let err = c.add_probe(def("p1").with_run_on("(")).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_duplicate_keeps_original() {
        let c = controller(&["p1"]);
        c.add_probe(def("p1")).await.unwrap();

        let mut other = def("p1");
        other.interval_msec = 30_000;
        let err = c.add_probe(other).await.unwrap_err();
        assert_eq!(err.code(), Code::AlreadyExists);
        assert_eq!(c.probes().await[0].interval_msec, 2_000);
    }

    #[tokio::test]
    async fn test_construction_failures() {
        let c = controller(&[]);
        let err = c.add_probe(def("nobody")).await.unwrap_err();
        assert_eq!(err.code(), Code::Unknown);

        let bad = ProbeDef::new("web", ProbeType::Tcp).with_targets(TargetsDef::shared("missing"));
        let err = c.add_probe(bad).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert!(c.probes().await.is_empty());
    }

    #[tokio::test]
    async fn test_remove() {
        let c = controller(&["p1"]);
        let err = c.remove_probe("p1").await.unwrap_err();
        assert_eq!(err.code(), Code::NotFound);

        c.add_probe(def("p1")).await.unwrap();
        c.remove_probe("p1").await.unwrap();
        assert!(!c.contains("p1").await);
    }

    #[tokio::test]
    async fn test_remove_running_cancels_it() {
        let c = controller(&["p1"]);
        c.add_probe(def("p1")).await.unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        c.bind(CancellationToken::new(), tx).unwrap();

        c.start_probe("p1").await.unwrap();
        rx.recv().await.unwrap();
        let token = c.registry.lock().await.running["p1"].token.clone();

        c.remove_probe("p1").await.unwrap();
        assert!(token.is_cancelled());
        assert!(c.registry.lock().await.running.is_empty());
        assert!(!c.contains("p1").await);
        assert!(!c.is_running("p1").await);
    }

    #[tokio::test]
    async fn test_start_requires_bind() {
        let c = controller(&["p1"]);
        c.add_probe(def("p1")).await.unwrap();
        let err = c.start_probe("p1").await.unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);

        let (tx, _rx) = mpsc::channel(8);
        c.bind(CancellationToken::new(), tx.clone()).unwrap();
        let err = c.bind(CancellationToken::new(), tx).unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let c = controller(&["p1"]);
        c.add_probe(def("p1")).await.unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        c.bind(CancellationToken::new(), tx).unwrap();

        let err = c.start_probe("ghost").await.unwrap_err();
        assert_eq!(err.code(), Code::NotFound);

        c.start_probe("p1").await.unwrap();
        rx.recv().await.unwrap();
        assert!(c.is_running("p1").await);

        c.stop_probe("p1").await;
        assert!(!c.is_running("p1").await);
        assert!(c.registry.lock().await.running.is_empty());

        // Unknown and idle stops only log.
        c.stop_probe("p1").await;
        c.stop_probe("ghost").await;
    }

    #[tokio::test]
    async fn test_restart_replaces_handle() {
        let c = controller(&["p1"]);
        c.add_probe(def("p1")).await.unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        c.bind(CancellationToken::new(), tx).unwrap();

        c.start_probe("p1").await.unwrap();
        rx.recv().await.unwrap();
        let first = c.registry.lock().await.running["p1"].token.clone();

        c.start_probe("p1").await.unwrap();
        rx.recv().await.unwrap();
        assert!(first.is_cancelled());
        assert_eq!(c.registry.lock().await.running.len(), 1);
        assert!(c.is_running("p1").await);
    }

    #[tokio::test]
    async fn test_stop_all_is_idempotent() {
        let c = controller(&["p1", "p2"]);
        c.add_probe(def("p1")).await.unwrap();
        c.add_probe(def("p2")).await.unwrap();
        let (tx, _rx) = mpsc::channel(8);
        c.bind(CancellationToken::new(), tx).unwrap();

        c.start_all_probes().await.unwrap();
        assert_eq!(c.registry.lock().await.running.len(), 2);

        c.stop_all_probes().await;
        c.stop_all_probes().await;
        assert!(c.registry.lock().await.running.is_empty());
    }

    #[tokio::test]
    async fn test_parent_cancel_reaches_probes() {
        let c = controller(&["p1"]);
        c.add_probe(def("p1")).await.unwrap();
        let (tx, _rx) = mpsc::channel(8);
        let root = CancellationToken::new();
        c.bind(root.clone(), tx).unwrap();

        c.start_probe("p1").await.unwrap();
        let child = c.registry.lock().await.running["p1"].token.clone();
        root.cancel();
        assert!(child.is_cancelled());
    }
}
