use crate::cli::Commands;
use crate::config::ProberConfig;
use crate::host_filter::run_on_this_host;
use crate::prober::ProberBuilder;
use anyhow::Context;
use serde_json::json;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run {
            config,
            disable_jitter,
        } => handle_run(&config, disable_jitter).await,
        Commands::Check { config, hostname } => handle_check(&config, hostname),
        Commands::DumpConfig { config } => handle_dump_config(&config),
    }
}

fn load(path: &Path) -> anyhow::Result<ProberConfig> {
    ProberConfig::load(path).with_context(|| format!("loading {}", path.display()))
}

async fn handle_run(path: &Path, disable_jitter: bool) -> anyhow::Result<()> {
    let config = load(path)?;
    let disable_jitter = disable_jitter || config.disable_jitter;

    let prober = ProberBuilder::new(config)
        .disable_jitter(disable_jitter)
        .build()
        .await
        .context("initializing prober")?;

    let token = CancellationToken::new();
    prober.start(token.clone()).await.context("starting prober")?;
    info!(probes = prober.probes().await.len(), "Prober running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    info!("Shutting down");
    prober.stop_all_probes().await;
    token.cancel();
    Ok(())
}

fn handle_check(path: &Path, hostname: Option<String>) -> anyhow::Result<()> {
    let config = load(path)?;
    let hostname = match hostname {
        Some(hostname) => hostname,
        None => hostname::get()
            .context("reading hostname")?
            .to_string_lossy()
            .into_owned(),
    };

    let mut probes = Vec::with_capacity(config.probe.len());
    for probe in &config.probe {
        let runs_here = run_on_this_host(probe.run_on.as_deref(), &hostname)
            .with_context(|| format!("probe {}", probe.name))?;
        probes.push(json!({
            "name": probe.name,
            "type": probe.probe_type.as_str(),
            "interval_msec": probe.interval_msec,
            "runs_here": runs_here,
        }));
    }

    let report = json!({ "hostname": hostname, "probes": probes });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn handle_dump_config(path: &Path) -> anyhow::Result<()> {
    let config = load(path)?;
    print!("{}", config.to_text()?);
    Ok(())
}
