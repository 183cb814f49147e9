//! Basalt node agent - per-node daemon of the Basalt database-cluster
//! platform.
//!
//! Three cooperating subsystems, none of which blocks another:
//! - the node probe keeps this node's health conditions current in the
//!   cluster state store,
//! - the version reconciler keeps the "which engine builds exist on this
//!   host" record current and coordinates fleet-wide re-checks,
//! - the trigger router lets the HTTP front-end (and peer agents) kick off
//!   a re-check.

mod api;
mod config;
mod policy;
mod probe;
mod ssh;
mod store;
mod util;
mod version;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Settings;
use crate::policy::ConfigPolicyCache;
use crate::probe::{HybridDeployGate, NodeProbe};
use crate::store::memory::MemoryStore;
use crate::store::StateStore;
use crate::version::images::{DockerCliInspector, ImageInspector};
use crate::version::CoreVersionReconciler;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env();
    info!(
        "basalt-node-agent starting on node {} (port {})",
        settings.node_name, settings.agent_port
    );
    info!("agent settings: {settings:?}");

    // The production cluster state store client is wired in by the
    // platform launcher; standalone runs use the in-memory store.
    if !settings.develop_mode {
        anyhow::bail!(
            "no cluster state store configured; set BASALT_DEVELOP_MODE=1 \
             to run against the in-memory store"
        );
    }
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::with_node(&settings.node_name));
    run_agent(settings, store, Arc::new(DockerCliInspector)).await
}

async fn run_agent(
    settings: Settings,
    store: Arc<dyn StateStore>,
    inspector: Arc<dyn ImageInspector>,
) -> Result<()> {
    let policy = Arc::new(ConfigPolicyCache::new(store.clone()));
    let gate = Arc::new(HybridDeployGate::new());

    info!("start node network probe");
    let probe = NodeProbe::new(store.clone(), policy, gate, settings.node_name.clone());
    tokio::spawn(probe.run(settings.probe_period));

    info!("start core version reconciler");
    let (reconciler, version_checks) =
        CoreVersionReconciler::new(store, inspector, &settings)
            .context("build version reconciler")?;
    tokio::spawn(reconciler.run());

    let app = api::build_router(api::ApiState { version_checks });
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.agent_port));
    info!("trigger endpoints listening on http://{addr}");
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    axum::serve(listener, app).await.context("serve trigger endpoints")?;
    Ok(())
}
