//! Engine-version availability reconciliation.
//!
//! Each node independently determines which engine versions (sets of
//! required container images) are fully present locally and publishes the
//! result as a per-host record. A bounded request queue drives re-checks:
//! externally-triggered requests additionally fan a re-check notification
//! out to every peer agent, peer-triggered requests stay local. The queue's
//! capacity doubles as backpressure - a burst of triggers blocks producers
//! until the consumer catches up, so fan-out storms cannot build.

pub mod images;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::store::{KvRecord, LabelSelector, StateStore, SYSTEM_NAMESPACE};
use images::{ImageExistenceCache, ImageInspector};

/// Per-host availability record name prefix; the lowercased hostname is
/// appended.
pub const AVAILABILITY_RECORD_PREFIX: &str = "version-availability-";

/// Data key in version descriptors marking the human-readable version name.
const VERSION_NAME_KEY: &str = "name";

/// Data keys containing this marker (not at the start) are image references.
const IMAGE_KEY_MARKER: &str = "Image";

/// Fixed timestamp format of the `checkTime` data key.
const CHECK_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Peer endpoint receiving re-check notifications.
pub const PEER_NOTIFY_PATH: &str = "/internal/version-check";

const REQUEST_QUEUE_CAPACITY: usize = 2;
const PEER_NOTIFY_TIMEOUT: Duration = Duration::from_secs(3);

/// One queued re-check request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckRequest {
    /// Externally triggered: check locally, then tell every peer to
    /// re-check too.
    Broadcast,
    /// Triggered by a peer's notification: check locally only.
    LocalOnly,
}

/// Body of the peer re-check notification.
#[derive(Debug, Serialize, Deserialize)]
pub struct PeerNotification {
    #[serde(rename = "HostName")]
    pub host_name: String,
}

/// Enqueue side of the request queue, handed to the HTTP collaborator.
/// Sends block while the queue is full; the endpoints acknowledge as soon
/// as the request is enqueued, regardless of the check's later outcome.
#[derive(Clone)]
pub struct VersionCheckHandle {
    tx: mpsc::Sender<CheckRequest>,
}

impl VersionCheckHandle {
    pub async fn request_broadcast(&self) {
        if self.tx.send(CheckRequest::Broadcast).await.is_err() {
            warn!("version reconciler is gone, dropping broadcast check request");
        }
    }

    pub async fn request_local(&self) {
        if self.tx.send(CheckRequest::LocalOnly).await.is_err() {
            warn!("version reconciler is gone, dropping local check request");
        }
    }
}

/// Consumer side: owns the image cache and serializes reconciliation
/// passes, so the per-pass cache is never shared between two passes.
pub struct CoreVersionReconciler {
    store: Arc<dyn StateStore>,
    inspector: Arc<dyn ImageInspector>,
    http: reqwest::Client,
    rx: mpsc::Receiver<CheckRequest>,
    cache: ImageExistenceCache,
    version_selector: LabelSelector,
    instance_selector: LabelSelector,
    hostname: String,
    agent_port: u16,
    peer_scheme: String,
}

impl CoreVersionReconciler {
    pub fn new(
        store: Arc<dyn StateStore>,
        inspector: Arc<dyn ImageInspector>,
        settings: &Settings,
    ) -> Result<(Self, VersionCheckHandle)> {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        // Peer certificate acceptance is a deliberate trust decision for
        // the cluster-internal network; stricter deployments flip
        // `peer_verify_certs` on.
        let http = reqwest::Client::builder()
            .timeout(PEER_NOTIFY_TIMEOUT)
            .danger_accept_invalid_certs(!settings.peer_verify_certs)
            .build()
            .context("build peer notification client")?;
        let reconciler = Self {
            store,
            inspector,
            http,
            rx,
            cache: ImageExistenceCache::new(),
            version_selector: settings.version_selector.clone(),
            instance_selector: settings.agent_instance_selector.clone(),
            hostname: settings.node_name.to_lowercase(),
            agent_port: settings.agent_port,
            peer_scheme: settings.peer_scheme.clone(),
        };
        Ok((reconciler, VersionCheckHandle { tx }))
    }

    /// Consumer loop. Runs one unconditional local check at startup, then
    /// serves the queue until every handle is dropped. Checks run
    /// serially: the next request is only taken once the previous pass
    /// completed, keeping the image cache scoped to exactly one pass.
    pub async fn run(mut self) {
        info!(
            "version reconciler started (descriptor selector [{}], peer selector [{}])",
            self.version_selector, self.instance_selector
        );
        loop {
            if let Err(err) = self.check_local().await {
                error!("local version check failed: {err:#}");
            }
            let Some(request) = self.rx.recv().await else {
                debug!("version check queue closed, stopping reconciler");
                return;
            };
            info!("version check requested on {} ({request:?})", self.hostname);
            if request == CheckRequest::Broadcast {
                if let Err(err) = self.notify_peers().await {
                    error!("failed to notify peer agents: {err:#}");
                }
            }
        }
    }

    /// One reconciliation pass: inspect local images against every version
    /// descriptor and upsert this host's availability record.
    async fn check_local(&mut self) -> Result<()> {
        self.cache.clear();
        let descriptors = self
            .store
            .list_records(SYSTEM_NAMESPACE, &self.version_selector)
            .await
            .context("list version descriptors")?;
        info!("checking {} version descriptors", descriptors.len());

        let mut available: Vec<String> = Vec::new();
        for descriptor in &descriptors {
            let image_refs = descriptor_images(descriptor);
            if image_refs.is_empty() {
                warn!(
                    "record {} carries no image references, not a version descriptor",
                    descriptor.name
                );
                continue;
            }
            let Some(version) = descriptor_version_name(descriptor) else {
                warn!("record {} carries no version name, skipping", descriptor.name);
                continue;
            };

            let mut complete = true;
            for image in &image_refs {
                if !self.cache.exists(self.inspector.as_ref(), image).await {
                    info!("image {image} missing on this host, version {version} unavailable");
                    complete = false;
                    break;
                }
            }
            if complete {
                info!("version {version} is available on this host");
                available.push(version);
            }
        }
        // Cache lifetime is strictly one pass; drop answers on the way out
        // as well as on the way in.
        self.cache.clear();

        let joined = available.join(",");
        self.publish_availability(&joined)
            .await
            .context("publish availability record")?;
        info!("host {} provides versions [{joined}]", self.hostname);
        Ok(())
    }

    async fn publish_availability(&self, versions: &str) -> Result<()> {
        let name = format!("{AVAILABILITY_RECORD_PREFIX}{}", self.hostname);
        let mut record = match self.store.get_record(SYSTEM_NAMESPACE, &name).await? {
            Some(existing) => existing,
            None => {
                let fresh = KvRecord::new(name.clone(), SYSTEM_NAMESPACE);
                self.store
                    .create_record(fresh.clone())
                    .await
                    .with_context(|| format!("create record {name}"))?;
                fresh
            }
        };
        record
            .data
            .insert("existingVersions".to_string(), versions.to_string());
        record.data.insert(
            "checkTime".to_string(),
            Utc::now().format(CHECK_TIME_FORMAT).to_string(),
        );
        self.store
            .update_record(record)
            .await
            .with_context(|| format!("update record {name}"))
    }

    /// Best-effort fan-out: every peer agent instance (excluding the local
    /// node, case-insensitive) gets a re-check notification. Per-peer
    /// failures are logged and skipped; nothing is retried or surfaced to
    /// the original trigger.
    async fn notify_peers(&self) -> Result<()> {
        let instances = self
            .store
            .list_agent_instances(&self.instance_selector)
            .await
            .context("list agent instances")?;
        for instance in instances {
            if instance.node_name.to_lowercase() == self.hostname {
                debug!("skipping local agent instance on {}", instance.node_name);
                continue;
            }
            let url = format!(
                "{}://{}:{}{PEER_NOTIFY_PATH}",
                self.peer_scheme, instance.address, self.agent_port
            );
            let body = PeerNotification {
                host_name: self.hostname.clone(),
            };
            match self.http.post(&url).json(&body).send().await {
                Ok(response) => {
                    info!(
                        "notified peer agent on {} ({}), status {}",
                        instance.node_name,
                        instance.address,
                        response.status()
                    );
                }
                Err(err) => {
                    error!(
                        "failed to notify peer agent on {} ({}): {err}",
                        instance.node_name, instance.address
                    );
                }
            }
        }
        Ok(())
    }
}

/// Image references declared by a version descriptor: data values whose
/// key carries the image marker past its first character.
fn descriptor_images(record: &KvRecord) -> Vec<String> {
    let mut images: Vec<(String, String)> = record
        .data
        .iter()
        .filter(|(key, value)| {
            !value.is_empty() && key.find(IMAGE_KEY_MARKER).is_some_and(|pos| pos > 0)
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    images.sort();
    images.into_iter().map(|(_, value)| value).collect()
}

fn descriptor_version_name(record: &KvRecord) -> Option<String> {
    record
        .data
        .get(VERSION_NAME_KEY)
        .filter(|name| !name.is_empty())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::images::test_support::FixedInspector;
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::AgentInstance;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_settings(node_name: &str, agent_port: u16) -> Settings {
        Settings {
            node_name: node_name.to_string(),
            agent_port,
            probe_period: Duration::from_secs(3),
            agent_instance_selector: LabelSelector::parse("app=basalt-node-agent"),
            version_selector: LabelSelector::parse("record-type=engine-version"),
            peer_scheme: "http".to_string(),
            peer_verify_certs: false,
            develop_mode: true,
            cluster_log_dir: "/tmp".to_string(),
            log_retention_days: 3,
        }
    }

    fn descriptor(name: &str, version: &str, images: &[(&str, &str)]) -> KvRecord {
        let mut record = KvRecord::new(name, SYSTEM_NAMESPACE)
            .label("record-type", "engine-version")
            .entry("name", version);
        for (key, image) in images {
            record = record.entry(*key, *image);
        }
        record
    }

    #[test]
    fn image_keys_need_the_marker_past_the_start() {
        let record = descriptor(
            "v1",
            "1.0.1",
            &[("engineImage", "reg/engine:1"), ("managerImage", "reg/mgr:1")],
        )
        .entry("ImageNotes", "not an image ref")
        .entry("emptyImage", "");
        let images = descriptor_images(&record);
        assert_eq!(images, vec!["reg/engine:1".to_string(), "reg/mgr:1".to_string()]);
    }

    #[tokio::test]
    async fn aggregation_includes_only_fully_present_versions() {
        let store = Arc::new(MemoryStore::new());
        store
            .put_record(descriptor(
                "v1",
                "v1",
                &[("engineImage", "imgA"), ("managerImage", "imgB")],
            ))
            .await;
        store
            .put_record(descriptor("v2", "v2", &[("engineImage", "imgC")]))
            .await;

        let inspector = Arc::new(FixedInspector::with_images(&["imgA", "imgB"]));
        let settings = test_settings("DB-Node-1", 8700);
        let (mut reconciler, _handle) =
            CoreVersionReconciler::new(store.clone(), inspector, &settings).unwrap();
        reconciler.check_local().await.unwrap();

        let record = store
            .get_record(SYSTEM_NAMESPACE, "version-availability-db-node-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.data.get("existingVersions").unwrap(), "v1");
        assert!(record.data.contains_key("checkTime"));
    }

    #[tokio::test]
    async fn descriptors_without_images_or_name_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        store
            .put_record(
                KvRecord::new("not-a-descriptor", SYSTEM_NAMESPACE)
                    .label("record-type", "engine-version")
                    .entry("name", "ghost"),
            )
            .await;
        store
            .put_record(
                KvRecord::new("nameless", SYSTEM_NAMESPACE)
                    .label("record-type", "engine-version")
                    .entry("engineImage", "imgA"),
            )
            .await;

        let inspector = Arc::new(FixedInspector::with_images(&["imgA"]));
        let settings = test_settings("db-node-1", 8700);
        let (mut reconciler, _handle) =
            CoreVersionReconciler::new(store.clone(), inspector, &settings).unwrap();
        reconciler.check_local().await.unwrap();

        let record = store
            .get_record(SYSTEM_NAMESPACE, "version-availability-db-node-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.data.get("existingVersions").unwrap(), "");
    }

    #[tokio::test]
    async fn each_pass_checks_shared_images_once() {
        let store = Arc::new(MemoryStore::new());
        store
            .put_record(descriptor(
                "v1",
                "v1",
                &[("engineImage", "shared"), ("managerImage", "imgB")],
            ))
            .await;
        store
            .put_record(descriptor("v2", "v2", &[("engineImage", "shared")]))
            .await;

        let inspector = Arc::new(FixedInspector::with_images(&["shared", "imgB"]));
        let settings = test_settings("db-node-1", 8700);
        let (mut reconciler, _handle) =
            CoreVersionReconciler::new(store, inspector.clone(), &settings).unwrap();
        reconciler.check_local().await.unwrap();
        assert_eq!(inspector.query_count("shared"), 1);

        // A new pass starts from a cleared cache.
        reconciler.check_local().await.unwrap();
        assert_eq!(inspector.query_count("shared"), 2);
    }

    #[tokio::test]
    async fn broadcast_completes_despite_unreachable_peer() {
        // Reachable peer: a real listener counting notifications.
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_for_router = hits.clone();
        let router = Router::new().route(
            PEER_NOTIFY_PATH,
            post(move |Json(body): Json<PeerNotification>| {
                let hits = hits_for_router.clone();
                async move {
                    assert_eq!(body.host_name, "db-node-1");
                    hits.fetch_add(1, Ordering::SeqCst);
                    "OK"
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let agent_port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let store = Arc::new(MemoryStore::new());
        store
            .put_record(descriptor("v1", "v1", &[("engineImage", "imgA")]))
            .await;
        // Local instance must be excluded case-insensitively; 127.0.0.2
        // has nothing listening and must not prevent the rest.
        store
            .put_agent_instance(AgentInstance {
                node_name: "DB-NODE-1".to_string(),
                address: "127.0.0.1".to_string(),
            })
            .await;
        store
            .put_agent_instance(AgentInstance {
                node_name: "db-node-2".to_string(),
                address: "127.0.0.2".to_string(),
            })
            .await;
        store
            .put_agent_instance(AgentInstance {
                node_name: "db-node-3".to_string(),
                address: "127.0.0.1".to_string(),
            })
            .await;

        let inspector = Arc::new(FixedInspector::with_images(&["imgA"]));
        let settings = test_settings("db-node-1", agent_port);
        let (reconciler, handle) =
            CoreVersionReconciler::new(store.clone(), inspector, &settings).unwrap();
        let worker = tokio::spawn(reconciler.run());

        handle.request_broadcast().await;
        drop(handle);
        tokio::time::timeout(Duration::from_secs(10), worker)
            .await
            .expect("reconciler should stop once all handles are dropped")
            .unwrap();

        // The dead peer neither blocked the fan-out nor the local check.
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let record = store
            .get_record(SYSTEM_NAMESPACE, "version-availability-db-node-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.data.get("existingVersions").unwrap(), "v1");
    }
}
