//! Agent settings, environment-variable driven.
//!
//! Loaded once in `main` (after `dotenvy`); every component receives what
//! it needs by value or reference. Flag parsing and the richer deployment
//! bootstrap live with the platform's launcher, not here.

use std::env;
use std::time::Duration;

use tracing::warn;

use crate::store::LabelSelector;

/// Default probe tick period.
pub const DEFAULT_PROBE_PERIOD: Duration = Duration::from_secs(3);

const DEFAULT_AGENT_PORT: u16 = 8700;
const DEFAULT_AGENT_POD_LABELS: &str = "app=basalt-node-agent";
const DEFAULT_VERSION_LABELS: &str = "record-type=engine-version";
const DEFAULT_CLUSTER_LOG_DIR: &str = "/flash/basalt_dbcluster/";
const DEFAULT_LOG_RETENTION_DAYS: u32 = 3;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Identity of the node this agent runs on.
    pub node_name: String,
    /// Port every agent's trigger endpoints listen on (the peer wire).
    pub agent_port: u16,
    pub probe_period: Duration,
    /// Selects the agent instances to notify on a broadcast check.
    pub agent_instance_selector: LabelSelector,
    /// Selects the engine version descriptor records.
    pub version_selector: LabelSelector,
    /// Scheme for peer notifications; https on real clusters.
    pub peer_scheme: String,
    /// Verify peer TLS certificates. Off by default: agents talk over the
    /// cluster-internal network with self-signed certs.
    pub peer_verify_certs: bool,
    /// Run against the in-memory state store instead of a real cluster.
    pub develop_mode: bool,
    /// Consumed by the log housekeeping collaborator.
    pub cluster_log_dir: String,
    /// Consumed by the log housekeeping collaborator.
    pub log_retention_days: u32,
}

impl Settings {
    pub fn from_env() -> Self {
        let node_name = env::var("BASALT_NODE_NAME")
            .ok()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().to_string());

        Self {
            node_name,
            agent_port: env_parsed("BASALT_AGENT_PORT", DEFAULT_AGENT_PORT),
            probe_period: probe_period_from_env(env::var("BASALT_PROBE_PERIOD").ok().as_deref()),
            agent_instance_selector: LabelSelector::parse(&env_string(
                "BASALT_AGENT_POD_LABELS",
                DEFAULT_AGENT_POD_LABELS,
            )),
            version_selector: LabelSelector::parse(&env_string(
                "BASALT_VERSION_LABELS",
                DEFAULT_VERSION_LABELS,
            )),
            peer_scheme: env_string("BASALT_PEER_SCHEME", "https"),
            peer_verify_certs: env_flag("BASALT_PEER_VERIFY_CERTS", false),
            develop_mode: env_flag("BASALT_DEVELOP_MODE", false),
            cluster_log_dir: env_string("BASALT_CLUSTER_LOG_DIR", DEFAULT_CLUSTER_LOG_DIR),
            log_retention_days: env_parsed("BASALT_LOG_RETENTION_DAYS", DEFAULT_LOG_RETENTION_DAYS),
        }
    }
}

/// The probe period override counts only when it parses as a strictly
/// positive integer; anything else keeps the default.
pub(crate) fn probe_period_from_env(raw: Option<&str>) -> Duration {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(text) => match text.parse::<u64>() {
            Ok(secs) if secs > 0 => Duration::from_secs(secs),
            _ => {
                warn!("ignoring probe period override {text:?}, keeping default");
                DEFAULT_PROBE_PERIOD
            }
        },
        None => DEFAULT_PROBE_PERIOD,
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(value.trim(), "1" | "true" | "TRUE" | "yes" | "YES"),
        Err(_) => default,
    }
}

fn env_parsed<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}
