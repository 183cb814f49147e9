//! TTL-gated read-through cache over the cluster controller configuration.
//!
//! The first access always loads from the store; later accesses reload only
//! once the refresh interval has elapsed. A zero interval means "load once,
//! never refresh". A failed reload leaves the cached state untouched and
//! surfaces the error to the caller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::store::{StateStore, CONTROLLER_CONFIG_RECORD, SYSTEM_NAMESPACE};

/// Default refresh interval for the controller configuration.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Parsed controller configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub ssh_user: String,
    pub enable_port_report: bool,
}

struct CacheState {
    initialized: bool,
    last_query: Option<Instant>,
    value: Option<ControllerConfig>,
}

/// Read-through cache handle. Constructed once at process start and passed
/// to the components that need controller configuration.
pub struct ConfigPolicyCache {
    store: Arc<dyn StateStore>,
    // Fixed at construction; changing it at runtime would corrupt the
    // reload bookkeeping.
    max_refresh_interval: Duration,
    state: Mutex<CacheState>,
}

impl ConfigPolicyCache {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self::with_interval(store, DEFAULT_REFRESH_INTERVAL)
    }

    /// `Duration::ZERO` means the configuration is loaded exactly once.
    pub fn with_interval(store: Arc<dyn StateStore>, max_refresh_interval: Duration) -> Self {
        Self {
            store,
            max_refresh_interval,
            state: Mutex::new(CacheState {
                initialized: false,
                last_query: None,
                value: None,
            }),
        }
    }

    /// Returns the controller configuration, reloading it from the store
    /// when the cache is cold or the refresh interval has elapsed.
    pub async fn get(&self) -> Result<ControllerConfig> {
        if let Some(cached) = self.cached_if_fresh() {
            return Ok(cached);
        }

        info!("reloading record {CONTROLLER_CONFIG_RECORD}");
        let record = self
            .store
            .get_record(SYSTEM_NAMESPACE, CONTROLLER_CONFIG_RECORD)
            .await
            .with_context(|| format!("fetch record {CONTROLLER_CONFIG_RECORD}"))?
            .with_context(|| format!("record {CONTROLLER_CONFIG_RECORD} not found"))?;

        let ssh_user = required_entry(&record.data, "sshUser")?;
        let enable_port_report = parse_bool_with_default(&record.data, "enablePortReport", true);
        let config = ControllerConfig {
            ssh_user,
            enable_port_report,
        };

        let mut state = self.state.lock();
        state.value = Some(config.clone());
        state.initialized = true;
        state.last_query = Some(Instant::now());
        Ok(config)
    }

    fn cached_if_fresh(&self) -> Option<ControllerConfig> {
        let state = self.state.lock();
        if !state.initialized || state.last_query.is_none() {
            return None;
        }
        let value = state.value.clone()?;
        // Zero interval: load once, never refresh.
        if self.max_refresh_interval.is_zero() {
            return Some(value);
        }
        let elapsed = state.last_query.map(|at| at.elapsed())?;
        if elapsed >= self.max_refresh_interval {
            debug!(
                "cached {CONTROLLER_CONFIG_RECORD} is {:.0}s old, refreshing",
                elapsed.as_secs_f64()
            );
            return None;
        }
        Some(value)
    }
}

fn required_entry(data: &HashMap<String, String>, key: &str) -> Result<String> {
    data.get(key)
        .filter(|value| !value.is_empty())
        .cloned()
        .with_context(|| format!("key [{key}] not found in record {CONTROLLER_CONFIG_RECORD}"))
}

/// Permissive boolean parsing for optional configuration entries.
///
/// Recognized truthy tokens: 1/T/Y/TRUE/YES; falsy: 0/F/N/FALSE/NO (case
/// and surrounding whitespace ignored). With a `true` default, anything
/// outside the falsy set counts as true; with a `false` default, anything
/// outside the truthy set counts as false. A missing or empty entry uses
/// the default.
pub fn parse_bool_with_default(
    data: &HashMap<String, String>,
    key: &str,
    default: bool,
) -> bool {
    let raw = match data.get(key) {
        Some(value) => value,
        None => {
            warn!("key [{key}] not set, using default {default}");
            return default;
        }
    };
    if raw.trim().is_empty() {
        return default;
    }
    let token = raw.trim().to_uppercase();
    if matches!(token.as_str(), "1" | "T" | "Y" | "TRUE" | "YES") {
        return true;
    }
    if default {
        !matches!(token.as_str(), "0" | "F" | "N" | "FALSE" | "NO")
    } else {
        false
    }
}
