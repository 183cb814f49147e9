//! Record model and client seam for the cluster state store.
//!
//! The store itself is an external service; this module defines the records
//! the agent reads and writes plus the `StateStore` trait every subsystem
//! talks through. `memory::MemoryStore` backs tests and develop mode.

pub mod memory;

use std::collections::HashMap;
use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Namespace holding every record this agent touches.
pub const SYSTEM_NAMESPACE: &str = "basalt-system";

/// Cluster-wide controller configuration record (SSH user, feature toggles).
pub const CONTROLLER_CONFIG_RECORD: &str = "controller-config";

/// Cluster-wide network configuration record (client interface name).
pub const NETWORK_CONFIG_RECORD: &str = "network-config";

/// Health facets tracked per node. Each node record keeps at most one
/// condition per type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    /// The client-facing network of the node is not correctly configured.
    ClientNetworkUnavailable,
    /// Address of the node's client-facing interface.
    ClientIp,
    /// Address of the node's out-of-band management controller.
    OobIp,
    /// Heartbeat-only marker refreshed on every probe pass.
    RefreshFlag,
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConditionType::ClientNetworkUnavailable => "ClientNetworkUnavailable",
            ConditionType::ClientIp => "ClientIp",
            ConditionType::OobIp => "OobIp",
            ConditionType::RefreshFlag => "RefreshFlag",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// One timestamped status/reason/message triple describing a health facet.
///
/// `last_heartbeat_time` advances on every successful write;
/// `last_transition_time` only advances when the status changes from the
/// previously recorded value for the same condition type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_heartbeat_time: DateTime<Utc>,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            status,
            reason: reason.into(),
            message: message.into(),
            last_heartbeat_time: now,
            last_transition_time: now,
        }
    }
}

/// A node's entry in the cluster state store, as far as this agent cares:
/// its reachable address and the health conditions keyed by type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub name: String,
    pub address: Option<String>,
    pub conditions: HashMap<ConditionType, Condition>,
}

impl NodeRecord {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            address: Some(name.clone()),
            name,
            conditions: HashMap::new(),
        }
    }

    /// Reachable address of the node, falling back to its name.
    pub fn reachable_address(&self) -> &str {
        match self.address.as_deref() {
            Some(addr) if !addr.is_empty() => addr,
            _ => &self.name,
        }
    }
}

/// Generic labeled key/value record (controller configuration, engine
/// version descriptors, per-host availability, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KvRecord {
    pub name: String,
    pub namespace: String,
    pub labels: HashMap<String, String>,
    pub data: HashMap<String, String>,
}

impl KvRecord {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            labels: HashMap::new(),
            data: HashMap::new(),
        }
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// One running copy of this agent somewhere in the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInstance {
    pub node_name: String,
    pub address: String,
}

/// Equality-based label selector, parsed from `"key=value,key2=value2"`.
#[derive(Debug, Clone, Default)]
pub struct LabelSelector {
    pairs: Vec<(String, String)>,
}

impl LabelSelector {
    pub fn parse(raw: &str) -> Self {
        let pairs = raw
            .split(',')
            .filter_map(|part| {
                let (key, value) = part.split_once('=')?;
                let (key, value) = (key.trim(), value.trim());
                if key.is_empty() {
                    return None;
                }
                Some((key.to_string(), value.to_string()))
            })
            .collect();
        Self { pairs }
    }

    /// An empty selector matches everything.
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        self.pairs
            .iter()
            .all(|(key, value)| labels.get(key).map(String::as_str) == Some(value.as_str()))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in &self.pairs {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{key}={value}")?;
            first = false;
        }
        Ok(())
    }
}

/// Client interface to the cluster state store.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Fetches a node record by name; absence is an error.
    async fn get_node(&self, name: &str) -> Result<NodeRecord>;

    /// Patches a single condition on the node's status. The patch carries
    /// only the one condition being updated.
    async fn patch_node_condition(
        &self,
        node: &str,
        condition_type: ConditionType,
        condition: Condition,
    ) -> Result<()>;

    /// Fetches a record by namespace and name; absence is `Ok(None)`.
    async fn get_record(&self, namespace: &str, name: &str) -> Result<Option<KvRecord>>;

    /// Lists records in a namespace matching a label selector.
    async fn list_records(&self, namespace: &str, selector: &LabelSelector)
        -> Result<Vec<KvRecord>>;

    /// Creates a record; fails if it already exists.
    async fn create_record(&self, record: KvRecord) -> Result<()>;

    /// Replaces an existing record; fails if it does not exist.
    async fn update_record(&self, record: KvRecord) -> Result<()>;

    /// Lists agent instances matching a label selector.
    async fn list_agent_instances(&self, selector: &LabelSelector) -> Result<Vec<AgentInstance>>;
}
