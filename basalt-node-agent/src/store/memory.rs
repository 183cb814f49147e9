//! In-memory `StateStore` used by tests and develop mode.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    AgentInstance, Condition, ConditionType, KvRecord, LabelSelector, NodeRecord, StateStore,
};

#[derive(Default)]
struct Inner {
    nodes: HashMap<String, NodeRecord>,
    records: HashMap<(String, String), KvRecord>,
    instances: Vec<AgentInstance>,
}

/// Develop-mode / test double for the cluster state store.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    record_reads: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-seeded with the local node's own record, enough for the
    /// probe to come up in develop mode.
    pub fn with_node(node_name: &str) -> Self {
        let mut inner = Inner::default();
        inner
            .nodes
            .insert(node_name.to_string(), NodeRecord::new(node_name));
        Self {
            inner: RwLock::new(inner),
            record_reads: AtomicU64::new(0),
        }
    }

    pub async fn put_node(&self, node: NodeRecord) {
        self.inner.write().await.nodes.insert(node.name.clone(), node);
    }

    pub async fn put_record(&self, record: KvRecord) {
        self.inner
            .write()
            .await
            .records
            .insert((record.namespace.clone(), record.name.clone()), record);
    }

    pub async fn put_agent_instance(&self, instance: AgentInstance) {
        self.inner.write().await.instances.push(instance);
    }

    /// Number of single-record fetches served so far.
    pub fn record_read_count(&self) -> u64 {
        self.record_reads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get_node(&self, name: &str) -> Result<NodeRecord> {
        self.inner
            .read()
            .await
            .nodes
            .get(name)
            .cloned()
            .with_context(|| format!("node {name} not found"))
    }

    async fn patch_node_condition(
        &self,
        node: &str,
        condition_type: ConditionType,
        condition: Condition,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let Some(record) = inner.nodes.get_mut(node) else {
            bail!("node {node} not found");
        };
        record.conditions.insert(condition_type, condition);
        Ok(())
    }

    async fn get_record(&self, namespace: &str, name: &str) -> Result<Option<KvRecord>> {
        self.record_reads.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .inner
            .read()
            .await
            .records
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list_records(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<KvRecord>> {
        let inner = self.inner.read().await;
        let mut matches: Vec<KvRecord> = inner
            .records
            .values()
            .filter(|record| record.namespace == namespace && selector.matches(&record.labels))
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(matches)
    }

    async fn create_record(&self, record: KvRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        let key = (record.namespace.clone(), record.name.clone());
        if inner.records.contains_key(&key) {
            bail!("record {}/{} already exists", record.namespace, record.name);
        }
        inner.records.insert(key, record);
        Ok(())
    }

    async fn update_record(&self, record: KvRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        let key = (record.namespace.clone(), record.name.clone());
        if !inner.records.contains_key(&key) {
            bail!("record {}/{} not found", record.namespace, record.name);
        }
        inner.records.insert(key, record);
        Ok(())
    }

    async fn list_agent_instances(&self, selector: &LabelSelector) -> Result<Vec<AgentInstance>> {
        let _ = selector;
        Ok(self.inner.read().await.instances.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ConditionStatus, SYSTEM_NAMESPACE};

    #[tokio::test]
    async fn records_round_trip_with_selectors() {
        let store = MemoryStore::new();
        store
            .put_record(
                KvRecord::new("v1", SYSTEM_NAMESPACE)
                    .label("record-type", "engine-version")
                    .entry("name", "1.0.1"),
            )
            .await;
        store
            .put_record(KvRecord::new("other", SYSTEM_NAMESPACE).label("record-type", "misc"))
            .await;

        let selector = LabelSelector::parse("record-type=engine-version");
        let matched = store.list_records(SYSTEM_NAMESPACE, &selector).await.unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].name, "v1");

        let fetched = store.get_record(SYSTEM_NAMESPACE, "v1").await.unwrap();
        assert_eq!(fetched.unwrap().data.get("name").unwrap(), "1.0.1");
        assert!(store.get_record(SYSTEM_NAMESPACE, "absent").await.unwrap().is_none());
        assert_eq!(store.record_read_count(), 2);
    }

    #[tokio::test]
    async fn patch_updates_a_single_condition() {
        let store = MemoryStore::new();
        store.put_node(NodeRecord::new("db-node-1")).await;
        store
            .patch_node_condition(
                "db-node-1",
                ConditionType::RefreshFlag,
                Condition::new(ConditionStatus::True, "Refresh", "Refresh"),
            )
            .await
            .unwrap();

        let node = store.get_node("db-node-1").await.unwrap();
        assert_eq!(node.conditions.len(), 1);
        assert!(store
            .patch_node_condition(
                "ghost",
                ConditionType::RefreshFlag,
                Condition::new(ConditionStatus::True, "Refresh", "Refresh"),
            )
            .await
            .is_err());
    }

    #[tokio::test]
    async fn create_then_update_record() {
        let store = MemoryStore::new();
        let record = KvRecord::new("version-availability-db-node-1", SYSTEM_NAMESPACE);
        store.create_record(record.clone()).await.unwrap();
        assert!(store.create_record(record.clone()).await.is_err());

        let updated = record.entry("existingVersions", "1.0.1");
        store.update_record(updated).await.unwrap();
        let fetched = store
            .get_record(SYSTEM_NAMESPACE, "version-availability-db-node-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.data.get("existingVersions").unwrap(), "1.0.1");
    }
}
