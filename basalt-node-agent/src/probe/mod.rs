//! Periodic node capability probing.
//!
//! Every tick the probe answers, for the local node only: is the client
//! network interface up, which client IP does it carry, and what is the
//! out-of-band management address. Results are written back as health
//! conditions on the node's record. Expensive checks are throttled while
//! their condition is healthy and fresh; every write preserves the
//! transition history (the transition timestamp only advances when the
//! status actually changes).
//!
//! Each tick runs under an error boundary: a failing step is logged and
//! skipped, the remaining steps still run, and the loop never stops.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, ensure, Context, Result};
use chrono::Utc;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use crate::policy::{parse_bool_with_default, ConfigPolicyCache};
use crate::ssh::{run_once, RemoteSession, RunOutput};
use crate::store::{
    Condition, ConditionStatus, ConditionType, NodeRecord, StateStore, CONTROLLER_CONFIG_RECORD,
    NETWORK_CONFIG_RECORD, SYSTEM_NAMESPACE,
};

/// Interface name used when the network configuration record is absent or
/// does not name one.
pub const DEFAULT_CLIENT_INTERFACE: &str = "bond1";

/// Data key in the network configuration record naming the client
/// interface.
const CLIENT_INTERFACE_KEY: &str = "clientInterface";

/// Healthy conditions younger than this are not re-checked.
fn recheck_throttle() -> chrono::Duration {
    chrono::Duration::hours(1)
}

/// Written when no address could ever be determined.
const PLACEHOLDER_IP: &str = "0.0.0.0";

const IP_RETRY_ATTEMPTS: usize = 3;
const IP_RETRY_PAUSE: Duration = Duration::from_secs(10);

/// Query for the out-of-band management controller address, issued against
/// the loopback of the node itself.
const OOB_QUERY_CMD: &str =
    r#"ipmitool lan print 1 | grep "IP Address" | grep -v Source| awk '{print $4}'"#;

const SLOW_TICK: Duration = Duration::from_secs(2);

/// Cluster-wide hybrid deployment switches, computed exactly once per
/// process lifetime. A failed lookup is itself final: the error is kept
/// and OOB checking stays enabled.
#[derive(Debug, Clone)]
pub struct HybridDeploySetting {
    pub check_oob_ip: bool,
    pub disable_remote_storage_cmd: bool,
    pub error: Option<String>,
}

impl HybridDeploySetting {
    fn defaults_with_error(error: Option<String>) -> Self {
        Self {
            check_oob_ip: true,
            disable_remote_storage_cmd: false,
            error,
        }
    }

    /// OOB probing runs unless the lookup succeeded and explicitly turned
    /// it off.
    pub fn oob_check_enabled(&self) -> bool {
        self.error.is_some() || self.check_oob_ip
    }
}

/// Run-once gate around the hybrid deployment lookup. Constructed at
/// process start and shared by handle.
#[derive(Default)]
pub struct HybridDeployGate {
    cell: OnceCell<HybridDeploySetting>,
}

impl HybridDeployGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, store: &dyn StateStore) -> &HybridDeploySetting {
        self.cell
            .get_or_init(|| async { load_hybrid_deploy_setting(store).await })
            .await
    }
}

async fn load_hybrid_deploy_setting(store: &dyn StateStore) -> HybridDeploySetting {
    match store
        .get_record(SYSTEM_NAMESPACE, CONTROLLER_CONFIG_RECORD)
        .await
    {
        Err(err) => {
            error!("hybrid deploy lookup failed: {err:#}");
            HybridDeploySetting::defaults_with_error(Some(format!("{err:#}")))
        }
        Ok(None) => {
            info!("no {CONTROLLER_CONFIG_RECORD} record, hybrid deploy defaults apply");
            HybridDeploySetting::defaults_with_error(None)
        }
        Ok(Some(record)) => HybridDeploySetting {
            check_oob_ip: parse_bool_with_default(&record.data, "checkOobIp", true),
            disable_remote_storage_cmd: parse_bool_with_default(
                &record.data,
                "disableRemoteStorageCmd",
                false,
            ),
            error: None,
        },
    }
}

/// Three-way classification of the client interface state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceState {
    Up,
    Down,
    Unknown,
}

pub struct NodeProbe {
    store: Arc<dyn StateStore>,
    policy: Arc<ConfigPolicyCache>,
    gate: Arc<HybridDeployGate>,
    node_name: String,
    client_interface: String,
    session: Option<RemoteSession>,
    initialized: bool,
    init_lock: tokio::sync::Mutex<()>,
    tick: u64,
}

impl NodeProbe {
    pub fn new(
        store: Arc<dyn StateStore>,
        policy: Arc<ConfigPolicyCache>,
        gate: Arc<HybridDeployGate>,
        node_name: String,
    ) -> Self {
        Self {
            store,
            policy,
            gate,
            node_name,
            client_interface: DEFAULT_CLIENT_INTERFACE.to_string(),
            session: None,
            initialized: false,
            init_lock: tokio::sync::Mutex::new(()),
            tick: 0,
        }
    }

    /// Probe loop; runs until process shutdown.
    pub async fn run(mut self, period: Duration) {
        info!(
            "node probe started for {} (period {:.0}s)",
            self.node_name,
            period.as_secs_f64()
        );
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.probe_once().await {
                warn!("probe pass failed: {err:#}");
            }
        }
    }

    async fn probe_once(&mut self) -> Result<()> {
        if !self.initialized {
            self.init().await.context("probe init")?;
        }
        self.tick += 1;

        // A dead session aborts the whole tick: conditions are left as
        // they are rather than degraded by a transient connection loss.
        self.ensure_session().await?;

        let start = Instant::now();
        let setting = self.gate.get(self.store.as_ref()).await.clone();
        let node = self
            .store
            .get_node(&self.node_name)
            .await
            .context("get local node record")?;

        if let Err(err) = self.update_client_network_condition(&node).await {
            error!("client network condition update failed: {err:#}");
        }
        if let Err(err) = self.update_client_ip_condition(&node).await {
            error!("client ip condition update failed: {err:#}");
        }
        if setting.oob_check_enabled() {
            if let Err(err) = self.update_oob_ip_condition(&node).await {
                error!("oob ip condition update failed: {err:#}");
            }
        }
        if let Err(err) = self.update_refresh_flag_condition(&node).await {
            error!("refresh flag condition update failed: {err:#}");
        }

        let spent = start.elapsed();
        if spent >= SLOW_TICK {
            info!("[{}] probe pass done, spent {:.2}s", self.tick, spent.as_secs_f64());
        } else {
            debug!("[{}] probe pass done, spent {:.2}s", self.tick, spent.as_secs_f64());
        }
        Ok(())
    }

    /// Idempotent lazy initialization: resolve the client interface name
    /// and open the dedicated session to this node's own address.
    async fn init(&mut self) -> Result<()> {
        let _guard = self.init_lock.lock().await;
        if self.initialized {
            return Ok(());
        }
        ensure!(!self.node_name.is_empty(), "node name is empty");

        self.client_interface = self.resolve_client_interface().await;
        info!(
            "probing client interface {} on node {}",
            self.client_interface, self.node_name
        );

        let node = self
            .store
            .get_node(&self.node_name)
            .await
            .with_context(|| format!("get node {}", self.node_name))?;
        let address = node.reachable_address().to_string();
        let init_tag = format!("init-{}", self.node_name);
        let session = RemoteSession::for_host(address, &[init_tag.as_str(), "NetProbe"]);
        let session = connect_in_background(session)
            .await
            .with_context(|| format!("open ssh connection to node {}", self.node_name))?;

        self.session = Some(session);
        self.initialized = true;
        Ok(())
    }

    async fn resolve_client_interface(&self) -> String {
        match self
            .store
            .get_record(SYSTEM_NAMESPACE, NETWORK_CONFIG_RECORD)
            .await
        {
            Ok(Some(record)) => match record.data.get(CLIENT_INTERFACE_KEY) {
                Some(name) if !name.is_empty() => name.clone(),
                _ => DEFAULT_CLIENT_INTERFACE.to_string(),
            },
            Ok(None) => {
                warn!(
                    "no {NETWORK_CONFIG_RECORD} record, using default client interface {DEFAULT_CLIENT_INTERFACE}"
                );
                DEFAULT_CLIENT_INTERFACE.to_string()
            }
            Err(err) => {
                error!(
                    "failed to read {NETWORK_CONFIG_RECORD}: {err:#}, using default client interface {DEFAULT_CLIENT_INTERFACE}"
                );
                DEFAULT_CLIENT_INTERFACE.to_string()
            }
        }
    }

    /// Re-validates the dedicated session, reconnecting when the liveness
    /// probe fails. The handle is kept either way so the next tick can try
    /// again.
    async fn ensure_session(&mut self) -> Result<()> {
        let mut session = self
            .session
            .take()
            .context("probe session not initialized")?;
        let count_tag = format!("cnt={}", self.tick);
        session.set_tags(&[count_tag.as_str(), "NetProbe"]);
        session.reset_age();

        let (session, result) = tokio::task::spawn_blocking(move || {
            let result = session.ensure_connected();
            (session, result)
        })
        .await
        .context("ssh liveness task panicked")?;
        self.session = Some(session);
        result.with_context(|| {
            format!(
                "[{}] rebuild ssh connection to {}",
                self.tick, self.node_name
            )
        })
    }

    async fn run_node_cmd(&mut self, command: &str, verbose: bool) -> Result<RunOutput> {
        let mut session = self
            .session
            .take()
            .context("probe session not initialized")?;
        let command = command.to_string();
        let (session, output) = tokio::task::spawn_blocking(move || {
            let output = session.run(&command, false, verbose);
            (session, output)
        })
        .await
        .context("ssh command task panicked")?;
        self.session = Some(session);
        Ok(output?)
    }

    /// Client-network condition: `state UP` on the configured interface
    /// means the "network unavailable" problem does not exist (status
    /// False); `state DOWN` means it does (status True).
    async fn update_client_network_condition(&mut self, node: &NodeRecord) -> Result<()> {
        let (state, reason, message) = self.client_interface_state().await;
        let status = match state {
            InterfaceState::Up => ConditionStatus::False,
            InterfaceState::Down => ConditionStatus::True,
            InterfaceState::Unknown => ConditionStatus::Unknown,
        };
        let condition = Condition::new(status, reason, message);
        apply_condition(
            self.store.as_ref(),
            node,
            ConditionType::ClientNetworkUnavailable,
            condition,
        )
        .await
    }

    async fn client_interface_state(&mut self) -> (InterfaceState, String, String) {
        let card = self.client_interface.clone();
        let command = format!(
            "ip a show {card}|grep \" state \"|grep -e \"{card}:\\|{card}@\" "
        );
        let verbose = self.tick % 10 == 1;
        let output = match self.run_node_cmd(&command, verbose).await {
            Ok(output) => output,
            Err(err) => {
                error!(
                    "node [{}] card [{card}] state query failed: {err:#}",
                    self.node_name
                );
                return classify_interface_state(&card, "");
            }
        };
        // Exit status 1 just means grep matched nothing.
        if !matches!(output.exit_code, Some(0) | Some(1)) {
            error!(
                "node [{}] card [{card}] state query exited with {:?}, still using its output",
                self.node_name, output.exit_code
            );
        }
        classify_interface_state(&card, &output.stdout)
    }

    /// Client-IP condition, throttled: a healthy condition that still
    /// names the same interface and is younger than an hour is left
    /// byte-for-byte untouched.
    async fn update_client_ip_condition(&mut self, node: &NodeRecord) -> Result<()> {
        let existing = node.conditions.get(&ConditionType::ClientIp);
        if let Some(condition) = existing {
            if should_skip_recheck(condition, Some(&self.client_interface)) {
                debug!(
                    "node {} condition {} fresh (last heartbeat {}), skipping this check",
                    node.name,
                    ConditionType::ClientIp,
                    condition.last_heartbeat_time
                );
                return Ok(());
            }
        }

        let card = self.client_interface.clone();
        let condition = match self.interface_ipv4(&card).await {
            Ok(ip) => Condition::new(ConditionStatus::True, card, ip),
            Err(err) => {
                error!(
                    "failed to get ipv4 of client card on node {}: {err:#}",
                    node.name
                );
                Condition::new(ConditionStatus::False, card, preserved_message(existing))
            }
        };
        apply_condition(self.store.as_ref(), node, ConditionType::ClientIp, condition).await
    }

    /// First address bound to `card`, retried a few times; a non-IPv4
    /// first address falls back to the second one when present.
    async fn interface_ipv4(&self, card: &str) -> Result<String> {
        let mut last_err = anyhow!("no lookup attempted");
        for attempt in 1..=IP_RETRY_ATTEMPTS {
            if attempt > 1 {
                tokio::time::sleep(IP_RETRY_PAUSE).await;
            }
            match lookup_interface_ip(card, attempt) {
                Ok(ip) => return Ok(ip),
                Err(err) => {
                    warn!("[{attempt}] address lookup on card {card} failed: {err:#}");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    /// OOB-IP condition, throttled like the client IP but without the
    /// interface-name comparison.
    async fn update_oob_ip_condition(&mut self, node: &NodeRecord) -> Result<()> {
        let existing = node.conditions.get(&ConditionType::OobIp);
        if let Some(condition) = existing {
            if should_skip_recheck(condition, None) {
                debug!(
                    "node {} condition {} fresh (last heartbeat {}), skipping this check",
                    node.name,
                    ConditionType::OobIp,
                    condition.last_heartbeat_time
                );
                return Ok(());
            }
        }

        let condition = match self.management_controller_ip().await {
            Ok(ip) => Condition::new(ConditionStatus::True, "PowerOn", ip),
            Err(err) => {
                error!("failed to get oob ip of node {}: {err:#}", node.name);
                Condition::new(
                    ConditionStatus::False,
                    format!("error: {err}"),
                    preserved_message(existing),
                )
            }
        };
        apply_condition(self.store.as_ref(), node, ConditionType::OobIp, condition).await
    }

    async fn management_controller_ip(&self) -> Result<String> {
        let output = run_once(
            &self.policy,
            OOB_QUERY_CMD,
            "127.0.0.1",
            &["check node oob status"],
        )
        .await?;
        match output.exit_code {
            Some(0) | None => {}
            // No "IP Address" line in the controller output.
            Some(1) => debug!("oob query matched nothing on node {}", self.node_name),
            code => bail!(
                "oob query exited with {code:?}: {}",
                output.stderr.trim()
            ),
        }

        let ip = output.stdout.trim();
        ensure!(!ip.is_empty(), "oob ip is null");
        ip.parse::<IpAddr>()
            .map(|addr| addr.to_string())
            .map_err(|_| anyhow!("oob ip {ip:?} is unavailable"))
    }

    /// Heartbeat-only condition, unconditionally refreshed every tick.
    async fn update_refresh_flag_condition(&mut self, node: &NodeRecord) -> Result<()> {
        let condition = Condition::new(ConditionStatus::True, "Refresh", "Refresh");
        apply_condition(
            self.store.as_ref(),
            node,
            ConditionType::RefreshFlag,
            condition,
        )
        .await
    }
}

/// Stamps the heartbeat, preserves the transition timestamp when the
/// status did not change, and patches just this one condition.
pub(crate) async fn apply_condition(
    store: &dyn StateStore,
    node: &NodeRecord,
    condition_type: ConditionType,
    mut condition: Condition,
) -> Result<()> {
    let now = Utc::now();
    condition.last_heartbeat_time = now;
    condition.last_transition_time = match node.conditions.get(&condition_type) {
        Some(previous) if previous.status == condition.status => previous.last_transition_time,
        _ => now,
    };

    store
        .patch_node_condition(&node.name, condition_type, condition.clone())
        .await
        .with_context(|| format!("patch condition {condition_type} on node {}", node.name))?;

    if condition.status == ConditionStatus::True {
        info!(
            "node {} condition {condition_type} -> {}",
            node.name, condition.status
        );
    } else {
        debug!(
            "node {} condition {condition_type} -> {}",
            node.name, condition.status
        );
    }
    Ok(())
}

/// Healthy-and-fresh test shared by the client-IP and OOB throttles.
pub(crate) fn should_skip_recheck(condition: &Condition, expected_reason: Option<&str>) -> bool {
    if condition.status != ConditionStatus::True {
        return false;
    }
    if let Some(reason) = expected_reason {
        if condition.reason != reason {
            return false;
        }
    }
    Utc::now() - condition.last_heartbeat_time <= recheck_throttle()
}

pub(crate) fn classify_interface_state(
    card: &str,
    stdout: &str,
) -> (InterfaceState, String, String) {
    if stdout.contains("state UP") {
        (
            InterfaceState::Up,
            "StateUp".to_string(),
            format!("{card} StateUp"),
        )
    } else if stdout.contains("state DOWN") {
        (
            InterfaceState::Down,
            "StateDown".to_string(),
            format!("{card} StateDown"),
        )
    } else {
        (
            InterfaceState::Unknown,
            "StateUnknown".to_string(),
            format!("{card} StateUnknown"),
        )
    }
}

/// Previous message carried over on failure, unless it never held a real
/// address.
fn preserved_message(existing: Option<&Condition>) -> String {
    match existing {
        Some(condition)
            if condition.message != PLACEHOLDER_IP && !condition.message.is_empty() =>
        {
            condition.message.clone()
        }
        _ => PLACEHOLDER_IP.to_string(),
    }
}

/// One lookup attempt against the local interface table.
fn lookup_interface_ip(card: &str, attempt: usize) -> Result<String> {
    let addrs: Vec<IpAddr> = if_addrs::get_if_addrs()
        .context("enumerate network interfaces")?
        .into_iter()
        .filter(|iface| iface.name == card && !iface.is_loopback())
        .map(|iface| iface.ip())
        .collect();
    ensure!(
        !addrs.is_empty(),
        "[{attempt}] failed to get any ip from card {card}"
    );

    match addrs[0] {
        IpAddr::V4(v4) => Ok(v4.to_string()),
        IpAddr::V6(v6) => {
            if addrs.len() > 1 {
                warn!(
                    "first ip of card {card} is {v6}, not ipv4, using the second one (attempt {attempt})"
                );
                Ok(addrs[1].to_string())
            } else {
                bail!(
                    "the first ip of card {card} is {v6}, not ipv4, and the card has no other (attempt {attempt})"
                )
            }
        }
    }
}

async fn connect_in_background(mut session: RemoteSession) -> Result<RemoteSession> {
    let (session, result) = tokio::task::spawn_blocking(move || {
        let result = session.connect();
        (session, result)
    })
    .await
    .context("ssh connect task panicked")?;
    result?;
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::KvRecord;

    fn condition_aged(
        status: ConditionStatus,
        reason: &str,
        message: &str,
        age: chrono::Duration,
    ) -> Condition {
        let mut condition = Condition::new(status, reason, message);
        condition.last_heartbeat_time = Utc::now() - age;
        condition.last_transition_time = condition.last_heartbeat_time;
        condition
    }

    #[tokio::test]
    async fn transition_time_advances_only_on_status_change() {
        let store = MemoryStore::new();
        let mut node = NodeRecord::new("db-node-1");
        store.put_node(node.clone()).await;

        apply_condition(
            &store,
            &node,
            ConditionType::ClientIp,
            Condition::new(ConditionStatus::True, "bond1", "10.0.0.8"),
        )
        .await
        .unwrap();
        let first = store.get_node("db-node-1").await.unwrap().conditions[&ConditionType::ClientIp]
            .clone();

        // Same status again: heartbeat moves, transition stays.
        node = store.get_node("db-node-1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        apply_condition(
            &store,
            &node,
            ConditionType::ClientIp,
            Condition::new(ConditionStatus::True, "bond1", "10.0.0.8"),
        )
        .await
        .unwrap();
        let second = store.get_node("db-node-1").await.unwrap().conditions
            [&ConditionType::ClientIp]
            .clone();
        assert_eq!(second.last_transition_time, first.last_transition_time);
        assert!(second.last_heartbeat_time > first.last_heartbeat_time);

        // Status flip: both move.
        node = store.get_node("db-node-1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        apply_condition(
            &store,
            &node,
            ConditionType::ClientIp,
            Condition::new(ConditionStatus::False, "bond1", "10.0.0.8"),
        )
        .await
        .unwrap();
        let third = store.get_node("db-node-1").await.unwrap().conditions
            [&ConditionType::ClientIp]
            .clone();
        assert!(third.last_transition_time > second.last_transition_time);
        assert!(third.last_heartbeat_time > second.last_heartbeat_time);
    }

    #[test]
    fn fresh_healthy_condition_is_skipped() {
        let fresh = condition_aged(
            ConditionStatus::True,
            "bond1",
            "10.0.0.8",
            chrono::Duration::minutes(10),
        );
        assert!(should_skip_recheck(&fresh, Some("bond1")));
        // Interface renamed since: check again.
        assert!(!should_skip_recheck(&fresh, Some("bond0")));
        // No reason comparison for the OOB flavor.
        assert!(should_skip_recheck(&fresh, None));
    }

    #[test]
    fn stale_or_unhealthy_conditions_are_rechecked() {
        let stale = condition_aged(
            ConditionStatus::True,
            "bond1",
            "10.0.0.8",
            chrono::Duration::hours(2),
        );
        assert!(!should_skip_recheck(&stale, Some("bond1")));

        let unhealthy = condition_aged(
            ConditionStatus::False,
            "bond1",
            "0.0.0.0",
            chrono::Duration::minutes(5),
        );
        assert!(!should_skip_recheck(&unhealthy, Some("bond1")));
    }

    #[test]
    fn interface_state_classification() {
        let up = "8: bond1: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 state UP mode DEFAULT";
        let (state, reason, message) = classify_interface_state("bond1", up);
        assert_eq!(state, InterfaceState::Up);
        assert_eq!(reason, "StateUp");
        assert_eq!(message, "bond1 StateUp");

        let down = "8: bond1: <BROADCAST,MULTICAST> mtu 1500 state DOWN mode DEFAULT";
        assert_eq!(
            classify_interface_state("bond1", down).0,
            InterfaceState::Down
        );

        assert_eq!(
            classify_interface_state("bond1", "").0,
            InterfaceState::Unknown
        );
        assert_eq!(
            classify_interface_state("bond1", "garbage output").0,
            InterfaceState::Unknown
        );
    }

    #[test]
    fn failure_messages_preserve_previous_addresses() {
        assert_eq!(preserved_message(None), PLACEHOLDER_IP);

        let placeholder = condition_aged(
            ConditionStatus::False,
            "bond1",
            PLACEHOLDER_IP,
            chrono::Duration::minutes(1),
        );
        assert_eq!(preserved_message(Some(&placeholder)), PLACEHOLDER_IP);

        let real = condition_aged(
            ConditionStatus::True,
            "bond1",
            "10.0.0.8",
            chrono::Duration::minutes(1),
        );
        assert_eq!(preserved_message(Some(&real)), "10.0.0.8");
    }

    #[tokio::test]
    async fn hybrid_deploy_lookup_is_computed_once() {
        let store = MemoryStore::new();
        store
            .put_record(
                KvRecord::new(CONTROLLER_CONFIG_RECORD, SYSTEM_NAMESPACE)
                    .entry("sshUser", "root")
                    .entry("checkOobIp", "no")
                    .entry("disableRemoteStorageCmd", "yes"),
            )
            .await;

        let gate = HybridDeployGate::new();
        let setting = gate.get(&store).await;
        assert!(!setting.check_oob_ip);
        assert!(setting.disable_remote_storage_cmd);
        assert!(setting.error.is_none());
        assert!(!setting.oob_check_enabled());

        let reads_after_first = store.record_read_count();
        let _ = gate.get(&store).await;
        assert_eq!(store.record_read_count(), reads_after_first);
    }

    #[tokio::test]
    async fn hybrid_deploy_defaults_when_record_missing() {
        let store = MemoryStore::new();
        let gate = HybridDeployGate::new();
        let setting = gate.get(&store).await;
        assert!(setting.check_oob_ip);
        assert!(!setting.disable_remote_storage_cmd);
        assert!(setting.error.is_none());
        assert!(setting.oob_check_enabled());
    }

    #[tokio::test]
    async fn client_ip_throttle_leaves_condition_untouched() {
        // A fresh healthy condition must survive a probe pass byte for
        // byte: the update path returns before any lookup or write.
        let store = Arc::new(MemoryStore::new());
        let mut node = NodeRecord::new("db-node-1");
        let fresh = condition_aged(
            ConditionStatus::True,
            DEFAULT_CLIENT_INTERFACE,
            "10.0.0.8",
            chrono::Duration::minutes(10),
        );
        node.conditions.insert(ConditionType::ClientIp, fresh.clone());
        store.put_node(node.clone()).await;

        let policy = Arc::new(ConfigPolicyCache::new(store.clone()));
        let mut probe = NodeProbe::new(
            store.clone(),
            policy,
            Arc::new(HybridDeployGate::new()),
            "db-node-1".to_string(),
        );
        probe.update_client_ip_condition(&node).await.unwrap();

        let after = store.get_node("db-node-1").await.unwrap().conditions
            [&ConditionType::ClientIp]
            .clone();
        assert_eq!(after, fresh);
    }
}
