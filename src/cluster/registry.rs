//! The registry node: membership table, discovery queries and table gossip.

use super::gossip::{Gossip, GossipState, PeerProvider};
use super::probe::{HeartbeatPayload, SubnetProber};
use super::{NodeRef, NodeRole};
use crate::error::ServerError;
use crate::options::{CLEAN_INTERVAL, HEARTBEAT_TIMEOUT, NodeConfig, REGISTRY_DISCOVERY_INTERVAL};
use crate::proto::{Message, MessageType};
use crate::transport::{Comm, MessageHandler, Router};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One membership record: a node known to the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEntry {
    /// Node name; the table key.
    pub name: String,
    /// Advertised address. Unique across the table.
    pub ip: String,
    /// Advertised role.
    pub role: NodeRole,
    /// Seconds since the epoch of the last heartbeat observed.
    pub last_heartbeat: i64,
}

/// The membership table, keyed by name with a secondary uniqueness
/// constraint on address. All queries return snapshot copies taken under
/// the table lock.
#[derive(Default)]
pub(crate) struct RegisterTable {
    inner: Mutex<HashMap<String, ServiceEntry>>,
}

impl RegisterTable {
    pub(crate) fn new() -> Self {
        RegisterTable::default()
    }

    /// Registers or refreshes `name`. A heartbeat may move a name to a new
    /// address; the address then stops belonging to whoever held it before.
    /// Returns the stored entry and whether it was newly registered.
    pub(crate) fn upsert(&self, name: &str, ip: &str, role: NodeRole) -> (ServiceEntry, bool) {
        let now = chrono::Utc::now().timestamp();
        let mut table = self.inner.lock().expect("register table lock");

        let stale_holder: Option<String> = table
            .values()
            .find(|e| e.ip == ip && e.name != name)
            .map(|e| e.name.clone());
        if let Some(holder) = stale_holder {
            table.remove(&holder);
        }

        let is_new = !table.contains_key(name);
        let entry = ServiceEntry {
            name: name.to_string(),
            ip: ip.to_string(),
            role,
            last_heartbeat: now,
        };
        table.insert(name.to_string(), entry.clone());
        (entry, is_new)
    }

    pub(crate) fn get(&self, name: &str) -> Option<ServiceEntry> {
        self.inner.lock().expect("register table lock").get(name).cloned()
    }

    pub(crate) fn by_role(&self, role: NodeRole) -> Vec<ServiceEntry> {
        let table = self.inner.lock().expect("register table lock");
        let mut nodes: Vec<ServiceEntry> = table.values().filter(|e| e.role == role).cloned().collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        nodes
    }

    pub(crate) fn all(&self) -> Vec<ServiceEntry> {
        let table = self.inner.lock().expect("register table lock");
        let mut nodes: Vec<ServiceEntry> = table.values().cloned().collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        nodes
    }

    pub(crate) fn remove(&self, name: &str) -> Option<ServiceEntry> {
        self.inner.lock().expect("register table lock").remove(name)
    }

    /// Drops every entry whose heartbeat is older than `timeout` and returns
    /// the evicted records.
    pub(crate) fn evict_stale(&self, timeout: Duration) -> Vec<ServiceEntry> {
        let cutoff = chrono::Utc::now().timestamp() - timeout.as_secs() as i64;
        let mut table = self.inner.lock().expect("register table lock");
        let dead: Vec<String> = table.values().filter(|e| e.last_heartbeat < cutoff).map(|e| e.name.clone()).collect();
        dead.iter().filter_map(|name| table.remove(name)).collect()
    }

    /// Merges a replicated entry. The fresher heartbeat wins on conflict.
    pub(crate) fn merge_entry(&self, entry: ServiceEntry) {
        let mut table = self.inner.lock().expect("register table lock");
        match table.get(&entry.name) {
            Some(existing) if existing.last_heartbeat > entry.last_heartbeat => {}
            _ => {
                table.insert(entry.name.clone(), entry);
            }
        }
    }
}

/// Delta replicated between registries on every table change.
#[derive(Debug, Serialize, Deserialize)]
struct RegistryUpdate {
    op: String,
    registry: ServiceEntry,
}

/// Gossip plug for the membership table.
pub(crate) struct RegistryState {
    table: Arc<RegisterTable>,
}

#[async_trait]
impl GossipState for RegistryState {
    async fn export(&self) -> Value {
        serde_json::json!({ "nodes": self.table.all() })
    }

    async fn import(&self, dump: Value, _origin: IpAddr) {
        let Ok(nodes) = serde_json::from_value::<NodeDump>(dump) else {
            return;
        };
        for entry in nodes.nodes {
            self.table.merge_entry(entry);
        }
    }

    async fn apply(&self, update: Value, _origin: IpAddr) -> Result<(), crate::BoxError> {
        let update: RegistryUpdate = serde_json::from_value(update)?;
        match update.op.as_str() {
            "add" => self.table.merge_entry(update.registry),
            "delete" => {
                self.table.remove(&update.registry.name);
            }
            other => return Err(format!("unknown registry op {other:?}").into()),
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct NodeDump {
    nodes: Vec<ServiceEntry>,
}

/// Peer source for registries: sweep the subnet and keep whoever answers
/// with a registry heartbeat ack.
struct ProbePeers {
    prober: SubnetProber,
    own_name: String,
}

#[async_trait]
impl PeerProvider for ProbePeers {
    async fn discover(&self) -> Vec<NodeRef> {
        self.prober
            .sweep()
            .await
            .into_iter()
            .filter(|(name, _)| *name != self.own_name)
            .map(|(name, ip)| NodeRef { name, ip: ip.to_string() })
            .collect()
    }

    async fn resolve(&self, name: &str) -> Option<NodeRef> {
        // Registries have no registry to ask, so re-resolution is one more
        // sweep filtered to the requested name.
        self.discover().await.into_iter().find(|peer| peer.name == name)
    }
}

/// A registry node. Holds the membership table, answers by-name / by-role /
/// all queries, and keeps the table convergent with peer registries through
/// gossip.
pub struct RegistryNode {
    comm: Arc<Comm>,
    table: Arc<RegisterTable>,
    gossip: Arc<Gossip<RegistryState>>,
    logger: slog::Logger,
}

impl RegistryNode {
    /// Builds a registry node from `config`.
    pub fn new(config: NodeConfig) -> Arc<Self> {
        let comm = Comm::new(&config);
        let table = Arc::new(RegisterTable::new());
        let state = Arc::new(RegistryState { table: Arc::clone(&table) });
        let provider = ProbePeers {
            prober: SubnetProber::new(Arc::clone(&comm), &config, NodeRole::Registry),
            own_name: config.name.clone(),
        };
        let gossip = Gossip::new(Arc::clone(&comm), state, Box::new(provider), REGISTRY_DISCOVERY_INTERVAL);
        let logger = comm.logger.clone();
        Arc::new(RegistryNode {
            comm,
            table,
            gossip,
            logger,
        })
    }

    /// Serves the control port and runs the peer-discovery and eviction
    /// loops. Does not return while the node is healthy.
    pub async fn serve(self: &Arc<Self>) -> Result<(), ServerError> {
        let mut router = Router::new();
        let this = Arc::clone(self) as Arc<dyn MessageHandler>;
        router.register(MessageType::DiscoveryHeartbeat, Arc::clone(&this));
        router.register(MessageType::DiscoveryQueryByName, Arc::clone(&this));
        router.register(MessageType::DiscoveryQueryByRole, Arc::clone(&this));
        router.register(MessageType::DiscoveryQueryAll, this);
        self.gossip.register(&mut router);

        let server = self.comm.serve(router).await?;
        self.gossip.spawn();
        self.spawn_cleaner();

        server.await.map_err(|_| ServerError::Terminated)
    }

    fn spawn_cleaner(self: &Arc<Self>) {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEAN_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for entry in node.table.evict_stale(HEARTBEAT_TIMEOUT) {
                    slog::info!(node.logger, "evicting inactive node {}", entry.name);
                    let update = serde_json::json!({"op": "delete", "registry": entry});
                    node.gossip.notify_local_change(update).await;
                }
            }
        });
    }

    fn handle_heartbeat(&self, msg: &Message) -> Message {
        let beat: HeartbeatPayload = match msg.parse_payload() {
            Ok(b) => b,
            Err(_) => return Message::error_to(msg, self.comm.ip, "Missing fields"),
        };

        let own_ref = serde_json::json!(NodeRef {
            name: self.comm.name.clone(),
            ip: self.comm.ip.to_string(),
        });

        // Peer registries are tracked through the gossip peer set, not the
        // membership table.
        if beat.role == NodeRole::Registry {
            return Message::ack_to(msg, self.comm.ip, own_ref);
        }

        let (entry, is_new) = self.table.upsert(&beat.name, &beat.ip, beat.role);
        if is_new {
            slog::info!(self.logger, "new node registered: {} {} ({})", entry.name, entry.role, entry.ip);
        }

        let gossip = Arc::clone(&self.gossip);
        tokio::spawn(async move {
            let update = serde_json::json!({"op": "add", "registry": entry});
            gossip.notify_local_change(update).await;
        });

        Message::ack_to(msg, self.comm.ip, own_ref)
    }

    fn handle_query_by_name(&self, msg: &Message) -> Message {
        #[derive(Deserialize)]
        struct Query {
            name: String,
        }
        let query: Query = match msg.parse_payload() {
            Ok(q) => q,
            Err(_) => return Message::error_to(msg, self.comm.ip, "Missing name"),
        };
        match self.table.get(&query.name) {
            Some(node) => Message::ack_to(msg, self.comm.ip, serde_json::json!({ "node": node })),
            None => Message::error_to(msg, self.comm.ip, "Not found"),
        }
    }

    fn handle_query_by_role(&self, msg: &Message) -> Message {
        #[derive(Deserialize)]
        struct Query {
            role: NodeRole,
        }
        let query: Query = match msg.parse_payload() {
            Ok(q) => q,
            Err(_) => return Message::error_to(msg, self.comm.ip, "Invalid role"),
        };
        let nodes: Vec<NodeRef> = self
            .table
            .by_role(query.role)
            .into_iter()
            .map(|e| NodeRef { name: e.name, ip: e.ip })
            .collect();
        Message::ack_to(msg, self.comm.ip, serde_json::json!({ "nodes": nodes }))
    }

    fn handle_query_all(&self, msg: &Message) -> Message {
        Message::ack_to(msg, self.comm.ip, serde_json::json!({ "nodes": self.table.all() }))
    }
}

#[async_trait]
impl MessageHandler for RegistryNode {
    async fn handle(&self, msg: Message) -> Option<Message> {
        let response = match msg.header.msg_type {
            MessageType::DiscoveryHeartbeat => self.handle_heartbeat(&msg),
            MessageType::DiscoveryQueryByName => self.handle_query_by_name(&msg),
            MessageType::DiscoveryQueryByRole => self.handle_query_by_role(&msg),
            MessageType::DiscoveryQueryAll => self.handle_query_all(&msg),
            _ => return None,
        };
        Some(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn upsert_registers_and_refreshes() {
        let table = RegisterTable::new();
        let (entry, is_new) = table.upsert("data-1", "10.0.0.5", NodeRole::Data);
        assert!(is_new);
        assert_eq!(entry.ip, "10.0.0.5");

        let (entry, is_new) = table.upsert("data-1", "10.0.0.6", NodeRole::Data);
        assert!(!is_new);
        assert_eq!(entry.ip, "10.0.0.6");
        assert_eq!(table.all().len(), 1);
        assert_eq!(table.get("data-1").unwrap().ip, "10.0.0.6");
    }

    #[test]
    fn address_uniqueness_evicts_previous_holder() {
        let table = RegisterTable::new();
        table.upsert("data-1", "10.0.0.5", NodeRole::Data);
        table.upsert("data-2", "10.0.0.5", NodeRole::Data);
        assert!(table.get("data-1").is_none());
        assert_eq!(table.get("data-2").unwrap().ip, "10.0.0.5");
    }

    #[test]
    fn by_role_filters() {
        let table = RegisterTable::new();
        table.upsert("data-1", "10.0.0.5", NodeRole::Data);
        table.upsert("auth-1", "10.0.0.6", NodeRole::Auth);
        table.upsert("data-2", "10.0.0.7", NodeRole::Data);

        let data = table.by_role(NodeRole::Data);
        assert_eq!(data.len(), 2);
        assert_eq!(data[0].name, "data-1");
        assert!(table.by_role(NodeRole::Routing).is_empty());
    }

    #[test]
    fn eviction_drops_only_stale_entries() {
        let table = RegisterTable::new();
        table.upsert("data-1", "10.0.0.5", NodeRole::Data);
        {
            let mut inner = table.inner.lock().unwrap();
            inner.get_mut("data-1").unwrap().last_heartbeat -= 3600;
        }
        table.upsert("data-2", "10.0.0.6", NodeRole::Data);

        let evicted = table.evict_stale(Duration::from_secs(10));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].name, "data-1");
        assert!(table.get("data-2").is_some());
    }

    #[test]
    fn merge_entry_keeps_fresher_heartbeat() {
        let table = RegisterTable::new();
        let (fresh, _) = table.upsert("data-1", "10.0.0.5", NodeRole::Data);

        let stale = ServiceEntry {
            last_heartbeat: fresh.last_heartbeat - 100,
            ip: "10.0.0.9".to_string(),
            ..fresh.clone()
        };
        table.merge_entry(stale);
        assert_eq!(table.get("data-1").unwrap().ip, "10.0.0.5");
    }

    #[tokio::test]
    async fn registry_state_apply_round_trip() {
        let table = Arc::new(RegisterTable::new());
        let state = RegistryState { table: Arc::clone(&table) };
        let entry = ServiceEntry {
            name: "proc-1".to_string(),
            ip: "10.0.0.8".to_string(),
            role: NodeRole::Processing,
            last_heartbeat: chrono::Utc::now().timestamp(),
        };
        let origin: IpAddr = "10.0.0.2".parse().unwrap();

        let add = serde_json::json!({"op": "add", "registry": &entry});
        state.apply(add.clone(), origin).await.unwrap();
        state.apply(add, origin).await.unwrap();
        assert_eq!(table.all().len(), 1);

        let delete = serde_json::json!({"op": "delete", "registry": &entry});
        state.apply(delete.clone(), origin).await.unwrap();
        assert!(table.all().is_empty());
        // deleting an absent entry is a no-op
        state.apply(delete, origin).await.unwrap();
    }

    fn registry() -> Arc<RegistryNode> {
        let config = NodeConfig::with_subnet("reg-1", "127.0.0.1".parse().unwrap(), "127.0.0.0/30".parse().unwrap());
        RegistryNode::new(config)
    }

    #[tokio::test]
    async fn heartbeat_handler_registers_and_answers_queries() {
        let node = registry();
        let src: IpAddr = "10.0.0.5".parse().unwrap();

        let beat = Message::new(
            MessageType::DiscoveryHeartbeat,
            src,
            "127.0.0.1".parse().unwrap(),
            serde_json::json!({"name": "data-1", "ip": "10.0.0.5", "role": "DATA"}),
        );
        let ack = node.handle(beat).await.unwrap();
        assert_eq!(ack.header.msg_type, MessageType::DiscoveryHeartbeatAck);
        assert!(ack.is_ok());
        assert_eq!(ack.payload["name"], "reg-1");

        let query = Message::new(
            MessageType::DiscoveryQueryByRole,
            src,
            "127.0.0.1".parse().unwrap(),
            serde_json::json!({"role": "DATA"}),
        );
        let ack = node.handle(query).await.unwrap();
        let nodes: Vec<NodeRef> = serde_json::from_value(ack.payload["nodes"].clone()).unwrap();
        assert_eq!(nodes, vec![NodeRef { name: "data-1".into(), ip: "10.0.0.5".into() }]);

        let query = Message::new(
            MessageType::DiscoveryQueryByName,
            src,
            "127.0.0.1".parse().unwrap(),
            serde_json::json!({"name": "nope"}),
        );
        let ack = node.handle(query).await.unwrap();
        assert!(!ack.is_ok());
    }

    #[tokio::test]
    async fn registry_heartbeat_is_not_tabled() {
        let node = registry();
        let beat = Message::new(
            MessageType::DiscoveryHeartbeat,
            "10.0.0.9".parse().unwrap(),
            "127.0.0.1".parse().unwrap(),
            serde_json::json!({"name": "reg-2", "ip": "10.0.0.9", "role": "REGISTRY"}),
        );
        let ack = node.handle(beat).await.unwrap();
        assert!(ack.is_ok());
        assert!(node.table.all().is_empty());
    }
}
