//! The locator mixed into every non-registry node: probes the subnet for
//! registries with periodic heartbeats and answers discovery queries from
//! the registries it knows.

use super::probe::SubnetProber;
use super::registry::ServiceEntry;
use super::{NodeRef, NodeRole};
use crate::options::{NodeConfig, REQUEST_TIMEOUT};
use crate::proto::{Message, MessageType};
use crate::transport::Comm;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// Finds registries and relays discovery queries to them.
pub(crate) struct Locator {
    comm: Arc<Comm>,
    prober: SubnetProber,
    registries: RwLock<HashMap<String, IpAddr>>,
    interval: Duration,
    logger: slog::Logger,
}

impl Locator {
    /// A locator advertising `role` for the node in `config`.
    pub(crate) fn new(comm: Arc<Comm>, config: &NodeConfig, role: NodeRole) -> Arc<Self> {
        let logger = comm.logger.new(slog::o!("part" => "locator"));
        Arc::new(Locator {
            prober: SubnetProber::new(Arc::clone(&comm), config, role),
            comm,
            registries: RwLock::new(HashMap::new()),
            interval: config.heartbeat_interval,
            logger,
        })
    }

    /// Runs the heartbeat loop forever: each round sweeps the subnet and
    /// replaces the registry map with whoever answered, so registries that
    /// went silent drop out on the next cycle.
    pub(crate) fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let locator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(locator.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                locator.refresh_once().await;
            }
        })
    }

    /// One heartbeat round.
    pub(crate) async fn refresh_once(&self) {
        let found = self.prober.sweep().await;
        let mut registries = self.registries.write().await;
        if *registries != found {
            slog::info!(self.logger, "registry set changed: {:?}", found.keys().collect::<Vec<_>>());
            *registries = found;
        }
    }

    pub(crate) async fn known_registries(&self) -> Vec<IpAddr> {
        self.registries.read().await.values().copied().collect()
    }

    /// Asks the known registries for a node by name; first answer wins.
    pub(crate) async fn query_by_name(&self, name: &str) -> Option<ServiceEntry> {
        #[derive(Deserialize)]
        struct Ack {
            node: ServiceEntry,
        }
        for registry in self.known_registries().await {
            let msg = Message::new(
                MessageType::DiscoveryQueryByName,
                self.comm.ip,
                registry,
                serde_json::json!({ "name": name }),
            );
            match self.comm.request(registry, msg, REQUEST_TIMEOUT).await {
                Ok(response) if response.is_ok() => {
                    if let Ok(ack) = response.parse_payload::<Ack>() {
                        return Some(ack.node);
                    }
                }
                _ => continue,
            }
        }
        None
    }

    /// Asks the known registries for every node holding `role`; first
    /// non-empty answer wins. An empty vec means nothing was found.
    pub(crate) async fn query_by_role(&self, role: NodeRole) -> Vec<NodeRef> {
        #[derive(Deserialize)]
        struct Ack {
            nodes: Vec<NodeRef>,
        }
        for registry in self.known_registries().await {
            let msg = Message::new(
                MessageType::DiscoveryQueryByRole,
                self.comm.ip,
                registry,
                serde_json::json!({ "role": role }),
            );
            match self.comm.request(registry, msg, REQUEST_TIMEOUT).await {
                Ok(response) if response.is_ok() => {
                    if let Ok(ack) = response.parse_payload::<Ack>() {
                        if !ack.nodes.is_empty() {
                            return ack.nodes;
                        }
                    }
                }
                _ => continue,
            }
        }
        Vec::new()
    }
}

/// Peer source backed by a locator's role query, used by every gossiping
/// role except the registry itself.
pub(crate) struct LocatorPeers {
    pub(crate) locator: Arc<Locator>,
    pub(crate) role: NodeRole,
    pub(crate) own_name: String,
}

#[async_trait::async_trait]
impl super::gossip::PeerProvider for LocatorPeers {
    async fn discover(&self) -> Vec<NodeRef> {
        self.locator
            .query_by_role(self.role)
            .await
            .into_iter()
            .filter(|node| node.name != self.own_name)
            .collect()
    }

    async fn resolve(&self, name: &str) -> Option<NodeRef> {
        if name == self.own_name {
            return None;
        }
        let entry = self.locator.query_by_name(name).await?;
        if entry.role != self.role {
            return None;
        }
        Some(NodeRef { name: entry.name, ip: entry.ip })
    }
}

#[cfg(test)]
mod tests {
    use super::super::gossip::PeerProvider;
    use super::*;
    use crate::cluster::registry::RegistryNode;
    use pretty_assertions::assert_eq;

    fn free_port() -> u16 {
        let sock = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        sock.local_addr().unwrap().port()
    }

    fn config(name: &str, ip: &str, port: u16) -> NodeConfig {
        NodeConfig::with_subnet(name, ip.parse().unwrap(), "127.0.0.0/30".parse().unwrap()).control_port(port)
    }

    /// Registry on 127.0.0.1, locator for a storage node on 127.0.0.2; the
    /// locator's own heartbeats register it, so the query helpers can find
    /// it back through the registry.
    async fn live_locator(port: u16) -> Arc<Locator> {
        let registry = RegistryNode::new(config("reg-1", "127.0.0.1", port));
        tokio::spawn(async move { registry.serve().await });

        let node_config = config("data-x", "127.0.0.2", port);
        let comm = crate::transport::Comm::new(&node_config);
        let locator = Locator::new(comm, &node_config, NodeRole::Data);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            locator.refresh_once().await;
            if !locator.known_registries().await.is_empty() {
                return locator;
            }
            assert!(tokio::time::Instant::now() < deadline, "registry never answered a probe");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn query_helpers_resolve_through_a_registry() {
        let locator = live_locator(free_port()).await;

        let entry = locator.query_by_name("data-x").await.expect("own heartbeat must be registered");
        assert_eq!(entry.ip, "127.0.0.2");
        assert_eq!(entry.role, NodeRole::Data);

        assert!(locator.query_by_name("ghost").await.is_none());

        let data_nodes = locator.query_by_role(NodeRole::Data).await;
        assert_eq!(
            data_nodes,
            vec![NodeRef {
                name: "data-x".to_string(),
                ip: "127.0.0.2".to_string(),
            }]
        );
        assert!(locator.query_by_role(NodeRole::Auth).await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn peer_resolution_goes_through_query_by_name() {
        let locator = live_locator(free_port()).await;
        let peers = LocatorPeers {
            locator: Arc::clone(&locator),
            role: NodeRole::Data,
            own_name: "data-y".to_string(),
        };

        let resolved = peers.resolve("data-x").await.expect("registered peer must resolve");
        assert_eq!(resolved.ip, "127.0.0.2");

        // a node never resolves itself, and role mismatches are filtered
        assert!(peers.resolve("data-y").await.is_none());
        let wrong_role = LocatorPeers {
            locator,
            role: NodeRole::Auth,
            own_name: "auth-z".to_string(),
        };
        assert!(wrong_role.resolve("data-x").await.is_none());
    }
}
