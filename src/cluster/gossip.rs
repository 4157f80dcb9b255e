//! Anti-entropy between same-role peers: leader-coordinated pairwise state
//! merges on membership growth, state pushes to the remaining peers, and a
//! per-write update broadcast.

use super::NodeRef;
use crate::options::MERGE_TIMEOUT;
use crate::proto::{Message, MessageType};
use crate::transport::{Comm, MessageHandler, Router};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Replicated state plugged into the gossip engine.
///
/// `export`/`import` move full serialized dumps during pairwise merges;
/// `apply` folds in a single broadcast delta. Conflict resolution is the
/// implementor's business.
#[async_trait]
pub(crate) trait GossipState: Send + Sync + 'static {
    /// Full dump of the replicated state.
    async fn export(&self) -> Value;
    /// Folds a peer's dump into the local state. `origin` is the peer the
    /// dump came from.
    async fn import(&self, dump: Value, origin: IpAddr);
    /// Applies one broadcast delta. `origin` is the peer that produced it.
    async fn apply(&self, update: Value, origin: IpAddr) -> Result<(), crate::BoxError>;
}

/// Source of the same-role peer set, refreshed once per cycle.
#[async_trait]
pub(crate) trait PeerProvider: Send + Sync + 'static {
    async fn discover(&self) -> Vec<NodeRef>;
    /// Re-resolves one peer by name immediately before a targeted exchange;
    /// heartbeats may have moved the name to a new address since the last
    /// discovery cycle.
    async fn resolve(&self, name: &str) -> Option<NodeRef>;
}

struct MergeEnvelope;

impl MergeEnvelope {
    fn wrap(dump: Value) -> Value {
        serde_json::json!({ "state": dump })
    }

    fn unwrap(mut payload: Value) -> Value {
        payload.get_mut("state").map(Value::take).unwrap_or(Value::Null)
    }
}

/// The gossip engine mixed into every stateful role.
pub(crate) struct Gossip<S: GossipState> {
    comm: Arc<Comm>,
    state: Arc<S>,
    provider: Box<dyn PeerProvider>,
    peers: tokio::sync::Mutex<HashMap<String, IpAddr>>,
    // Held across a pairwise merge so inbound updates queue behind it.
    merging: tokio::sync::Mutex<()>,
    interval: Duration,
    logger: slog::Logger,
}

impl<S: GossipState> Gossip<S> {
    pub(crate) fn new(comm: Arc<Comm>, state: Arc<S>, provider: Box<dyn PeerProvider>, interval: Duration) -> Arc<Self> {
        let logger = comm.logger.new(slog::o!("part" => "gossip"));
        Arc::new(Gossip {
            comm,
            state,
            provider,
            peers: tokio::sync::Mutex::new(HashMap::new()),
            merging: tokio::sync::Mutex::new(()),
            interval,
            logger,
        })
    }

    /// Registers the three gossip message types on `router`.
    pub(crate) fn register(self: &Arc<Self>, router: &mut Router) {
        router.register(MessageType::GossipUpdate, Arc::clone(self) as Arc<dyn MessageHandler>);
        router.register(MessageType::MergeState, Arc::clone(self) as Arc<dyn MessageHandler>);
        router.register(MessageType::SendState, Arc::clone(self) as Arc<dyn MessageHandler>);
    }

    /// Runs the peer-refresh cycle forever.
    pub(crate) fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                engine.refresh_peers().await;
            }
        })
    }

    /// Snapshot of the current peer set.
    pub(crate) async fn peers(&self) -> Vec<(String, IpAddr)> {
        self.peers.lock().await.iter().map(|(n, ip)| (n.clone(), *ip)).collect()
    }

    /// Fans a single-delta update out to every peer, fire-and-forget.
    pub(crate) async fn notify_local_change(&self, update: Value) {
        let peers = self.peers().await;
        for (name, ip) in peers {
            let msg = Message::new(MessageType::GossipUpdate, self.comm.ip, ip, update.clone());
            if self.comm.notify(ip, msg).await.is_err() {
                slog::debug!(self.logger, "gossip update to {} ({}) failed", name, ip);
            }
        }
    }

    /// One refresh cycle: re-discover peers, evict the absent, and, when a
    /// new peer appears and this node coordinates, merge with it and push
    /// the combined state to everyone else.
    pub(crate) async fn refresh_peers(&self) {
        let discovered = self.provider.discover().await;

        // Coordinator is decided on the peer set as it stood before this
        // cycle, self included.
        let coordinator = {
            let peers = self.peers.lock().await;
            peers
                .keys()
                .cloned()
                .chain(std::iter::once(self.comm.name.clone()))
                .min()
                .unwrap_or_else(|| self.comm.name.clone())
        };

        let mut new_peers: Vec<(String, IpAddr)> = Vec::new();
        {
            let mut peers = self.peers.lock().await;
            let discovered_names: std::collections::HashSet<&str> = discovered.iter().map(|p| p.name.as_str()).collect();

            let absent: Vec<String> = peers.keys().filter(|name| !discovered_names.contains(name.as_str())).cloned().collect();
            for name in absent {
                slog::info!(self.logger, "peer {} missed this cycle, evicting", name);
                peers.remove(&name);
            }

            for peer in &discovered {
                // A node must never peer with itself, whatever discovery says.
                if peer.name == self.comm.name {
                    continue;
                }
                let Some(addr) = peer.addr() else { continue };
                if !peers.contains_key(&peer.name) {
                    peers.insert(peer.name.clone(), addr);
                    new_peers.push((peer.name.clone(), addr));
                }
            }
        }

        if new_peers.is_empty() {
            return;
        }
        slog::info!(self.logger, "new peers discovered: {:?}", new_peers.iter().map(|(n, _)| n).collect::<Vec<_>>());

        if self.comm.name != coordinator {
            return;
        }

        // Exactly one side initiates: the coordinator, and only when its
        // name also precedes the smallest newly observed one.
        let Some((merge_name, mut merge_ip)) = new_peers.iter().min_by(|a, b| a.0.cmp(&b.0)).cloned() else {
            return;
        };
        if self.comm.name >= merge_name {
            return;
        }

        // Confirm the target's address by name before the exchange.
        if let Some(addr) = self.provider.resolve(&merge_name).await.and_then(|peer| peer.addr()) {
            if addr != merge_ip {
                slog::info!(self.logger, "peer {} moved to {} since discovery", merge_name, addr);
                self.peers.lock().await.insert(merge_name.clone(), addr);
                merge_ip = addr;
            }
        }

        let _merging = self.merging.lock().await;
        slog::info!(self.logger, "merging state with new peer {} ({})", merge_name, merge_ip);
        self.merge_with(merge_ip).await;

        let peers = self.peers().await;
        for (_, ip) in peers {
            if ip == merge_ip {
                continue;
            }
            self.push_state(ip).await;
        }
    }

    async fn merge_with(&self, peer_ip: IpAddr) {
        let dump = self.state.export().await;
        let msg = Message::new(MessageType::MergeState, self.comm.ip, peer_ip, MergeEnvelope::wrap(dump));
        match self.comm.request(peer_ip, msg, MERGE_TIMEOUT).await {
            Ok(response) => {
                let dump = MergeEnvelope::unwrap(response.payload);
                if !dump.is_null() {
                    self.state.import(dump, peer_ip).await;
                }
            }
            Err(err) => {
                slog::warn!(self.logger, "merge with {} failed: {}", peer_ip, err);
            }
        }
    }

    async fn push_state(&self, peer_ip: IpAddr) {
        let dump = self.state.export().await;
        let msg = Message::new(MessageType::SendState, self.comm.ip, peer_ip, MergeEnvelope::wrap(dump));
        if self.comm.notify(peer_ip, msg).await.is_err() {
            slog::warn!(self.logger, "state push to {} failed", peer_ip);
        }
    }
}

#[async_trait]
impl<S: GossipState> MessageHandler for Gossip<S> {
    async fn handle(&self, msg: Message) -> Option<Message> {
        let origin = msg.src_ip()?;
        match msg.header.msg_type {
            MessageType::GossipUpdate => {
                let result = {
                    let _merging = self.merging.lock().await;
                    self.state.apply(msg.payload.clone(), origin).await
                };
                match result {
                    Ok(()) => Some(Message::ack_to(&msg, self.comm.ip, serde_json::json!({"success": true}))),
                    Err(err) => {
                        slog::warn!(self.logger, "failed to apply gossip update from {}: {}", origin, err);
                        Some(Message::error_to(&msg, self.comm.ip, err.to_string()))
                    }
                }
            }
            MessageType::MergeState => {
                let _merging = self.merging.lock().await;
                let dump = MergeEnvelope::unwrap(msg.payload.clone());
                if !dump.is_null() {
                    self.state.import(dump, origin).await;
                }
                let own = self.state.export().await;
                Some(Message::ack_to(&msg, self.comm.ip, MergeEnvelope::wrap(own)))
            }
            MessageType::SendState => {
                let _merging = self.merging.lock().await;
                let dump = MergeEnvelope::unwrap(msg.payload.clone());
                if !dump.is_null() {
                    self.state.import(dump, origin).await;
                }
                None
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::NodeConfig;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    /// Replicated set of strings; updates are {op, value}.
    #[derive(Default)]
    struct SetState {
        values: Mutex<std::collections::BTreeSet<String>>,
    }

    #[async_trait]
    impl GossipState for SetState {
        async fn export(&self) -> Value {
            let values: Vec<String> = self.values.lock().unwrap().iter().cloned().collect();
            serde_json::json!({ "values": values })
        }

        async fn import(&self, dump: Value, _origin: IpAddr) {
            if let Some(items) = dump.get("values").and_then(Value::as_array) {
                let mut values = self.values.lock().unwrap();
                for item in items.iter().filter_map(Value::as_str) {
                    values.insert(item.to_string());
                }
            }
        }

        async fn apply(&self, update: Value, _origin: IpAddr) -> Result<(), crate::BoxError> {
            let op = update.get("op").and_then(Value::as_str).unwrap_or_default();
            let value = update.get("value").and_then(Value::as_str).unwrap_or_default().to_string();
            let mut values = self.values.lock().unwrap();
            match op {
                "add" => {
                    values.insert(value);
                }
                "delete" => {
                    values.remove(&value);
                }
                other => return Err(format!("unknown op {other:?}").into()),
            }
            Ok(())
        }
    }

    struct FixedPeers(Vec<NodeRef>);

    #[async_trait]
    impl PeerProvider for FixedPeers {
        async fn discover(&self) -> Vec<NodeRef> {
            self.0.clone()
        }

        async fn resolve(&self, name: &str) -> Option<NodeRef> {
            self.0.iter().find(|peer| peer.name == name).cloned()
        }
    }

    struct SwappablePeers(Arc<Mutex<Vec<NodeRef>>>);

    #[async_trait]
    impl PeerProvider for SwappablePeers {
        async fn discover(&self) -> Vec<NodeRef> {
            self.0.lock().unwrap().clone()
        }

        async fn resolve(&self, name: &str) -> Option<NodeRef> {
            self.0.lock().unwrap().iter().find(|peer| peer.name == name).cloned()
        }
    }

    fn engine(name: &str, peers: Vec<NodeRef>) -> (Arc<Gossip<SetState>>, Arc<SetState>) {
        let config = NodeConfig::with_subnet(name, "127.0.0.1".parse().unwrap(), "127.0.0.0/30".parse().unwrap());
        let comm = Comm::new(&config);
        let state = Arc::new(SetState::default());
        let gossip = Gossip::new(comm, Arc::clone(&state), Box::new(FixedPeers(peers)), Duration::from_secs(5));
        (gossip, state)
    }

    fn peer(name: &str, ip: &str) -> NodeRef {
        NodeRef {
            name: name.to_string(),
            ip: ip.to_string(),
        }
    }

    #[tokio::test]
    async fn refresh_adds_and_evicts_peers() {
        let config = NodeConfig::with_subnet("node-b", "127.0.0.1".parse().unwrap(), "127.0.0.0/30".parse().unwrap());
        // node-a sorts before node-b, so this engine never coordinates a
        // merge and the test stays local
        let discovered = Arc::new(Mutex::new(vec![peer("node-a", "10.0.0.3")]));
        let gossip = Gossip::new(
            Comm::new(&config),
            Arc::new(SetState::default()),
            Box::new(SwappablePeers(Arc::clone(&discovered))),
            Duration::from_secs(5),
        );

        gossip.refresh_peers().await;
        assert_eq!(gossip.peers().await.len(), 1);

        // The peer misses the next discovery cycle and is evicted.
        discovered.lock().unwrap().clear();
        gossip.refresh_peers().await;
        assert!(gossip.peers().await.is_empty());
    }

    #[tokio::test]
    async fn own_name_never_becomes_a_peer() {
        let (gossip, _) = engine("node-b", vec![peer("node-b", "10.0.0.2"), peer("node-a", "10.0.0.3")]);
        gossip.refresh_peers().await;
        let peers = gossip.peers().await;
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].0, "node-a");
    }

    #[tokio::test]
    async fn apply_is_idempotent() {
        let (_, state) = engine("node-a", vec![]);
        let update = serde_json::json!({"op": "add", "value": "x"});
        let origin: IpAddr = "10.0.0.9".parse().unwrap();
        state.apply(update.clone(), origin).await.unwrap();
        state.apply(update, origin).await.unwrap();
        assert_eq!(state.values.lock().unwrap().len(), 1);

        // delete of a missing value is a no-op
        let gone = serde_json::json!({"op": "delete", "value": "y"});
        state.apply(gone, origin).await.unwrap();
        assert_eq!(state.values.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn gossip_update_handler_acks() {
        let (gossip, state) = engine("node-a", vec![]);
        let msg = Message::new(
            MessageType::GossipUpdate,
            "10.0.0.9".parse().unwrap(),
            "127.0.0.1".parse().unwrap(),
            serde_json::json!({"op": "add", "value": "x"}),
        );
        let ack = gossip.handle(msg).await.unwrap();
        assert_eq!(ack.header.msg_type, MessageType::GossipUpdateAck);
        assert!(ack.is_ok());
        assert!(state.values.lock().unwrap().contains("x"));
    }

    #[tokio::test]
    async fn merge_state_handler_returns_own_dump() {
        let (gossip, state) = engine("node-a", vec![]);
        state.values.lock().unwrap().insert("mine".to_string());

        let msg = Message::new(
            MessageType::MergeState,
            "10.0.0.9".parse().unwrap(),
            "127.0.0.1".parse().unwrap(),
            serde_json::json!({"state": {"values": ["theirs"]}}),
        );
        let ack = gossip.handle(msg).await.unwrap();
        assert_eq!(ack.header.msg_type, MessageType::MergeStateAck);

        // Both sides' values are present locally, and the ack carries the
        // combined dump for the initiator to import.
        let values = state.values.lock().unwrap().clone();
        assert!(values.contains("mine") && values.contains("theirs"));
        let dump: Vec<String> = serde_json::from_value(ack.payload["state"]["values"].clone()).unwrap();
        assert!(dump.contains(&"mine".to_string()) && dump.contains(&"theirs".to_string()));
    }
}
