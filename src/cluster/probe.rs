//! Subnet sweeps: heartbeat every host address in parallel and collect the
//! registries that answer.

use super::{NodeRef, NodeRole};
use crate::options::NodeConfig;
use crate::proto::{Message, MessageType};
use crate::transport::Comm;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// The heartbeat payload every node advertises while probing, and that
/// registries upsert into their membership table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct HeartbeatPayload {
    pub(crate) name: String,
    pub(crate) ip: String,
    pub(crate) role: NodeRole,
}

/// Sweeps a subnet with heartbeats on behalf of one node.
pub(crate) struct SubnetProber {
    comm: Arc<Comm>,
    hosts: Vec<IpAddr>,
    role: NodeRole,
    timeout: Duration,
    workers: usize,
}

impl SubnetProber {
    /// A prober advertising `role` over the subnet in `config`. The node's
    /// own address is excluded from the sweep.
    pub(crate) fn new(comm: Arc<Comm>, config: &NodeConfig, role: NodeRole) -> Self {
        let hosts = config.subnet.hosts().filter(|ip| *ip != config.ip).collect();
        SubnetProber {
            comm,
            hosts,
            role,
            timeout: config.probe_timeout,
            workers: config.probe_workers.max(1),
        }
    }

    /// One sweep: heartbeat every host with a bounded worker pool and return
    /// the `{name -> address}` map of registries that acked `OK`.
    pub(crate) async fn sweep(&self) -> HashMap<String, IpAddr> {
        let payload = HeartbeatPayload {
            name: self.comm.name.clone(),
            ip: self.comm.ip.to_string(),
            role: self.role,
        };
        let payload = match serde_json::to_value(&payload) {
            Ok(v) => v,
            Err(_) => return HashMap::new(),
        };

        let responses: Vec<Option<Message>> = futures_util::stream::iter(self.hosts.iter().copied())
            .map(|host| {
                let msg = Message::new(MessageType::DiscoveryHeartbeat, self.comm.ip, host, payload.clone());
                async move { self.comm.request(host, msg, self.timeout).await.ok() }
            })
            .buffer_unordered(self.workers)
            .collect()
            .await;

        let mut found = HashMap::new();
        for response in responses.into_iter().flatten() {
            if !response.is_ok() {
                continue;
            }
            let Ok(peer) = response.parse_payload::<NodeRef>() else {
                continue;
            };
            let Some(addr) = peer.addr() else { continue };
            found.insert(peer.name, addr);
        }
        found
    }
}
