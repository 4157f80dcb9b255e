//! The routing node: terminates FTP control connections, owns per-session
//! state, and forwards each command line to a processing node.

use super::codec::FtpCodec;
use super::reply::{Reply, ReplyCode};
use super::session::{ReplySink, SessionState, SessionTable};
use crate::cluster::NodeRole;
use crate::cluster::gossip::{Gossip, GossipState};
use crate::cluster::locator::{Locator, LocatorPeers};
use crate::error::ServerError;
use crate::options::{COMMAND_TIMEOUT, NodeConfig};
use crate::proto::{Message, MessageType};
use crate::transport::{Comm, MessageHandler, Router};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::codec::{FramedRead, FramedWrite};

/// Gossip plug for the session table.
pub(crate) struct RoutingState {
    sessions: Arc<SessionTable>,
}

#[derive(Deserialize)]
struct SessionDump {
    sessions: Vec<SessionState>,
}

#[async_trait]
impl GossipState for RoutingState {
    async fn export(&self) -> Value {
        serde_json::json!({ "sessions": self.sessions.all_states().await })
    }

    async fn import(&self, dump: Value, _origin: IpAddr) {
        let Ok(dump) = serde_json::from_value::<SessionDump>(dump) else {
            return;
        };
        for session in dump.sessions {
            self.sessions.import(session).await;
        }
    }

    async fn apply(&self, update: Value, _origin: IpAddr) -> Result<(), crate::BoxError> {
        let op = update.get("op").and_then(Value::as_str).unwrap_or_default();
        match op {
            "add" => {
                let session: SessionState = serde_json::from_value(update.get("session").cloned().unwrap_or(Value::Null))?;
                self.sessions.import(session).await;
            }
            "delete" => {
                let Some(session_id) = update.get("session_id").and_then(Value::as_str) else {
                    return Err("delete update without session_id".into());
                };
                self.sessions.remove(session_id).await;
            }
            other => return Err(format!("unknown session op {other:?}").into()),
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct ProcessAck {
    code: u16,
    message: String,
    #[serde(default)]
    session: Option<SessionState>,
}

/// A routing node. Listens for FTP clients, serializes their session state,
/// and drives the command loop against the cluster's processing nodes.
pub struct RoutingNode {
    comm: Arc<Comm>,
    locator: Arc<Locator>,
    gossip: Arc<Gossip<RoutingState>>,
    sessions: Arc<SessionTable>,
    ftp_port: u16,
    logger: slog::Logger,
}

impl RoutingNode {
    /// Builds a routing node that will accept FTP clients on `ftp_port`.
    pub fn new(config: NodeConfig, ftp_port: u16) -> Arc<Self> {
        let comm = Comm::new(&config);
        let sessions = Arc::new(SessionTable::new());
        let state = Arc::new(RoutingState {
            sessions: Arc::clone(&sessions),
        });
        let locator = Locator::new(Arc::clone(&comm), &config, NodeRole::Routing);
        let provider = LocatorPeers {
            locator: Arc::clone(&locator),
            role: NodeRole::Routing,
            own_name: config.name.clone(),
        };
        let gossip = Gossip::new(Arc::clone(&comm), state, Box::new(provider), config.heartbeat_interval);
        let logger = comm.logger.clone();
        Arc::new(RoutingNode {
            comm,
            locator,
            gossip,
            sessions,
            ftp_port,
            logger,
        })
    }

    /// Serves the control port and the FTP listener, plus the discovery and
    /// gossip loops.
    pub async fn serve(self: &Arc<Self>) -> Result<(), ServerError> {
        let mut router = Router::new();
        router.register(MessageType::DataReady, Arc::clone(self) as Arc<dyn MessageHandler>);
        self.gossip.register(&mut router);

        let server = self.comm.serve(router).await?;
        self.locator.spawn();
        self.gossip.spawn();

        let listener = TcpListener::bind((self.comm.ip, self.ftp_port)).await?;
        slog::info!(self.logger, "FTP listening on {}:{}", self.comm.ip, self.ftp_port);
        let node = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let node = Arc::clone(&node);
                        tokio::spawn(async move {
                            node.handle_client(stream, peer.ip()).await;
                        });
                    }
                    Err(err) => {
                        slog::warn!(node.logger, "failed to accept FTP connection: {}", err);
                    }
                }
            }
        });

        server.await.map_err(|_| ServerError::Terminated)
    }

    async fn handle_client(self: Arc<Self>, stream: tokio::net::TcpStream, client_ip: IpAddr) {
        slog::info!(self.logger, "FTP client connected from {}", client_ip);

        // Sessions gossiped by peer routing nodes are not resumed; they are
        // surfaced here so reconnects can be traced across the cluster.
        let prior = self.sessions.by_client(&client_ip.to_string()).await;
        if !prior.is_empty() {
            slog::info!(self.logger, "client {} has {} earlier session(s) on record", client_ip, prior.len());
        }

        let (read_half, write_half) = stream.into_split();
        let mut lines = FramedRead::new(read_half, FtpCodec::new());
        let sink: ReplySink = Arc::new(tokio::sync::Mutex::new(FramedWrite::new(write_half, FtpCodec::new())));

        let state = SessionState::new(client_ip);
        let session_id = state.session_id.clone();
        self.sessions.insert(state.clone(), Arc::clone(&sink)).await;
        self.gossip
            .notify_local_change(serde_json::json!({"op": "add", "session": state}))
            .await;

        let _ = Self::write_reply(&sink, Reply::new(ReplyCode::ServiceReady, "Distributed FTP Server Ready")).await;

        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    slog::warn!(self.logger, "control channel read error for {}: {}", client_ip, err);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            if self.dispatch_line(&session_id, &line, &sink).await {
                break;
            }
        }

        // disconnect (or QUIT) tears the session down
        self.sessions.remove(&session_id).await;
        self.gossip
            .notify_local_change(serde_json::json!({"op": "delete", "session_id": session_id}))
            .await;
        slog::info!(self.logger, "session for {} closed", client_ip);
    }

    /// Forwards one command line. Returns true when the session must close.
    async fn dispatch_line(&self, session_id: &str, line: &str, sink: &ReplySink) -> bool {
        let Some(state) = self.sessions.get_state(session_id).await else {
            return true;
        };

        let candidates = self.locator.query_by_role(NodeRole::Processing).await;
        if candidates.is_empty() {
            slog::warn!(self.logger, "no processing nodes available");
            let _ = Self::write_reply(sink, Reply::new(ReplyCode::ServiceNotAvailable, "Service not available")).await;
            return true;
        }

        for candidate in &candidates {
            let Some(ip) = candidate.addr() else { continue };
            let msg = Message::new(
                MessageType::ProcessFtpCommand,
                self.comm.ip,
                ip,
                serde_json::json!({"line": line, "session": &state}),
            );
            match self.comm.request(ip, msg, COMMAND_TIMEOUT).await {
                Ok(response) => return self.apply_response(session_id, response, sink).await,
                Err(err) => {
                    slog::warn!(self.logger, "processing node {} failed: {}", candidate.name, err);
                    continue;
                }
            }
        }

        let _ = Self::write_reply(sink, Reply::new(ReplyCode::ServiceNotAvailable, "Service not available")).await;
        true
    }

    async fn apply_response(&self, session_id: &str, response: Message, sink: &ReplySink) -> bool {
        let ack: ProcessAck = match response.parse_payload() {
            Ok(ack) => ack,
            Err(err) => {
                slog::warn!(self.logger, "malformed processing ack: {}", err);
                let _ = Self::write_reply(sink, Reply::new(ReplyCode::LocalError, "Requested action aborted. Local error in processing")).await;
                return false;
            }
        };

        if let Some(updated) = &ack.session {
            if self.sessions.update_state(updated).await {
                self.gossip
                    .notify_local_change(serde_json::json!({"op": "add", "session": updated}))
                    .await;
            }
        }

        let _ = Self::write_reply(sink, Reply::raw(ack.code, ack.message)).await;
        ack.code == ReplyCode::ClosingControlConnection.as_u16()
    }

    async fn write_reply(sink: &ReplySink, reply: Reply) -> Result<(), crate::proto::ProtoError> {
        let mut framed = sink.lock().await;
        framed.send(reply).await
    }

    /// Out-of-band ready signal from a storage node: write `150` on the
    /// session's control socket so the client starts its data transfer.
    async fn handle_data_ready(&self, msg: &Message) -> Message {
        #[derive(Deserialize)]
        struct Payload {
            session_id: String,
        }
        let Ok(payload) = msg.parse_payload::<Payload>() else {
            return Message::ack_to(msg, self.comm.ip, serde_json::json!({"success": false}));
        };
        let Some(sink) = self.sessions.sink(&payload.session_id).await else {
            slog::warn!(self.logger, "DATA_READY for unknown session {}", payload.session_id);
            return Message::ack_to(msg, self.comm.ip, serde_json::json!({"success": false}));
        };

        let reply = Reply::new(ReplyCode::FileStatusOkay, "Data connection ready");
        let success = Self::write_reply(&sink, reply).await.is_ok();
        slog::info!(self.logger, "sent 150 for session {}: {}", payload.session_id, success);
        Message::ack_to(msg, self.comm.ip, serde_json::json!({"success": success}))
    }
}

#[async_trait]
impl MessageHandler for RoutingNode {
    async fn handle(&self, msg: Message) -> Option<Message> {
        match msg.header.msg_type {
            MessageType::DataReady => Some(self.handle_data_ready(&msg).await),
            _ => None,
        }
    }
}
