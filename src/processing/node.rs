//! The processing node: a stateless FTP-verb executor.
//!
//! The only state it keeps is the transient `session_id -> routing node`
//! map needed to thread asynchronous `DATA_READY` signals back to the
//! routing node that owns the control socket.

use super::command::Command;
use super::handlers;
use crate::cluster::locator::Locator;
use crate::cluster::{NodeRef, NodeRole};
use crate::error::ServerError;
use crate::options::{DATA_READY_TIMEOUT, NodeConfig};
use crate::proto::{Message, MessageType};
use crate::routing::SessionState;
use crate::routing::reply::ReplyCode;
use crate::transport::{Comm, MessageHandler, Router};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// A processing node: parses command lines, dispatches on the verb, and
/// consults auth and storage nodes to build the RFC 959 reply.
pub struct ProcessingNode {
    pub(crate) comm: Arc<Comm>,
    pub(crate) locator: Arc<Locator>,
    sessions: DashMap<String, IpAddr>,
    pub(crate) logger: slog::Logger,
}

impl ProcessingNode {
    /// Builds a processing node from `config`.
    pub fn new(config: NodeConfig) -> Arc<Self> {
        let comm = Comm::new(&config);
        let locator = Locator::new(Arc::clone(&comm), &config, NodeRole::Processing);
        let logger = comm.logger.clone();
        Arc::new(ProcessingNode {
            comm,
            locator,
            sessions: DashMap::new(),
            logger,
        })
    }

    /// Serves the control port and runs the discovery loop.
    pub async fn serve(self: &Arc<Self>) -> Result<(), ServerError> {
        let mut router = Router::new();
        let this = Arc::clone(self) as Arc<dyn MessageHandler>;
        router.register(MessageType::ProcessFtpCommand, Arc::clone(&this));
        router.register(MessageType::DataReady, this);

        let server = self.comm.serve(router).await?;
        self.locator.spawn();

        server.await.map_err(|_| ServerError::Terminated)
    }

    /// The live nodes of `role`, per the discovery fabric.
    pub(crate) async fn nodes(&self, role: NodeRole) -> Vec<NodeRef> {
        self.locator.query_by_role(role).await
    }

    /// One request to one node.
    pub(crate) async fn ask(&self, ip: IpAddr, msg_type: MessageType, payload: Value, timeout: Duration) -> Option<Message> {
        let msg = Message::new(msg_type, self.comm.ip, ip, payload);
        match self.comm.request(ip, msg, timeout).await {
            Ok(response) => Some(response),
            Err(err) => {
                slog::warn!(self.logger, "request {} to {} failed: {}", msg_type, ip, err);
                None
            }
        }
    }

    /// Iterates `nodes` until one responds at all; failover for transient
    /// peer loss. The response may still carry an error status.
    pub(crate) async fn ask_first(&self, nodes: &[NodeRef], msg_type: MessageType, payload: Value, timeout: Duration) -> Option<Message> {
        for node in nodes {
            let Some(ip) = node.addr() else { continue };
            if let Some(response) = self.ask(ip, msg_type, payload.clone(), timeout).await {
                return Some(response);
            }
        }
        None
    }

    /// Fire-and-forget to one node.
    pub(crate) async fn notify(&self, ip: IpAddr, msg_type: MessageType, payload: Value) {
        let msg = Message::new(msg_type, self.comm.ip, ip, payload);
        if self.comm.notify(ip, msg).await.is_err() {
            slog::debug!(self.logger, "notify {} to {} failed", msg_type, ip);
        }
    }

    async fn handle_process_command(&self, msg: &Message) -> Message {
        #[derive(Deserialize)]
        struct Payload {
            line: String,
            session: SessionState,
        }

        let reply = |code: u16, text: &str, session: Option<&SessionState>| {
            Message::ack_to(
                msg,
                self.comm.ip,
                serde_json::json!({"code": code, "message": text, "session": session}),
            )
        };

        let Ok(payload) = msg.parse_payload::<Payload>() else {
            return reply(ReplyCode::CommandSyntaxError.as_u16(), "Invalid command.", None);
        };
        let session = payload.session;

        // Remember which routing node drives this session so DATA_READY can
        // find its way back.
        if let Some(routing_ip) = msg.src_ip() {
            self.sessions.insert(session.session_id.clone(), routing_ip);
        }

        let cmd = Command::parse(&payload.line);
        slog::info!(self.logger, "processing {:?} for session {}", cmd.verb(), session.session_id);

        if cmd.is_empty() {
            return reply(ReplyCode::CommandSyntaxError.as_u16(), "Empty command.", None);
        }

        let Some((requires_auth, handler)) = handlers::lookup(cmd.verb()) else {
            return reply(ReplyCode::CommandSyntaxError.as_u16(), "Syntax error, command unrecognized.", None);
        };
        if requires_auth && !session.authenticated {
            return reply(ReplyCode::NotLoggedIn.as_u16(), "Not logged in.", None);
        }

        let outcome = handler.handle(self, &cmd, session).await;
        reply(outcome.code.as_u16(), &outcome.message, outcome.session.as_ref())
    }

    /// Relays a storage node's ready signal to the routing node that owns
    /// the session, and reports back whether the `150` went out.
    async fn handle_data_ready(&self, msg: &Message) -> Message {
        #[derive(Deserialize)]
        struct Payload {
            session_id: String,
        }
        let failure = |reason: &str| {
            slog::warn!(self.logger, "DATA_READY relay failed: {}", reason);
            Message::ack_to(msg, self.comm.ip, serde_json::json!({"success": false}))
        };

        let Ok(payload) = msg.parse_payload::<Payload>() else {
            return failure("missing session_id");
        };
        let Some(routing_ip) = self.sessions.get(&payload.session_id).map(|e| *e.value()) else {
            return failure("no routing node registered for session");
        };

        let forward = Message::new(
            MessageType::DataReady,
            self.comm.ip,
            routing_ip,
            serde_json::json!({"session_id": payload.session_id}),
        );
        match self.comm.request(routing_ip, forward, DATA_READY_TIMEOUT).await {
            Ok(ack) => {
                let success = ack.payload.get("success").and_then(Value::as_bool).unwrap_or(false);
                Message::ack_to(msg, self.comm.ip, serde_json::json!({"success": success}))
            }
            Err(_) => failure("routing node did not acknowledge"),
        }
    }
}

#[async_trait]
impl MessageHandler for ProcessingNode {
    async fn handle(&self, msg: Message) -> Option<Message> {
        match msg.header.msg_type {
            MessageType::ProcessFtpCommand => Some(self.handle_process_command(&msg).await),
            MessageType::DataReady => Some(self.handle_data_ready(&msg).await),
            _ => None,
        }
    }
}
