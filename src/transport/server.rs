//! The control-port TCP server: decode one envelope, dispatch by type,
//! write the handler's response.

use super::{Comm, TransportError};
use crate::proto::{EnvelopeCodec, Message, MessageType};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

/// A handler for one or more message types. Nodes implement this once and
/// register the same instance for every type they serve.
#[async_trait]
pub(crate) trait MessageHandler: Send + Sync {
    /// Processes `msg`, returning the response to write back, if any.
    async fn handle(&self, msg: Message) -> Option<Message>;
}

/// Dispatch table from message type to handler.
#[derive(Default)]
pub(crate) struct Router {
    handlers: HashMap<MessageType, Arc<dyn MessageHandler>>,
}

impl Router {
    pub(crate) fn new() -> Self {
        Router { handlers: HashMap::new() }
    }

    /// Registers `handler` for `msg_type`. Later registrations win.
    pub(crate) fn register(&mut self, msg_type: MessageType, handler: Arc<dyn MessageHandler>) {
        self.handlers.insert(msg_type, handler);
    }

    async fn dispatch(&self, msg: Message) -> Option<Message> {
        match self.handlers.get(&msg.header.msg_type) {
            Some(handler) => handler.handle(msg).await,
            None => None,
        }
    }
}

impl Comm {
    /// Binds the control port and serves inbound messages until the returned
    /// task is aborted. Each accepted connection runs on its own task.
    pub(crate) async fn serve(self: &Arc<Self>, router: Router) -> Result<JoinHandle<()>, TransportError> {
        let listener = TcpListener::bind((self.ip, self.control_port)).await.map_err(|source| TransportError::Io {
            peer: self.ip,
            source,
        })?;
        let comm = Arc::clone(self);
        let router = Arc::new(router);
        slog::info!(comm.logger, "control port listening"; "addr" => %self.ip, "port" => self.control_port);

        Ok(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let comm = Arc::clone(&comm);
                        let router = Arc::clone(&router);
                        tokio::spawn(async move {
                            comm.serve_connection(stream, router).await;
                        });
                    }
                    Err(err) => {
                        slog::warn!(comm.logger, "failed to accept control connection: {}", err);
                    }
                }
            }
        }))
    }

    async fn serve_connection(&self, stream: TcpStream, router: Arc<Router>) {
        let peer = stream.peer_addr().ok();
        let mut framed = Framed::new(stream, EnvelopeCodec::new());

        let msg = match framed.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(err)) => {
                slog::warn!(self.logger, "dropping undecodable message: {}", err; "peer" => ?peer);
                return;
            }
            None => return,
        };

        let msg_type = msg.header.msg_type;
        slog::debug!(self.logger, "received message"; "type" => %msg_type, "src" => %msg.header.src);

        if let Some(response) = router.dispatch(msg).await {
            if let Err(err) = framed.send(response).await {
                slog::warn!(self.logger, "failed to send {} response: {}", msg_type, err; "peer" => ?peer);
            }
        }
    }
}
