//! The auth node: answers credential checks from a gossip-replicated user
//! table.

mod store;

pub use store::UserRecord;

use crate::cluster::NodeRole;
use crate::cluster::gossip::Gossip;
use crate::cluster::locator::{Locator, LocatorPeers};
use crate::error::ServerError;
use crate::options::NodeConfig;
use crate::proto::{Message, MessageType};
use crate::transport::{Comm, MessageHandler, Router};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use store::{UserStore, UserUpdate};

/// A node that validates usernames and bcrypt passwords for the cluster.
///
/// The user table is held in memory, snapshotted to a JSON file on every
/// mutation, and replicated to peer auth nodes through the gossip engine.
pub struct AuthNode {
    comm: Arc<Comm>,
    locator: Arc<Locator>,
    gossip: Arc<Gossip<UserStore>>,
    store: Arc<UserStore>,
    logger: slog::Logger,
}

impl AuthNode {
    /// Builds an auth node persisting its users at `users_file`. Two sample
    /// users are seeded when the file does not exist yet.
    pub async fn new(config: NodeConfig, users_file: impl Into<PathBuf>) -> Result<Arc<Self>, ServerError> {
        let comm = Comm::new(&config);
        let store = UserStore::open(users_file.into(), comm.logger.clone()).await?;
        let locator = Locator::new(Arc::clone(&comm), &config, NodeRole::Auth);
        let provider = LocatorPeers {
            locator: Arc::clone(&locator),
            role: NodeRole::Auth,
            own_name: config.name.clone(),
        };
        let gossip = Gossip::new(Arc::clone(&comm), Arc::clone(&store), Box::new(provider), config.heartbeat_interval);
        let logger = comm.logger.clone();
        Ok(Arc::new(AuthNode {
            comm,
            locator,
            gossip,
            store,
            logger,
        }))
    }

    /// Serves the control port and runs the discovery and gossip loops.
    pub async fn serve(self: &Arc<Self>) -> Result<(), ServerError> {
        let mut router = Router::new();
        let this = Arc::clone(self) as Arc<dyn MessageHandler>;
        router.register(MessageType::AuthValidateUser, Arc::clone(&this));
        router.register(MessageType::AuthValidatePassword, this);
        self.gossip.register(&mut router);

        let server = self.comm.serve(router).await?;
        self.locator.spawn();
        self.gossip.spawn();

        server.await.map_err(|_| ServerError::Terminated)
    }

    /// Adds a user, hashing `password` with bcrypt. Fails when the name is
    /// taken. The change is broadcast to peer auth nodes.
    pub async fn add_user(&self, username: &str, password: &str) -> Result<bool, ServerError> {
        let record = Self::hash_record(username, password).await?;
        if !self.store.insert(record.clone()).await {
            return Ok(false);
        }
        self.broadcast("add", record).await;
        Ok(true)
    }

    /// Replaces a user's password (or creates the user).
    pub async fn update_user(&self, username: &str, password: &str) -> Result<(), ServerError> {
        let record = Self::hash_record(username, password).await?;
        self.store.upsert(record.clone()).await;
        self.broadcast("add", record).await;
        Ok(())
    }

    /// Deletes a user if present.
    pub async fn delete_user(&self, username: &str) {
        self.store.remove(username).await;
        let record = UserRecord {
            username: username.to_string(),
            password: String::new(),
        };
        self.broadcast("delete", record).await;
    }

    async fn hash_record(username: &str, password: &str) -> Result<UserRecord, ServerError> {
        let username = username.to_string();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || {
            let hash = bcrypt::hash(password, bcrypt::DEFAULT_COST).map_err(|e| ServerError::Transport(e.to_string()))?;
            Ok(UserRecord { username, password: hash })
        })
        .await
        .map_err(|e| ServerError::Transport(e.to_string()))?
    }

    async fn broadcast(&self, op: &str, user: UserRecord) {
        let update = serde_json::to_value(UserUpdate { op: op.to_string(), user }).unwrap_or_default();
        self.gossip.notify_local_change(update).await;
    }

    async fn handle_validate_user(&self, msg: &Message) -> Message {
        #[derive(Deserialize)]
        struct Payload {
            username: String,
        }
        let Ok(payload) = msg.parse_payload::<Payload>() else {
            return Message::error_to(msg, self.comm.ip, "Missing username");
        };
        let result = self.store.exists(&payload.username).await;
        slog::info!(self.logger, "validate user {:?}: {}", payload.username, result);
        Message::ack_to(msg, self.comm.ip, serde_json::json!({ "result": result }))
    }

    async fn handle_validate_password(&self, msg: &Message) -> Message {
        #[derive(Deserialize)]
        struct Payload {
            username: String,
            password: String,
        }
        let Ok(payload) = msg.parse_payload::<Payload>() else {
            return Message::error_to(msg, self.comm.ip, "Missing credentials");
        };
        let result = self.store.verify(&payload.username, &payload.password).await;
        slog::info!(self.logger, "validate password for {:?}: {}", payload.username, result);
        Message::ack_to(msg, self.comm.ip, serde_json::json!({ "result": result }))
    }
}

#[async_trait]
impl MessageHandler for AuthNode {
    async fn handle(&self, msg: Message) -> Option<Message> {
        let response = match msg.header.msg_type {
            MessageType::AuthValidateUser => self.handle_validate_user(&msg).await,
            MessageType::AuthValidatePassword => self.handle_validate_password(&msg).await,
            _ => return None,
        };
        Some(response)
    }
}
