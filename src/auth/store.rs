//! The replicated user table: bcrypt hashes in memory, persisted as a JSON
//! snapshot on every mutation.

use crate::cluster::gossip::GossipState;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

/// One credential record as persisted and replicated: `password` is a
/// bcrypt hash, never plaintext.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Login name; the table key.
    pub username: String,
    /// bcrypt hash of the password.
    pub password: String,
}

#[derive(Serialize, Deserialize, Default)]
struct UserFile {
    users: Vec<UserRecord>,
}

/// The in-memory user table with its JSON snapshot file.
pub(crate) struct UserStore {
    path: PathBuf,
    users: RwLock<HashMap<String, String>>,
    logger: slog::Logger,
}

impl UserStore {
    /// Opens the store at `path`, seeding two sample users when no snapshot
    /// exists yet.
    pub(crate) async fn open(path: PathBuf, logger: slog::Logger) -> std::io::Result<Arc<Self>> {
        let users = match tokio::fs::read(&path).await {
            Ok(raw) => {
                let file: UserFile = serde_json::from_slice(&raw).unwrap_or_default();
                file.users.into_iter().map(|u| (u.username, u.password)).collect()
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let seeded = Self::sample_users().await?;
                seeded.into_iter().map(|u| (u.username, u.password)).collect()
            }
            Err(err) => return Err(err),
        };

        let store = Arc::new(UserStore {
            path,
            users: RwLock::new(users),
            logger,
        });
        store.persist().await?;
        Ok(store)
    }

    async fn sample_users() -> std::io::Result<Vec<UserRecord>> {
        tokio::task::spawn_blocking(|| {
            let hash = |pw: &str| bcrypt::hash(pw, bcrypt::DEFAULT_COST).map_err(|e| std::io::Error::other(e.to_string()));
            Ok(vec![
                UserRecord {
                    username: "test".to_string(),
                    password: hash("test123")?,
                },
                UserRecord {
                    username: "admin".to_string(),
                    password: hash("admin123")?,
                },
            ])
        })
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))?
    }

    pub(crate) async fn exists(&self, username: &str) -> bool {
        self.users.read().await.contains_key(username)
    }

    /// bcrypt check of `password` against the stored hash. The hash runs on
    /// the blocking pool.
    pub(crate) async fn verify(&self, username: &str, password: &str) -> bool {
        let Some(hash) = self.users.read().await.get(username).cloned() else {
            return false;
        };
        let password = password.to_string();
        tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash).unwrap_or(false))
            .await
            .unwrap_or(false)
    }

    /// Inserts `record` if the name is free. Returns false when taken.
    pub(crate) async fn insert(&self, record: UserRecord) -> bool {
        {
            let mut users = self.users.write().await;
            if users.contains_key(&record.username) {
                return false;
            }
            users.insert(record.username, record.password);
        }
        self.persist_logged().await;
        true
    }

    /// Inserts or replaces `record`.
    pub(crate) async fn upsert(&self, record: UserRecord) {
        self.users.write().await.insert(record.username, record.password);
        self.persist_logged().await;
    }

    /// Removes `username` if present.
    pub(crate) async fn remove(&self, username: &str) -> bool {
        let removed = self.users.write().await.remove(username).is_some();
        if removed {
            self.persist_logged().await;
        }
        removed
    }

    pub(crate) async fn export_users(&self) -> Vec<UserRecord> {
        let users = self.users.read().await;
        let mut records: Vec<UserRecord> = users
            .iter()
            .map(|(username, password)| UserRecord {
                username: username.clone(),
                password: password.clone(),
            })
            .collect();
        records.sort_by(|a, b| a.username.cmp(&b.username));
        records
    }

    async fn persist_logged(&self) {
        if let Err(err) = self.persist().await {
            slog::error!(self.logger, "failed to persist user table: {}", err);
        }
    }

    /// Snapshot to disk: write a sibling tmp file, fsync, rename into place.
    async fn persist(&self) -> std::io::Result<()> {
        let file = UserFile {
            users: self.export_users().await,
        };
        let raw = serde_json::to_vec_pretty(&file).map_err(|e| std::io::Error::other(e.to_string()))?;

        let tmp = self.path.with_extension("json.tmp");
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut out = tokio::fs::File::create(&tmp).await?;
        out.write_all(&raw).await?;
        out.sync_all().await?;
        drop(out);
        tokio::fs::rename(&tmp, &self.path).await
    }
}

/// Delta replicated on every user mutation.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct UserUpdate {
    pub(crate) op: String,
    pub(crate) user: UserRecord,
}

#[async_trait]
impl GossipState for UserStore {
    async fn export(&self) -> Value {
        serde_json::json!({ "users": self.export_users().await })
    }

    async fn import(&self, dump: Value, _origin: IpAddr) {
        let Ok(file) = serde_json::from_value::<UserFile>(dump) else {
            return;
        };
        {
            let mut users = self.users.write().await;
            for record in file.users {
                users.insert(record.username, record.password);
            }
        }
        self.persist_logged().await;
    }

    async fn apply(&self, update: Value, _origin: IpAddr) -> Result<(), crate::BoxError> {
        let update: UserUpdate = serde_json::from_value(update)?;
        match update.op.as_str() {
            // add with an existing name is an update: last writer wins
            "add" => self.upsert(update.user).await,
            "delete" => {
                self.remove(&update.user.username).await;
            }
            other => return Err(format!("unknown user op {other:?}").into()),
        }
        Ok(())
    }
}
