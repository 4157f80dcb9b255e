//! The storage node: filesystem verbs for the cluster, PASV data sockets,
//! quorum-acknowledged store replication and lazy file healing.

use super::error::{FsError, FsErrorKind};
use super::fs::FsManager;
use super::meta::{FileMetadata, MetadataTable};
use crate::cluster::NodeRole;
use crate::cluster::gossip::{Gossip, GossipState};
use crate::cluster::locator::{Locator, LocatorPeers};
use crate::error::ServerError;
use crate::options::{
    CHUNK_SIZE, DATA_READY_TIMEOUT, MERGE_TIMEOUT, NodeConfig, PASV_ACCEPT_TIMEOUT, REPLICATE_ATTEMPTS, REPLICATE_BASE_TIMEOUT,
    REPLICATE_TIMEOUT_STEP, STORE_QUORUM_TIMEOUT, replication_factor,
};
use crate::proto::{Message, MessageType, Status};
use crate::transport::{Comm, MessageHandler, Router};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

#[derive(Deserialize)]
struct CwdPayload {
    user: String,
    current_path: String,
    new_path: String,
}

#[derive(Deserialize)]
struct PathPayload {
    user: String,
    #[serde(default = "virtual_root")]
    cwd: String,
    path: String,
    #[serde(default)]
    replica: bool,
}

#[derive(Deserialize)]
struct RemovePayload {
    user: String,
    #[serde(default = "virtual_root")]
    cwd: String,
    path: String,
    #[serde(rename = "type", default = "file_kind")]
    kind: String,
    #[serde(default)]
    replica: bool,
}

#[derive(Deserialize)]
struct RenamePayload {
    user: String,
    cwd: String,
    old_path: String,
    new_path: String,
    #[serde(default)]
    replica: bool,
}

#[derive(Deserialize)]
struct SessionPayload {
    session_id: String,
}

#[derive(Deserialize)]
struct ListPayload {
    session_id: String,
    user: String,
    #[serde(default = "virtual_root")]
    cwd: String,
    #[serde(default = "here")]
    path: String,
    #[serde(default)]
    detailed: bool,
}

#[derive(Deserialize)]
struct RetrPayload {
    session_id: String,
    user: String,
    cwd: String,
    path: String,
}

#[derive(Deserialize)]
struct StorePayload {
    session_id: String,
    user: String,
    cwd: String,
    path: String,
    version: u64,
    transfer_id: String,
    #[serde(default)]
    replicate_to: Vec<String>,
}

#[derive(Deserialize)]
struct MetaRequestPayload {
    #[serde(default)]
    filename: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct ReplicatePayload {
    filename: String,
    metadata: FileMetadata,
    user: String,
    cwd: String,
}

#[derive(Deserialize)]
struct ReplicateReadyPayload {
    ip: String,
    port: u16,
    filename: String,
    user: String,
    cwd: String,
}

#[derive(Deserialize)]
struct SyncRequestPayload {
    filename: String,
}

fn virtual_root() -> String {
    "/".to_string()
}

fn here() -> String {
    ".".to_string()
}

fn file_kind() -> String {
    "file".to_string()
}

/// What to do with a replicated or gossiped metadata entry.
enum Disposition {
    /// Same transfer id already present; nothing to do.
    Ignore,
    /// Store the entry (possibly under a `_copy` name after losing the
    /// conflict).
    Store(FileMetadata),
}

/// The replicated half of a storage node: metadata table, directory
/// structure, and the conflict/healing rules that keep replicas convergent.
pub(crate) struct StorageState {
    comm: Arc<Comm>,
    fs: Arc<FsManager>,
    meta: Arc<MetadataTable>,
    logger: slog::Logger,
}

#[derive(Serialize, Deserialize)]
struct DirEntry {
    user: String,
    path: String,
}

#[derive(Deserialize)]
struct StateDump {
    #[serde(default)]
    metadata: HashMap<String, FileMetadata>,
    #[serde(default)]
    directories: Vec<DirEntry>,
}

#[derive(Deserialize)]
struct MetaUpdate {
    op: String,
    meta: FileMetadata,
    #[serde(default)]
    origin: Option<String>,
}

impl StorageState {
    /// Decides where an incoming entry lands relative to any local entry of
    /// the same name, renaming the local loser on disk when needed.
    async fn resolve_incoming(&self, incoming: FileMetadata) -> Disposition {
        let Some(existing) = self.meta.get(&incoming.filename).await else {
            return Disposition::Store(incoming);
        };
        if existing.transfer_id == incoming.transfer_id {
            return Disposition::Ignore;
        }

        if incoming.is_newer_than(&existing) {
            // The local entry loses the unadorned name.
            if let Some((user, vpath)) = FileMetadata::split_key(&existing.filename) {
                let (user, vpath) = (user.to_string(), vpath.to_string());
                if let Ok(ns) = self.fs.namespace(&user).await {
                    let copy_virtual = self.fs.copy_name(&ns, &vpath).await;
                    if let Err(err) = self.fs.rename_path(&ns, "/", &vpath, &copy_virtual).await {
                        if err.kind() != FsErrorKind::NotFound {
                            slog::warn!(self.logger, "failed to park conflicting file {}: {}", vpath, err);
                        }
                    }
                    self.meta.rename(&existing.filename, &FileMetadata::key(&user, &copy_virtual)).await;
                }
            }
            Disposition::Store(incoming)
        } else {
            // The incoming entry loses and is parked under a copy name.
            let Some((user, vpath)) = FileMetadata::split_key(&incoming.filename) else {
                return Disposition::Ignore;
            };
            let (user, vpath) = (user.to_string(), vpath.to_string());
            let Ok(ns) = self.fs.namespace(&user).await else {
                return Disposition::Ignore;
            };
            let copy_virtual = self.fs.copy_name(&ns, &vpath).await;
            let mut parked = incoming;
            parked.filename = FileMetadata::key(&user, &copy_virtual);
            Disposition::Store(parked)
        }
    }

    /// Applies one metadata entry and heals the file from `origin` when the
    /// bytes are missing locally.
    async fn absorb_entry(&self, incoming: FileMetadata, origin: IpAddr) {
        match self.resolve_incoming(incoming).await {
            Disposition::Ignore => {}
            Disposition::Store(meta) => {
                self.meta.upsert(meta.clone()).await;
                self.sync_if_missing(meta, origin);
            }
        }
    }

    /// Spawns a background fetch of `meta`'s file from `origin` unless it
    /// already exists locally.
    fn sync_if_missing(&self, meta: FileMetadata, origin: IpAddr) {
        let Some((user, vpath)) = FileMetadata::split_key(&meta.filename) else {
            return;
        };
        let (user, vpath) = (user.to_string(), vpath.to_string());
        let comm = Arc::clone(&self.comm);
        let fs = Arc::clone(&self.fs);
        let logger = self.logger.clone();
        let filename = meta.filename.clone();

        tokio::spawn(async move {
            let Ok(ns) = fs.namespace(&user).await else { return };
            if fs.is_file(&ns, "/", &vpath).await {
                return;
            }
            slog::info!(logger, "file {} missing locally, syncing from {}", filename, origin);

            let request = Message::new(
                MessageType::DataSyncFileRequest,
                comm.ip,
                origin,
                serde_json::json!({ "filename": &filename }),
            );
            let ready = match comm.request(origin, request, MERGE_TIMEOUT).await {
                Ok(ready) if ready.is_ok() => ready,
                _ => {
                    slog::warn!(logger, "sync request for {} to {} failed", filename, origin);
                    return;
                }
            };
            let Some(port) = ready.payload.get("pasv_port").and_then(Value::as_u64) else {
                return;
            };

            match TcpStream::connect((origin, port as u16)).await {
                Ok(mut stream) => match fs.write_stream(&ns, "/", &vpath, &mut stream).await {
                    Ok((_, bytes)) => {
                        slog::info!(logger, "synced {} ({} bytes) from {}", filename, bytes, origin);
                    }
                    Err(err) => {
                        slog::warn!(logger, "failed to write synced file {}: {}", filename, err);
                    }
                },
                Err(err) => {
                    slog::warn!(logger, "failed to connect for sync of {}: {}", filename, err);
                }
            }
        });
    }
}

#[async_trait]
impl GossipState for StorageState {
    async fn export(&self) -> Value {
        let directories = match self.fs.export_tree().await {
            Ok(dirs) => dirs.into_iter().map(|(user, path)| DirEntry { user, path }).collect(),
            Err(err) => {
                slog::warn!(self.logger, "failed to export directory tree: {}", err);
                Vec::new()
            }
        };
        serde_json::json!({
            "metadata": self.meta.export_map().await,
            "directories": directories,
        })
    }

    async fn import(&self, dump: Value, origin: IpAddr) {
        let Ok(dump) = serde_json::from_value::<StateDump>(dump) else {
            return;
        };

        // Directories first, so synced files land in existing parents.
        for dir in dump.directories {
            let Ok(ns) = self.fs.namespace(&dir.user).await else { continue };
            if dir.path == "/" {
                continue;
            }
            match self.fs.make_dir(&ns, "/", &dir.path).await {
                Ok(_) => {}
                Err(err) if err.kind() == FsErrorKind::AlreadyExists => {}
                Err(err) => slog::warn!(self.logger, "failed to import directory {}: {}", dir.path, err),
            }
        }

        for (_, meta) in dump.metadata {
            self.absorb_entry(meta, origin).await;
        }
    }

    async fn apply(&self, update: Value, origin: IpAddr) -> Result<(), crate::BoxError> {
        let update: MetaUpdate = serde_json::from_value(update)?;
        if update.op != "add" {
            return Err(format!("unknown metadata op {:?}", update.op).into());
        }
        let origin = update.origin.and_then(|ip| ip.parse().ok()).unwrap_or(origin);
        self.absorb_entry(update.meta, origin).await;
        Ok(())
    }
}

/// A storage node: owns a per-user namespaced filesystem and serves the
/// cluster's `DATA_*` operations, including the PASV data plane.
pub struct StorageNode {
    comm: Arc<Comm>,
    locator: Arc<Locator>,
    gossip: Arc<Gossip<StorageState>>,
    state: Arc<StorageState>,
    pasv: Mutex<HashMap<String, TcpListener>>,
    logger: slog::Logger,
}

impl StorageNode {
    /// Builds a storage node rooted at `fs_root`. The directory is created
    /// when missing; the metadata snapshot lives beside the namespaces.
    pub async fn new(config: NodeConfig, fs_root: impl Into<PathBuf>) -> Result<Arc<Self>, ServerError> {
        let comm = Comm::new(&config);
        let fs_root = fs_root.into();
        let fs = Arc::new(
            FsManager::open(fs_root.clone())
                .await
                .map_err(|e| ServerError::StorageSetup(e.to_string()))?,
        );
        let meta = Arc::new(MetadataTable::open(fs_root.join("metadata.json"), comm.logger.clone()).await);
        let state = Arc::new(StorageState {
            comm: Arc::clone(&comm),
            fs,
            meta,
            logger: comm.logger.new(slog::o!("part" => "state")),
        });
        let locator = Locator::new(Arc::clone(&comm), &config, NodeRole::Data);
        let provider = LocatorPeers {
            locator: Arc::clone(&locator),
            role: NodeRole::Data,
            own_name: config.name.clone(),
        };
        let gossip = Gossip::new(Arc::clone(&comm), Arc::clone(&state), Box::new(provider), config.heartbeat_interval);
        let logger = comm.logger.clone();
        Ok(Arc::new(StorageNode {
            comm,
            locator,
            gossip,
            state,
            pasv: Mutex::new(HashMap::new()),
            logger,
        }))
    }

    /// Serves the control port and runs the discovery and gossip loops.
    pub async fn serve(self: &Arc<Self>) -> Result<(), ServerError> {
        let mut router = Router::new();
        let this = Arc::clone(self) as Arc<dyn MessageHandler>;
        for msg_type in [
            MessageType::DataCwd,
            MessageType::DataMkd,
            MessageType::DataRemove,
            MessageType::DataRename,
            MessageType::DataStat,
            MessageType::DataOpenPasv,
            MessageType::DataList,
            MessageType::DataRetrFile,
            MessageType::DataStoreFile,
            MessageType::DataMetaRequest,
            MessageType::DataReplicateFile,
            MessageType::DataReplicateReady,
            MessageType::DataSyncFileRequest,
        ] {
            router.register(msg_type, Arc::clone(&this));
        }
        self.gossip.register(&mut router);

        let server = self.comm.serve(router).await?;
        self.locator.spawn();
        self.gossip.spawn();

        server.await.map_err(|_| ServerError::Terminated)
    }

    fn fs(&self) -> &FsManager {
        &self.state.fs
    }

    fn meta(&self) -> &MetadataTable {
        &self.state.meta
    }

    fn fs_reply(&self, msg: &Message, err: &FsError) -> Message {
        Message::error_to(msg, self.comm.ip, err.user_message())
    }

    /// Re-sends a directory-shaped operation to every peer storage node so
    /// namespace structure converges without waiting for a merge. Runs in
    /// the background; the caller's ack must not wait on slow peers.
    fn fan_out(&self, msg_type: MessageType, mut payload: Value) {
        let comm = Arc::clone(&self.comm);
        let gossip = Arc::clone(&self.gossip);
        let logger = self.logger.clone();
        tokio::spawn(async move {
            if let Some(map) = payload.as_object_mut() {
                map.insert("replica".to_string(), Value::Bool(true));
            }
            for (name, ip) in gossip.peers().await {
                let msg = Message::new(msg_type, comm.ip, ip, payload.clone());
                if comm.notify(ip, msg).await.is_err() {
                    slog::debug!(logger, "failed to fan {} out to {} ({})", msg_type, name, ip);
                }
            }
        });
    }

    async fn handle_cwd(&self, msg: &Message) -> Message {
        let Ok(payload) = msg.parse_payload::<CwdPayload>() else {
            return Message::error_to(msg, self.comm.ip, "Missing required arguments");
        };
        let ns = match self.fs().namespace(&payload.user).await {
            Ok(ns) => ns,
            Err(err) => return self.fs_reply(msg, &err),
        };
        match self.fs().change_dir(&ns, &payload.current_path, &payload.new_path).await {
            Ok(virtual_path) => Message::ack_to(msg, self.comm.ip, serde_json::json!({ "cwd": virtual_path })),
            Err(err) => self.fs_reply(msg, &err),
        }
    }

    async fn handle_mkd(&self, msg: &Message) -> Message {
        let Ok(payload) = msg.parse_payload::<PathPayload>() else {
            return Message::error_to(msg, self.comm.ip, "Missing required arguments");
        };
        let ns = match self.fs().namespace(&payload.user).await {
            Ok(ns) => ns,
            Err(err) => return self.fs_reply(msg, &err),
        };
        match self.fs().make_dir(&ns, &payload.cwd, &payload.path).await {
            Ok(virtual_path) => {
                if !payload.replica {
                    self.fan_out(MessageType::DataMkd, msg.payload.clone());
                }
                Message::ack_to(msg, self.comm.ip, serde_json::json!({ "path": virtual_path }))
            }
            // replicas apply creates idempotently
            Err(err) if payload.replica && err.kind() == FsErrorKind::AlreadyExists => {
                Message::ack_to(msg, self.comm.ip, serde_json::json!({}))
            }
            Err(err) => self.fs_reply(msg, &err),
        }
    }

    async fn handle_remove(&self, msg: &Message) -> Message {
        let Ok(payload) = msg.parse_payload::<RemovePayload>() else {
            return Message::error_to(msg, self.comm.ip, "Missing required arguments");
        };
        let ns = match self.fs().namespace(&payload.user).await {
            Ok(ns) => ns,
            Err(err) => return self.fs_reply(msg, &err),
        };

        let result = if payload.kind == "dir" {
            self.fs().remove_dir(&ns, &payload.cwd, &payload.path).await
        } else {
            self.fs().delete_file(&ns, &payload.cwd, &payload.path).await
        };

        match result {
            Ok(virtual_path) => {
                if payload.kind != "dir" {
                    self.meta().remove(&FileMetadata::key(&payload.user, &virtual_path)).await;
                }
                if !payload.replica {
                    self.fan_out(MessageType::DataRemove, msg.payload.clone());
                }
                Message::ack_to(msg, self.comm.ip, serde_json::json!({ "path": virtual_path }))
            }
            // deletes of the already-absent are a no-op on replicas
            Err(err) if payload.replica && err.kind() == FsErrorKind::NotFound => {
                Message::ack_to(msg, self.comm.ip, serde_json::json!({}))
            }
            Err(err) => self.fs_reply(msg, &err),
        }
    }

    async fn handle_rename(&self, msg: &Message) -> Message {
        let Ok(payload) = msg.parse_payload::<RenamePayload>() else {
            return Message::error_to(msg, self.comm.ip, "Missing required arguments");
        };
        let ns = match self.fs().namespace(&payload.user).await {
            Ok(ns) => ns,
            Err(err) => return self.fs_reply(msg, &err),
        };
        match self.fs().rename_path(&ns, &payload.cwd, &payload.old_path, &payload.new_path).await {
            Ok((old_virtual, new_virtual)) => {
                self.meta()
                    .rename(
                        &FileMetadata::key(&payload.user, &old_virtual),
                        &FileMetadata::key(&payload.user, &new_virtual),
                    )
                    .await;
                if !payload.replica {
                    self.fan_out(MessageType::DataRename, msg.payload.clone());
                }
                Message::ack_to(msg, self.comm.ip, serde_json::json!({}))
            }
            Err(err) if payload.replica && matches!(err.kind(), FsErrorKind::NotFound | FsErrorKind::AlreadyExists) => {
                Message::ack_to(msg, self.comm.ip, serde_json::json!({}))
            }
            Err(err) => self.fs_reply(msg, &err),
        }
    }

    async fn handle_stat(&self, msg: &Message) -> Message {
        #[derive(Deserialize)]
        struct StatPayload {
            user: String,
            cwd: String,
            path: String,
        }
        let Ok(payload) = msg.parse_payload::<StatPayload>() else {
            return Message::error_to(msg, self.comm.ip, "Missing required arguments");
        };
        let ns = match self.fs().namespace(&payload.user).await {
            Ok(ns) => ns,
            Err(err) => return self.fs_reply(msg, &err),
        };
        match self.fs().stat(&ns, &payload.cwd, &payload.path).await {
            Ok(stat) => Message::ack_to(msg, self.comm.ip, serde_json::json!({ "stat": stat })),
            Err(err) => self.fs_reply(msg, &err),
        }
    }

    async fn handle_open_pasv(&self, msg: &Message) -> Message {
        let Ok(payload) = msg.parse_payload::<SessionPayload>() else {
            return Message::error_to(msg, self.comm.ip, "Missing required arguments");
        };
        let listener = match TcpListener::bind((self.comm.ip, 0)).await {
            Ok(listener) => listener,
            Err(err) => {
                slog::warn!(self.logger, "unable to open PASV socket: {}", err);
                return Message::error_to(msg, self.comm.ip, "Unable to open data socket");
            }
        };
        let port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(_) => return Message::error_to(msg, self.comm.ip, "Unable to open data socket"),
        };

        // Any previously stored socket for this session is closed here.
        let mut pasv = self.pasv.lock().await;
        pasv.insert(payload.session_id.clone(), listener);
        slog::info!(self.logger, "PASV socket for session {} on {}:{}", payload.session_id, self.comm.ip, port);

        Message::ack_to(msg, self.comm.ip, serde_json::json!({"ip": self.comm.ip.to_string(), "port": port}))
    }

    async fn consume_pasv(&self, session_id: &str) -> Option<TcpListener> {
        self.pasv.lock().await.remove(session_id)
    }

    async fn accept_data(&self, listener: TcpListener) -> std::io::Result<TcpStream> {
        match tokio::time::timeout(PASV_ACCEPT_TIMEOUT, listener.accept()).await {
            Ok(Ok((stream, _))) => Ok(stream),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "no data connection arrived")),
        }
    }

    /// Threads the ready signal back through the processing node so the FTP
    /// `150` lands on the control socket before any bytes move.
    async fn signal_data_ready(&self, processing: IpAddr, session_id: &str) -> bool {
        let msg = Message::new(
            MessageType::DataReady,
            self.comm.ip,
            processing,
            serde_json::json!({ "session_id": session_id }),
        );
        match self.comm.request(processing, msg, DATA_READY_TIMEOUT).await {
            Ok(ack) => ack.is_ok() && ack.payload.get("success").and_then(Value::as_bool).unwrap_or(false),
            Err(err) => {
                slog::warn!(self.logger, "DATA_READY for session {} failed: {}", session_id, err);
                false
            }
        }
    }

    async fn handle_list(&self, msg: &Message) -> Message {
        let Ok(payload) = msg.parse_payload::<ListPayload>() else {
            return Message::error_to(msg, self.comm.ip, "Missing arguments");
        };
        let Some(processing) = msg.src_ip() else {
            return Message::error_to(msg, self.comm.ip, "Bad source address");
        };
        let Some(listener) = self.consume_pasv(&payload.session_id).await else {
            return Message::error_to(msg, self.comm.ip, "No passive socket for session");
        };

        let ns = match self.fs().namespace(&payload.user).await {
            Ok(ns) => ns,
            Err(err) => return self.fs_reply(msg, &err),
        };

        let mut conn = match self.accept_data(listener).await {
            Ok(conn) => conn,
            Err(err) => {
                slog::warn!(self.logger, "LIST data accept failed: {}", err);
                return Message::error_to(msg, self.comm.ip, "Data connection not established");
            }
        };

        let lines = if payload.detailed {
            match self.fs().list_dir_with_stats(&ns, &payload.cwd, &payload.path).await {
                Ok(entries) => entries
                    .iter()
                    .map(|e| format!("{:o} 1 owner group {:>8} {} {}", e.permissions, e.size, e.modified, e.name))
                    .collect::<Vec<_>>(),
                Err(err) => return self.fs_reply(msg, &err),
            }
        } else {
            match self.fs().list_dir(&ns, &payload.cwd, &payload.path).await {
                Ok(names) => names,
                Err(err) => return self.fs_reply(msg, &err),
            }
        };

        if !self.signal_data_ready(processing, &payload.session_id).await {
            return Message::error_to(msg, self.comm.ip, "Unable to prepare data connection");
        }

        for line in &lines {
            if let Err(err) = conn.write_all(format!("{line}\r\n").as_bytes()).await {
                slog::warn!(self.logger, "LIST data write failed: {}", err);
                return Message::error_to(msg, self.comm.ip, "Data connection lost");
            }
        }
        let _ = conn.shutdown().await;

        slog::info!(self.logger, "LIST served for session {}", payload.session_id);
        Message::ack_to(msg, self.comm.ip, serde_json::json!({}))
    }

    async fn handle_retr(&self, msg: &Message) -> Message {
        let Ok(payload) = msg.parse_payload::<RetrPayload>() else {
            return Message::error_to(msg, self.comm.ip, "Missing required arguments");
        };
        let Some(processing) = msg.src_ip() else {
            return Message::error_to(msg, self.comm.ip, "Bad source address");
        };

        let ns = match self.fs().namespace(&payload.user).await {
            Ok(ns) => ns,
            Err(err) => return self.fs_reply(msg, &err),
        };
        // Validate before consuming the PASV socket so a bad path leaves it
        // usable for the next attempt.
        let (mut file, _) = match self.fs().open_read(&ns, &payload.cwd, &payload.path).await {
            Ok(opened) => opened,
            Err(err) => return self.fs_reply(msg, &err),
        };

        let Some(listener) = self.consume_pasv(&payload.session_id).await else {
            return Message::error_to(msg, self.comm.ip, "No passive socket for session");
        };
        let mut conn = match self.accept_data(listener).await {
            Ok(conn) => conn,
            Err(err) => {
                slog::warn!(self.logger, "RETR data accept failed: {}", err);
                return Message::error_to(msg, self.comm.ip, "Data connection not established");
            }
        };

        if !self.signal_data_ready(processing, &payload.session_id).await {
            return Message::error_to(msg, self.comm.ip, "Unable to prepare data connection");
        }

        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    slog::warn!(self.logger, "RETR read failed: {}", err);
                    return Message::error_to(msg, self.comm.ip, "Local filesystem error");
                }
            };
            if let Err(err) = conn.write_all(&buf[..n]).await {
                slog::warn!(self.logger, "RETR data write failed: {}", err);
                return Message::error_to(msg, self.comm.ip, "Data connection lost");
            }
        }
        let _ = conn.shutdown().await;

        slog::info!(self.logger, "RETR served for session {}", payload.session_id);
        Message::ack_to(msg, self.comm.ip, serde_json::json!({}))
    }

    async fn handle_store(&self, msg: &Message) -> Message {
        let Ok(payload) = msg.parse_payload::<StorePayload>() else {
            return Message::error_to(msg, self.comm.ip, "Missing required arguments");
        };
        let Some(processing) = msg.src_ip() else {
            return Message::error_to(msg, self.comm.ip, "Bad source address");
        };
        let Some(listener) = self.consume_pasv(&payload.session_id).await else {
            return Message::error_to(msg, self.comm.ip, "No passive socket for session");
        };
        let ns = match self.fs().namespace(&payload.user).await {
            Ok(ns) => ns,
            Err(err) => return self.fs_reply(msg, &err),
        };

        let mut conn = match self.accept_data(listener).await {
            Ok(conn) => conn,
            Err(err) => {
                slog::warn!(self.logger, "STOR data accept failed: {}", err);
                return Message::error_to(msg, self.comm.ip, "Data connection not established");
            }
        };

        if !self.signal_data_ready(processing, &payload.session_id).await {
            return Message::error_to(msg, self.comm.ip, "Unable to prepare data connection");
        }

        let (virtual_path, bytes) = match self.fs().write_stream(&ns, &payload.cwd, &payload.path, &mut conn).await {
            Ok(written) => written,
            Err(err) => return self.fs_reply(msg, &err),
        };
        drop(conn);

        let meta = FileMetadata {
            filename: FileMetadata::key(&payload.user, &virtual_path),
            version: payload.version,
            transfer_id: payload.transfer_id.clone(),
            timestamp: chrono::Utc::now().timestamp(),
        };
        self.meta().upsert(meta.clone()).await;
        slog::info!(self.logger, "stored {} ({} bytes), replicating to {} peers", meta.filename, bytes, payload.replicate_to.len());

        let targets: Vec<IpAddr> = payload.replicate_to.iter().filter_map(|ip| ip.parse().ok()).collect();
        let acks = self.replicate_file(&payload, &meta, targets.clone()).await;
        let quorum = replication_factor().min(targets.len());

        // Anti-entropy picks up whoever the direct replication missed.
        let update = serde_json::json!({"op": "add", "meta": meta, "origin": self.comm.ip.to_string()});
        self.gossip.notify_local_change(update).await;

        let status = if acks >= quorum { Status::Ok } else { Status::Partial };
        Message::ack_to(msg, self.comm.ip, serde_json::json!({ "acks_received": acks })).with_status(status)
    }

    /// Parallel replication fan-out. Returns once `min(K, targets)` acks
    /// arrived, every target finished, or the global budget ran out;
    /// stragglers keep retrying in the background.
    async fn replicate_file(&self, payload: &StorePayload, meta: &FileMetadata, targets: Vec<IpAddr>) -> usize {
        if targets.is_empty() {
            return 0;
        }
        let quorum = replication_factor().min(targets.len());
        let total = targets.len();
        let (tx, mut rx) = tokio::sync::mpsc::channel::<bool>(total);

        for target in targets {
            let tx = tx.clone();
            let comm = Arc::clone(&self.comm);
            let logger = self.logger.clone();
            let replicate = ReplicatePayload {
                filename: payload.path.clone(),
                metadata: meta.clone(),
                user: payload.user.clone(),
                cwd: payload.cwd.clone(),
            };
            tokio::spawn(async move {
                let payload = match serde_json::to_value(&replicate) {
                    Ok(v) => v,
                    Err(_) => return,
                };
                let mut acked = false;
                for attempt in 1..=REPLICATE_ATTEMPTS {
                    let timeout = REPLICATE_BASE_TIMEOUT + REPLICATE_TIMEOUT_STEP * attempt;
                    let msg = Message::new(MessageType::DataReplicateFile, comm.ip, target, payload.clone());
                    match comm.request(target, msg, timeout).await {
                        Ok(ack) if ack.is_ok() => {
                            acked = true;
                            break;
                        }
                        Ok(ack) => {
                            slog::warn!(logger, "replication to {} refused: {}", target, ack.note());
                        }
                        Err(err) => {
                            slog::warn!(logger, "replication to {} attempt {} failed: {}", target, attempt, err);
                        }
                    }
                }
                let _ = tx.send(acked).await;
            });
        }
        drop(tx);

        let deadline = tokio::time::Instant::now() + STORE_QUORUM_TIMEOUT;
        let mut acks = 0usize;
        let mut settled = 0usize;
        while acks < quorum && settled < total {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(ok)) => {
                    settled += 1;
                    if ok {
                        acks += 1;
                    }
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }
        acks
    }

    async fn handle_meta_request(&self, msg: &Message) -> Message {
        let Ok(payload) = msg.parse_payload::<MetaRequestPayload>() else {
            return Message::error_to(msg, self.comm.ip, "Malformed request");
        };
        let metadata = match payload.filename {
            Some(filename) => self.meta().get(&filename).await.into_iter().collect::<Vec<_>>(),
            None => self.meta().all().await,
        };
        Message::ack_to(msg, self.comm.ip, serde_json::json!({ "metadata": metadata }))
    }

    /// Receiving side of store replication: open an ephemeral listener,
    /// tell the primary where to connect, take the bytes, record metadata.
    async fn handle_replicate_file(&self, msg: &Message) -> Message {
        let Ok(payload) = msg.parse_payload::<ReplicatePayload>() else {
            return Message::error_to(msg, self.comm.ip, "Missing required fields (filename, metadata, user, cwd)");
        };
        let Some(primary) = msg.src_ip() else {
            return Message::error_to(msg, self.comm.ip, "Bad source address");
        };

        let disposition = self.state.resolve_incoming(payload.metadata.clone()).await;
        let target = match disposition {
            // A replay of a transfer we already hold; nothing to receive.
            Disposition::Ignore => return Message::ack_to(msg, self.comm.ip, serde_json::json!({})),
            Disposition::Store(meta) => meta,
        };
        let Some((user, vpath)) = FileMetadata::split_key(&target.filename) else {
            return Message::error_to(msg, self.comm.ip, "Malformed metadata filename");
        };
        let (user, vpath) = (user.to_string(), vpath.to_string());
        let ns = match self.fs().namespace(&user).await {
            Ok(ns) => ns,
            Err(err) => return self.fs_reply(msg, &err),
        };

        let listener = match TcpListener::bind((self.comm.ip, 0)).await {
            Ok(listener) => listener,
            Err(err) => {
                slog::warn!(self.logger, "unable to open replication socket: {}", err);
                return Message::error_to(msg, self.comm.ip, "Unable to open replication socket");
            }
        };
        let port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(_) => return Message::error_to(msg, self.comm.ip, "Unable to open replication socket"),
        };

        let ready = Message::new(
            MessageType::DataReplicateReady,
            self.comm.ip,
            primary,
            serde_json::json!({
                "ip": self.comm.ip.to_string(),
                "port": port,
                "filename": payload.filename,
                "user": payload.user,
                "cwd": payload.cwd,
            }),
        );
        if self.comm.notify(primary, ready).await.is_err() {
            return Message::error_to(msg, self.comm.ip, "Primary unreachable for replicate ready");
        }

        let mut conn = match self.accept_data(listener).await {
            Ok(conn) => conn,
            Err(err) => {
                slog::warn!(self.logger, "replication accept failed: {}", err);
                return Message::error_to(msg, self.comm.ip, "Replication data connection not established");
            }
        };

        match self.fs().write_stream(&ns, "/", &vpath, &mut conn).await {
            Ok((_, bytes)) => {
                self.meta().upsert(target.clone()).await;
                slog::info!(self.logger, "replicated {} ({} bytes) from {}", target.filename, bytes, primary);
                Message::ack_to(msg, self.comm.ip, serde_json::json!({}))
            }
            Err(err) => self.fs_reply(msg, &err),
        }
    }

    /// Sending side of store replication: a peer opened its listener and
    /// asks us to connect and stream the file.
    async fn handle_replicate_ready(&self, msg: &Message) {
        let Ok(payload) = msg.parse_payload::<ReplicateReadyPayload>() else {
            slog::warn!(self.logger, "malformed DATA_REPLICATE_READY payload");
            return;
        };
        let Ok(target) = payload.ip.parse::<IpAddr>() else {
            return;
        };

        let ns = match self.fs().namespace(&payload.user).await {
            Ok(ns) => ns,
            Err(err) => {
                slog::warn!(self.logger, "replicate ready for unknown namespace {}: {}", payload.user, err);
                return;
            }
        };
        let (mut file, _) = match self.fs().open_read(&ns, &payload.cwd, &payload.filename).await {
            Ok(opened) => opened,
            Err(err) => {
                slog::warn!(self.logger, "cannot serve replication of {}: {}", payload.filename, err);
                return;
            }
        };

        let mut stream = match TcpStream::connect((target, payload.port)).await {
            Ok(stream) => stream,
            Err(err) => {
                slog::warn!(self.logger, "cannot connect to replication socket {}:{}: {}", target, payload.port, err);
                return;
            }
        };
        if let Err(err) = tokio::io::copy(&mut file, &mut stream).await {
            slog::warn!(self.logger, "replication stream to {} failed: {}", target, err);
            return;
        }
        let _ = stream.shutdown().await;
        slog::info!(self.logger, "sent {} to {}:{}", payload.filename, target, payload.port);
    }

    /// Lazy healing: a peer noticed it lacks a file we announced. Open a
    /// fresh listener, hand back the port, and serve the bytes on it.
    async fn handle_sync_request(&self, msg: &Message) -> Message {
        let Ok(payload) = msg.parse_payload::<SyncRequestPayload>() else {
            return Message::error_to(msg, self.comm.ip, "Missing filename");
        };
        let Some((user, vpath)) = FileMetadata::split_key(&payload.filename) else {
            return Message::error_to(msg, self.comm.ip, "Malformed filename");
        };
        let (user, vpath) = (user.to_string(), vpath.to_string());

        let ns = match self.fs().namespace(&user).await {
            Ok(ns) => ns,
            Err(err) => return self.fs_reply(msg, &err),
        };
        if !self.fs().is_file(&ns, "/", &vpath).await {
            return Message::error_to(msg, self.comm.ip, "File not held here");
        }

        let listener = match TcpListener::bind((self.comm.ip, 0)).await {
            Ok(listener) => listener,
            Err(_) => return Message::error_to(msg, self.comm.ip, "Unable to open sync socket"),
        };
        let port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(_) => return Message::error_to(msg, self.comm.ip, "Unable to open sync socket"),
        };

        let fs = Arc::clone(&self.state.fs);
        let logger = self.logger.clone();
        let filename = payload.filename.clone();
        tokio::spawn(async move {
            let accepted = tokio::time::timeout(PASV_ACCEPT_TIMEOUT, listener.accept()).await;
            let mut conn = match accepted {
                Ok(Ok((conn, _))) => conn,
                _ => {
                    slog::warn!(logger, "sync peer never connected for {}", filename);
                    return;
                }
            };
            let Ok((mut file, _)) = fs.open_read(&ns, "/", &vpath).await else {
                return;
            };
            if let Err(err) = tokio::io::copy(&mut file, &mut conn).await {
                slog::warn!(logger, "sync stream of {} failed: {}", filename, err);
                return;
            }
            let _ = conn.shutdown().await;
        });

        let mut response = Message::new(
            MessageType::DataSyncFileReady,
            self.comm.ip,
            msg.src_ip().unwrap_or(self.comm.ip),
            serde_json::json!({"filename": payload.filename, "pasv_port": port}),
        );
        response.metadata.status = Status::Ok;
        response
    }
}

#[async_trait]
impl MessageHandler for StorageNode {
    async fn handle(&self, msg: Message) -> Option<Message> {
        match msg.header.msg_type {
            MessageType::DataCwd => Some(self.handle_cwd(&msg).await),
            MessageType::DataMkd => Some(self.handle_mkd(&msg).await),
            MessageType::DataRemove => Some(self.handle_remove(&msg).await),
            MessageType::DataRename => Some(self.handle_rename(&msg).await),
            MessageType::DataStat => Some(self.handle_stat(&msg).await),
            MessageType::DataOpenPasv => Some(self.handle_open_pasv(&msg).await),
            MessageType::DataList => Some(self.handle_list(&msg).await),
            MessageType::DataRetrFile => Some(self.handle_retr(&msg).await),
            MessageType::DataStoreFile => Some(self.handle_store(&msg).await),
            MessageType::DataMetaRequest => Some(self.handle_meta_request(&msg).await),
            MessageType::DataReplicateFile => Some(self.handle_replicate_file(&msg).await),
            MessageType::DataReplicateReady => {
                self.handle_replicate_ready(&msg).await;
                None
            }
            MessageType::DataSyncFileRequest => Some(self.handle_sync_request(&msg).await),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn storage_node(dir: &std::path::Path) -> Arc<StorageNode> {
        let config = NodeConfig::with_subnet("data-1", "127.0.0.1".parse().unwrap(), "127.0.0.0/30".parse().unwrap());
        StorageNode::new(config, dir.join("root")).await.unwrap()
    }

    fn msg(msg_type: MessageType, payload: Value) -> Message {
        Message::new(msg_type, "127.0.0.1".parse().unwrap(), "127.0.0.1".parse().unwrap(), payload)
    }

    #[tokio::test]
    async fn mkd_cwd_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let node = storage_node(dir.path()).await;

        let ack = node
            .handle(msg(MessageType::DataMkd, serde_json::json!({"user": "u", "cwd": "/", "path": "docs"})))
            .await
            .unwrap();
        assert!(ack.is_ok());

        let ack = node
            .handle(msg(
                MessageType::DataCwd,
                serde_json::json!({"user": "u", "current_path": "/", "new_path": "docs"}),
            ))
            .await
            .unwrap();
        assert!(ack.is_ok());
        assert_eq!(ack.payload["cwd"], "/docs");

        let ack = node
            .handle(msg(
                MessageType::DataRemove,
                serde_json::json!({"user": "u", "cwd": "/", "path": "docs", "type": "dir"}),
            ))
            .await
            .unwrap();
        assert!(ack.is_ok());

        // now it is gone
        let ack = node
            .handle(msg(
                MessageType::DataCwd,
                serde_json::json!({"user": "u", "current_path": "/", "new_path": "docs"}),
            ))
            .await
            .unwrap();
        assert!(!ack.is_ok());
        assert_eq!(ack.note(), "Path not found");
    }

    #[tokio::test]
    async fn traversal_is_refused_with_distinct_error() {
        let dir = tempfile::tempdir().unwrap();
        let node = storage_node(dir.path()).await;

        let ack = node
            .handle(msg(
                MessageType::DataMkd,
                serde_json::json!({"user": "../evil", "cwd": "/", "path": "x"}),
            ))
            .await
            .unwrap();
        assert!(!ack.is_ok());
        assert_eq!(ack.note(), "Invalid path");
    }

    #[tokio::test]
    async fn open_pasv_replaces_previous_listener() {
        let dir = tempfile::tempdir().unwrap();
        let node = storage_node(dir.path()).await;

        let first = node
            .handle(msg(MessageType::DataOpenPasv, serde_json::json!({"session_id": "s1"})))
            .await
            .unwrap();
        assert!(first.is_ok());
        let second = node
            .handle(msg(MessageType::DataOpenPasv, serde_json::json!({"session_id": "s1"})))
            .await
            .unwrap();
        assert!(second.is_ok());
        assert_ne!(first.payload["port"], second.payload["port"]);

        // only one stored listener: consuming twice yields one socket
        assert!(node.consume_pasv("s1").await.is_some());
        assert!(node.consume_pasv("s1").await.is_none());
    }

    #[tokio::test]
    async fn list_without_pasv_socket_fails() {
        let dir = tempfile::tempdir().unwrap();
        let node = storage_node(dir.path()).await;
        let ack = node
            .handle(msg(
                MessageType::DataList,
                serde_json::json!({"session_id": "s1", "user": "u", "cwd": "/", "path": "."}),
            ))
            .await
            .unwrap();
        assert!(!ack.is_ok());
        assert_eq!(ack.note(), "No passive socket for session");
    }

    #[tokio::test]
    async fn retr_of_missing_file_keeps_pasv_socket() {
        let dir = tempfile::tempdir().unwrap();
        let node = storage_node(dir.path()).await;
        node.handle(msg(MessageType::DataOpenPasv, serde_json::json!({"session_id": "s1"})))
            .await
            .unwrap();

        let ack = node
            .handle(msg(
                MessageType::DataRetrFile,
                serde_json::json!({"session_id": "s1", "user": "u", "cwd": "/", "path": "ghost.bin"}),
            ))
            .await
            .unwrap();
        assert!(!ack.is_ok());

        // the socket survives the failed validation
        assert!(node.consume_pasv("s1").await.is_some());
    }

    #[tokio::test]
    async fn meta_request_filters_by_filename() {
        let dir = tempfile::tempdir().unwrap();
        let node = storage_node(dir.path()).await;
        node.meta()
            .upsert(FileMetadata {
                filename: "u/a.txt".into(),
                version: 1,
                transfer_id: "t1".into(),
                timestamp: 0,
            })
            .await;
        node.meta()
            .upsert(FileMetadata {
                filename: "u/b.txt".into(),
                version: 2,
                transfer_id: "t2".into(),
                timestamp: 0,
            })
            .await;

        let ack = node
            .handle(msg(MessageType::DataMetaRequest, serde_json::json!({"filename": "u/a.txt"})))
            .await
            .unwrap();
        let metas: Vec<FileMetadata> = serde_json::from_value(ack.payload["metadata"].clone()).unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].transfer_id, "t1");

        let ack = node.handle(msg(MessageType::DataMetaRequest, serde_json::json!({}))).await.unwrap();
        let metas: Vec<FileMetadata> = serde_json::from_value(ack.payload["metadata"].clone()).unwrap();
        assert_eq!(metas.len(), 2);
    }

    fn meta_entry(filename: &str, version: u64, transfer_id: &str) -> FileMetadata {
        FileMetadata {
            filename: filename.to_string(),
            version,
            transfer_id: transfer_id.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    #[tokio::test]
    async fn conflicting_add_parks_local_loser_under_copy_name() {
        let dir = tempfile::tempdir().unwrap();
        let node = storage_node(dir.path()).await;

        // local file with the lesser transfer id
        let ns = node.fs().namespace("u").await.unwrap();
        let mut bytes = &b"local"[..];
        node.fs().write_stream(&ns, "/", "report.txt", &mut bytes).await.unwrap();
        node.meta().upsert(meta_entry("u/report.txt", 1, "aaaa")).await;

        // a greater transfer id arrives by gossip
        match node.state.resolve_incoming(meta_entry("u/report.txt", 1, "bbbb")).await {
            Disposition::Store(meta) => {
                assert_eq!(meta.filename, "u/report.txt");
                node.meta().upsert(meta).await;
            }
            Disposition::Ignore => panic!("conflicting add must not be ignored"),
        }

        // the local loser was renamed on disk and in the table
        assert!(node.fs().is_file(&ns, "/", "report_copy.txt").await);
        assert!(!node.fs().is_file(&ns, "/", "report.txt").await);
        let parked = node.meta().get("u/report_copy.txt").await.unwrap();
        assert_eq!(parked.transfer_id, "aaaa");
        let winner = node.meta().get("u/report.txt").await.unwrap();
        assert_eq!(winner.transfer_id, "bbbb");
    }

    #[tokio::test]
    async fn conflicting_add_parks_incoming_loser_under_copy_name() {
        let dir = tempfile::tempdir().unwrap();
        let node = storage_node(dir.path()).await;

        let ns = node.fs().namespace("u").await.unwrap();
        let mut bytes = &b"winner"[..];
        node.fs().write_stream(&ns, "/", "report.txt", &mut bytes).await.unwrap();
        node.meta().upsert(meta_entry("u/report.txt", 1, "zzzz")).await;

        match node.state.resolve_incoming(meta_entry("u/report.txt", 1, "aaaa")).await {
            Disposition::Store(meta) => {
                assert_eq!(meta.filename, "u/report_copy.txt");
                assert_eq!(meta.transfer_id, "aaaa");
            }
            Disposition::Ignore => panic!("conflicting add must not be ignored"),
        }
        // the winner keeps the plain name
        let winner = node.meta().get("u/report.txt").await.unwrap();
        assert_eq!(winner.transfer_id, "zzzz");
        assert!(node.fs().is_file(&ns, "/", "report.txt").await);
    }

    #[tokio::test]
    async fn same_transfer_id_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let node = storage_node(dir.path()).await;
        node.meta().upsert(meta_entry("u/report.txt", 1, "tttt")).await;

        assert!(matches!(
            node.state.resolve_incoming(meta_entry("u/report.txt", 1, "tttt")).await,
            Disposition::Ignore
        ));
    }

    #[tokio::test]
    async fn higher_version_supersedes_regardless_of_transfer_id() {
        let dir = tempfile::tempdir().unwrap();
        let node = storage_node(dir.path()).await;

        let ns = node.fs().namespace("u").await.unwrap();
        let mut bytes = &b"v1"[..];
        node.fs().write_stream(&ns, "/", "doc.txt", &mut bytes).await.unwrap();
        node.meta().upsert(meta_entry("u/doc.txt", 1, "zzzz")).await;

        match node.state.resolve_incoming(meta_entry("u/doc.txt", 2, "aaaa")).await {
            Disposition::Store(meta) => assert_eq!(meta.filename, "u/doc.txt"),
            Disposition::Ignore => panic!("newer version must win"),
        }
    }

    #[tokio::test]
    async fn import_recreates_directories_idempotently() {
        let dir = tempfile::tempdir().unwrap();
        let node = storage_node(dir.path()).await;
        let origin: IpAddr = "127.0.0.1".parse().unwrap();

        let dump = serde_json::json!({
            "metadata": {},
            "directories": [
                {"user": "u", "path": "/"},
                {"user": "u", "path": "/docs"},
                {"user": "u", "path": "/docs/old"},
            ],
        });
        node.state.import(dump.clone(), origin).await;
        node.state.import(dump, origin).await;

        let ns = node.fs().namespace("u").await.unwrap();
        assert_eq!(node.fs().change_dir(&ns, "/", "docs/old").await.unwrap(), "/docs/old");
    }
}
