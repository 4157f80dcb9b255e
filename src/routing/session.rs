//! Per-connection FTP session state and the table that owns it.
//!
//! Sessions are owned by the table and addressed by id; the control socket
//! is a separate handle attached only on the node that terminates the
//! connection. Replicated copies from peer routing nodes carry no socket.

use super::codec::FtpCodec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio_util::codec::FramedWrite;
use uuid::Uuid;

/// Shared handle for writing replies on a session's control socket.
pub(crate) type ReplySink = Arc<Mutex<FramedWrite<OwnedWriteHalf, FtpCodec>>>;

/// The serializable state of one FTP session. This is the blob shipped to
/// processing nodes with every command and gossiped between routing nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    /// Freshly minted UUID identifying the session.
    pub session_id: String,
    /// Address of the FTP client.
    pub client_ip: String,
    /// The name offered by `USER`, once any.
    pub username: Option<String>,
    /// True after a successful `PASS`.
    pub authenticated: bool,
    /// Current working directory, a virtual path.
    pub cwd: String,
    /// Transfer type: `A`, `I`, `E` or `L`.
    pub transfer_type: String,
    /// True between `PASV` and the data-channel verb that consumes it.
    pub pasv_mode: bool,
    /// Address advertised in the last `227` reply.
    pub data_ip: Option<String>,
    /// Port advertised in the last `227` reply.
    pub data_port: Option<u16>,
    /// Pending `RNFR` source path.
    pub rename_from: Option<String>,
}

impl SessionState {
    /// A fresh session for a client at `client_ip`.
    pub fn new(client_ip: IpAddr) -> Self {
        SessionState {
            session_id: Uuid::new_v4().to_string(),
            client_ip: client_ip.to_string(),
            username: None,
            authenticated: false,
            cwd: "/".to_string(),
            transfer_type: "A".to_string(),
            pasv_mode: false,
            data_ip: None,
            data_port: None,
            rename_from: None,
        }
    }

    /// Resets everything but identity, as `REIN` requires.
    pub fn reset(&mut self) {
        self.username = None;
        self.authenticated = false;
        self.cwd = "/".to_string();
        self.transfer_type = "A".to_string();
        self.clear_pasv();
        self.rename_from = None;
    }

    /// Switches the offered username, dropping any prior authentication.
    pub fn change_user(&mut self, username: &str) {
        self.username = Some(username.to_string());
        self.authenticated = false;
        self.rename_from = None;
    }

    /// Marks the session authenticated; requires a username.
    pub fn authenticate(&mut self) -> bool {
        if self.username.is_none() {
            return false;
        }
        self.authenticated = true;
        true
    }

    /// Records the data-channel endpoint from a `227` reply.
    pub fn enter_pasv(&mut self, ip: &str, port: u16) {
        self.pasv_mode = true;
        self.data_ip = Some(ip.to_string());
        self.data_port = Some(port);
    }

    /// The advertised PASV endpoint, when in passive mode.
    pub fn pasv_addr(&self) -> Option<(String, u16)> {
        if !self.pasv_mode {
            return None;
        }
        Some((self.data_ip.clone()?, self.data_port?))
    }

    /// Drops any data-channel state, called after each transfer.
    pub fn clear_pasv(&mut self) {
        self.pasv_mode = false;
        self.data_ip = None;
        self.data_port = None;
    }
}

struct Entry {
    state: SessionState,
    sink: Option<ReplySink>,
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<String, Entry>,
    by_ip: HashMap<String, Vec<String>>,
}

/// The session table of a routing node, indexed by session id and client
/// address.
#[derive(Default)]
pub(crate) struct SessionTable {
    inner: Mutex<Inner>,
}

impl SessionTable {
    pub(crate) fn new() -> Self {
        SessionTable::default()
    }

    /// Registers a locally terminated session together with its reply sink.
    pub(crate) async fn insert(&self, state: SessionState, sink: ReplySink) {
        self.upsert(state, Some(sink)).await;
    }

    /// Folds in a replicated session from a peer routing node. An existing
    /// local sink is preserved; replicated copies never carry one.
    pub(crate) async fn import(&self, state: SessionState) {
        self.upsert(state, None).await;
    }

    async fn upsert(&self, state: SessionState, sink: Option<ReplySink>) {
        let mut inner = self.inner.lock().await;
        let sid = state.session_id.clone();
        let ip = state.client_ip.clone();

        let sink = match (sink, inner.by_id.remove(&sid)) {
            (Some(sink), _) => Some(sink),
            (None, Some(existing)) => existing.sink,
            (None, None) => None,
        };
        inner.by_id.insert(sid.clone(), Entry { state, sink });

        let ids = inner.by_ip.entry(ip).or_default();
        ids.retain(|id| *id != sid);
        ids.push(sid);
    }

    /// Replaces the state of an existing session, reporting whether it
    /// actually changed.
    pub(crate) async fn update_state(&self, state: &SessionState) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.by_id.get_mut(&state.session_id) {
            Some(entry) if entry.state != *state => {
                entry.state = state.clone();
                true
            }
            _ => false,
        }
    }

    pub(crate) async fn get_state(&self, session_id: &str) -> Option<SessionState> {
        self.inner.lock().await.by_id.get(session_id).map(|e| e.state.clone())
    }

    pub(crate) async fn sink(&self, session_id: &str) -> Option<ReplySink> {
        self.inner.lock().await.by_id.get(session_id).and_then(|e| e.sink.clone())
    }

    pub(crate) async fn remove(&self, session_id: &str) -> Option<SessionState> {
        let mut inner = self.inner.lock().await;
        let entry = inner.by_id.remove(session_id)?;
        let ip = entry.state.client_ip.clone();
        if let Some(ids) = inner.by_ip.get_mut(&ip) {
            ids.retain(|id| id != session_id);
            if ids.is_empty() {
                inner.by_ip.remove(&ip);
            }
        }
        Some(entry.state)
    }

    pub(crate) async fn by_client(&self, client_ip: &str) -> Vec<SessionState> {
        let inner = self.inner.lock().await;
        inner
            .by_ip
            .get(client_ip)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.by_id.get(id).map(|e| e.state.clone()))
            .collect()
    }

    pub(crate) async fn all_states(&self) -> Vec<SessionState> {
        let inner = self.inner.lock().await;
        let mut states: Vec<SessionState> = inner.by_id.values().map(|e| e.state.clone()).collect();
        states.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        states
    }
}
