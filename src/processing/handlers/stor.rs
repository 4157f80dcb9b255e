//! The RFC 959 Store (`STOR`) command.
//
// The PASV primary takes the client's bytes and replicates them to every
// other storage node; the write is versioned one past the highest version
// any replica has seen, and tagged with a fresh transfer id.

use super::{CommandHandler, FS_UNAVAILABLE, Outcome};
use crate::cluster::NodeRole;
use crate::options::{COMMAND_TIMEOUT, DATA_READY_TIMEOUT};
use crate::processing::command::Command;
use crate::processing::node::ProcessingNode;
use crate::proto::{MessageType, Status};
use crate::routing::SessionState;
use crate::routing::reply::ReplyCode;
use crate::storage::FileMetadata;
use crate::storage::fs::normalize_virtual;
use async_trait::async_trait;
use std::net::IpAddr;
use uuid::Uuid;

pub(super) struct Stor;

/// The shared store path; `STOU` reuses it with a generated name.
pub(super) async fn store_with_name(node: &ProcessingNode, mut session: SessionState, path: &str) -> Outcome {
    let Some((pasv_ip, _)) = session.pasv_addr() else {
        return Outcome::reply(ReplyCode::CantOpenDataConnection, "Use PASV first.");
    };
    let Ok(primary) = pasv_ip.parse::<IpAddr>() else {
        return Outcome::reply(ReplyCode::CantOpenDataConnection, "Use PASV first.");
    };

    let data_nodes = node.nodes(NodeRole::Data).await;
    if data_nodes.is_empty() {
        return Outcome::reply(ReplyCode::LocalError, FS_UNAVAILABLE);
    }

    let user = session.username.clone().unwrap_or_default();
    let key = FileMetadata::key(&user, &normalize_virtual(&session.cwd, path));

    // One past the highest version any replica has recorded for this name.
    let mut max_version = 0u64;
    for data_node in &data_nodes {
        let Some(ip) = data_node.addr() else { continue };
        let Some(response) = node
            .ask(ip, MessageType::DataMetaRequest, serde_json::json!({ "filename": &key }), DATA_READY_TIMEOUT)
            .await
        else {
            continue;
        };
        if let Ok(metas) = serde_json::from_value::<Vec<FileMetadata>>(response.payload.get("metadata").cloned().unwrap_or_default()) {
            for meta in metas.into_iter().filter(|m| m.filename == key) {
                max_version = max_version.max(meta.version);
            }
        }
    }
    let version = max_version + 1;
    let transfer_id = Uuid::new_v4().to_string();

    let replicate_to: Vec<String> = data_nodes.iter().map(|n| n.ip.clone()).filter(|ip| *ip != pasv_ip).collect();

    let response = node
        .ask(
            primary,
            MessageType::DataStoreFile,
            serde_json::json!({
                "session_id": &session.session_id,
                "user": user,
                "cwd": &session.cwd,
                "path": path,
                "version": version,
                "transfer_id": transfer_id,
                "replicate_to": replicate_to,
            }),
            COMMAND_TIMEOUT,
        )
        .await;
    session.clear_pasv();

    let Some(response) = response else {
        return Outcome::with_session(ReplyCode::LocalError, FS_UNAVAILABLE, session);
    };
    match response.metadata.status {
        // degraded replication is still user-visible success
        Status::Ok | Status::Partial => {
            Outcome::with_session(ReplyCode::ClosingDataConnection, format!("File '{path}' stored successfully."), session)
        }
        Status::Error => {
            let note = response.note().to_string();
            Outcome::with_session(ReplyCode::FileError, note, session)
        }
    }
}

#[async_trait]
impl CommandHandler for Stor {
    #[tracing_attributes::instrument(skip_all)]
    async fn handle(&self, node: &ProcessingNode, cmd: &Command, session: SessionState) -> Outcome {
        if !cmd.require(1) {
            return Outcome::reply(ReplyCode::ParameterSyntaxError, "Syntax error in parameters. Usage: STOR <filename>");
        }
        store_with_name(node, session, cmd.arg(0).unwrap_or_default()).await
    }
}
