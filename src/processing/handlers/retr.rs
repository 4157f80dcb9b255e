//! The RFC 959 Retrieve (`RETR`) command.
//
// The metadata tables of all storage nodes are consulted first: the file
// must exist somewhere, and if the PASV primary does not hold the freshest
// version it is nudged to heal before the bytes leave it.

use super::{CommandHandler, FS_UNAVAILABLE, Outcome};
use crate::cluster::NodeRole;
use crate::options::{COMMAND_TIMEOUT, DATA_READY_TIMEOUT};
use crate::processing::command::Command;
use crate::processing::node::ProcessingNode;
use crate::proto::MessageType;
use crate::routing::SessionState;
use crate::routing::reply::ReplyCode;
use crate::storage::FileMetadata;
use crate::storage::fs::normalize_virtual;
use async_trait::async_trait;
use std::net::IpAddr;

pub(super) struct Retr;

#[async_trait]
impl CommandHandler for Retr {
    #[tracing_attributes::instrument(skip_all)]
    async fn handle(&self, node: &ProcessingNode, cmd: &Command, mut session: SessionState) -> Outcome {
        if !cmd.require(1) {
            return Outcome::reply(ReplyCode::ParameterSyntaxError, "Syntax error in parameters. Usage: RETR <filename>");
        }
        let filename = cmd.arg(0).unwrap_or_default();

        let data_nodes = node.nodes(NodeRole::Data).await;
        if data_nodes.is_empty() {
            return Outcome::reply(ReplyCode::LocalError, FS_UNAVAILABLE);
        }

        let user = session.username.clone().unwrap_or_default();
        let key = FileMetadata::key(&user, &normalize_virtual(&session.cwd, filename));

        // Which replicas hold the file, and at which version?
        let mut candidates: Vec<(IpAddr, FileMetadata)> = Vec::new();
        for data_node in &data_nodes {
            let Some(ip) = data_node.addr() else { continue };
            let Some(response) = node
                .ask(ip, MessageType::DataMetaRequest, serde_json::json!({ "filename": &key }), DATA_READY_TIMEOUT)
                .await
            else {
                continue;
            };
            let Ok(metas) = serde_json::from_value::<Vec<FileMetadata>>(response.payload.get("metadata").cloned().unwrap_or_default()) else {
                continue;
            };
            for meta in metas.into_iter().filter(|m| m.filename == key) {
                candidates.push((ip, meta));
            }
        }

        if candidates.is_empty() {
            return Outcome::reply(ReplyCode::FileError, format!("File '{filename}' not found."));
        }

        let Some((freshest_ip, freshest)) = candidates
            .iter()
            .max_by(|(_, a), (_, b)| (a.version, a.transfer_id.as_str()).cmp(&(b.version, b.transfer_id.as_str())))
            .cloned()
        else {
            return Outcome::reply(ReplyCode::FileError, format!("File '{filename}' not found."));
        };

        // The data channel was fixed at PASV time; the file's existence is
        // checked above even before a data channel exists.
        let Some((pasv_ip, _)) = session.pasv_addr() else {
            return Outcome::reply(ReplyCode::CantOpenDataConnection, "Use PASV first.");
        };
        let Ok(primary) = pasv_ip.parse::<IpAddr>() else {
            return Outcome::reply(ReplyCode::CantOpenDataConnection, "Use PASV first.");
        };

        // Read repair: a primary without the freshest entry is told about
        // it and will pull the bytes from the holder.
        let primary_is_fresh = candidates
            .iter()
            .any(|(ip, meta)| *ip == primary && meta.transfer_id == freshest.transfer_id);
        if !primary_is_fresh {
            slog::info!(node.logger, "primary {} is stale for {}, nudging it to sync", primary, key);
            node.notify(
                primary,
                MessageType::GossipUpdate,
                serde_json::json!({"op": "add", "meta": freshest, "origin": freshest_ip.to_string()}),
            )
            .await;
        }

        let response = node
            .ask(
                primary,
                MessageType::DataRetrFile,
                serde_json::json!({
                    "session_id": &session.session_id,
                    "user": user,
                    "cwd": &session.cwd,
                    "path": filename,
                }),
                COMMAND_TIMEOUT,
            )
            .await;
        session.clear_pasv();

        let Some(response) = response else {
            return Outcome::with_session(ReplyCode::LocalError, "Requested action aborted. File transfer failed.", session);
        };
        if !response.is_ok() {
            let note = response.note().to_string();
            return Outcome::with_session(ReplyCode::FileError, note, session);
        }
        Outcome::with_session(ReplyCode::ClosingDataConnection, format!("File '{filename}' retrieved successfully."), session)
    }
}
