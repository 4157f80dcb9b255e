//! The RFC 959 Status (`STAT`) command: session status with no argument,
//! path status with one.

use super::{CommandHandler, FS_UNAVAILABLE, Outcome};
use crate::cluster::NodeRole;
use crate::options::REQUEST_TIMEOUT;
use crate::processing::command::Command;
use crate::processing::node::ProcessingNode;
use crate::proto::MessageType;
use crate::routing::SessionState;
use crate::routing::reply::ReplyCode;
use crate::storage::EntryStat;
use async_trait::async_trait;

pub(super) struct Stat;

#[async_trait]
impl CommandHandler for Stat {
    #[tracing_attributes::instrument(skip_all)]
    async fn handle(&self, node: &ProcessingNode, cmd: &Command, session: SessionState) -> Outcome {
        match cmd.arg_count() {
            0 => {
                let user = session.username.as_deref().unwrap_or("anonymous");
                let mode = if session.pasv_mode { "PASV" } else { "none" };
                Outcome::reply(
                    ReplyCode::SystemStatus,
                    format!(
                        "Session status: user={user}, cwd={}, type={}, data connection={mode}",
                        session.cwd, session.transfer_type
                    ),
                )
            }
            1 => {
                let path = cmd.arg(0).unwrap_or_default();
                let data_nodes = node.nodes(NodeRole::Data).await;
                if data_nodes.is_empty() {
                    return Outcome::reply(ReplyCode::LocalError, FS_UNAVAILABLE);
                }

                let user = session.username.clone().unwrap_or_default();
                let response = node
                    .ask_first(
                        &data_nodes,
                        MessageType::DataStat,
                        serde_json::json!({"user": user, "cwd": &session.cwd, "path": path}),
                        REQUEST_TIMEOUT,
                    )
                    .await;
                let Some(response) = response else {
                    return Outcome::reply(ReplyCode::LocalError, FS_UNAVAILABLE);
                };
                if !response.is_ok() {
                    return Outcome::reply(ReplyCode::FileError, response.note());
                }

                let stat: EntryStat = match serde_json::from_value(response.payload.get("stat").cloned().unwrap_or_default()) {
                    Ok(stat) => stat,
                    Err(_) => return Outcome::reply(ReplyCode::FileError, "Failed to retrieve stat info."),
                };
                let kind = if stat.is_dir { "directory" } else { "file" };
                Outcome::reply(
                    ReplyCode::SystemStatus,
                    format!("Status of '{}': {kind}, {} bytes, modified {}", stat.path, stat.size, stat.modified),
                )
            }
            _ => Outcome::reply(ReplyCode::ParameterSyntaxError, "Syntax error in parameters. Usage: STAT [<path>]"),
        }
    }
}
