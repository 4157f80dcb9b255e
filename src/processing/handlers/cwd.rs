//! The RFC 959 Change Working Directory (`CWD`) command.
//
// The directory lives on the storage nodes, so changing into it means
// asking one of them to validate the target; the session merely records
// the virtual path that came back.

use super::{CommandHandler, FS_UNAVAILABLE, Outcome};
use crate::cluster::NodeRole;
use crate::options::REQUEST_TIMEOUT;
use crate::processing::command::Command;
use crate::processing::node::ProcessingNode;
use crate::proto::MessageType;
use crate::routing::SessionState;
use crate::routing::reply::ReplyCode;
use async_trait::async_trait;
use serde_json::Value;

pub(super) struct Cwd;

/// Shared by `CWD` and `CDUP`.
pub(super) async fn change_dir(node: &ProcessingNode, mut session: SessionState, target: &str) -> Outcome {
    let data_nodes = node.nodes(NodeRole::Data).await;
    if data_nodes.is_empty() {
        slog::warn!(node.logger, "no storage nodes reachable for CWD");
        return Outcome::reply(ReplyCode::LocalError, FS_UNAVAILABLE);
    }

    let user = session.username.clone().unwrap_or_default();
    let response = node
        .ask_first(
            &data_nodes,
            MessageType::DataCwd,
            serde_json::json!({"user": user, "current_path": &session.cwd, "new_path": target}),
            REQUEST_TIMEOUT,
        )
        .await;
    let Some(response) = response else {
        return Outcome::reply(ReplyCode::LocalError, FS_UNAVAILABLE);
    };
    if !response.is_ok() {
        return Outcome::reply(ReplyCode::FileError, response.note());
    }

    let Some(new_cwd) = response.payload.get("cwd").and_then(Value::as_str) else {
        return Outcome::reply(ReplyCode::FileError, "Failed to change directory.");
    };
    session.cwd = new_cwd.to_string();
    Outcome::with_session(
        ReplyCode::FileActionOkay,
        format!("Directory successfully changed to \"{new_cwd}\"."),
        session,
    )
}

#[async_trait]
impl CommandHandler for Cwd {
    #[tracing_attributes::instrument(skip_all)]
    async fn handle(&self, node: &ProcessingNode, cmd: &Command, session: SessionState) -> Outcome {
        if !cmd.require(1) {
            return Outcome::reply(ReplyCode::ParameterSyntaxError, "Syntax error in parameters. Usage: CWD <directory>");
        }
        change_dir(node, session, cmd.arg(0).unwrap_or_default()).await
    }
}
