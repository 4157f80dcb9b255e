//! The RFC 959 Rename To (`RNTO`) command.

use super::{CommandHandler, FS_UNAVAILABLE, Outcome};
use crate::cluster::NodeRole;
use crate::options::REQUEST_TIMEOUT;
use crate::processing::command::Command;
use crate::processing::node::ProcessingNode;
use crate::proto::MessageType;
use crate::routing::SessionState;
use crate::routing::reply::ReplyCode;
use async_trait::async_trait;

pub(super) struct Rnto;

#[async_trait]
impl CommandHandler for Rnto {
    #[tracing_attributes::instrument(skip_all)]
    async fn handle(&self, node: &ProcessingNode, cmd: &Command, mut session: SessionState) -> Outcome {
        if !cmd.require(1) {
            return Outcome::reply(ReplyCode::ParameterSyntaxError, "Syntax error in parameters. Usage: RNTO <path>");
        }
        let Some(old_path) = session.rename_from.take() else {
            return Outcome::reply(ReplyCode::BadCommandSequence, "Bad sequence of commands. Send RNFR first.");
        };
        let new_path = cmd.arg(0).unwrap_or_default().to_string();

        let data_nodes = node.nodes(NodeRole::Data).await;
        if data_nodes.is_empty() {
            return Outcome::with_session(ReplyCode::LocalError, FS_UNAVAILABLE, session);
        }

        let user = session.username.clone().unwrap_or_default();
        let response = node
            .ask_first(
                &data_nodes,
                MessageType::DataRename,
                serde_json::json!({"user": user, "cwd": &session.cwd, "old_path": old_path, "new_path": new_path}),
                REQUEST_TIMEOUT,
            )
            .await;
        let Some(response) = response else {
            return Outcome::with_session(ReplyCode::LocalError, FS_UNAVAILABLE, session);
        };
        if !response.is_ok() {
            let note = response.note().to_string();
            return Outcome::with_session(ReplyCode::FileError, note, session);
        }
        Outcome::with_session(
            ReplyCode::FileActionOkay,
            format!("Renamed '{old_path}' to '{new_path}' successfully."),
            session,
        )
    }
}
