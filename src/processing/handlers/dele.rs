//! The RFC 959 Delete (`DELE`) command.

use super::{CommandHandler, FS_UNAVAILABLE, Outcome};
use crate::cluster::NodeRole;
use crate::options::REQUEST_TIMEOUT;
use crate::processing::command::Command;
use crate::processing::node::ProcessingNode;
use crate::proto::MessageType;
use crate::routing::SessionState;
use crate::routing::reply::ReplyCode;
use async_trait::async_trait;

pub(super) struct Dele;

#[async_trait]
impl CommandHandler for Dele {
    #[tracing_attributes::instrument(skip_all)]
    async fn handle(&self, node: &ProcessingNode, cmd: &Command, session: SessionState) -> Outcome {
        if !cmd.require(1) {
            return Outcome::reply(ReplyCode::ParameterSyntaxError, "Syntax error in parameters. Usage: DELE <file>");
        }
        let path = cmd.arg(0).unwrap_or_default();

        let data_nodes = node.nodes(NodeRole::Data).await;
        if data_nodes.is_empty() {
            return Outcome::reply(ReplyCode::LocalError, FS_UNAVAILABLE);
        }

        let user = session.username.clone().unwrap_or_default();
        let response = node
            .ask_first(
                &data_nodes,
                MessageType::DataRemove,
                serde_json::json!({"user": user, "cwd": &session.cwd, "path": path, "type": "file"}),
                REQUEST_TIMEOUT,
            )
            .await;
        let Some(response) = response else {
            return Outcome::reply(ReplyCode::LocalError, FS_UNAVAILABLE);
        };
        if !response.is_ok() {
            return Outcome::reply(ReplyCode::FileError, response.note());
        }
        Outcome::reply(ReplyCode::FileActionOkay, format!("File '{path}' deleted successfully."))
    }
}
