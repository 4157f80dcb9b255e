//! The RFC 959 User Name (`USER`) command.
//
// The argument field is a Telnet string identifying the user. This is the
// first command a client transmits after the control connection is made.

use super::{AUTH_UNAVAILABLE, CommandHandler, Outcome};
use crate::cluster::NodeRole;
use crate::options::AUTH_TIMEOUT;
use crate::processing::command::Command;
use crate::processing::node::ProcessingNode;
use crate::proto::MessageType;
use crate::routing::SessionState;
use crate::routing::reply::ReplyCode;
use async_trait::async_trait;
use serde_json::Value;

pub(super) struct User;

#[async_trait]
impl CommandHandler for User {
    #[tracing_attributes::instrument(skip_all)]
    async fn handle(&self, node: &ProcessingNode, cmd: &Command, mut session: SessionState) -> Outcome {
        if !cmd.require(1) {
            return Outcome::reply(ReplyCode::ParameterSyntaxError, "Syntax error in parameters. Usage: USER <username>");
        }
        let username = cmd.arg(0).unwrap_or_default();

        let auth_nodes = node.nodes(NodeRole::Auth).await;
        if auth_nodes.is_empty() {
            slog::warn!(node.logger, "no auth nodes reachable for USER");
            return Outcome::reply(ReplyCode::LocalError, AUTH_UNAVAILABLE);
        }

        let response = node
            .ask_first(
                &auth_nodes,
                MessageType::AuthValidateUser,
                serde_json::json!({ "username": username }),
                AUTH_TIMEOUT,
            )
            .await;
        let Some(response) = response else {
            return Outcome::reply(ReplyCode::LocalError, AUTH_UNAVAILABLE);
        };

        if !response.payload.get("result").and_then(Value::as_bool).unwrap_or(false) {
            return Outcome::reply(ReplyCode::NotLoggedIn, "User not found.");
        }

        session.change_user(username);
        Outcome::with_session(
            ReplyCode::NeedPassword,
            format!("User {username} accepted, please provide password."),
            session,
        )
    }
}
