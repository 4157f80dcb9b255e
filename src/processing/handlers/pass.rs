//! The RFC 959 Password (`PASS`) command.
//
// Must be immediately preceded by USER; completes the user's
// identification for access control.

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

pub(super) struct Pass;

#[async_trait]
impl CommandHandler for Pass {
    #[tracing_attributes::instrument(skip_all)]
    async fn handle(&self, node: &ProcessingNode, cmd: &Command, mut session: SessionState) -> Outcome {
        if !cmd.require(1) {
            return Outcome::reply(ReplyCode::ParameterSyntaxError, "Syntax error in parameters. Usage: PASS <password>");
        }
        let Some(username) = session.username.clone() else {
            return Outcome::reply(ReplyCode::BadCommandSequence, "Bad sequence of commands. Send USER first.");
        };
        if session.authenticated {
            return Outcome::reply(ReplyCode::UserLoggedIn, "Already logged in.");
        }

        let auth_nodes = node.nodes(NodeRole::Auth).await;
        if auth_nodes.is_empty() {
            slog::warn!(node.logger, "no auth nodes reachable for PASS");
            return Outcome::reply(ReplyCode::LocalError, AUTH_UNAVAILABLE);
        }

        let response = node
            .ask_first(
                &auth_nodes,
                MessageType::AuthValidatePassword,
                serde_json::json!({"username": username, "password": cmd.arg(0)}),
                AUTH_TIMEOUT,
            )
            .await;
        let Some(response) = response else {
            return Outcome::reply(ReplyCode::LocalError, AUTH_UNAVAILABLE);
        };

        if !response.payload.get("result").and_then(Value::as_bool).unwrap_or(false) {
            return Outcome::reply(ReplyCode::NotLoggedIn, "Login incorrect.");
        }

        session.authenticate();
        Outcome::with_session(ReplyCode::UserLoggedIn, "User logged in, proceed.", session)
    }
}
