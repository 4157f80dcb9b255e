//! The RFC 959 Representation Type (`TYPE`) command.

use super::{CommandHandler, Outcome};
use crate::processing::command::Command;
use crate::processing::node::ProcessingNode;
use crate::routing::SessionState;
use crate::routing::reply::ReplyCode;
use async_trait::async_trait;

pub(super) struct Type;

#[async_trait]
impl CommandHandler for Type {
    async fn handle(&self, _node: &ProcessingNode, cmd: &Command, mut session: SessionState) -> Outcome {
        if cmd.arg_count() == 0 {
            return Outcome::reply(ReplyCode::ParameterSyntaxError, "Syntax error in parameters. Usage: TYPE <type>");
        }
        let requested = cmd.arg(0).unwrap_or_default().to_uppercase();
        match requested.as_str() {
            "A" | "I" | "E" | "L" => {
                session.transfer_type = requested.clone();
                Outcome::with_session(ReplyCode::CommandOkay, format!("Type set to {requested}."), session)
            }
            _ => Outcome::reply(ReplyCode::CommandNotImplementedForParameter, "Unsupported type."),
        }
    }
}
