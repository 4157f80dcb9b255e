//! The RFC 959 No Operation (`NOOP`) command.

use super::{CommandHandler, Outcome};
use crate::processing::command::Command;
use crate::processing::node::ProcessingNode;
use crate::routing::SessionState;
use crate::routing::reply::ReplyCode;
use async_trait::async_trait;

pub(super) struct Noop;

#[async_trait]
impl CommandHandler for Noop {
    async fn handle(&self, _node: &ProcessingNode, cmd: &Command, _session: SessionState) -> Outcome {
        if !cmd.require(0) {
            return Outcome::reply(ReplyCode::ParameterSyntaxError, "Syntax error in parameters. Usage: NOOP");
        }
        Outcome::reply(ReplyCode::CommandOkay, "NOOP command successful.")
    }
}
