//! The RFC 959 Print Working Directory (`PWD`) command.

use super::{CommandHandler, Outcome};
use crate::processing::command::Command;
use crate::processing::node::ProcessingNode;
use crate::routing::SessionState;
use crate::routing::reply::ReplyCode;
use async_trait::async_trait;

pub(super) struct Pwd;

#[async_trait]
impl CommandHandler for Pwd {
    async fn handle(&self, _node: &ProcessingNode, cmd: &Command, session: SessionState) -> Outcome {
        if !cmd.require(0) {
            return Outcome::reply(ReplyCode::ParameterSyntaxError, "Syntax error in parameters. Usage: PWD");
        }
        Outcome::reply(ReplyCode::DirCreated, format!("\"{}\" is the current directory.", session.cwd))
    }
}
