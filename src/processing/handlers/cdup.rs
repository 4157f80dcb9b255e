//! The RFC 959 Change to Parent Directory (`CDUP`) command.

use super::cwd::change_dir;
use super::{CommandHandler, Outcome};
use crate::processing::command::Command;
use crate::processing::node::ProcessingNode;
use crate::routing::SessionState;
use crate::routing::reply::ReplyCode;
use async_trait::async_trait;

pub(super) struct Cdup;

#[async_trait]
impl CommandHandler for Cdup {
    async fn handle(&self, node: &ProcessingNode, cmd: &Command, session: SessionState) -> Outcome {
        if !cmd.require(0) {
            return Outcome::reply(ReplyCode::ParameterSyntaxError, "Syntax error in parameters. Usage: CDUP");
        }
        change_dir(node, session, "..").await
    }
}
