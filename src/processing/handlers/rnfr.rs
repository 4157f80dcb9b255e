//! The RFC 959 Rename From (`RNFR`) command. Stores the source path in the
//! session; `RNTO` completes the pair.

use super::{CommandHandler, Outcome};
use crate::processing::command::Command;
use crate::processing::node::ProcessingNode;
use crate::routing::SessionState;
use crate::routing::reply::ReplyCode;
use async_trait::async_trait;

pub(super) struct Rnfr;

#[async_trait]
impl CommandHandler for Rnfr {
    async fn handle(&self, _node: &ProcessingNode, cmd: &Command, mut session: SessionState) -> Outcome {
        if !cmd.require(1) {
            return Outcome::reply(ReplyCode::ParameterSyntaxError, "Syntax error in parameters. Usage: RNFR <path>");
        }
        let source = cmd.arg(0).unwrap_or_default();
        // a second RNFR simply replaces any pending one
        session.rename_from = Some(source.to_string());
        Outcome::with_session(
            ReplyCode::FileActionPending,
            format!("File or directory '{source}' ready for renaming."),
            session,
        )
    }
}
