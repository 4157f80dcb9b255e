//! The RFC 959 System (`SYST`) command.

use super::{CommandHandler, Outcome};
use crate::processing::command::Command;
use crate::processing::node::ProcessingNode;
use crate::routing::SessionState;
use crate::routing::reply::ReplyCode;
use async_trait::async_trait;

pub(super) struct Syst;

#[async_trait]
impl CommandHandler for Syst {
    async fn handle(&self, _node: &ProcessingNode, _cmd: &Command, _session: SessionState) -> Outcome {
        Outcome::reply(ReplyCode::SystemType, "UNIX Type: L8")
    }
}
