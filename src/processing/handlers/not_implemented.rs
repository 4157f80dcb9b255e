//! Recognized verbs this cluster does not serve (`PORT`, `STRU`, `MODE`,
//! `ACCT`, `SMNT`, `ALLO`, `REST`, `ABOR`, `APPE`, `SITE`). Active-mode
//! transfers in particular are out: the data plane is PASV only.

use super::{CommandHandler, Outcome};
use crate::processing::command::Command;
use crate::processing::node::ProcessingNode;
use crate::routing::SessionState;
use crate::routing::reply::ReplyCode;
use async_trait::async_trait;

pub(super) struct NotImplemented;

#[async_trait]
impl CommandHandler for NotImplemented {
    async fn handle(&self, _node: &ProcessingNode, _cmd: &Command, _session: SessionState) -> Outcome {
        Outcome::reply(ReplyCode::CommandNotImplemented, "Command not implemented.")
    }
}
