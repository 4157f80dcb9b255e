//! The RFC 959 Logout (`QUIT`) command. The routing node closes the
//! control connection when it relays the `221`.

use super::{CommandHandler, Outcome};
use crate::processing::command::Command;
use crate::processing::node::ProcessingNode;
use crate::routing::SessionState;
use crate::routing::reply::ReplyCode;
use async_trait::async_trait;

pub(super) struct Quit;

#[async_trait]
impl CommandHandler for Quit {
    async fn handle(&self, _node: &ProcessingNode, _cmd: &Command, _session: SessionState) -> Outcome {
        Outcome::reply(ReplyCode::ClosingControlConnection, "Goodbye.")
    }
}
