//! The RFC 959 Reinitialize (`REIN`) command.
//
// Flushes all account information and transfer parameters, leaving the
// control connection open; the client is back where USER would find it.

use super::{CommandHandler, Outcome};
use crate::processing::command::Command;
use crate::processing::node::ProcessingNode;
use crate::routing::SessionState;
use crate::routing::reply::ReplyCode;
use async_trait::async_trait;

pub(super) struct Rein;

#[async_trait]
impl CommandHandler for Rein {
    async fn handle(&self, _node: &ProcessingNode, _cmd: &Command, mut session: SessionState) -> Outcome {
        session.reset();
        Outcome::with_session(ReplyCode::ServiceReady, "Service ready for new user.", session)
    }
}
