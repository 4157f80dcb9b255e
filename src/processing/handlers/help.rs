//! The RFC 959 Help (`HELP`) command.

use super::{CommandHandler, Outcome};
use crate::processing::command::Command;
use crate::processing::node::ProcessingNode;
use crate::routing::SessionState;
use crate::routing::reply::ReplyCode;
use async_trait::async_trait;

const COMMANDS: &str = "USER PASS CWD CDUP QUIT REIN PASV TYPE RETR STOR STOU RNFR RNTO DELE RMD MKD PWD LIST NLST SYST STAT HELP NOOP";

pub(super) struct Help;

#[async_trait]
impl CommandHandler for Help {
    async fn handle(&self, _node: &ProcessingNode, _cmd: &Command, _session: SessionState) -> Outcome {
        Outcome::reply(ReplyCode::HelpMessage, format!("The following commands are recognized: {COMMANDS}"))
    }
}
