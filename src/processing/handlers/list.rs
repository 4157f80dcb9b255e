//! The RFC 959 List (`LIST`) and Name List (`NLST`) commands.
//
// Both consume the session's PASV socket on the storage node that was
// chosen at PASV time. LIST asks for UNIX-style long lines, NLST for bare
// names.

use super::{CommandHandler, Outcome};
use crate::options::COMMAND_TIMEOUT;
use crate::processing::command::Command;
use crate::processing::node::ProcessingNode;
use crate::proto::MessageType;
use crate::routing::SessionState;
use crate::routing::reply::ReplyCode;
use async_trait::async_trait;

pub(super) struct List;
pub(super) struct Nlst;

async fn list_dir(node: &ProcessingNode, mut session: SessionState, cmd: &Command, detailed: bool) -> Outcome {
    if cmd.arg_count() > 1 {
        return Outcome::reply(ReplyCode::ParameterSyntaxError, "Syntax error in parameters. Usage: LIST [<path>]");
    }
    let path = cmd.arg(0).unwrap_or(".").to_string();

    let Some((pasv_ip, _)) = session.pasv_addr() else {
        return Outcome::reply(ReplyCode::CantOpenDataConnection, "Use PASV first.");
    };
    let Ok(primary) = pasv_ip.parse() else {
        return Outcome::reply(ReplyCode::CantOpenDataConnection, "Use PASV first.");
    };

    let user = session.username.clone().unwrap_or_default();
    let response = node
        .ask(
            primary,
            MessageType::DataList,
            serde_json::json!({
                "session_id": &session.session_id,
                "user": user,
                "cwd": &session.cwd,
                "path": path,
                "detailed": detailed,
            }),
            COMMAND_TIMEOUT,
        )
        .await;

    // the data channel is spent either way
    session.clear_pasv();

    let Some(response) = response else {
        return Outcome::with_session(ReplyCode::LocalError, "Requested action aborted. File system unavailable.", session);
    };
    if !response.is_ok() {
        let note = response.note().to_string();
        return Outcome::with_session(ReplyCode::FileError, note, session);
    }
    Outcome::with_session(ReplyCode::ClosingDataConnection, "Directory listing successful.", session)
}

#[async_trait]
impl CommandHandler for List {
    #[tracing_attributes::instrument(skip_all)]
    async fn handle(&self, node: &ProcessingNode, cmd: &Command, session: SessionState) -> Outcome {
        list_dir(node, session, cmd, true).await
    }
}

#[async_trait]
impl CommandHandler for Nlst {
    #[tracing_attributes::instrument(skip_all)]
    async fn handle(&self, node: &ProcessingNode, cmd: &Command, session: SessionState) -> Outcome {
        list_dir(node, session, cmd, false).await
    }
}
