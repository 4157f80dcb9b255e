//! The RFC 959 Passive (`PASV`) command.
//
// The data port is not opened here: a storage node binds an ephemeral
// listener and becomes the PASV primary for this session's next transfer.
// The reply encodes its address as (h1,h2,h3,h4,p1,p2).

use super::{CommandHandler, FS_UNAVAILABLE, Outcome};
use crate::cluster::NodeRole;
use crate::options::REQUEST_TIMEOUT;
use crate::processing::command::Command;
use crate::processing::node::ProcessingNode;
use crate::proto::MessageType;
use crate::routing::SessionState;
use crate::routing::reply::ReplyCode;
use async_trait::async_trait;
use serde_json::Value;

pub(super) struct Pasv;

fn pasv_reply(ip: &str, port: u16) -> String {
    format!("Entering Passive Mode ({},{},{}).", ip.replace('.', ","), port / 256, port % 256)
}

#[async_trait]
impl CommandHandler for Pasv {
    #[tracing_attributes::instrument(skip_all)]
    async fn handle(&self, node: &ProcessingNode, cmd: &Command, mut session: SessionState) -> Outcome {
        if !cmd.require(0) {
            return Outcome::reply(ReplyCode::ParameterSyntaxError, "Syntax error in parameters. Usage: PASV");
        }

        let data_nodes = node.nodes(NodeRole::Data).await;
        if data_nodes.is_empty() {
            slog::warn!(node.logger, "no storage nodes reachable for PASV");
            return Outcome::reply(ReplyCode::LocalError, FS_UNAVAILABLE);
        }

        let response = node
            .ask_first(
                &data_nodes,
                MessageType::DataOpenPasv,
                serde_json::json!({"session_id": &session.session_id}),
                REQUEST_TIMEOUT,
            )
            .await;
        let Some(response) = response else {
            return Outcome::reply(ReplyCode::LocalError, FS_UNAVAILABLE);
        };
        if !response.is_ok() {
            return Outcome::reply(ReplyCode::CantOpenDataConnection, response.note());
        }

        let ip = response.payload.get("ip").and_then(Value::as_str).map(str::to_string);
        let port = response.payload.get("port").and_then(Value::as_u64).map(|p| p as u16);
        let (Some(ip), Some(port)) = (ip, port) else {
            return Outcome::reply(ReplyCode::CantOpenDataConnection, "Failed to retrieve PASV connection details.");
        };

        session.enter_pasv(&ip, port);
        Outcome::with_session(ReplyCode::EnteringPassiveMode, pasv_reply(&ip, port), session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn reply_encodes_address_in_octet_pairs() {
        assert_eq!(pasv_reply("10.0.0.7", 41102), "Entering Passive Mode (10,0,0,7,160,142).");
        assert_eq!(pasv_reply("192.168.1.20", 256), "Entering Passive Mode (192,168,1,20,1,0).");
        assert_eq!(pasv_reply("127.0.0.1", 255), "Entering Passive Mode (127,0,0,1,0,255).");
    }
}
