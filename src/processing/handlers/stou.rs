//! The RFC 959 Store Unique (`STOU`) command: like `STOR` but the server
//! picks a name that cannot collide.

use super::stor::store_with_name;
use super::{CommandHandler, Outcome};
use crate::processing::command::Command;
use crate::processing::node::ProcessingNode;
use crate::routing::SessionState;
use crate::routing::reply::ReplyCode;
use async_trait::async_trait;
use uuid::Uuid;

pub(super) struct Stou;

fn unique_name(hint: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    let tag = &suffix[..8];
    match hint.rfind('.') {
        Some(idx) if idx > 0 => format!("{}_{tag}{}", &hint[..idx], &hint[idx..]),
        _ => format!("{hint}_{tag}"),
    }
}

#[async_trait]
impl CommandHandler for Stou {
    #[tracing_attributes::instrument(skip_all)]
    async fn handle(&self, node: &ProcessingNode, cmd: &Command, session: SessionState) -> Outcome {
        if cmd.arg_count() > 1 {
            return Outcome::reply(ReplyCode::ParameterSyntaxError, "Syntax error in parameters. Usage: STOU [<filename>]");
        }
        let name = unique_name(cmd.arg(0).unwrap_or("file"));
        store_with_name(node, session, &name).await
    }
}
