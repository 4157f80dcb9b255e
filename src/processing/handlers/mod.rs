//! Per-verb command handlers.
//!
//! Handlers are pure in-data-out: they receive the session state that came
//! with the command and hand back the reply plus the updated session (when
//! it changed). Anything filesystem- or credential-shaped is resolved by
//! consulting the cluster's storage and auth nodes.

mod cdup;
mod cwd;
mod dele;
mod help;
mod list;
mod mkd;
mod noop;
mod not_implemented;
mod pass;
mod pasv;
mod pwd;
mod quit;
mod rein;
mod retr;
mod rmd;
mod rnfr;
mod rnto;
mod stat;
mod stor;
mod stou;
mod syst;
mod type_;
mod user;

use super::command::Command;
use super::node::ProcessingNode;
use crate::routing::SessionState;
use crate::routing::reply::ReplyCode;
use async_trait::async_trait;

pub(crate) const FS_UNAVAILABLE: &str = "Requested action aborted. File system unavailable.";
pub(crate) const AUTH_UNAVAILABLE: &str = "User authentication not available.";

/// What a handler produced: an FTP reply and, when the command mutated the
/// session, the state the routing node should adopt.
pub(crate) struct Outcome {
    pub(crate) code: ReplyCode,
    pub(crate) message: String,
    pub(crate) session: Option<SessionState>,
}

impl Outcome {
    pub(crate) fn reply(code: ReplyCode, message: impl Into<String>) -> Self {
        Outcome {
            code,
            message: message.into(),
            session: None,
        }
    }

    pub(crate) fn with_session(code: ReplyCode, message: impl Into<String>, session: SessionState) -> Self {
        Outcome {
            code,
            message: message.into(),
            session: Some(session),
        }
    }
}

/// One FTP verb.
#[async_trait]
pub(crate) trait CommandHandler: Send + Sync {
    async fn handle(&self, node: &ProcessingNode, cmd: &Command, session: SessionState) -> Outcome;
}

/// The static dispatch table. Returns the handler for `verb` together with
/// whether the verb requires an authenticated session; `None` for verbs we
/// do not recognize at all.
pub(crate) fn lookup(verb: &str) -> Option<(bool, Box<dyn CommandHandler>)> {
    Some(match verb {
        "USER" => (false, Box::new(user::User) as Box<dyn CommandHandler>),
        "PASS" => (false, Box::new(pass::Pass)),
        "QUIT" => (false, Box::new(quit::Quit)),
        "HELP" => (false, Box::new(help::Help)),
        "NOOP" => (false, Box::new(noop::Noop)),
        "SYST" => (false, Box::new(syst::Syst)),
        "TYPE" => (false, Box::new(type_::Type)),
        "REIN" => (false, Box::new(rein::Rein)),
        "PWD" | "XPWD" => (true, Box::new(pwd::Pwd)),
        "CWD" | "XCWD" => (true, Box::new(cwd::Cwd)),
        "CDUP" => (true, Box::new(cdup::Cdup)),
        "MKD" | "XMKD" => (true, Box::new(mkd::Mkd)),
        "RMD" | "XRMD" => (true, Box::new(rmd::Rmd)),
        "DELE" => (true, Box::new(dele::Dele)),
        "RNFR" => (true, Box::new(rnfr::Rnfr)),
        "RNTO" => (true, Box::new(rnto::Rnto)),
        "STAT" => (true, Box::new(stat::Stat)),
        "PASV" => (true, Box::new(pasv::Pasv)),
        "LIST" => (true, Box::new(list::List)),
        "NLST" => (true, Box::new(list::Nlst)),
        "RETR" => (true, Box::new(retr::Retr)),
        "STOR" => (true, Box::new(stor::Stor)),
        "STOU" => (true, Box::new(stou::Stou)),
        "ACCT" | "SMNT" | "PORT" | "STRU" | "MODE" | "ALLO" | "REST" | "ABOR" | "APPE" | "SITE" => {
            (false, Box::new(not_implemented::NotImplemented))
        }
        _ => return None,
    })
}
