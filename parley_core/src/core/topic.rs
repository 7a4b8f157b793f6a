//! Topic naming
//!
//! Publish/subscribe traffic goes on the wire under a prefixed fulltopic,
//! `message::[<namespace>::]<topic>`; request/reply traffic carries the
//! user topic untouched (inside the JSON body as its `type` member). The
//! subscription table stores fulltopics so matching compares like with
//! like.

use super::node::Role;

const MESSAGE_PREFIX: &str = "message::";
const SEPARATOR: &str = "::";

/// Compute the on-the-wire topic string for a user topic
pub(crate) fn fulltopic(role: Role, namespace: Option<&str>, topic: &str) -> String {
    match role {
        Role::Pub | Role::Sub => match namespace {
            Some(ns) => format!("{}{}{}{}", MESSAGE_PREFIX, ns, SEPARATOR, topic),
            None => format!("{}{}", MESSAGE_PREFIX, topic),
        },
        Role::Req | Role::Rep | Role::Mon => topic.to_string(),
    }
}

/// Recover the user topic from an inbound fulltopic
pub(crate) fn strip<'a>(fulltopic: &'a str, namespace: Option<&str>) -> &'a str {
    let prefix_len = match namespace {
        Some(ns) => MESSAGE_PREFIX.len() + ns.len() + SEPARATOR.len(),
        None => MESSAGE_PREFIX.len(),
    };
    fulltopic.get(prefix_len..).unwrap_or("")
}
