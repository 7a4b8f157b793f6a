//! Peer matcher
//!
//! Handles the discovery `added`/`removed` events. A peer survives
//! validation when it advertises at all, pairs with the local role, carries
//! the pairing key, and lives in the same namespace. Consumer roles then
//! intersect their topic interests with the peer's offer and connect on the
//! first overlap; the handler is idempotent per peer because an already
//! open endpoint is skipped.

use log::debug;
use regex::Regex;
use serde_json::Value;

use super::advert::PAIRING_KEY;
use super::node::{Node, Role};
use crate::discovery::Peer;

/// Discovery `added` handler
pub(crate) fn peer_added(node: &Node, peer: &Peer) {
    if !validate_peer(node, peer) {
        return;
    }
    let inner = node.inner();

    if matches!(inner.role, Role::Sub | Role::Req) {
        let advertisement = match &peer.advertisement {
            Some(adv) => adv,
            None => return,
        };
        let port = advertisement
            .get("port")
            .and_then(Value::as_u64)
            .filter(|p| (1..=u16::MAX as u64).contains(p))
            .map(|p| p as u16);
        let port = match port {
            Some(p) => p,
            None => {
                debug!("peer {} advertises no usable port", peer.iid);
                return;
            }
        };
        let transport = match &inner.transport {
            Some(t) => t,
            None => return,
        };

        // Options stay locked across the connected check, the topic
        // intersection and the connect itself (lock order: options first)
        let connect_failed = {
            let options = inner.options.lock();
            let endpoint = if options.use_hostnames {
                peer.hostname.as_str()
            } else {
                peer.address.as_str()
            };
            if transport.is_connected(endpoint, port) {
                return;
            }
            let (wanted, offered) = match inner.role {
                Role::Sub => (&options.subscribes_to, advertisement.get("broadcasts")),
                Role::Req => (&options.requests, advertisement.get("respondsTo")),
                _ => unreachable!(),
            };
            if !topics_intersect(wanted.as_ref(), offered) {
                debug!("peer {} offers no matching topic", peer.iid);
                return;
            }
            transport.connect(endpoint, port).err()
        };
        if let Some(e) = connect_failed {
            node.report_error(&format!("unable to connect to peer {}: {}", peer.iid, e));
            return;
        }
    }

    let handler = inner.callbacks.added.lock().clone();
    if let Some(f) = handler {
        f(node, peer);
    }
}

/// Discovery `removed` handler
///
/// Same validation as `added`, then the user callback. No disconnect here;
/// the transport notices closed peers on its own.
pub(crate) fn peer_removed(node: &Node, peer: &Peer) {
    if !validate_peer(node, peer) {
        return;
    }
    let handler = node.inner().callbacks.removed.lock().clone();
    if let Some(f) = handler {
        f(node, peer);
    }
}

/// Advertisement, role pairing, key and namespace checks
///
/// Monitors validate only that an advertisement exists; they observe every
/// role and namespace.
pub(crate) fn validate_peer(node: &Node, peer: &Peer) -> bool {
    let inner = node.inner();
    let advertisement = match &peer.advertisement {
        Some(adv) => adv,
        None => return false,
    };
    if inner.role == Role::Mon {
        return true;
    }

    if advertisement.get("axon_type").and_then(Value::as_str)
        != inner.role.expected_axon_type()
    {
        return false;
    }
    if advertisement.get("key").and_then(Value::as_str) != Some(PAIRING_KEY) {
        return false;
    }

    let peer_namespace = advertisement.get("namespace").and_then(Value::as_str);
    let options = inner.options.lock();
    match (&options.namespace, peer_namespace) {
        (Some(local), Some(remote)) => local == remote,
        (None, None) => true,
        _ => false,
    }
}

/// Whether at least one local pattern matches one offered topic string
///
/// An absent local list matches unconditionally; an absent or malformed
/// offer matches nothing. Patterns that fail to compile are skipped.
pub(crate) fn topics_intersect(wanted: Option<&Value>, offered: Option<&Value>) -> bool {
    let wanted = match wanted {
        Some(v) => v,
        None => return true,
    };
    let empty = Vec::new();
    let wanted = wanted.as_array().unwrap_or(&empty);
    let offered = offered.and_then(Value::as_array).unwrap_or(&empty);

    for pattern in wanted.iter().filter_map(Value::as_str) {
        let regex = match Regex::new(pattern) {
            Ok(re) => re,
            Err(e) => {
                debug!("skipping unparseable topic pattern '{}': {}", pattern, e);
                continue;
            }
        };
        if offered
            .iter()
            .filter_map(Value::as_str)
            .any(|topic| regex.is_match(topic))
        {
            return true;
        }
    }
    false
}
