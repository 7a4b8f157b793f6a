//! Advertisement builder
//!
//! Projects the current options, bound port and role into the JSON
//! advertisement handed to discovery. Any user-supplied advertisement is
//! the base object; the generated members overwrite it so identity fields
//! cannot be spoofed from the outside.

use serde_json::{json, Map, Value};

use super::node::Role;
use super::options::Options;

/// Pairing key every peer must advertise; fixed for interoperability with
/// pre-existing implementations of the protocol
pub(crate) const PAIRING_KEY: &str = "$$";

/// Build the advertisement for the current node state
///
/// Called with the options lock held so the snapshot is consistent.
pub(crate) fn build(role: Role, name: &str, options: &Options) -> Value {
    let mut adv: Map<String, Value> = match &options.advertisement {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };

    adv.insert(
        "type".to_string(),
        json!(if role == Role::Mon { "monitor" } else { "service" }),
    );
    adv.insert("name".to_string(), json!(name));
    if let Some(ns) = &options.namespace {
        adv.insert("namespace".to_string(), json!(ns));
    }

    let topics = match role {
        Role::Pub => options.broadcasts.as_ref().map(|t| ("broadcasts", t)),
        Role::Sub => options.subscribes_to.as_ref().map(|t| ("subscribesTo", t)),
        Role::Req => options.requests.as_ref().map(|t| ("requests", t)),
        Role::Rep => options.responds_to.as_ref().map(|t| ("respondsTo", t)),
        Role::Mon => None,
    };
    if let Some((key, list)) = topics {
        adv.insert(key.to_string(), list.clone());
    }

    adv.insert("key".to_string(), json!(PAIRING_KEY));
    match role {
        Role::Pub => {
            adv.insert("axon_type".to_string(), json!("pub-emitter"));
            adv.insert("port".to_string(), json!(options.port));
        }
        Role::Sub => {
            adv.insert("axon_type".to_string(), json!("sub-emitter"));
        }
        Role::Req => {
            adv.insert("axon_type".to_string(), json!("req"));
        }
        Role::Rep => {
            adv.insert("axon_type".to_string(), json!("rep"));
            adv.insert("port".to_string(), json!(options.port));
        }
        Role::Mon => {
            adv.insert("port".to_string(), json!(0));
        }
    }

    Value::Object(adv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn publisher_advertisement_carries_port_and_topics() {
        let options = Options {
            broadcasts: Some(json!(["hello", "world"])),
            port: 4321,
            ..Default::default()
        };
        let adv = build(Role::Pub, "p", &options);
        assert_eq!(adv["type"], "service");
        assert_eq!(adv["name"], "p");
        assert_eq!(adv["broadcasts"], json!(["hello", "world"]));
        assert_eq!(adv["key"], PAIRING_KEY);
        assert_eq!(adv["axon_type"], "pub-emitter");
        assert_eq!(adv["port"], 4321);
        assert!(adv.get("namespace").is_none());
    }

    #[test]
    fn subscriber_advertisement_has_no_port() {
        let options = Options {
            namespace: Some("n1".to_string()),
            subscribes_to: Some(json!(["hello"])),
            ..Default::default()
        };
        let adv = build(Role::Sub, "s", &options);
        assert_eq!(adv["axon_type"], "sub-emitter");
        assert_eq!(adv["namespace"], "n1");
        assert_eq!(adv["subscribesTo"], json!(["hello"]));
        assert!(adv.get("port").is_none());
        assert!(adv.get("broadcasts").is_none());
    }

    #[test]
    fn monitor_advertisement_is_type_monitor_port_zero() {
        let adv = build(Role::Mon, "m", &Options::default());
        assert_eq!(adv["type"], "monitor");
        assert_eq!(adv["port"], 0);
        assert!(adv.get("axon_type").is_none());
    }

    #[test]
    fn user_advertisement_is_kept_under_generated_members() {
        let options = Options {
            advertisement: Some(json!({"rack": "b2", "key": "spoofed", "type": "spoofed"})),
            ..Default::default()
        };
        let adv = build(Role::Req, "r", &options);
        // Unknown members round-trip
        assert_eq!(adv["rack"], "b2");
        // Generated members win
        assert_eq!(adv["key"], PAIRING_KEY);
        assert_eq!(adv["type"], "service");
        assert_eq!(adv["axon_type"], "req");
    }
}
