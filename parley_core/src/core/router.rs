//! Message router
//!
//! Handles the transport `message` event for the consumer roles. The first
//! field of an inbound message carries routing: a string fulltopic for
//! broadcasts, a JSON object with a `type` member for requests. Every
//! subscription whose stored fulltopic matches the inbound topic fires, in
//! insertion order, with the table lock held for the whole fan-out — an
//! `unsubscribe` returning therefore guarantees the callback is done.

use log::debug;
use regex::Regex;
use serde_json::Value;

use super::node::{Node, Role};
use super::topic;
use crate::transport::{Field, Message};

/// Transport `message` handler; the return value is the reply sent back to
/// the requester (replier role only)
pub(crate) fn dispatch(node: &Node, mut msg: Message) -> Option<Message> {
    let inner = node.inner();
    if msg.is_empty() {
        debug!("dropping message without fields");
        return None;
    }

    // The raw-message callback sees the message before routing
    let handler = inner.callbacks.message.lock().clone();
    if let Some(f) = handler {
        f(node, &msg);
    }

    // Namespace snapshot before the table lock; options never follow subs
    let namespace = inner.options.lock().namespace.clone();
    let subs = inner.subs.lock();
    if subs.is_empty() {
        return None;
    }

    match inner.role {
        Role::Sub => {
            if !matches!(msg.first(), Some(Field::Text(_))) {
                return None;
            }
            let inbound = match msg.pop_front() {
                Some(Field::Text(t)) => t,
                _ => return None,
            };
            let stripped = topic::strip(&inbound, namespace.as_deref());
            for sub in subs.iter() {
                match Regex::new(&sub.fulltopic) {
                    Ok(regex) if regex.is_match(&inbound) => {
                        // Subscriber replies are discarded
                        let _ = (sub.callback)(node, stripped, &msg);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!("skipping unparseable subscription '{}': {}", sub.fulltopic, e)
                    }
                }
            }
            None
        }
        Role::Rep => {
            // Detach the topic from the JSON body, leaving the rest intact
            let inbound = match msg.first_mut() {
                Some(Field::Json(Value::Object(body))) => match body.remove("type") {
                    Some(Value::String(t)) => t,
                    _ => {
                        debug!("dropping request without a type member");
                        return None;
                    }
                },
                _ => return None,
            };
            let mut reply = None;
            for sub in subs.iter() {
                match Regex::new(&sub.fulltopic) {
                    Ok(regex) if regex.is_match(&inbound) => {
                        if let Some(r) = (sub.callback)(node, &inbound, &msg) {
                            reply = Some(r);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!("skipping unparseable subscription '{}': {}", sub.fulltopic, e)
                    }
                }
            }
            reply
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use parking_lot::Mutex;

    fn text_message(topic: &str, payload: &str) -> Message {
        Message::from_fields(vec![
            Field::Text(topic.to_string()),
            Field::Text(payload.to_string()),
        ])
    }

    #[test]
    fn matching_subscription_receives_the_stripped_topic() {
        let node = Node::new("sub", "s").unwrap();
        node.set_option("namespace", "n").unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        node.subscribe("t", move |_, topic, msg| {
            log.lock().push((topic.to_string(), msg.len()));
            None
        })
        .unwrap();

        dispatch(&node, text_message("message::n::t", "world"));
        assert_eq!(seen.lock().as_slice(), &[("t".to_string(), 1)]);
    }

    #[test]
    fn non_matching_topic_fires_nothing() {
        let node = Node::new("sub", "s").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&hits);
        node.subscribe("t1", move |_, _, _| {
            count.fetch_add(1, Ordering::SeqCst);
            None
        })
        .unwrap();

        dispatch(&node, text_message("message::u1", "x"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn regex_subscription_matches_topic_family() {
        let node = Node::new("sub", "s").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        node.subscribe("^t.*", move |_, topic, _| {
            log.lock().push(topic.to_string());
            None
        })
        .unwrap();

        dispatch(&node, text_message("message::t1", "x"));
        dispatch(&node, text_message("message::t2", "x"));
        dispatch(&node, text_message("message::u1", "x"));
        assert_eq!(seen.lock().as_slice(), &["t1".to_string(), "t2".to_string()]);
    }

    #[test]
    fn multiple_matches_fire_in_insertion_order() {
        let node = Node::new("sub", "s").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let log = Arc::clone(&seen);
            node.subscribe("hello", move |_, _, _| {
                log.lock().push(tag);
                None
            })
            .unwrap();
        }
        // Same topic, distinct fulltopics via a broader pattern
        let log = Arc::clone(&seen);
        node.subscribe("hel.*", move |_, _, _| {
            log.lock().push("third");
            None
        })
        .unwrap();

        dispatch(&node, text_message("message::hello", "x"));
        // The two "hello" subscriptions collapsed into one entry
        assert_eq!(seen.lock().as_slice(), &["second", "third"]);
    }

    #[test]
    fn zero_field_message_is_dropped() {
        let node = Node::new("sub", "s").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&hits);
        node.subscribe(".*", move |_, _, _| {
            count.fetch_add(1, Ordering::SeqCst);
            None
        })
        .unwrap();
        assert!(dispatch(&node, Message::new()).is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn sub_first_field_must_be_text() {
        let node = Node::new("sub", "s").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&hits);
        node.subscribe(".*", move |_, _, _| {
            count.fetch_add(1, Ordering::SeqCst);
            None
        })
        .unwrap();
        dispatch(
            &node,
            Message::from_fields(vec![Field::BigInt(1), Field::Text("x".into())]),
        );
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn replier_gets_the_detached_type_and_last_reply_wins() {
        let node = Node::new("rep", "r").unwrap();
        node.subscribe("hello", |_, topic, msg| {
            assert_eq!(topic, "hello");
            // The type member is gone, the payload stays
            let body = msg.first().unwrap().as_json().unwrap();
            assert_eq!(body, &json!({"payload": "hi"}));
            Some(Message::from_fields(vec![Field::BigInt(1)]))
        })
        .unwrap();
        node.subscribe("hel.*", |_, _, _| None).unwrap();
        node.subscribe(".*", |_, _, _| {
            Some(Message::from_fields(vec![Field::BigInt(3)]))
        })
        .unwrap();

        let msg = Message::from_fields(vec![Field::Json(json!({
            "type": "hello",
            "payload": "hi",
        }))]);
        let reply = dispatch(&node, msg).unwrap();
        // Second subscription returned nothing, third overwrote the first
        assert_eq!(reply.first().unwrap().as_bigint(), Some(3));
    }

    #[test]
    fn request_without_type_is_dropped() {
        let node = Node::new("rep", "r").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&hits);
        node.subscribe(".*", move |_, _, _| {
            count.fetch_add(1, Ordering::SeqCst);
            None
        })
        .unwrap();
        let msg = Message::from_fields(vec![Field::Json(json!({"payload": "hi"}))]);
        assert!(dispatch(&node, msg).is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
