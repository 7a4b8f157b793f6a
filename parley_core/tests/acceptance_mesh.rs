//! End-to-end mesh acceptance tests.
//!
//! These tests drive real sockets on the local host: discovery beacons go
//! over a multicast group on a per-test UDP port (so parallel tests cannot
//! cross-talk) and messages flow over the TCP transport. Intervals are
//! shortened to keep the tests fast; every assertion polls with a deadline
//! instead of sleeping a fixed amount.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use parley_core::{Field, Message, Node};
use serde_json::{json, Value};

/// Multicast group shared by all tests; isolation comes from the port
const GROUP: &str = "239.255.42.42";

/// Generous ceiling for discovery plus connect on a loopback segment
const SETTLE: Duration = Duration::from_secs(10);

fn mesh_node(role: &str, name: &str, port: u16) -> Node {
    let node = Node::new(role, name).expect("node creation failed");
    node.set_option("port", port).unwrap();
    node.set_option("multicast", GROUP).unwrap();
    node.set_option("helloInterval", 100).unwrap();
    node.set_option("checkInterval", 200).unwrap();
    node.set_option("nodeTimeout", 700).unwrap();
    node.set_option("masterTimeout", 900).unwrap();
    node
}

fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    pred()
}

/// Publish `fields` on `topic` every 50 ms until `pred` holds
fn publish_until(
    publisher: &Node,
    topic: &str,
    fields: Vec<Field>,
    timeout: Duration,
    mut pred: impl FnMut() -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        publisher.send(topic, fields.clone()).unwrap();
        thread::sleep(Duration::from_millis(50));
    }
    pred()
}

#[test]
fn pub_sub_hello_path() {
    let publisher = mesh_node("pub", "p", 45211);
    publisher.set_option("broadcasts", json!(["hello"])).unwrap();

    let subscriber = mesh_node("sub", "s", 45211);
    subscriber
        .set_option("subscribesTo", json!(["hello"]))
        .unwrap();

    let received: Arc<Mutex<Vec<(String, Option<String>, usize)>>> =
        Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&received);
    subscriber
        .subscribe("hello", move |_, topic, msg| {
            let payload = msg.first().and_then(|f| f.as_text()).map(str::to_string);
            log.lock().unwrap().push((topic.to_string(), payload, msg.len()));
            None
        })
        .unwrap();

    publisher.start().unwrap();
    subscriber.start().unwrap();

    let delivered = publish_until(
        &publisher,
        "hello",
        vec![Field::Text("world".to_string())],
        SETTLE,
        || !received.lock().unwrap().is_empty(),
    );
    assert!(delivered, "subscriber never received the broadcast");

    for entry in received.lock().unwrap().iter() {
        assert_eq!(entry, &("hello".to_string(), Some("world".to_string()), 1));
    }

    publisher.close();
    subscriber.close();
}

#[test]
fn namespaces_isolate_identical_topics() {
    const PORT: u16 = 45212;
    let mut publishers = Vec::new();
    let mut logs = Vec::new();
    let mut subscribers = Vec::new();

    for ns in ["n1", "n2"] {
        let publisher = mesh_node("pub", &format!("p-{}", ns), PORT);
        publisher.set_option("namespace", ns).unwrap();
        publisher.set_option("broadcasts", json!(["hello"])).unwrap();

        let subscriber = mesh_node("sub", &format!("s-{}", ns), PORT);
        subscriber.set_option("namespace", ns).unwrap();
        subscriber
            .set_option("subscribesTo", json!(["hello"]))
            .unwrap();

        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        subscriber
            .subscribe("hello", move |_, _, msg| {
                if let Some(payload) = msg.first().and_then(|f| f.as_text()) {
                    log.lock().unwrap().push(payload.to_string());
                }
                None
            })
            .unwrap();

        publisher.start().unwrap();
        subscriber.start().unwrap();
        publishers.push(publisher);
        subscribers.push(subscriber);
        logs.push(seen);
    }

    // Drive both publishers until both subscribers heard something
    let deadline = Instant::now() + SETTLE;
    while Instant::now() < deadline {
        if logs.iter().all(|l| !l.lock().unwrap().is_empty()) {
            break;
        }
        publishers[0]
            .send("hello", vec![Field::Text("from-n1".to_string())])
            .unwrap();
        publishers[1]
            .send("hello", vec![Field::Text("from-n2".to_string())])
            .unwrap();
        thread::sleep(Duration::from_millis(50));
    }

    let n1_seen = logs[0].lock().unwrap().clone();
    let n2_seen = logs[1].lock().unwrap().clone();
    assert!(!n1_seen.is_empty(), "n1 subscriber heard nothing");
    assert!(!n2_seen.is_empty(), "n2 subscriber heard nothing");
    assert!(n1_seen.iter().all(|p| p == "from-n1"), "n1 leaked: {:?}", n1_seen);
    assert!(n2_seen.iter().all(|p| p == "from-n2"), "n2 leaked: {:?}", n2_seen);

    for node in publishers.iter().chain(subscribers.iter()) {
        node.close();
    }
}

#[test]
fn topic_patterns_select_the_broadcast_family() {
    let publisher = mesh_node("pub", "p", 45213);
    publisher
        .set_option("broadcasts", json!(["t1", "t2", "u1"]))
        .unwrap();

    let subscriber = mesh_node("sub", "s", 45213);
    subscriber
        .set_option("subscribesTo", json!(["^t.*"]))
        .unwrap();

    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    subscriber
        .subscribe("t.*", move |_, topic, _| {
            log.lock().unwrap().push(topic.to_string());
            None
        })
        .unwrap();

    publisher.start().unwrap();
    subscriber.start().unwrap();

    let heard_both = {
        let seen = Arc::clone(&seen);
        let deadline = Instant::now() + SETTLE;
        loop {
            {
                let seen = seen.lock().unwrap();
                if seen.iter().any(|t| t == "t1") && seen.iter().any(|t| t == "t2") {
                    break true;
                }
            }
            if Instant::now() >= deadline {
                break false;
            }
            for topic in ["t1", "t2", "u1"] {
                publisher
                    .send(topic, vec![Field::Text("x".to_string())])
                    .unwrap();
            }
            thread::sleep(Duration::from_millis(50));
        }
    };
    assert!(heard_both, "t1/t2 never arrived: {:?}", seen.lock().unwrap());

    // u1 went over the same connection as the t2 broadcasts; if it were
    // going to be dispatched it would have arrived by now
    assert!(
        seen.lock().unwrap().iter().all(|t| t == "t1" || t == "t2"),
        "unexpected topics: {:?}",
        seen.lock().unwrap()
    );

    publisher.close();
    subscriber.close();
}

#[test]
fn req_rep_round_trip() {
    let replier = mesh_node("rep", "answers", 45214);
    replier.set_option("respondsTo", json!(["hello"])).unwrap();

    let requests: Arc<Mutex<Vec<(String, Value)>>> = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&requests);
    replier
        .subscribe("hello", move |_, topic, msg| {
            let body = msg.first().and_then(|f| f.as_json()).cloned();
            log.lock().unwrap().push((topic.to_string(), body.unwrap_or(Value::Null)));
            Some(Message::from_fields(vec![Field::Json(
                json!({"goodbye": "world"}),
            )]))
        })
        .unwrap();

    let requester = mesh_node("req", "questions", 45214);
    requester.set_option("requests", json!(["hello"])).unwrap();
    let connected = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&connected);
    requester.on_added(move |_, _| {
        count.fetch_add(1, Ordering::SeqCst);
    });

    replier.start().unwrap();
    requester.start().unwrap();

    assert!(
        wait_until(SETTLE, || connected.load(Ordering::SeqCst) > 0),
        "requester never paired with the replier"
    );

    let reply = requester
        .request("hello", json!({"payload": "hi"}), Duration::from_millis(5000))
        .expect("request failed");
    assert_eq!(
        reply.first().unwrap().as_json().unwrap(),
        &json!({"goodbye": "world"})
    );

    let requests = requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    // The type member was detached before dispatch
    assert_eq!(requests[0], ("hello".to_string(), json!({"payload": "hi"})));

    replier.close();
    requester.close();
}

#[test]
fn resubscribing_replaces_the_callback() {
    let publisher = mesh_node("pub", "p", 45215);
    publisher.set_option("broadcasts", json!(["t"])).unwrap();

    let subscriber = mesh_node("sub", "s", 45215);
    subscriber.set_option("subscribesTo", json!(["t"])).unwrap();

    let first_hits = Arc::new(AtomicUsize::new(0));
    let second_hits = Arc::new(AtomicUsize::new(0));

    let count = Arc::clone(&first_hits);
    subscriber
        .subscribe("t", move |_, _, _| {
            count.fetch_add(1, Ordering::SeqCst);
            None
        })
        .unwrap();
    let count = Arc::clone(&second_hits);
    subscriber
        .subscribe("t", move |_, _, _| {
            count.fetch_add(1, Ordering::SeqCst);
            None
        })
        .unwrap();

    publisher.start().unwrap();
    subscriber.start().unwrap();

    let delivered = publish_until(
        &publisher,
        "t",
        vec![Field::BigInt(1)],
        SETTLE,
        || second_hits.load(Ordering::SeqCst) > 0,
    );
    assert!(delivered, "replacement callback never fired");
    assert_eq!(first_hits.load(Ordering::SeqCst), 0, "replaced callback fired");

    publisher.close();
    subscriber.close();
}

#[test]
fn departed_publisher_is_removed_and_replaced() {
    const PORT: u16 = 45216;

    let subscriber = mesh_node("sub", "s", PORT);
    subscriber.set_option("subscribesTo", json!(["t"])).unwrap();

    let added: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let removed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let payloads: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let log = Arc::clone(&added);
    subscriber.on_added(move |_, peer| {
        if let Some(name) = peer
            .advertisement
            .as_ref()
            .and_then(|a| a.get("name"))
            .and_then(Value::as_str)
        {
            log.lock().unwrap().push(name.to_string());
        }
    });
    let log = Arc::clone(&removed);
    subscriber.on_removed(move |_, peer| {
        if let Some(name) = peer
            .advertisement
            .as_ref()
            .and_then(|a| a.get("name"))
            .and_then(Value::as_str)
        {
            log.lock().unwrap().push(name.to_string());
        }
    });
    let log = Arc::clone(&payloads);
    subscriber
        .subscribe("t", move |_, _, msg| {
            if let Some(payload) = msg.first().and_then(|f| f.as_text()) {
                log.lock().unwrap().push(payload.to_string());
            }
            None
        })
        .unwrap();
    subscriber.start().unwrap();

    let first = mesh_node("pub", "p1", PORT);
    first.set_option("broadcasts", json!(["t"])).unwrap();
    first.start().unwrap();

    let delivered = publish_until(&first, "t", vec![Field::Text("one".to_string())], SETTLE, || {
        payloads.lock().unwrap().iter().any(|p| p == "one")
    });
    assert!(delivered, "first publisher never got through");

    // First publisher leaves the segment; its beacons stop and the node
    // timeout evicts it
    first.close();
    assert!(
        wait_until(SETTLE, || removed.lock().unwrap().iter().any(|n| n == "p1")),
        "removed event never fired for p1"
    );

    // A fresh publisher with the same topics is discovered and connected
    let second = mesh_node("pub", "p2", PORT);
    second.set_option("broadcasts", json!(["t"])).unwrap();
    second.start().unwrap();

    let delivered = publish_until(&second, "t", vec![Field::Text("two".to_string())], SETTLE, || {
        payloads.lock().unwrap().iter().any(|p| p == "two")
    });
    assert!(delivered, "second publisher never got through");
    assert!(added.lock().unwrap().iter().any(|n| n == "p2"));

    second.close();
    subscriber.close();
}

#[test]
fn monitor_observes_every_role() {
    const PORT: u16 = 45217;

    let monitor = mesh_node("mon", "m", PORT);
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    monitor.on_added(move |_, peer| {
        if let Some(name) = peer
            .advertisement
            .as_ref()
            .and_then(|a| a.get("name"))
            .and_then(Value::as_str)
        {
            log.lock().unwrap().push(name.to_string());
        }
    });
    monitor.start().unwrap();

    let publisher = mesh_node("pub", "p", PORT);
    publisher.set_option("broadcasts", json!(["t"])).unwrap();
    publisher.start().unwrap();

    let subscriber = mesh_node("sub", "s", PORT);
    subscriber.set_option("subscribesTo", json!(["t"])).unwrap();
    subscriber.start().unwrap();

    assert!(
        wait_until(SETTLE, || {
            let seen = seen.lock().unwrap();
            seen.iter().any(|n| n == "p") && seen.iter().any(|n| n == "s")
        }),
        "monitor missed a peer: {:?}",
        seen.lock().unwrap()
    );

    monitor.close();
    publisher.close();
    subscriber.close();
}
