//! Node lifecycle and public API
//!
//! A node couples one discovery service and one socket transport: the
//! discovery side learns who is on the segment, the matcher decides which
//! of those peers to connect to, and the router fans inbound messages out
//! to subscriptions. The node is passive — after `start` everything happens
//! on the background threads of the two adapters, which call back in here
//! through weak handles.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use super::options::{OptionValue, Options};
use super::subs::{SubscriptionFn, SubscriptionTable};
use super::{advert, matcher, router, topic};
use crate::discovery::{Discovery, Peer};
use crate::error::{ParleyError, ParleyResult};
use crate::transport::{AmpSocket, Field, Message, SocketMode};

/// Node role on the segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Publisher: binds a listener and broadcasts to subscribers
    Pub,
    /// Subscriber: connects to publishers and receives broadcasts
    Sub,
    /// Requester: connects to repliers and awaits correlated replies
    Req,
    /// Replier: binds a listener and answers requests
    Rep,
    /// Monitor: observes discovery only, no transport
    Mon,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Pub => "pub",
            Role::Sub => "sub",
            Role::Req => "req",
            Role::Rep => "rep",
            Role::Mon => "mon",
        }
    }

    /// Role tag peers must advertise for this node to pair with them
    pub(crate) fn expected_axon_type(&self) -> Option<&'static str> {
        match self {
            Role::Pub => Some("sub-emitter"),
            Role::Sub => Some("pub-emitter"),
            Role::Req => Some("rep"),
            Role::Rep => Some("req"),
            Role::Mon => None,
        }
    }

    fn socket_mode(&self) -> Option<SocketMode> {
        match self {
            Role::Pub => Some(SocketMode::PubEmitter),
            Role::Sub => Some(SocketMode::SubEmitter),
            Role::Req => Some(SocketMode::Req),
            Role::Rep => Some(SocketMode::Rep),
            Role::Mon => None,
        }
    }

    /// Emitter roles bind a listener and advertise its port
    fn binds_listener(&self) -> bool {
        matches!(self, Role::Pub | Role::Rep)
    }

    /// Consumer roles accept subscriptions
    fn accepts_subscriptions(&self) -> bool {
        matches!(self, Role::Sub | Role::Rep)
    }
}

impl FromStr for Role {
    type Err = ParleyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pub" => Ok(Role::Pub),
            "sub" => Ok(Role::Sub),
            "req" => Ok(Role::Req),
            "rep" => Ok(Role::Rep),
            "mon" => Ok(Role::Mon),
            other => Err(ParleyError::invalid_input(format!(
                "unknown role '{}', expected pub/sub/req/rep/mon",
                other
            ))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type AddedFn = dyn Fn(&Node, &Peer) + Send + Sync;
pub type RemovedFn = dyn Fn(&Node, &Peer) + Send + Sync;
pub type MessageFn = dyn Fn(&Node, &Message) + Send + Sync;
pub type ErrorFn = dyn Fn(&Node, &str) + Send + Sync;

#[derive(Default)]
pub(crate) struct Callbacks {
    pub added: Mutex<Option<Arc<AddedFn>>>,
    pub removed: Mutex<Option<Arc<RemovedFn>>>,
    pub message: Mutex<Option<Arc<MessageFn>>>,
    pub error: Mutex<Option<Arc<ErrorFn>>>,
}

/// Field order is teardown order: discovery stops announcing before the
/// transport closes, subscriptions and options go last.
pub(crate) struct NodeInner {
    pub role: Role,
    pub name: String,
    pub discovery: Discovery,
    pub transport: Option<AmpSocket>,
    pub subs: Mutex<SubscriptionTable>,
    pub options: Mutex<Options>,
    pub callbacks: Callbacks,
    closed: AtomicBool,
}

/// A messaging node
///
/// Cheaply cloneable handle over shared state; the adapters hold weak
/// back-references, so dropping the last user handle tears the node down.
///
/// ```no_run
/// use parley_core::Node;
/// use serde_json::json;
///
/// let publisher = Node::new("pub", "weather")?;
/// publisher.set_option("broadcasts", json!(["sample"]))?;
/// publisher.start()?;
/// # Ok::<(), parley_core::ParleyError>(())
/// ```
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Create a node with a role (`"pub"`, `"sub"`, `"req"`, `"rep"`,
    /// `"mon"`) and a human-readable name
    ///
    /// The name is immutable afterwards. Monitors have no transport.
    pub fn new(role: &str, name: &str) -> ParleyResult<Node> {
        let role: Role = role.parse()?;
        let discovery = Discovery::new();

        // Segment timing defaults applied at node creation
        discovery.set_option("helloInterval", &OptionValue::Int(2000))?;
        discovery.set_option("checkInterval", &OptionValue::Int(4000))?;
        discovery.set_option("nodeTimeout", &OptionValue::Int(5000))?;
        discovery.set_option("masterTimeout", &OptionValue::Int(6000))?;

        let transport = role.socket_mode().map(AmpSocket::new);

        let inner = Arc::new(NodeInner {
            role,
            name: name.to_string(),
            discovery,
            transport,
            subs: Mutex::new(SubscriptionTable::new()),
            options: Mutex::new(Options::default()),
            callbacks: Callbacks::default(),
            closed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&inner);
        inner.discovery.on_added(move |peer| {
            if let Some(node) = Node::upgrade(&weak) {
                matcher::peer_added(&node, peer);
            }
        });
        let weak = Arc::downgrade(&inner);
        inner.discovery.on_removed(move |peer| {
            if let Some(node) = Node::upgrade(&weak) {
                matcher::peer_removed(&node, peer);
            }
        });
        let weak = Arc::downgrade(&inner);
        inner.discovery.on_error(move |err| {
            if let Some(node) = Node::upgrade(&weak) {
                node.report_error(err);
            }
        });
        if let Some(transport) = &inner.transport {
            let weak = Arc::downgrade(&inner);
            transport.on_error(move |err| {
                if let Some(node) = Node::upgrade(&weak) {
                    node.report_error(err);
                }
            });
        }

        Ok(Node { inner })
    }

    fn upgrade(weak: &Weak<NodeInner>) -> Option<Node> {
        weak.upgrade().map(|inner| Node { inner })
    }

    pub(crate) fn inner(&self) -> &NodeInner {
        &self.inner
    }

    /// Node role
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Node name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Set an option by wire name
    ///
    /// Messaging options are stored on the node; discovery options are
    /// forwarded. Every successful mutation refreshes the advertisement.
    pub fn set_option(&self, name: &str, value: impl Into<OptionValue>) -> ParleyResult<()> {
        let value = value.into();
        {
            let mut options = self.inner.options.lock();
            if !options.set(name, &value)? {
                self.inner.discovery.set_option(name, &value)?;
            }
        }
        self.refresh_advertisement();
        Ok(())
    }

    /// Replace the user advertisement merged under the generated members
    pub fn advertise(&self, advertisement: Option<Value>) {
        self.inner.options.lock().advertisement = advertisement;
        self.refresh_advertisement();
    }

    /// Register the peer-added event callback
    pub fn on_added<F: Fn(&Node, &Peer) + Send + Sync + 'static>(&self, f: F) {
        *self.inner.callbacks.added.lock() = Some(Arc::new(f));
    }

    /// Register the peer-removed event callback
    pub fn on_removed<F: Fn(&Node, &Peer) + Send + Sync + 'static>(&self, f: F) {
        *self.inner.callbacks.removed.lock() = Some(Arc::new(f));
    }

    /// Register the raw-message event callback, invoked before routing
    pub fn on_message<F: Fn(&Node, &Message) + Send + Sync + 'static>(&self, f: F) {
        *self.inner.callbacks.message.lock() = Some(Arc::new(f));
    }

    /// Register the error event callback
    ///
    /// Discovery and transport runtime errors are forwarded here as
    /// strings; nothing is fatal to the node itself.
    pub fn on_error<F: Fn(&Node, &str) + Send + Sync + 'static>(&self, f: F) {
        *self.inner.callbacks.error.lock() = Some(Arc::new(f));
    }

    /// Subscribe to a topic (sub and rep roles)
    ///
    /// The topic is stored in fulltopic form and matched as a regular
    /// expression against inbound topics. Subscribing twice under one
    /// topic replaces the callback in place.
    pub fn subscribe<F>(&self, topic: &str, callback: F) -> ParleyResult<()>
    where
        F: Fn(&Node, &str, &Message) -> Option<Message> + Send + Sync + 'static,
    {
        if !self.inner.role.accepts_subscriptions() {
            return Err(ParleyError::unsupported(format!(
                "{} nodes do not accept subscriptions",
                self.inner.role
            )));
        }
        let fulltopic = {
            let options = self.inner.options.lock();
            topic::fulltopic(self.inner.role, options.namespace.as_deref(), topic)
        };
        let callback: Arc<SubscriptionFn> = Arc::new(callback);
        self.inner.subs.lock().upsert(fulltopic, callback);
        Ok(())
    }

    /// Remove a subscription by its stored fulltopic
    ///
    /// The comparison is against the stored fulltopic verbatim, so under
    /// pub/sub namespacing the caller passes the prefixed form, not the
    /// user topic. Blocks while a dispatch to the entry is in flight; once
    /// this returns the callback will not fire again.
    pub fn unsubscribe(&self, fulltopic: &str) -> ParleyResult<()> {
        if !self.inner.role.accepts_subscriptions() {
            return Err(ParleyError::unsupported(format!(
                "{} nodes do not accept subscriptions",
                self.inner.role
            )));
        }
        self.inner.subs.lock().remove(fulltopic);
        Ok(())
    }

    /// Broadcast a message to every connected subscriber (pub role)
    ///
    /// The computed fulltopic is prepended as a string field.
    pub fn send(&self, topic: &str, fields: Vec<Field>) -> ParleyResult<()> {
        if self.inner.role != Role::Pub {
            return Err(ParleyError::unsupported(format!(
                "send is not available on {} nodes",
                self.inner.role
            )));
        }
        let transport = self.transport()?;
        let fulltopic = {
            let options = self.inner.options.lock();
            topic::fulltopic(self.inner.role, options.namespace.as_deref(), topic)
        };
        let mut msg = Message::from_fields(fields);
        msg.push_front(Field::Text(fulltopic));
        transport.send(&msg)
    }

    /// Send a request and block for the reply (req role)
    ///
    /// The body must be a JSON object; its `type` member is set to the
    /// topic. On timeout the call fails and a late reply is dropped.
    pub fn request(&self, topic: &str, body: Value, timeout: Duration) -> ParleyResult<Message> {
        if self.inner.role != Role::Req {
            return Err(ParleyError::unsupported(format!(
                "request is not available on {} nodes",
                self.inner.role
            )));
        }
        let mut body = match body {
            Value::Object(map) => map,
            _ => {
                return Err(ParleyError::invalid_input(
                    "request body must be a JSON object",
                ))
            }
        };
        body.insert("type".to_string(), Value::String(topic.to_string()));
        let msg = Message::from_fields(vec![Field::Json(Value::Object(body))]);
        self.transport()?.request(msg, timeout)
    }

    /// Build a reply message from fields
    ///
    /// Convenience for returning out of a replier subscription callback.
    pub fn reply(&self, fields: Vec<Field>) -> Message {
        Message::from_fields(fields)
    }

    /// Start the node; to be called once
    ///
    /// Emitter roles bind their listener first and defer discovery until
    /// the effective port is known; consumer roles and monitors announce
    /// immediately.
    pub fn start(&self) -> ParleyResult<()> {
        if self.inner.role.accepts_subscriptions() {
            let weak = Arc::downgrade(&self.inner);
            self.transport()?.on_message(move |msg| {
                Node::upgrade(&weak).and_then(|node| router::dispatch(&node, msg))
            });
        }

        if self.inner.role.binds_listener() {
            let weak = Arc::downgrade(&self.inner);
            let transport = self.transport()?;
            transport.on_bind(move |port| {
                if let Some(node) = Node::upgrade(&weak) {
                    node.inner.options.lock().port = port;
                    node.refresh_advertisement();
                    if let Err(e) = node.inner.discovery.start() {
                        node.report_error(&format!("unable to start discovery: {}", e));
                    }
                }
            });
            transport.bind(0)?;
            Ok(())
        } else {
            self.refresh_advertisement();
            self.inner.discovery.start()
        }
    }

    /// Tear the node down: discovery first, then the transport, then the
    /// subscription table
    ///
    /// Idempotent. Clearing the subscriptions takes the table lock, so an
    /// in-flight dispatch finishes before this returns.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.discovery.stop();
        if let Some(transport) = &self.inner.transport {
            transport.close();
        }
        self.inner.subs.lock().clear();
    }

    pub(crate) fn refresh_advertisement(&self) {
        let advertisement = {
            let options = self.inner.options.lock();
            advert::build(self.inner.role, &self.inner.name, &options)
        };
        self.inner.discovery.advertise(Some(advertisement));
    }

    pub(crate) fn report_error(&self, err: &str) {
        let handler = self.inner.callbacks.error.lock().clone();
        if let Some(f) = handler {
            f(self, err);
        }
    }

    fn transport(&self) -> ParleyResult<&AmpSocket> {
        self.inner.transport.as_ref().ok_or_else(|| {
            ParleyError::unsupported(format!(
                "{} nodes have no transport",
                self.inner.role
            ))
        })
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("role", &self.inner.role)
            .field("name", &self.inner.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn role_strings_parse() {
        for (s, role) in [
            ("pub", Role::Pub),
            ("sub", Role::Sub),
            ("req", Role::Req),
            ("rep", Role::Rep),
            ("mon", Role::Mon),
        ] {
            assert_eq!(s.parse::<Role>().unwrap(), role);
        }
        assert!("publisher".parse::<Role>().is_err());
    }

    #[test]
    fn create_validates_the_role() {
        assert!(Node::new("pub", "p").is_ok());
        assert!(Node::new("nope", "p").is_err());
    }

    #[test]
    fn monitor_has_no_transport() {
        let node = Node::new("mon", "m").unwrap();
        assert!(node.inner.transport.is_none());
    }

    #[test]
    fn subscribe_is_rejected_for_emitter_roles() {
        for role in ["pub", "req", "mon"] {
            let node = Node::new(role, "n").unwrap();
            let result = node.subscribe("t", |_, _, _| None);
            assert!(matches!(result, Err(ParleyError::Unsupported(_))));
            assert!(matches!(
                node.unsubscribe("t"),
                Err(ParleyError::Unsupported(_))
            ));
        }
    }

    #[test]
    fn send_is_rejected_off_role() {
        let sub = Node::new("sub", "s").unwrap();
        assert!(matches!(
            sub.send("t", vec![Field::Text("x".into())]),
            Err(ParleyError::Unsupported(_))
        ));
        let publisher = Node::new("pub", "p").unwrap();
        assert!(matches!(
            publisher.request("t", json!({}), Duration::from_millis(1)),
            Err(ParleyError::Unsupported(_))
        ));
    }

    #[test]
    fn request_body_must_be_an_object() {
        let req = Node::new("req", "r").unwrap();
        assert!(matches!(
            req.request("t", json!(["not", "an", "object"]), Duration::from_millis(1)),
            Err(ParleyError::InvalidInput(_))
        ));
    }

    #[test]
    fn subscription_is_stored_under_the_fulltopic() {
        let node = Node::new("sub", "s").unwrap();
        node.set_option("namespace", "n1").unwrap();
        node.subscribe("t", |_, _, _| None).unwrap();

        let subs = node.inner.subs.lock();
        assert_eq!(subs.iter().next().unwrap().fulltopic, "message::n1::t");
    }

    #[test]
    fn advertisement_refreshes_on_topic_list_changes() {
        let node = Node::new("pub", "p").unwrap();
        node.set_option("broadcasts", json!(["a", "b"])).unwrap();

        let adv = node.inner.discovery.advertisement().unwrap();
        assert_eq!(adv["broadcasts"], json!(["a", "b"]));
        assert_eq!(adv["name"], "p");

        node.set_option("broadcasts", json!(["c"])).unwrap();
        let adv = node.inner.discovery.advertisement().unwrap();
        assert_eq!(adv["broadcasts"], json!(["c"]));
    }

    #[test]
    fn unknown_option_name_is_rejected() {
        let node = Node::new("pub", "p").unwrap();
        assert!(node.set_option("namespaces", "oops").is_err());
    }
}
