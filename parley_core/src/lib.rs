//! # Parley Core
//!
//! Zero-configuration decentralized messaging for peer services.
//!
//! Each process hosts one or more [`Node`]s. A node declares a role —
//! publisher, subscriber, requester, replier or monitor — and the topics it
//! emits or consumes. Nodes on the same network segment find each other
//! over UDP hello beacons and connect only where their advertised topics
//! match, so applications never configure addresses, ports or routes.
//!
//! The crate is organized as three subsystems:
//!
//! - **core**: the node entity plus the matching layer that couples the
//!   other two — option store, advertisement builder, peer matcher,
//!   subscription table and message router
//! - **discovery**: the UDP beacon service that learns who is on the
//!   segment
//! - **transport**: typed multi-field messages over point-to-point TCP
//!   with broadcast and request/reply patterns
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use parley_core::{Field, Node};
//! use serde_json::json;
//!
//! let publisher = Node::new("pub", "weather")?;
//! publisher.set_option("broadcasts", json!(["sample"]))?;
//! publisher.start()?;
//! publisher.send("sample", vec![Field::Text("21.5C".into())])?;
//! # Ok::<(), parley_core::ParleyError>(())
//! ```
//!
//! A subscriber on the same segment mirrors this with `subscribesTo` and
//! [`Node::subscribe`]; no endpoint configuration is involved.

pub mod core;
pub mod discovery;
pub mod error;
pub mod transport;

// Re-export commonly used types for easy access
pub use crate::core::{Node, OptionValue, Role, SubscriptionFn};
pub use crate::discovery::{Discovery, DiscoveryOptions, Peer};
pub use crate::error::{ParleyError, ParleyResult};
pub use crate::transport::{AmpSocket, Field, Message, SocketMode};

// Re-export serde_json for consistent JSON value usage downstream
pub use serde_json;
