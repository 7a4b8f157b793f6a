//! Core coupling layer
//!
//! Everything that sits between discovery and the transport: the node
//! entity and its option store, the advertisement builder, the topic
//! namer, the subscription table, the peer matcher and the message router.

pub(crate) mod advert;
pub(crate) mod matcher;
pub mod node;
pub mod options;
pub(crate) mod router;
pub mod subs;
pub(crate) mod topic;

pub use node::{Node, Role};
pub use options::OptionValue;
pub use subs::SubscriptionFn;
