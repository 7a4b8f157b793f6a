//! # Parley
//!
//! Zero-configuration decentralized messaging for peer services.
//!
//! This crate is the user-facing entry point; the implementation lives in
//! [`parley_core`]. Declare a node with a role and its topic interests,
//! start it, and the mesh takes care of who talks to whom:
//!
//! ```rust,no_run
//! use parley::prelude::*;
//! use parley::serde_json::json;
//!
//! let subscriber = Node::new("sub", "dashboard")?;
//! subscriber.set_option("subscribesTo", json!(["metrics.*"]))?;
//! subscriber.subscribe("metrics.cpu", |_node, topic, msg| {
//!     println!("{}: {:?}", topic, msg.first());
//!     None
//! })?;
//! subscriber.start()?;
//! # Ok::<(), parley::ParleyError>(())
//! ```

// Re-export core components
pub use parley_core::{self, *};

// Re-export serde_json at crate root for consistent JSON value usage
pub use parley_core::serde_json;

/// The Parley prelude — everything you need to get started
///
/// Just add `use parley::prelude::*;`.
pub mod prelude {
    pub use parley_core::core::{Node, OptionValue, Role};
    pub use parley_core::discovery::Peer;
    pub use parley_core::error::{ParleyError, ParleyResult};
    pub use parley_core::transport::{Field, Message};
}
