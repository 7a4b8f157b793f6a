//! Wire transport for Parley
//!
//! AMP typed-field messages ([`amp`]) carried over point-to-point TCP
//! sockets ([`socket`]). The core couples this layer to discovery: the peer
//! matcher opens connections, the message router consumes what they
//! deliver.

pub mod amp;
pub mod socket;

pub use amp::{Field, Message, MAX_FIELDS};
pub use socket::{AmpSocket, SocketMode};
