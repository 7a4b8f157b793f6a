//! Hello-beacon wire payload
//!
//! One JSON datagram per beacon. Field names follow the on-wire schema, so
//! serde renames cover the camelCase members.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ParleyError, ParleyResult};

/// Beacon event name; anything else is dropped on receive
pub(crate) const HELLO_EVENT: &str = "hello";

/// One discovery datagram
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Beacon {
    pub event: String,
    /// Instance id of the sending service
    pub iid: String,
    pub pid: u32,
    pub hostname: String,
    #[serde(rename = "isMaster", default)]
    pub is_master: bool,
    #[serde(default)]
    pub weight: f64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub advertisement: Option<Value>,
}

impl Beacon {
    pub fn encode(&self) -> ParleyResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(buf: &[u8]) -> ParleyResult<Beacon> {
        serde_json::from_slice(buf)
            .map_err(|e| ParleyError::Serialization(format!("bad beacon: {}", e)))
    }
}
