//! Node option store
//!
//! Options reach the node as `(name, value)` pairs. Messaging options
//! (namespace, topic lists, advertisement override) are deep-copied into
//! the [`Options`] record here; every other recognized name belongs to the
//! discovery layer and is forwarded verbatim by the node.

use serde_json::Value;
use std::time::Duration;

use crate::error::{ParleyError, ParleyResult};

/// Dynamically typed option value
///
/// The option surface is name-driven, so values arrive as a small tagged
/// union instead of per-option setters. `From` impls cover the common Rust
/// types, so call sites can pass plain literals.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Json(Value),
}

impl OptionValue {
    fn type_error(&self, wanted: &str) -> ParleyError {
        ParleyError::invalid_input(format!("expected {} value, got {:?}", wanted, self))
    }

    pub(crate) fn as_millis(&self) -> ParleyResult<Duration> {
        match self {
            OptionValue::Int(n) if *n >= 0 => Ok(Duration::from_millis(*n as u64)),
            _ => Err(self.type_error("non-negative millisecond")),
        }
    }

    pub(crate) fn as_port(&self) -> ParleyResult<u16> {
        match self {
            OptionValue::Int(n) if (0..=u16::MAX as i64).contains(n) => Ok(*n as u16),
            _ => Err(self.type_error("port")),
        }
    }

    pub(crate) fn as_u32(&self) -> ParleyResult<u32> {
        match self {
            OptionValue::Int(n) if (0..=u32::MAX as i64).contains(n) => Ok(*n as u32),
            _ => Err(self.type_error("unsigned integer")),
        }
    }

    pub(crate) fn as_f64(&self) -> ParleyResult<f64> {
        match self {
            OptionValue::Float(f) => Ok(*f),
            OptionValue::Int(n) => Ok(*n as f64),
            _ => Err(self.type_error("numeric")),
        }
    }

    pub(crate) fn as_bool(&self) -> ParleyResult<bool> {
        match self {
            OptionValue::Bool(b) => Ok(*b),
            _ => Err(self.type_error("boolean")),
        }
    }

    pub(crate) fn as_str(&self) -> ParleyResult<&str> {
        match self {
            OptionValue::Str(s) => Ok(s),
            _ => Err(self.type_error("string")),
        }
    }

    /// JSON value; `null` clears the option
    pub(crate) fn as_json_opt(&self) -> ParleyResult<Option<Value>> {
        match self {
            OptionValue::Json(Value::Null) => Ok(None),
            OptionValue::Json(v) => Ok(Some(v.clone())),
            _ => Err(self.type_error("JSON")),
        }
    }

    /// JSON array of strings; `null` clears the option
    fn as_topic_list(&self) -> ParleyResult<Option<Value>> {
        match self.as_json_opt()? {
            None => Ok(None),
            Some(v) if v.as_array().map(|a| a.iter().all(Value::is_string)) == Some(true) => {
                Ok(Some(v))
            }
            Some(_) => Err(self.type_error("JSON array of strings")),
        }
    }

    /// Single string or JSON array of strings
    pub(crate) fn as_string_list(&self) -> ParleyResult<Vec<String>> {
        match self {
            OptionValue::Str(s) => Ok(vec![s.clone()]),
            OptionValue::Json(Value::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| self.type_error("string list"))
                })
                .collect(),
            _ => Err(self.type_error("string list")),
        }
    }
}

impl From<i64> for OptionValue {
    fn from(n: i64) -> Self {
        OptionValue::Int(n)
    }
}

impl From<i32> for OptionValue {
    fn from(n: i32) -> Self {
        OptionValue::Int(n as i64)
    }
}

impl From<u16> for OptionValue {
    fn from(n: u16) -> Self {
        OptionValue::Int(n as i64)
    }
}

impl From<f64> for OptionValue {
    fn from(f: f64) -> Self {
        OptionValue::Float(f)
    }
}

impl From<bool> for OptionValue {
    fn from(b: bool) -> Self {
        OptionValue::Bool(b)
    }
}

impl From<&str> for OptionValue {
    fn from(s: &str) -> Self {
        OptionValue::Str(s.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(s: String) -> Self {
        OptionValue::Str(s)
    }
}

impl From<Value> for OptionValue {
    fn from(v: Value) -> Self {
        OptionValue::Json(v)
    }
}

impl From<Vec<&str>> for OptionValue {
    fn from(items: Vec<&str>) -> Self {
        OptionValue::Json(Value::Array(
            items.into_iter().map(|s| Value::String(s.to_string())).collect(),
        ))
    }
}

/// Messaging options owned by the node
///
/// `port` is the bound listener port, written by the transport bind event;
/// it lives here because the advertisement builder reads it together with
/// everything else under the one options lock.
#[derive(Debug, Default)]
pub(crate) struct Options {
    pub namespace: Option<String>,
    pub use_hostnames: bool,
    pub advertisement: Option<Value>,
    pub broadcasts: Option<Value>,
    pub subscribes_to: Option<Value>,
    pub requests: Option<Value>,
    pub responds_to: Option<Value>,
    pub port: u16,
}

impl Options {
    /// Apply a node-local option
    ///
    /// Returns `Ok(false)` when the name is not a messaging option, in
    /// which case the caller forwards it to discovery.
    pub fn set(&mut self, name: &str, value: &OptionValue) -> ParleyResult<bool> {
        match name {
            "namespace" => self.namespace = Some(value.as_str()?.to_string()),
            "useHostNames" => self.use_hostnames = value.as_bool()?,
            "advertisement" => self.advertisement = value.as_json_opt()?,
            "broadcasts" => self.broadcasts = value.as_topic_list()?,
            "subscribesTo" => self.subscribes_to = value.as_topic_list()?,
            "requests" => self.requests = value.as_topic_list()?,
            "respondsTo" => self.responds_to = value.as_topic_list()?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn messaging_names_are_handled_locally() {
        let mut opts = Options::default();
        assert!(opts.set("namespace", &"n1".into()).unwrap());
        assert!(opts.set("useHostNames", &true.into()).unwrap());
        assert!(opts
            .set("broadcasts", &json!(["a", "b"]).into())
            .unwrap());
        assert_eq!(opts.namespace.as_deref(), Some("n1"));
        assert!(opts.use_hostnames);
        assert_eq!(opts.broadcasts, Some(json!(["a", "b"])));
    }

    #[test]
    fn discovery_names_fall_through() {
        let mut opts = Options::default();
        assert!(!opts.set("helloInterval", &2000.into()).unwrap());
        assert!(!opts.set("multicast", &"239.1.2.3".into()).unwrap());
    }

    #[test]
    fn null_clears_a_topic_list() {
        let mut opts = Options::default();
        opts.set("subscribesTo", &json!(["t"]).into()).unwrap();
        assert!(opts.subscribes_to.is_some());
        opts.set("subscribesTo", &Value::Null.into()).unwrap();
        assert!(opts.subscribes_to.is_none());
    }

    #[test]
    fn topic_list_must_hold_strings() {
        let mut opts = Options::default();
        assert!(opts.set("broadcasts", &json!(["ok", 3]).into()).is_err());
        assert!(opts.set("broadcasts", &json!({"not": "array"}).into()).is_err());
    }
}
