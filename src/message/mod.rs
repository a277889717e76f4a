//! The `message` module defines what travels inside a data frame.
//!
//! A message type is any serde type implementing [`Message`]; its
//! `TYPE_NAME` is written into the frame header and checked against the
//! topic's declared type on both ends. Tools that only know a type by name
//! go through the [`MessageRegistry`], a closed table of decode and encode
//! functions filled in at startup.

pub mod std_msgs;

use std::collections::HashMap;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::utils::error::{Error, Result};

pub use std_msgs::{
    BoolMessage, EmptyMessage, Float64Message, Int64Message, StringMessage, TestMessage,
};

/// A payload that can be published on a topic.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Name written into every frame carrying this type.
    const TYPE_NAME: &'static str;

    fn encode_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn decode_payload(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

type DecodeFn = fn(&[u8]) -> Result<Value>;
type EncodeFn = fn(&Value) -> Result<Vec<u8>>;

#[derive(Clone, Copy)]
struct Entry {
    decode: DecodeFn,
    encode: EncodeFn,
}

fn decode_as<M: Message>(payload: &[u8]) -> Result<Value> {
    let message = M::decode_payload(payload)?;
    Ok(serde_json::to_value(message)?)
}

fn encode_as<M: Message>(value: &Value) -> Result<Vec<u8>> {
    // round-trip through M so that only well-formed payloads go out
    let message: M = serde_json::from_value(value.clone())?;
    message.encode_payload()
}

/// Type name to codec lookup for callers without a compile-time type.
#[derive(Clone, Default)]
pub struct MessageRegistry {
    entries: HashMap<String, Entry>,
}

impl std::fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRegistry")
            .field("types", &self.type_names())
            .finish()
    }
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every type from [`std_msgs`].
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register::<TestMessage>();
        registry.register::<StringMessage>();
        registry.register::<Int64Message>();
        registry.register::<Float64Message>();
        registry.register::<BoolMessage>();
        registry.register::<EmptyMessage>();
        registry
    }

    /// Adds `M`, replacing any earlier entry with the same type name.
    pub fn register<M: Message>(&mut self) -> &mut Self {
        self.entries.insert(
            M::TYPE_NAME.to_string(),
            Entry {
                decode: decode_as::<M>,
                encode: encode_as::<M>,
            },
        );
        self
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.entries.contains_key(type_name)
    }

    /// Registered type names, sorted.
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn decode(&self, type_name: &str, payload: &[u8]) -> Result<Value> {
        let entry = self.entry(type_name)?;
        (entry.decode)(payload)
    }

    pub fn encode(&self, type_name: &str, value: &Value) -> Result<Vec<u8>> {
        let entry = self.entry(type_name)?;
        (entry.encode)(value)
    }

    fn entry(&self, type_name: &str) -> Result<Entry> {
        self.entries
            .get(type_name)
            .copied()
            .ok_or_else(|| Error::UnknownMessageType(type_name.to_string()))
    }
}

#[cfg(test)]
mod tests;
