//! # PopMesh
//!
//! `popmesh` is a lightweight publish/subscribe middleware for coordinating
//! processes. Nodes register with a central broker, advertise or subscribe
//! to named, typed topics and then exchange framed messages directly over
//! node-to-node sockets. The broker only does discovery; it never carries
//! message data.
//!
//! ## Core Modules
//!
//! - `broker`: client and topic registries, and the loop that tells
//!   subscribers about new publishers.
//! - `node`: the client-side facade with its publishers and subscribers.
//! - `message`: the `Message` trait, built-in message types and the
//!   type-name registry.
//! - `transport`: wire framing, framed socket channels and the WebSocket
//!   RPC protocol.
//! - `config`: loading settings from files and the environment.
//! - `utils`: the crate error type, logging and port discovery.

pub mod broker;
pub mod config;
pub mod message;
pub mod node;
pub mod transport;
pub mod utils;

pub use crate::broker::Broker;
pub use crate::config::{Settings, load_config};
pub use crate::message::{Message, MessageRegistry};
pub use crate::node::{Node, Publisher};
pub use crate::utils::error::{Error, Result};

#[cfg(test)]
mod tests;
