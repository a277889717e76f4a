//! Message types shipped with the crate.

use serde::{Deserialize, Serialize};

use crate::message::Message;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestMessage {
    pub test_string: String,
}

impl Message for TestMessage {
    const TYPE_NAME: &'static str = "TestMessage";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StringMessage {
    pub data: String,
}

impl Message for StringMessage {
    const TYPE_NAME: &'static str = "StringMessage";
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Int64Message {
    pub data: i64,
}

impl Message for Int64Message {
    const TYPE_NAME: &'static str = "Int64Message";
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Float64Message {
    pub data: f64,
}

impl Message for Float64Message {
    const TYPE_NAME: &'static str = "Float64Message";
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoolMessage {
    pub data: bool,
}

impl Message for BoolMessage {
    const TYPE_NAME: &'static str = "BoolMessage";
}

/// Carries no data; useful as a trigger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyMessage {}

impl Message for EmptyMessage {
    const TYPE_NAME: &'static str = "EmptyMessage";
}
