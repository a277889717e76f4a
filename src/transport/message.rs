//! RPC message definitions
//!
//! Requests and responses exchanged with the broker and with each node's
//! control endpoint. Every request travels in a [`RequestEnvelope`] as one
//! JSON text message; the response echoes the request id.

use serde::{Deserialize, Serialize};

/// Outcome of a mutating RPC. `code == 0` is success; other codes are
/// specific to the call (see the registries).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub code: i32,
    pub status: String,
}

impl Confirmation {
    pub fn ok(status: impl Into<String>) -> Self {
        Self {
            code: 0,
            status: status.into(),
        }
    }

    pub fn rejected(code: i32, status: impl Into<String>) -> Self {
        Self {
            code,
            status: status.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

/// Address of one publisher of a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherInfo {
    pub publisher_id: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicDefinition {
    pub name: String,
    pub message_type: String,
}

/// A registered client as known by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub client_id: String,
    pub address: String,
    pub control_port: u16,
    pub data_port: u16,
    /// Milliseconds since the UNIX epoch.
    pub registered_at: i64,
}

impl ClientRecord {
    /// `address:control_port`, where the client's RPC endpoint listens.
    pub fn control_address(&self) -> String {
        format!("{}:{}", self.address, self.control_port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServingStatus {
    #[serde(rename = "serving")]
    Serving,
    #[serde(rename = "not_serving")]
    NotServing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RpcRequest {
    #[serde(rename = "register_client")]
    RegisterClient {
        client_id: String,
        address: String,
        control_port: u16,
        data_port: u16,
    },
    #[serde(rename = "deregister_client")]
    DeregisterClient { client_id: String },
    #[serde(rename = "get_client_info")]
    GetClientInfo { client_id: String },
    #[serde(rename = "get_registered_clients")]
    GetRegisteredClients,
    #[serde(rename = "advertise_topic")]
    AdvertiseTopic {
        publisher_id: String,
        host: String,
        port: u16,
        topic_name: String,
        message_type: String,
    },
    #[serde(rename = "subscribe_topic")]
    SubscribeTopic {
        subscriber_id: String,
        topic_name: String,
        message_type: String,
    },
    #[serde(rename = "list_topics")]
    ListTopics,
    #[serde(rename = "health_check")]
    HealthCheck,
    #[serde(rename = "inform_of_publisher")]
    InformOfPublisher {
        topic_name: String,
        publisher: PublisherInfo,
    },
    #[serde(rename = "inform_of_shutdown")]
    InformOfShutdown,
}

impl RpcRequest {
    pub fn method(&self) -> &'static str {
        match self {
            Self::RegisterClient { .. } => "register_client",
            Self::DeregisterClient { .. } => "deregister_client",
            Self::GetClientInfo { .. } => "get_client_info",
            Self::GetRegisteredClients => "get_registered_clients",
            Self::AdvertiseTopic { .. } => "advertise_topic",
            Self::SubscribeTopic { .. } => "subscribe_topic",
            Self::ListTopics => "list_topics",
            Self::HealthCheck => "health_check",
            Self::InformOfPublisher { .. } => "inform_of_publisher",
            Self::InformOfShutdown => "inform_of_shutdown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RpcResponse {
    #[serde(rename = "confirmation")]
    Confirmation(Confirmation),
    #[serde(rename = "subscription")]
    Subscription {
        confirmation: Confirmation,
        publishers: Vec<PublisherInfo>,
    },
    #[serde(rename = "topics")]
    Topics { topics: Vec<TopicDefinition> },
    #[serde(rename = "client_info")]
    ClientInfo { client: Option<ClientRecord> },
    #[serde(rename = "clients")]
    Clients { clients: Vec<ClientRecord> },
    #[serde(rename = "health")]
    Health { status: ServingStatus },
    #[serde(rename = "error")]
    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: String,
    pub request: RpcRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: String,
    pub response: RpcResponse,
}
