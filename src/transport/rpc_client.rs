//! RPC client
//!
//! `RpcClient` is the handle every component uses to talk to a broker or to
//! another node's control endpoint. It is created once with the target
//! address and passed to whoever issues calls; there is no process-wide
//! channel.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use crate::transport::message::{
    ClientRecord, Confirmation, PublisherInfo, RequestEnvelope, ResponseEnvelope, RpcRequest,
    RpcResponse, ServingStatus, TopicDefinition,
};
use crate::utils::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct RpcClient {
    address: String,
    timeout: Duration,
}

impl RpcClient {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            address: self.address.clone(),
            timeout,
        }
    }

    /// Issues one request on a fresh connection and waits for its response.
    pub async fn call(&self, request: RpcRequest) -> Result<RpcResponse> {
        tokio::time::timeout(self.timeout, self.exchange(request))
            .await
            .map_err(|_| Error::RpcTimeout(self.address.clone()))?
    }

    async fn exchange(&self, request: RpcRequest) -> Result<RpcResponse> {
        let url = format!("ws://{}", self.address);
        let (mut ws_stream, _response) = connect_async(url.as_str()).await?;

        let id = Uuid::new_v4().to_string();
        let envelope = RequestEnvelope {
            id: id.clone(),
            request,
        };
        ws_stream
            .send(WsMessage::text(serde_json::to_string(&envelope)?))
            .await?;

        let response = loop {
            match ws_stream.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    let reply: ResponseEnvelope = serde_json::from_str(text.as_str())?;
                    if reply.id == id || reply.id.is_empty() {
                        break reply.response;
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    return Err(Error::RpcClosed(self.address.clone()));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        };

        let _ = ws_stream.close(None).await;
        Ok(response)
    }

    async fn confirm(&self, request: RpcRequest) -> Result<Confirmation> {
        match self.call(request).await? {
            RpcResponse::Confirmation(confirmation) => Ok(confirmation),
            other => Err(unexpected(other)),
        }
    }

    pub async fn register_client(
        &self,
        client_id: &str,
        address: &str,
        control_port: u16,
        data_port: u16,
    ) -> Result<Confirmation> {
        self.confirm(RpcRequest::RegisterClient {
            client_id: client_id.to_string(),
            address: address.to_string(),
            control_port,
            data_port,
        })
        .await
    }

    pub async fn deregister_client(&self, client_id: &str) -> Result<Confirmation> {
        self.confirm(RpcRequest::DeregisterClient {
            client_id: client_id.to_string(),
        })
        .await
    }

    pub async fn get_client_info(&self, client_id: &str) -> Result<Option<ClientRecord>> {
        match self
            .call(RpcRequest::GetClientInfo {
                client_id: client_id.to_string(),
            })
            .await?
        {
            RpcResponse::ClientInfo { client } => Ok(client),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_registered_clients(&self) -> Result<Vec<ClientRecord>> {
        match self.call(RpcRequest::GetRegisteredClients).await? {
            RpcResponse::Clients { clients } => Ok(clients),
            other => Err(unexpected(other)),
        }
    }

    pub async fn advertise_topic(
        &self,
        publisher_id: &str,
        host: &str,
        port: u16,
        topic_name: &str,
        message_type: &str,
    ) -> Result<Confirmation> {
        self.confirm(RpcRequest::AdvertiseTopic {
            publisher_id: publisher_id.to_string(),
            host: host.to_string(),
            port,
            topic_name: topic_name.to_string(),
            message_type: message_type.to_string(),
        })
        .await
    }

    pub async fn subscribe_topic(
        &self,
        subscriber_id: &str,
        topic_name: &str,
        message_type: &str,
    ) -> Result<(Confirmation, Vec<PublisherInfo>)> {
        match self
            .call(RpcRequest::SubscribeTopic {
                subscriber_id: subscriber_id.to_string(),
                topic_name: topic_name.to_string(),
                message_type: message_type.to_string(),
            })
            .await?
        {
            RpcResponse::Subscription {
                confirmation,
                publishers,
            } => Ok((confirmation, publishers)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list_topics(&self) -> Result<Vec<TopicDefinition>> {
        match self.call(RpcRequest::ListTopics).await? {
            RpcResponse::Topics { topics } => Ok(topics),
            other => Err(unexpected(other)),
        }
    }

    pub async fn health_check(&self) -> Result<ServingStatus> {
        match self.call(RpcRequest::HealthCheck).await? {
            RpcResponse::Health { status } => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    pub async fn inform_of_publisher(
        &self,
        topic_name: &str,
        publisher: PublisherInfo,
    ) -> Result<Confirmation> {
        self.confirm(RpcRequest::InformOfPublisher {
            topic_name: topic_name.to_string(),
            publisher,
        })
        .await
    }

    pub async fn inform_of_shutdown(&self) -> Result<Confirmation> {
        self.confirm(RpcRequest::InformOfShutdown).await
    }
}

fn unexpected(response: RpcResponse) -> Error {
    match response {
        RpcResponse::Error { message } => Error::UnexpectedResponse(message),
        other => Error::UnexpectedResponse(format!("{other:?}")),
    }
}
