use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::broker::announcement::{Announcement, AnnouncementQueue, Backoff};
use crate::broker::client::ClientRegistry;
use crate::broker::topic::{Topic, TopicRegistry};
use crate::config::BrokerSettings;
use crate::transport::channel::{Shutdown, ShutdownListener, TaskSet};
use crate::transport::message::{
    ClientRecord, PublisherInfo, RpcRequest, RpcResponse, ServingStatus,
};
use crate::transport::rpc_client::RpcClient;
use crate::transport::rpc_server::{RpcHandler, RpcServer};
use crate::utils::error::Result;

/// Broker state and the RPC surface over it: client registration, topic
/// discovery and health.
///
/// Deregistering a client cascades into the topic registry, removing the
/// client from every topic and garbage-collecting orphaned topics.
#[derive(Debug)]
pub struct BrokerServices {
    topics: Arc<TopicRegistry>,
    clients: ClientRegistry,
    announcements: AnnouncementQueue,
}

impl Default for BrokerServices {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of one announcement delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Delivered,
    /// Nothing left to deliver to; dropped without retry.
    Stale,
    Failed,
}

impl BrokerServices {
    pub fn new() -> Self {
        let topics = Arc::new(TopicRegistry::new());
        let cascade = topics.clone();
        let clients = ClientRegistry::new(Box::new(move |client_id| {
            let orphans = cascade.remove_client(client_id);
            if !orphans.is_empty() {
                info!("removed orphaned topics {orphans:?} after {client_id} left");
            }
        }));
        Self {
            topics,
            clients,
            announcements: AnnouncementQueue::new(),
        }
    }

    pub fn topics(&self) -> &TopicRegistry {
        &self.topics
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    pub fn announcements(&self) -> &AnnouncementQueue {
        &self.announcements
    }

    fn dispatch(&self, request: RpcRequest) -> RpcResponse {
        match request {
            RpcRequest::RegisterClient {
                client_id,
                address,
                control_port,
                data_port,
            } => {
                let confirmation = self.clients.register(ClientRecord {
                    client_id: client_id.clone(),
                    address,
                    control_port,
                    data_port,
                    registered_at: chrono::Utc::now().timestamp_millis(),
                });
                if confirmation.is_ok() {
                    info!("registered client {client_id}");
                } else {
                    error!("rejected registration: {}", confirmation.status);
                }
                RpcResponse::Confirmation(confirmation)
            }
            RpcRequest::DeregisterClient { client_id } => {
                let confirmation = self.clients.deregister(&client_id);
                if confirmation.is_ok() {
                    info!("deregistered client {client_id}");
                } else {
                    error!("rejected deregistration: {}", confirmation.status);
                }
                RpcResponse::Confirmation(confirmation)
            }
            RpcRequest::GetClientInfo { client_id } => RpcResponse::ClientInfo {
                client: self.clients.get(&client_id),
            },
            RpcRequest::GetRegisteredClients => RpcResponse::Clients {
                clients: self.clients.list(),
            },
            RpcRequest::AdvertiseTopic {
                publisher_id,
                host,
                port,
                topic_name,
                message_type,
            } => {
                let publisher = PublisherInfo {
                    publisher_id: publisher_id.clone(),
                    host,
                    port,
                };
                let (confirmation, announcements) =
                    self.topics.advertise(publisher, &topic_name, &message_type);
                if confirmation.is_ok() {
                    info!(
                        "{publisher_id} advertises {topic_name} [{message_type}], {} to announce",
                        announcements.len()
                    );
                    self.announcements.extend(announcements);
                } else {
                    error!(
                        "rejected advertise of {topic_name} by {publisher_id}: {}",
                        confirmation.status
                    );
                }
                RpcResponse::Confirmation(confirmation)
            }
            RpcRequest::SubscribeTopic {
                subscriber_id,
                topic_name,
                message_type,
            } => {
                let (confirmation, publishers) =
                    self.topics.subscribe(&subscriber_id, &topic_name, &message_type);
                if confirmation.is_ok() {
                    info!(
                        "{subscriber_id} subscribes to {topic_name} [{message_type}], {} publisher(s)",
                        publishers.len()
                    );
                } else {
                    error!(
                        "rejected subscription of {subscriber_id} to {topic_name}: {}",
                        confirmation.status
                    );
                }
                RpcResponse::Subscription {
                    confirmation,
                    publishers,
                }
            }
            RpcRequest::ListTopics => RpcResponse::Topics {
                topics: self.topics.list(),
            },
            RpcRequest::HealthCheck => RpcResponse::Health {
                status: ServingStatus::Serving,
            },
            other @ (RpcRequest::InformOfPublisher { .. } | RpcRequest::InformOfShutdown) => {
                RpcResponse::Error {
                    message: format!("{} is served by nodes, not the broker", other.method()),
                }
            }
        }
    }

    /// Tells one subscriber's node about a publisher.
    async fn deliver(&self, announcement: &Announcement, timeout: Duration) -> Delivery {
        let Announcement {
            publisher_id,
            topic_name,
            subscriber_id,
            ..
        } = announcement;

        let Some(publisher) = self.topics.publisher_of(topic_name, publisher_id) else {
            debug!("{publisher_id} no longer publishes {topic_name}, dropping announcement");
            return Delivery::Stale;
        };
        if !self.topics.is_subscribed(topic_name, subscriber_id) {
            debug!("{subscriber_id} left {topic_name}, dropping announcement");
            return Delivery::Stale;
        }
        let Some(record) = self.clients.get(subscriber_id) else {
            warn!("subscriber {subscriber_id} of {topic_name} is not a registered client, skipping");
            return Delivery::Stale;
        };

        let client = RpcClient::new(record.control_address(), timeout);
        match client.inform_of_publisher(topic_name, publisher).await {
            Ok(confirmation) if confirmation.is_ok() => {
                debug!("informed {subscriber_id} of {publisher_id} on {topic_name}");
                Delivery::Delivered
            }
            Ok(confirmation) => {
                warn!(
                    "{subscriber_id} refused {publisher_id} on {topic_name} ({}): {}",
                    confirmation.code, confirmation.status
                );
                Delivery::Failed
            }
            Err(e) => {
                warn!("informing {subscriber_id} of {publisher_id} on {topic_name} failed: {e}");
                Delivery::Failed
            }
        }
    }
}

impl RpcHandler for BrokerServices {
    async fn handle(&self, request: RpcRequest) -> RpcResponse {
        self.dispatch(request)
    }
}

/// A running broker: the RPC endpoint plus the announcement loop.
#[derive(Debug)]
pub struct Broker {
    services: Arc<BrokerServices>,
    rpc_server: RpcServer,
    settings: BrokerSettings,
    shutdown: Shutdown,
    tasks: TaskSet,
}

impl Broker {
    /// Binds `settings.host:settings.port` and starts serving.
    pub async fn bind(settings: BrokerSettings) -> Result<Self> {
        let listener = TcpListener::bind((settings.host.as_str(), settings.port)).await?;
        let services = Arc::new(BrokerServices::new());
        let rpc_server = RpcServer::start(listener, services.clone())?;

        let shutdown = Shutdown::new();
        let tasks = TaskSet::default();
        tasks.spawn(announce_loop(
            services.clone(),
            settings.clone(),
            shutdown.listener(),
        ));
        info!("broker serving on {}", rpc_server.local_addr());

        Ok(Self {
            services,
            rpc_server,
            settings,
            shutdown,
            tasks,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.rpc_server.local_addr()
    }

    pub fn services(&self) -> &BrokerServices {
        &self.services
    }

    pub fn topic_snapshot(&self, topic_name: &str) -> Option<Topic> {
        self.services.topics.snapshot(topic_name)
    }

    pub fn registered_clients(&self) -> Vec<ClientRecord> {
        self.services.clients.list()
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_triggered()
    }

    /// Stops the broker. With `notify_clients`, every registered client is
    /// first sent `inform_of_shutdown`; errors and timeouts are ignored.
    pub async fn shutdown(&self, notify_clients: bool) {
        if !self.shutdown.trigger() {
            return;
        }
        if notify_clients {
            let timeout = Duration::from_millis(self.settings.shutdown_notify_timeout_ms);
            let clients = self.services.clients.list();
            info!("informing {} client(s) of shutdown", clients.len());
            join_all(clients.iter().map(|record| async move {
                let client = RpcClient::new(record.control_address(), timeout);
                if let Err(e) = client.inform_of_shutdown().await {
                    debug!("could not inform {} of shutdown: {e}", record.client_id);
                }
            }))
            .await;
        }
        self.tasks.join_all().await;
        self.rpc_server.shutdown().await;
        info!("broker stopped");
    }
}

async fn announce_loop(
    services: Arc<BrokerServices>,
    settings: BrokerSettings,
    mut shutdown: ShutdownListener,
) {
    let backoff = Backoff::from_settings(&settings);
    let timeout = Duration::from_millis(settings.rpc_timeout_ms);
    let mut ticker = tokio::time::interval(settings.tick());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = ticker.tick() => {}
        }

        let due = services.announcements.take_due(Instant::now());
        if due.is_empty() {
            continue;
        }
        let outcomes = join_all(due.iter().map(|a| services.deliver(a, timeout))).await;

        let now = Instant::now();
        for (announcement, outcome) in due.into_iter().zip(outcomes) {
            if outcome != Delivery::Failed {
                continue;
            }
            let subscriber = announcement.subscriber_id.clone();
            let topic = announcement.topic_name.clone();
            match announcement.retry(&backoff, now) {
                Some(next) => services.announcements.push(next),
                None => error!(
                    "giving up informing {subscriber} about a publisher of {topic} after {} attempts",
                    backoff.max_attempts
                ),
            }
        }
    }
}
