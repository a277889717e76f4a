use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::topic::TYPE_MISMATCH;
use crate::config::{NodeSettings, Settings};
use crate::message::{Message, MessageRegistry};
use crate::node::publisher::{Publisher, PublisherCore};
use crate::node::subscriber::{Callback, Subscriber};
use crate::transport::channel::{
    ChannelOptions, FrameQueue, FramedChannel, Shutdown, ShutdownListener, TaskSet,
};
use crate::transport::codec;
use crate::transport::message::{
    Confirmation, PublisherInfo, RpcRequest, RpcResponse, ServingStatus,
};
use crate::transport::rpc_client::RpcClient;
use crate::transport::rpc_server::{RpcHandler, RpcServer};
use crate::utils::error::{Error, Result};
use crate::utils::lock;
use crate::utils::net::bind_available;

/// `inform_of_publisher`: the publisher could not be reached.
pub const PUBLISHER_UNREACHABLE: i32 = 1;
/// `inform_of_publisher`: this node does not subscribe to the topic.
pub const NOT_SUBSCRIBED: i32 = 2;

/// A participant in the mesh.
///
/// A node registers with the broker under its name, serves a control RPC
/// endpoint for the broker and peers, and owns a data port for ephemeral
/// node-to-node links. Publishers and subscribers created through it are
/// shut down with it.
///
/// `Node` is a cheap handle; clones share the same node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.inner.name)
            .field("started", &self.is_started())
            .finish()
    }
}

struct Endpoints {
    control: SocketAddr,
    data: SocketAddr,
    rpc_server: RpcServer,
}

struct NodeInner {
    name: String,
    settings: NodeSettings,
    broker: RpcClient,
    registry: Arc<MessageRegistry>,
    started: AtomicBool,
    /// Held while starting; concurrent starts and shutdown wait on it.
    start_lock: tokio::sync::Mutex<()>,
    endpoints: Mutex<Option<Endpoints>>,
    publishers: Mutex<Vec<Arc<PublisherCore>>>,
    subscribers: Mutex<HashMap<String, Arc<Subscriber>>>,
    peers: Mutex<HashMap<String, Arc<FramedChannel>>>,
    peer_inbound: Arc<FrameQueue>,
    shutdown: Shutdown,
    finished: Shutdown,
    tasks: TaskSet,
}

impl Node {
    /// Creates a node named `name`; the name is its client id at the broker.
    pub fn new(name: impl Into<String>, settings: Settings) -> Self {
        Self::with_registry(name, settings, MessageRegistry::builtin())
    }

    /// A node named `<prefix>_<uuid>`.
    pub fn anonymous(prefix: &str, settings: Settings) -> Self {
        Self::new(format!("{prefix}_{}", Uuid::new_v4().simple()), settings)
    }

    /// Like [`Node::new`], with the registry used by dynamic subscriptions.
    pub fn with_registry(
        name: impl Into<String>,
        settings: Settings,
        registry: MessageRegistry,
    ) -> Self {
        let broker = RpcClient::new(
            settings.broker.address(),
            Duration::from_millis(settings.node.rpc_timeout_ms),
        );
        Self {
            inner: Arc::new(NodeInner {
                name: name.into(),
                settings: settings.node,
                broker,
                registry: Arc::new(registry),
                started: AtomicBool::new(false),
                start_lock: tokio::sync::Mutex::new(()),
                endpoints: Mutex::new(None),
                publishers: Mutex::new(Vec::new()),
                subscribers: Mutex::new(HashMap::new()),
                peers: Mutex::new(HashMap::new()),
                peer_inbound: Arc::new(FrameQueue::new()),
                shutdown: Shutdown::new(),
                finished: Shutdown::new(),
                tasks: TaskSet::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Client for the broker this node registers with.
    pub fn broker(&self) -> &RpcClient {
        &self.inner.broker
    }

    pub fn registry(&self) -> &MessageRegistry {
        &self.inner.registry
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_triggered()
    }

    /// Address of the control RPC endpoint, once started.
    pub fn control_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.endpoints).as_ref().map(|e| e.control)
    }

    /// Address of the data port accepting ephemeral links, once started.
    pub fn data_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.endpoints).as_ref().map(|e| e.data)
    }

    /// Binds the control and data sockets, starts the control endpoint and
    /// registers with the broker. Calling it again after success is a no-op;
    /// concurrent calls wait for the one in flight and see its outcome.
    ///
    /// If registration fails nothing keeps running and the node reports
    /// not started.
    pub async fn start(&self) -> Result<()> {
        let _starting = self.inner.start_lock.lock().await;
        if self.is_shut_down() {
            return Err(Error::NodeShutDown);
        }
        if self.is_started() {
            return Ok(());
        }
        if let Err(e) = self.inner.clone().start_inner().await {
            error!("node {} failed to start: {e}", self.inner.name);
            return Err(e);
        }
        self.inner.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Creates a publisher for `topic` and advertises it.
    pub async fn advertise<M: Message>(&self, topic: &str) -> Result<Publisher<M>> {
        let core = self.advertise_raw(topic, M::TYPE_NAME).await?;
        Ok(Publisher::new(core))
    }

    /// Untyped [`Node::advertise`] for callers that only know the type name.
    pub async fn advertise_raw(&self, topic: &str, type_name: &str) -> Result<Arc<PublisherCore>> {
        self.inner.ensure_running()?;
        let settings = &self.inner.settings;
        let core = PublisherCore::bind(
            &self.inner.name,
            topic,
            type_name,
            &settings.host,
            self.inner.channel_options(),
            settings.send_failure_threshold,
        )
        .await?;

        if !core.advertise(&self.inner.broker).await {
            core.trigger_shutdown().await;
            return Err(Error::AdvertiseRejected {
                topic: topic.to_string(),
            });
        }
        lock(&self.inner.publishers).push(core.clone());

        // the broker does not announce a publisher to its own node
        let local = lock(&self.inner.subscribers).get(topic).cloned();
        if let Some(subscriber) = local {
            if subscriber.message_type() == type_name {
                subscriber.add_publisher(&core.info()).await;
            }
        }
        Ok(core)
    }

    /// Subscribes `callback` to `topic`.
    ///
    /// Subscribing again to a topic this node already follows adds the
    /// callback to the existing subscription.
    pub async fn subscribe<M, F>(&self, topic: &str, callback: F) -> Result<()>
    where
        M: Message,
        F: Fn(&M) + Send + Sync + 'static,
    {
        let topic_name = topic.to_string();
        let callback: Callback = Arc::new(move |payload: &[u8]| match M::decode_payload(payload) {
            Ok(message) => callback(&message),
            Err(e) => warn!("cannot decode {} on {topic_name}: {e}", M::TYPE_NAME),
        });
        self.subscribe_with(topic, M::TYPE_NAME, callback).await
    }

    /// Subscribes to a topic whose type is only known by name. Payloads are
    /// decoded through the node's [`MessageRegistry`].
    pub async fn subscribe_dynamic<F>(
        &self,
        topic: &str,
        type_name: &str,
        callback: F,
    ) -> Result<()>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        if !self.inner.registry.contains(type_name) {
            return Err(Error::UnknownMessageType(type_name.to_string()));
        }
        let registry = self.inner.registry.clone();
        let topic_name = topic.to_string();
        let type_owned = type_name.to_string();
        let callback: Callback = Arc::new(move |payload: &[u8]| {
            match registry.decode(&type_owned, payload) {
                Ok(value) => callback(value),
                Err(e) => warn!("cannot decode {type_owned} on {topic_name}: {e}"),
            }
        });
        self.subscribe_with(topic, type_name, callback).await
    }

    async fn subscribe_with(&self, topic: &str, type_name: &str, callback: Callback) -> Result<()> {
        self.inner.ensure_running()?;

        // the subscriber exists before the broker knows about it, so an
        // announcement racing with the reply still finds it
        let (subscriber, created) = {
            let mut subscribers = lock(&self.inner.subscribers);
            match subscribers.get(topic) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let subscriber = Subscriber::new(
                        &self.inner.name,
                        topic,
                        type_name,
                        self.inner.channel_options(),
                    );
                    subscribers.insert(topic.to_string(), subscriber.clone());
                    (subscriber, true)
                }
            }
        };

        if !created {
            if subscriber.message_type() != type_name {
                return Err(Error::SubscribeRejected {
                    topic: topic.to_string(),
                    code: TYPE_MISMATCH,
                    status: format!("already subscribed with {}", subscriber.message_type()),
                });
            }
            subscriber.add_callback(callback);
            return Ok(());
        }
        subscriber.add_callback(callback);

        let reply = self
            .inner
            .broker
            .subscribe_topic(&self.inner.name, topic, type_name)
            .await;
        let publishers = match reply {
            Ok((confirmation, publishers)) if confirmation.is_ok() => publishers,
            Ok((confirmation, _)) => {
                self.inner.drop_subscriber(topic).await;
                error!(
                    "broker rejected subscription to {topic} ({}): {}",
                    confirmation.code, confirmation.status
                );
                return Err(Error::SubscribeRejected {
                    topic: topic.to_string(),
                    code: confirmation.code,
                    status: confirmation.status,
                });
            }
            Err(e) => {
                self.inner.drop_subscriber(topic).await;
                error!("subscribing to {topic} failed: {e}");
                return Err(e);
            }
        };

        info!("subscribed to {topic} [{type_name}], {} publisher(s)", publishers.len());
        for publisher in &publishers {
            if !subscriber.add_publisher(publisher).await {
                warn!(
                    "publisher {} of {topic} is unreachable, waiting for a new announcement",
                    publisher.publisher_id
                );
            }
        }
        Ok(())
    }

    /// Number of live upstream publishers of a local subscription.
    pub fn subscription_publishers(&self, topic: &str) -> Option<usize> {
        lock(&self.inner.subscribers)
            .get(topic)
            .map(|s| s.publisher_count())
    }

    /// Opens an ephemeral link to another node's data port.
    pub async fn connect_peer(&self, peer_name: &str, addr: SocketAddr) -> Result<()> {
        self.inner.ensure_running()?;
        let channel = FramedChannel::connect(
            &self.inner.name,
            peer_name,
            addr,
            Some(self.inner.peer_inbound.clone()),
            self.inner.channel_options(),
        )
        .await?;
        self.inner.insert_peer(channel).await;
        Ok(())
    }

    /// Queues one frame on the link to `peer_name`.
    pub fn send_to_peer(&self, peer_name: &str, type_name: &str, payload: &[u8]) -> Result<()> {
        let channel = lock(&self.inner.peers)
            .get(peer_name)
            .cloned()
            .ok_or_else(|| Error::UnknownPeer(peer_name.to_string()))?;
        channel.send(type_name, payload)
    }

    /// Next frame received on any ephemeral link, as `(type name, payload)`.
    pub fn try_recv_from_peers(&self) -> Option<(String, Vec<u8>)> {
        let body = self.inner.peer_inbound.try_pop()?;
        let (type_name, payload) = codec::split(&body).ok()?;
        Some((type_name.to_string(), payload.to_vec()))
    }

    /// Names of connected peers, sorted.
    pub fn peer_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.inner.peers).keys().cloned().collect();
        names.sort();
        names
    }

    /// Shuts the node down. Unless the broker asked for it, the node
    /// deregisters first. Idempotent.
    pub async fn shutdown(&self, requested_by_server: bool) {
        self.inner.shutdown(requested_by_server).await;
    }

    /// Resolves once the node has finished shutting down.
    pub async fn wait_for_shutdown(&self) {
        self.inner.finished.listener().wait().await;
    }
}

impl NodeInner {
    fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            connect_timeout: Duration::from_millis(self.settings.rpc_timeout_ms),
            handshake_timeout: Duration::from_millis(self.settings.handshake_timeout_ms),
            send_timeout: Duration::from_millis(self.settings.send_timeout_ms),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutdown.is_triggered() {
            return Err(Error::NodeShutDown);
        }
        if !self.started.load(Ordering::SeqCst) {
            return Err(Error::NotStarted);
        }
        Ok(())
    }

    async fn start_inner(self: Arc<Self>) -> Result<()> {
        let host = self.settings.host.as_str();
        let control = bind_available(host, self.settings.start_port).await?;
        let data = bind_available(host, self.settings.start_port).await?;
        let control_addr = control.local_addr()?;
        let data_addr = data.local_addr()?;

        let handler = Arc::new(NodeRpcHandler {
            node: Arc::downgrade(&self),
        });
        let rpc_server = RpcServer::start(control, handler)?;

        let registered = self
            .broker
            .register_client(&self.name, host, control_addr.port(), data_addr.port())
            .await;
        match registered {
            Ok(confirmation) if confirmation.is_ok() => {}
            Ok(confirmation) => {
                rpc_server.shutdown().await;
                error!(
                    "broker refused {} ({}): {}",
                    self.name, confirmation.code, confirmation.status
                );
                return Err(Error::RegistrationFailed {
                    client_id: self.name.clone(),
                    code: confirmation.code,
                });
            }
            Err(e) => {
                rpc_server.shutdown().await;
                return Err(e);
            }
        }

        *lock(&self.endpoints) = Some(Endpoints {
            control: control_addr,
            data: data_addr,
            rpc_server,
        });
        self.tasks
            .spawn(listen_loop(self.clone(), data, self.shutdown.listener()));
        self.tasks
            .spawn(reaper_loop(self.clone(), self.shutdown.listener()));
        info!(
            "node {} started, control {control_addr}, data {data_addr}",
            self.name
        );
        Ok(())
    }

    async fn inform_of_publisher(&self, topic: &str, publisher: PublisherInfo) -> Confirmation {
        let subscriber = lock(&self.subscribers).get(topic).cloned();
        let Some(subscriber) = subscriber else {
            debug!("told about {topic} without subscribing to it");
            return Confirmation::rejected(NOT_SUBSCRIBED, format!("not subscribed to {topic}"));
        };
        if subscriber.add_publisher(&publisher).await {
            Confirmation::ok(format!("bound to {}", publisher.publisher_id))
        } else {
            Confirmation::rejected(
                PUBLISHER_UNREACHABLE,
                format!(
                    "cannot reach {} at {}:{}",
                    publisher.publisher_id, publisher.host, publisher.port
                ),
            )
        }
    }

    async fn drop_subscriber(&self, topic: &str) {
        let removed = lock(&self.subscribers).remove(topic);
        if let Some(subscriber) = removed {
            subscriber.trigger_shutdown().await;
        }
    }

    async fn insert_peer(&self, channel: Arc<FramedChannel>) {
        let replaced = lock(&self.peers).insert(channel.name().to_string(), channel.clone());
        if let Some(old) = replaced {
            old.trigger_shutdown().await;
        }
        // a shutdown racing with the insert must still close this link
        if self.shutdown.is_triggered() {
            lock(&self.peers).remove(channel.name());
            channel.trigger_shutdown().await;
        }
    }

    async fn reap(&self) {
        let dead: Vec<Arc<FramedChannel>> = {
            let mut peers = lock(&self.peers);
            let names: Vec<String> = peers
                .iter()
                .filter(|(_, c)| !c.is_connected())
                .map(|(name, _)| name.clone())
                .collect();
            names.iter().filter_map(|n| peers.remove(n)).collect()
        };
        for channel in dead {
            debug!("link to {} closed", channel.name());
            channel.trigger_shutdown().await;
        }

        let subscribers: Vec<Arc<Subscriber>> = lock(&self.subscribers).values().cloned().collect();
        for subscriber in subscribers {
            subscriber.reap().await;
        }
    }

    async fn shutdown(&self, requested_by_server: bool) {
        if !self.shutdown.trigger() {
            return;
        }
        info!("node {} shutting down", self.name);
        // a start in flight finishes first, so its registration is undone below
        drop(self.start_lock.lock().await);

        let publishers: Vec<_> = std::mem::take(&mut *lock(&self.publishers));
        join_all(publishers.iter().map(|p| p.trigger_shutdown())).await;
        let subscribers: Vec<_> = lock(&self.subscribers).drain().map(|(_, s)| s).collect();
        join_all(subscribers.iter().map(|s| s.trigger_shutdown())).await;
        let peers: Vec<_> = lock(&self.peers).drain().map(|(_, c)| c).collect();
        join_all(peers.iter().map(|c| c.trigger_shutdown())).await;

        let endpoints = lock(&self.endpoints).take();
        if let Some(endpoints) = endpoints {
            if !requested_by_server {
                match self.broker.deregister_client(&self.name).await {
                    Ok(c) if c.is_ok() => debug!("deregistered {}", self.name),
                    Ok(c) => warn!("broker refused to deregister {}: {}", self.name, c.status),
                    Err(e) => warn!("deregistering {} failed: {e}", self.name),
                }
            }
            endpoints.rpc_server.shutdown().await;
        }
        self.tasks.join_all().await;
        info!("node {} stopped", self.name);
        self.finished.trigger();
    }
}

async fn listen_loop(node: Arc<NodeInner>, listener: TcpListener, mut shutdown: ShutdownListener) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.wait() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, _)) => {
                let node = node.clone();
                tokio::spawn(async move { admit_peer(node, stream).await });
            }
            Err(e) => warn!("accept on {} data port failed: {e}", node.name),
        }
    }
}

async fn admit_peer(node: Arc<NodeInner>, stream: TcpStream) {
    let inbound = Some(node.peer_inbound.clone());
    match FramedChannel::accept(stream, inbound, node.channel_options()).await {
        Ok(channel) => {
            debug!("{} linked with {}", node.name, channel.name());
            node.insert_peer(channel).await;
        }
        Err(e) => warn!("rejected link to {}: {e}", node.name),
    }
}

async fn reaper_loop(node: Arc<NodeInner>, mut shutdown: ShutdownListener) {
    let period = Duration::from_millis(node.settings.reaper_interval_ms.max(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = ticker.tick() => node.reap().await,
        }
    }
}

/// Control endpoint of a node, served to the broker and peers.
struct NodeRpcHandler {
    node: Weak<NodeInner>,
}

impl RpcHandler for NodeRpcHandler {
    async fn handle(&self, request: RpcRequest) -> RpcResponse {
        let Some(node) = self.node.upgrade() else {
            return RpcResponse::Error {
                message: "node is gone".to_string(),
            };
        };
        match request {
            RpcRequest::InformOfPublisher {
                topic_name,
                publisher,
            } => RpcResponse::Confirmation(node.inform_of_publisher(&topic_name, publisher).await),
            RpcRequest::InformOfShutdown => {
                info!("broker asked {} to shut down", node.name);
                tokio::spawn(async move { node.shutdown(true).await });
                RpcResponse::Confirmation(Confirmation::ok("shutting down"))
            }
            RpcRequest::HealthCheck => RpcResponse::Health {
                status: if node.shutdown.is_triggered() {
                    ServingStatus::NotServing
                } else {
                    ServingStatus::Serving
                },
            },
            other => RpcResponse::Error {
                message: format!("{} is served by the broker, not nodes", other.method()),
            },
        }
    }
}
