//! Publishing side of a topic.
//!
//! A publisher owns a listening socket that subscribers dial directly. Each
//! accepted subscriber becomes a [`FramedChannel`]; published frames are
//! written to every channel in turn by the fan-out loop. A subscriber whose
//! sends fail more than `failure_threshold` times in a row is evicted.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, trace, warn};

use crate::message::Message;
use crate::transport::channel::{
    ChannelOptions, FrameQueue, FramedChannel, Shutdown, ShutdownListener, TaskSet,
};
use crate::transport::codec;
use crate::transport::message::PublisherInfo;
use crate::transport::rpc_client::RpcClient;
use crate::utils::error::{Error, Result};
use crate::utils::lock;
use crate::utils::net::bind_available;

/// Untyped publisher of one topic.
#[derive(Debug)]
pub struct PublisherCore {
    node_id: String,
    topic: String,
    message_type: String,
    host: String,
    address: SocketAddr,
    subscribers: Mutex<HashMap<SocketAddr, Arc<FramedChannel>>>,
    outbound: FrameQueue,
    options: ChannelOptions,
    failure_threshold: u32,
    shutdown: Shutdown,
    tasks: TaskSet,
}

impl PublisherCore {
    /// Binds an ephemeral port on `host` and starts the listen and fan-out
    /// loops.
    pub(crate) async fn bind(
        node_id: &str,
        topic: &str,
        message_type: &str,
        host: &str,
        options: ChannelOptions,
        failure_threshold: u32,
    ) -> Result<Arc<Self>> {
        codec::validate_type_name(message_type)?;
        let listener = bind_available(host, 0).await?;
        let address = listener.local_addr()?;

        let core = Arc::new(Self {
            node_id: node_id.to_string(),
            topic: topic.to_string(),
            message_type: message_type.to_string(),
            host: host.to_string(),
            address,
            subscribers: Mutex::new(HashMap::new()),
            outbound: FrameQueue::new(),
            options,
            failure_threshold,
            shutdown: Shutdown::new(),
            tasks: TaskSet::default(),
        });
        core.tasks
            .spawn(listen_loop(core.clone(), listener, core.shutdown.listener()));
        core.tasks.spawn(spin_loop(core.clone(), core.shutdown.listener()));
        debug!("publisher for {topic} listening on {address}");
        Ok(core)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    /// Local address subscribers connect to.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// How this publisher is advertised to the broker.
    pub fn info(&self) -> PublisherInfo {
        PublisherInfo {
            publisher_id: self.node_id.clone(),
            host: self.host.clone(),
            port: self.address.port(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    /// Frames waiting for the fan-out loop.
    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_triggered()
    }

    /// Registers this publisher with the broker. Failures are logged and
    /// reported as `false`; nothing is retried.
    pub async fn advertise(&self, broker: &RpcClient) -> bool {
        let info = self.info();
        match broker
            .advertise_topic(
                &info.publisher_id,
                &info.host,
                info.port,
                &self.topic,
                &self.message_type,
            )
            .await
        {
            Ok(confirmation) if confirmation.is_ok() => {
                info!("advertised {} [{}]", self.topic, self.message_type);
                true
            }
            Ok(confirmation) => {
                error!(
                    "broker rejected {} ({}): {}",
                    self.topic, confirmation.code, confirmation.status
                );
                false
            }
            Err(e) => {
                error!("advertising {} failed: {e}", self.topic);
                false
            }
        }
    }

    /// Queues an already encoded payload for every current subscriber.
    ///
    /// The type name must match the topic's. With nobody listening this
    /// does nothing.
    pub fn publish_raw(&self, type_name: &str, payload: &[u8]) -> Result<()> {
        if type_name != self.message_type {
            return Err(Error::InvalidMessageType {
                expected: self.message_type.clone(),
                actual: type_name.to_string(),
            });
        }
        if self.is_shut_down() {
            return Err(Error::ChannelClosed);
        }
        if self.subscriber_count() == 0 {
            trace!("nobody is listening on {}", self.topic);
            return Ok(());
        }
        self.outbound.push(codec::encode(type_name, payload)?);
        Ok(())
    }

    /// Stops both loops and closes every subscriber channel. Idempotent.
    pub async fn trigger_shutdown(&self) {
        if !self.shutdown.trigger() {
            return;
        }
        self.tasks.join_all().await;
        let channels: Vec<_> = lock(&self.subscribers).drain().map(|(_, c)| c).collect();
        join_all(channels.iter().map(|c| c.trigger_shutdown())).await;
        debug!("publisher for {} stopped", self.topic);
    }

    async fn admit(&self, stream: TcpStream) {
        let channel = match FramedChannel::accept(stream, None, self.options).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!("rejected subscriber connection on {}: {e}", self.topic);
                return;
            }
        };
        lock(&self.subscribers).insert(channel.peer_addr(), channel.clone());
        // a shutdown racing with the insert must still close this channel
        if self.is_shut_down() {
            lock(&self.subscribers).remove(&channel.peer_addr());
            channel.trigger_shutdown().await;
            return;
        }
        info!("{} subscribed to {}", channel.name(), self.topic);
    }

    async fn fan_out(&self, frame: &[u8]) {
        let targets: Vec<(SocketAddr, Arc<FramedChannel>)> = lock(&self.subscribers)
            .iter()
            .map(|(addr, channel)| (*addr, channel.clone()))
            .collect();
        let results = join_all(targets.iter().map(|(_, c)| c.send_now(frame))).await;

        for ((addr, channel), result) in targets.into_iter().zip(results) {
            let Err(e) = result else {
                channel.reset_failures();
                continue;
            };
            let failures = channel.record_failure();
            debug!(
                "send to {} on {} failed ({failures}): {e}",
                channel.name(),
                self.topic
            );
            if failures > self.failure_threshold {
                lock(&self.subscribers).remove(&addr);
                warn!(
                    "evicted subscriber {} from {} after {failures} failed sends",
                    channel.name(),
                    self.topic
                );
                channel.trigger_shutdown().await;
            }
        }
    }
}

async fn listen_loop(
    core: Arc<PublisherCore>,
    listener: TcpListener,
    mut shutdown: ShutdownListener,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.wait() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, _)) => {
                let core = core.clone();
                tokio::spawn(async move { core.admit(stream).await });
            }
            Err(e) => warn!("accept on {} failed: {e}", core.topic),
        }
    }
}

async fn spin_loop(core: Arc<PublisherCore>, mut shutdown: ShutdownListener) {
    while let Some(frame) = core.outbound.pop(&mut shutdown).await {
        core.fan_out(&frame).await;
    }
}

/// Typed publishing handle returned by `Node::advertise`.
pub struct Publisher<M: Message> {
    core: Arc<PublisherCore>,
    _message: PhantomData<fn(&M)>,
}

impl<M: Message> Clone for Publisher<M> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            _message: PhantomData,
        }
    }
}

impl<M: Message> std::fmt::Debug for Publisher<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("topic", &self.core.topic)
            .field("message_type", &M::TYPE_NAME)
            .finish()
    }
}

impl<M: Message> Publisher<M> {
    pub(crate) fn new(core: Arc<PublisherCore>) -> Self {
        Self {
            core,
            _message: PhantomData,
        }
    }

    /// Sends `message` to every connected subscriber. Skips encoding when
    /// nobody is listening.
    pub fn publish(&self, message: &M) -> Result<()> {
        if self.core.subscriber_count() == 0 && !self.core.is_shut_down() {
            return Ok(());
        }
        let payload = message.encode_payload()?;
        self.core.publish_raw(M::TYPE_NAME, &payload)
    }

    pub fn topic(&self) -> &str {
        self.core.topic()
    }

    pub fn subscriber_count(&self) -> usize {
        self.core.subscriber_count()
    }

    pub fn outbound_len(&self) -> usize {
        self.core.outbound_len()
    }

    pub fn address(&self) -> SocketAddr {
        self.core.address()
    }

    pub fn core(&self) -> &Arc<PublisherCore> {
        &self.core
    }

    pub async fn trigger_shutdown(&self) {
        self.core.trigger_shutdown().await;
    }
}
