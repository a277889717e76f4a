//! Subscribing side of a topic.
//!
//! A subscriber keeps one upstream channel per known publisher. Every
//! upstream pushes frames into the same inbound queue, which the dispatch
//! loop drains in arrival order: frames from one publisher stay in order,
//! frames from different publishers interleave.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::transport::channel::{
    ChannelOptions, FrameQueue, FramedChannel, Shutdown, ShutdownListener, TaskSet,
};
use crate::transport::codec;
use crate::transport::message::PublisherInfo;
use crate::utils::lock;
use crate::utils::net::resolve;

/// Receives the raw payload of each frame on the topic.
pub type Callback = Arc<dyn Fn(&[u8]) + Send + Sync>;

pub struct Subscriber {
    node_id: String,
    topic: String,
    message_type: String,
    upstreams: Mutex<HashMap<SocketAddr, Arc<FramedChannel>>>,
    inbound: Arc<FrameQueue>,
    callbacks: Mutex<Vec<Callback>>,
    options: ChannelOptions,
    shutdown: Shutdown,
    tasks: TaskSet,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("topic", &self.topic)
            .field("message_type", &self.message_type)
            .field("publishers", &self.publisher_count())
            .finish()
    }
}

impl Subscriber {
    /// Creates an unbound subscriber and starts its dispatch loop.
    pub(crate) fn new(
        node_id: &str,
        topic: &str,
        message_type: &str,
        options: ChannelOptions,
    ) -> Arc<Self> {
        let subscriber = Arc::new(Self {
            node_id: node_id.to_string(),
            topic: topic.to_string(),
            message_type: message_type.to_string(),
            upstreams: Mutex::new(HashMap::new()),
            inbound: Arc::new(FrameQueue::new()),
            callbacks: Mutex::new(Vec::new()),
            options,
            shutdown: Shutdown::new(),
            tasks: TaskSet::default(),
        });
        subscriber.tasks.spawn(dispatch_loop(
            subscriber.clone(),
            subscriber.shutdown.listener(),
        ));
        subscriber
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn add_callback(&self, callback: Callback) {
        lock(&self.callbacks).push(callback);
    }

    /// Publishers with a live upstream connection.
    pub fn publisher_count(&self) -> usize {
        lock(&self.upstreams)
            .values()
            .filter(|c| c.is_connected())
            .count()
    }

    pub fn is_bound(&self) -> bool {
        self.publisher_count() > 0
    }

    fn is_bound_to(&self, addr: &SocketAddr) -> bool {
        lock(&self.upstreams)
            .get(addr)
            .is_some_and(|c| c.is_connected())
    }

    /// Opens an upstream to `publisher`. Returns `true` when connected,
    /// including when an upstream to that address already exists, and
    /// `false` when the connection fails; the caller may retry later.
    pub async fn add_publisher(&self, publisher: &PublisherInfo) -> bool {
        if self.shutdown.is_triggered() {
            return false;
        }
        let addr = match resolve(&publisher.host, publisher.port).await {
            Ok(addr) => addr,
            Err(e) => {
                warn!(
                    "cannot resolve publisher {} of {}: {e}",
                    publisher.publisher_id, self.topic
                );
                return false;
            }
        };
        if self.is_bound_to(&addr) {
            return true;
        }

        let channel = match FramedChannel::connect(
            &self.node_id,
            &publisher.publisher_id,
            addr,
            Some(self.inbound.clone()),
            self.options,
        )
        .await
        {
            Ok(channel) => channel,
            Err(e) => {
                warn!(
                    "connecting {} to publisher {} at {addr} failed: {e}",
                    self.topic, publisher.publisher_id
                );
                return false;
            }
        };

        // another call may have connected to the same address meanwhile
        let duplicate = {
            let mut upstreams = lock(&self.upstreams);
            if upstreams.get(&addr).is_some_and(|c| c.is_connected()) {
                Some(channel)
            } else {
                upstreams.insert(addr, channel)
            }
        };
        if let Some(stale) = duplicate {
            stale.trigger_shutdown().await;
        }
        if self.shutdown.is_triggered() {
            self.close_upstreams().await;
            return false;
        }
        info!(
            "{} bound to publisher {} at {addr}",
            self.topic, publisher.publisher_id
        );
        true
    }

    /// Drops upstreams whose connection has died.
    pub(crate) async fn reap(&self) {
        let dead: Vec<Arc<FramedChannel>> = {
            let mut upstreams = lock(&self.upstreams);
            let addrs: Vec<SocketAddr> = upstreams
                .iter()
                .filter(|(_, c)| !c.is_connected())
                .map(|(addr, _)| *addr)
                .collect();
            addrs
                .iter()
                .filter_map(|addr| upstreams.remove(addr))
                .collect()
        };
        for channel in dead {
            debug!("{} lost publisher {}", self.topic, channel.name());
            channel.trigger_shutdown().await;
        }
    }

    /// Stops dispatching and closes every upstream. Idempotent.
    pub async fn trigger_shutdown(&self) {
        if !self.shutdown.trigger() {
            return;
        }
        self.tasks.join_all().await;
        self.close_upstreams().await;
        debug!("subscriber for {} stopped", self.topic);
    }

    async fn close_upstreams(&self) {
        let channels: Vec<_> = lock(&self.upstreams).drain().map(|(_, c)| c).collect();
        join_all(channels.iter().map(|c| c.trigger_shutdown())).await;
    }

    fn dispatch(&self, body: &[u8]) {
        let (type_name, payload) = match codec::split(body) {
            Ok(parts) => parts,
            Err(e) => {
                warn!("dropping malformed frame on {}: {e}", self.topic);
                return;
            }
        };
        if type_name != self.message_type {
            warn!(
                "dropping {type_name} frame on {}, expected {}",
                self.topic, self.message_type
            );
            return;
        }

        let callbacks = lock(&self.callbacks).clone();
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(payload))).is_err() {
                error!("callback on {} panicked", self.topic);
            }
        }
    }
}

async fn dispatch_loop(subscriber: Arc<Subscriber>, mut shutdown: ShutdownListener) {
    while let Some(body) = subscriber.inbound.pop(&mut shutdown).await {
        subscriber.dispatch(&body);
    }
}
