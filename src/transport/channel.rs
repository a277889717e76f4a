//! Framed socket channel
//!
//! `FramedChannel` is the connection building block shared by publishers,
//! subscribers and ephemeral node-to-node links. It owns one TCP stream, a
//! reader task that splits the stream into frames and a writer task that
//! drains the outbound queue.
//!
//! Concurrency notes:
//! - Queues never block the caller. Loops that need the next item await the
//!   queue's notifier together with the shutdown signal.
//! - `std::sync::Mutex` guards are never held across an `.await`; the
//!   write half lives behind a `tokio::sync::Mutex` because writes are
//!   awaited.

use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::transport::codec;
use crate::utils::error::{Error, Result};
use crate::utils::lock;

/// FIFO of encoded frames with push-to-wake notification.
#[derive(Debug, Default)]
pub struct FrameQueue {
    items: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, frame: Vec<u8>) {
        lock(&self.items).push_back(frame);
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<Vec<u8>> {
        lock(&self.items).pop_front()
    }

    /// Waits for the next frame, or returns `None` once `shutdown` fires.
    pub async fn pop(&self, shutdown: &mut ShutdownListener) -> Option<Vec<u8>> {
        loop {
            if let Some(frame) = self.try_pop() {
                return Some(frame);
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = shutdown.wait() => return None,
            }
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Idempotent, cloneable shutdown flag that wakes every waiting loop.
#[derive(Debug, Clone)]
pub struct Shutdown {
    inner: Arc<ShutdownInner>,
}

#[derive(Debug)]
struct ShutdownInner {
    triggered: AtomicBool,
    tx: watch::Sender<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            inner: Arc::new(ShutdownInner {
                triggered: AtomicBool::new(false),
                tx,
            }),
        }
    }

    /// Fires the signal. Returns `true` only for the call that fired it.
    pub fn trigger(&self) -> bool {
        if self.inner.triggered.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.inner.tx.send_replace(true);
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.inner.tx.subscribe(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    /// Resolves once the signal has fired (immediately if it already has).
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|fired| *fired).await;
    }
}

/// Join handles of the tasks a component started.
#[derive(Debug, Default)]
pub struct TaskSet {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskSet {
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        lock(&self.handles).push(tokio::spawn(task));
    }

    /// Joins every task spawned so far. Handles are taken out first, so
    /// concurrent callers never join the same task twice.
    pub async fn join_all(&self) {
        let handles = std::mem::take(&mut *lock(&self.handles));
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                if e.is_panic() {
                    error!("background task panicked: {e}");
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    NotConnected = 0,
    Connected = 1,
    Disconnected = 2,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::NotConnected,
            1 => Self::Connected,
            _ => Self::Disconnected,
        }
    }
}

/// Timeouts applied to a channel.
#[derive(Debug, Clone, Copy)]
pub struct ChannelOptions {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub send_timeout: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(1),
            send_timeout: Duration::from_millis(500),
        }
    }
}

/// One bidirectional, framed TCP connection.
///
/// A channel starts `NotConnected` and becomes `Connected` once the remote
/// side's name is known: immediately when dialling, after a valid intro
/// frame when accepting.
#[derive(Debug)]
pub struct FramedChannel {
    name: OnceLock<String>,
    peer: SocketAddr,
    state: AtomicU8,
    initialized: AtomicBool,
    /// `None` discards inbound frames (publisher-side subscriber links).
    inbound: Option<Arc<FrameQueue>>,
    outbound: FrameQueue,
    failures: AtomicU32,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    options: ChannelOptions,
    shutdown: Shutdown,
    tasks: TaskSet,
}

impl FramedChannel {
    /// Dials `addr`, introduces itself as `local_name` and starts the
    /// reader and writer tasks. `peer_name` names the remote side.
    pub async fn connect(
        local_name: &str,
        peer_name: &str,
        addr: SocketAddr,
        inbound: Option<Arc<FrameQueue>>,
        options: ChannelOptions,
    ) -> Result<Arc<Self>> {
        let mut stream = tokio::time::timeout(options.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connecting to {addr} timed out"),
                ))
            })??;
        stream.set_nodelay(true)?;
        stream.write_all(&codec::encode_intro(local_name)?).await?;

        let (channel, reader) = Self::pending(stream, inbound, options)?;
        channel.introduce(peer_name.to_string());
        channel.spawn_tasks(reader);
        debug!("connected to {peer_name} at {addr}");
        Ok(channel)
    }

    /// Takes over an accepted stream. The first frame must introduce the
    /// remote side; its name becomes the channel name.
    pub async fn accept(
        stream: TcpStream,
        inbound: Option<Arc<FrameQueue>>,
        options: ChannelOptions,
    ) -> Result<Arc<Self>> {
        stream.set_nodelay(true)?;
        let (channel, mut reader) = Self::pending(stream, inbound, options)?;
        let peer = channel.peer;

        let first = tokio::time::timeout(options.handshake_timeout, codec::read_frame(&mut reader))
            .await
            .map_err(|_| Error::HandshakeFailed(format!("{peer} did not introduce itself")))??;
        let name = first
            .as_deref()
            .and_then(codec::parse_intro)
            .ok_or_else(|| Error::HandshakeFailed(format!("{peer} sent no intro frame")))?;

        channel.introduce(name);
        channel.spawn_tasks(reader);
        debug!("accepted {} from {peer}", channel.name());
        Ok(channel)
    }

    /// Wraps a stream whose remote side has not been named yet. No tasks
    /// run and every send fails until [`FramedChannel::introduce`].
    pub(crate) fn pending(
        stream: TcpStream,
        inbound: Option<Arc<FrameQueue>>,
        options: ChannelOptions,
    ) -> Result<(Arc<Self>, OwnedReadHalf)> {
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let channel = Arc::new(Self {
            name: OnceLock::new(),
            peer,
            state: AtomicU8::new(ChannelState::NotConnected as u8),
            initialized: AtomicBool::new(false),
            inbound,
            outbound: FrameQueue::new(),
            failures: AtomicU32::new(0),
            writer: tokio::sync::Mutex::new(Some(writer)),
            options,
            shutdown: Shutdown::new(),
            tasks: TaskSet::default(),
        });
        Ok((channel, reader))
    }

    /// Binds the channel to the remote side's name. Only the first call
    /// has an effect, and never after the channel was torn down.
    pub(crate) fn introduce(&self, name: String) {
        if self.name.set(name).is_err() || self.shutdown.is_triggered() {
            return;
        }
        self.initialized.store(true, Ordering::SeqCst);
        let _ = self.state.compare_exchange(
            ChannelState::NotConnected as u8,
            ChannelState::Connected as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    fn spawn_tasks(self: &Arc<Self>, reader: OwnedReadHalf) {
        self.tasks
            .spawn(read_loop(self.clone(), reader, self.shutdown.listener()));
        self.tasks
            .spawn(write_loop(self.clone(), self.shutdown.listener()));
    }

    /// Remote side's name; empty until introduced.
    pub fn name(&self) -> &str {
        self.name.get().map_or("", String::as_str)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn mark_disconnected(&self) {
        self.state
            .store(ChannelState::Disconnected as u8, Ordering::SeqCst);
    }

    pub fn enqueue_outbound(&self, frame: Vec<u8>) {
        self.outbound.push(frame);
    }

    /// Encodes and enqueues one message.
    pub fn send(&self, type_name: &str, payload: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::ChannelClosed);
        }
        self.enqueue_outbound(codec::encode(type_name, payload)?);
        Ok(())
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    pub fn dequeue_inbound(&self) -> Option<Vec<u8>> {
        self.inbound.as_ref().and_then(|q| q.try_pop())
    }

    /// Writes an encoded frame immediately, bypassing the outbound queue.
    ///
    /// Any failure leaves the stream in an unknown position, so the channel
    /// is marked disconnected and every later send fails fast.
    pub async fn send_now(&self, frame: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::ChannelClosed);
        }
        let mut writer = self.writer.lock().await;
        let Some(w) = writer.as_mut() else {
            return Err(Error::ChannelClosed);
        };
        match tokio::time::timeout(self.options.send_timeout, w.write_all(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.mark_disconnected();
                Err(e.into())
            }
            Err(_) => {
                self.mark_disconnected();
                Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("send to {} timed out", self.name()),
                )))
            }
        }
    }

    /// Counts one failed send and returns the consecutive total.
    pub fn record_failure(&self) -> u32 {
        self.failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn reset_failures(&self) {
        self.failures.store(0, Ordering::SeqCst);
    }

    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Stops both tasks, waits for them and closes the socket. Safe to call
    /// any number of times from any task.
    pub async fn trigger_shutdown(&self) {
        if !self.shutdown.trigger() {
            return;
        }
        self.mark_disconnected();
        self.tasks.join_all().await;
        if let Some(mut w) = self.writer.lock().await.take() {
            let _ = w.shutdown().await;
        }
        trace!("channel {} closed", self.name());
    }
}

async fn read_loop(
    channel: Arc<FramedChannel>,
    mut reader: OwnedReadHalf,
    mut shutdown: ShutdownListener,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.wait() => break,
            frame = codec::read_frame(&mut reader) => frame,
        };
        match frame {
            Ok(Some(body)) => {
                // malformed bodies are dropped here so consumers only see
                // frames that split cleanly
                if let Err(e) = codec::split(&body) {
                    warn!("dropping malformed frame from {}: {e}", channel.name());
                    continue;
                }
                match &channel.inbound {
                    Some(queue) => queue.push(body),
                    None => trace!("discarding frame from {}", channel.name()),
                }
            }
            Ok(None) => {
                debug!("{} closed the connection", channel.name());
                break;
            }
            Err(e) => {
                warn!("read from {} failed: {e}", channel.name());
                break;
            }
        }
    }
    channel.mark_disconnected();
}

async fn write_loop(channel: Arc<FramedChannel>, mut shutdown: ShutdownListener) {
    while let Some(frame) = channel.outbound.pop(&mut shutdown).await {
        match channel.send_now(&frame).await {
            Ok(()) => channel.reset_failures(),
            Err(e) => {
                let failures = channel.record_failure();
                warn!("send to {} failed ({failures}): {e}", channel.name());
                if !channel.is_connected() {
                    break;
                }
            }
        }
    }
}
