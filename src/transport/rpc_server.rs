//! WebSocket RPC endpoint
//!
//! Accepts WebSocket connections and answers each JSON request with one JSON
//! response. A connection may carry any number of sequential requests.
//! Requests are dispatched to an [`RpcHandler`]; the broker and every node
//! provide their own.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::transport::channel::{Shutdown, ShutdownListener, TaskSet};
use crate::transport::message::{RequestEnvelope, ResponseEnvelope, RpcRequest, RpcResponse};
use crate::utils::error::Result;

/// Server-side implementation of an RPC surface.
pub trait RpcHandler: Send + Sync + 'static {
    fn handle(&self, request: RpcRequest) -> impl Future<Output = RpcResponse> + Send;
}

#[derive(Debug)]
pub struct RpcServer {
    local_addr: SocketAddr,
    shutdown: Shutdown,
    tasks: TaskSet,
}

impl RpcServer {
    /// Starts serving on an already bound listener.
    pub fn start<H: RpcHandler>(listener: TcpListener, handler: Arc<H>) -> Result<Self> {
        let local_addr = listener.local_addr()?;
        let shutdown = Shutdown::new();
        let tasks = TaskSet::default();
        tasks.spawn(accept_loop(listener, handler, shutdown.clone()));
        info!("rpc endpoint listening on ws://{local_addr}");
        Ok(Self {
            local_addr,
            shutdown,
            tasks,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_triggered()
    }

    /// Stops accepting, closes open connections and waits for the accept
    /// loop to finish. Idempotent.
    pub async fn shutdown(&self) {
        if !self.shutdown.trigger() {
            return;
        }
        self.tasks.join_all().await;
        debug!("rpc endpoint {} stopped", self.local_addr);
    }
}

async fn accept_loop<H: RpcHandler>(listener: TcpListener, handler: Arc<H>, shutdown: Shutdown) {
    let mut stop = shutdown.listener();
    loop {
        let accepted = tokio::select! {
            _ = stop.wait() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                let handler = handler.clone();
                let listener = shutdown.listener();
                tokio::spawn(async move {
                    serve_connection(stream, peer, handler, listener).await;
                });
            }
            Err(e) => warn!("rpc accept failed: {e}"),
        }
    }
}

async fn serve_connection<H: RpcHandler>(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<H>,
    mut shutdown: ShutdownListener,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("websocket handshake with {peer} failed: {e}");
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    loop {
        let msg = tokio::select! {
            _ = shutdown.wait() => break,
            msg = ws_receiver.next() => msg,
        };
        let text = match msg {
            Some(Ok(WsMessage::Text(text))) => text,
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!("rpc connection from {peer} failed: {e}");
                break;
            }
        };

        let envelope = match serde_json::from_str::<RequestEnvelope>(text.as_str()) {
            Ok(envelope) => {
                debug!("rpc {} from {peer}", envelope.request.method());
                let response = handler.handle(envelope.request).await;
                ResponseEnvelope {
                    id: envelope.id,
                    response,
                }
            }
            Err(err) => {
                warn!(
                    "invalid rpc request from {peer}: {err} | {}",
                    text.as_str().chars().take(100).collect::<String>()
                );
                ResponseEnvelope {
                    id: String::new(),
                    response: RpcResponse::Error {
                        message: format!("invalid request: {err}"),
                    },
                }
            }
        };

        let json = match serde_json::to_string(&envelope) {
            Ok(json) => json,
            Err(e) => {
                warn!("failed to serialize rpc response: {e}");
                continue;
            }
        };
        if let Err(e) = ws_sender.send(WsMessage::text(json)).await {
            debug!("failed to answer {peer}: {e}");
            break;
        }
    }

    let _ = ws_sender.close().await;
}
