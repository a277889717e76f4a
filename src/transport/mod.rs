//! The `transport` module is responsible for everything that crosses a
//! socket.
//!
//! It defines the binary framing used on data ports, the framed channel that
//! publishers, subscribers and ephemeral links are built from, and the
//! WebSocket RPC protocol spoken between nodes and the broker.

pub mod channel;
pub mod codec;
pub mod message;
pub mod rpc_client;
pub mod rpc_server;

pub use channel::{ChannelOptions, ChannelState, FrameQueue, FramedChannel, Shutdown};
pub use message::{
    ClientRecord, Confirmation, PublisherInfo, RpcRequest, RpcResponse, ServingStatus,
    TopicDefinition,
};
pub use rpc_client::RpcClient;
pub use rpc_server::{RpcHandler, RpcServer};

#[cfg(test)]
mod tests;
