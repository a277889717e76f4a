//! The `node` module is the client side of the mesh: the [`Node`] facade
//! and the publishers and subscribers it owns.

#[allow(clippy::module_inception)]
pub mod node;
pub mod publisher;
pub mod subscriber;

pub use node::Node;
pub use publisher::{Publisher, PublisherCore};
pub use subscriber::{Callback, Subscriber};
