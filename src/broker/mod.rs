//! The `broker` module is the central registry: it tracks clients and
//! topics and tells subscribers about publishers. It never carries message
//! data.

pub mod announcement;
pub mod client;
pub mod engine;
pub mod topic;

pub use announcement::{Announcement, AnnouncementQueue, Backoff};
pub use client::ClientRegistry;
pub use engine::{Broker, BrokerServices};
pub use topic::{Topic, TopicRegistry};
