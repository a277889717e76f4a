use std::collections::HashMap;
use std::sync::Mutex;

use crate::broker::announcement::Announcement;
use crate::transport::message::{Confirmation, PublisherInfo, TopicDefinition};
use crate::utils::lock;

/// The publisher id already advertises the topic.
pub const DUPLICATE_PUBLISHER: i32 = 1;
/// The topic exists with a different message type.
pub const TYPE_MISMATCH: i32 = 2;

/// A named, typed topic as tracked by the broker.
///
/// The first registrant's message type is authoritative. Publishers keep
/// their advertise order; subscribers are unique.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub name: String,
    pub message_type: String,
    pub publishers: Vec<PublisherInfo>,
    pub subscribers: Vec<String>,
}

impl Topic {
    pub fn new(name: &str, message_type: &str) -> Self {
        Self {
            name: name.to_string(),
            message_type: message_type.to_string(),
            publishers: Vec::new(),
            subscribers: Vec::new(),
        }
    }

    pub fn has_publisher(&self, publisher_id: &str) -> bool {
        self.publishers.iter().any(|p| p.publisher_id == publisher_id)
    }

    pub fn has_subscriber(&self, subscriber_id: &str) -> bool {
        self.subscribers.iter().any(|s| s == subscriber_id)
    }

    /// Adds a subscriber unless it is already present.
    pub fn subscribe(&mut self, subscriber_id: &str) {
        if !self.has_subscriber(subscriber_id) {
            self.subscribers.push(subscriber_id.to_string());
        }
    }

    /// Drops `client_id` from both the publisher and subscriber lists.
    pub fn remove_client(&mut self, client_id: &str) {
        self.publishers.retain(|p| p.publisher_id != client_id);
        self.subscribers.retain(|s| s != client_id);
    }

    /// A topic with nobody on either side.
    pub fn is_orphan(&self) -> bool {
        self.publishers.is_empty() && self.subscribers.is_empty()
    }

    fn mismatch(&self, message_type: &str) -> Confirmation {
        Confirmation::rejected(
            TYPE_MISMATCH,
            format!(
                "topic {} carries {}, not {}",
                self.name, self.message_type, message_type
            ),
        )
    }
}

/// Topic name to [`Topic`] map behind one registry-wide lock.
#[derive(Debug, Default)]
pub struct TopicRegistry {
    topics: Mutex<HashMap<String, Topic>>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a publisher. On success, returns one announcement for every
    /// subscriber already waiting on the topic other than the advertiser.
    pub fn advertise(
        &self,
        publisher: PublisherInfo,
        topic_name: &str,
        message_type: &str,
    ) -> (Confirmation, Vec<Announcement>) {
        let mut topics = lock(&self.topics);
        let topic = topics
            .entry(topic_name.to_string())
            .or_insert_with(|| Topic::new(topic_name, message_type));

        if topic.message_type != message_type {
            return (topic.mismatch(message_type), Vec::new());
        }
        if topic.has_publisher(&publisher.publisher_id) {
            return (
                Confirmation::rejected(
                    DUPLICATE_PUBLISHER,
                    format!(
                        "{} already advertises {}",
                        publisher.publisher_id, topic_name
                    ),
                ),
                Vec::new(),
            );
        }

        let announcements = topic
            .subscribers
            .iter()
            .filter(|s| **s != publisher.publisher_id)
            .map(|s| Announcement::new(&publisher.publisher_id, topic_name, s))
            .collect();
        topic.publishers.push(publisher);
        (Confirmation::ok("advertised"), announcements)
    }

    /// Adds a subscriber, creating the topic if needed, and returns the
    /// publishers it can connect to right away.
    pub fn subscribe(
        &self,
        subscriber_id: &str,
        topic_name: &str,
        message_type: &str,
    ) -> (Confirmation, Vec<PublisherInfo>) {
        let mut topics = lock(&self.topics);
        let topic = topics
            .entry(topic_name.to_string())
            .or_insert_with(|| Topic::new(topic_name, message_type));

        if topic.message_type != message_type {
            return (topic.mismatch(message_type), Vec::new());
        }
        topic.subscribe(subscriber_id);
        (Confirmation::ok("subscribed"), topic.publishers.clone())
    }

    /// All topics, sorted by name.
    pub fn list(&self) -> Vec<TopicDefinition> {
        let mut definitions: Vec<TopicDefinition> = lock(&self.topics)
            .values()
            .map(|t| TopicDefinition {
                name: t.name.clone(),
                message_type: t.message_type.clone(),
            })
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    /// Removes a client from every topic and deletes the topics left
    /// orphaned. Returns the names of the deleted topics.
    pub fn remove_client(&self, client_id: &str) -> Vec<String> {
        let mut topics = lock(&self.topics);
        for topic in topics.values_mut() {
            topic.remove_client(client_id);
        }
        let mut orphans: Vec<String> = topics
            .values()
            .filter(|t| t.is_orphan())
            .map(|t| t.name.clone())
            .collect();
        for name in &orphans {
            topics.remove(name);
        }
        orphans.sort();
        orphans
    }

    pub fn publisher_of(&self, topic_name: &str, publisher_id: &str) -> Option<PublisherInfo> {
        lock(&self.topics)
            .get(topic_name)?
            .publishers
            .iter()
            .find(|p| p.publisher_id == publisher_id)
            .cloned()
    }

    pub fn is_subscribed(&self, topic_name: &str, subscriber_id: &str) -> bool {
        lock(&self.topics)
            .get(topic_name)
            .is_some_and(|t| t.has_subscriber(subscriber_id))
    }

    pub fn snapshot(&self, topic_name: &str) -> Option<Topic> {
        lock(&self.topics).get(topic_name).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.topics).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
