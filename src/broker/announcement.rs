//! Deferred "new publisher" notifications and their retry policy.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::BrokerSettings;
use crate::utils::lock;

/// Tells one subscriber about one publisher of a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub publisher_id: String,
    pub topic_name: String,
    pub subscriber_id: String,
    /// Failed deliveries so far.
    pub attempts: u32,
    pub not_before: Instant,
}

impl Announcement {
    pub fn new(publisher_id: &str, topic_name: &str, subscriber_id: &str) -> Self {
        Self {
            publisher_id: publisher_id.to_string(),
            topic_name: topic_name.to_string(),
            subscriber_id: subscriber_id.to_string(),
            attempts: 0,
            not_before: Instant::now(),
        }
    }

    /// Records a failed delivery. Returns the rescheduled announcement, or
    /// `None` once the attempt budget is spent.
    pub fn retry(mut self, backoff: &Backoff, now: Instant) -> Option<Self> {
        self.attempts += 1;
        if self.attempts >= backoff.max_attempts {
            return None;
        }
        self.not_before = now + backoff.delay(self.attempts);
        Some(self)
    }
}

/// Exponential backoff with a ceiling and an attempt budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Backoff {
    pub fn from_settings(settings: &BrokerSettings) -> Self {
        Self {
            base: Duration::from_millis(settings.announce_backoff_ms),
            max: Duration::from_millis(settings.announce_backoff_max_ms),
            max_attempts: settings.announce_max_attempts.max(1),
        }
    }

    /// Wait after the `attempt`-th failure: `base * 2^(attempt - 1)`, capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

#[derive(Debug, Default)]
pub struct AnnouncementQueue {
    items: Mutex<VecDeque<Announcement>>,
}

impl AnnouncementQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, announcement: Announcement) {
        lock(&self.items).push_back(announcement);
    }

    pub fn extend(&self, announcements: impl IntoIterator<Item = Announcement>) {
        lock(&self.items).extend(announcements);
    }

    /// Removes and returns every announcement due at `now`, keeping the
    /// relative order of the rest.
    pub fn take_due(&self, now: Instant) -> Vec<Announcement> {
        let mut items = lock(&self.items);
        let (due, waiting): (VecDeque<_>, VecDeque<_>) =
            items.drain(..).partition(|a| a.not_before <= now);
        *items = waiting;
        due.into()
    }

    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
