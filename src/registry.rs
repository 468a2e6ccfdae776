//! Routing table from routing key to telemetry channel.
//!
//! Built once from the mission topic mapping. After that it only changes
//! through [`ChannelRegistry::merge`], which takes the write lock; the receive
//! loop holds the read lock just long enough to clone the channel `Arc`.

use crate::channel::Channel;
use crate::error::Result;
use crate::topic::{parse_topic, RoutingKey, TopicMap, TOPIC_TLM_TITLE_KEY};
use ahash::AHashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};

type HashMap<K, V> = AHashMap<K, V>;

pub struct ChannelRegistry {
    topics: TopicMap,
    channels: RwLock<HashMap<RoutingKey, Arc<Channel>>>,
}

impl ChannelRegistry {
    /// Creates one channel per topic in `topics`, skipping the reserved title
    /// entry. Topics that do not parse or whose routing key cannot be
    /// resolved are logged and left without a channel.
    pub fn build(topics: TopicMap) -> Self {
        let mut channels = HashMap::new();

        for (topic, _raw) in topics.iter() {
            if topic == TOPIC_TLM_TITLE_KEY {
                continue;
            }
            let (app_name, msg_name) = match parse_topic(topic) {
                Ok(names) => names,
                Err(e) => {
                    warn!("Skipping telemetry topic: {}", e);
                    continue;
                }
            };
            let Some(key) = topics.app_id(app_name, msg_name) else {
                warn!(
                    "Skipping telemetry topic {}: no application id for {}/{}",
                    topic, app_name, msg_name
                );
                continue;
            };

            info!(
                "Adding telemetry channel App: {}, Msg: {}, Id: {}",
                app_name, msg_name, key
            );
            if let Some(prev) = channels.insert(key, Arc::new(Channel::new(app_name, msg_name, key)))
            {
                warn!(
                    "Routing key {} of {} collides with {}; keeping the later topic",
                    key,
                    topic,
                    prev.topic()
                );
            }
        }

        Self {
            topics,
            channels: RwLock::new(channels),
        }
    }

    pub fn topics(&self) -> &TopicMap {
        &self.topics
    }

    pub fn lookup(&self, key: RoutingKey) -> Option<Arc<Channel>> {
        self.channels.read().get(&key).cloned()
    }

    /// Looks up the channel for `APP_NAME/Application/MSG_NAME`.
    pub fn lookup_by_topic(&self, topic: &str) -> Option<Arc<Channel>> {
        let key = self.topics.resolve(topic).ok()?;
        self.lookup(key)
    }

    /// Routing key for a topic string, with the reason when it has none.
    pub fn resolve_topic(&self, topic: &str) -> Result<RoutingKey> {
        self.topics.resolve(topic)
    }

    /// Adds externally constructed channels, replacing any existing channel
    /// with the same routing key. Returns how many entries were replaced.
    pub fn merge<I>(&self, channels: I) -> usize
    where
        I: IntoIterator<Item = Arc<Channel>>,
    {
        let mut table = self.channels.write();
        let mut replaced = 0;
        for channel in channels {
            let key = channel.key();
            debug!("Merging telemetry channel {} ({})", channel.topic(), key);
            if table.insert(key, channel).is_some() {
                replaced += 1;
            }
        }
        replaced
    }

    /// All channels, ordered by routing key.
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        let mut all: Vec<_> = self.channels.read().values().cloned().collect();
        all.sort_by_key(|c| c.key());
        all
    }

    pub fn keys(&self) -> Vec<RoutingKey> {
        let mut keys: Vec<_> = self.channels.read().keys().copied().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.channels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.read().is_empty()
    }
}
