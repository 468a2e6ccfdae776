//! Topic names and routing keys.
//!
//! A telemetry topic is named `APP_NAME/Application/MSG_NAME`. The mission
//! database maps each topic to a raw topic id; the id that actually appears in
//! the CCSDS primary header at runtime is that raw id plus
//! [`ROUTING_KEY_OFFSET`].

use crate::error::{Result, ServerError};
use ahash::AHashMap;
use std::collections::BTreeMap;
use std::fmt;

/// Difference between the topic id assigned in the message database and the
/// application id the flight software puts on the wire. Produced by the
/// schema code generator; it is empirical, not derivable from the database.
pub const ROUTING_KEY_OFFSET: u16 = 3;

/// Reserved entry in a telemetry topic mapping that names the list itself
/// rather than a message. It never gets a channel.
pub const TOPIC_TLM_TITLE_KEY: &str = "--- Telemetry ---";

/// Literal middle token of every telemetry topic.
pub const TOPIC_APPLICATION_TOKEN: &str = "Application";

/// Identifier used to dispatch a decoded datagram to its channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoutingKey(pub u16);

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for RoutingKey {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

/// Splits `APP_NAME/Application/MSG_NAME` into `(app_name, msg_name)`.
pub fn parse_topic(topic: &str) -> Result<(&str, &str)> {
    let mut tokens = topic.split('/');
    match (tokens.next(), tokens.next(), tokens.next(), tokens.next()) {
        (Some(app), Some(TOPIC_APPLICATION_TOKEN), Some(msg), None)
            if !app.is_empty() && !msg.is_empty() =>
        {
            Ok((app, msg))
        }
        _ => Err(ServerError::InvalidTopic(topic.to_string())),
    }
}

/// Builds the canonical topic string for an application/message pair.
pub fn format_topic(app_name: &str, msg_name: &str) -> String {
    format!("{}/{}/{}", app_name, TOPIC_APPLICATION_TOKEN, msg_name)
}

/// Topic string to raw topic id mapping supplied by the mission database.
///
/// Lookups by application and message name are case-insensitive; the
/// original spelling of each topic is kept for iteration and display.
#[derive(Debug, Clone, Default)]
pub struct TopicMap {
    topics: BTreeMap<String, u16>,
    index: AHashMap<(String, String), u16>,
}

impl TopicMap {
    /// Creates an empty mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a topic. Entries that do not follow the topic grammar
    /// (the title entry, for one) are kept but are not reachable by
    /// [`TopicMap::app_id`].
    pub fn insert(&mut self, topic: impl Into<String>, raw_key: u16) {
        let topic = topic.into();
        if let Ok((app, msg)) = parse_topic(&topic) {
            self.index
                .insert((app.to_uppercase(), msg.to_uppercase()), raw_key);
        }
        self.topics.insert(topic, raw_key);
    }

    /// Raw topic id for a topic string, exactly as stored.
    pub fn raw_key(&self, topic: &str) -> Option<u16> {
        self.topics.get(topic).copied()
    }

    /// Runtime routing key for an application/message pair: the raw topic id
    /// plus [`ROUTING_KEY_OFFSET`]. `None` when the pair is not in the
    /// mapping or the sum would overflow.
    pub fn app_id(&self, app_name: &str, msg_name: &str) -> Option<RoutingKey> {
        let raw = self
            .index
            .get(&(app_name.to_uppercase(), msg_name.to_uppercase()))?;
        raw.checked_add(ROUTING_KEY_OFFSET).map(RoutingKey)
    }

    /// Routing key for a full topic string.
    pub fn resolve(&self, topic: &str) -> Result<RoutingKey> {
        let (app, msg) = parse_topic(topic)?;
        self.app_id(app, msg)
            .ok_or_else(|| ServerError::UnknownTopic(topic.to_string()))
    }

    /// Iterates topics in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u16)> {
        self.topics.iter().map(|(t, k)| (t.as_str(), *k))
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, u16)> for TopicMap {
    fn from_iter<I: IntoIterator<Item = (S, u16)>>(iter: I) -> Self {
        let mut map = TopicMap::new();
        for (topic, raw) in iter {
            map.insert(topic, raw);
        }
        map
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_topic_recovers_names() {
        for (app, msg) in [
            ("CFE_ES", "HousekeepingTlm"),
            ("KIT_TO", "DataTypesTlm"),
            ("FILE_MGR", "DirListTlm"),
        ] {
            let topic = format_topic(app, msg);
            assert_eq!(parse_topic(&topic).expect("valid topic"), (app, msg));
        }
    }

    #[test]
    fn test_parse_topic_rejects_bad_grammar() {
        for topic in [
            "",
            "CFE_ES",
            "CFE_ES/HousekeepingTlm",
            "CFE_ES/Library/HousekeepingTlm",
            "CFE_ES/Application/HousekeepingTlm/Extra",
            "/Application/HousekeepingTlm",
            "CFE_ES/Application/",
            TOPIC_TLM_TITLE_KEY,
        ] {
            assert!(parse_topic(topic).is_err(), "{:?} should be rejected", topic);
        }
    }

    #[test]
    fn test_app_id_adds_offset_and_ignores_case() {
        let map: TopicMap = [("CFE_ES/Application/HousekeepingTlm", 0x58)]
            .into_iter()
            .collect();

        assert_eq!(map.app_id("CFE_ES", "HousekeepingTlm"), Some(RoutingKey(0x5B)));
        assert_eq!(map.app_id("cfe_es", "HOUSEKEEPINGTLM"), Some(RoutingKey(0x5B)));
        // Stable across calls
        assert_eq!(
            map.app_id("CFE_ES", "HousekeepingTlm"),
            map.app_id("CFE_ES", "HousekeepingTlm")
        );
        assert_eq!(map.app_id("CFE_EVS", "HousekeepingTlm"), None);
    }

    #[test]
    fn test_app_id_overflow_is_not_found() {
        let map: TopicMap = [("APP/Application/MSG", u16::MAX)].into_iter().collect();
        assert_eq!(map.app_id("APP", "MSG"), None);
    }

    #[test]
    fn test_title_entry_is_kept_but_unresolvable() {
        let map: TopicMap = [(TOPIC_TLM_TITLE_KEY, 0), ("APP/Application/MSG", 1)]
            .into_iter()
            .collect();
        assert_eq!(map.len(), 2);
        assert_eq!(map.raw_key(TOPIC_TLM_TITLE_KEY), Some(0));
        assert!(map.resolve(TOPIC_TLM_TITLE_KEY).is_err());
        assert_eq!(map.resolve("APP/Application/MSG").expect("known"), RoutingKey(4));
    }

    #[test]
    fn test_resolve_unknown_topic() {
        let map = TopicMap::new();
        assert!(matches!(
            map.resolve("APP/Application/MSG"),
            Err(ServerError::UnknownTopic(_))
        ));
    }
}
