#![allow(clippy::expect_used)]

//! Channel registry construction, lookup and merge.

use std::sync::Arc;
use std::thread;
use tlmserver::channel::{Channel, Subscriber, TelemetryUpdate};
use tlmserver::topic::TOPIC_TLM_TITLE_KEY;
use tlmserver::{ChannelRegistry, RoutingKey, TopicMap};

struct Probe;

impl Subscriber for Probe {
    fn update(&self, _: &Channel, _: &TelemetryUpdate) -> anyhow::Result<()> {
        Ok(())
    }
}

fn cfe_topics() -> TopicMap {
    [
        (TOPIC_TLM_TITLE_KEY, 0),
        ("CFE_ES/Application/HousekeepingTlm", 0x58),
        ("CFE_EVS/Application/HousekeepingTlm", 0x28),
        ("CFE_EVS/Application/LongEventTlm", 0x29),
    ]
    .into_iter()
    .collect()
}

#[test]
fn test_single_topic_gets_offset_key() {
    let topics: TopicMap = [("CFE_ES/Application/HousekeepingTlm", 0x58)]
        .into_iter()
        .collect();
    let registry = ChannelRegistry::build(topics);

    assert_eq!(registry.len(), 1);
    let channel = registry.lookup(RoutingKey(0x5B)).expect("channel for 0x5B");
    assert_eq!(channel.app_name(), "CFE_ES");
    assert_eq!(channel.msg_name(), "HousekeepingTlm");
    assert_eq!(channel.key(), RoutingKey(0x5B));
    assert!(registry.lookup(RoutingKey(0x58)).is_none());
}

#[test]
fn test_title_entry_gets_no_channel() {
    let registry = ChannelRegistry::build(cfe_topics());
    assert_eq!(registry.len(), 3);
    assert_eq!(
        registry.keys(),
        vec![RoutingKey(0x2B), RoutingKey(0x2C), RoutingKey(0x5B)]
    );
    assert!(registry.lookup(RoutingKey(3)).is_none());
}

#[test]
fn test_unresolvable_topics_are_skipped() {
    let topics: TopicMap = [
        ("CFE_ES/Application/HousekeepingTlm", 0x58),
        ("NOT_A_TOPIC", 0x10),
        ("CFE_TBL/Library/HousekeepingTlm", 0x11),
        ("OVERFLOW/Application/Tlm", u16::MAX),
    ]
    .into_iter()
    .collect();
    let registry = ChannelRegistry::build(topics);

    assert_eq!(registry.keys(), vec![RoutingKey(0x5B)]);
}

#[test]
fn test_lookup_returns_same_instance() {
    let registry = ChannelRegistry::build(cfe_topics());
    for key in registry.keys() {
        let first = registry.lookup(key).expect("present");
        let second = registry.lookup(key).expect("present");
        assert!(Arc::ptr_eq(&first, &second), "lookup of {} not stable", key);
    }
}

#[test]
fn test_lookup_by_topic() {
    let registry = ChannelRegistry::build(cfe_topics());

    let by_topic = registry
        .lookup_by_topic("CFE_EVS/Application/LongEventTlm")
        .expect("by topic");
    let by_key = registry.lookup(RoutingKey(0x2C)).expect("by key");
    assert!(Arc::ptr_eq(&by_topic, &by_key));

    // Names are matched case-insensitively, like the ground system does
    assert!(registry
        .lookup_by_topic("cfe_evs/Application/longeventtlm")
        .is_some());
    assert!(registry
        .lookup_by_topic("CFE_SB/Application/HousekeepingTlm")
        .is_none());
    assert!(registry.lookup_by_topic("garbage").is_none());
    assert!(registry.resolve_topic("garbage").is_err());
}

#[test]
fn test_subscriber_list_survives_lookup() {
    let registry = ChannelRegistry::build(cfe_topics());
    let sub: Arc<dyn Subscriber> = Arc::new(Probe);

    registry
        .lookup(RoutingKey(0x5B))
        .expect("channel")
        .attach(sub.clone());
    let channel = registry.lookup(RoutingKey(0x5B)).expect("channel");
    assert!(channel.is_attached(&sub));
    assert_eq!(channel.subscriber_count(), 1);
}

#[test]
fn test_merge_adds_and_overwrites() {
    let registry = ChannelRegistry::build(cfe_topics());
    let original = registry.lookup(RoutingKey(0x5B)).expect("channel");

    let shared = Arc::new(Channel::new("CFE_ES", "HousekeepingTlm", RoutingKey(0x5B)));
    let extra = Arc::new(Channel::new("KIT_TO", "HousekeepingTlm", RoutingKey(0x100)));
    let replaced = registry.merge(vec![shared.clone(), extra.clone()]);

    assert_eq!(replaced, 1);
    assert_eq!(registry.len(), 4);
    let now = registry.lookup(RoutingKey(0x5B)).expect("channel");
    assert!(Arc::ptr_eq(&now, &shared));
    assert!(!Arc::ptr_eq(&now, &original));
    assert!(Arc::ptr_eq(
        &registry.lookup(RoutingKey(0x100)).expect("merged"),
        &extra
    ));
}

#[test]
fn test_merge_races_with_lookups() {
    let registry = Arc::new(ChannelRegistry::build(cfe_topics()));
    let mut handles = vec![];

    for i in 0..4u16 {
        let registry = registry.clone();
        handles.push(thread::spawn(move || {
            for j in 0..250u16 {
                let key = RoutingKey(0x200 + i * 250 + j);
                registry.merge([Arc::new(Channel::new("APP", format!("Tlm{}", j), key))]);
            }
        }));
    }
    for _ in 0..4 {
        let registry = registry.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..1000 {
                assert!(registry.lookup(RoutingKey(0x5B)).is_some());
            }
        }));
    }

    for handle in handles {
        handle.join().expect("Thread join failed");
    }
    assert_eq!(registry.len(), 3 + 1000);
}
