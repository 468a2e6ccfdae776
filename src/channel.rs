//! Per-message telemetry channels.
//!
//! A [`Channel`] keeps the most recent decode of one telemetry message and the
//! ordered list of [`Subscriber`]s interested in it. The receive loop calls
//! [`Channel::update`]; any other thread may attach or detach subscribers at
//! the same time.
//!
//! Notification iterates a snapshot of the subscriber list taken under the
//! channel lock, so the lock is never held while user code runs. A subscriber
//! detached during a fan-out may still receive that one in-flight update.

use crate::codec::{DecodedMessage, PrimaryHeader, SchemaEntry, SecondaryHeader, Value};
use crate::error::{Result, ServerError};
use crate::topic::{format_topic, RoutingKey};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, error, warn};

/// Consumer of decoded telemetry for one or more channels.
///
/// Called synchronously on the receive loop; implementations should return
/// quickly. Errors and panics are contained to the subscriber that raised
/// them.
pub trait Subscriber: Send + Sync {
    /// Handles one decoded message.
    ///
    /// `channel` is the channel being notified, so one subscriber attached to
    /// several channels can tell them apart and read their last-update
    /// accessors. The channel's subscriber list is not locked during the
    /// call: a subscriber may attach or detach (itself included), and the
    /// change takes effect from the next update. An `Err` is logged and
    /// counted as a failed delivery.
    fn update(&self, channel: &Channel, update: &TelemetryUpdate) -> anyhow::Result<()>;
}

/// Most recent decode delivered to a channel.
#[derive(Debug, Clone)]
pub struct TelemetryUpdate {
    pub entry: Arc<SchemaEntry>,
    pub message: Arc<DecodedMessage>,
    /// Ground receive time
    pub received_at: SystemTime,
}

/// Result of one fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NotifyOutcome {
    pub delivered: usize,
    pub failed: usize,
}

pub struct Channel {
    app_name: String,
    msg_name: String,
    key: RoutingKey,
    last: RwLock<Option<TelemetryUpdate>>,
    subscribers: Mutex<Vec<Arc<dyn Subscriber>>>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("app_name", &self.app_name)
            .field("msg_name", &self.msg_name)
            .field("key", &self.key)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Subscribers are matched by the address of the shared value, not by the
/// trait object vtable.
fn same_subscriber(a: &Arc<dyn Subscriber>, b: &Arc<dyn Subscriber>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

impl Channel {
    pub fn new(app_name: impl Into<String>, msg_name: impl Into<String>, key: RoutingKey) -> Self {
        Self {
            app_name: app_name.into(),
            msg_name: msg_name.into(),
            key,
            last: RwLock::new(None),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn msg_name(&self) -> &str {
        &self.msg_name
    }

    pub fn key(&self) -> RoutingKey {
        self.key
    }

    pub fn topic(&self) -> String {
        format_topic(&self.app_name, &self.msg_name)
    }

    /// Appends a subscriber. Attaching the same subscriber twice makes it
    /// receive every update twice; callers are expected to avoid that.
    pub fn attach(&self, subscriber: Arc<dyn Subscriber>) {
        let mut subs = self.subscribers.lock();
        if subs.iter().any(|s| same_subscriber(s, &subscriber)) {
            warn!(
                "Subscriber attached twice to {} ({})",
                self.topic(),
                self.key
            );
        }
        subs.push(subscriber);
    }

    /// Removes the first attachment of `subscriber`.
    pub fn detach(&self, subscriber: &Arc<dyn Subscriber>) -> Result<()> {
        let mut subs = self.subscribers.lock();
        match subs.iter().position(|s| same_subscriber(s, subscriber)) {
            Some(idx) => {
                subs.remove(idx);
                Ok(())
            }
            None => Err(ServerError::SubscriberNotAttached(self.key)),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn is_attached(&self, subscriber: &Arc<dyn Subscriber>) -> bool {
        self.subscribers
            .lock()
            .iter()
            .any(|s| same_subscriber(s, subscriber))
    }

    /// Stores a new decode, stamps the receive time and notifies every
    /// subscriber in attach order.
    pub fn update(&self, entry: SchemaEntry, message: DecodedMessage) -> NotifyOutcome {
        let update = TelemetryUpdate {
            entry: Arc::new(entry),
            message: Arc::new(message),
            received_at: SystemTime::now(),
        };
        *self.last.write() = Some(update.clone());

        let snapshot: Vec<Arc<dyn Subscriber>> = self.subscribers.lock().clone();
        debug!(
            "Notifying {} subscriber(s) of {} ({})",
            snapshot.len(),
            update.entry.name,
            self.key
        );

        let mut outcome = NotifyOutcome::default();
        for subscriber in snapshot {
            match panic::catch_unwind(AssertUnwindSafe(|| subscriber.update(self, &update))) {
                Ok(Ok(())) => outcome.delivered += 1,
                Ok(Err(e)) => {
                    warn!(
                        "Subscriber failed on {} ({}): {:#}",
                        self.topic(),
                        self.key,
                        e
                    );
                    outcome.failed += 1;
                }
                Err(_) => {
                    error!("Subscriber panicked on {} ({})", self.topic(), self.key);
                    outcome.failed += 1;
                }
            }
        }
        outcome
    }

    /// Most recent update, if any.
    pub fn last_update(&self) -> Option<TelemetryUpdate> {
        self.last.read().clone()
    }

    pub fn last_message(&self) -> Result<Arc<DecodedMessage>> {
        self.last
            .read()
            .as_ref()
            .map(|u| u.message.clone())
            .ok_or_else(|| self.no_data())
    }

    pub fn last_header(&self) -> Result<PrimaryHeader> {
        Ok(self.last_message()?.primary)
    }

    pub fn last_secondary_header(&self) -> Result<SecondaryHeader> {
        Ok(self.last_message()?.secondary)
    }

    pub fn last_payload(&self) -> Result<Value> {
        Ok(self.last_message()?.payload.clone())
    }

    pub fn last_update_time(&self) -> Option<SystemTime> {
        self.last.read().as_ref().map(|u| u.received_at)
    }

    fn no_data(&self) -> ServerError {
        ServerError::NoData {
            app_name: self.app_name.clone(),
            msg_name: self.msg_name.clone(),
            key: self.key,
        }
    }
}
