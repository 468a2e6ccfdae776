#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]

//! Telemetry distribution server for flight-software ground systems.
//!
//! Receives telemetry datagrams over UDP, decodes them through a
//! [`codec::TelemetryCodec`], and fans each message out to the
//! [`channel::Subscriber`]s of its [`channel::Channel`].

pub mod channel;
pub mod codec;
pub mod config;
pub mod display;
pub mod error;
pub mod mission;
pub mod receiver;
pub mod registry;
pub mod server;
pub mod stats;
pub mod topic;

pub use channel::{Channel, NotifyOutcome, Subscriber, TelemetryUpdate};
pub use error::{Result, ServerError};
pub use registry::ChannelRegistry;
pub use server::{ChannelRef, ServerState, TelemetryServer};
pub use topic::{RoutingKey, TopicMap, ROUTING_KEY_OFFSET};
