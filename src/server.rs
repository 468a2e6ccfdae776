//! High-level telemetry server handle.
//!
//! [`TelemetryServer`] builds the channel registry from a target's topic
//! mapping, owns the receive socket and the background receive task, and
//! forwards subscription requests to the right [`Channel`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tlmserver::{config::TargetConfig, mission::MissionDb, TelemetryServer};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let db = Arc::new(MissionDb::load("mission_db.toml").await?);
//! let mut server = TelemetryServer::new(TargetConfig::default(), db.topic_map(), db.clone());
//! server.start().await?;
//! // ... attach subscribers
//! server.stop().await;
//! # Ok(())
//! # }
//! ```

use crate::channel::{Channel, Subscriber};
use crate::codec::TelemetryCodec;
use crate::config::TargetConfig;
use crate::error::{Result, ServerError};
use crate::receiver::{self, ReceiveContext, ReceiveSettings};
use crate::registry::ChannelRegistry;
use crate::stats::{ServerStats, StatsSnapshot};
use crate::topic::{RoutingKey, TopicMap};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Callback that sees each received datagram longer than
/// [`MIN_FRAME_LEN`](crate::receiver::MIN_FRAME_LEN) bytes, before decoding.
/// Shorter datagrams are dropped without reaching it.
pub type RawObserver = Arc<dyn Fn(&[u8], SocketAddr) + Send + Sync>;

/// Server lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Registry built, socket not bound
    Created,
    /// Socket bound, receive task not yet running
    Bound,
    /// Receive task running
    Running,
    /// Stop requested, receive task not yet exited
    ShuttingDown,
    /// Receive task exited
    Stopped,
}

/// Channel selector for subscription management.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRef {
    Key(RoutingKey),
    Topic(String),
}

impl From<RoutingKey> for ChannelRef {
    fn from(key: RoutingKey) -> Self {
        ChannelRef::Key(key)
    }
}

impl From<&str> for ChannelRef {
    fn from(topic: &str) -> Self {
        ChannelRef::Topic(topic.to_string())
    }
}

impl From<String> for ChannelRef {
    fn from(topic: String) -> Self {
        ChannelRef::Topic(topic)
    }
}

impl From<&Channel> for ChannelRef {
    fn from(channel: &Channel) -> Self {
        ChannelRef::Key(channel.key())
    }
}

pub struct TelemetryServer {
    config: TargetConfig,
    ctx: ReceiveContext,
    state: Arc<RwLock<ServerState>>,
    cancel_token: CancellationToken,
    handle: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl TelemetryServer {
    /// Builds the channel registry from `topics`. No network activity happens
    /// until [`TelemetryServer::start`].
    pub fn new(config: TargetConfig, topics: TopicMap, codec: Arc<dyn TelemetryCodec>) -> Self {
        let registry = Arc::new(ChannelRegistry::build(topics));
        info!(
            "Telemetry server created with {} channel(s) for {}",
            registry.len(),
            config.bind_addr()
        );
        Self {
            config,
            ctx: ReceiveContext::new(registry, codec),
            state: Arc::new(RwLock::new(ServerState::Created)),
            cancel_token: CancellationToken::new(),
            handle: None,
            local_addr: None,
        }
    }

    /// Binds the telemetry socket and launches the receive task.
    ///
    /// # Errors
    ///
    /// Fails if the server was already started, the target configuration is
    /// invalid, or the socket cannot be bound.
    pub async fn start(&mut self) -> Result<()> {
        let actual = self.state();
        if actual != ServerState::Created {
            return Err(ServerError::InvalidState {
                expected: ServerState::Created,
                actual,
            });
        }
        self.config.validate().map_err(ServerError::from)?;

        let bind_addr = self.config.bind_addr();
        let socket = UdpSocket::bind(&bind_addr)
            .await
            .map_err(|e| ServerError::network(&bind_addr, e))?;
        self.local_addr = Some(
            socket
                .local_addr()
                .map_err(|e| ServerError::network(&bind_addr, e))?,
        );
        *self.state.write() = ServerState::Bound;
        info!("Telemetry socket bound to {}", bind_addr);

        let delay = self.config.startup_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let settings = ReceiveSettings {
            recv_timeout: self.config.recv_timeout(),
            buffer_size: self.config.recv_buffer_size,
            socket_error_threshold: self.config.socket_error_threshold,
        };
        *self.state.write() = ServerState::Running;
        self.handle = Some(tokio::spawn(receiver::run(
            socket,
            self.ctx.clone(),
            settings,
            self.state.clone(),
            self.cancel_token.child_token(),
        )));

        Ok(())
    }

    /// Signals the receive task to stop without waiting for it.
    pub fn request_stop(&self) {
        {
            let mut state = self.state.write();
            match *state {
                ServerState::Bound | ServerState::Running => *state = ServerState::ShuttingDown,
                ServerState::Created => *state = ServerState::Stopped,
                ServerState::ShuttingDown | ServerState::Stopped => {}
            }
        }
        self.cancel_token.cancel();
        info!("Telemetry server shutting down");
    }

    /// Stops the receive task and waits for it to exit, up to the configured
    /// shutdown timeout. Once this returns the socket is closed and no more
    /// subscriber notifications will be issued.
    pub async fn stop(&mut self) {
        self.request_stop();

        if let Some(mut handle) = self.handle.take() {
            match tokio::time::timeout(self.config.shutdown_timeout(), &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Telemetry receive task ended abnormally: {}", e),
                Err(_) => {
                    warn!(
                        "Telemetry receive task did not stop within {:?}; aborting",
                        self.config.shutdown_timeout()
                    );
                    handle.abort();
                    let _ = handle.await;
                }
            }
        }

        *self.state.write() = ServerState::Stopped;
        info!("Telemetry server stopped");
    }

    pub fn state(&self) -> ServerState {
        *self.state.read()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServerState::Running
    }

    /// Address the socket is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn config(&self) -> &TargetConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.ctx.registry
    }

    pub fn codec(&self) -> &Arc<dyn TelemetryCodec> {
        &self.ctx.codec
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats.snapshot()
    }

    /// Shared counters, for reporters that outlive a borrow of the server.
    pub fn stats_handle(&self) -> Arc<ServerStats> {
        self.ctx.stats.clone()
    }

    pub fn channel(&self, key: RoutingKey) -> Option<Arc<Channel>> {
        self.ctx.registry.lookup(key)
    }

    pub fn channel_by_topic(&self, topic: &str) -> Option<Arc<Channel>> {
        self.ctx.registry.lookup_by_topic(topic)
    }

    /// Registers channels built elsewhere, e.g. shared with a command
    /// interface. Existing channels with the same key are replaced.
    pub fn add_channels<I>(&self, channels: I) -> usize
    where
        I: IntoIterator<Item = Arc<Channel>>,
    {
        self.ctx.registry.merge(channels)
    }

    fn resolve(&self, target: &ChannelRef) -> Result<Arc<Channel>> {
        let key = match target {
            ChannelRef::Key(key) => *key,
            ChannelRef::Topic(topic) => self.ctx.registry.resolve_topic(topic)?,
        };
        self.ctx
            .registry
            .lookup(key)
            .ok_or(ServerError::UnknownRoutingKey(key))
    }

    pub fn add_subscriber(
        &self,
        target: impl Into<ChannelRef>,
        subscriber: Arc<dyn Subscriber>,
    ) -> Result<()> {
        let target = target.into();
        let channel = self.resolve(&target).map_err(|e| {
            warn!("Failed to attach telemetry subscriber to {:?}: {}", target, e);
            e
        })?;
        channel.attach(subscriber);
        Ok(())
    }

    pub fn remove_subscriber(
        &self,
        target: impl Into<ChannelRef>,
        subscriber: &Arc<dyn Subscriber>,
    ) -> Result<()> {
        let target = target.into();
        self.resolve(&target)
            .and_then(|channel| channel.detach(subscriber))
            .map_err(|e| {
                warn!("Failed to detach telemetry subscriber from {:?}: {}", target, e);
                e
            })
    }

    /// Installs or replaces the raw datagram observer. It is not called for
    /// datagrams of [`MIN_FRAME_LEN`](crate::receiver::MIN_FRAME_LEN) bytes
    /// or fewer.
    pub fn set_raw_observer<F>(&self, observer: F)
    where
        F: Fn(&[u8], SocketAddr) + Send + Sync + 'static,
    {
        *self.ctx.raw_observer.write() = Some(Arc::new(observer));
    }

    pub fn clear_raw_observer(&self) {
        *self.ctx.raw_observer.write() = None;
    }
}

impl Drop for TelemetryServer {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
