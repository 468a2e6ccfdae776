//! Telemetry receive loop.
//!
//! One task per server reads datagrams from the bound socket and hands each
//! to [`ReceiveContext::handle_datagram`], which runs the routing pipeline:
//!
//! ```text
//! datagram ─► length check ─► raw observer ─► codec.decode ─► registry.lookup ─► Channel::update
//!               (≤ 6 B: drop)                  (err: log)      (miss: ignore)      (fan-out)
//! ```
//!
//! Nothing in the pipeline returns an error to the loop. Receive timeouts are
//! idle ticks; other socket errors go through [`SocketFailureTracker`].

use crate::codec::TelemetryCodec;
use crate::display::hex_string;
use crate::registry::ChannelRegistry;
use crate::server::{RawObserver, ServerState};
use crate::stats::ServerStats;
use crate::topic::RoutingKey;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Datagrams of this length or shorter cannot carry a routing key.
pub const MIN_FRAME_LEN: usize = 6;

/// Socket failures between repeated warnings.
const SOCKET_ERROR_LOG_EVERY: u32 = 100;

/// Exponential backoff between receive retries after socket failures.
#[derive(Debug)]
pub struct ExponentialBackoff {
    current: Duration,
    min: Duration,
    max: Duration,
    multiplier: f64,
}

impl ExponentialBackoff {
    pub fn new(min: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            current: min,
            min,
            max,
            multiplier,
        }
    }

    /// Returns the delay to wait now and grows the next one, capped at `max`.
    pub fn next_backoff(&mut self) -> Duration {
        let wait = self.current;
        self.current = std::cmp::min(
            self.max,
            Duration::from_secs_f64(self.current.as_secs_f64() * self.multiplier),
        );
        wait
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

/// Consecutive socket failure accounting with log escalation.
#[derive(Debug)]
pub struct SocketFailureTracker {
    consecutive: u32,
    threshold: u32,
    backoff: ExponentialBackoff,
}

impl SocketFailureTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive: 0,
            threshold,
            backoff: ExponentialBackoff::new(
                Duration::from_millis(10),
                Duration::from_secs(1),
                2.0,
            ),
        }
    }

    /// Records a failure and returns how long to wait before the next read.
    pub fn record(&mut self, err: &std::io::Error) -> Duration {
        self.consecutive = self.consecutive.saturating_add(1);
        if self.consecutive == self.threshold {
            error!(
                "Telemetry socket failed {} times in a row, last error: {}",
                self.consecutive, err
            );
        } else if self.consecutive == 1 || self.consecutive % SOCKET_ERROR_LOG_EVERY == 0 {
            warn!(
                "Telemetry socket receive error ({} consecutive): {}",
                self.consecutive, err
            );
        }
        self.backoff.next_backoff()
    }

    pub fn reset(&mut self) {
        if self.consecutive > 0 {
            info!(
                "Telemetry socket recovered after {} failed receive(s)",
                self.consecutive
            );
            self.consecutive = 0;
            self.backoff.reset();
        }
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

/// What happened to one datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    TooShort,
    DecodeFailed,
    Unrouted(RoutingKey),
    Routed {
        key: RoutingKey,
        delivered: usize,
        failed: usize,
    },
}

/// Everything the receive loop needs besides the socket.
#[derive(Clone)]
pub struct ReceiveContext {
    pub registry: Arc<ChannelRegistry>,
    pub codec: Arc<dyn TelemetryCodec>,
    pub raw_observer: Arc<RwLock<Option<RawObserver>>>,
    pub stats: Arc<ServerStats>,
}

impl ReceiveContext {
    pub fn new(registry: Arc<ChannelRegistry>, codec: Arc<dyn TelemetryCodec>) -> Self {
        Self {
            registry,
            codec,
            raw_observer: Arc::new(RwLock::new(None)),
            stats: Arc::new(ServerStats::new()),
        }
    }

    /// Routes one received datagram. Never fails; the outcome is returned for
    /// accounting and tests.
    pub fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) -> Disposition {
        self.stats.record_datagram();

        if datagram.len() <= MIN_FRAME_LEN {
            self.stats.record_too_short();
            return Disposition::TooShort;
        }

        let observer = self.raw_observer.read().clone();
        if let Some(observer) = observer {
            if panic::catch_unwind(AssertUnwindSafe(|| observer(datagram, from))).is_err() {
                error!("Raw datagram observer panicked on datagram from {}", from);
            }
        }

        let decoded = panic::catch_unwind(AssertUnwindSafe(|| self.codec.decode(datagram)));
        let (entry, message) = match decoded {
            Ok(Ok(decoded)) => decoded,
            Ok(Err(e)) => {
                self.stats.record_decode_failure();
                error!(
                    "Telemetry datagram decode failed: {}. Datagram =\n{}",
                    e,
                    hex_string(datagram, 16)
                );
                return Disposition::DecodeFailed;
            }
            Err(_) => {
                self.stats.record_decode_failure();
                error!(
                    "Telemetry codec panicked on datagram from {}. Datagram =\n{}",
                    from,
                    hex_string(datagram, 16)
                );
                return Disposition::DecodeFailed;
            }
        };

        let key = message.routing_key();
        debug!("Msg name: {}, Msg Id: {}", entry.name, key);

        match self.registry.lookup(key) {
            Some(channel) => {
                let outcome = channel.update(entry, message);
                self.stats.record_routed(outcome.failed);
                Disposition::Routed {
                    key,
                    delivered: outcome.delivered,
                    failed: outcome.failed,
                }
            }
            None => {
                self.stats.record_unrouted();
                Disposition::Unrouted(key)
            }
        }
    }
}

/// Settings for [`run`].
#[derive(Debug, Clone)]
pub struct ReceiveSettings {
    pub recv_timeout: Duration,
    pub buffer_size: usize,
    pub socket_error_threshold: u32,
}

/// Receive loop body. Returns when `token` is cancelled; the state is set to
/// [`ServerState::Stopped`] on the way out.
pub async fn run(
    socket: UdpSocket,
    ctx: ReceiveContext,
    settings: ReceiveSettings,
    state: Arc<RwLock<ServerState>>,
    token: CancellationToken,
) {
    info!("Telemetry receive loop started");

    let mut buf = vec![0u8; settings.buffer_size];
    let mut failures = SocketFailureTracker::new(settings.socket_error_threshold);

    loop {
        let received = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            res = tokio::time::timeout(settings.recv_timeout, socket.recv_from(&mut buf)) => res,
        };

        match received {
            // Idle tick: nothing arrived within the receive timeout
            Err(_) => trace!("No telemetry within {:?}", settings.recv_timeout),
            Ok(Ok((len, from))) => {
                failures.reset();
                ctx.handle_datagram(&buf[..len], from);
            }
            Ok(Err(e)) => {
                ctx.stats.record_socket_error();
                let wait = failures.record(&e);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }
    }

    *state.write() = ServerState::Stopped;
    info!("Telemetry receive loop terminated");
}
