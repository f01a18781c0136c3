use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{sync::watch, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    decoder,
    transport::{Frame, MessageKind, Transport, TransportError},
    EnvelopeHandler,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Linear reconnect backoff: the Nth consecutive failure waits N units.
#[derive(Debug, Clone)]
pub struct Backoff {
    unit: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(unit: Duration) -> Self {
        Self { unit, failures: 0 }
    }

    pub fn record_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.unit.saturating_mul(self.failures)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub keepalive_interval: Duration,
    pub backoff_unit: Duration,
    pub headers: Vec<(String, String)>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(30),
            backoff_unit: Duration::from_secs(2),
            headers: Vec::new(),
        }
    }
}

/// Counters shared with whoever started the supervisor.
#[derive(Debug, Default)]
pub struct SupervisorStats {
    pub messages: AtomicU64,
    pub decode_failures: AtomicU64,
    pub handler_failures: AtomicU64,
    pub reconnects: AtomicU64,
}

enum SessionEnd {
    Cancelled,
    Failed(TransportError),
}

/// Keeps one notification connection alive until cancelled.
pub struct ConnectionSupervisor {
    name: String,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn EnvelopeHandler>,
    config: SupervisorConfig,
    state: watch::Sender<ConnectionState>,
    stats: Arc<SupervisorStats>,
}

impl ConnectionSupervisor {
    pub fn new(
        name: &str,
        transport: Arc<dyn Transport>,
        handler: Arc<dyn EnvelopeHandler>,
        config: SupervisorConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            name: name.to_string(),
            transport,
            handler,
            config,
            state,
            stats: Arc::new(SupervisorStats::default()),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> Arc<SupervisorStats> {
        self.stats.clone()
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut backoff = Backoff::new(self.config.backoff_unit);
        loop {
            self.state.send_replace(ConnectionState::Connecting);
            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                res = self.transport.connect(&self.config.headers) => res,
            };

            match connected {
                Ok(()) => {
                    backoff.reset();
                    self.state.send_replace(ConnectionState::Connected);
                    info!(connection = %self.name, "connected; waiting for notifications");

                    let end = self.run_session(&cancel).await;
                    if let Err(e) = self.transport.close().await {
                        debug!(connection = %self.name, error = %e, "error closing connection");
                    }
                    self.state.send_replace(ConnectionState::Disconnected);
                    match end {
                        SessionEnd::Cancelled => break,
                        SessionEnd::Failed(e) => {
                            warn!(connection = %self.name, error = %e, "connection lost")
                        }
                    }
                }
                Err(e) => {
                    self.state.send_replace(ConnectionState::Disconnected);
                    error!(connection = %self.name, error = %e, "failed to connect");
                }
            }

            let delay = backoff.record_failure();
            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            info!(
                connection = %self.name,
                attempt = backoff.failures(),
                delay_secs = delay.as_secs_f64(),
                "reconnecting"
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }
        self.state.send_replace(ConnectionState::Disconnected);
        info!(connection = %self.name, "notification connection stopped");
    }

    /// Read and dispatch until the connection fails or `cancel` fires.
    /// A ping failure during a hand-off ends the session only after every
    /// command of that envelope reached the queue.
    async fn run_session(&self, cancel: &CancellationToken) -> SessionEnd {
        let keepalive = self.keepalive();
        tokio::pin!(keepalive);
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return SessionEnd::Cancelled,
                e = &mut keepalive => return SessionEnd::Failed(e),
                frame = self.transport.read_message() => frame,
            };
            let (kind, bytes) = match frame {
                Ok(Frame::Message { kind, bytes }) => (kind, bytes),
                Ok(Frame::Close(reason)) => {
                    return SessionEnd::Failed(TransportError::ClosedByServer(
                        reason.unwrap_or_default(),
                    ))
                }
                Ok(Frame::Control) => continue,
                Err(e) => return SessionEnd::Failed(e),
            };

            let handoff = self.dispatch(kind, &bytes);
            tokio::pin!(handoff);
            let mut ping_failure = None;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return SessionEnd::Cancelled,
                    _ = &mut handoff => break,
                    e = &mut keepalive, if ping_failure.is_none() => ping_failure = Some(e),
                }
            }
            if let Some(e) = ping_failure {
                return SessionEnd::Failed(e);
            }
        }
    }

    async fn keepalive(&self) -> TransportError {
        loop {
            sleep(self.config.keepalive_interval).await;
            if let Err(e) = self.transport.write_ping().await {
                error!(connection = %self.name, error = %e, "PING failed");
                return e;
            }
        }
    }

    async fn dispatch(&self, kind: MessageKind, bytes: &[u8]) {
        self.stats.messages.fetch_add(1, Ordering::Relaxed);
        let envelope = match decoder::decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    connection = %self.name,
                    ?kind,
                    error = %e,
                    message = %String::from_utf8_lossy(bytes),
                    "failed to decode notification"
                );
                return;
            }
        };
        if let Err(e) = self.handler.handle_envelope(envelope).await {
            self.stats.handler_failures.fetch_add(1, Ordering::Relaxed);
            error!(connection = %self.name, error = %e, "failed to handle notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_linear_and_resets() {
        let mut backoff = Backoff::new(Duration::from_secs(2));
        assert_eq!(backoff.record_failure(), Duration::from_secs(2));
        assert_eq!(backoff.record_failure(), Duration::from_secs(4));
        assert_eq!(backoff.record_failure(), Duration::from_secs(6));
        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.record_failure(), Duration::from_secs(2));
    }
}
