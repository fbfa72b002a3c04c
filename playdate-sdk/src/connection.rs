//! Connection manager: owns the socket lifecycle.
//!
//! State moves `Disconnected -> Connecting -> Open`, and back to
//! `Disconnected` when the socket closes. Every close (including a failed
//! connect) schedules exactly one new attempt after the reconnect delay, with
//! no retry cap. Errors are logged and reported but never trigger a reconnect
//! on their own; the close that follows does.
//!
//! Sends are fire-and-forget: while the state is not `Open` a frame is
//! dropped, never queued, and the caller learns about it from the return
//! value.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::dispatcher::Dispatcher;
use crate::frame::Frame;
use crate::transport::{Connector, LinkEvent};

/// Fixed delay between a close and the next connection attempt.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// How long to wait after a close before reconnecting.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectPolicy {
    /// Same delay after every close.
    Fixed(Duration),
    /// `base * factor^n` after the n-th consecutive failed attempt, capped at
    /// `max`; back to `base` once a connection opens.
    Backoff { base: Duration, max: Duration, factor: f64 },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::Fixed(RECONNECT_DELAY)
    }
}

impl ReconnectPolicy {
    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Backoff { base, max, factor } => {
                let factor = if factor.is_finite() && factor > 1.0 { factor } else { 1.5 };
                let secs = base.as_secs_f64() * factor.powi(consecutive_failures.min(64) as i32);
                Duration::from_secs_f64(secs.min(max.as_secs_f64()))
            }
        }
    }
}

/// Lifecycle notifications for the connection owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Open,
    Error(String),
    Closed { reason: String },
}

struct Shared {
    state: Mutex<ConnectionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    attempts: AtomicUsize,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.lock();
        if *current != state {
            tracing::debug!(from = ?*current, to = ?state, "connection state");
            *current = state;
        }
    }

    fn open(&self, outbound: mpsc::UnboundedSender<String>) {
        *self.outbound.lock() = Some(outbound);
        self.set_state(ConnectionState::Open);
    }

    fn close(&self) {
        // Dropping the sender ends the transport's writer, which closes the socket.
        self.outbound.lock().take();
        self.set_state(ConnectionState::Disconnected);
    }
}

/// Cloneable sending side of the connection, used by the command façade.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Serialize and write a frame. Returns `false`, without queueing, if the
    /// connection is not open.
    pub fn send(&self, frame: &Frame) -> bool {
        if !self.is_open() {
            tracing::warn!(kind = %frame.kind, "connection not open, dropping frame");
            return false;
        }
        let json = match frame.to_json() {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(kind = %frame.kind, "failed to serialize frame: {e}");
                return false;
            }
        };
        match self.shared.outbound.lock().as_ref() {
            Some(tx) => tx.send(json).is_ok(),
            None => false,
        }
    }
}

/// Owner of the reconnect loop. Dropping it or calling [`stop`](Self::stop)
/// cancels any pending reconnect.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Start connecting to `url` and keep the connection up until stopped.
    /// Inbound text frames go to `dispatcher`; lifecycle changes to `events`.
    pub fn connect(
        url: String,
        policy: ReconnectPolicy,
        connector: Arc<dyn Connector>,
        dispatcher: Arc<Dispatcher>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(ConnectionState::Disconnected),
            outbound: Mutex::new(None),
            attempts: AtomicUsize::new(0),
        });
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(
            shared.clone(),
            url,
            policy,
            connector,
            dispatcher,
            events,
            shutdown_rx,
        ));
        Self {
            shared,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    /// Connection attempts made so far.
    pub fn attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::Relaxed)
    }

    /// Close the socket, cancel any pending reconnect, and wait for the loop
    /// to finish. Idempotent.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn run(
    shared: Arc<Shared>,
    url: String,
    policy: ReconnectPolicy,
    connector: Arc<dyn Connector>,
    dispatcher: Arc<Dispatcher>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut failures: u32 = 0;

    while !*shutdown.borrow() {
        shared.set_state(ConnectionState::Connecting);
        shared.attempts.fetch_add(1, Ordering::Relaxed);

        let connected = tokio::select! {
            result = connector.connect(&url) => result,
            _ = shutdown.changed() => break,
        };

        let reason = match connected {
            Ok(mut link) => {
                failures = 0;
                shared.open(link.outbound);
                tracing::info!("Connected to {url}");
                let _ = events.send(ConnectionEvent::Open);

                loop {
                    tokio::select! {
                        inbound = link.inbound.recv() => match inbound {
                            Some(LinkEvent::Text(text)) => {
                                dispatcher.dispatch_raw(&text);
                            }
                            Some(LinkEvent::Error(e)) => {
                                tracing::warn!("socket error: {e}");
                                let _ = events.send(ConnectionEvent::Error(e));
                            }
                            None => break "connection closed".to_string(),
                        },
                        _ = shutdown.changed() => {
                            shared.set_state(ConnectionState::Closing);
                            shared.close();
                            let _ = events.send(ConnectionEvent::Closed { reason: "client stopped".to_string() });
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                tracing::warn!("connect to {url} failed: {e:#}");
                let _ = events.send(ConnectionEvent::Error(e.to_string()));
                e.to_string()
            }
        };

        shared.close();
        let _ = events.send(ConnectionEvent::Closed { reason });

        let delay = policy.delay(failures.saturating_sub(1));
        tracing::info!(delay_ms = delay.as_millis() as u64, "reconnecting");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    shared.close();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_policy_is_constant() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(0), RECONNECT_DELAY);
        assert_eq!(policy.delay(50), RECONNECT_DELAY);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = ReconnectPolicy::Backoff {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            factor: 2.0,
        };
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
        assert_eq!(policy.delay(10), Duration::from_secs(30));
    }

    #[test]
    fn backoff_rejects_shrinking_factor() {
        let policy = ReconnectPolicy::Backoff {
            base: Duration::from_secs(2),
            max: Duration::from_secs(60),
            factor: 0.5,
        };
        assert!(policy.delay(2) > policy.delay(1));
    }
}
