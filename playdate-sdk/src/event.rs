//! Events emitted by the client for the UI layer to consume.

use tokio::sync::mpsc;

/// Events that the SDK emits to the consumer (mobile UI, CLI, tests).
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The socket is open.
    Connected,

    /// The socket closed; a reconnect is already scheduled unless the client
    /// is stopping.
    Disconnected {
        reason: String,
    },

    /// Transport error. The close that follows drives the reconnect.
    SocketError {
        reason: String,
    },

    /// The socket-level `verifyToken` handshake succeeded.
    Authenticated,

    /// Token verification failed; session and stored token are gone.
    AuthFailed {
        reason: String,
    },

    LoggedOut,

    /// An unsolicited push frame (`newChat`, `notification`) was folded into
    /// the session store.
    Push {
        kind: String,
    },
}

/// Non-blocking sender used from synchronous dispatch paths.
#[derive(Clone)]
pub(crate) struct EventSink {
    tx: mpsc::Sender<Event>,
}

impl EventSink {
    pub(crate) fn new(tx: mpsc::Sender<Event>) -> Self {
        Self { tx }
    }

    pub(crate) fn emit(&self, event: Event) {
        if let Err(e) = self.tx.try_send(event) {
            tracing::debug!("event not delivered: {e}");
        }
    }
}
