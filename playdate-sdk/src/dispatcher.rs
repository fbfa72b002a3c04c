//! Inbound frame dispatch.
//!
//! Every frame goes through two consumers, in a fixed order: the session
//! reducer first, then the handler registry. A handler that reads the session
//! store from its callback therefore already sees the frame's effect.

use std::sync::Arc;

use crate::event::{Event, EventSink};
use crate::frame::Frame;
use crate::registry::HandlerRegistry;
use crate::store::SessionStore;

/// Frame types the server pushes without a matching request.
pub const PUSH_TYPES: &[&str] = &["newChat", "notification"];

pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    store: Arc<SessionStore>,
    events: Option<EventSink>,
}

impl Dispatcher {
    pub fn new(registry: Arc<HandlerRegistry>, store: Arc<SessionStore>) -> Self {
        Self {
            registry,
            store,
            events: None,
        }
    }

    pub(crate) fn with_events(mut self, events: EventSink) -> Self {
        self.events = Some(events);
        self
    }

    /// Parse and dispatch one text frame from the socket. An unparseable frame
    /// is logged and dropped as a whole. Returns whether it was dispatched.
    pub fn dispatch_raw(&self, raw: &str) -> bool {
        match Frame::parse(raw) {
            Ok(frame) => {
                self.dispatch(&frame);
                true
            }
            Err(e) => {
                tracing::warn!(len = raw.len(), "dropping unparseable frame: {e}");
                false
            }
        }
    }

    /// Apply the reducer, then invoke matching handlers. Returns how many
    /// handlers ran.
    pub fn dispatch(&self, frame: &Frame) -> usize {
        let changed = self.store.reduce(frame);
        if changed && PUSH_TYPES.contains(&frame.kind.as_str()) {
            if let Some(events) = &self.events {
                events.emit(Event::Push {
                    kind: frame.kind.clone(),
                });
            }
        }

        let fired = self.registry.fire(frame);
        tracing::debug!(kind = %frame.kind, changed, fired, "dispatched frame");
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DEFAULT_TTL;
    use parking_lot::Mutex;
    use serde_json::json;

    fn dispatcher() -> (Dispatcher, Arc<HandlerRegistry>, Arc<SessionStore>) {
        let registry = Arc::new(HandlerRegistry::new());
        let store = Arc::new(SessionStore::new(DEFAULT_TTL));
        (Dispatcher::new(registry.clone(), store.clone()), registry, store)
    }

    #[test]
    fn garbage_is_dropped() {
        let (dispatcher, registry, _) = dispatcher();
        registry.register("x", "filter", true, |_| panic!("must not fire"));
        assert!(!dispatcher.dispatch_raw("{not json"));
        assert!(!dispatcher.dispatch_raw(r#"{"success":true}"#), "frames need a type");
        assert!(registry.is_registered("x"));
    }

    #[test]
    fn reducer_runs_before_handlers() {
        let (dispatcher, registry, store) = dispatcher();
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        let st = store.clone();
        registry.register("filter", "filter", true, move |_| {
            *s.lock() = Some(st.recommend_events().len());
        });
        let raw = json!({"type": "filter", "success": true, "events": [{"id": 1}, {"id": 2}]});
        assert!(dispatcher.dispatch_raw(&raw.to_string()));
        assert_eq!(*seen.lock(), Some(2));
    }

    #[test]
    fn push_without_handler_still_reaches_store() {
        let (dispatcher, _, store) = dispatcher();
        let frame = Frame::parse(&json!({"type": "newChat", "chatId": 4, "message": {"text": "hi"}}).to_string())
            .unwrap();
        assert_eq!(dispatcher.dispatch(&frame), 0);
        assert_eq!(store.transcript("4").map(|t| t.messages.len()), Some(1));
    }

    #[tokio::test]
    async fn push_emits_event() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let registry = Arc::new(HandlerRegistry::new());
        let store = Arc::new(SessionStore::new(DEFAULT_TTL));
        let dispatcher = Dispatcher::new(registry, store).with_events(EventSink::new(tx));
        dispatcher.dispatch_raw(&json!({"type": "notification", "notification": {"id": 3}}).to_string());
        assert_eq!(rx.recv().await, Some(Event::Push { kind: "notification".into() }));
    }
}
