//! Named handlers waiting for frames of a given `type`.
//!
//! A registration is a `(name, match_type, callback, one_shot)` tuple. Names
//! are unique: registering a name that is already active is a no-op, so a UI
//! that re-issues the same request on every render subscribes only once.
//!
//! One-shot handlers are removed from the table under the same lock that
//! selects them, before any callback runs. Two back-to-back frames of the
//! same type therefore can never reach the same one-shot handler twice.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::frame::Frame;

pub type OnceCallback = Box<dyn FnOnce(&Frame) + Send>;
pub type PersistentCallback = Box<dyn FnMut(&Frame) + Send>;

enum Callback {
    Once(OnceCallback),
    Persistent(Arc<Mutex<PersistentCallback>>),
}

struct Registration {
    name: String,
    match_type: String,
    /// Request ids this handler answers. Empty for plain subscribers.
    correlation: Vec<u64>,
    callback: Callback,
}

impl Registration {
    fn matches(&self, frame: &Frame, request_id: Option<u64>) -> bool {
        if self.match_type != frame.kind {
            return false;
        }
        match request_id {
            Some(echoed) if !self.correlation.is_empty() => self.correlation.contains(&echoed),
            // Server did not echo an id, or the handler is a plain subscriber.
            _ => true,
        }
    }
}

/// A callback selected for one inbound frame.
enum Invocation {
    Once(String, OnceCallback),
    Persistent(String, Arc<Mutex<PersistentCallback>>),
}

/// Process-wide table of pending reply handlers and push subscriptions.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: Mutex<Vec<Registration>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. `one_shot` handlers deregister themselves after
    /// their first invocation. Returns `false` if `name` was already active.
    pub fn register<F>(&self, name: &str, match_type: &str, one_shot: bool, mut callback: F) -> bool
    where
        F: FnMut(&Frame) + Send + 'static,
    {
        let callback = if one_shot {
            let once: OnceCallback = Box::new(move |frame: &Frame| callback(frame));
            Callback::Once(once)
        } else {
            let persistent: PersistentCallback = Box::new(callback);
            Callback::Persistent(Arc::new(Mutex::new(persistent)))
        };
        self.insert(name, match_type, None, callback)
    }

    /// Register a one-shot handler tied to the request id of the command it
    /// answers. When the server echoes `requestId`, only this handler (and
    /// uncorrelated subscribers) receive the reply.
    ///
    /// If `name` is already pending, the new callback is dropped but
    /// `correlation` is added to the pending handler's accepted ids, so a
    /// reply to the re-issued command still reaches it.
    pub fn register_once<F>(&self, name: &str, match_type: &str, correlation: Option<u64>, callback: F) -> bool
    where
        F: FnOnce(&Frame) + Send + 'static,
    {
        let once: OnceCallback = Box::new(callback);
        self.insert(name, match_type, correlation, Callback::Once(once))
    }

    pub fn register_persistent<F>(&self, name: &str, match_type: &str, callback: F) -> bool
    where
        F: FnMut(&Frame) + Send + 'static,
    {
        self.register(name, match_type, false, callback)
    }

    fn insert(&self, name: &str, match_type: &str, correlation: Option<u64>, callback: Callback) -> bool {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.iter_mut().find(|r| r.name == name) {
            if let Some(id) = correlation {
                if !existing.correlation.is_empty() {
                    existing.correlation.push(id);
                }
            }
            tracing::trace!(name, "handler already registered, ignoring");
            return false;
        }
        entries.push(Registration {
            name: name.to_string(),
            match_type: match_type.to_string(),
            correlation: correlation.into_iter().collect(),
            callback,
        });
        true
    }

    /// Remove a registration. Unknown names are ignored.
    pub fn unregister(&self, name: &str) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|r| r.name != name);
        before != entries.len()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.entries.lock().iter().any(|r| r.name == name)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Invoke every handler matching `frame`, in registration order.
    /// Returns how many ran.
    ///
    /// Callbacks run outside the table lock, so a handler may register or
    /// unregister other handlers while it runs.
    pub fn fire(&self, frame: &Frame) -> usize {
        let selected = self.select(frame);
        let count = selected.len();
        for invocation in selected {
            match invocation {
                Invocation::Once(name, callback) => {
                    tracing::trace!(name = %name, kind = %frame.kind, "one-shot handler");
                    callback(frame);
                }
                Invocation::Persistent(name, callback) => {
                    tracing::trace!(name = %name, kind = %frame.kind, "subscriber");
                    let mut cb = callback.lock();
                    (*cb)(frame);
                }
            }
        }
        count
    }

    fn select(&self, frame: &Frame) -> Vec<Invocation> {
        let request_id = frame.request_id();
        let mut entries = self.entries.lock();
        let mut selected = Vec::new();
        let mut i = 0;
        while i < entries.len() {
            if !entries[i].matches(frame, request_id) {
                i += 1;
                continue;
            }
            if let Callback::Persistent(cb) = &entries[i].callback {
                selected.push(Invocation::Persistent(entries[i].name.clone(), Arc::clone(cb)));
                i += 1;
                continue;
            }
            let registration = entries.remove(i);
            if let Callback::Once(cb) = registration.callback {
                selected.push(Invocation::Once(registration.name, cb));
            }
        }
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl FnMut(&Frame) + Send + 'static) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        (hits, move |_: &Frame| {
            h.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn duplicate_name_registers_once() {
        let registry = HandlerRegistry::new();
        let (hits, cb1) = counter();
        let (other_hits, cb2) = counter();
        assert!(registry.register("deleteEvent", "deleteEvent", true, cb1));
        assert!(!registry.register("deleteEvent", "deleteEvent", true, cb2));
        assert_eq!(registry.len(), 1);

        registry.fire(&Frame::new("deleteEvent"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(other_hits.load(Ordering::SeqCst), 0, "second registration must be ignored, not replace");
    }

    #[test]
    fn one_shot_fires_at_most_once() {
        let registry = HandlerRegistry::new();
        let (hits, cb) = counter();
        registry.register("filter", "filter", true, cb);

        assert_eq!(registry.fire(&Frame::new("filter")), 1);
        assert_eq!(registry.fire(&Frame::new("filter")), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!registry.is_registered("filter"));
    }

    #[test]
    fn persistent_handler_keeps_firing() {
        let registry = HandlerRegistry::new();
        let (hits, cb) = counter();
        registry.register_persistent("chat-screen", "newChat", cb);
        for _ in 0..3 {
            registry.fire(&Frame::new("newChat"));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(registry.is_registered("chat-screen"));
    }

    #[test]
    fn unregister_unknown_is_noop() {
        let registry = HandlerRegistry::new();
        let (hits, cb) = counter();
        registry.register("a", "getMatch", true, cb);
        assert!(!registry.unregister("nope"));
        assert!(registry.is_registered("a"));
        registry.fire(&Frame::new("getMatch"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn non_matching_type_is_untouched() {
        let registry = HandlerRegistry::new();
        let (hits, cb) = counter();
        registry.register("a", "deleteEvent", true, cb);
        assert_eq!(registry.fire(&Frame::new("addNewEvent")), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(registry.is_registered("a"));
    }

    #[test]
    fn fan_out_runs_in_registration_order() {
        let registry = HandlerRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for id in [3, 1, 2] {
            let order = order.clone();
            registry.register(&format!("getMatch:{id}"), "getMatch", true, move |_| {
                order.lock().push(id)
            });
        }
        assert_eq!(registry.fire(&Frame::new("getMatch")), 3);
        assert_eq!(*order.lock(), vec![3, 1, 2]);
        assert!(registry.is_empty());
    }

    #[test]
    fn echoed_request_id_selects_its_handler() {
        let registry = HandlerRegistry::new();
        let (first, cb1) = counter();
        let (second, cb2) = counter();
        registry.register_once("deleteEvent:1", "deleteEvent", Some(10), cb1);
        registry.register_once("deleteEvent:2", "deleteEvent", Some(11), cb2);

        let reply = Frame::new("deleteEvent").with(crate::frame::REQUEST_ID, 11u64);
        assert_eq!(registry.fire(&reply), 1);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert!(registry.is_registered("deleteEvent:1"));
    }

    #[test]
    fn joined_request_id_reaches_pending_handler() {
        let registry = HandlerRegistry::new();
        let (hits, cb1) = counter();
        let (dropped, cb2) = counter();
        assert!(registry.register_once("deleteKidInfo:3", "deleteKidInfo", Some(1), cb1));
        assert!(!registry.register_once("deleteKidInfo:3", "deleteKidInfo", Some(2), cb2));

        let reply = Frame::new("deleteKidInfo").with(crate::frame::REQUEST_ID, 2u64);
        assert_eq!(registry.fire(&reply), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(dropped.load(Ordering::SeqCst), 0);
        assert!(!registry.is_registered("deleteKidInfo:3"));
    }

    #[test]
    fn subscribers_still_see_correlated_replies() {
        let registry = HandlerRegistry::new();
        let (hits, cb) = counter();
        registry.register_persistent("audit", "deleteEvent", cb);
        let reply = Frame::new("deleteEvent").with(crate::frame::REQUEST_ID, 99u64);
        registry.fire(&reply);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_may_touch_registry_while_running() {
        let registry = Arc::new(HandlerRegistry::new());
        let inner = registry.clone();
        registry.register("outer", "login", true, move |_| {
            inner.register("follow-up", "verifyToken", true, |_| {});
            inner.unregister("outer");
        });
        registry.fire(&Frame::new("login"));
        assert!(registry.is_registered("follow-up"));
        assert!(!registry.is_registered("outer"));
    }
}
