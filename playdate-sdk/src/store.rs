//! Session/cache store: the client-side mirror of server-authoritative state.
//!
//! Single writer. Only the dispatcher's reducer, successful command or REST
//! outcomes, and the auth clear path mutate it; everything else reads
//! snapshots. Aggregates derived from the user snapshot (`userEvents`,
//! `kidEvents`, `notifications`, `following`) are replaced wholesale whenever
//! a new snapshot arrives. `matchedEvents` and chat transcripts accumulate.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;

use crate::cache::TtlCache;
use crate::commands::CommandKind;
use crate::frame::{value_as_i64, Frame};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoginState {
    pub logined: bool,
    pub error: Option<String>,
}

/// Authoritative user/session snapshot as returned by the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    #[serde(default, deserialize_with = "lenient_id")]
    pub id: Option<i64>,
    #[serde(default)]
    pub events: Vec<Value>,
    #[serde(default)]
    pub kid_events: Vec<Value>,
    #[serde(default)]
    pub notifications: Vec<Notification>,
    #[serde(default)]
    pub following: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(default, deserialize_with = "lenient_id")]
    pub id: Option<i64>,
    #[serde(default)]
    pub read: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One match candidate for a source event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchEvent {
    pub event: Value,
    #[serde(default)]
    pub score: f64,
}

impl MatchEvent {
    pub fn event_id(&self) -> Option<i64> {
        self.event.get("id").and_then(value_as_i64)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTranscript {
    pub chat_id: String,
    pub messages: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub token: Option<String>,
    pub login_state: LoginState,
    pub user_info: Option<UserInfo>,
    pub notifications: Vec<Notification>,
    pub user_events: Vec<Value>,
    pub kid_events: Vec<Value>,
    pub matched_events: HashMap<i64, Vec<MatchEvent>>,
    pub chat_messages: Vec<ChatTranscript>,
    pub following: Vec<Value>,
    pub recommend_events: Vec<Value>,
}

impl SessionState {
    fn apply_user_info(&mut self, info: UserInfo) {
        self.user_events = info.events.clone();
        self.kid_events = info.kid_events.clone();
        self.notifications = info.notifications.clone();
        self.following = info.following.clone();
        self.user_info = Some(info);
    }

    fn transcript_mut(&mut self, chat_id: &str) -> &mut ChatTranscript {
        let pos = match self.chat_messages.iter().position(|t| t.chat_id == chat_id) {
            Some(pos) => pos,
            None => {
                self.chat_messages.push(ChatTranscript {
                    chat_id: chat_id.to_string(),
                    messages: Vec::new(),
                });
                self.chat_messages.len() - 1
            }
        };
        &mut self.chat_messages[pos]
    }
}

/// Merge fresh match results into an accumulated list: entries whose event id
/// is already present are replaced in place, the rest are appended.
pub fn merge_matches(existing: &mut Vec<MatchEvent>, incoming: Vec<MatchEvent>) {
    for candidate in incoming {
        let slot = candidate
            .event_id()
            .and_then(|id| existing.iter().position(|m| m.event_id() == Some(id)));
        match slot {
            Some(i) => existing[i] = candidate,
            None => existing.push(candidate),
        }
    }
}

pub struct SessionStore {
    state: RwLock<SessionState>,
    profiles: TtlCache<i64, Value>,
    kids: TtlCache<i64, Value>,
    revision: watch::Sender<u64>,
}

impl SessionStore {
    pub fn new(cache_ttl: Duration) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            state: RwLock::new(SessionState::default()),
            profiles: TtlCache::new(cache_ttl),
            kids: TtlCache::new(cache_ttl),
            revision,
        }
    }

    /// Change notifications: the value is a revision counter bumped on every
    /// mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn snapshot(&self) -> SessionState {
        self.state.read().clone()
    }

    pub fn token(&self) -> Option<String> {
        self.state.read().token.clone()
    }

    pub fn login_state(&self) -> LoginState {
        self.state.read().login_state.clone()
    }

    pub fn is_logged_in(&self) -> bool {
        self.state.read().login_state.logined
    }

    pub fn user_info(&self) -> Option<UserInfo> {
        self.state.read().user_info.clone()
    }

    pub fn user_id(&self) -> Option<i64> {
        self.state.read().user_info.as_ref().and_then(|u| u.id)
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.state.read().notifications.clone()
    }

    pub fn user_events(&self) -> Vec<Value> {
        self.state.read().user_events.clone()
    }

    pub fn kid_events(&self) -> Vec<Value> {
        self.state.read().kid_events.clone()
    }

    pub fn matched_events(&self) -> HashMap<i64, Vec<MatchEvent>> {
        self.state.read().matched_events.clone()
    }

    pub fn matches_for(&self, source_event_id: i64) -> Vec<MatchEvent> {
        self.state
            .read()
            .matched_events
            .get(&source_event_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn chat_messages(&self) -> Vec<ChatTranscript> {
        self.state.read().chat_messages.clone()
    }

    pub fn transcript(&self, chat_id: &str) -> Option<ChatTranscript> {
        self.state
            .read()
            .chat_messages
            .iter()
            .find(|t| t.chat_id == chat_id)
            .cloned()
    }

    pub fn following(&self) -> Vec<Value> {
        self.state.read().following.clone()
    }

    pub fn recommend_events(&self) -> Vec<Value> {
        self.state.read().recommend_events.clone()
    }

    pub fn profile_cache(&self) -> &TtlCache<i64, Value> {
        &self.profiles
    }

    pub fn kid_cache(&self) -> &TtlCache<i64, Value> {
        &self.kids
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let out = {
            let mut state = self.state.write();
            f(&mut *state)
        };
        self.revision.send_modify(|r| *r = r.wrapping_add(1));
        out
    }

    pub(crate) fn set_token(&self, token: Option<String>) {
        self.mutate(|s| s.token = token);
    }

    /// Replace the authoritative snapshot without touching login state.
    pub(crate) fn apply_user_info(&self, info: UserInfo) {
        self.mutate(|s| s.apply_user_info(info));
    }

    /// Mark the session as server-verified. Login state and the snapshot are
    /// written together, so `logined` never holds without a `user_info`.
    pub(crate) fn set_logged_in(&self, info: UserInfo) {
        self.mutate(|s| {
            s.apply_user_info(info);
            s.login_state = LoginState {
                logined: true,
                error: None,
            };
        });
    }

    pub(crate) fn set_login_error(&self, error: impl Into<String>) {
        let error = error.into();
        self.mutate(|s| {
            s.login_state = LoginState {
                logined: false,
                error: Some(error),
            };
        });
    }

    /// Optimistically flag a notification as read. Returns `false` if no
    /// notification with that id is known.
    pub(crate) fn mark_notification_read(&self, id: i64) -> bool {
        self.mutate(|s| {
            let mut found = false;
            for n in s.notifications.iter_mut().filter(|n| n.id == Some(id)) {
                n.read = true;
                found = true;
            }
            found
        })
    }

    /// Replace a transcript wholesale with freshly fetched history.
    pub(crate) fn replace_transcript(&self, chat_id: &str, messages: Vec<Value>) {
        self.mutate(|s| s.transcript_mut(chat_id).messages = messages);
    }

    pub(crate) fn append_chat_message(&self, chat_id: &str, message: Value) {
        self.mutate(|s| s.transcript_mut(chat_id).messages.push(message));
    }

    pub(crate) fn merge_matches(&self, source_event_id: i64, incoming: Vec<MatchEvent>) {
        self.mutate(|s| {
            merge_matches(s.matched_events.entry(source_event_id).or_default(), incoming)
        });
    }

    /// Return to first-launch state: session, login state, derived views,
    /// matches, transcripts and both profile caches.
    ///
    /// The caches are emptied while the state write lock is held, so no
    /// reader sees a cleared cache next to a logged-in session.
    pub(crate) fn clear(&self) {
        self.mutate(|s| {
            self.profiles.clear();
            self.kids.clear();
            *s = SessionState::default();
        });
    }

    /// Fold one inbound frame into the session. Returns whether anything
    /// changed. Runs for every frame, before any registered handler.
    pub(crate) fn reduce(&self, frame: &Frame) -> bool {
        if frame.success() == Some(false) {
            if frame.kind == CommandKind::Login.as_str() {
                self.set_login_error(frame.message().unwrap_or("login failed"));
                return true;
            }
            return false;
        }

        match frame.kind.as_str() {
            "newChat" => {
                let Some(chat_id) = frame.get("chatId").and_then(chat_key) else {
                    tracing::warn!("newChat frame without chatId");
                    return false;
                };
                let Some(mut message) = frame.get("message").cloned() else {
                    return false;
                };
                if let Value::Object(ref mut m) = message {
                    m.entry("createdAt")
                        .or_insert_with(|| Value::String(chrono::Utc::now().to_rfc3339()));
                }
                self.append_chat_message(&chat_id, message);
                true
            }
            "notification" => {
                let Some(notification) = frame.decode::<Notification>("notification") else {
                    return false;
                };
                self.mutate(|s| s.notifications.push(notification));
                true
            }
            "getMatch" => {
                let Some(source) = frame.i64_field("sourceEventId") else {
                    return false;
                };
                let matches = frame.decode::<Vec<MatchEvent>>("matches").unwrap_or_default();
                self.merge_matches(source, matches);
                true
            }
            "filter" => {
                let Some(events) = frame.decode::<Vec<Value>>("events") else {
                    return false;
                };
                self.mutate(|s| s.recommend_events = events);
                true
            }
            "getUserEvents" => {
                let events = frame.decode::<Vec<Value>>("events");
                let kid_events = frame.decode::<Vec<Value>>("kidEvents");
                if events.is_none() && kid_events.is_none() {
                    return false;
                }
                self.mutate(|s| {
                    if let Some(events) = events {
                        s.user_events = events;
                    }
                    if let Some(kid_events) = kid_events {
                        s.kid_events = kid_events;
                    }
                });
                true
            }
            "login" | "verifyToken" => match frame.decode::<UserInfo>("userInfo") {
                Some(info) if frame.is_success() => {
                    self.set_logged_in(info);
                    true
                }
                _ => false,
            },
            // Mutating commands answer with a fresh snapshot.
            _ => match frame.decode::<UserInfo>("userInfo") {
                Some(info) if frame.is_success() => {
                    self.apply_user_info(info);
                    true
                }
                _ => false,
            },
        }
    }
}

/// Chat ids arrive as numbers or strings; transcripts are keyed by the string form.
fn chat_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn lenient_id<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(value_as_i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DEFAULT_TTL;
    use serde_json::json;

    fn store() -> SessionStore {
        SessionStore::new(DEFAULT_TTL)
    }

    fn frame(value: Value) -> Frame {
        Frame::parse(&value.to_string()).unwrap()
    }

    #[test]
    fn match_results_accumulate_by_event_id() {
        let store = store();
        store.reduce(&frame(json!({
            "type": "getMatch", "success": true, "sourceEventId": 5,
            "matches": [{"event": {"id": 1}, "score": 0.2}]
        })));
        store.reduce(&frame(json!({
            "type": "getMatch", "success": true, "sourceEventId": 5,
            "matches": [{"event": {"id": 1}, "score": 0.5}, {"event": {"id": 2}, "score": 0.1}]
        })));

        let matches = store.matches_for(5);
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].event_id(), Some(1));
        assert_eq!(matches[0].score, 0.5);
        assert_eq!(matches[1].event_id(), Some(2));
        assert_eq!(matches[1].score, 0.1);
    }

    #[test]
    fn snapshot_replaces_derived_views_wholesale() {
        let store = store();
        store.reduce(&frame(json!({
            "type": "addNewEvent", "success": true,
            "userInfo": {"id": 1, "events": [{"id": 10}, {"id": 11}], "notifications": [{"id": 1}]}
        })));
        assert_eq!(store.user_events().len(), 2);

        store.reduce(&frame(json!({
            "type": "deleteEvent", "success": true,
            "userInfo": {"id": 1, "events": [{"id": 11}]}
        })));
        assert_eq!(store.user_events(), vec![json!({"id": 11})]);
        assert!(store.notifications().is_empty());
        // a snapshot alone does not log anyone in
        assert!(!store.is_logged_in());
    }

    #[test]
    fn failed_reply_leaves_state_alone() {
        let store = store();
        let changed = store.reduce(&frame(json!({
            "type": "addNewEvent", "success": false, "message": "nope",
            "userInfo": {"events": [{"id": 1}]}
        })));
        assert!(!changed);
        assert!(store.user_info().is_none());
    }

    #[test]
    fn login_reply_sets_login_state() {
        let store = store();
        store.reduce(&frame(json!({"type": "login", "success": false, "message": "bad password"})));
        assert_eq!(store.login_state().error.as_deref(), Some("bad password"));

        store.reduce(&frame(json!({"type": "login", "success": true, "userInfo": {"id": "42"}})));
        let state = store.login_state();
        assert!(state.logined);
        assert!(state.error.is_none());
        assert_eq!(store.user_id(), Some(42));
    }

    #[test]
    fn chat_push_appends_and_history_replaces() {
        let store = store();
        store.reduce(&frame(json!({"type": "newChat", "chatId": 3, "message": {"text": "hi"}})));
        store.reduce(&frame(json!({"type": "newChat", "chatId": "3", "message": {"text": "again"}})));
        let transcript = store.transcript("3").unwrap();
        assert_eq!(transcript.messages.len(), 2);
        assert!(transcript.messages[0]["createdAt"].is_string());

        store.replace_transcript("3", vec![json!({"text": "from history"})]);
        assert_eq!(store.transcript("3").unwrap().messages, vec![json!({"text": "from history"})]);
        assert_eq!(store.chat_messages().len(), 1);
    }

    #[test]
    fn notification_push_and_optimistic_read() {
        let store = store();
        store.reduce(&frame(json!({"type": "notification", "notification": {"id": 8, "body": "signup"}})));
        assert_eq!(store.notifications().len(), 1);
        assert!(store.mark_notification_read(8));
        assert!(store.notifications()[0].read);
        assert!(!store.mark_notification_read(9));
    }

    #[test]
    fn filter_and_user_events_replies() {
        let store = store();
        store.reduce(&frame(json!({"type": "filter", "success": true, "events": [{"id": 1}]})));
        assert_eq!(store.recommend_events().len(), 1);

        store.reduce(&frame(json!({
            "type": "getUserEvents", "success": true,
            "events": [{"id": 2}], "kidEvents": [{"id": 3}, {"id": 4}]
        })));
        assert_eq!(store.user_events().len(), 1);
        assert_eq!(store.kid_events().len(), 2);
    }

    #[test]
    fn unknown_frames_are_ignored() {
        let store = store();
        let rx = store.subscribe();
        assert!(!store.reduce(&frame(json!({"type": "somethingNew", "x": 1}))));
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn clear_returns_to_first_launch() {
        let store = store();
        store.set_token(Some("t".into()));
        store.set_logged_in(UserInfo {
            id: Some(1),
            notifications: vec![Notification::default()],
            ..Default::default()
        });
        store.merge_matches(5, vec![MatchEvent { event: json!({"id": 1}), score: 0.2 }]);
        store.profile_cache().insert(7, json!({"name": "Ann"}));
        store.reduce(&frame(json!({"type": "filter", "events": [{"id": 1}]})));

        store.clear();
        assert_eq!(store.snapshot(), SessionState::default());
        assert!(store.profile_cache().is_empty());
        assert!(store.kid_cache().is_empty());
    }

    #[test]
    fn clear_waits_for_readers_before_touching_caches() {
        let store = store();
        store.set_logged_in(UserInfo { id: Some(1), ..Default::default() });
        store.profile_cache().insert(7, json!({"name": "Ann"}));
        store.kid_cache().insert(9, json!({"name": "Kit"}));

        std::thread::scope(|scope| {
            let reader = store.state.read();
            let clearing = scope.spawn(|| store.clear());
            std::thread::sleep(std::time::Duration::from_millis(50));
            assert!(reader.login_state.logined);
            assert_eq!(store.profile_cache().len(), 1);
            assert_eq!(store.kid_cache().len(), 1);
            drop(reader);
            clearing.join().unwrap();
        });

        assert!(!store.is_logged_in());
        assert!(store.profile_cache().is_empty());
        assert!(store.kid_cache().is_empty());
    }

    #[test]
    fn mutations_bump_revision() {
        let store = store();
        let mut rx = store.subscribe();
        store.set_token(Some("t".into()));
        assert!(rx.has_changed().unwrap());
        let _ = rx.borrow_and_update();
        store.clear();
        assert!(rx.has_changed().unwrap());
    }
}
