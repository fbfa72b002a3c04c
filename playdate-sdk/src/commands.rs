//! Command façade: typed helpers that validate parameters, register a
//! one-shot reply handler, and send the command frame.
//!
//! Each outbound frame carries a fresh `requestId`. When the server echoes it,
//! the reply reaches exactly the handler that sent it. When it does not, the
//! reply goes to every still-registered handler of the same `type`, so two
//! concurrent commands of one type with different handler names may see each
//! other's replies. Handler names are per command and per target (for example
//! `deleteEvent:42`), which keeps re-issued identical requests from
//! double-subscribing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde_json::{Map, Value};

use crate::connection::ConnectionHandle;
use crate::error::Error;
use crate::frame::{value_as_i64, Frame, REQUEST_ID};
use crate::registry::HandlerRegistry;
use crate::store::SessionStore;

/// Command discriminants sent over the socket. Replies echo the same `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Login,
    Register,
    VerifyToken,
    GetUserEvents,
    GetMatch,
    DeleteEvent,
    AddNewEvent,
    SignUpEvent,
    ApproveSignUp,
    Filter,
    AddKidInfo,
    DeleteKidInfo,
}

impl CommandKind {
    pub const ALL: [CommandKind; 12] = [
        Self::Login,
        Self::Register,
        Self::VerifyToken,
        Self::GetUserEvents,
        Self::GetMatch,
        Self::DeleteEvent,
        Self::AddNewEvent,
        Self::SignUpEvent,
        Self::ApproveSignUp,
        Self::Filter,
        Self::AddKidInfo,
        Self::DeleteKidInfo,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Register => "register",
            Self::VerifyToken => "verifyToken",
            Self::GetUserEvents => "getUserEvents",
            Self::GetMatch => "getMatch",
            Self::DeleteEvent => "deleteEvent",
            Self::AddNewEvent => "addNewEvent",
            Self::SignUpEvent => "signUpEvent",
            Self::ApproveSignUp => "approveSignUp",
            Self::Filter => "filter",
            Self::AddKidInfo => "addkidinfo",
            Self::DeleteKidInfo => "deleteKidInfo",
        }
    }

    /// Map a wire `type` back to a command. Both spellings of the kid-info
    /// command are accepted.
    pub fn from_type(kind: &str) -> Option<Self> {
        if kind == "addKidInfo" {
            return Some(Self::AddKidInfo);
        }
        Self::ALL.into_iter().find(|k| k.as_str() == kind)
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a command's callback receives.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    pub success: bool,
    pub message: Option<String>,
    /// The reply frame; `None` when the command never left the client.
    pub frame: Option<Frame>,
}

impl CommandOutcome {
    fn from_frame(frame: &Frame) -> Self {
        Self {
            success: frame.is_success(),
            message: frame.message().map(str::to_string),
            frame: Some(frame.clone()),
        }
    }

    fn rejected(error: &Error) -> Self {
        Self {
            success: false,
            message: Some(error.to_string()),
            frame: None,
        }
    }
}

/// What happened to a command at the moment it was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handler registered and frame written.
    Sent,
    /// A handler with the same name was already waiting. The frame was
    /// written; the earlier handler will receive the reply and the new
    /// callback is discarded.
    Joined,
    /// Connection not open. Nothing was queued and the handler was released.
    Dropped,
    /// A required parameter was missing. The callback already ran with a
    /// failure and nothing was sent.
    Invalid,
}

impl SendOutcome {
    pub fn was_sent(self) -> bool {
        matches!(self, Self::Sent | Self::Joined)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid_ids: Option<Vec<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

/// A kid signing up for, or being approved into, an event.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignUp {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_age: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_age: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_km: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KidInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interests: Option<Vec<String>>,
}

fn require<T>(command: CommandKind, field: &'static str, value: Option<T>) -> Result<T, Error> {
    value.ok_or(Error::Validation {
        command: command.as_str(),
        field,
    })
}

fn payload_of(params: &impl Serialize) -> Map<String, Value> {
    match serde_json::to_value(params) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

/// The typed command surface. Cheap to clone.
#[derive(Clone)]
pub struct Commands {
    conn: ConnectionHandle,
    registry: Arc<HandlerRegistry>,
    store: Arc<SessionStore>,
    next_request: Arc<AtomicU64>,
}

impl Commands {
    pub fn new(conn: ConnectionHandle, registry: Arc<HandlerRegistry>, store: Arc<SessionStore>) -> Self {
        Self {
            conn,
            registry,
            store,
            next_request: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register `callback` under `name` for a reply of `kind`, then send.
    fn issue<F>(&self, kind: CommandKind, name: String, frame: Frame, callback: F) -> SendOutcome
    where
        F: FnOnce(CommandOutcome) + Send + 'static,
    {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let frame = frame.with(REQUEST_ID, request_id);

        let registered = self
            .registry
            .register_once(&name, kind.as_str(), Some(request_id), move |reply| {
                callback(CommandOutcome::from_frame(reply))
            });

        if !self.conn.send(&frame) {
            if registered {
                self.registry.unregister(&name);
            }
            return SendOutcome::Dropped;
        }
        tracing::debug!(%kind, name = %name, request_id, "command sent");
        if registered {
            SendOutcome::Sent
        } else {
            SendOutcome::Joined
        }
    }

    fn invalid<F>(&self, error: Error, callback: F) -> SendOutcome
    where
        F: FnOnce(CommandOutcome),
    {
        tracing::error!("{error}");
        callback(CommandOutcome::rejected(&error));
        SendOutcome::Invalid
    }

    /// Socket-level login. On success the reply's `userInfo` marks the
    /// session logged in; on failure its message becomes the login error.
    pub fn login<F>(&self, credentials: Credentials, callback: F) -> SendOutcome
    where
        F: FnOnce(CommandOutcome) + Send + 'static,
    {
        let kind = CommandKind::Login;
        if let Err(e) = require(kind, "email", credentials.email.as_ref())
            .and(require(kind, "password", credentials.password.as_ref()))
        {
            return self.invalid(e, callback);
        }
        let frame = Frame::with_payload(kind.as_str(), payload_of(&credentials));
        self.issue(kind, kind.as_str().to_string(), frame, callback)
    }

    pub fn register<F>(&self, credentials: Credentials, callback: F) -> SendOutcome
    where
        F: FnOnce(CommandOutcome) + Send + 'static,
    {
        let kind = CommandKind::Register;
        if let Err(e) = require(kind, "email", credentials.email.as_ref())
            .and(require(kind, "password", credentials.password.as_ref()))
        {
            return self.invalid(e, callback);
        }
        let frame = Frame::with_payload(kind.as_str(), payload_of(&credentials));
        self.issue(kind, kind.as_str().to_string(), frame, callback)
    }

    /// In-band handshake associating this socket with the stored session.
    pub fn verify_token<F>(&self, token: Option<&str>, callback: F) -> SendOutcome
    where
        F: FnOnce(CommandOutcome) + Send + 'static,
    {
        let kind = CommandKind::VerifyToken;
        let token = match require(kind, "token", token.filter(|t| !t.is_empty())) {
            Ok(token) => token,
            Err(e) => return self.invalid(e, callback),
        };
        let frame = Frame::new(kind.as_str()).with("token", token);
        self.issue(kind, kind.as_str().to_string(), frame, callback)
    }

    /// Fetch the signed-in user's own and kids' events.
    pub fn get_user_events<F>(&self, callback: F) -> SendOutcome
    where
        F: FnOnce(CommandOutcome) + Send + 'static,
    {
        let kind = CommandKind::GetUserEvents;
        let user_id = match require(kind, "userId", self.store.user_id()) {
            Ok(id) => id,
            Err(e) => return self.invalid(e, callback),
        };
        let frame = Frame::new(kind.as_str()).with("userId", user_id);
        self.issue(kind, format!("{kind}:{user_id}"), frame, callback)
    }

    /// Ask for matches for every event the user owns: one sub-request per
    /// event, each under its own handler name, all answered with `getMatch`.
    /// The store merges each reply into `matchedEvents[sourceEventId]`.
    ///
    /// `callback` runs once per answered sub-request with its source event id.
    pub fn get_match<F>(&self, callback: F) -> Vec<(i64, SendOutcome)>
    where
        F: Fn(i64, CommandOutcome) + Send + Sync + 'static,
    {
        let kind = CommandKind::GetMatch;
        let callback = Arc::new(callback);
        let event_ids: Vec<i64> = self
            .store
            .user_events()
            .iter()
            .filter_map(|e| e.get("id").and_then(value_as_i64))
            .collect();
        if event_ids.is_empty() {
            tracing::debug!("no owned events, nothing to match");
        }

        event_ids
            .into_iter()
            .map(|event_id| {
                let callback = callback.clone();
                let frame = Frame::new(kind.as_str()).with("eventId", event_id);
                let outcome = self.issue(kind, format!("{kind}:{event_id}"), frame, move |o| {
                    callback(event_id, o)
                });
                (event_id, outcome)
            })
            .collect()
    }

    pub fn delete_event<F>(&self, event_id: Option<i64>, callback: F) -> SendOutcome
    where
        F: FnOnce(CommandOutcome) + Send + 'static,
    {
        let kind = CommandKind::DeleteEvent;
        let event_id = match require(kind, "eventId", event_id) {
            Ok(id) => id,
            Err(e) => return self.invalid(e, callback),
        };
        let frame = Frame::new(kind.as_str()).with("eventId", event_id);
        self.issue(kind, format!("{kind}:{event_id}"), frame, callback)
    }

    pub fn add_new_event<F>(&self, event: NewEvent, callback: F) -> SendOutcome
    where
        F: FnOnce(CommandOutcome) + Send + 'static,
    {
        let kind = CommandKind::AddNewEvent;
        let topic = match require(kind, "topic", event.topic.clone().filter(|t| !t.trim().is_empty()))
            .and_then(|topic| require(kind, "startTime", event.start_time.as_ref()).map(|_| topic))
        {
            Ok(topic) => topic,
            Err(e) => return self.invalid(e, callback),
        };
        let frame = Frame::with_payload(kind.as_str(), payload_of(&event));
        self.issue(kind, format!("{kind}:{topic}"), frame, callback)
    }

    pub fn sign_up_event<F>(&self, signup: SignUp, callback: F) -> SendOutcome
    where
        F: FnOnce(CommandOutcome) + Send + 'static,
    {
        self.signup_like(CommandKind::SignUpEvent, signup, callback)
    }

    /// Approve a kid's signup to one of the user's events.
    pub fn approve_sign_up<F>(&self, signup: SignUp, callback: F) -> SendOutcome
    where
        F: FnOnce(CommandOutcome) + Send + 'static,
    {
        self.signup_like(CommandKind::ApproveSignUp, signup, callback)
    }

    fn signup_like<F>(&self, kind: CommandKind, signup: SignUp, callback: F) -> SendOutcome
    where
        F: FnOnce(CommandOutcome) + Send + 'static,
    {
        let ids = require(kind, "eventId", signup.event_id)
            .and_then(|event| require(kind, "kidId", signup.kid_id).map(|kid| (event, kid)));
        let (event_id, kid_id) = match ids {
            Ok(ids) => ids,
            Err(e) => return self.invalid(e, callback),
        };
        let frame = Frame::with_payload(kind.as_str(), payload_of(&signup));
        self.issue(kind, format!("{kind}:{event_id}:{kid_id}"), frame, callback)
    }

    /// Recommended-event search. All criteria are optional; the reply
    /// replaces `recommendEvents`.
    pub fn filter<F>(&self, filter: EventFilter, callback: F) -> SendOutcome
    where
        F: FnOnce(CommandOutcome) + Send + 'static,
    {
        let kind = CommandKind::Filter;
        let frame = Frame::with_payload(kind.as_str(), payload_of(&filter));
        self.issue(kind, kind.as_str().to_string(), frame, callback)
    }

    pub fn add_kid_info<F>(&self, kid: KidInfo, callback: F) -> SendOutcome
    where
        F: FnOnce(CommandOutcome) + Send + 'static,
    {
        let kind = CommandKind::AddKidInfo;
        let name = match require(kind, "name", kid.name.clone().filter(|n| !n.trim().is_empty())) {
            Ok(name) => name,
            Err(e) => return self.invalid(e, callback),
        };
        let frame = Frame::with_payload(kind.as_str(), payload_of(&kid));
        self.issue(kind, format!("{kind}:{name}"), frame, callback)
    }

    pub fn delete_kid_info<F>(&self, kid_id: Option<i64>, callback: F) -> SendOutcome
    where
        F: FnOnce(CommandOutcome) + Send + 'static,
    {
        let kind = CommandKind::DeleteKidInfo;
        let kid_id = match require(kind, "kidId", kid_id) {
            Ok(id) => id,
            Err(e) => return self.invalid(e, callback),
        };
        let frame = Frame::new(kind.as_str()).with("kidId", kid_id);
        self.issue(kind, format!("{kind}:{kid_id}"), frame, callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_round_trip_through_wire_names() {
        for kind in CommandKind::ALL {
            assert_eq!(CommandKind::from_type(kind.as_str()), Some(kind));
        }
        assert_eq!(CommandKind::from_type("addKidInfo"), Some(CommandKind::AddKidInfo));
        assert_eq!(CommandKind::from_type("newChat"), None);
    }

    #[test]
    fn params_serialize_camel_case_and_skip_missing() {
        let event = NewEvent {
            topic: Some("Picnic".into()),
            start_time: Some("2026-06-01T10:00:00Z".into()),
            ..Default::default()
        };
        let map = payload_of(&event);
        assert_eq!(map.get("topic").and_then(Value::as_str), Some("Picnic"));
        assert!(map.contains_key("startTime"));
        assert!(!map.contains_key("description"));
    }

    #[test]
    fn validation_error_names_command_and_field() {
        let err = require::<i64>(CommandKind::DeleteEvent, "eventId", None).unwrap_err();
        assert_eq!(err.to_string(), "deleteEvent: missing required parameter `eventId`");
    }
}
