//! Auth bootstrap: `NoToken -> Verifying -> {Verified, Failed}`.
//!
//! Any verification failure, including an unreachable server, tears the
//! session down: the stored token is deleted and the session store returns to
//! first-launch state. The teardown path (`clear_session`) is reached only
//! from [`Auth::logout`] and from a failed verification.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::watch;

use crate::api::{Api, ApiReply, Endpoint};
use crate::commands::Credentials;
use crate::error::{Error, Result};
use crate::event::{Event, EventSink};
use crate::storage::{SecureStore, TOKEN_KEY};
use crate::store::{SessionStore, UserInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    NoToken,
    Verifying,
    Verified,
    Failed,
}

pub struct Auth {
    store: Arc<SessionStore>,
    api: Arc<dyn Api>,
    secrets: Arc<dyn SecureStore>,
    state: watch::Sender<AuthState>,
    events: Option<EventSink>,
}

impl Auth {
    pub fn new(store: Arc<SessionStore>, api: Arc<dyn Api>, secrets: Arc<dyn SecureStore>) -> Self {
        let (state, _) = watch::channel(AuthState::NoToken);
        Self {
            store,
            api,
            secrets,
            state,
            events: None,
        }
    }

    pub(crate) fn with_events(mut self, events: EventSink) -> Self {
        self.events = Some(events);
        self
    }

    pub fn state(&self) -> AuthState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: AuthState) {
        tracing::debug!(?state, "auth state");
        self.state.send_replace(state);
    }

    fn emit(&self, event: Event) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }

    /// Startup check: read the persisted token and verify it with the server.
    pub async fn bootstrap(&self) -> AuthState {
        let token = match self.secrets.get(TOKEN_KEY) {
            Ok(token) => token.filter(|t| !t.is_empty()),
            Err(e) => {
                tracing::warn!("can't read stored token: {e}");
                None
            }
        };
        let Some(token) = token else {
            tracing::debug!("no stored token");
            self.fail(None);
            return self.state();
        };

        self.set_state(AuthState::Verifying);
        self.store.set_token(Some(token.clone()));

        let verified = self
            .api
            .call(Endpoint::VerifyToken, Some(&token), json!({ "token": token }))
            .await
            .and_then(ApiReply::into_result)
            .and_then(|reply| {
                reply
                    .decode::<UserInfo>("userInfo")
                    .ok_or_else(|| Error::Rejected("verification reply without userInfo".to_string()))
            });

        match verified {
            Ok(info) => {
                self.store.set_logged_in(info);
                self.set_state(AuthState::Verified);
                tracing::info!("stored token verified");
            }
            Err(e) => self.fail_verification(e.to_string()),
        }
        self.state()
    }

    pub async fn login(&self, credentials: Credentials) -> Result<UserInfo> {
        self.authenticate(Endpoint::Login, credentials).await
    }

    pub async fn register(&self, credentials: Credentials) -> Result<UserInfo> {
        self.authenticate(Endpoint::Register, credentials).await
    }

    async fn authenticate(&self, endpoint: Endpoint, credentials: Credentials) -> Result<UserInfo> {
        let command = match endpoint {
            Endpoint::Register => "register",
            _ => "login",
        };
        if credentials.email.is_none() {
            return Err(Error::Validation { command, field: "email" });
        }
        if credentials.password.is_none() {
            return Err(Error::Validation { command, field: "password" });
        }

        let body = serde_json::to_value(&credentials)?;
        let outcome = self
            .api
            .call(endpoint, None, body)
            .await
            .and_then(ApiReply::into_result)
            .and_then(|reply| {
                let token = reply.decode::<String>("token");
                let info = reply.decode::<UserInfo>("userInfo");
                match (token, info) {
                    (Some(token), Some(info)) if !token.is_empty() => Ok((token, info)),
                    _ => Err(Error::Rejected(format!("{command} reply without token or userInfo"))),
                }
            });

        let (token, info) = match outcome {
            Ok(pair) => pair,
            Err(e) => {
                let message = match &e {
                    Error::Rejected(m) => m.clone(),
                    other => other.to_string(),
                };
                self.store.set_login_error(message);
                return Err(e);
            }
        };

        self.secrets.set(TOKEN_KEY, &token)?;
        self.store.set_token(Some(token));
        self.store.set_logged_in(info.clone());
        self.set_state(AuthState::Verified);
        tracing::info!(user_id = ?info.id, "{command} succeeded");
        Ok(info)
    }

    /// Explicit logout. The server is told best-effort; local state is cleared
    /// regardless.
    pub async fn logout(&self) {
        if let Some(token) = self.store.token() {
            let result = self.api.call(Endpoint::Logout, Some(&token), json!({})).await;
            if let Err(e) = result.and_then(ApiReply::into_result) {
                tracing::warn!("server logout failed: {e}");
            }
        }
        self.clear_session();
        self.set_state(AuthState::NoToken);
        tracing::info!("logged out");
        self.emit(Event::LoggedOut);
    }

    /// Token rejected, by the startup check or the in-band socket handshake.
    pub fn fail_verification(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!("token verification failed: {reason}");
        self.fail(Some(reason));
    }

    fn fail(&self, reason: Option<String>) {
        self.clear_session();
        self.set_state(AuthState::Failed);
        if let Some(reason) = reason {
            self.emit(Event::AuthFailed { reason });
        }
    }

    fn clear_session(&self) {
        if let Err(e) = self.secrets.delete(TOKEN_KEY) {
            tracing::warn!("can't delete stored token: {e}");
        }
        self.store.clear();
    }
}
