//! REST collaborator: the plain request/response endpoints used next to the
//! socket (login, search, chat history, ...).
//!
//! Every endpoint answers `{success, message?, ...}`. The SDK only ever talks
//! to it through the [`Api`] trait so tests can script replies.

use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Reply envelope shared by every REST endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiReply {
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl ApiReply {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            message: None,
            data: match data {
                Value::Object(map) => map,
                _ => Map::new(),
            },
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            data: Map::new(),
        }
    }

    /// Turn `success: false` into [`Error::Rejected`] carrying the server message.
    pub fn into_result(self) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(Error::Rejected(
                self.message.unwrap_or_else(|| "request failed".to_string()),
            ))
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        serde_json::from_value(self.data.get(key)?.clone()).ok()
    }
}

/// What `changeEvent` does to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    SignUp,
    Approve,
    Delete,
    Comment,
}

impl ChangeAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SignUp => "signup",
            Self::Approve => "approve",
            Self::Delete => "delete",
            Self::Comment => "comment",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "signup" => Some(Self::SignUp),
            "approve" => Some(Self::Approve),
            "delete" => Some(Self::Delete),
            "comment" => Some(Self::Comment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Login,
    Register,
    Logout,
    VerifyToken,
    UserInfo,
    KidInfo,
    SearchEvents,
    ChangeEvent(ChangeAction),
    Follow,
    Unfollow,
    CreateChat,
    ChatHistory,
    SendChat,
    ReadNotification,
}

impl Endpoint {
    pub fn path(self) -> String {
        match self {
            Self::Login => "/user/login".to_string(),
            Self::Register => "/user/register".to_string(),
            Self::Logout => "/user/logout".to_string(),
            Self::VerifyToken => "/user/verifyToken".to_string(),
            Self::UserInfo => "/user/getUserInfo".to_string(),
            Self::KidInfo => "/kid/getKidInfo".to_string(),
            Self::SearchEvents => "/event/search".to_string(),
            Self::ChangeEvent(action) => format!("/event/{}", action.as_str()),
            Self::Follow => "/user/follow".to_string(),
            Self::Unfollow => "/user/unfollow".to_string(),
            Self::CreateChat => "/chat/create".to_string(),
            Self::ChatHistory => "/chat/history".to_string(),
            Self::SendChat => "/chat/send".to_string(),
            Self::ReadNotification => "/notification/read".to_string(),
        }
    }
}

pub trait Api: Send + Sync + 'static {
    /// POST `body` to `endpoint`, authenticated with `token` when present.
    fn call<'a>(
        &'a self,
        endpoint: Endpoint,
        token: Option<&'a str>,
        body: Value,
    ) -> BoxFuture<'a, Result<ApiReply>>;
}

/// [`Api`] over HTTP with `reqwest`.
pub struct HttpApi {
    base_url: String,
    http: reqwest::Client,
}

impl HttpApi {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    async fn post(&self, endpoint: Endpoint, token: Option<&str>, body: Value) -> Result<ApiReply> {
        let url = format!("{}{}", self.base_url, endpoint.path());
        let mut req = self.http.post(&url).json(&body);
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;

        let status = resp.status();
        let text = resp.text().await?;
        match serde_json::from_str::<ApiReply>(&text) {
            Ok(reply) => Ok(reply),
            Err(_) if !status.is_success() => Err(Error::Unavailable(format!("{status} from {url}"))),
            Err(e) => Err(e.into()),
        }
    }
}

impl Api for HttpApi {
    fn call<'a>(
        &'a self,
        endpoint: Endpoint,
        token: Option<&'a str>,
        body: Value,
    ) -> BoxFuture<'a, Result<ApiReply>> {
        Box::pin(async move {
            tracing::debug!(?endpoint, "api call");
            self.post(endpoint, token, body).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reply_keeps_extra_fields() {
        let reply: ApiReply =
            serde_json::from_value(json!({"success": true, "token": "t", "userInfo": {"id": 1}})).unwrap();
        assert!(reply.success);
        assert_eq!(reply.decode::<String>("token").as_deref(), Some("t"));
        assert!(reply.data.contains_key("userInfo"));
    }

    #[test]
    fn missing_success_is_failure() {
        let reply: ApiReply = serde_json::from_value(json!({"message": "nope"})).unwrap();
        match reply.into_result() {
            Err(Error::Rejected(msg)) => assert_eq!(msg, "nope"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn change_event_paths() {
        for action in [ChangeAction::SignUp, ChangeAction::Approve, ChangeAction::Delete, ChangeAction::Comment] {
            assert_eq!(ChangeAction::parse(action.as_str()), Some(action));
            assert!(Endpoint::ChangeEvent(action).path().ends_with(action.as_str()));
        }
    }
}
