//! In-process fakes for the socket, the REST API and secure storage.
//!
//! Used by this crate's tests and available to consumers that want to drive
//! a [`crate::Client`] without a server.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::api::{Api, ApiReply, Endpoint};
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::transport::{Connector, Link, LinkEvent};

pub use crate::storage::MemoryStore;

/// Hands the server side of every accepted link to the test.
pub struct MockConnector {
    attempts: AtomicUsize,
    refuse: AtomicBool,
    accepted: mpsc::UnboundedSender<ServerEnd>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            attempts: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
            accepted,
        });
        (connector, rx)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Make subsequent connection attempts fail.
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

impl Connector for MockConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, anyhow::Result<Link>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            let refused: anyhow::Result<Link> = Err(anyhow::anyhow!("connection to {url} refused"));
            return Box::pin(async move { refused });
        }

        let (outbound, from_client) = mpsc::unbounded_channel();
        let (to_client, inbound) = mpsc::unbounded_channel();
        let server = ServerEnd { from_client, to_client };
        let accepted = self.accepted.send(server).is_ok();
        Box::pin(async move {
            if !accepted {
                anyhow::bail!("mock server gone");
            }
            Ok(Link { outbound, inbound })
        })
    }
}

/// Server side of one mock socket. Dropping it closes the connection.
pub struct ServerEnd {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<LinkEvent>,
}

impl ServerEnd {
    pub fn push(&self, frame: &Value) {
        self.push_raw(&frame.to_string());
    }

    pub fn push_raw(&self, raw: &str) {
        let _ = self.to_client.send(LinkEvent::Text(raw.to_string()));
    }

    pub fn error(&self, reason: &str) {
        let _ = self.to_client.send(LinkEvent::Error(reason.to_string()));
    }

    pub fn close(self) {}

    /// Next frame the client wrote, or `None` once the client side closed.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        let raw = self.from_client.recv().await?;
        Frame::parse(&raw).ok()
    }

    /// A frame the client already wrote, without waiting.
    pub fn try_next_frame(&mut self) -> Option<Frame> {
        let raw = self.from_client.try_recv().ok()?;
        Frame::parse(&raw).ok()
    }

    /// Answer `request` with `reply`, echoing its `type` and `requestId`.
    pub fn reply_to(&self, request: &Frame, reply: Value) {
        let mut reply = match reply {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        reply.insert("type".to_string(), Value::String(request.kind.clone()));
        if let Some(id) = request.request_id() {
            reply.insert(crate::frame::REQUEST_ID.to_string(), id.into());
        }
        self.push(&Value::Object(reply));
    }
}

enum Scripted {
    Reply(ApiReply),
    Unreachable(String),
}

impl Scripted {
    fn produce(&self) -> Result<ApiReply> {
        match self {
            Self::Reply(reply) => Ok(reply.clone()),
            Self::Unreachable(reason) => Err(Error::Unavailable(reason.clone())),
        }
    }
}

#[derive(Default)]
struct Script {
    standing: HashMap<String, Scripted>,
    queued: HashMap<String, VecDeque<Scripted>>,
    calls: HashMap<String, Vec<(Option<String>, Value)>>,
}

/// Scripted [`Api`]. Queued replies are used first, then the standing reply
/// for the endpoint; unscripted endpoints answer `success: false`.
#[derive(Default)]
pub struct MockApi {
    script: Mutex<Script>,
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, endpoint: Endpoint, reply: ApiReply) {
        self.script.lock().standing.insert(endpoint.path(), Scripted::Reply(reply));
    }

    pub fn queue(&self, endpoint: Endpoint, reply: ApiReply) {
        self.script
            .lock()
            .queued
            .entry(endpoint.path())
            .or_default()
            .push_back(Scripted::Reply(reply));
    }

    /// Make `endpoint` fail as if the network were down.
    pub fn unreachable(&self, endpoint: Endpoint) {
        self.script
            .lock()
            .standing
            .insert(endpoint.path(), Scripted::Unreachable("network down".to_string()));
    }

    pub fn calls(&self, endpoint: Endpoint) -> usize {
        self.script.lock().calls.get(&endpoint.path()).map_or(0, Vec::len)
    }

    pub fn last_body(&self, endpoint: Endpoint) -> Option<Value> {
        let script = self.script.lock();
        script.calls.get(&endpoint.path())?.last().map(|(_, body)| body.clone())
    }

    pub fn last_token(&self, endpoint: Endpoint) -> Option<String> {
        let script = self.script.lock();
        script.calls.get(&endpoint.path())?.last()?.0.clone()
    }
}

impl Api for MockApi {
    fn call<'a>(&'a self, endpoint: Endpoint, token: Option<&'a str>, body: Value) -> BoxFuture<'a, Result<ApiReply>> {
        let path = endpoint.path();
        let mut script = self.script.lock();
        script
            .calls
            .entry(path.clone())
            .or_default()
            .push((token.map(str::to_string), body));

        let queued = script.queued.get_mut(&path).and_then(VecDeque::pop_front);
        let result = match queued {
            Some(scripted) => scripted.produce(),
            None => match script.standing.get(&path) {
                Some(scripted) => scripted.produce(),
                None => Ok(ApiReply::failure(format!("no reply scripted for {path}"))),
            },
        };
        Box::pin(async move { result })
    }
}
