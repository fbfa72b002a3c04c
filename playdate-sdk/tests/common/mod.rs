//! Shared harness: a client wired to the in-process socket and API fakes.

#![allow(dead_code)]

use std::sync::Arc;

use playdate_sdk::api::{ApiReply, Endpoint};
use playdate_sdk::auth::AuthState;
use playdate_sdk::storage::TOKEN_KEY;
use playdate_sdk::testing::{MemoryStore, MockApi, MockConnector, ServerEnd};
use playdate_sdk::{Client, ClientConfig, Event, Frame};
use serde_json::{json, Value};
use tokio::sync::mpsc;

pub const TOKEN: &str = "tok-123";

pub struct Harness {
    pub client: Client,
    pub events: mpsc::Receiver<Event>,
    pub connector: Arc<MockConnector>,
    pub servers: mpsc::UnboundedReceiver<ServerEnd>,
    pub api: Arc<MockApi>,
    pub secrets: Arc<MemoryStore>,
}

impl Harness {
    pub fn start(api: MockApi, secrets: MemoryStore) -> Self {
        Self::start_with(ClientConfig::default(), api, secrets)
    }

    pub fn start_with(config: ClientConfig, api: MockApi, secrets: MemoryStore) -> Self {
        let (connector, servers) = MockConnector::new();
        let api = Arc::new(api);
        let secrets = Arc::new(secrets);
        let (client, events) =
            Client::start(config, connector.clone(), api.clone(), secrets.clone()).unwrap();
        Self {
            client,
            events,
            connector,
            servers,
            api,
            secrets,
        }
    }

    /// Accept the next connection and wait until the client reports it open.
    pub async fn accept(&mut self) -> ServerEnd {
        let server = self.servers.recv().await.expect("client never connected");
        self.wait_for(|e| *e == Event::Connected).await;
        server
    }

    pub async fn wait_for(&mut self, pred: impl Fn(&Event) -> bool) -> Event {
        loop {
            let event = self.events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    }
}

pub fn user_info(events: Value) -> Value {
    json!({
        "id": 1,
        "name": "Dana",
        "events": events,
        "kidEvents": [],
        "notifications": [{"id": 40, "read": false, "text": "welcome"}],
        "following": [],
    })
}

/// A client whose stored token verifies, with the socket open.
pub async fn logged_in() -> (Harness, ServerEnd) {
    let api = MockApi::new();
    api.reply(
        Endpoint::VerifyToken,
        ApiReply::ok(json!({ "userInfo": user_info(json!([{"id": 5, "topic": "Soccer"}])) })),
    );
    let mut harness = Harness::start(api, MemoryStore::with(TOKEN_KEY, TOKEN));
    let server = harness.accept().await;
    assert_eq!(harness.client.bootstrap().await, AuthState::Verified);
    (harness, server)
}

/// Next frame of type `kind` the client wrote, skipping others (such as the
/// `verifyToken` handshake).
pub async fn next_of(server: &mut ServerEnd, kind: &str) -> Frame {
    loop {
        let frame = server.next_frame().await.expect("client closed the socket");
        if frame.kind == kind {
            return frame;
        }
    }
}
