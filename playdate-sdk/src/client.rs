//! The client service object.
//!
//! [`Client::start`] wires the six parts together (connection manager,
//! dispatcher, handler registry, command façade, session store, auth) and
//! returns the client plus a receiver of [`Event`]s, the way a UI tree would
//! receive one shared service. [`Client::stop`] tears everything down: the
//! socket closes and no reconnect or handshake timer survives it.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::api::{Api, ApiReply, ChangeAction, Endpoint, HttpApi};
use crate::auth::{Auth, AuthState};
use crate::commands::{CommandKind, Commands, Credentials};
use crate::config::ClientConfig;
use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionState};
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::event::{Event, EventSink};
use crate::frame::Frame;
use crate::registry::HandlerRegistry;
use crate::storage::{FileStore, SecureStore};
use crate::store::{SessionStore, UserInfo};
use crate::transport::{Connector, WsConnector};

pub struct Client {
    registry: Arc<HandlerRegistry>,
    store: Arc<SessionStore>,
    connection: ConnectionManager,
    commands: Commands,
    auth: Arc<Auth>,
    api: Arc<dyn Api>,
    shutdown: watch::Sender<bool>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Start a client against real collaborators: a websocket, the HTTP API,
    /// and the on-disk token store.
    pub fn connect(config: ClientConfig) -> Result<(Self, mpsc::Receiver<Event>)> {
        let connector = Arc::new(WsConnector::new(config.connect_timeout));
        let api = Arc::new(HttpApi::new(config.api_base_url.clone(), config.request_timeout)?);
        let secrets = Arc::new(FileStore::default_location());
        Self::start(config, connector, api, secrets)
    }

    /// Start a client with explicit collaborators. Must be called inside a
    /// tokio runtime; the socket starts connecting immediately.
    pub fn start(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        api: Arc<dyn Api>,
        secrets: Arc<dyn SecureStore>,
    ) -> Result<(Self, mpsc::Receiver<Event>)> {
        config.validate()?;

        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);
        let events = EventSink::new(event_tx);

        let registry = Arc::new(HandlerRegistry::new());
        let store = Arc::new(SessionStore::new(config.cache_ttl));
        let dispatcher =
            Arc::new(Dispatcher::new(registry.clone(), store.clone()).with_events(events.clone()));
        let auth = Arc::new(
            Auth::new(store.clone(), api.clone(), secrets).with_events(events.clone()),
        );

        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let connection = ConnectionManager::connect(
            config.socket_url.clone(),
            config.reconnect.clone(),
            connector,
            dispatcher,
            conn_tx,
        );
        let commands = Commands::new(connection.handle(), registry.clone(), store.clone());

        let (shutdown, shutdown_rx) = watch::channel(false);
        let pump = tokio::spawn(pump(
            conn_rx,
            auth.subscribe(),
            shutdown_rx,
            Handshake {
                commands: commands.clone(),
                registry: registry.clone(),
                store: store.clone(),
                auth: auth.clone(),
                events: events.clone(),
                delay: config.verify_delay,
            },
        ));

        tracing::info!(url = %config.socket_url, "client started");
        let client = Self {
            registry,
            store,
            connection,
            commands,
            auth,
            api,
            shutdown,
            pump: Mutex::new(Some(pump)),
        };
        Ok((client, event_rx))
    }

    pub fn commands(&self) -> &Commands {
        &self.commands
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn connection_attempts(&self) -> usize {
        self.connection.attempts()
    }

    pub fn auth_state(&self) -> AuthState {
        self.auth.state()
    }

    /// Whether a handler (command reply or subscription) named `name` is active.
    pub fn is_pending(&self, name: &str) -> bool {
        self.registry.is_registered(name)
    }

    /// Persistent subscription to frames of `match_type`, e.g. a chat screen
    /// watching `newChat`. Idempotent on `name`.
    pub fn subscribe<F>(&self, name: &str, match_type: &str, callback: F) -> bool
    where
        F: FnMut(&Frame) + Send + 'static,
    {
        self.registry.register_persistent(name, match_type, callback)
    }

    /// Remove a subscription or abandon a pending command reply. Unknown names
    /// are ignored.
    pub fn unsubscribe(&self, name: &str) -> bool {
        self.registry.unregister(name)
    }

    /// Verify the stored token, if any. See [`Auth::bootstrap`].
    pub async fn bootstrap(&self) -> AuthState {
        self.auth.bootstrap().await
    }

    pub async fn login(&self, credentials: Credentials) -> Result<UserInfo> {
        self.auth.login(credentials).await
    }

    pub async fn register(&self, credentials: Credentials) -> Result<UserInfo> {
        self.auth.register(credentials).await
    }

    pub async fn logout(&self) {
        self.auth.logout().await
    }

    fn token(&self) -> Result<String> {
        self.store.token().ok_or(Error::NotLoggedIn)
    }

    async fn call(&self, endpoint: Endpoint, body: Value) -> Result<ApiReply> {
        let token = self.token()?;
        self.api.call(endpoint, Some(&token), body).await?.into_result()
    }

    /// Re-fetch the authoritative session snapshot.
    pub async fn refresh_session(&self) -> Result<UserInfo> {
        let reply = self.call(Endpoint::UserInfo, json!({})).await?;
        let info = reply
            .decode::<UserInfo>("userInfo")
            .ok_or_else(|| Error::Rejected("session reply without userInfo".to_string()))?;
        self.store.apply_user_info(info.clone());
        Ok(info)
    }

    /// After a successful REST mutation: take the snapshot the server sent,
    /// or fetch one.
    async fn resync(&self, reply: &ApiReply) -> Result<()> {
        match reply.decode::<UserInfo>("userInfo") {
            Some(info) => self.store.apply_user_info(info),
            None => {
                self.refresh_session().await?;
            }
        }
        Ok(())
    }

    /// Another user's profile, served from the cache while fresh.
    pub async fn get_user_info(&self, user_id: i64, force: bool) -> Result<Value> {
        self.store
            .profile_cache()
            .get_or_fetch(user_id, force, || async {
                let reply = self.call(Endpoint::UserInfo, json!({ "userId": user_id })).await?;
                Ok(reply
                    .data
                    .get("userInfo")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(reply.data.clone())))
            })
            .await
    }

    pub async fn get_kid_info(&self, kid_id: i64, force: bool) -> Result<Value> {
        self.store
            .kid_cache()
            .get_or_fetch(kid_id, force, || async {
                let reply = self.call(Endpoint::KidInfo, json!({ "kidId": kid_id })).await?;
                Ok(reply
                    .data
                    .get("kidInfo")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(reply.data.clone())))
            })
            .await
    }

    pub async fn search_events(&self, query: Value) -> Result<Vec<Value>> {
        let reply = self.call(Endpoint::SearchEvents, query).await?;
        Ok(reply.decode("events").unwrap_or_default())
    }

    /// Sign up for, approve, delete or comment on an event over REST, then
    /// resync the session.
    pub async fn change_event(&self, action: ChangeAction, event_id: i64, extra: Map<String, Value>) -> Result<ApiReply> {
        let mut body = extra;
        body.insert("eventId".to_string(), event_id.into());
        let reply = self.call(Endpoint::ChangeEvent(action), Value::Object(body)).await?;
        self.resync(&reply).await?;
        Ok(reply)
    }

    pub async fn follow(&self, user_id: i64) -> Result<()> {
        let reply = self.call(Endpoint::Follow, json!({ "userId": user_id })).await?;
        self.resync(&reply).await
    }

    pub async fn unfollow(&self, user_id: i64) -> Result<()> {
        let reply = self.call(Endpoint::Unfollow, json!({ "userId": user_id })).await?;
        self.resync(&reply).await
    }

    /// Open a chat with the given users. Returns the new chat id.
    pub async fn create_chat(&self, participants: &[i64]) -> Result<String> {
        let reply = self.call(Endpoint::CreateChat, json!({ "participants": participants })).await?;
        match reply.data.get("chatId") {
            Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
            Some(Value::Number(id)) => Ok(id.to_string()),
            _ => Err(Error::Rejected("createChat reply without chatId".to_string())),
        }
    }

    /// Load a chat's history, replacing the local transcript wholesale.
    /// Returns the number of messages.
    pub async fn fetch_chat_history(&self, chat_id: &str) -> Result<usize> {
        let reply = self.call(Endpoint::ChatHistory, json!({ "chatId": chat_id })).await?;
        let messages: Vec<Value> = reply.decode("messages").unwrap_or_default();
        let count = messages.len();
        self.store.replace_transcript(chat_id, messages);
        Ok(count)
    }

    /// Send a chat message. The transcript is updated when the server pushes
    /// the resulting `newChat` frame, not here.
    pub async fn send_chat(&self, chat_id: &str, text: &str) -> Result<()> {
        self.call(Endpoint::SendChat, json!({ "chatId": chat_id, "text": text }))
            .await
            .map(drop)
    }

    /// Mark a notification read locally right away, then tell the server.
    /// The local mark stays even if the server call fails.
    pub async fn mark_notification_read(&self, notification_id: i64) -> Result<()> {
        if !self.store.mark_notification_read(notification_id) {
            tracing::debug!(notification_id, "marking unknown notification read");
        }
        self.call(Endpoint::ReadNotification, json!({ "notificationId": notification_id }))
            .await
            .map(drop)
    }

    /// Close the socket and cancel every timer. Pending command handlers are
    /// abandoned. Idempotent.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            let _ = pump.await;
        }
        self.connection.stop().await;
        tracing::info!("client stopped");
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Everything the pump needs to run the in-band `verifyToken` handshake.
struct Handshake {
    commands: Commands,
    registry: Arc<HandlerRegistry>,
    store: Arc<SessionStore>,
    auth: Arc<Auth>,
    events: EventSink,
    delay: Duration,
}

impl Handshake {
    /// Drop a `verifyToken` handler left over from a socket that closed
    /// before the server answered. Its reply can no longer arrive.
    fn abandon(&self) {
        if self.registry.unregister(CommandKind::VerifyToken.as_str()) {
            tracing::debug!("dropped unanswered verifyToken handshake");
        }
    }

    fn send(&self) {
        let Some(token) = self.store.token() else {
            return;
        };
        let auth = self.auth.clone();
        let events = self.events.clone();
        let outcome = self.commands.verify_token(Some(&token), move |reply| {
            if reply.success {
                tracing::info!("socket authenticated");
                events.emit(Event::Authenticated);
            } else {
                auth.fail_verification(reply.message.unwrap_or_else(|| "token rejected".to_string()));
            }
        });
        tracing::debug!(?outcome, "verifyToken handshake");
    }
}

/// Relays connection events to the consumer and schedules the `verifyToken`
/// handshake once the socket is open and the token is verified. Every reopen
/// re-arms it.
async fn pump(
    mut conn_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    mut auth_rx: watch::Receiver<AuthState>,
    mut shutdown: watch::Receiver<bool>,
    handshake: Handshake,
) {
    let timer = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(timer);
    let mut armed = false;
    let mut open = false;

    loop {
        tokio::select! {
            event = conn_rx.recv() => match event {
                Some(ConnectionEvent::Open) => {
                    open = true;
                    handshake.events.emit(Event::Connected);
                    if *auth_rx.borrow() == AuthState::Verified {
                        timer.as_mut().reset(Instant::now() + handshake.delay);
                        armed = true;
                    }
                }
                Some(ConnectionEvent::Error(reason)) => {
                    handshake.events.emit(Event::SocketError { reason });
                }
                Some(ConnectionEvent::Closed { reason }) => {
                    open = false;
                    armed = false;
                    handshake.abandon();
                    handshake.events.emit(Event::Disconnected { reason });
                }
                None => break,
            },
            changed = auth_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *auth_rx.borrow_and_update();
                if state == AuthState::Verified && open {
                    timer.as_mut().reset(Instant::now() + handshake.delay);
                    armed = true;
                } else if state != AuthState::Verified {
                    armed = false;
                }
            }
            _ = &mut timer, if armed => {
                armed = false;
                handshake.send();
            }
            _ = shutdown.changed() => break,
        }
    }
}
