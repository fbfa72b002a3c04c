//! Client messaging core for the playdate parent/kid event-coordination service.
//!
//! One persistent socket carries JSON command frames out and reply/push frames
//! in. Commands register a named handler before sending; the dispatcher folds
//! every inbound frame into the session store and then fans it out to the
//! matching handlers. [`Client`] owns the whole stack with an explicit
//! `start`/`stop` lifecycle.

pub mod api;
pub mod auth;
pub mod cache;
pub mod client;
pub mod commands;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod frame;
pub mod registry;
pub mod storage;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;

pub use client::Client;
pub use config::ClientConfig;
pub use error::{Error, Result};
pub use event::Event;
pub use frame::Frame;
