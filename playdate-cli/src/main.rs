//! playdate: drive the client messaging core from a terminal.
//!
//! Connects, verifies the stored token, then reads one command per line:
//!
//!   login <email> <password>     logout
//!   events                       match
//!   add <topic> <start-time>     delete <event-id>
//!   signup <event-id> <kid-id>   approve <event-id> <kid-id>
//!   filter [keyword]             kid add <name> [age] | kid rm <kid-id>
//!   user <id> [force]            history <chat-id>
//!   chat <chat-id> <text...>     read <notification-id>
//!   state                        quit

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use playdate_sdk::api::HttpApi;
use playdate_sdk::commands::{CommandOutcome, Credentials, EventFilter, KidInfo, NewEvent, SignUp};
use playdate_sdk::storage::FileStore;
use playdate_sdk::transport::WsConnector;
use playdate_sdk::{Client, Event};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "playdate", about = "Terminal client for the playdate event service")]
pub struct Cli {
    /// Websocket endpoint
    #[arg(long, env = "PLAYDATE_SOCKET_URL")]
    socket_url: Option<String>,

    /// REST API base URL
    #[arg(long, env = "PLAYDATE_API_URL")]
    api_url: Option<String>,

    /// Fixed reconnect delay in milliseconds
    #[arg(long)]
    reconnect_ms: Option<u64>,

    /// Token store (JSON). Defaults to ~/.config/playdate/secrets.json
    #[arg(long)]
    token_file: Option<PathBuf>,

    /// Config file. Defaults to ~/.config/playdate/cli.toml
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs with PLAYDATE_LOG_JSON=1, human-readable otherwise
    let json_logs = std::env::var("PLAYDATE_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env()
        .add_directive("playdate=info".parse()?)
        .add_directive("playdate_sdk=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(config::default_path);
    let file = config::Config::load(&config_path);
    let resolved = config::Resolved::merge(&cli, &file);

    let secrets = Arc::new(match resolved.token_file {
        Some(path) => FileStore::new(path),
        None => FileStore::default_location(),
    });
    let connector = Arc::new(WsConnector::new(resolved.client.connect_timeout));
    let api = Arc::new(HttpApi::new(
        resolved.client.api_base_url.clone(),
        resolved.client.request_timeout,
    )?);

    tracing::info!(socket = %resolved.client.socket_url, api = %resolved.client.api_base_url, "Starting playdate");
    let (client, mut events) = Client::start(resolved.client, connector, api, secrets)?;

    let state = client.bootstrap().await;
    println!("auth: {state:?}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !run_command(&client, line.trim()).await {
                        break;
                    }
                }
                None => break,
            },
            Some(event) = events.recv() => print_event(&event),
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.stop().await;
    Ok(())
}

fn print_event(event: &Event) {
    match event {
        Event::Connected => println!("* connected"),
        Event::Disconnected { reason } => println!("* disconnected: {reason} (reconnecting)"),
        Event::SocketError { reason } => println!("* socket error: {reason}"),
        Event::Authenticated => println!("* socket authenticated"),
        Event::AuthFailed { reason } => println!("* signed out: {reason}"),
        Event::LoggedOut => println!("* logged out"),
        Event::Push { kind } => println!("* push: {kind}"),
    }
}

fn report(label: &'static str) -> impl FnOnce(CommandOutcome) + Send + 'static {
    move |outcome| match (outcome.success, outcome.message) {
        (true, _) => println!("{label}: ok"),
        (false, Some(message)) => println!("{label}: failed: {message}"),
        (false, None) => println!("{label}: failed"),
    }
}

fn id(arg: Option<&str>) -> Option<i64> {
    arg.and_then(|s| s.parse().ok())
}

/// Run one command line. Returns `false` to quit.
async fn run_command(client: &Client, line: &str) -> bool {
    let mut words = line.split_whitespace();
    let Some(cmd) = words.next() else {
        return true;
    };
    let commands = client.commands();

    match cmd {
        "quit" | "exit" => return false,
        "login" => {
            let credentials = Credentials {
                email: words.next().map(str::to_string),
                password: words.next().map(str::to_string),
                name: None,
            };
            match client.login(credentials).await {
                Ok(info) => println!("logged in as {:?}", info.id),
                Err(e) => println!("login failed: {e}"),
            }
        }
        "logout" => client.logout().await,
        "events" => {
            let outcome = commands.get_user_events(report("getUserEvents"));
            println!("{outcome:?}");
        }
        "match" => {
            let sent = commands.get_match(|event_id, outcome| {
                println!("getMatch {event_id}: {}", if outcome.success { "ok" } else { "failed" });
            });
            println!("{} match request(s)", sent.len());
        }
        "add" => {
            let event = NewEvent {
                topic: words.next().map(str::to_string),
                start_time: words.next().map(str::to_string),
                ..Default::default()
            };
            println!("{:?}", commands.add_new_event(event, report("addNewEvent")));
        }
        "delete" => println!("{:?}", commands.delete_event(id(words.next()), report("deleteEvent"))),
        "signup" | "approve" => {
            let signup = SignUp {
                event_id: id(words.next()),
                kid_id: id(words.next()),
            };
            let outcome = if cmd == "signup" {
                commands.sign_up_event(signup, report("signUpEvent"))
            } else {
                commands.approve_sign_up(signup, report("approveSignUp"))
            };
            println!("{outcome:?}");
        }
        "filter" => {
            let filter = EventFilter {
                keyword: words.next().map(str::to_string),
                ..Default::default()
            };
            println!("{:?}", commands.filter(filter, report("filter")));
        }
        "kid" => match words.next() {
            Some("add") => {
                let kid = KidInfo {
                    name: words.next().map(str::to_string),
                    age: words.next().and_then(|s| s.parse().ok()),
                    ..Default::default()
                };
                println!("{:?}", commands.add_kid_info(kid, report("addkidinfo")));
            }
            Some("rm") => println!("{:?}", commands.delete_kid_info(id(words.next()), report("deleteKidInfo"))),
            _ => println!("usage: kid add <name> [age] | kid rm <kid-id>"),
        },
        "user" => match id(words.next()) {
            Some(user_id) => {
                let force = words.next() == Some("force");
                match client.get_user_info(user_id, force).await {
                    Ok(info) => println!("{info}"),
                    Err(e) => println!("user {user_id}: {e}"),
                }
            }
            None => println!("usage: user <id> [force]"),
        },
        "history" => match words.next() {
            Some(chat_id) => match client.fetch_chat_history(chat_id).await {
                Ok(n) => println!("{n} message(s)"),
                Err(e) => println!("history: {e}"),
            },
            None => println!("usage: history <chat-id>"),
        },
        "chat" => {
            let chat_id = words.next();
            let text = words.collect::<Vec<_>>().join(" ");
            match chat_id {
                Some(chat_id) if !text.is_empty() => {
                    if let Err(e) = client.send_chat(chat_id, &text).await {
                        println!("chat: {e}");
                    }
                }
                _ => println!("usage: chat <chat-id> <text...>"),
            }
        }
        "read" => match id(words.next()) {
            Some(n) => {
                if let Err(e) = client.mark_notification_read(n).await {
                    println!("read: {e}");
                }
            }
            None => println!("usage: read <notification-id>"),
        },
        "state" => {
            let session = client.store().snapshot();
            println!(
                "connection={:?} auth={:?} logged_in={} events={} kid_events={} notifications={} matches={} chats={}",
                client.connection_state(),
                client.auth_state(),
                session.login_state.logined,
                session.user_events.len(),
                session.kid_events.len(),
                session.notifications.len(),
                session.matched_events.values().map(Vec::len).sum::<usize>(),
                session.chat_messages.len(),
            );
        }
        other => println!("unknown command: {other}"),
    }
    true
}
