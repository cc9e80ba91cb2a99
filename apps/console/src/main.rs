use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use client_core::{ChannelKey, ChatClient, ClientEvent, FileCredentialStore, SessionState};
use shared::domain::{MessageId, UserId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

mod config;

#[derive(Parser, Debug)]
#[command(name = "chat-console", about = "Console client for the chat backend")]
struct Args {
    /// Backend base url; overrides client.toml and the environment.
    #[arg(long)]
    server_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an account.
    Register { username: String, password: String },
    /// Sign in (or resume a stored session) and enter the chat loop.
    Chat {
        username: Option<String>,
        password: Option<String>,
    },
    /// Drop the stored credential.
    Logout,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let mut settings = config::load_settings();
    if let Some(url) = args.server_url {
        settings.server_url = url;
    }

    let credentials = Arc::new(FileCredentialStore::new(&settings.credential_file));
    let client = ChatClient::new(settings.server_url, credentials);

    match args.command {
        Command::Register { username, password } => {
            client.register(&username, &password).await?;
            println!("registered {username}, sign in with `chat`");
        }
        Command::Chat { username, password } => run_chat(client, username, password).await?,
        Command::Logout => {
            client.logout().await?;
            println!("logged out");
        }
    }
    Ok(())
}

async fn run_chat(
    client: Arc<ChatClient>,
    username: Option<String>,
    password: Option<String>,
) -> Result<()> {
    let identity = match client.validate_session().await? {
        SessionState::Authenticated(identity) => identity,
        SessionState::Unauthenticated => {
            let (Some(username), Some(password)) = (username, password) else {
                anyhow::bail!("no stored session; pass a username and password");
            };
            client.login(&username, &password).await?
        }
    };
    println!(
        "signed in as {} (#{}) - /msg /react /users /clear /quit",
        identity.username, identity.user_id.0
    );

    client.connect().await?;
    let printer = tokio::spawn(print_events(client.clone(), client.subscribe_events()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if handle_command(&client, &line).await? {
            continue;
        }
        client.notify_typing(None).await?;
        client.send_message(&line, None).await?;
    }

    printer.abort();
    client.disconnect().await;
    Ok(())
}

/// Returns true when the line was a command; plain lines fall through to a
/// public send.
async fn handle_command(client: &ChatClient, line: &str) -> Result<bool> {
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some("/msg") => {
            let Some(user_id) = parts.next().and_then(|raw| raw.parse::<i64>().ok()) else {
                println!("usage: /msg <user-id> <text>");
                return Ok(true);
            };
            let text = parts.collect::<Vec<_>>().join(" ");
            client.notify_typing(Some(UserId(user_id))).await?;
            client.send_message(&text, Some(UserId(user_id))).await?;
            Ok(true)
        }
        Some("/react") => {
            let id = parts.next().and_then(|raw| raw.parse::<i64>().ok());
            let symbol = parts.next();
            let (Some(id), Some(symbol)) = (id, symbol) else {
                println!("usage: /react <message-id> <emoji>");
                return Ok(true);
            };
            client.react(MessageId(id), symbol).await?;
            Ok(true)
        }
        Some("/users") => {
            for user in client.online_users().await {
                println!("  {} (#{})", user.username, user.user_id.0);
            }
            Ok(true)
        }
        Some("/clear") => {
            client.clear_public_history().await?;
            Ok(true)
        }
        Some(command) if command.starts_with('/') => {
            println!("unknown command {command}");
            Ok(true)
        }
        _ => Ok(false),
    }
}

async fn print_events(client: Arc<ChatClient>, mut events: broadcast::Receiver<ClientEvent>) {
    while let Ok(event) = events.recv().await {
        match event {
            ClientEvent::MessagesUpdated { channel } => {
                let messages = client.messages(channel).await;
                if let Some(message) = messages.last() {
                    let prefix = match channel {
                        ChannelKey::Public => String::new(),
                        ChannelKey::Private(user) => format!("[dm #{}] ", user.0),
                    };
                    let marker = if message.server_id.is_some() {
                        ""
                    } else {
                        " (sending)"
                    };
                    println!("{prefix}{}: {}{marker}", message.sender_name, message.content);
                }
            }
            ClientEvent::PresenceUpdated { users } => {
                let names: Vec<&str> = users.iter().map(|u| u.username.as_str()).collect();
                println!("* online: {}", names.join(", "));
            }
            ClientEvent::TypingStarted { username } => println!("* {username} is typing..."),
            ClientEvent::TypingStopped => {}
            ClientEvent::ChatCleared => println!("* public history was cleared"),
            ClientEvent::ConnectionChanged(state) => println!("* connection: {state:?}"),
            ClientEvent::SessionInvalidated => {
                println!("* session expired, sign in again");
                return;
            }
            ClientEvent::Error(message) => tracing::warn!("{message}"),
        }
    }
}
