//! Line-oriented chat client.
//!
//! Run with: cargo run -p chat-cli-demo
//!
//! Messaging runs against the in-process backend with a local bot that
//! streams its replies. When `BACKEND_API_URL` and `STREAM_API_KEY` are set,
//! login and registration go to that API instead of the local stand-in.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use coachchat_core::{
    AiState, AuthBackend, AuthError, ChannelId, ChatEvent, ClientConfig, InferenceClient, Message,
    Registration, RelayError, TokenGrant, UserId,
};
use coachchat_session::{SessionManager, storage::FileCredentialStore};
use coachchat_sync::{ChatClient, Draft};
use coachchat_transport::{ApiClient, MemoryMessagingBackend};
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    task::JoinHandle,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const HELP: &str = "\
Commands:
  /login <user> <password>            log in
  /register <user> <email> <password> create an account
  /logout                             end the session
  /channels                           list channels
  /select <number|id>                 switch channel
  /new <name>                         create a channel with the coach bot
  /history                            show the active channel
  /quit                               exit
Anything else is sent to the active channel.";

/// Login against the configured API, or accept any non-empty password.
enum DemoAuth {
    Local,
    Remote(ApiClient),
}

#[async_trait]
impl AuthBackend for DemoAuth {
    async fn login(&self, username: &str, password: &str) -> Result<TokenGrant, AuthError> {
        match self {
            Self::Remote(api) => api.login(username, password).await,
            Self::Local if password.is_empty() => Err(AuthError::InvalidCredentials),
            Self::Local => Ok(TokenGrant {
                access_token: format!("local-{username}"),
                user_id: Some(UserId::new(username)),
            }),
        }
    }

    async fn register(&self, registration: &Registration) -> Result<(), AuthError> {
        match self {
            Self::Remote(api) => api.register(registration).await,
            Self::Local => Ok(()),
        }
    }
}

/// Stand-in for the inference backend: answers every relayed message by
/// streaming a reply into the channel word by word.
struct StreamingBot {
    backend: MemoryMessagingBackend,
    bot_id: UserId,
}

#[async_trait]
impl InferenceClient for StreamingBot {
    async fn notify_new_message(&self, _token: &str, message: &Message) -> Result<(), RelayError> {
        let channel = message.channel_id.to_string();
        let reply = self
            .backend
            .post_message(&channel, self.bot_id.as_str(), "")
            .ok_or(RelayError::Status(404))?;
        let reply_id = reply
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| RelayError::Transport("reply without id".to_owned()))?
            .to_owned();

        let backend = self.backend.clone();
        let answer = format!(
            "You said \"{}\". Good. What is the next small step you can take today?",
            message.text.trim()
        );
        tokio::spawn(async move {
            backend.emit_ai_indicator(&channel, &reply_id, Some(AiState::Thinking));
            tokio::time::sleep(Duration::from_millis(400)).await;

            let mut text = String::new();
            for word in answer.split_whitespace() {
                if !text.is_empty() {
                    text.push(' ');
                }
                text.push_str(word);
                backend.emit_ai_indicator(&channel, &reply_id, Some(AiState::Generating));
                backend.update_message(&channel, &reply_id, &text);
                tokio::time::sleep(Duration::from_millis(60)).await;
            }
            backend.emit_ai_indicator(&channel, &reply_id, None);
        });
        Ok(())
    }
}

fn seed_welcome_channel(backend: &MemoryMessagingBackend, user: &UserId, config: &ClientConfig) {
    let id = format!("welcome-{user}");
    if backend.channel(&id).is_none() {
        backend.insert_channel(&id, "Welcome", &[user.as_str(), config.ai_bot_id.as_str()], None);
        backend.post_message(&id, config.ai_bot_id.as_str(), "Hi! I am your coach. What are you working on?");
    }
}

/// Print other participants' messages and finished bot replies.
fn spawn_printer(client: &Arc<ChatClient>, channel_id: ChannelId, me: UserId) -> JoinHandle<()> {
    let client = Arc::clone(client);
    let mut listener = client.hub().subscribe(channel_id.clone());
    tokio::spawn(async move {
        while let Some(event) = listener.next().await {
            match event {
                ChatEvent::MessageNew(message) if message.author_id != me && !message.text.is_empty() => {
                    println!("[{}] {}", message.author_id, message.text);
                }
                ChatEvent::AiIndicator {
                    message_id,
                    state: None,
                    ..
                } => {
                    let messages = client.log().messages(&channel_id).await;
                    if let Some(reply) = messages.iter().find(|m| m.id == message_id) {
                        println!("[{}] {}", reply.author_id, reply.text);
                    }
                }
                ChatEvent::AiIndicator {
                    state: Some(AiState::Thinking),
                    ..
                } => println!("  (coach is thinking...)"),
                _ => {}
            }
        }
    })
}

async fn print_channels(client: &ChatClient) {
    let selected = client.channels().selected().await;
    for (i, channel) in client.channels().snapshot().await.iter().enumerate() {
        let marker = if selected.as_ref() == Some(&channel.id) { '*' } else { ' ' };
        println!("{marker} {}. {} ({})", i + 1, channel.display_name, channel.id);
    }
}

async fn print_history(client: &ChatClient) {
    let Some(channel_id) = client.channels().selected().await else {
        println!("No channel selected.");
        return;
    };
    println!("-- {channel_id} --");
    for message in client.log().messages(&channel_id).await {
        println!("[{}] {}", message.author_id, message.text);
    }
}

struct App {
    sessions: SessionManager<FileCredentialStore, DemoAuth>,
    backend: MemoryMessagingBackend,
    client: Arc<ChatClient>,
    config: ClientConfig,
    printer: Option<JoinHandle<()>>,
}

impl App {
    async fn start_client(&mut self) -> anyhow::Result<()> {
        let Some(session) = self.sessions.current() else {
            println!("Not logged in.");
            return Ok(());
        };
        seed_welcome_channel(&self.backend, &session.user_id, &self.config);
        self.client.start().await?;
        println!("Logged in as {}.", session.user_id);
        print_channels(&self.client).await;
        self.follow_selection().await;
        print_history(&self.client).await;
        Ok(())
    }

    async fn follow_selection(&mut self) {
        if let Some(old) = self.printer.take() {
            old.abort();
        }
        let (Some(channel_id), Some(session)) =
            (self.client.channels().selected().await, self.sessions.current())
        else {
            return;
        };
        self.printer = Some(spawn_printer(&self.client, channel_id, session.user_id));
    }

    async fn select(&mut self, arg: &str) -> anyhow::Result<()> {
        let channels = self.client.channels().snapshot().await;
        let channel_id = arg
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| channels.get(i))
            .map_or_else(|| ChannelId::new(arg), |c| c.id.clone());
        self.client.select(&channel_id).await?;
        self.follow_selection().await;
        print_history(&self.client).await;
        Ok(())
    }

    /// Handle one input line. Returns `false` to exit.
    async fn handle(&mut self, line: &str) -> anyhow::Result<bool> {
        let line = line.trim();
        let mut parts = line.split_whitespace();
        match parts.next() {
            None => {}
            Some("/quit") => return Ok(false),
            Some("/help") => println!("{HELP}"),
            Some("/login") => {
                let (Some(user), Some(password)) = (parts.next(), parts.next()) else {
                    println!("Usage: /login <user> <password>");
                    return Ok(true);
                };
                self.sessions.authenticate(user, password).await?;
                self.start_client().await?;
            }
            Some("/register") => {
                let (Some(username), Some(email), Some(password)) = (parts.next(), parts.next(), parts.next())
                else {
                    println!("Usage: /register <user> <email> <password>");
                    return Ok(true);
                };
                self.sessions
                    .register(&Registration {
                        username: username.to_owned(),
                        email: email.to_owned(),
                        password: password.to_owned(),
                        full_name: String::new(),
                    })
                    .await?;
                println!("Registered {username}. Log in with /login.");
            }
            Some("/logout") => {
                if let Some(printer) = self.printer.take() {
                    printer.abort();
                }
                self.sessions.terminate().await?;
                println!("Logged out.");
            }
            Some("/channels") => print_channels(&self.client).await,
            Some("/select") => match parts.next() {
                Some(arg) => self.select(arg).await?,
                None => println!("Usage: /select <number|id>"),
            },
            Some("/new") => {
                let name = line.trim_start_matches("/new").trim();
                let channel = self.client.create_channel(name).await?;
                println!("Created {} ({}).", channel.display_name, channel.id);
                self.follow_selection().await;
            }
            Some("/history") => print_history(&self.client).await,
            Some(cmd) if cmd.starts_with('/') => println!("Unknown command {cmd}. Try /help."),
            Some(_) => {
                let mut draft = Draft::new(line);
                self.client.send(&mut draft).await?;
            }
        }
        Ok(true)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let (config, auth) = match ClientConfig::from_env() {
        Ok(config) => {
            let api = ApiClient::new(&config)?;
            tracing::info!(api = %config.api_base_url, "Using remote auth");
            (config, DemoAuth::Remote(api))
        }
        Err(e) => {
            tracing::info!(reason = %e, "Using local auth");
            (ClientConfig::new("http://localhost:8000", "local"), DemoAuth::Local)
        }
    };

    let sessions = SessionManager::new(FileCredentialStore::new(config.credentials_path()), auth);
    let backend = MemoryMessagingBackend::new();
    let bot = StreamingBot {
        backend: backend.clone(),
        bot_id: config.ai_bot_id.clone(),
    };
    let client = ChatClient::new(
        config.clone(),
        Arc::new(backend.clone()),
        Arc::new(bot),
        sessions.subscribe(),
    );

    let mut app = App {
        sessions,
        backend,
        client,
        config,
        printer: None,
    };

    println!("{HELP}");
    if app.sessions.restore().await?.is_some() {
        app.start_client().await?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match app.handle(&line).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => println!("Error: {e}"),
        }
    }

    if let Some(printer) = app.printer.take() {
        printer.abort();
    }
    app.client.shutdown().await;
    Ok(())
}
