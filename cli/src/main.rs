use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};
use stompchat::history::HistorySource;
use stompchat::{
    AuthClient, ChatError, ChatSession, ClientConfig, Credential, CredentialStore, HistoryClient, Scope, ScopedMessage,
    StompConnector,
};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// How long to wait for the STOMP session to reach `CONNECTED`.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Time given to the transport task to flush `UNSUBSCRIBE`/`DISCONNECT`
/// after `stop()` before the runtime shuts down.
const FLUSH_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Chat(#[from] ChatError),
    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),
    #[error("user \"{0}\" was not found")]
    PeerNotFound(String),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "stompchat-cli", about = "STOMP chat client CLI")]
struct Cli {
    #[arg(long, env = "STOMPCHAT_BASE_URL")]
    base_url: Option<String>,

    /// Bearer token to use instead of the stored one.
    #[arg(long, env = "STOMPCHAT_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

struct CliContext {
    config: ClientConfig,
    store: CredentialStore,
    token: Option<String>,
}

impl CliContext {
    /// Explicit token first, then the stored one.
    fn credential(&self) -> Result<Option<Credential>, CliError> {
        if let Some(token) = self.token.as_deref().filter(|t| !t.trim().is_empty()) {
            return Ok(Some(Credential::new(token.trim())));
        }
        Ok(self.store.load()?)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in with a username and password and store the token.
    Login {
        #[arg(long)]
        username: String,
        #[arg(long, env = "STOMPCHAT_PASSWORD")]
        password: String,
    },
    /// Log in through the development endpoint (no password).
    DevLogin { username: String },
    /// Forget the stored token.
    Logout,
    /// Show who the stored token belongs to and whether it is still valid.
    Status,
    /// Connect and ask the server which user this token authenticates as.
    Whoami,
    /// Send a message to the global channel.
    Send { content: String },
    Room(RoomCommand),
    Dm(DmCommand),
    /// Print global messages and DM notices until interrupted.
    Tail,
}

#[derive(Args, Debug)]
struct RoomCommand {
    #[command(subcommand)]
    command: RoomSubcommand,
}

#[derive(Subcommand, Debug)]
enum RoomSubcommand {
    Send { room: String, content: String },
    Tail { room: String },
}

#[derive(Args, Debug)]
struct DmCommand {
    #[command(subcommand)]
    command: DmSubcommand,
}

#[derive(Subcommand, Debug)]
enum DmSubcommand {
    /// Open (or look up) the conversation with a peer and print its id.
    Open { peer: String },
    Send { peer: String, content: String },
    History {
        conversation_id: i64,
        #[arg(long)]
        limit: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = ClientConfig::from_env();
    if let Some(base_url) = cli.base_url.as_deref() {
        config = config.with_base_url(base_url);
    }
    let ctx = CliContext { store: CredentialStore::new(config.token_file.clone()), config, token: cli.token };

    match cli.command {
        Command::Login { username, password } => {
            let credential = AuthClient::new(ctx.config.clone()).login(&username, &password).await?;
            save_login(&ctx, &credential)
        }
        Command::DevLogin { username } => {
            let credential = AuthClient::new(ctx.config.clone()).dev_login(&username).await?;
            save_login(&ctx, &credential)
        }
        Command::Logout => {
            let removed = ctx.store.clear()?;
            print_json(&json!({ "loggedOut": removed }))
        }
        Command::Status => run_status(&ctx),
        Command::Whoami => {
            with_session(&ctx, |session| async move {
                let principal = session.whoami().await?;
                print_json(&json!({ "principal": principal, "clientId": session.client_id() }))
            })
            .await
        }
        Command::Send { content } => {
            with_session(&ctx, |session| async move {
                session.send_global(&content)?;
                Ok(())
            })
            .await
        }
        Command::Room(room) => run_room(&ctx, room).await,
        Command::Dm(dm) => run_dm(&ctx, dm).await,
        Command::Tail => with_session(&ctx, tail_global).await,
    }
}

fn save_login(ctx: &CliContext, credential: &Credential) -> Result<(), CliError> {
    ctx.store.save(credential)?;
    print_json(&json!({
        "username": credential.subject(),
        "expiresAt": credential.expires_at(),
        "tokenFile": ctx.store.path().display().to_string(),
    }))
}

fn run_status(ctx: &CliContext) -> Result<(), CliError> {
    let value = match ctx.credential()? {
        Some(credential) => json!({
            "username": credential.subject(),
            "expiresAt": credential.expires_at(),
            "valid": credential.is_valid(),
        }),
        None => json!({ "username": Value::Null, "valid": false }),
    };
    print_json(&value)
}

async fn run_room(ctx: &CliContext, room: RoomCommand) -> Result<(), CliError> {
    match room.command {
        RoomSubcommand::Send { room, content } => {
            with_session(ctx, |session| async move {
                session.send_to_room(&room, &content)?;
                Ok(())
            })
            .await
        }
        RoomSubcommand::Tail { room } => {
            with_session(ctx, |session| async move {
                let mut messages = session.subscribe_messages();
                session.join_room(&room)?;
                let scope = Scope::Room(room.trim().to_owned());
                follow(&mut messages, |scoped| scoped.scope == scope).await
            })
            .await
        }
    }
}

async fn run_dm(ctx: &CliContext, dm: DmCommand) -> Result<(), CliError> {
    match dm.command {
        DmSubcommand::Open { peer } => {
            with_session(ctx, |session| async move {
                let Some(id) = session.open_direct_message(&peer).await? else {
                    return Err(CliError::PeerNotFound(peer));
                };
                let history = session.messages(&Scope::DirectMessage(id));
                print_json(&json!({ "conversationId": id, "peer": peer.trim(), "messages": history }))
            })
            .await
        }
        DmSubcommand::Send { peer, content } => {
            with_session(ctx, |session| async move {
                let id = session.send_direct_message_to(&peer, &content).await?;
                print_json(&json!({ "conversationId": id }))
            })
            .await
        }
        DmSubcommand::History { conversation_id, limit } => {
            let credential = require_credential(ctx)?;
            let limit = limit.unwrap_or(ctx.config.history_limit);
            let messages = HistoryClient::new(ctx.config.clone())
                .recent(&credential, conversation_id, limit)
                .await?;
            print_json(&serde_json::to_value(messages)?)
        }
    }
}

async fn tail_global(session: Arc<ChatSession>) -> Result<(), CliError> {
    let mut messages = session.subscribe_messages();
    let mut notices = session.subscribe_notices();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            received = messages.recv() => match received {
                Ok(scoped) if scoped.scope == Scope::Global => print_message(&scoped)?,
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "tail fell behind"),
                Err(RecvError::Closed) => return Ok(()),
            },
            received = notices.recv() => match received {
                Ok(notice) => print_json(&serde_json::to_value(&notice)?)?,
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "tail fell behind"),
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

/// Print matching messages until interrupted.
async fn follow(
    messages: &mut broadcast::Receiver<ScopedMessage>,
    keep: impl Fn(&ScopedMessage) -> bool,
) -> Result<(), CliError> {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            received = messages.recv() => match received {
                Ok(scoped) if keep(&scoped) => print_message(&scoped)?,
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "tail fell behind"),
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

// =============================================================================
// SESSION PLUMBING
// =============================================================================

fn require_credential(ctx: &CliContext) -> Result<Credential, CliError> {
    let credential = ctx.credential()?.ok_or(ChatError::MissingCredential)?;
    if !credential.is_valid() {
        return Err(ChatError::CredentialExpired.into());
    }
    Ok(credential)
}

/// Connect, run `work`, then disconnect regardless of the outcome.
async fn with_session<F, Fut>(ctx: &CliContext, work: F) -> Result<(), CliError>
where
    F: FnOnce(Arc<ChatSession>) -> Fut,
    Fut: Future<Output = Result<(), CliError>>,
{
    let credential = require_credential(ctx)?;
    let connector = Arc::new(StompConnector::new(ctx.config.clone()));
    let session = Arc::new(
        ChatSession::new(ctx.config.clone(), connector)
            .with_history(Arc::new(HistoryClient::new(ctx.config.clone()))),
    );

    let connected = connect(&session, credential, &ctx.config).await;
    let result = match connected {
        Ok(()) => work(Arc::clone(&session)).await,
        Err(error) => Err(error),
    };

    session.stop();
    tokio::time::sleep(FLUSH_GRACE).await;
    result
}

async fn connect(session: &ChatSession, credential: Credential, config: &ClientConfig) -> Result<(), CliError> {
    session.start(Some(credential)).await?;
    match session.wait_connected(CONNECT_TIMEOUT).await {
        Err(ChatError::Timeout) => {
            Err(CliError::ConnectTimeout(config.ws_url().unwrap_or_else(|_| config.base_url.clone())))
        }
        other => Ok(other?),
    }
}

fn print_message(scoped: &ScopedMessage) -> Result<(), CliError> {
    let mut value = serde_json::to_value(&scoped.message)?;
    if let Some(map) = value.as_object_mut() {
        map.insert("scope".to_owned(), Value::String(scoped.scope.to_string()));
    }
    print_json(&value)
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
