use std::time::Duration;

use anyhow::{anyhow, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use nearby_core::aggregator::list_conversations;
use nearby_core::backend::records::{MessageRecord, NewMessage};
use nearby_core::backend::rest::RestBackend;
use nearby_core::backend::{decode_row, Backend, ChangeEvent, ChangeKind};
use nearby_core::conversation::{
    fetch_history, insert_message, subscribe_live, validate_content, ConversationKey,
};
use nearby_core::feed::{build_home_feed, fetch_profile, fetch_profiles, DEFAULT_FRESH_FACES};
use nearby_core::geo::Coordinates;
use nearby_core::NearbyUser;
use serde_json::json;

#[derive(Debug, Parser)]
#[command(name = "nearby")]
#[command(about = "Command-line client for the Nearby messaging backend")]
struct Cli {
    /// Backend base URL
    #[arg(long, env = "NEARBY_BACKEND_URL")]
    url: String,

    /// Public (anon) API key
    #[arg(long, env = "NEARBY_ANON_KEY", default_value = "")]
    anon_key: String,

    /// Access token of the signed-in user
    #[arg(long, env = "NEARBY_ACCESS_TOKEN", hide_env_values = true)]
    token: String,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 15)]
    request_timeout: u64,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show the identity behind the access token
    Whoami,

    /// Print the conversation with one user, oldest first
    Messages {
        /// Counterparty user id
        #[arg(long = "with")]
        with: String,
    },

    /// Send a message
    Send {
        /// Recipient user id
        #[arg(long)]
        to: String,

        /// Message content
        #[arg(long)]
        content: String,
    },

    /// List conversations, most recent first
    Conversations,

    /// Show fresh faces and nearby users
    Nearby,

    /// Print incoming messages from one user (runs until --timeout)
    Listen {
        /// Counterparty user id
        #[arg(long = "with")]
        with: String,

        /// Timeout in seconds (0 = run forever)
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let backend = connect(&cli)?;

    match &cli.cmd {
        Command::Whoami => cmd_whoami(&backend).await,
        Command::Messages { with } => cmd_messages(&backend, with).await,
        Command::Send { to, content } => cmd_send(&backend, to, content).await,
        Command::Conversations => cmd_conversations(&backend).await,
        Command::Nearby => cmd_nearby(&backend).await,
        Command::Listen { with, timeout } => cmd_listen(&backend, with, *timeout).await,
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

fn connect(cli: &Cli) -> anyhow::Result<RestBackend> {
    let backend = RestBackend::new(
        cli.url.as_str(),
        cli.anon_key.as_str(),
        Duration::from_secs(cli.request_timeout),
    )
    .with_context(|| format!("connect to {}", cli.url))?;
    backend.set_access_token(Some(cli.token.trim().to_string()));
    Ok(backend)
}

async fn me(backend: &RestBackend) -> anyhow::Result<String> {
    let identity = backend
        .current_identity()
        .await
        .context("look up identity")?
        .ok_or_else(|| anyhow!("access token rejected"))?;
    Ok(identity.id)
}

fn print(v: serde_json::Value) {
    match serde_json::to_string_pretty(&v) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("json encode: {e}"),
    }
}

fn message_json(m: &MessageRecord, me: &str) -> serde_json::Value {
    json!({
        "id": m.id,
        "sender_id": m.sender_id,
        "receiver_id": m.receiver_id,
        "content": m.content,
        "created_at": m.created_at.to_rfc3339(),
        "mine": m.sender_id == me,
    })
}

fn user_json(u: &NearbyUser) -> serde_json::Value {
    json!({
        "id": u.id,
        "username": u.username,
        "age": u.age,
        "online": u.online,
        "distance": u.distance_label,
    })
}

// ── Commands ────────────────────────────────────────────────────────────────

async fn cmd_whoami(backend: &RestBackend) -> anyhow::Result<()> {
    let identity = backend
        .current_identity()
        .await
        .context("look up identity")?
        .ok_or_else(|| anyhow!("access token rejected"))?;
    print(json!({
        "id": identity.id,
        "email": identity.email,
    }));
    Ok(())
}

async fn cmd_messages(backend: &RestBackend, with: &str) -> anyhow::Result<()> {
    let me = me(backend).await?;
    let key =
        ConversationKey::new(Some(me.as_str()), with).map_err(|e| anyhow!(e.user_message()))?;
    let rows = fetch_history(backend, key.history_query())
        .await
        .context("fetch messages")?;
    let out: Vec<_> = rows.iter().map(|m| message_json(m, &me)).collect();
    print(json!({ "messages": out }));
    Ok(())
}

async fn cmd_send(backend: &RestBackend, to: &str, content: &str) -> anyhow::Result<()> {
    let me = me(backend).await?;
    let key =
        ConversationKey::new(Some(me.as_str()), to).map_err(|e| anyhow!(e.user_message()))?;
    let content = validate_content(content).map_err(|e| anyhow!(e.user_message()))?;
    let row = NewMessage {
        sender_id: key.me().to_string(),
        receiver_id: key.counterparty().to_string(),
        content: content.to_string(),
    };
    let stored = insert_message(backend, &row).await.context("send message")?;
    print(message_json(&stored, &me));
    Ok(())
}

async fn cmd_conversations(backend: &RestBackend) -> anyhow::Result<()> {
    let me = me(backend).await?;
    let list = list_conversations(backend, &me, Utc::now())
        .await
        .context("list conversations")?;
    let out: Vec<_> = list
        .iter()
        .map(|c| {
            json!({
                "counterparty_id": c.counterparty_id,
                "name": c.display_name,
                "last_message": c.last_message,
                "mine": c.last_message_is_mine,
                "when": c.time_label,
            })
        })
        .collect();
    print(json!({ "conversations": out }));
    Ok(())
}

async fn cmd_nearby(backend: &RestBackend) -> anyhow::Result<()> {
    let me = me(backend).await?;
    let origin = fetch_profile(backend, &me)
        .await
        .context("fetch own profile")?
        .and_then(|p| Coordinates::from_parts(p.latitude, p.longitude));
    let profiles = fetch_profiles(backend).await.context("fetch profiles")?;
    let (fresh, nearby) = build_home_feed(&me, origin, &profiles, DEFAULT_FRESH_FACES);
    print(json!({
        "fresh_faces": fresh.iter().map(user_json).collect::<Vec<_>>(),
        "nearby": nearby.iter().map(user_json).collect::<Vec<_>>(),
    }));
    Ok(())
}

async fn cmd_listen(backend: &RestBackend, with: &str, timeout_sec: u64) -> anyhow::Result<()> {
    let me = me(backend).await?;
    let key =
        ConversationKey::new(Some(me.as_str()), with).map_err(|e| anyhow!(e.user_message()))?;

    let (sink, events) = flume::unbounded::<ChangeEvent>();
    let handles = subscribe_live(backend, &key, &sink)
        .await
        .context("subscribe to messages")?;
    drop(sink);
    eprintln!("listening for messages with {with}");

    let deadline = if timeout_sec == 0 {
        None
    } else {
        Some(tokio::time::Instant::now() + Duration::from_secs(timeout_sec))
    };

    loop {
        let recv_fut = events.recv_async();
        let event = if let Some(dl) = deadline {
            let remaining = dl.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, recv_fut).await {
                Ok(Ok(e)) => e,
                Ok(Err(_)) => break,
                Err(_) => break, // timeout
            }
        } else {
            match recv_fut.await {
                Ok(e) => e,
                Err(_) => break,
            }
        };

        match event.kind {
            ChangeKind::Closed => {
                eprintln!("live feed ended by the server");
                break;
            }
            ChangeKind::Insert => {}
            _ => continue,
        }
        let Some(row) = event.new else {
            continue;
        };
        let message: MessageRecord = match decode_row(row) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(%e, "skipping undecodable row");
                continue;
            }
        };
        if key.contains(&message.sender_id, &message.receiver_id) {
            print(message_json(&message, &me));
        }
    }

    for handle in handles {
        backend.unsubscribe(handle).await;
    }
    Ok(())
}
