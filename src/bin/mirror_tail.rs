use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use chatmirror::{ChatId, ChatMirror, MirrorConfig, SyncConfig, SyncUpdate};

/// Follows a mirrored chat history and prints every update the sync engine emits.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Directory for application data
    #[clap(long, value_name = "PATH", required = true)]
    data_dir: PathBuf,

    /// Directory for application logs
    #[clap(long, value_name = "PATH", required = true)]
    logs_dir: PathBuf,

    /// `host:port` of the newline-delimited JSON push channel
    #[clap(long, value_name = "ADDR")]
    push_addr: Option<String>,

    /// Chat to open once the chat list is loaded; defaults to the most recent one
    #[clap(long, value_name = "CHAT_ID")]
    chat: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let sync = SyncConfig::from_env().context("Invalid CHATMIRROR_* configuration")?;
    let mut config = MirrorConfig::new(&args.data_dir, &args.logs_dir).with_sync_config(sync);
    if let Some(addr) = args.push_addr {
        config = config.with_push_addr(addr);
    }

    let mirror = ChatMirror::initialize(config)
        .await
        .context("Failed to initialize chat mirror")?;
    let handle = mirror.handle();
    let mut updates = handle.subscribe();

    let mut requested = args.chat.map(ChatId::from);
    if let Some(chat_id) = &requested {
        handle.select_chat(chat_id.clone()).await?;
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(target: "chatmirror::mirror_tail", "Interrupted, shutting down");
                break;
            }
            update = updates.recv() => {
                let update = match update {
                    Ok(update) => update,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(target: "chatmirror::mirror_tail", "Skipped {} updates", skipped);
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };

                if let SyncUpdate::ChatListLoaded { chats } = &update
                    && requested.is_none()
                    && let Some(first) = chats.first()
                {
                    requested = Some(first.chat_id.clone());
                    handle.select_chat(first.chat_id.clone()).await?;
                }

                println!("{}", serde_json::to_string(&update)?);
            }
        }
    }

    mirror.shutdown().await?;
    Ok(())
}
