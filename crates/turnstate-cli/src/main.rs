//! CLI entry point for turnstate.
//!
//! `turnstate chat` runs the sample bot over stdin, one turn per line.
//! `turnstate show` dumps stored records by key prefix.

mod bot;
mod cli;
mod helpers;

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use turnstate_engine::{Activity, EngineConfig, TurnContext};
use turnstate_store::Storage;

use crate::bot::SampleBot;
use crate::cli::{Cli, Commands};
use crate::helpers::{init_tracing, open_sqlite, open_storage};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let config = EngineConfig::load_or_default(&cli.config)
        .with_context(|| format!("invalid config {}", cli.config.display()))?;
    let db = cli.db.clone().or_else(|| config.storage.path.clone());

    match cli.command {
        Commands::Chat {
            user,
            conversation,
            channel,
            bot,
        } => cmd_chat(config, db, ChatIdentity { user, conversation, channel, bot }).await,
        Commands::Show { prefix } => cmd_show(db, &prefix).await,
    }
}

// ---------------------------------------------------------------------------
// Subcommand: chat
// ---------------------------------------------------------------------------

struct ChatIdentity {
    user: String,
    conversation: String,
    channel: String,
    bot: String,
}

async fn cmd_chat(config: EngineConfig, db: Option<PathBuf>, who: ChatIdentity) -> Result<()> {
    let storage = open_storage(db.as_deref()).await?;
    let (bot, pipeline) = SampleBot::build(storage, &config)?;
    info!(user = %who.user, conversation = %who.conversation, "chat session started");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let activity = Activity::message(
            who.channel.as_str(),
            who.bot.as_str(),
            who.user.as_str(),
            who.conversation.as_str(),
            line,
        );
        let ctx = TurnContext::new(activity);
        let result = pipeline.run_with_context(&ctx, bot.as_ref()).await;
        for reply in bot.take_replies() {
            println!("{reply}");
        }
        if let Err(err) = result {
            error!(turn_id = %ctx.id(), %err, "turn failed");
            if bot::is_fatal(&err) {
                return Err(err.into());
            }
            eprintln!("error: {err}");
        }
    }
    info!("chat session ended");
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: show
// ---------------------------------------------------------------------------

async fn cmd_show(db: Option<PathBuf>, prefix: &str) -> Result<()> {
    let Some(path) = db else {
        bail!("`show` needs a database: pass --db or set [storage] path");
    };
    let storage = open_sqlite(&path).await?;
    let keys = storage.keys_with_prefix(prefix).await?;
    if keys.is_empty() {
        println!("no records under '{prefix}'");
        return Ok(());
    }

    let items = storage.read(&keys).await?;
    for key in &keys {
        if let Some(item) = items.get(key) {
            println!("{key} (eTag {})", item.e_tag.as_deref().unwrap_or("-"));
            println!("{}", serde_json::to_string_pretty(&item.data)?);
        }
    }
    Ok(())
}
