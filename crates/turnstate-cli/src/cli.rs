//! CLI argument definitions for turnstate.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use turnstate_engine::config::DEFAULT_CONFIG_PATH;

/// turnstate -- turn-scoped state for conversational bots.
#[derive(Debug, Parser)]
#[command(
    name = "turnstate",
    version,
    about = "turnstate -- turn-scoped bot state over SQLite",
    long_about = "Runs a sample bot whose user, conversation and profile state is loaded \
                  once per turn, saved only when changed, and audited through a change log."
)]
pub struct Cli {
    /// Engine configuration file (TOML). Missing file means defaults.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// SQLite database path. Overrides `[storage] path`; unset means in-memory.
    #[arg(long, global = true, env = "TURNSTATE_DB")]
    pub db: Option<PathBuf>,

    /// Default log level when `RUST_LOG` is not set.
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Chat with the sample bot; each stdin line is one turn.
    Chat {
        /// Sender id.
        #[arg(long, short, default_value = "user")]
        user: String,

        /// Conversation id.
        #[arg(long, short, default_value = "default")]
        conversation: String,

        /// Channel id.
        #[arg(long, default_value = "cli")]
        channel: String,

        /// Bot (recipient) id.
        #[arg(long, default_value = "bot")]
        bot: String,
    },

    /// Print stored records whose key starts with a prefix.
    Show {
        /// Key prefix, e.g. `user/bot/cli/`.
        #[arg(default_value = "")]
        prefix: String,
    },
}
