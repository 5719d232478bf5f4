//! CLI command definitions for the `tally` binary.
//!
//! Uses clap derive macros. `serve` and `gateway` run the two HTTP services;
//! the remaining commands drive the credit ledger directly against the local
//! database.

pub mod ledger;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

/// Credit-metered chat service and gateway.
#[derive(Parser)]
#[command(name = "tally", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Detailed output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to config.toml (defaults to <data dir>/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Data directory holding the database and config.
    #[arg(long, global = true, env = "TALLY_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the product API.
    Serve {
        /// Listen address (overrides server.product_bind).
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run the internal chat gateway.
    Gateway {
        /// Listen address (overrides server.gateway_bind).
        #[arg(long)]
        bind: Option<String>,
    },

    /// Company credit pool operations.
    Credits {
        #[command(subcommand)]
        action: CreditsCommand,
    },

    /// Per-user credit allocation.
    Limit {
        #[command(subcommand)]
        action: LimitCommand,
    },

    /// Remove a user from their company, releasing their allocation.
    Detach {
        company: Uuid,
        user: Uuid,
    },

    /// Pool balance, allocation and membership totals for a company.
    Summary { company: Uuid },
}

#[derive(Subcommand)]
pub enum CreditsCommand {
    /// Append a ledger row moving credits into (or out of) a company pool.
    Grant {
        company: Uuid,

        /// Signed amount; negative values remove credits.
        #[arg(allow_hyphen_values = true)]
        amount: i64,

        /// Attribute the movement to a user.
        #[arg(long)]
        user: Option<Uuid>,

        #[arg(long, default_value = "grant")]
        reason: String,

        /// Idempotency key; generated when omitted.
        #[arg(long)]
        key: Option<String>,
    },

    /// Recent ledger rows, newest first.
    Entries {
        company: Uuid,

        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[derive(Subcommand)]
pub enum LimitCommand {
    /// Move a user's remaining credits by a signed delta.
    Adjust {
        company: Uuid,
        user: Uuid,

        #[arg(allow_hyphen_values = true)]
        delta: i64,
    },
}

impl Cli {
    /// Filter used when `RUST_LOG` is unset and no `-v` was given.
    pub fn log_level<'a>(&self, configured: &'a str) -> &'a str {
        match self.verbose {
            0 => configured,
            1 => "debug",
            _ => "trace",
        }
    }
}
