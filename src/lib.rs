#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::needless_pass_by_value,
    clippy::redundant_closure_for_method_calls,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unnecessary_wraps
)]

use clap::Subcommand;
use serde::{Deserialize, Serialize};

pub mod clock;
pub mod config;
pub mod content;
pub mod gateway;
pub mod identity;
pub mod ingest;
pub mod media;
pub mod payload;
pub mod persister;
pub mod store;
pub(crate) mod util;

pub use config::Config;
pub use ingest::{Ingestor, MessageOutcome};

/// Inbox management subcommands
#[derive(Subcommand, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum InboxCommands {
    /// List all inboxes
    List,
    /// Register a new inbox for a provider connection
    #[command(long_about = "\
Register a new inbox for a Baileys provider connection.

The printed inbox id is the path segment the provider must POST to: \
/webhooks/baileys/<inbox_id>. When --verify-token is set, every webhook \
body must carry a matching webhookVerifyToken field.

Examples:
  wa-inbound inbox add --account 1 --name support --verify-token s3cret
  wa-inbound inbox add --account 1 --name sales")]
    Add {
        /// Owning account id
        #[arg(long)]
        account: i64,
        /// Human-readable inbox name
        #[arg(long)]
        name: String,
        /// Token the provider echoes back in each webhook body
        #[arg(long)]
        verify_token: Option<String>,
    },
}

/// Config subcommands
#[derive(Subcommand, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConfigCommands {
    /// Print the JSON schema of config.toml
    Schema,
    /// Print the effective configuration after env overrides
    Show,
}
