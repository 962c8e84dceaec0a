#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};
use wa_inbound::config::{self, Config};
use wa_inbound::ingest::ingest_with_config;
use wa_inbound::payload::EventEnvelope;
use wa_inbound::store::{InboxStore, SqliteStore};
use wa_inbound::{gateway, ConfigCommands, InboxCommands};

/// Inbound WhatsApp (Baileys) message ingestion.
#[derive(Parser, Debug)]
#[command(name = "wa-inbound")]
#[command(version)]
#[command(about = "Ingest WhatsApp webhook events into inbox conversations.", long_about = None)]
struct Cli {
    /// Path to config.toml (defaults to WA_INBOUND_CONFIG or ~/.wa-inbound/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ingest one webhook event body and print per-message outcomes as JSON
    #[command(long_about = "\
Ingest one Baileys webhook event body.

Reads the JSON event from --file, or from stdin when no file is given, \
and prints one outcome per raw message as a JSON array.

Examples:
  wa-inbound ingest --inbox 1 --file upsert.json
  cat upsert.json | wa-inbound ingest --inbox 1")]
    Ingest {
        /// Target inbox id
        #[arg(long)]
        inbox: i64,
        /// Event body file (stdin when omitted)
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Manage inboxes
    Inbox {
        #[command(subcommand)]
        inbox_command: InboxCommands,
    },

    /// Start the webhook gateway
    Gateway,

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging - respects RUST_LOG env var, defaults to INFO.
    // Logs go to stderr so JSON on stdout stays machine-readable.
    let subscriber = fmt::Subscriber::builder()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to install tracing subscriber")?;

    let config = Config::load(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Ingest { inbox, file } => handle_ingest(config, inbox, file).await,
        Commands::Inbox { inbox_command } => handle_inbox_command(inbox_command, config).await,
        Commands::Gateway => gateway::run_gateway(config).await,
        Commands::Config { config_command } => match config_command {
            ConfigCommands::Schema => {
                println!("{}", config::schema_json()?);
                Ok(())
            }
            ConfigCommands::Show => {
                println!("{}", render_config(&config)?);
                Ok(())
            }
        },
    }
}

async fn handle_ingest(config: Config, inbox_id: i64, file: Option<PathBuf>) -> Result<()> {
    let body = match file {
        Some(path) => tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read event file {}", path.display()))?,
        None => tokio::task::spawn_blocking(|| {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf).map(|_| buf)
        })
        .await
        .context("stdin reader task failed")?
        .context("Failed to read event from stdin")?,
    };

    let envelope: EventEnvelope =
        serde_json::from_str(&body).context("Event body is not a valid webhook envelope")?;

    let outcomes =
        tokio::task::spawn_blocking(move || ingest_with_config(&config, inbox_id, &envelope))
            .await
            .context("Ingest task failed")??;

    let Some(outcomes) = outcomes else {
        bail!("Inbox {inbox_id} not found. Create it with `wa-inbound inbox add`.");
    };

    println!("{}", serde_json::to_string_pretty(&outcomes)?);
    Ok(())
}

async fn handle_inbox_command(command: InboxCommands, config: Config) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let store = SqliteStore::from_config(&config)?;
        match command {
            InboxCommands::List => {
                let inboxes = store.list_inboxes()?;
                if inboxes.is_empty() {
                    println!("No inboxes yet.");
                    println!("  wa-inbound inbox add --account <id> --name <name>");
                    return Ok(());
                }
                println!("🗂  Inboxes ({}):", inboxes.len());
                for inbox in inboxes {
                    println!(
                        "  [{}] account={} name={} verify_token={} created={}",
                        inbox.id,
                        inbox.account_id,
                        inbox.name,
                        if inbox.verify_token.is_some() { "set" } else { "none" },
                        inbox.created_at.to_rfc3339()
                    );
                }
                Ok(())
            }
            InboxCommands::Add {
                account,
                name,
                verify_token,
            } => {
                let name = name.trim();
                if name.is_empty() {
                    bail!("--name must not be empty");
                }
                let inbox = store.create_inbox(account, name, verify_token.as_deref())?;
                println!("✅ Created inbox {} ({})", inbox.id, inbox.name);
                println!("   Webhook: POST /webhooks/baileys/{}", inbox.id);
                Ok(())
            }
        }
    })
    .await
    .context("Inbox command task failed")?
}

/// Effective config as TOML with secrets masked.
fn render_config(config: &Config) -> Result<String> {
    let mut shown = config.clone();
    if shown.media.api_key.is_some() {
        shown.media.api_key = Some("***".into());
    }
    let mut rendered = format!(
        "# config: {}\n# workspace: {}\n# database: {}\n",
        config.config_path.display(),
        config.workspace_dir.display(),
        config.resolved_db_path().display()
    );
    rendered.push_str(&toml::to_string_pretty(&shown).context("Failed to render config")?);
    Ok(rendered)
}
