//! Webhook ingestion entry point.
//!
//! Each raw message in a batch is an independent unit of work. Domain
//! failures become a per-message [`MessageOutcome`]; only an unavailable
//! store aborts the batch so the caller can retry it.

use crate::clock::{timestamp_or_now, Clock, SystemClock};
use crate::config::Config;
use crate::content::{self, MessageKind};
use crate::identity::{IdentityResolver, SenderAddressing};
use crate::media::{HttpMediaFetcher, MediaFetcher};
use crate::payload::{peek_message_id, EventEnvelope, RawMessage};
use crate::persister::{MessagePersister, PersistOutcome};
use crate::store::{Inbox, InboxStore, SqliteStore, StoreError, StoreResult};
use anyhow::Context;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("invalid event envelope: {0}")]
    InvalidEnvelope(#[from] serde_json::Error),
}

/// Result of processing one raw message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MessageOutcome {
    Created {
        source_id: String,
        message_id: i64,
        conversation_id: i64,
        contact_id: i64,
        kind: MessageKind,
        attachments: usize,
    },
    Duplicate {
        source_id: String,
        message_id: i64,
    },
    Skipped {
        source_id: String,
        reason: String,
    },
    Failed {
        source_id: Option<String>,
        error: String,
    },
}

impl MessageOutcome {
    pub fn source_id(&self) -> Option<&str> {
        match self {
            Self::Created { source_id, .. }
            | Self::Duplicate { source_id, .. }
            | Self::Skipped { source_id, .. } => Some(source_id),
            Self::Failed { source_id, .. } => source_id.as_deref(),
        }
    }
}

pub struct Ingestor<'a> {
    store: &'a dyn InboxStore,
    fetcher: &'a dyn MediaFetcher,
    clock: &'a dyn Clock,
}

impl<'a> Ingestor<'a> {
    pub fn new(
        store: &'a dyn InboxStore,
        fetcher: &'a dyn MediaFetcher,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            store,
            fetcher,
            clock,
        }
    }

    /// Process every message of a `messages.upsert` event; other events are
    /// acknowledged with no outcomes.
    pub fn ingest(
        &self,
        inbox: &Inbox,
        envelope: &EventEnvelope,
    ) -> Result<Vec<MessageOutcome>, IngestError> {
        if !envelope.is_messages_upsert() {
            tracing::debug!(
                inbox_id = inbox.id,
                "Ignoring '{}' event",
                envelope.event
            );
            return Ok(Vec::new());
        }

        let data = envelope.upsert_data()?;
        tracing::debug!(
            inbox_id = inbox.id,
            "Ingesting {} message(s) from '{}' upsert",
            data.messages.len(),
            data.kind.as_deref().unwrap_or("notify")
        );
        let mut outcomes = Vec::with_capacity(data.messages.len());

        for value in &data.messages {
            let outcome = match self.ingest_message(inbox, value) {
                Ok(outcome) => outcome,
                Err(e) if e.is_unavailable() => {
                    tracing::error!(inbox_id = inbox.id, "Aborting batch: {e}");
                    return Err(e.into());
                }
                Err(e) => {
                    let source_id = peek_message_id(value);
                    tracing::warn!(
                        inbox_id = inbox.id,
                        "Failed to ingest message {}: {e}",
                        source_id.as_deref().unwrap_or("<unknown>")
                    );
                    MessageOutcome::Failed {
                        source_id,
                        error: e.to_string(),
                    }
                }
            };
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }

    fn ingest_message(&self, inbox: &Inbox, value: &Value) -> StoreResult<MessageOutcome> {
        let raw = match RawMessage::decode(value) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(inbox_id = inbox.id, "Undecodable message: {e}");
                return Ok(MessageOutcome::Failed {
                    source_id: peek_message_id(value),
                    error: format!("invalid message: {e}"),
                });
            }
        };

        let sender = match SenderAddressing::from_key(&raw.key) {
            Ok(sender) => sender,
            Err(reason) => {
                tracing::debug!(
                    inbox_id = inbox.id,
                    "Skipping message {}: {reason}",
                    raw.key.id
                );
                return Ok(MessageOutcome::Skipped {
                    source_id: raw.key.id,
                    reason: reason.to_string(),
                });
            }
        };

        let classified = content::normalize(&raw.message);
        let activity_at = timestamp_or_now(raw.message_timestamp, self.clock);

        // On outgoing messages pushName is the account owner, not the chat peer.
        let display_name = if raw.key.from_me() {
            None
        } else {
            raw.display_name()
        };
        let identity =
            IdentityResolver::new(self.store).resolve(inbox, &sender, display_name, activity_at)?;

        let persisted = MessagePersister::new(self.store, self.fetcher, self.clock).persist(
            inbox,
            &identity.conversation,
            &identity.contact,
            &classified,
            &raw,
        )?;

        Ok(match persisted {
            PersistOutcome::Created {
                message,
                attachments,
            } => MessageOutcome::Created {
                source_id: message.source_id,
                message_id: message.id,
                conversation_id: message.conversation_id,
                contact_id: identity.contact.id,
                kind: classified.kind,
                attachments,
            },
            PersistOutcome::Duplicate(message) => MessageOutcome::Duplicate {
                source_id: message.source_id,
                message_id: message.id,
            },
        })
    }
}

/// Ingest with a fresh store connection and HTTP fetcher built from `config`.
///
/// Blocking; call from a blocking thread when inside an async runtime.
pub fn ingest_with_config(
    config: &Config,
    inbox_id: i64,
    envelope: &EventEnvelope,
) -> anyhow::Result<Option<Vec<MessageOutcome>>> {
    let store = SqliteStore::from_config(config)?;
    let Some(inbox) = store.find_inbox(inbox_id)? else {
        return Ok(None);
    };
    let fetcher = HttpMediaFetcher::new(&config.media)?;

    let outcomes = Ingestor::new(&store, &fetcher, &SystemClock)
        .ingest(&inbox, envelope)
        .with_context(|| format!("Failed to ingest batch for inbox {inbox_id}"))?;
    Ok(Some(outcomes))
}
