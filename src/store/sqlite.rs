use super::{
    Attachment, Contact, ContactInbox, ContactPromotion, Conversation, Inbox,
    InboxStore, Message, MessageType, NewAttachment, NewContact, NewConversation, NewMessage,
    StoreError, StoreResult,
};
use crate::config::Config;
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

const PRAGMA_SQL: &str = "PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL; PRAGMA foreign_keys = ON;";

const SCHEMA_SQL: &str = "CREATE TABLE IF NOT EXISTS inboxes (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id   INTEGER NOT NULL,
    name         TEXT NOT NULL,
    verify_token TEXT,
    created_at   TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS contacts (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id   INTEGER NOT NULL,
    name         TEXT,
    phone_number TEXT,
    identifier   TEXT,
    created_at   TEXT NOT NULL,
    UNIQUE (account_id, identifier),
    UNIQUE (account_id, phone_number)
);
CREATE TABLE IF NOT EXISTS contact_inboxes (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    contact_id INTEGER NOT NULL REFERENCES contacts(id),
    inbox_id   INTEGER NOT NULL REFERENCES inboxes(id),
    source_id  TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (inbox_id, source_id)
);
CREATE INDEX IF NOT EXISTS idx_contact_inboxes_contact ON contact_inboxes(contact_id);
CREATE TABLE IF NOT EXISTS conversations (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id       INTEGER NOT NULL,
    inbox_id         INTEGER NOT NULL REFERENCES inboxes(id),
    contact_id       INTEGER NOT NULL REFERENCES contacts(id),
    contact_inbox_id INTEGER NOT NULL REFERENCES contact_inboxes(id),
    status           TEXT NOT NULL DEFAULT 'open',
    created_at       TEXT NOT NULL,
    last_activity_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_one_open
    ON conversations(contact_inbox_id) WHERE status = 'open';
CREATE INDEX IF NOT EXISTS idx_conversations_inbox ON conversations(inbox_id);
CREATE TABLE IF NOT EXISTS messages (
    id                      INTEGER PRIMARY KEY AUTOINCREMENT,
    inbox_id                INTEGER NOT NULL REFERENCES inboxes(id),
    conversation_id         INTEGER NOT NULL REFERENCES conversations(id),
    sender_contact_id       INTEGER REFERENCES contacts(id),
    source_id               TEXT NOT NULL,
    message_type            TEXT NOT NULL,
    content                 TEXT,
    content_attributes      TEXT NOT NULL DEFAULT '{}',
    in_reply_to             INTEGER REFERENCES messages(id),
    in_reply_to_external_id TEXT,
    is_unsupported          INTEGER NOT NULL DEFAULT 0,
    created_at              TEXT NOT NULL,
    UNIQUE (inbox_id, source_id)
);
CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, created_at);
CREATE TABLE IF NOT EXISTS attachments (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    file_name  TEXT NOT NULL,
    mime_type  TEXT NOT NULL,
    byte_size  INTEGER NOT NULL,
    data       BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_attachments_message ON attachments(message_id);";

const INBOX_COLUMNS: &str = "id, account_id, name, verify_token, created_at";
const CONTACT_COLUMNS: &str = "id, account_id, name, phone_number, identifier, created_at";
const CONTACT_INBOX_COLUMNS: &str = "id, contact_id, inbox_id, source_id, created_at";
const CONVERSATION_COLUMNS: &str =
    "id, account_id, inbox_id, contact_id, contact_inbox_id, created_at, last_activity_at";
const MESSAGE_COLUMNS: &str = "id, inbox_id, conversation_id, sender_contact_id, source_id, message_type, content,
     content_attributes, in_reply_to, in_reply_to_external_id, is_unsupported, created_at";
const ATTACHMENT_COLUMNS: &str = "id, message_id, file_name, mime_type, byte_size, data";

/// SQLite-backed store. One instance wraps one connection; open a fresh
/// store per unit of work instead of sharing it across threads.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory: {}", parent.display())
            })?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open inbound DB: {}", path.display()))?;
        conn.busy_timeout(busy_timeout)
            .context("Failed to set SQLite busy timeout")?;
        Self::init(conn)
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::open(
            &config.resolved_db_path(),
            Duration::from_millis(config.storage.busy_timeout_ms),
        )
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory DB")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(PRAGMA_SQL)
            .context("Failed to set SQLite pragmas")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to create inbound schema")?;
        Ok(Self { conn })
    }

    /// Write transaction that takes the database write lock up front, so
    /// concurrent writers queue on the busy handler instead of failing
    /// mid-transaction.
    fn immediate(&self) -> rusqlite::Result<Transaction<'_>> {
        Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
    }
}

impl InboxStore for SqliteStore {
    fn create_inbox(
        &self,
        account_id: i64,
        name: &str,
        verify_token: Option<&str>,
    ) -> StoreResult<Inbox> {
        let created_at = Utc::now();
        self.conn.execute(
            "INSERT INTO inboxes (account_id, name, verify_token, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![account_id, name, verify_token, format_ts(created_at)],
        )?;

        Ok(Inbox {
            id: self.conn.last_insert_rowid(),
            account_id,
            name: name.to_string(),
            verify_token: verify_token.map(str::to_string),
            created_at,
        })
    }

    fn find_inbox(&self, inbox_id: i64) -> StoreResult<Option<Inbox>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {INBOX_COLUMNS} FROM inboxes WHERE id = ?1"),
                params![inbox_id],
                map_inbox_row,
            )
            .optional()?)
    }

    fn list_inboxes(&self) -> StoreResult<Vec<Inbox>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {INBOX_COLUMNS} FROM inboxes ORDER BY id ASC"))?;
        let rows = stmt.query_map([], map_inbox_row)?;

        let mut inboxes = Vec::new();
        for row in rows {
            inboxes.push(row?);
        }
        Ok(inboxes)
    }

    fn find_contact(&self, contact_id: i64) -> StoreResult<Option<Contact>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"),
                params![contact_id],
                map_contact_row,
            )
            .optional()?)
    }

    fn find_contact_by_identifier(
        &self,
        account_id: i64,
        identifier: &str,
    ) -> StoreResult<Option<Contact>> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT {CONTACT_COLUMNS} FROM contacts WHERE account_id = ?1 AND identifier = ?2"
                ),
                params![account_id, identifier],
                map_contact_row,
            )
            .optional()?)
    }

    fn find_contact_by_phone(
        &self,
        account_id: i64,
        phone_number: &str,
    ) -> StoreResult<Option<Contact>> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT {CONTACT_COLUMNS} FROM contacts WHERE account_id = ?1 AND phone_number = ?2"
                ),
                params![account_id, phone_number],
                map_contact_row,
            )
            .optional()?)
    }

    fn list_contacts(&self, account_id: i64) -> StoreResult<Vec<Contact>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts WHERE account_id = ?1 ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![account_id], map_contact_row)?;

        let mut contacts = Vec::new();
        for row in rows {
            contacts.push(row?);
        }
        Ok(contacts)
    }

    fn find_contact_inbox(
        &self,
        inbox_id: i64,
        source_id: &str,
    ) -> StoreResult<Option<ContactInbox>> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT {CONTACT_INBOX_COLUMNS} FROM contact_inboxes
                     WHERE inbox_id = ?1 AND source_id = ?2"
                ),
                params![inbox_id, source_id],
                map_contact_inbox_row,
            )
            .optional()?)
    }

    fn find_contact_inbox_for_contact(
        &self,
        inbox_id: i64,
        contact_id: i64,
    ) -> StoreResult<Option<ContactInbox>> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT {CONTACT_INBOX_COLUMNS} FROM contact_inboxes
                     WHERE inbox_id = ?1 AND contact_id = ?2
                     ORDER BY id ASC LIMIT 1"
                ),
                params![inbox_id, contact_id],
                map_contact_inbox_row,
            )
            .optional()?)
    }

    fn list_contact_inboxes(&self, inbox_id: i64) -> StoreResult<Vec<ContactInbox>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CONTACT_INBOX_COLUMNS} FROM contact_inboxes WHERE inbox_id = ?1 ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![inbox_id], map_contact_inbox_row)?;

        let mut bindings = Vec::new();
        for row in rows {
            bindings.push(row?);
        }
        Ok(bindings)
    }

    fn create_contact_with_inbox(
        &self,
        contact: &NewContact,
        inbox_id: i64,
        source_id: &str,
    ) -> StoreResult<(Contact, ContactInbox)> {
        let created_at = Utc::now();
        let stamp = format_ts(created_at);

        let tx = self.immediate()?;
        tx.execute(
            "INSERT INTO contacts (account_id, name, phone_number, identifier, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                contact.account_id,
                contact.name,
                contact.phone_number,
                contact.identifier,
                stamp
            ],
        )?;
        let contact_id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO contact_inboxes (contact_id, inbox_id, source_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![contact_id, inbox_id, source_id, stamp],
        )?;
        let contact_inbox_id = tx.last_insert_rowid();
        tx.commit()?;

        Ok((
            Contact {
                id: contact_id,
                account_id: contact.account_id,
                name: contact.name.clone(),
                phone_number: contact.phone_number.clone(),
                identifier: contact.identifier.clone(),
                created_at,
            },
            ContactInbox {
                id: contact_inbox_id,
                contact_id,
                inbox_id,
                source_id: source_id.to_string(),
                created_at,
            },
        ))
    }

    fn create_contact_inbox(
        &self,
        contact_id: i64,
        inbox_id: i64,
        source_id: &str,
    ) -> StoreResult<ContactInbox> {
        let created_at = Utc::now();
        self.conn.execute(
            "INSERT INTO contact_inboxes (contact_id, inbox_id, source_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![contact_id, inbox_id, source_id, format_ts(created_at)],
        )?;

        Ok(ContactInbox {
            id: self.conn.last_insert_rowid(),
            contact_id,
            inbox_id,
            source_id: source_id.to_string(),
            created_at,
        })
    }

    fn promote_contact_inbox(&self, promotion: &ContactPromotion) -> StoreResult<()> {
        let tx = self.immediate()?;

        let moved = tx.execute(
            "UPDATE contact_inboxes SET source_id = ?1 WHERE id = ?2 AND source_id = ?3",
            params![
                promotion.to_source_id,
                promotion.contact_inbox_id,
                promotion.from_source_id
            ],
        )?;
        if moved == 0 {
            // Dropping the transaction rolls it back.
            return Err(StoreError::Conflict(format!(
                "contact inbox {} is no longer keyed by '{}'",
                promotion.contact_inbox_id, promotion.from_source_id
            )));
        }

        tx.execute(
            "UPDATE contacts
             SET identifier = ?1, phone_number = COALESCE(phone_number, ?2)
             WHERE id = ?3",
            params![
                promotion.identifier,
                promotion.phone_number,
                promotion.contact_id
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn fill_contact_addressing(
        &self,
        contact_id: i64,
        identifier: Option<&str>,
        phone_number: Option<&str>,
    ) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE contacts
             SET identifier = COALESCE(identifier, ?2),
                 phone_number = COALESCE(phone_number, ?3)
             WHERE id = ?1",
            params![contact_id, identifier, phone_number],
        )?;
        Ok(())
    }

    fn find_open_conversation(&self, contact_inbox_id: i64) -> StoreResult<Option<Conversation>> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations
                     WHERE contact_inbox_id = ?1 AND status = 'open'"
                ),
                params![contact_inbox_id],
                map_conversation_row,
            )
            .optional()?)
    }

    fn create_conversation(&self, conversation: &NewConversation) -> StoreResult<Conversation> {
        let stamp = format_ts(conversation.created_at);
        self.conn.execute(
            "INSERT INTO conversations (
                account_id, inbox_id, contact_id, contact_inbox_id, status, created_at, last_activity_at
             ) VALUES (?1, ?2, ?3, ?4, 'open', ?5, ?5)",
            params![
                conversation.account_id,
                conversation.inbox_id,
                conversation.contact_id,
                conversation.contact_inbox_id,
                stamp
            ],
        )?;

        Ok(Conversation {
            id: self.conn.last_insert_rowid(),
            account_id: conversation.account_id,
            inbox_id: conversation.inbox_id,
            contact_id: conversation.contact_id,
            contact_inbox_id: conversation.contact_inbox_id,
            created_at: conversation.created_at,
            last_activity_at: conversation.created_at,
        })
    }

    fn touch_conversation(&self, conversation_id: i64, at: DateTime<Utc>) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE conversations SET last_activity_at = ?2
             WHERE id = ?1 AND last_activity_at < ?2",
            params![conversation_id, format_ts(at)],
        )?;
        Ok(())
    }

    fn list_conversations(&self, inbox_id: i64) -> StoreResult<Vec<Conversation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE inbox_id = ?1 ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![inbox_id], map_conversation_row)?;

        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row?);
        }
        Ok(conversations)
    }

    fn find_message(&self, inbox_id: i64, source_id: &str) -> StoreResult<Option<Message>> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE inbox_id = ?1 AND source_id = ?2"
                ),
                params![inbox_id, source_id],
                map_message_row,
            )
            .optional()?)
    }

    fn insert_message(
        &self,
        message: &NewMessage,
        attachments: &[NewAttachment],
    ) -> StoreResult<Message> {
        let attributes = serde_json::to_string(&message.content_attributes)
            .map_err(|e| StoreError::Corrupt(format!("content_attributes: {e}")))?;

        let tx = self.immediate()?;
        tx.execute(
            "INSERT INTO messages (
                inbox_id, conversation_id, sender_contact_id, source_id, message_type, content,
                content_attributes, in_reply_to, in_reply_to_external_id, is_unsupported, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                message.inbox_id,
                message.conversation_id,
                message.sender_contact_id,
                message.source_id,
                message.message_type.as_str(),
                message.content,
                attributes,
                message.in_reply_to,
                message.in_reply_to_external_id,
                i64::from(message.is_unsupported),
                format_ts(message.created_at),
            ],
        )?;
        let message_id = tx.last_insert_rowid();

        for attachment in attachments {
            let byte_size = i64::try_from(attachment.data.len())
                .map_err(|_| StoreError::Corrupt("attachment size overflows i64".into()))?;
            tx.execute(
                "INSERT INTO attachments (message_id, file_name, mime_type, byte_size, data)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    message_id,
                    attachment.file_name,
                    attachment.mime_type,
                    byte_size,
                    attachment.data
                ],
            )?;
        }
        tx.commit()?;

        Ok(Message {
            id: message_id,
            inbox_id: message.inbox_id,
            conversation_id: message.conversation_id,
            sender_contact_id: message.sender_contact_id,
            source_id: message.source_id.clone(),
            message_type: message.message_type,
            content: message.content.clone(),
            content_attributes: message.content_attributes.clone(),
            in_reply_to: message.in_reply_to,
            in_reply_to_external_id: message.in_reply_to_external_id.clone(),
            is_unsupported: message.is_unsupported,
            created_at: message.created_at,
        })
    }

    fn list_messages(&self, conversation_id: i64) -> StoreResult<Vec<Message>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = ?1
             ORDER BY created_at ASC, id ASC"
        ))?;
        let rows = stmt.query_map(params![conversation_id], map_message_row)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    fn attachments_for(&self, message_id: i64) -> StoreResult<Vec<Attachment>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE message_id = ?1 ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![message_id], |row| {
            Ok(Attachment {
                id: row.get(0)?,
                message_id: row.get(1)?,
                file_name: row.get(2)?,
                mime_type: row.get(3)?,
                byte_size: row.get(4)?,
                data: row.get(5)?,
            })
        })?;

        let mut attachments = Vec::new();
        for row in rows {
            attachments.push(row?);
        }
        Ok(attachments)
    }
}

/// Fixed-width UTC timestamps so text comparison matches time order.
fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_rfc3339(raw: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid RFC3339 timestamp in inbound DB: {raw}"))?;
    Ok(parsed.with_timezone(&Utc))
}

fn sql_conversion_error(err: anyhow::Error) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(err.into())
}

fn timestamp_column(row: &Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    parse_rfc3339(&row.get::<_, String>(index)?).map_err(sql_conversion_error)
}

fn map_inbox_row(row: &Row<'_>) -> rusqlite::Result<Inbox> {
    Ok(Inbox {
        id: row.get(0)?,
        account_id: row.get(1)?,
        name: row.get(2)?,
        verify_token: row.get(3)?,
        created_at: timestamp_column(row, 4)?,
    })
}

fn map_contact_row(row: &Row<'_>) -> rusqlite::Result<Contact> {
    Ok(Contact {
        id: row.get(0)?,
        account_id: row.get(1)?,
        name: row.get(2)?,
        phone_number: row.get(3)?,
        identifier: row.get(4)?,
        created_at: timestamp_column(row, 5)?,
    })
}

fn map_contact_inbox_row(row: &Row<'_>) -> rusqlite::Result<ContactInbox> {
    Ok(ContactInbox {
        id: row.get(0)?,
        contact_id: row.get(1)?,
        inbox_id: row.get(2)?,
        source_id: row.get(3)?,
        created_at: timestamp_column(row, 4)?,
    })
}

fn map_conversation_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        account_id: row.get(1)?,
        inbox_id: row.get(2)?,
        contact_id: row.get(3)?,
        contact_inbox_id: row.get(4)?,
        created_at: timestamp_column(row, 5)?,
        last_activity_at: timestamp_column(row, 6)?,
    })
}

fn map_message_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let type_raw: String = row.get(5)?;
    let message_type = MessageType::parse(&type_raw)
        .ok_or_else(|| anyhow::anyhow!("Unknown message type: {type_raw}"))
        .map_err(sql_conversion_error)?;

    let attributes_raw: String = row.get(7)?;
    let content_attributes = serde_json::from_str::<serde_json::Value>(&attributes_raw)
        .context("Invalid content_attributes JSON")
        .map_err(sql_conversion_error)?;

    Ok(Message {
        id: row.get(0)?,
        inbox_id: row.get(1)?,
        conversation_id: row.get(2)?,
        sender_contact_id: row.get(3)?,
        source_id: row.get(4)?,
        message_type,
        content: row.get(6)?,
        content_attributes,
        in_reply_to: row.get(8)?,
        in_reply_to_external_id: row.get(9)?,
        is_unsupported: row.get::<_, i64>(10)? != 0,
        created_at: timestamp_column(row, 11)?,
    })
}
