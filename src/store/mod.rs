//! Canonical records and the keyed-lookup store they live in.
//!
//! Every uniqueness rule the identity engine and persister rely on is
//! enforced by the backend; callers detect races through
//! [`StoreError::Conflict`] and re-read instead of locking.

pub mod sqlite;

pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write.
    #[error("uniqueness conflict: {0}")]
    Conflict(String),

    #[error("{entity} '{key}' not found")]
    NotFound { entity: &'static str, key: String },

    #[error("storage backend failure: {0}")]
    Backend(#[source] rusqlite::Error),

    #[error("corrupt stored record: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Infrastructure failures the caller should retry as a whole.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ffi;

        match err {
            rusqlite::Error::SqliteFailure(ref failure, ref message)
                if failure.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                let detail = message.clone().unwrap_or_else(|| failure.to_string());
                match failure.extended_code {
                    ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                        Self::Conflict(detail)
                    }
                    _ => Self::Corrupt(detail),
                }
            }
            rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::IntegralValueOutOfRange(..)
            | rusqlite::Error::ToSqlConversionFailure(_) => Self::Corrupt(err.to_string()),
            other => Self::Backend(other),
        }
    }
}

/// A provider connection owned by an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Inbox {
    pub id: i64,
    pub account_id: i64,
    pub name: String,
    #[serde(skip_serializing)]
    pub verify_token: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Contact {
    pub id: i64,
    pub account_id: i64,
    pub name: Option<String>,
    /// `+digits`; unique per account.
    pub phone_number: Option<String>,
    /// `{lid}@lid`; unique per account.
    pub identifier: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Binding of a contact to one inbox through a routing address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContactInbox {
    pub id: i64,
    pub contact_id: i64,
    pub inbox_id: i64,
    /// Bare phone or LID digits; unique per inbox.
    pub source_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conversation {
    pub id: i64,
    pub account_id: i64,
    pub inbox_id: i64,
    pub contact_id: i64,
    pub contact_inbox_id: i64,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Incoming,
    Outgoing,
}

impl MessageType {
    pub fn from_me(from_me: bool) -> Self {
        if from_me {
            Self::Outgoing
        } else {
            Self::Incoming
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Incoming => "incoming",
            Self::Outgoing => "outgoing",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "incoming" => Some(Self::Incoming),
            "outgoing" => Some(Self::Outgoing),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub id: i64,
    pub inbox_id: i64,
    pub conversation_id: i64,
    pub sender_contact_id: Option<i64>,
    /// Provider message id; unique per inbox.
    pub source_id: String,
    pub message_type: MessageType,
    pub content: Option<String>,
    pub content_attributes: Value,
    pub in_reply_to: Option<i64>,
    pub in_reply_to_external_id: Option<String>,
    pub is_unsupported: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn is_reaction(&self) -> bool {
        self.content_attributes
            .get("is_reaction")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attachment {
    pub id: i64,
    pub message_id: i64,
    pub file_name: String,
    pub mime_type: String,
    pub byte_size: i64,
    #[serde(skip_serializing)]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewContact {
    pub account_id: i64,
    pub name: Option<String>,
    pub phone_number: Option<String>,
    pub identifier: Option<String>,
}

/// Moves a phone-keyed binding onto a LID in one atomic step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactPromotion {
    pub contact_inbox_id: i64,
    /// Source id the binding is expected to still hold.
    pub from_source_id: String,
    pub to_source_id: String,
    pub contact_id: i64,
    pub identifier: String,
    /// Written only when the contact has no phone yet.
    pub phone_number: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConversation {
    pub account_id: i64,
    pub inbox_id: i64,
    pub contact_id: i64,
    pub contact_inbox_id: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub inbox_id: i64,
    pub conversation_id: i64,
    pub sender_contact_id: Option<i64>,
    pub source_id: String,
    pub message_type: MessageType,
    pub content: Option<String>,
    pub content_attributes: Value,
    pub in_reply_to: Option<i64>,
    pub in_reply_to_external_id: Option<String>,
    pub is_unsupported: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAttachment {
    pub file_name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// Keyed-lookup store with uniqueness-enforced writes.
///
/// Writes that would violate a uniqueness rule fail with
/// [`StoreError::Conflict`] and leave no partial state behind.
pub trait InboxStore {
    fn create_inbox(
        &self,
        account_id: i64,
        name: &str,
        verify_token: Option<&str>,
    ) -> StoreResult<Inbox>;

    fn find_inbox(&self, inbox_id: i64) -> StoreResult<Option<Inbox>>;

    fn list_inboxes(&self) -> StoreResult<Vec<Inbox>>;

    fn find_contact(&self, contact_id: i64) -> StoreResult<Option<Contact>>;

    fn find_contact_by_identifier(
        &self,
        account_id: i64,
        identifier: &str,
    ) -> StoreResult<Option<Contact>>;

    fn find_contact_by_phone(&self, account_id: i64, phone_number: &str)
        -> StoreResult<Option<Contact>>;

    fn list_contacts(&self, account_id: i64) -> StoreResult<Vec<Contact>>;

    fn find_contact_inbox(&self, inbox_id: i64, source_id: &str)
        -> StoreResult<Option<ContactInbox>>;

    /// Oldest binding `contact_id` holds in `inbox_id`, whatever its key.
    fn find_contact_inbox_for_contact(
        &self,
        inbox_id: i64,
        contact_id: i64,
    ) -> StoreResult<Option<ContactInbox>>;

    fn list_contact_inboxes(&self, inbox_id: i64) -> StoreResult<Vec<ContactInbox>>;

    /// Contact and its first binding, created together or not at all.
    fn create_contact_with_inbox(
        &self,
        contact: &NewContact,
        inbox_id: i64,
        source_id: &str,
    ) -> StoreResult<(Contact, ContactInbox)>;

    fn create_contact_inbox(
        &self,
        contact_id: i64,
        inbox_id: i64,
        source_id: &str,
    ) -> StoreResult<ContactInbox>;

    /// Fails with `Conflict` when the binding no longer holds
    /// `from_source_id` or the new keys are already owned.
    fn promote_contact_inbox(&self, promotion: &ContactPromotion) -> StoreResult<()>;

    /// Set `identifier` and `phone_number` where they are still NULL.
    /// Fails with `Conflict` when another contact of the account owns either.
    fn fill_contact_addressing(
        &self,
        contact_id: i64,
        identifier: Option<&str>,
        phone_number: Option<&str>,
    ) -> StoreResult<()>;

    fn find_open_conversation(&self, contact_inbox_id: i64) -> StoreResult<Option<Conversation>>;

    fn create_conversation(&self, conversation: &NewConversation) -> StoreResult<Conversation>;

    /// Advance `last_activity_at`; never moves it backwards.
    fn touch_conversation(&self, conversation_id: i64, at: DateTime<Utc>) -> StoreResult<()>;

    fn list_conversations(&self, inbox_id: i64) -> StoreResult<Vec<Conversation>>;

    fn find_message(&self, inbox_id: i64, source_id: &str) -> StoreResult<Option<Message>>;

    /// Message and attachments in one transaction.
    fn insert_message(
        &self,
        message: &NewMessage,
        attachments: &[NewAttachment],
    ) -> StoreResult<Message>;

    fn list_messages(&self, conversation_id: i64) -> StoreResult<Vec<Message>>;

    fn attachments_for(&self, message_id: i64) -> StoreResult<Vec<Attachment>>;
}
