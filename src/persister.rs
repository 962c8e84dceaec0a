//! Message persistence: one canonical message per `(inbox, source_id)`.

use crate::clock::{timestamp_or_now, Clock};
use crate::content::ClassifiedMessage;
use crate::media::{AttachmentResolver, MediaFetcher};
use crate::payload::RawMessage;
use crate::store::{
    Contact, Conversation, Inbox, InboxStore, Message, MessageType, NewAttachment, NewMessage,
    StoreError, StoreResult,
};
use crate::util::log_snippet;
use serde_json::{json, Value};

const LOG_CONTENT_CHARS: usize = 80;

#[derive(Debug, Clone, PartialEq)]
pub enum PersistOutcome {
    Created { message: Message, attachments: usize },
    /// Already stored by an earlier delivery.
    Duplicate(Message),
}

impl PersistOutcome {
    pub fn message(&self) -> &Message {
        match self {
            Self::Created { message, .. } | Self::Duplicate(message) => message,
        }
    }
}

pub struct MessagePersister<'a> {
    store: &'a dyn InboxStore,
    attachments: AttachmentResolver<'a>,
    clock: &'a dyn Clock,
}

impl<'a> MessagePersister<'a> {
    pub fn new(
        store: &'a dyn InboxStore,
        fetcher: &'a dyn MediaFetcher,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            store,
            attachments: AttachmentResolver::new(fetcher, clock),
            clock,
        }
    }

    /// Persist one classified message into `conversation`.
    ///
    /// `contact` is the resolved sender; outgoing messages carry no sender.
    pub fn persist(
        &self,
        inbox: &Inbox,
        conversation: &Conversation,
        contact: &Contact,
        classified: &ClassifiedMessage,
        raw: &RawMessage,
    ) -> StoreResult<PersistOutcome> {
        let source_id = raw.key.id.as_str();

        if let Some(existing) = self.store.find_message(inbox.id, source_id)? {
            tracing::debug!(inbox_id = inbox.id, "Message {source_id} already stored");
            return Ok(PersistOutcome::Duplicate(existing));
        }

        let message_type = MessageType::from_me(raw.key.from_me());
        let created_at = timestamp_or_now(raw.message_timestamp, self.clock);
        let (in_reply_to, in_reply_to_external_id) = self.reply_link(inbox, classified)?;
        let attachments = self.fetch_attachments(inbox, classified, source_id);

        let new_message = NewMessage {
            inbox_id: inbox.id,
            conversation_id: conversation.id,
            sender_contact_id: match message_type {
                MessageType::Incoming => Some(contact.id),
                MessageType::Outgoing => None,
            },
            source_id: source_id.to_string(),
            message_type,
            content: message_content(classified),
            content_attributes: content_attributes(classified),
            in_reply_to,
            in_reply_to_external_id,
            is_unsupported: classified.is_unsupported(),
            created_at,
        };

        let message = match self.store.insert_message(&new_message, &attachments) {
            Ok(message) => message,
            Err(StoreError::Conflict(detail)) => {
                tracing::debug!(
                    inbox_id = inbox.id,
                    "Message {source_id} inserted concurrently: {detail}"
                );
                return self
                    .store
                    .find_message(inbox.id, source_id)?
                    .map(PersistOutcome::Duplicate)
                    .ok_or(StoreError::Conflict(format!(
                        "message '{source_id}' conflicted but is not readable"
                    )));
            }
            Err(e) => return Err(e),
        };

        self.store.touch_conversation(conversation.id, created_at)?;

        tracing::info!(
            inbox_id = inbox.id,
            conversation_id = conversation.id,
            message_id = message.id,
            kind = classified.kind.as_str(),
            "Stored {} message {source_id}: {}",
            message_type.as_str(),
            log_snippet(message.content.as_deref().unwrap_or_default(), LOG_CONTENT_CHARS)
        );

        Ok(PersistOutcome::Created {
            message,
            attachments: attachments.len(),
        })
    }

    /// Inbox-scoped link to a reaction target or quoted message.
    ///
    /// Reactions link only to a stored target. A quoted reply keeps the
    /// external id even when the quoted message never reached this inbox.
    fn reply_link(
        &self,
        inbox: &Inbox,
        classified: &ClassifiedMessage,
    ) -> StoreResult<(Option<i64>, Option<String>)> {
        let Some(target_id) = classified.reply_target_id() else {
            return Ok((None, None));
        };

        match self.store.find_message(inbox.id, target_id)? {
            Some(target) => Ok((Some(target.id), Some(target.source_id))),
            None if classified.is_reaction() => {
                tracing::debug!(
                    inbox_id = inbox.id,
                    "Reaction target {target_id} not found; storing unlinked"
                );
                Ok((None, None))
            }
            None => Ok((None, Some(target_id.to_string()))),
        }
    }

    fn fetch_attachments(
        &self,
        inbox: &Inbox,
        classified: &ClassifiedMessage,
        source_id: &str,
    ) -> Vec<NewAttachment> {
        let Some(media) = classified.media.as_ref() else {
            return Vec::new();
        };

        match self.attachments.resolve(classified.kind, media, source_id) {
            Ok(resolved) => vec![NewAttachment {
                file_name: resolved.file_name,
                mime_type: resolved.mime_type,
                data: resolved.data,
            }],
            Err(e) => {
                tracing::warn!(
                    inbox_id = inbox.id,
                    "Storing message {source_id} without attachment: {e}"
                );
                Vec::new()
            }
        }
    }
}

fn message_content(classified: &ClassifiedMessage) -> Option<String> {
    if classified.is_unsupported() {
        return Some(String::new());
    }
    classified.content.clone()
}

fn content_attributes(classified: &ClassifiedMessage) -> Value {
    if classified.is_reaction() {
        json!({ "is_reaction": true })
    } else {
        json!({})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::content::normalize;
    use crate::media::{MediaFetchError, MediaRequest};
    use crate::store::{NewContact, NewConversation, SqliteStore};
    use chrono::{DateTime, Utc};
    use serde_json::json;

    struct StaticFetcher(Option<Vec<u8>>);

    impl MediaFetcher for StaticFetcher {
        fn fetch(&self, request: &MediaRequest<'_>) -> Result<Vec<u8>, MediaFetchError> {
            self.0.clone().ok_or_else(|| MediaFetchError::Status {
                url: request.url.unwrap_or_default().to_string(),
                status: 404,
            })
        }
    }

    struct Fixture {
        store: SqliteStore,
        inbox: Inbox,
        contact: Contact,
        conversation: Conversation,
        clock: FixedClock,
    }

    fn fixture() -> Fixture {
        let store = SqliteStore::open_in_memory().unwrap();
        let inbox = store.create_inbox(1, "whatsapp", None).unwrap();
        let (contact, binding) = store
            .create_contact_with_inbox(
                &NewContact {
                    account_id: 1,
                    name: None,
                    phone_number: Some("+5511".into()),
                    identifier: None,
                },
                inbox.id,
                "5511",
            )
            .unwrap();
        let clock = FixedClock(DateTime::from_timestamp(1_763_366_400, 0).unwrap());
        let conversation = store
            .create_conversation(&NewConversation {
                account_id: 1,
                inbox_id: inbox.id,
                contact_id: contact.id,
                contact_inbox_id: binding.id,
                created_at: clock.0,
            })
            .unwrap();
        Fixture {
            store,
            inbox,
            contact,
            conversation,
            clock,
        }
    }

    fn raw(id: &str, from_me: bool, message: Value) -> RawMessage {
        RawMessage::decode(&json!({
            "key": { "id": id, "remoteJid": "5511@s.whatsapp.net", "fromMe": from_me },
            "messageTimestamp": 1_763_370_000,
            "message": message
        }))
        .unwrap()
    }

    fn persist(f: &Fixture, fetcher: &dyn MediaFetcher, raw: &RawMessage) -> PersistOutcome {
        MessagePersister::new(&f.store, fetcher, &f.clock)
            .persist(
                &f.inbox,
                &f.conversation,
                &f.contact,
                &normalize(&raw.message),
                raw,
            )
            .unwrap()
    }

    #[test]
    fn text_message_is_created_once() {
        let f = fixture();
        let fetcher = StaticFetcher(None);
        let message = raw("m1", false, json!({ "conversation": "Hello" }));

        let first = persist(&f, &fetcher, &message);
        let PersistOutcome::Created { message: stored, .. } = &first else {
            panic!("expected created, got {first:?}");
        };
        assert_eq!(stored.content.as_deref(), Some("Hello"));
        assert_eq!(stored.message_type, MessageType::Incoming);
        assert_eq!(stored.sender_contact_id, Some(f.contact.id));
        assert_eq!(
            stored.created_at,
            DateTime::<Utc>::from_timestamp(1_763_370_000, 0).unwrap()
        );

        let second = persist(&f, &fetcher, &message);
        assert_eq!(second, PersistOutcome::Duplicate(stored.clone()));
        assert_eq!(f.store.list_messages(f.conversation.id).unwrap().len(), 1);
    }

    #[test]
    fn from_me_is_outgoing_without_sender() {
        let f = fixture();
        let outcome = persist(
            &f,
            &StaticFetcher(None),
            &raw("m1", true, json!({ "conversation": "sent from phone" })),
        );
        assert_eq!(outcome.message().message_type, MessageType::Outgoing);
        assert_eq!(outcome.message().sender_contact_id, None);
    }

    #[test]
    fn media_failure_still_stores_message() {
        let f = fixture();
        let outcome = persist(
            &f,
            &StaticFetcher(None),
            &raw(
                "img",
                false,
                json!({ "imageMessage": { "caption": "pic", "mimetype": "image/jpeg", "url": "https://x" } }),
            ),
        );
        let PersistOutcome::Created {
            message,
            attachments,
        } = outcome
        else {
            panic!("expected created");
        };
        assert_eq!(attachments, 0);
        assert_eq!(message.content.as_deref(), Some("pic"));
        assert!(f.store.attachments_for(message.id).unwrap().is_empty());
    }

    #[test]
    fn unsupported_message_is_flagged() {
        let f = fixture();
        let outcome = persist(
            &f,
            &StaticFetcher(Some(vec![1])),
            &raw("s1", false, json!({ "stickerMessage": { "url": "https://x" } })),
        );
        let message = outcome.message();
        assert!(message.is_unsupported);
        assert_eq!(message.content.as_deref(), Some(""));
        assert!(f.store.attachments_for(message.id).unwrap().is_empty());
    }

    #[test]
    fn reaction_links_to_stored_target() {
        let f = fixture();
        let fetcher = StaticFetcher(None);
        let target = persist(
            &f,
            &fetcher,
            &raw("original_msg_id", false, json!({ "conversation": "hi" })),
        );

        let reaction = persist(
            &f,
            &fetcher,
            &raw(
                "r1",
                false,
                json!({ "reactionMessage": { "text": "👍", "key": { "id": "original_msg_id" } } }),
            ),
        );
        let reaction = reaction.message();
        assert_eq!(reaction.content.as_deref(), Some("👍"));
        assert_eq!(reaction.in_reply_to, Some(target.message().id));
        assert_eq!(
            reaction.in_reply_to_external_id.as_deref(),
            Some("original_msg_id")
        );
        assert!(reaction.is_reaction());
    }

    #[test]
    fn reaction_without_target_is_unlinked() {
        let f = fixture();
        let outcome = persist(
            &f,
            &StaticFetcher(None),
            &raw(
                "r1",
                false,
                json!({ "reactionMessage": { "text": "👍", "key": { "id": "missing" } } }),
            ),
        );
        let message = outcome.message();
        assert!(message.is_reaction());
        assert_eq!(message.in_reply_to, None);
        assert_eq!(message.in_reply_to_external_id, None);
    }

    #[test]
    fn quoted_reply_keeps_external_id() {
        let f = fixture();
        let outcome = persist(
            &f,
            &StaticFetcher(None),
            &raw(
                "q1",
                false,
                json!({ "extendedTextMessage": { "text": "re", "contextInfo": { "stanzaId": "elsewhere" } } }),
            ),
        );
        let message = outcome.message();
        assert_eq!(message.in_reply_to, None);
        assert_eq!(message.in_reply_to_external_id.as_deref(), Some("elsewhere"));
        assert!(!message.is_reaction());
    }

    #[test]
    fn message_activity_advances_conversation() {
        let f = fixture();
        persist(
            &f,
            &StaticFetcher(None),
            &raw("m1", false, json!({ "conversation": "Hello" })),
        );
        let conversation = f
            .store
            .find_open_conversation(f.conversation.contact_inbox_id)
            .unwrap()
            .unwrap();
        assert_eq!(
            conversation.last_activity_at,
            DateTime::<Utc>::from_timestamp(1_763_370_000, 0).unwrap()
        );
    }
}
