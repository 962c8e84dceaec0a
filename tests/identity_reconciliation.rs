//! Phone/LID reconciliation through full ingestion, including races between
//! independent connections on one database file.

use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use wa_inbound::clock::FixedClock;
use wa_inbound::media::{MediaFetchError, MediaFetcher, MediaRequest};
use wa_inbound::payload::EventEnvelope;
use wa_inbound::store::{Contact, Inbox, InboxStore, NewContact, SqliteStore};
use wa_inbound::{Ingestor, MessageOutcome};

const PHONE: &str = "5511912345678";
const LID: &str = "12345678";

struct NoMedia;

impl MediaFetcher for NoMedia {
    fn fetch(&self, request: &MediaRequest<'_>) -> Result<Vec<u8>, MediaFetchError> {
        Err(MediaFetchError::MissingUrl {
            message_id: request.message_id.to_string(),
        })
    }
}

fn clock() -> FixedClock {
    FixedClock(Utc.with_ymd_and_hms(2026, 3, 5, 12, 0, 0).unwrap())
}

fn open(path: &Path) -> SqliteStore {
    SqliteStore::open(path, Duration::from_secs(10)).unwrap()
}

fn workspace() -> (TempDir, PathBuf, Inbox) {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("inbound.db");
    let inbox = open(&path).create_inbox(1, "whatsapp", None).unwrap();
    (tmp, path, inbox)
}

fn lid_addressed(id: &str) -> Value {
    json!({
        "key": {
            "id": id,
            "remoteJid": format!("{LID}@lid"),
            "remoteJidAlt": format!("{PHONE}@s.whatsapp.net"),
            "fromMe": false,
            "addressingMode": "lid"
        },
        "pushName": "John Doe",
        "messageTimestamp": 1_772_700_000,
        "message": { "conversation": "Hello" }
    })
}

fn upsert(messages: Vec<Value>) -> EventEnvelope {
    serde_json::from_value(json!({
        "event": "messages.upsert",
        "data": { "type": "notify", "messages": messages }
    }))
    .unwrap()
}

fn ingest(store: &SqliteStore, inbox: &Inbox, envelope: &EventEnvelope) -> Vec<MessageOutcome> {
    Ingestor::new(store, &NoMedia, &clock())
        .ingest(inbox, envelope)
        .unwrap()
}

fn contact(
    store: &SqliteStore,
    inbox: &Inbox,
    phone: Option<&str>,
    identifier: Option<&str>,
    source_id: &str,
) -> Contact {
    store
        .create_contact_with_inbox(
            &NewContact {
                account_id: inbox.account_id,
                name: Some("Original Contact".into()),
                phone_number: phone.map(str::to_string),
                identifier: identifier.map(str::to_string),
            },
            inbox.id,
            source_id,
        )
        .unwrap()
        .0
}

fn sender_of(store: &SqliteStore, inbox: &Inbox, source_id: &str) -> i64 {
    store
        .find_message(inbox.id, source_id)
        .unwrap()
        .unwrap()
        .sender_contact_id
        .unwrap()
}

#[test]
fn phone_binding_moves_to_lid() {
    let (_tmp, path, inbox) = workspace();
    let store = open(&path);
    let existing = contact(&store, &inbox, Some(&format!("+{PHONE}")), None, PHONE);

    ingest(&store, &inbox, &upsert(vec![lid_addressed("msg_123")]));

    let binding = store.find_contact_inbox(inbox.id, LID).unwrap().unwrap();
    assert_eq!(binding.contact_id, existing.id);
    assert!(store.find_contact_inbox(inbox.id, PHONE).unwrap().is_none());

    let promoted = store.find_contact(existing.id).unwrap().unwrap();
    assert_eq!(promoted.identifier.as_deref(), Some("12345678@lid"));
    assert_eq!(promoted.phone_number.as_deref(), Some("+5511912345678"));
    assert_eq!(sender_of(&store, &inbox, "msg_123"), existing.id);
}

#[test]
fn identifier_taken_by_other_contact_routes_to_owner() {
    let (_tmp, path, inbox) = workspace();
    let store = open(&path);
    let original = contact(&store, &inbox, None, None, PHONE);
    let owner = contact(
        &store,
        &inbox,
        Some(&format!("+{PHONE}")),
        Some(&format!("{LID}@lid")),
        LID,
    );

    let outcomes = ingest(&store, &inbox, &upsert(vec![lid_addressed("msg_123")]));
    assert!(matches!(
        &outcomes[0],
        MessageOutcome::Created { contact_id, .. } if *contact_id == owner.id
    ));

    let untouched = store.find_contact_inbox(inbox.id, PHONE).unwrap().unwrap();
    assert_eq!(untouched.contact_id, original.id);
    assert!(store
        .find_contact(original.id)
        .unwrap()
        .unwrap()
        .identifier
        .is_none());

    let message = store.find_message(inbox.id, "msg_123").unwrap().unwrap();
    assert_eq!(message.sender_contact_id, Some(owner.id));
    let conversations = store.list_conversations(inbox.id).unwrap();
    let conversation = conversations
        .iter()
        .find(|c| c.id == message.conversation_id)
        .unwrap();
    assert_eq!(conversation.contact_id, owner.id);
}

#[test]
fn phone_taken_by_other_contact_leaves_original_unpromoted() {
    let (_tmp, path, inbox) = workspace();
    let store = open(&path);
    let original = contact(&store, &inbox, None, None, PHONE);
    contact(
        &store,
        &inbox,
        Some(&format!("+{PHONE}")),
        Some("99999999@lid"),
        "99999999",
    );

    let outcomes = ingest(&store, &inbox, &upsert(vec![lid_addressed("msg_123")]));
    assert!(matches!(outcomes[0], MessageOutcome::Created { .. }));

    let original = store.find_contact(original.id).unwrap().unwrap();
    assert!(original.phone_number.is_none());
    assert!(original.identifier.is_none());
    assert!(store.find_contact_inbox(inbox.id, PHONE).unwrap().is_some());
    assert_eq!(sender_of(&store, &inbox, "msg_123"), original.id);
}

#[test]
fn existing_lid_binding_wins_over_phone_binding() {
    let (_tmp, path, inbox) = workspace();
    let store = open(&path);
    let original = contact(&store, &inbox, None, None, PHONE);
    let lid_contact = contact(
        &store,
        &inbox,
        Some(&format!("+{PHONE}")),
        Some(&format!("{LID}@lid")),
        LID,
    );

    ingest(&store, &inbox, &upsert(vec![lid_addressed("msg_123")]));

    assert_eq!(sender_of(&store, &inbox, "msg_123"), lid_contact.id);
    assert_eq!(
        store
            .find_contact_inbox(inbox.id, PHONE)
            .unwrap()
            .unwrap()
            .contact_id,
        original.id
    );
}

#[test]
fn concurrent_redelivery_stores_one_message() {
    const WORKERS: usize = 6;
    let (_tmp, path, inbox) = workspace();
    let envelope = Arc::new(upsert(vec![lid_addressed("msg_race")]));
    let barrier = Arc::new(Barrier::new(WORKERS));

    let handles: Vec<_> = (0..WORKERS)
        .map(|_| {
            let path = path.clone();
            let inbox = inbox.clone();
            let envelope = Arc::clone(&envelope);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let store = open(&path);
                barrier.wait();
                ingest(&store, &inbox, &envelope)
            })
        })
        .collect();

    let outcomes: Vec<MessageOutcome> = handles
        .into_iter()
        .flat_map(|handle| handle.join().unwrap())
        .collect();

    let created = outcomes
        .iter()
        .filter(|o| matches!(o, MessageOutcome::Created { .. }))
        .count();
    let duplicates = outcomes
        .iter()
        .filter(|o| matches!(o, MessageOutcome::Duplicate { .. }))
        .count();
    assert_eq!(created, 1, "outcomes: {outcomes:?}");
    assert_eq!(duplicates, WORKERS - 1, "outcomes: {outcomes:?}");

    let store = open(&path);
    assert_eq!(store.list_contacts(inbox.account_id).unwrap().len(), 1);
    assert_eq!(store.list_contact_inboxes(inbox.id).unwrap().len(), 1);
    assert_eq!(store.list_conversations(inbox.id).unwrap().len(), 1);
}

#[test]
fn concurrent_first_messages_share_one_contact() {
    const WORKERS: usize = 4;
    let (_tmp, path, inbox) = workspace();
    let barrier = Arc::new(Barrier::new(WORKERS));

    let handles: Vec<_> = (0..WORKERS)
        .map(|n| {
            let path = path.clone();
            let inbox = inbox.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let store = open(&path);
                let envelope = upsert(vec![lid_addressed(&format!("msg_{n}"))]);
                barrier.wait();
                ingest(&store, &inbox, &envelope)
            })
        })
        .collect();

    for handle in handles {
        let outcomes = handle.join().unwrap();
        assert!(
            matches!(outcomes[0], MessageOutcome::Created { .. }),
            "unexpected outcome {outcomes:?}"
        );
    }

    let store = open(&path);
    let contacts = store.list_contacts(inbox.account_id).unwrap();
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].identifier.as_deref(), Some("12345678@lid"));

    let conversations = store.list_conversations(inbox.id).unwrap();
    assert_eq!(conversations.len(), 1);
    assert_eq!(store.list_messages(conversations[0].id).unwrap().len(), WORKERS);
}

#[test]
fn phone_only_delivery_after_promotion_stays_in_one_conversation() {
    let (_tmp, path, inbox) = workspace();
    let store = open(&path);
    let phone_only = json!({
        "key": {
            "id": "msg_phone_only",
            "remoteJid": format!("{PHONE}@s.whatsapp.net"),
            "fromMe": false
        },
        "pushName": "John Doe",
        "messageTimestamp": 1_772_700_060,
        "message": { "conversation": "Following up" }
    });

    ingest(&store, &inbox, &upsert(vec![lid_addressed("msg_lid")]));
    ingest(&store, &inbox, &upsert(vec![phone_only]));

    assert_eq!(store.list_contacts(inbox.account_id).unwrap().len(), 1);
    let bindings = store.list_contact_inboxes(inbox.id).unwrap();
    assert_eq!(bindings.len(), 1);
    assert_eq!(bindings[0].source_id, LID);

    let conversations = store.list_conversations(inbox.id).unwrap();
    assert_eq!(conversations.len(), 1);
    let first = store.find_message(inbox.id, "msg_lid").unwrap().unwrap();
    let second = store.find_message(inbox.id, "msg_phone_only").unwrap().unwrap();
    assert_eq!(first.conversation_id, second.conversation_id);
    assert_eq!(first.sender_contact_id, second.sender_contact_id);
}

#[test]
fn contact_known_by_phone_elsewhere_gains_lid_identifier() {
    let (_tmp, path, first_inbox) = workspace();
    let store = open(&path);
    let existing = contact(&store, &first_inbox, Some(&format!("+{PHONE}")), None, PHONE);
    let second_inbox = store.create_inbox(1, "whatsapp-2", None).unwrap();

    ingest(&store, &second_inbox, &upsert(vec![lid_addressed("msg_123")]));

    let binding = store
        .find_contact_inbox(second_inbox.id, LID)
        .unwrap()
        .unwrap();
    assert_eq!(binding.contact_id, existing.id);
    let updated = store.find_contact(existing.id).unwrap().unwrap();
    assert_eq!(updated.identifier.as_deref(), Some("12345678@lid"));
    assert_eq!(updated.phone_number.as_deref(), Some("+5511912345678"));
    assert_eq!(store.list_contacts(1).unwrap().len(), 1);
}

#[test]
fn concurrent_lid_deliveries_promote_phone_binding_once() {
    const WORKERS: usize = 8;
    let (_tmp, path, inbox) = workspace();
    let existing = contact(&open(&path), &inbox, Some(&format!("+{PHONE}")), None, PHONE);
    let barrier = Arc::new(Barrier::new(WORKERS));

    let handles: Vec<_> = (0..WORKERS)
        .map(|n| {
            let path = path.clone();
            let inbox = inbox.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let store = open(&path);
                let envelope = upsert(vec![lid_addressed(&format!("msg_promote_{n}"))]);
                barrier.wait();
                ingest(&store, &inbox, &envelope)
            })
        })
        .collect();

    for handle in handles {
        let outcomes = handle.join().unwrap();
        assert!(
            matches!(
                &outcomes[0],
                MessageOutcome::Created { contact_id, .. } if *contact_id == existing.id
            ),
            "unexpected outcome {outcomes:?}"
        );
    }

    let store = open(&path);
    let bindings = store.list_contact_inboxes(inbox.id).unwrap();
    assert_eq!(bindings.len(), 1);
    assert_eq!(bindings[0].source_id, LID);
    assert_eq!(bindings[0].contact_id, existing.id);

    let contacts = store.list_contacts(inbox.account_id).unwrap();
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].identifier.as_deref(), Some("12345678@lid"));

    let conversations = store.list_conversations(inbox.id).unwrap();
    assert_eq!(conversations.len(), 1);
    assert_eq!(store.list_messages(conversations[0].id).unwrap().len(), WORKERS);
}
