//! Identity reconciliation: map sender addressing onto one contact, its
//! inbox binding and an open conversation.
//!
//! No locks are taken. Every write is attempted optimistically and a
//! [`StoreError::Conflict`] means another delivery got there first, so the
//! current row is re-read and used instead.

pub mod addressing;

pub use addressing::{AddressingError, AddressingMode, SenderAddressing};

use crate::store::{
    Contact, ContactInbox, ContactPromotion, Conversation, Inbox, InboxStore, NewContact,
    NewConversation, StoreError, StoreResult,
};
use chrono::{DateTime, Utc};

/// Bound on create-then-reselect rounds before giving up on a sender.
const MAX_RESOLVE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub contact: Contact,
    pub contact_inbox: ContactInbox,
    pub conversation: Conversation,
}

pub struct IdentityResolver<'a> {
    store: &'a dyn InboxStore,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(store: &'a dyn InboxStore) -> Self {
        Self { store }
    }

    /// Resolve the sender to `(Contact, ContactInbox, Conversation)`.
    ///
    /// `display_name` names a newly created contact; `activity_at` stamps a
    /// newly opened conversation.
    pub fn resolve(
        &self,
        inbox: &Inbox,
        sender: &SenderAddressing,
        display_name: Option<&str>,
        activity_at: DateTime<Utc>,
    ) -> StoreResult<ResolvedIdentity> {
        let (contact, contact_inbox) = self.resolve_contact_inbox(inbox, sender, display_name)?;
        let conversation = self.resolve_conversation(inbox, &contact_inbox, activity_at)?;
        Ok(ResolvedIdentity {
            contact,
            contact_inbox,
            conversation,
        })
    }

    fn resolve_contact_inbox(
        &self,
        inbox: &Inbox,
        sender: &SenderAddressing,
        display_name: Option<&str>,
    ) -> StoreResult<(Contact, ContactInbox)> {
        for attempt in 1..=MAX_RESOLVE_ATTEMPTS {
            if let Some(found) = self.find_existing(inbox, sender)? {
                return Ok(found);
            }

            match self.create_binding(inbox, sender, display_name) {
                Ok(created) => return Ok(created),
                Err(StoreError::Conflict(detail)) => {
                    tracing::warn!(
                        inbox_id = inbox.id,
                        attempt,
                        "Concurrent contact creation for {sender}: {detail}; reselecting"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(StoreError::Conflict(format!(
            "could not settle contact for {sender} after {MAX_RESOLVE_ATTEMPTS} attempts"
        )))
    }

    /// Lookup by LID, then by phone with promotion onto the LID.
    fn find_existing(
        &self,
        inbox: &Inbox,
        sender: &SenderAddressing,
    ) -> StoreResult<Option<(Contact, ContactInbox)>> {
        if let Some(found) = self.find_by_lid(inbox, sender)? {
            return Ok(Some(found));
        }

        let Some(phone) = sender.phone.as_deref() else {
            return Ok(None);
        };
        let Some(phone_binding) = self.store.find_contact_inbox(inbox.id, phone)? else {
            return Ok(None);
        };
        let phone_contact = self.contact_of(&phone_binding)?;

        let (Some(lid), Some(identifier)) = (sender.lid.as_deref(), sender.identifier()) else {
            return Ok(Some((phone_contact, phone_binding)));
        };

        if let Some(owner) = self
            .store
            .find_contact_by_identifier(inbox.account_id, &identifier)?
            .filter(|owner| owner.id != phone_contact.id)
        {
            tracing::debug!(
                inbox_id = inbox.id,
                owner_id = owner.id,
                phone_contact_id = phone_contact.id,
                "LID {identifier} already belongs to another contact; leaving phone binding as is"
            );
            return self
                .attach_lid_owner(inbox, sender, owner, lid, (phone_contact, phone_binding))
                .map(Some);
        }

        self.promote(inbox, sender, phone_contact, phone_binding, lid, identifier)
            .map(Some)
    }

    fn find_by_lid(
        &self,
        inbox: &Inbox,
        sender: &SenderAddressing,
    ) -> StoreResult<Option<(Contact, ContactInbox)>> {
        let Some(lid) = sender.lid.as_deref() else {
            return Ok(None);
        };
        match self.store.find_contact_inbox(inbox.id, lid)? {
            Some(binding) => Ok(Some((self.contact_of(&binding)?, binding))),
            None => Ok(None),
        }
    }

    /// Give the contact that already owns `{lid}@lid` a binding in this inbox.
    fn attach_lid_owner(
        &self,
        inbox: &Inbox,
        sender: &SenderAddressing,
        owner: Contact,
        lid: &str,
        phone_pair: (Contact, ContactInbox),
    ) -> StoreResult<(Contact, ContactInbox)> {
        match self.store.create_contact_inbox(owner.id, inbox.id, lid) {
            Ok(binding) => Ok((owner, binding)),
            Err(StoreError::Conflict(detail)) => {
                tracing::warn!(
                    inbox_id = inbox.id,
                    "LID binding for {sender} created concurrently: {detail}"
                );
                Ok(self.find_by_lid(inbox, sender)?.unwrap_or(phone_pair))
            }
            Err(e) => Err(e),
        }
    }

    /// Move the phone-keyed binding onto the LID and stamp the contact's
    /// identifier, atomically. A conflict means someone else claimed the LID
    /// first; use their binding, or stay on the phone one.
    fn promote(
        &self,
        inbox: &Inbox,
        sender: &SenderAddressing,
        contact: Contact,
        binding: ContactInbox,
        lid: &str,
        identifier: String,
    ) -> StoreResult<(Contact, ContactInbox)> {
        let promotion = ContactPromotion {
            contact_inbox_id: binding.id,
            from_source_id: binding.source_id.clone(),
            to_source_id: lid.to_string(),
            contact_id: contact.id,
            identifier,
            phone_number: sender.e164_phone(),
        };

        match self.store.promote_contact_inbox(&promotion) {
            Ok(()) => {
                tracing::info!(
                    inbox_id = inbox.id,
                    contact_id = contact.id,
                    "Promoted contact inbox {} from phone to LID {}",
                    binding.id,
                    promotion.to_source_id
                );
                let contact = self.store.find_contact(contact.id)?.unwrap_or(contact);
                let binding = ContactInbox {
                    source_id: promotion.to_source_id,
                    ..binding
                };
                Ok((contact, binding))
            }
            Err(StoreError::Conflict(detail)) => {
                tracing::warn!(
                    inbox_id = inbox.id,
                    contact_id = contact.id,
                    "Skipped LID promotion for {sender}: {detail}"
                );
                Ok(self
                    .find_by_lid(inbox, sender)?
                    .unwrap_or((contact, binding)))
            }
            Err(e) => Err(e),
        }
    }

    /// No binding in this inbox yet. Reuse an account contact that already
    /// carries the identifier or phone, else create one.
    fn create_binding(
        &self,
        inbox: &Inbox,
        sender: &SenderAddressing,
        display_name: Option<&str>,
    ) -> StoreResult<(Contact, ContactInbox)> {
        let source_id = sender.primary_source_id();
        let identifier = sender.identifier();
        let phone_number = sender.e164_phone();

        let existing = match identifier.as_deref() {
            Some(identifier) => self
                .store
                .find_contact_by_identifier(inbox.account_id, identifier)?,
            None => None,
        };
        let existing = match (existing, phone_number.as_deref()) {
            (Some(contact), _) => Some(contact),
            (None, Some(phone)) => self.store.find_contact_by_phone(inbox.account_id, phone)?,
            (None, None) => None,
        };

        if let Some(contact) = existing {
            let binding = match self
                .store
                .find_contact_inbox_for_contact(inbox.id, contact.id)?
            {
                Some(binding) => binding,
                None => {
                    let binding = self
                        .store
                        .create_contact_inbox(contact.id, inbox.id, source_id)?;
                    tracing::debug!(
                        inbox_id = inbox.id,
                        contact_id = contact.id,
                        "Bound existing contact to inbox via {source_id}"
                    );
                    binding
                }
            };
            let contact = self.fill_addressing(
                inbox,
                sender,
                contact,
                identifier.as_deref(),
                phone_number.as_deref(),
            )?;
            return Ok((contact, binding));
        }

        let name = display_name
            .map(str::to_string)
            .or_else(|| phone_number.clone())
            .or_else(|| sender.lid.clone());
        let created = self.store.create_contact_with_inbox(
            &NewContact {
                account_id: inbox.account_id,
                name,
                phone_number,
                identifier,
            },
            inbox.id,
            source_id,
        )?;
        tracing::info!(
            inbox_id = inbox.id,
            contact_id = created.0.id,
            "Created contact for {sender}"
        );
        Ok(created)
    }

    /// Stamp whichever of identifier and phone the reused contact lacks.
    /// Another contact already owning one of them leaves it unchanged.
    fn fill_addressing(
        &self,
        inbox: &Inbox,
        sender: &SenderAddressing,
        contact: Contact,
        identifier: Option<&str>,
        phone_number: Option<&str>,
    ) -> StoreResult<Contact> {
        let identifier = identifier.filter(|_| contact.identifier.is_none());
        let phone_number = phone_number.filter(|_| contact.phone_number.is_none());
        if identifier.is_none() && phone_number.is_none() {
            return Ok(contact);
        }

        match self
            .store
            .fill_contact_addressing(contact.id, identifier, phone_number)
        {
            Ok(()) => Ok(self.store.find_contact(contact.id)?.unwrap_or(contact)),
            Err(StoreError::Conflict(detail)) => {
                tracing::warn!(
                    inbox_id = inbox.id,
                    contact_id = contact.id,
                    "Left addressing of contact for {sender} unchanged: {detail}"
                );
                Ok(contact)
            }
            Err(e) => Err(e),
        }
    }

    fn resolve_conversation(
        &self,
        inbox: &Inbox,
        binding: &ContactInbox,
        activity_at: DateTime<Utc>,
    ) -> StoreResult<Conversation> {
        for _ in 0..MAX_RESOLVE_ATTEMPTS {
            if let Some(open) = self.store.find_open_conversation(binding.id)? {
                return Ok(open);
            }

            match self.store.create_conversation(&NewConversation {
                account_id: inbox.account_id,
                inbox_id: inbox.id,
                contact_id: binding.contact_id,
                contact_inbox_id: binding.id,
                created_at: activity_at,
            }) {
                Ok(conversation) => return Ok(conversation),
                Err(StoreError::Conflict(detail)) => {
                    tracing::warn!(
                        inbox_id = inbox.id,
                        contact_inbox_id = binding.id,
                        "Conversation opened concurrently: {detail}; reselecting"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(StoreError::Conflict(format!(
            "could not settle open conversation for contact inbox {}",
            binding.id
        )))
    }

    fn contact_of(&self, binding: &ContactInbox) -> StoreResult<Contact> {
        self.store
            .find_contact(binding.contact_id)?
            .ok_or_else(|| StoreError::NotFound {
                entity: "contact",
                key: binding.contact_id.to_string(),
            })
    }
}
