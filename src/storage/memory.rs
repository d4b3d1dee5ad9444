//! In-memory storage backend.
//!
//! This module provides a thread-safe in-memory implementation of [`ContactStore`].
//! It is intended for embedded usage, tests, and as a reference implementation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};

use crate::contact::{Contact, ContactId, LinkageUpdate, NewContact};
use crate::storage::traits::{ContactStore, StorageError};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

fn index_insert(index: &mut HashMap<String, BTreeSet<ContactId>>, key: Option<&String>, id: ContactId) {
    if let Some(key) = key {
        index.entry(key.clone()).or_default().insert(id);
    }
}

fn index_remove(index: &mut HashMap<String, BTreeSet<ContactId>>, key: Option<&String>, id: ContactId) {
    let Some(key) = key else {
        return;
    };
    if let Some(set) = index.get_mut(key) {
        set.remove(&id);
        if set.is_empty() {
            index.remove(key);
        }
    }
}

#[derive(Debug, Default)]
struct ContactState {
    by_id: BTreeMap<ContactId, Contact>,
    by_email: HashMap<String, BTreeSet<ContactId>>,
    by_phone: HashMap<String, BTreeSet<ContactId>>,
    by_linked: HashMap<ContactId, BTreeSet<ContactId>>,
    next_id: u64,
    last_created_at: Option<DateTime<Utc>>,
}

impl ContactState {
    /// `created_at` is strictly increasing so id order and seniority agree.
    fn next_created_at(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_created_at {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_created_at = Some(ts);
        ts
    }

    fn unindex(&mut self, contact: &Contact) {
        index_remove(&mut self.by_email, contact.email.as_ref(), contact.id);
        index_remove(&mut self.by_phone, contact.phone_number.as_ref(), contact.id);
        if let Some(linked) = contact.linked_id {
            if let Some(set) = self.by_linked.get_mut(&linked) {
                set.remove(&contact.id);
                if set.is_empty() {
                    self.by_linked.remove(&linked);
                }
            }
        }
    }

    fn index(&mut self, contact: &Contact) {
        index_insert(&mut self.by_email, contact.email.as_ref(), contact.id);
        index_insert(&mut self.by_phone, contact.phone_number.as_ref(), contact.id);
        if let Some(linked) = contact.linked_id {
            self.by_linked.entry(linked).or_default().insert(contact.id);
        }
    }

    fn collect_sorted<'a>(&self, ids: impl IntoIterator<Item = &'a ContactId>) -> Vec<Contact> {
        let mut out: Vec<Contact> = ids
            .into_iter()
            .filter_map(|id| self.by_id.get(id))
            .filter(|c| c.is_active())
            .cloned()
            .collect();
        out.sort_by_key(Contact::seniority);
        out
    }
}

/// Thread-safe in-memory contact store.
#[derive(Debug, Default)]
pub struct InMemoryContactStore {
    state: RwLock<ContactState>,
}

impl InMemoryContactStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of rows, soft-deleted ones included.
    pub fn total_rows(&self) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("contact.total_rows"))?;
        Ok(state.by_id.len())
    }
}

impl ContactStore for InMemoryContactStore {
    fn create_contact(&self, fields: NewContact) -> Result<Contact, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("contact.create"))?;
        state.next_id += 1;
        let id = ContactId::new(state.next_id);

        let created_at = state.next_created_at();
        let contact = Contact {
            id,
            email: fields.email,
            phone_number: fields.phone_number,
            linked_id: fields.linked_id,
            link_precedence: fields.link_precedence,
            created_at,
            updated_at: created_at,
            deleted_at: None,
        };

        state.index(&contact);
        state.by_id.insert(id, contact.clone());
        Ok(contact)
    }

    fn find_by_id(&self, id: ContactId) -> Result<Option<Contact>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("contact.find_by_id"))?;
        Ok(state.by_id.get(&id).cloned())
    }

    fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>, StorageError> {
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("contact.find_by_email_or_phone"))?;

        let mut ids = BTreeSet::new();
        if let Some(set) = email.and_then(|e| state.by_email.get(e)) {
            ids.extend(set.iter().copied());
        }
        if let Some(set) = phone_number.and_then(|p| state.by_phone.get(p)) {
            ids.extend(set.iter().copied());
        }
        Ok(state.collect_sorted(&ids))
    }

    fn find_linked_to(&self, id: ContactId) -> Result<Vec<Contact>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("contact.find_linked_to"))?;
        let Some(ids) = state.by_linked.get(&id) else {
            return Ok(Vec::new());
        };
        Ok(state.collect_sorted(ids))
    }

    fn update_linkage(&self, id: ContactId, update: LinkageUpdate) -> Result<Contact, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("contact.update_linkage"))?;
        let prev = state
            .by_id
            .get(&id)
            .filter(|c| c.is_active())
            .cloned()
            .ok_or(StorageError::ContactNotFound(id))?;

        if update.is_empty() {
            return Ok(prev);
        }

        let mut next = prev.clone();
        if let Some(linked_id) = update.linked_id {
            next.linked_id = linked_id;
        }
        if let Some(precedence) = update.link_precedence {
            next.link_precedence = precedence;
        }
        if let Some(email) = update.email {
            next.email = email;
        }
        if let Some(phone_number) = update.phone_number {
            next.phone_number = phone_number;
        }
        next.updated_at = Utc::now().max(prev.updated_at);

        state.unindex(&prev);
        state.index(&next);
        state.by_id.insert(id, next.clone());
        Ok(next)
    }

    fn soft_delete(&self, id: ContactId) -> Result<Contact, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("contact.soft_delete"))?;
        let prev = state
            .by_id
            .get(&id)
            .cloned()
            .ok_or(StorageError::ContactNotFound(id))?;
        if !prev.is_active() {
            return Ok(prev);
        }

        let now = Utc::now().max(prev.updated_at);
        let mut next = prev.clone();
        next.deleted_at = Some(now);
        next.updated_at = now;

        state.unindex(&prev);
        state.by_id.insert(id, next.clone());
        Ok(next)
    }

    fn count(&self) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("contact.count"))?;
        Ok(state.by_id.values().filter(|c| c.is_active()).count())
    }

    fn list_primaries(&self) -> Result<Vec<Contact>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("contact.list_primaries"))?;
        let mut out: Vec<Contact> = state
            .by_id
            .values()
            .filter(|c| c.is_active() && c.is_primary())
            .cloned()
            .collect();
        out.sort_by_key(Contact::seniority);
        Ok(out)
    }

    fn list_active(&self) -> Result<Vec<Contact>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("contact.list_active"))?;
        Ok(state.collect_sorted(state.by_id.keys()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::LinkPrecedence;

    fn some(s: &str) -> Option<String> {
        Some(s.to_string())
    }

    #[test]
    fn create_assigns_increasing_ids_and_timestamps() {
        let store = InMemoryContactStore::new();
        let a = store.create_contact(NewContact::primary(some("a"), None)).unwrap();
        let b = store.create_contact(NewContact::primary(some("b"), None)).unwrap();
        assert!(a.id < b.id);
        assert!(a.created_at < b.created_at);
        assert_eq!(a.created_at, a.updated_at);
        assert!(a.deleted_at.is_none());
    }

    #[test]
    fn ids_are_never_reused_after_soft_delete() {
        let store = InMemoryContactStore::new();
        let a = store.create_contact(NewContact::primary(some("a"), None)).unwrap();
        store.soft_delete(a.id).unwrap();
        let b = store.create_contact(NewContact::primary(some("a"), None)).unwrap();
        assert_eq!(b.id.get(), a.id.get() + 1);
        assert_eq!(store.total_rows().unwrap(), 2);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn find_by_email_or_phone_unions_clauses_in_creation_order() {
        let store = InMemoryContactStore::new();
        let a = store.create_contact(NewContact::primary(some("a"), some("1"))).unwrap();
        let b = store.create_contact(NewContact::primary(some("b"), some("2"))).unwrap();
        let _c = store.create_contact(NewContact::primary(some("c"), some("3"))).unwrap();

        let found = store.find_by_email_or_phone(Some("b"), Some("1")).unwrap();
        let ids: Vec<_> = found.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);

        let only_phone = store.find_by_email_or_phone(None, Some("2")).unwrap();
        assert_eq!(only_phone.len(), 1);
        assert_eq!(only_phone[0].id, b.id);

        assert!(store.find_by_email_or_phone(None, None).unwrap().is_empty());
    }

    #[test]
    fn lookups_are_exact_match() {
        let store = InMemoryContactStore::new();
        store.create_contact(NewContact::primary(some("A@x.com"), None)).unwrap();
        assert!(store.find_by_email_or_phone(Some("a@x.com"), None).unwrap().is_empty());
        assert!(store.find_by_email_or_phone(Some(" A@x.com"), None).unwrap().is_empty());
        assert_eq!(store.find_by_email_or_phone(Some("A@x.com"), None).unwrap().len(), 1);
    }

    #[test]
    fn update_linkage_reindexes_links_and_attributes() {
        let store = InMemoryContactStore::new();
        let p1 = store.create_contact(NewContact::primary(some("a"), None)).unwrap();
        let p2 = store.create_contact(NewContact::primary(some("b"), None)).unwrap();
        let s = store
            .create_contact(NewContact::secondary(p2.id, some("c"), None))
            .unwrap();
        assert_eq!(store.find_linked_to(p2.id).unwrap().len(), 1);

        let moved = store.update_linkage(s.id, LinkageUpdate::link_to(p1.id)).unwrap();
        assert_eq!(moved.linked_id, Some(p1.id));
        assert!(store.find_linked_to(p2.id).unwrap().is_empty());
        assert_eq!(store.find_linked_to(p1.id).unwrap()[0].id, s.id);

        let update = LinkageUpdate {
            email: Some(some("d")),
            ..LinkageUpdate::default()
        };
        store.update_linkage(s.id, update).unwrap();
        assert!(store.find_by_email_or_phone(Some("c"), None).unwrap().is_empty());
        assert_eq!(store.find_by_email_or_phone(Some("d"), None).unwrap().len(), 1);
    }

    #[test]
    fn soft_deleted_contacts_disappear_from_listings() {
        let store = InMemoryContactStore::new();
        let p = store.create_contact(NewContact::primary(some("a"), some("1"))).unwrap();
        let s = store
            .create_contact(NewContact::secondary(p.id, some("a"), some("2")))
            .unwrap();

        let deleted = store.soft_delete(s.id).unwrap();
        assert!(deleted.deleted_at.is_some());
        assert_eq!(store.soft_delete(s.id).unwrap().deleted_at, deleted.deleted_at);

        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(store.total_rows().unwrap(), 2);
        assert!(store.find_linked_to(p.id).unwrap().is_empty());
        assert_eq!(store.find_by_email_or_phone(Some("a"), None).unwrap().len(), 1);
        assert!(store.find_by_id(s.id).unwrap().unwrap().deleted_at.is_some());

        let err = store.update_linkage(s.id, LinkageUpdate::promote()).unwrap_err();
        assert!(matches!(err, StorageError::ContactNotFound(id) if id == s.id));
    }

    #[test]
    fn list_primaries_filters_precedence() {
        let store = InMemoryContactStore::new();
        let p = store.create_contact(NewContact::primary(some("a"), None)).unwrap();
        store
            .create_contact(NewContact::secondary(p.id, some("b"), None))
            .unwrap();
        let primaries = store.list_primaries().unwrap();
        assert_eq!(primaries.len(), 1);
        assert_eq!(primaries[0].link_precedence, LinkPrecedence::Primary);
        assert_eq!(store.list_active().unwrap().len(), 2);
    }

    #[test]
    fn missing_contact_errors() {
        let store = InMemoryContactStore::new();
        assert!(store.find_by_id(ContactId::new(99)).unwrap().is_none());
        assert!(matches!(
            store.soft_delete(ContactId::new(99)),
            Err(StorageError::ContactNotFound(_))
        ));
    }
}
