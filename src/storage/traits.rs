//! Abstract storage trait for contacts.
//!
//! The resolver only ever talks to a [`ContactStore`]. Each call commits on
//! its own; multi-step flows built on top of it are not transactional.

use thiserror::Error;

use crate::contact::{Contact, ContactId, LinkageUpdate, NewContact};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Contact not found (or soft-deleted).
    #[error("Contact not found: {0}")]
    ContactNotFound(ContactId),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Connection failed.
    #[error("Connection error: {0}")]
    ConnectionError(String),
}

/// Storage trait for contact operations.
///
/// # Contract
/// - Listing methods only return active (not soft-deleted) contacts.
/// - Listing methods order by `created_at` ascending, ties broken by id.
/// - Attribute lookups use exact string equality.
pub trait ContactStore: Send + Sync {
    /// Insert a new contact and return it with its assigned id and timestamps.
    fn create_contact(&self, fields: NewContact) -> Result<Contact, StorageError>;

    /// Get a contact by id, including soft-deleted ones.
    fn find_by_id(&self, id: ContactId) -> Result<Option<Contact>, StorageError>;

    /// Find active contacts where `email` matches OR `phone_number` matches.
    ///
    /// A `None` argument drops its clause. Both `None` yields an empty list.
    fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>, StorageError>;

    /// Find active contacts whose `linked_id` equals `id`, whatever their precedence.
    fn find_linked_to(&self, id: ContactId) -> Result<Vec<Contact>, StorageError>;

    /// Apply a partial linkage update to an active contact.
    ///
    /// # Errors
    /// - `ContactNotFound`: if the contact is missing or soft-deleted
    fn update_linkage(&self, id: ContactId, update: LinkageUpdate) -> Result<Contact, StorageError>;

    /// Mark a contact deleted. Deleting an already deleted contact is a no-op.
    fn soft_delete(&self, id: ContactId) -> Result<Contact, StorageError>;

    /// Number of active contacts.
    fn count(&self) -> Result<usize, StorageError>;

    /// All active primaries.
    fn list_primaries(&self) -> Result<Vec<Contact>, StorageError>;

    /// All active contacts.
    fn list_active(&self) -> Result<Vec<Contact>, StorageError>;
}
