//! Contact records and identity-chain linkage.
//!
//! A [`Contact`] is the only stored entity. Contacts that describe the same
//! person form a chain: one [`LinkPrecedence::Primary`] anchor plus any number of
//! [`LinkPrecedence::Secondary`] contacts whose `linked_id` names the anchor.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Store-assigned contact identifier.
///
/// Ids increase monotonically in creation order and break ties when two
/// contacts share a `created_at`.
///
/// # Examples
///
/// ```
/// use kyro_identity::ContactId;
///
/// let id = ContactId::new(42);
/// assert_eq!(id.get(), 42);
/// assert_eq!(id.to_string(), "42");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContactId(u64);

impl ContactId {
    /// Wraps a raw id.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ContactId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Position of a contact within its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkPrecedence {
    /// Canonical anchor of one identity.
    Primary,
    /// Merged into an identity; never an anchor.
    Secondary,
}

impl fmt::Display for LinkPrecedence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Secondary => write!(f, "secondary"),
        }
    }
}

/// A stored identity fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    /// Store-assigned id.
    pub id: ContactId,
    /// Email address, compared by exact string equality.
    pub email: Option<String>,
    /// Phone number, compared by exact string equality.
    pub phone_number: Option<String>,
    /// `None` for a primary; the anchor's id for a secondary.
    pub linked_id: Option<ContactId>,
    /// Primary or secondary.
    pub link_precedence: LinkPrecedence,
    /// Defines seniority within a chain.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker; `None` means active.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Contact {
    /// Returns true if this contact is flagged primary.
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.link_precedence == LinkPrecedence::Primary
    }

    /// Returns true if this contact is flagged secondary.
    #[must_use]
    pub fn is_secondary(&self) -> bool {
        self.link_precedence == LinkPrecedence::Secondary
    }

    /// Returns true unless the contact has been soft-deleted.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Returns true if neither attribute is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.email.is_none() && self.phone_number.is_none()
    }

    /// Seniority key: `created_at`, then `id`.
    #[must_use]
    pub fn seniority(&self) -> (DateTime<Utc>, ContactId) {
        (self.created_at, self.id)
    }
}

/// Fields for a contact about to be created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewContact {
    /// Email address.
    pub email: Option<String>,
    /// Phone number.
    pub phone_number: Option<String>,
    /// Anchor for a secondary.
    pub linked_id: Option<ContactId>,
    /// Primary or secondary.
    pub link_precedence: LinkPrecedence,
}

impl NewContact {
    /// Fields for a fresh primary.
    #[must_use]
    pub fn primary(email: Option<String>, phone_number: Option<String>) -> Self {
        Self {
            email,
            phone_number,
            linked_id: None,
            link_precedence: LinkPrecedence::Primary,
        }
    }

    /// Fields for a secondary under `primary_id`.
    #[must_use]
    pub fn secondary(
        primary_id: ContactId,
        email: Option<String>,
        phone_number: Option<String>,
    ) -> Self {
        Self {
            email,
            phone_number,
            linked_id: Some(primary_id),
            link_precedence: LinkPrecedence::Secondary,
        }
    }
}

/// Partial update applied by `ContactStore::update_linkage`.
///
/// Outer `None` leaves a field untouched; `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkageUpdate {
    /// New anchor, or `Some(None)` to clear.
    pub linked_id: Option<Option<ContactId>>,
    /// New precedence.
    pub link_precedence: Option<LinkPrecedence>,
    /// New email.
    pub email: Option<Option<String>>,
    /// New phone number.
    pub phone_number: Option<Option<String>>,
}

impl LinkageUpdate {
    /// Demote to (or re-point as) a secondary of `primary_id`.
    #[must_use]
    pub fn link_to(primary_id: ContactId) -> Self {
        Self {
            linked_id: Some(Some(primary_id)),
            link_precedence: Some(LinkPrecedence::Secondary),
            ..Self::default()
        }
    }

    /// Promote to a primary with no anchor.
    #[must_use]
    pub fn promote() -> Self {
        Self {
            linked_id: Some(None),
            link_precedence: Some(LinkPrecedence::Primary),
            ..Self::default()
        }
    }

    /// Returns true if the update changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.linked_id.is_none()
            && self.link_precedence.is_none()
            && self.email.is_none()
            && self.phone_number.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(id: u64, precedence: LinkPrecedence) -> Contact {
        let now = Utc::now();
        Contact {
            id: ContactId::new(id),
            email: Some("a@x.com".to_string()),
            phone_number: None,
            linked_id: None,
            link_precedence: precedence,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    #[test]
    fn contact_serializes_with_camel_case_fields() {
        let c = contact(3, LinkPrecedence::Secondary);
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["id"], 3);
        assert_eq!(json["linkPrecedence"], "secondary");
        assert!(json["phoneNumber"].is_null());
        assert!(json.get("linkedId").is_some());
        assert!(json["deletedAt"].is_null());
    }

    #[test]
    fn seniority_breaks_ties_by_id() {
        let a = contact(1, LinkPrecedence::Primary);
        let mut b = contact(2, LinkPrecedence::Primary);
        b.created_at = a.created_at;
        assert!(a.seniority() < b.seniority());
    }

    #[test]
    fn linkage_update_constructors() {
        let link = LinkageUpdate::link_to(ContactId::new(9));
        assert_eq!(link.linked_id, Some(Some(ContactId::new(9))));
        assert_eq!(link.link_precedence, Some(LinkPrecedence::Secondary));

        let promote = LinkageUpdate::promote();
        assert_eq!(promote.linked_id, Some(None));
        assert!(!promote.is_empty());
        assert!(LinkageUpdate::default().is_empty());
    }

    #[test]
    fn empty_contact_detection() {
        let mut c = contact(1, LinkPrecedence::Primary);
        assert!(!c.is_empty());
        c.email = None;
        assert!(c.is_empty());
    }
}
