//! Mutating operations on a single identity chain.
//!
//! A chain is one primary plus every active secondary whose `linked_id` names
//! it. [`ChainManager`] creates chain members, merges one chain into another,
//! and projects a chain into the consolidated view returned to callers.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::contact::{Contact, ContactId, LinkageUpdate, NewContact};
use crate::error::{IdentityError, IdentityResult};
use crate::storage::ContactStore;

/// Deduplicated view of everything known about one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidatedContact {
    /// Anchor of the chain.
    pub primary_contact_id: ContactId,
    /// Distinct emails, primary first, then by first introduction.
    pub emails: Vec<String>,
    /// Distinct phone numbers, primary first, then by first introduction.
    pub phone_numbers: Vec<String>,
    /// Secondary ids, oldest first.
    pub secondary_contact_ids: Vec<ContactId>,
}

/// A primary and its active secondaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    /// The anchor.
    pub primary: Contact,
    /// Secondaries ordered by `created_at`, then id.
    pub secondaries: Vec<Contact>,
}

impl Chain {
    /// Primary first, then secondaries in seniority order.
    pub fn members(&self) -> impl Iterator<Item = &Contact> {
        std::iter::once(&self.primary).chain(self.secondaries.iter())
    }

    /// Returns true if some member has `email` (when given) and `phone_number` (when given).
    ///
    /// Absent request fields act as wildcards.
    #[must_use]
    pub fn covers(&self, email: Option<&str>, phone_number: Option<&str>) -> bool {
        self.members().any(|c| {
            email.map_or(true, |e| c.email.as_deref() == Some(e))
                && phone_number.map_or(true, |p| c.phone_number.as_deref() == Some(p))
        })
    }

    /// Projects the chain into its consolidated view.
    #[must_use]
    pub fn project(&self) -> ConsolidatedContact {
        let mut seen_emails: HashSet<&str> = HashSet::new();
        let mut seen_phones: HashSet<&str> = HashSet::new();
        let mut emails = Vec::new();
        let mut phone_numbers = Vec::new();

        for contact in self.members() {
            if let Some(email) = contact.email.as_deref() {
                if seen_emails.insert(email) {
                    emails.push(email.to_string());
                }
            }
            if let Some(phone) = contact.phone_number.as_deref() {
                if seen_phones.insert(phone) {
                    phone_numbers.push(phone.to_string());
                }
            }
        }

        ConsolidatedContact {
            primary_contact_id: self.primary.id,
            emails,
            phone_numbers,
            secondary_contact_ids: self.secondaries.iter().map(|c| c.id).collect(),
        }
    }
}

/// The merge sub-step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStep {
    /// Demoting the newer primary.
    Demote,
    /// Listing the newer primary's secondaries.
    ListSecondaries,
    /// Re-pointing one secondary.
    Repoint,
}

/// A skipped merge sub-step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStepFailure {
    /// Which sub-step.
    pub step: MergeStep,
    /// Contact the step was applied to.
    pub contact_id: ContactId,
    /// Rendered cause.
    pub error: String,
}

/// Outcome of [`ChainManager::merge_chains`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Every record the merge mutated.
    pub updated: Vec<Contact>,
    /// Sub-steps that failed and were skipped.
    pub failures: Vec<MergeStepFailure>,
}

impl MergeReport {
    /// Returns true if every sub-step succeeded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Chain-level operations over a [`ContactStore`].
#[derive(Clone)]
pub struct ChainManager {
    store: Arc<dyn ContactStore>,
}

impl ChainManager {
    /// Create a manager over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn ContactStore>) -> Self {
        Self { store }
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ContactStore> {
        &self.store
    }

    /// Inserts a fresh primary.
    pub fn create_primary(
        &self,
        email: Option<String>,
        phone_number: Option<String>,
    ) -> IdentityResult<Contact> {
        let contact = self
            .store
            .create_contact(NewContact::primary(email, phone_number))?;
        info!(contact_id = %contact.id, "created primary contact");
        Ok(contact)
    }

    /// Inserts a secondary anchored on `primary_id`.
    pub fn create_secondary(
        &self,
        primary_id: ContactId,
        email: Option<String>,
        phone_number: Option<String>,
    ) -> IdentityResult<Contact> {
        let contact = self
            .store
            .create_contact(NewContact::secondary(primary_id, email, phone_number))?;
        info!(contact_id = %contact.id, primary_id = %primary_id, "created secondary contact");
        Ok(contact)
    }

    /// Resolves the active primary owning `contact`, one hop at most.
    ///
    /// Returns `None` when the contact is a secondary whose `linked_id` is null,
    /// missing, deleted, or names a non-primary.
    pub fn owning_primary(&self, contact: &Contact) -> IdentityResult<Option<Contact>> {
        if contact.is_primary() {
            return Ok(Some(contact.clone()));
        }
        let Some(linked_id) = contact.linked_id else {
            return Ok(None);
        };
        Ok(self
            .store
            .find_by_id(linked_id)?
            .filter(|c| c.is_active() && c.is_primary()))
    }

    /// Loads the chain that `any_id` belongs to.
    ///
    /// # Errors
    /// - `Consistency`: if the contact is missing or has no resolvable primary
    /// - `Store`: if a lookup fails
    pub fn get_chain(&self, any_id: ContactId) -> IdentityResult<Chain> {
        let contact = self
            .store
            .find_by_id(any_id)?
            .filter(Contact::is_active)
            .ok_or_else(|| IdentityError::consistency(format!("contact {any_id} not found")))?;
        let primary = self.owning_primary(&contact)?.ok_or_else(|| {
            IdentityError::consistency(format!("no primary found for contact {any_id}"))
        })?;
        self.load_chain(primary)
    }

    fn load_chain(&self, primary: Contact) -> IdentityResult<Chain> {
        let mut secondaries: Vec<Contact> = self
            .store
            .find_linked_to(primary.id)?
            .into_iter()
            .filter(Contact::is_secondary)
            .collect();
        secondaries.sort_by_key(Contact::seniority);
        Ok(Chain { primary, secondaries })
    }

    /// Folds the chain anchored at `newer` into the chain anchored at `older`.
    ///
    /// `newer` is demoted under `older`, then every contact linked to `newer`
    /// is re-pointed at `older` as a secondary. Each write commits on its own;
    /// a failed step is logged, recorded in the report, and skipped.
    ///
    /// # Errors
    /// - `Consistency`: if the ids are equal or `older` is not an active primary
    /// - `Store`: if `older` cannot be read
    pub fn merge_chains(&self, older: ContactId, newer: ContactId) -> IdentityResult<MergeReport> {
        if older == newer {
            return Err(IdentityError::consistency(format!(
                "cannot merge chain {older} into itself"
            )));
        }
        let survivor = self.store.find_by_id(older)?;
        if !survivor.as_ref().is_some_and(|c| c.is_active() && c.is_primary()) {
            return Err(IdentityError::consistency(format!(
                "merge target {older} is not an active primary"
            )));
        }

        let mut report = MergeReport::default();

        match self.store.update_linkage(newer, LinkageUpdate::link_to(older)) {
            Ok(demoted) => report.updated.push(demoted),
            Err(e) => {
                warn!(error = %e, contact_id = %newer, survivor = %older, "failed to demote primary during merge");
                report.failures.push(MergeStepFailure {
                    step: MergeStep::Demote,
                    contact_id: newer,
                    error: e.to_string(),
                });
            }
        }

        let linked = match self.store.find_linked_to(newer) {
            Ok(linked) => linked,
            Err(e) => {
                warn!(error = %e, contact_id = %newer, "failed to list secondaries during merge");
                report.failures.push(MergeStepFailure {
                    step: MergeStep::ListSecondaries,
                    contact_id: newer,
                    error: e.to_string(),
                });
                return Ok(report);
            }
        };

        for contact in linked {
            if contact.id == older {
                warn!(contact_id = %older, "survivor was linked under the merged primary; leaving it in place");
                continue;
            }
            match self.store.update_linkage(contact.id, LinkageUpdate::link_to(older)) {
                Ok(moved) => report.updated.push(moved),
                Err(e) => {
                    warn!(error = %e, contact_id = %contact.id, survivor = %older, "failed to re-point secondary during merge");
                    report.failures.push(MergeStepFailure {
                        step: MergeStep::Repoint,
                        contact_id: contact.id,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            survivor = %older,
            absorbed = %newer,
            updated = report.updated.len(),
            failed = report.failures.len(),
            "merged identity chains"
        );
        Ok(report)
    }

    /// Re-points a single contact under `primary_id` as a secondary.
    pub fn adopt(&self, primary_id: ContactId, contact_id: ContactId) -> IdentityResult<Contact> {
        let adopted = self
            .store
            .update_linkage(contact_id, LinkageUpdate::link_to(primary_id))?;
        info!(contact_id = %contact_id, primary_id = %primary_id, "adopted unanchored contact");
        Ok(adopted)
    }

    /// Promotes a contact to primary and clears its link.
    pub fn promote(&self, contact_id: ContactId) -> IdentityResult<Contact> {
        let promoted = self.store.update_linkage(contact_id, LinkageUpdate::promote())?;
        info!(contact_id = %contact_id, "promoted contact to primary");
        Ok(promoted)
    }

    /// Builds the consolidated view for the chain anchored at `primary_id`.
    ///
    /// # Errors
    /// - `Consistency`: if `primary_id` is not an active primary
    pub fn consolidate(&self, primary_id: ContactId) -> IdentityResult<ConsolidatedContact> {
        Ok(self.primary_chain(primary_id)?.project())
    }

    /// Loads the chain anchored exactly at `primary_id`.
    ///
    /// # Errors
    /// - `Consistency`: if `primary_id` is not an active primary
    pub fn primary_chain(&self, primary_id: ContactId) -> IdentityResult<Chain> {
        let primary = self
            .store
            .find_by_id(primary_id)?
            .filter(|c| c.is_active() && c.is_primary())
            .ok_or_else(|| {
                IdentityError::consistency(format!("no primary contact found for id {primary_id}"))
            })?;
        self.load_chain(primary)
    }
}
