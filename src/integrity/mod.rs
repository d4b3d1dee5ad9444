//! Detection and repair of structural chain violations.
//!
//! The guard runs out-of-band, never on the identify path. It snapshots every
//! active contact, then runs these passes in order, each over the state the
//! previous passes left behind:
//!
//! 1. primaries carrying a `linked_id` get the link cleared
//! 2. contacts with neither email nor phone are soft-deleted (configurable)
//! 3. `linked_id` cycles are broken by promoting the first revisited node
//! 4. secondaries with a null or dangling `linked_id` are promoted
//! 5. secondaries anchored on another secondary are promoted
//!
//! Every fix is an absolute-state write that removes the condition it
//! detected, so a second run over a repaired store finds nothing.

/// Background repair thread.
pub mod worker;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::IntegrityConfig;
use crate::contact::{Contact, ContactId, LinkPrecedence, LinkageUpdate};
use crate::error::IdentityResult;
use crate::storage::ContactStore;

pub use worker::{RepairHandle, RepairWorker};

/// Kind of structural violation a repair addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairKind {
    /// A primary with a non-null `linked_id`.
    PrimaryWithLink,
    /// A contact with neither attribute.
    EmptyContact,
    /// A node revisited while walking `linked_id`.
    Cycle,
    /// A secondary whose `linked_id` is null or names no active contact.
    OrphanedSecondary,
    /// A secondary anchored on another secondary.
    SecondaryToSecondary,
}

/// One applied (or planned) fix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairAction {
    /// Contact the fix targets.
    pub contact_id: ContactId,
    /// What was wrong.
    pub kind: RepairKind,
    /// `linked_id` before the fix.
    pub previous_linked_id: Option<ContactId>,
}

/// A fix the store rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairFailure {
    /// Contact the fix targeted.
    pub contact_id: ContactId,
    /// What was wrong.
    pub kind: RepairKind,
    /// Rendered cause.
    pub error: String,
}

/// Summary of one guard run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairReport {
    /// Active contacts in the snapshot.
    pub scanned: usize,
    /// Fixes applied, in pass order.
    pub actions: Vec<RepairAction>,
    /// Fixes that failed and were skipped.
    pub failures: Vec<RepairFailure>,
}

impl RepairReport {
    /// Returns true if the run found nothing to do.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.actions.is_empty() && self.failures.is_empty()
    }

    /// Number of applied fixes of `kind`.
    #[must_use]
    pub fn count(&self, kind: RepairKind) -> usize {
        self.actions.iter().filter(|a| a.kind == kind).count()
    }
}

enum Fix {
    ClearLink,
    Delete,
    Promote,
}

/// Snapshot of active contacts plus the writes a run has made so far.
struct RepairRun<'a> {
    store: &'a dyn ContactStore,
    apply: bool,
    contacts: BTreeMap<ContactId, Contact>,
    report: RepairReport,
}

impl RepairRun<'_> {
    fn secondaries_by_seniority(&self) -> Vec<ContactId> {
        let mut ids: Vec<&Contact> = self.contacts.values().filter(|c| c.is_secondary()).collect();
        ids.sort_by_key(|c| c.seniority());
        ids.into_iter().map(|c| c.id).collect()
    }

    fn fix(&mut self, id: ContactId, kind: RepairKind, fix: Fix) {
        let Some(current) = self.contacts.get(&id) else {
            return;
        };
        let previous_linked_id = current.linked_id;

        if self.apply {
            let result = match fix {
                Fix::ClearLink => self.store.update_linkage(
                    id,
                    LinkageUpdate {
                        linked_id: Some(None),
                        ..LinkageUpdate::default()
                    },
                ),
                Fix::Delete => self.store.soft_delete(id),
                Fix::Promote => self.store.update_linkage(id, LinkageUpdate::promote()),
            };
            if let Err(e) = result {
                warn!(error = %e, contact_id = %id, kind = ?kind, "repair step failed; skipping");
                self.report.failures.push(RepairFailure {
                    contact_id: id,
                    kind,
                    error: e.to_string(),
                });
                return;
            }
            info!(contact_id = %id, kind = ?kind, "repaired contact");
        }

        match fix {
            Fix::Delete => {
                self.contacts.remove(&id);
            }
            Fix::ClearLink | Fix::Promote => {
                if let Some(contact) = self.contacts.get_mut(&id) {
                    contact.linked_id = None;
                    if matches!(fix, Fix::Promote) {
                        contact.link_precedence = LinkPrecedence::Primary;
                    }
                }
            }
        }
        self.report.actions.push(RepairAction {
            contact_id: id,
            kind,
            previous_linked_id,
        });
    }

    fn clear_primary_links(&mut self) {
        let ids: Vec<ContactId> = self
            .contacts
            .values()
            .filter(|c| c.is_primary() && c.linked_id.is_some())
            .map(|c| c.id)
            .collect();
        for id in ids {
            self.fix(id, RepairKind::PrimaryWithLink, Fix::ClearLink);
        }
    }

    fn purge_empty(&mut self) {
        let ids: Vec<ContactId> = self
            .contacts
            .values()
            .filter(|c| c.is_empty())
            .map(|c| c.id)
            .collect();
        for id in ids {
            self.fix(id, RepairKind::EmptyContact, Fix::Delete);
        }
    }

    fn break_cycles(&mut self, max_hops: usize) {
        let mut settled: HashSet<ContactId> = HashSet::new();
        for start in self.secondaries_by_seniority() {
            if settled.contains(&start) {
                continue;
            }
            let mut path = Vec::new();
            let mut visited: HashSet<ContactId> = HashSet::new();
            let mut revisited = None;
            let mut truncated = false;
            let mut current = Some(start);

            while let Some(id) = current {
                let Some(node) = self.contacts.get(&id) else {
                    break;
                };
                if settled.contains(&id) || !node.is_secondary() {
                    break;
                }
                if !visited.insert(id) {
                    revisited = Some(id);
                    break;
                }
                if path.len() >= max_hops {
                    warn!(start = %start, hops = max_hops, "linked_id walk exceeded hop limit; breaking it as a cycle");
                    truncated = true;
                    break;
                }
                path.push(id);
                current = node.linked_id;
            }

            // A walk cut off by the hop limit is broken at its last node.
            let breaking_point = revisited.or_else(|| path.last().copied().filter(|_| truncated));
            if let Some(id) = breaking_point {
                debug!(contact_id = %id, cycle_len = path.len(), "linked_id cycle detected");
                self.fix(id, RepairKind::Cycle, Fix::Promote);
            }
            settled.extend(path);
        }
    }

    fn promote_orphans(&mut self) {
        for id in self.secondaries_by_seniority() {
            let dangling = match self.contacts.get(&id).and_then(|c| c.linked_id) {
                None => true,
                Some(target) => !self.contacts.contains_key(&target),
            };
            if dangling {
                self.fix(id, RepairKind::OrphanedSecondary, Fix::Promote);
            }
        }
    }

    fn promote_nested(&mut self) {
        for id in self.secondaries_by_seniority() {
            let nested = self
                .contacts
                .get(&id)
                .and_then(|c| c.linked_id)
                .and_then(|target| self.contacts.get(&target))
                .is_some_and(Contact::is_secondary);
            let still_secondary = self.contacts.get(&id).is_some_and(Contact::is_secondary);
            if nested && still_secondary {
                self.fix(id, RepairKind::SecondaryToSecondary, Fix::Promote);
            }
        }
    }
}

/// On-demand detector and healer of chain violations.
#[derive(Clone)]
pub struct IntegrityGuard {
    store: Arc<dyn ContactStore>,
    config: IntegrityConfig,
}

impl IntegrityGuard {
    /// Create a guard with the default configuration.
    #[must_use]
    pub fn new(store: Arc<dyn ContactStore>) -> Self {
        Self::with_config(store, IntegrityConfig::default())
    }

    /// Create a guard with a custom configuration.
    #[must_use]
    pub fn with_config(store: Arc<dyn ContactStore>, config: IntegrityConfig) -> Self {
        Self { store, config }
    }

    /// Returns the active configuration.
    #[must_use]
    pub fn config(&self) -> &IntegrityConfig {
        &self.config
    }

    /// Lists the fixes a repair run would make, without writing.
    ///
    /// # Errors
    /// Returns `Store` if the snapshot cannot be read.
    pub fn scan(&self) -> IdentityResult<Vec<RepairAction>> {
        Ok(self.run(false)?.actions)
    }

    /// Detects and fixes every violation.
    ///
    /// Individual fix failures are logged and reported, not returned as errors.
    ///
    /// # Errors
    /// Returns `Store` if the snapshot cannot be read.
    pub fn repair(&self) -> IdentityResult<RepairReport> {
        let report = self.run(true)?;
        if report.is_clean() {
            debug!(scanned = report.scanned, "integrity pass found nothing to repair");
        } else {
            info!(
                scanned = report.scanned,
                repaired = report.actions.len(),
                failed = report.failures.len(),
                "integrity pass complete"
            );
        }
        Ok(report)
    }

    fn run(&self, apply: bool) -> IdentityResult<RepairReport> {
        let snapshot = self.store.list_active()?;
        let mut run = RepairRun {
            store: self.store.as_ref(),
            apply,
            report: RepairReport {
                scanned: snapshot.len(),
                ..RepairReport::default()
            },
            contacts: snapshot.into_iter().map(|c| (c.id, c)).collect(),
        };

        run.clear_primary_links();
        if self.config.purge_empty_contacts {
            run.purge_empty();
        }
        run.break_cycles(self.config.max_walk_hops);
        run.promote_orphans();
        run.promote_nested();

        Ok(run.report)
    }
}
