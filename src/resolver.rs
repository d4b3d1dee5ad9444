//! The identify entry point.
//!
//! [`Resolver::identify`] fetches every active contact sharing an attribute with
//! the request, classifies the candidate set into one of five branches, applies
//! the branch through the [`ChainManager`], and returns the consolidated chain.
//!
//! Branches are tried in priority order:
//!
//! | Branch | Candidate set | Effect |
//! |---|---|---|
//! | [`Branch::NoMatch`] | empty | new primary |
//! | [`Branch::ExactDuplicate`] | a member equals the request on both fields | none |
//! | [`Branch::SinglePrimary`] | one candidate, a primary | secondary if the request adds information |
//! | [`Branch::MultiplePrimaries`] | two or more owning primaries | merge into the oldest, then add the pair if missing |
//! | [`Branch::ExistingChain`] | anything else | secondary if the request adds information to the chain |

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::chain::{ChainManager, ConsolidatedContact};
use crate::config::ResolverConfig;
use crate::contact::{Contact, ContactId};
use crate::error::{IdentityError, IdentityResult};
use crate::locks::AttributeLocks;
use crate::matcher::{group_linkable, score_match, validate_chain};
use crate::storage::ContactStore;

/// An identity fact: an email, a phone number, or both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyRequest {
    /// Email address.
    #[serde(default)]
    pub email: Option<String>,
    /// Phone number.
    #[serde(default)]
    pub phone_number: Option<String>,
    /// Correlation id for logs; generated when absent.
    #[serde(skip)]
    pub request_id: Option<Uuid>,
}

impl IdentifyRequest {
    /// Creates a request from optional attributes.
    pub fn new(email: Option<impl Into<String>>, phone_number: Option<impl Into<String>>) -> Self {
        Self {
            email: email.map(Into::into),
            phone_number: phone_number.map(Into::into),
            request_id: None,
        }
    }

    /// Email-only request.
    pub fn email(email: impl Into<String>) -> Self {
        Self {
            email: Some(email.into()),
            ..Self::default()
        }
    }

    /// Phone-only request.
    pub fn phone(phone_number: impl Into<String>) -> Self {
        Self {
            phone_number: Some(phone_number.into()),
            ..Self::default()
        }
    }

    /// Request carrying both attributes.
    pub fn pair(email: impl Into<String>, phone_number: impl Into<String>) -> Self {
        Self {
            email: Some(email.into()),
            phone_number: Some(phone_number.into()),
            request_id: None,
        }
    }

    /// Sets a caller-supplied correlation id.
    #[must_use]
    pub fn with_request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// Attributes with empty strings treated as absent.
    ///
    /// # Errors
    /// Returns `InvalidRequest` when neither attribute is present.
    pub fn attributes(&self) -> IdentityResult<(Option<&str>, Option<&str>)> {
        let email = self.email.as_deref().filter(|s| !s.is_empty());
        let phone_number = self.phone_number.as_deref().filter(|s| !s.is_empty());
        if email.is_none() && phone_number.is_none() {
            return Err(IdentityError::invalid_request(
                "request must carry an email or a phone number",
            ));
        }
        Ok((email, phone_number))
    }
}

/// Successful identify result: `{"contact": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyResponse {
    /// The consolidated chain.
    pub contact: ConsolidatedContact,
}

/// Decision taken for a candidate set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Branch {
    /// No contact shares an attribute with the request.
    NoMatch,
    /// Some contact already holds exactly the requested pair.
    ExactDuplicate,
    /// A lone primary matched.
    SinglePrimary,
    /// Candidates belong to two or more chains.
    MultiplePrimaries,
    /// Candidates belong to one chain (or none resolvable).
    ExistingChain,
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoMatch => "no_match",
            Self::ExactDuplicate => "exact_duplicate",
            Self::SinglePrimary => "single_primary",
            Self::MultiplePrimaries => "multiple_primaries",
            Self::ExistingChain => "existing_chain",
        };
        f.write_str(name)
    }
}

/// Classified candidate set, carrying what the branch needs to act.
#[derive(Debug, Clone)]
enum Classification {
    NoMatch,
    ExactDuplicate {
        primary: Contact,
    },
    SinglePrimary {
        primary: Contact,
    },
    MultiplePrimaries {
        primaries: Vec<Contact>,
        orphans: Vec<Contact>,
    },
    ExistingChain {
        primary: Option<Contact>,
        orphans: Vec<Contact>,
    },
}

impl Classification {
    const fn branch(&self) -> Branch {
        match self {
            Self::NoMatch => Branch::NoMatch,
            Self::ExactDuplicate { .. } => Branch::ExactDuplicate,
            Self::SinglePrimary { .. } => Branch::SinglePrimary,
            Self::MultiplePrimaries { .. } => Branch::MultiplePrimaries,
            Self::ExistingChain { .. } => Branch::ExistingChain,
        }
    }
}

/// A candidate with its diagnostic score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredCandidate {
    /// The candidate.
    pub contact: Contact,
    /// [`score_match`] against the request.
    pub score: u32,
}

/// Read-only description of what `identify` would do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionPlan {
    /// Branch that would run.
    pub branch: Branch,
    /// Candidates, best score first.
    pub candidates: Vec<ScoredCandidate>,
    /// Candidate ids partitioned by shared attributes.
    pub groups: Vec<Vec<ContactId>>,
    /// Owning primaries of the candidates, oldest first.
    pub primary_ids: Vec<ContactId>,
}

/// Decides whether `email`/`phone_number` adds information to `target`.
///
/// False when some member already holds exactly the pair. Otherwise true when
/// one field is known to the target and the other is new and non-null, or when
/// a field absent across the whole target gets filled while the other matches.
#[must_use]
pub fn needs_secondary(target: &[&Contact], email: Option<&str>, phone_number: Option<&str>) -> bool {
    let exact = target
        .iter()
        .any(|c| c.email.as_deref() == email && c.phone_number.as_deref() == phone_number);
    if exact {
        return false;
    }

    let email_known = email.is_some_and(|e| target.iter().any(|c| c.email.as_deref() == Some(e)));
    let phone_known =
        phone_number.is_some_and(|p| target.iter().any(|c| c.phone_number.as_deref() == Some(p)));
    let email_new = email.is_some() && !email_known;
    let phone_new = phone_number.is_some() && !phone_known;

    let adds_value = (email_known && phone_new) || (phone_known && email_new);

    let target_lacks_email = target.iter().all(|c| c.email.is_none());
    let target_lacks_phone = target.iter().all(|c| c.phone_number.is_none());
    let fills_gap = (target_lacks_email && email.is_some() && phone_known)
        || (target_lacks_phone && phone_number.is_some() && email_known);

    adds_value || fills_gap
}

/// Identity resolver over a [`ContactStore`].
pub struct Resolver {
    chains: ChainManager,
    locks: AttributeLocks,
    config: ResolverConfig,
}

impl Resolver {
    /// Create a resolver with the default configuration.
    #[must_use]
    pub fn new(store: Arc<dyn ContactStore>) -> Self {
        Self::with_config(store, ResolverConfig::default())
    }

    /// Create a resolver with a custom configuration.
    #[must_use]
    pub fn with_config(store: Arc<dyn ContactStore>, config: ResolverConfig) -> Self {
        Self {
            chains: ChainManager::new(store),
            locks: AttributeLocks::new(config.lock_stripes),
            config,
        }
    }

    /// Returns the chain manager.
    #[must_use]
    pub fn chains(&self) -> &ChainManager {
        &self.chains
    }

    /// Returns the active configuration.
    #[must_use]
    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Resolves `request` into its identity chain, creating or merging as needed.
    ///
    /// # Errors
    /// - `InvalidRequest`: neither attribute present
    /// - `Store`: a read or a non-merge write failed
    /// - `Consistency`: the resolved chain has no primary
    /// - `Internal`: an attribute lock was poisoned
    pub fn identify(&self, request: &IdentifyRequest) -> IdentityResult<IdentifyResponse> {
        let (email, phone_number) = request.attributes()?;
        let request_id = request.request_id.unwrap_or_else(Uuid::new_v4);
        let span = info_span!("identify", request_id = %request_id);
        let _entered = span.enter();

        let _guard = self.locks.acquire(email, phone_number)?;

        let candidates = self
            .chains
            .store()
            .find_by_email_or_phone(email, phone_number)?;
        let classification = self.classify(&candidates, email, phone_number)?;
        debug!(
            branch = %classification.branch(),
            candidates = candidates.len(),
            "classified candidate set"
        );

        let primary_id = match classification {
            Classification::NoMatch => {
                let primary = self.chains.create_primary(
                    email.map(str::to_string),
                    phone_number.map(str::to_string),
                )?;
                primary.id
            }
            Classification::ExactDuplicate { primary } => primary.id,
            Classification::SinglePrimary { primary } => {
                if needs_secondary(&[&primary], email, phone_number) {
                    self.chains.create_secondary(
                        primary.id,
                        email.map(str::to_string),
                        phone_number.map(str::to_string),
                    )?;
                }
                primary.id
            }
            Classification::MultiplePrimaries { primaries, orphans } => {
                self.merge_primaries(&primaries, &orphans, email, phone_number)?
            }
            Classification::ExistingChain { primary, orphans } => {
                self.extend_chain(primary, orphans, email, phone_number)?
            }
        };

        self.finish(primary_id)
    }

    /// Describes what [`Resolver::identify`] would do, without mutating.
    ///
    /// # Errors
    /// - `InvalidRequest`: neither attribute present
    /// - `Store`: a read failed
    pub fn explain(&self, request: &IdentifyRequest) -> IdentityResult<ResolutionPlan> {
        let (email, phone_number) = request.attributes()?;
        let candidates = self
            .chains
            .store()
            .find_by_email_or_phone(email, phone_number)?;
        let classification = self.classify(&candidates, email, phone_number)?;

        let groups = group_linkable(&candidates)
            .into_iter()
            .map(|g| g.into_iter().map(|c| c.id).collect())
            .collect();

        let primary_ids = match &classification {
            Classification::NoMatch => Vec::new(),
            Classification::ExactDuplicate { primary } | Classification::SinglePrimary { primary } => {
                vec![primary.id]
            }
            Classification::MultiplePrimaries { primaries, .. } => {
                primaries.iter().map(|p| p.id).collect()
            }
            Classification::ExistingChain { primary, .. } => {
                primary.iter().map(|p| p.id).collect()
            }
        };

        let mut scored: Vec<ScoredCandidate> = candidates
            .into_iter()
            .map(|contact| {
                let score = score_match(&contact, email, phone_number);
                ScoredCandidate { contact, score }
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| a.contact.seniority().cmp(&b.contact.seniority()))
        });

        Ok(ResolutionPlan {
            branch: classification.branch(),
            candidates: scored,
            groups,
            primary_ids,
        })
    }

    fn classify(
        &self,
        candidates: &[Contact],
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> IdentityResult<Classification> {
        if candidates.is_empty() {
            return Ok(Classification::NoMatch);
        }

        for candidate in candidates {
            let exact = candidate.email.as_deref() == email
                && candidate.phone_number.as_deref() == phone_number;
            if !exact {
                continue;
            }
            if let Some(primary) = self.chains.owning_primary(candidate)? {
                return Ok(Classification::ExactDuplicate { primary });
            }
            debug!(contact_id = %candidate.id, "exact duplicate has no resolvable primary");
        }

        if let [only] = candidates {
            if only.is_primary() {
                return Ok(Classification::SinglePrimary {
                    primary: only.clone(),
                });
            }
        }

        let mut owners: BTreeMap<ContactId, Contact> = BTreeMap::new();
        let mut orphans = Vec::new();
        for candidate in candidates {
            match self.chains.owning_primary(candidate)? {
                Some(owner) => {
                    owners.entry(owner.id).or_insert(owner);
                }
                None => orphans.push(candidate.clone()),
            }
        }

        let mut primaries: Vec<Contact> = owners.into_values().collect();
        primaries.sort_by_key(Contact::seniority);

        if primaries.len() >= 2 {
            return Ok(Classification::MultiplePrimaries { primaries, orphans });
        }
        Ok(Classification::ExistingChain {
            primary: primaries.into_iter().next(),
            orphans,
        })
    }

    fn merge_primaries(
        &self,
        primaries: &[Contact],
        orphans: &[Contact],
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> IdentityResult<ContactId> {
        let Some((survivor, younger)) = primaries.split_first() else {
            return Err(IdentityError::consistency("merge requested without primaries"));
        };

        for newer in younger {
            match self.chains.merge_chains(survivor.id, newer.id) {
                Ok(report) if !report.is_complete() => {
                    warn!(
                        survivor = %survivor.id,
                        absorbed = %newer.id,
                        failed_steps = report.failures.len(),
                        "merge left steps unapplied; next repair pass will heal the chain"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, survivor = %survivor.id, absorbed = %newer.id, "skipping chain merge");
                }
            }
        }
        self.adopt_orphans(survivor.id, orphans);

        let chain = self.chains.primary_chain(survivor.id)?;
        if !chain.covers(email, phone_number) {
            self.chains.create_secondary(
                survivor.id,
                email.map(str::to_string),
                phone_number.map(str::to_string),
            )?;
        }
        Ok(survivor.id)
    }

    fn extend_chain(
        &self,
        primary: Option<Contact>,
        mut orphans: Vec<Contact>,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> IdentityResult<ContactId> {
        let primary_id = match primary {
            Some(primary) => primary.id,
            None => {
                if orphans.is_empty() {
                    return Err(IdentityError::consistency(
                        "candidate set has neither a primary nor orphans",
                    ));
                }
                let earliest = orphans.remove(0);
                warn!(contact_id = %earliest.id, "no primary among candidates; promoting earliest candidate");
                self.chains.promote(earliest.id)?.id
            }
        };
        self.adopt_orphans(primary_id, &orphans);

        let chain = self.chains.primary_chain(primary_id)?;
        let members: Vec<&Contact> = chain.members().collect();
        if needs_secondary(&members, email, phone_number) {
            self.chains.create_secondary(
                primary_id,
                email.map(str::to_string),
                phone_number.map(str::to_string),
            )?;
        }
        Ok(primary_id)
    }

    fn adopt_orphans(&self, primary_id: ContactId, orphans: &[Contact]) {
        for orphan in orphans {
            if let Err(e) = self.chains.adopt(primary_id, orphan.id) {
                warn!(error = %e, contact_id = %orphan.id, primary_id = %primary_id, "failed to adopt unanchored candidate");
            }
        }
    }

    fn finish(&self, primary_id: ContactId) -> IdentityResult<IdentifyResponse> {
        let chain = self.chains.primary_chain(primary_id)?;
        if self.config.validate_after_resolve {
            let members: Vec<Contact> = chain.members().cloned().collect();
            for violation in validate_chain(&members) {
                warn!(primary_id = %primary_id, violation = ?violation, "resolved chain violates an invariant");
            }
        }
        let contact = chain.project();
        info!(
            primary_id = %contact.primary_contact_id,
            secondaries = contact.secondary_contact_ids.len(),
            "identify resolved"
        );
        Ok(IdentifyResponse { contact })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Utc;

    use crate::contact::{LinkPrecedence, LinkageUpdate};
    use crate::storage::InMemoryContactStore;

    fn resolver() -> (Resolver, Arc<InMemoryContactStore>) {
        let store = Arc::new(InMemoryContactStore::new());
        (Resolver::new(store.clone()), store)
    }

    fn contact(email: Option<&str>, phone: Option<&str>) -> Contact {
        let now = Utc::now();
        Contact {
            id: ContactId::new(1),
            email: email.map(str::to_string),
            phone_number: phone.map(str::to_string),
            linked_id: None,
            link_precedence: LinkPrecedence::Primary,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    #[test]
    fn needs_secondary_rules() {
        let p = contact(Some("a"), Some("1"));
        assert!(!needs_secondary(&[&p], Some("a"), Some("1")));
        assert!(needs_secondary(&[&p], Some("a"), Some("2")));
        assert!(needs_secondary(&[&p], Some("b"), Some("1")));
        assert!(!needs_secondary(&[&p], Some("a"), None));
        assert!(!needs_secondary(&[&p], None, Some("1")));

        let email_only = contact(Some("a"), None);
        assert!(needs_secondary(&[&email_only], Some("a"), Some("1")));
        assert!(!needs_secondary(&[&email_only], Some("a"), None));
    }

    #[test]
    fn needs_secondary_considers_the_whole_target() {
        let p = contact(Some("a"), Some("1"));
        let s = contact(Some("b"), Some("2"));
        assert!(!needs_secondary(&[&p, &s], Some("a"), Some("2")));
        assert!(!needs_secondary(&[&p, &s], Some("b"), Some("2")));
        assert!(needs_secondary(&[&p, &s], Some("c"), Some("2")));
    }

    #[test]
    fn empty_request_is_invalid() {
        let (resolver, _store) = resolver();
        let err = resolver.identify(&IdentifyRequest::default()).unwrap_err();
        assert_eq!(err.kind(), crate::error::FailureKind::InvalidRequest);

        let blank = IdentifyRequest::pair("", "");
        assert!(resolver.identify(&blank).is_err());
    }

    #[test]
    fn empty_strings_are_treated_as_absent() {
        let (resolver, store) = resolver();
        let resp = resolver.identify(&IdentifyRequest::pair("a@x.com", "")).unwrap();
        assert!(resp.contact.phone_numbers.is_empty());
        let stored = store.find_by_id(resp.contact.primary_contact_id).unwrap().unwrap();
        assert!(stored.phone_number.is_none());
    }

    #[test]
    fn request_deserializes_from_camel_case() {
        let req: IdentifyRequest =
            serde_json::from_str(r#"{"email": "a@x.com", "phoneNumber": "123"}"#).unwrap();
        assert_eq!(req, IdentifyRequest::pair("a@x.com", "123"));

        let req: IdentifyRequest = serde_json::from_str(r#"{"phoneNumber": "123"}"#).unwrap();
        assert_eq!(req, IdentifyRequest::phone("123"));
    }

    #[test]
    fn single_primary_only_compares_against_the_primary() {
        let (resolver, store) = resolver();
        let p = resolver.identify(&IdentifyRequest::pair("a", "1")).unwrap();
        let primary_id = p.contact.primary_contact_id;
        resolver.identify(&IdentifyRequest::pair("b", "1")).unwrap();

        let plan = resolver.explain(&IdentifyRequest::pair("a", "9")).unwrap();
        assert_eq!(plan.branch, Branch::SinglePrimary);
        assert_eq!(plan.primary_ids, vec![primary_id]);

        let resp = resolver.identify(&IdentifyRequest::pair("a", "9")).unwrap();
        assert_eq!(resp.contact.phone_numbers, vec!["1", "9"]);
        assert_eq!(store.count().unwrap(), 3);
    }

    #[test]
    fn explain_does_not_mutate() {
        let (resolver, store) = resolver();
        resolver.identify(&IdentifyRequest::pair("a", "1")).unwrap();
        resolver.identify(&IdentifyRequest::pair("b", "2")).unwrap();

        let plan = resolver.explain(&IdentifyRequest::pair("a", "2")).unwrap();
        assert_eq!(plan.branch, Branch::MultiplePrimaries);
        assert_eq!(plan.primary_ids.len(), 2);
        assert_eq!(plan.groups.len(), 2);
        assert_eq!(plan.candidates.len(), 2);
        assert!(plan.candidates.iter().all(|c| c.score == 50));
        assert_eq!(store.list_primaries().unwrap().len(), 2);

        let plan = resolver.explain(&IdentifyRequest::email("z")).unwrap();
        assert_eq!(plan.branch, Branch::NoMatch);
        assert!(plan.candidates.is_empty());
    }

    #[test]
    fn exact_duplicate_with_broken_anchor_falls_through_to_self_heal() {
        let (resolver, store) = resolver();
        let resp = resolver.identify(&IdentifyRequest::pair("a", "1")).unwrap();
        let p = resp.contact.primary_contact_id;
        let resp = resolver.identify(&IdentifyRequest::pair("a", "2")).unwrap();
        let s = resp.contact.secondary_contact_ids[0];
        store.soft_delete(p).unwrap();

        let plan = resolver.explain(&IdentifyRequest::pair("a", "2")).unwrap();
        assert_eq!(plan.branch, Branch::ExistingChain);
        assert!(plan.primary_ids.is_empty());

        let resp = resolver.identify(&IdentifyRequest::pair("a", "2")).unwrap();
        assert_eq!(resp.contact.primary_contact_id, s);
        let healed = store.find_by_id(s).unwrap().unwrap();
        assert_eq!(healed.link_precedence, LinkPrecedence::Primary);
        assert!(healed.linked_id.is_none());
    }

    #[test]
    fn orphan_candidates_are_adopted_by_the_chain() {
        let (resolver, store) = resolver();
        let p = resolver.identify(&IdentifyRequest::pair("a", "1")).unwrap().contact.primary_contact_id;
        let s = resolver.identify(&IdentifyRequest::pair("b", "1")).unwrap().contact.secondary_contact_ids[0];
        store
            .update_linkage(
                s,
                LinkageUpdate {
                    linked_id: Some(None),
                    ..LinkageUpdate::default()
                },
            )
            .unwrap();

        let resp = resolver.identify(&IdentifyRequest::pair("c", "1")).unwrap();
        assert_eq!(resp.contact.primary_contact_id, p);
        assert!(resp.contact.secondary_contact_ids.contains(&s));
        assert_eq!(store.find_by_id(s).unwrap().unwrap().linked_id, Some(p));
    }
}
