//! Pure comparison logic over contacts.
//!
//! Nothing here touches a store: the functions compare attributes, partition
//! contact sets into linkable groups, score candidates for introspection, and
//! check a chain for structural violations.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::contact::{Contact, ContactId};

/// Score for a candidate that matches both fields exactly.
pub const SCORE_EXACT: u32 = 100;
/// Score added per matching non-null field.
pub const SCORE_FIELD: u32 = 50;
/// Score added when one side of the other field is null.
pub const SCORE_NULL_SIDE: u32 = 30;

fn same(a: Option<&str>, b: Option<&str>) -> bool {
    matches!((a, b), (Some(x), Some(y)) if x == y)
}

/// Returns true iff the contacts share a non-null email or a non-null phone number.
#[must_use]
pub fn matches(a: &Contact, b: &Contact) -> bool {
    same(a.email.as_deref(), b.email.as_deref())
        || same(a.phone_number.as_deref(), b.phone_number.as_deref())
}

/// Disjoint-set forest with path halving and union by size.
#[derive(Debug)]
struct DisjointSet {
    parent: Vec<usize>,
    size: Vec<usize>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            size: vec![1; n],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (mut ra, mut rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        if self.size[ra] < self.size[rb] {
            std::mem::swap(&mut ra, &mut rb);
        }
        self.parent[rb] = ra;
        self.size[ra] += self.size[rb];
    }
}

/// Partitions `contacts` into connected components of the shared-attribute graph.
///
/// Membership does not depend on input order. Groups are emitted in order of
/// their first member in the input, and members keep input order.
///
/// # Examples
///
/// ```
/// # use chrono::Utc;
/// # use kyro_identity::{Contact, ContactId, LinkPrecedence};
/// use kyro_identity::matcher::group_linkable;
///
/// # let c = |id: u64, email: &str, phone: &str| Contact {
/// #     id: ContactId::new(id),
/// #     email: Some(email.to_string()),
/// #     phone_number: Some(phone.to_string()),
/// #     linked_id: None,
/// #     link_precedence: LinkPrecedence::Primary,
/// #     created_at: Utc::now(),
/// #     updated_at: Utc::now(),
/// #     deleted_at: None,
/// # };
/// let contacts = vec![c(1, "a", "1"), c(2, "b", "2"), c(3, "a", "2"), c(4, "z", "9")];
/// let groups = group_linkable(&contacts);
/// assert_eq!(groups.len(), 2);
/// assert_eq!(groups[0].len(), 3);
/// ```
#[must_use]
pub fn group_linkable(contacts: &[Contact]) -> Vec<Vec<&Contact>> {
    let mut dsu = DisjointSet::new(contacts.len());
    let mut first_by_email: HashMap<&str, usize> = HashMap::new();
    let mut first_by_phone: HashMap<&str, usize> = HashMap::new();

    for (idx, contact) in contacts.iter().enumerate() {
        if let Some(email) = contact.email.as_deref() {
            let first = *first_by_email.entry(email).or_insert(idx);
            dsu.union(first, idx);
        }
        if let Some(phone) = contact.phone_number.as_deref() {
            let first = *first_by_phone.entry(phone).or_insert(idx);
            dsu.union(first, idx);
        }
    }

    let mut slot_by_root: HashMap<usize, usize> = HashMap::new();
    let mut groups: Vec<Vec<&Contact>> = Vec::new();
    for (idx, contact) in contacts.iter().enumerate() {
        let root = dsu.find(idx);
        let slot = *slot_by_root.entry(root).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push(contact);
    }
    groups
}

/// Diagnostic ranking of `contact` against a requested email/phone pair.
///
/// Returns [`SCORE_EXACT`] when both requested fields are present and equal the
/// contact's. Otherwise each matching non-null field adds [`SCORE_FIELD`], and a
/// match on one field while the other field is null on either side adds
/// [`SCORE_NULL_SIDE`]. Resolution never branches on this value.
#[must_use]
pub fn score_match(contact: &Contact, email: Option<&str>, phone_number: Option<&str>) -> u32 {
    let email_match = same(contact.email.as_deref(), email);
    let phone_match = same(contact.phone_number.as_deref(), phone_number);

    if email_match && phone_match {
        return SCORE_EXACT;
    }

    let mut score = 0;
    if email_match {
        score += SCORE_FIELD;
        if contact.phone_number.is_none() || phone_number.is_none() {
            score += SCORE_NULL_SIDE;
        }
    }
    if phone_match {
        score += SCORE_FIELD;
        if contact.email.is_none() || email.is_none() {
            score += SCORE_NULL_SIDE;
        }
    }
    score
}

/// Structural problems within a set of contacts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChainViolation {
    /// More than one primary in the set.
    MultiplePrimaries {
        /// Every primary found, oldest first.
        ids: Vec<ContactId>,
    },
    /// A secondary whose anchor is null or outside the set.
    OrphanedSecondary {
        /// The secondary.
        id: ContactId,
        /// Its dangling anchor.
        linked_id: Option<ContactId>,
    },
    /// A secondary anchored on another secondary.
    SecondaryToSecondary {
        /// The pointing secondary.
        id: ContactId,
        /// The secondary it points at.
        linked_id: ContactId,
    },
    /// A closed loop of `linked_id` references.
    Cycle {
        /// Members of the loop, ascending.
        ids: Vec<ContactId>,
    },
}

/// Reports violations of the chain invariants within `contacts`.
///
/// Checks are relative to the set: pass a whole chain, since a secondary whose
/// primary is absent from the set is reported as orphaned.
#[must_use]
pub fn validate_chain(contacts: &[Contact]) -> Vec<ChainViolation> {
    let by_id: HashMap<ContactId, &Contact> = contacts.iter().map(|c| (c.id, c)).collect();
    let mut violations = Vec::new();

    let mut primaries: Vec<&Contact> = contacts.iter().filter(|c| c.is_primary()).collect();
    if primaries.len() > 1 {
        primaries.sort_by_key(|c| c.seniority());
        violations.push(ChainViolation::MultiplePrimaries {
            ids: primaries.iter().map(|c| c.id).collect(),
        });
    }

    for contact in contacts.iter().filter(|c| c.is_secondary()) {
        match contact.linked_id.and_then(|id| by_id.get(&id)) {
            None => violations.push(ChainViolation::OrphanedSecondary {
                id: contact.id,
                linked_id: contact.linked_id,
            }),
            Some(target) if target.is_secondary() => {
                violations.push(ChainViolation::SecondaryToSecondary {
                    id: contact.id,
                    linked_id: target.id,
                });
            }
            Some(_) => {}
        }
    }

    let mut settled: HashSet<ContactId> = HashSet::new();
    for start in contacts.iter().filter(|c| c.is_secondary()) {
        if settled.contains(&start.id) {
            continue;
        }
        let mut path: Vec<ContactId> = Vec::new();
        let mut on_path: HashSet<ContactId> = HashSet::new();
        let mut current = Some(start);
        while let Some(node) = current {
            if settled.contains(&node.id) || !node.is_secondary() {
                break;
            }
            if !on_path.insert(node.id) {
                let pos = path.iter().position(|id| *id == node.id).unwrap_or(0);
                let mut ids = path[pos..].to_vec();
                ids.sort_unstable();
                violations.push(ChainViolation::Cycle { ids });
                break;
            }
            path.push(node.id);
            current = node.linked_id.and_then(|id| by_id.get(&id).copied());
        }
        settled.extend(path);
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{Duration, Utc};

    use crate::contact::LinkPrecedence;

    fn contact(id: u64, email: Option<&str>, phone: Option<&str>) -> Contact {
        let base = Utc::now();
        let created = base + Duration::seconds(i64::try_from(id).unwrap());
        Contact {
            id: ContactId::new(id),
            email: email.map(str::to_string),
            phone_number: phone.map(str::to_string),
            linked_id: None,
            link_precedence: LinkPrecedence::Primary,
            created_at: created,
            updated_at: created,
            deleted_at: None,
        }
    }

    fn secondary(id: u64, linked: u64) -> Contact {
        let mut c = contact(id, Some("x"), None);
        c.link_precedence = LinkPrecedence::Secondary;
        c.linked_id = Some(ContactId::new(linked));
        c
    }

    fn ids(group: &[&Contact]) -> Vec<u64> {
        group.iter().map(|c| c.id.get()).collect()
    }

    #[test]
    fn matches_requires_non_null_equality() {
        let a = contact(1, Some("a"), None);
        let b = contact(2, Some("a"), Some("1"));
        let c = contact(3, None, None);
        let d = contact(4, Some("b"), Some("1"));
        assert!(matches(&a, &b));
        assert!(matches(&b, &d));
        assert!(!matches(&a, &d));
        assert!(!matches(&c, &c));
    }

    #[test]
    fn group_linkable_follows_transitive_links() {
        let contacts = vec![
            contact(1, Some("a"), Some("1")),
            contact(2, Some("z"), Some("9")),
            contact(3, Some("b"), Some("1")),
            contact(4, Some("b"), Some("2")),
            contact(5, None, Some("9")),
        ];
        let groups = group_linkable(&contacts);
        assert_eq!(groups.len(), 2);
        assert_eq!(ids(&groups[0]), vec![1, 3, 4]);
        assert_eq!(ids(&groups[1]), vec![2, 5]);
    }

    #[test]
    fn group_membership_is_independent_of_order() {
        let mut contacts = vec![
            contact(1, Some("a"), None),
            contact(2, None, Some("1")),
            contact(3, Some("a"), Some("1")),
            contact(4, Some("q"), None),
        ];
        let forward: Vec<Vec<u64>> = group_linkable(&contacts)
            .iter()
            .map(|g| {
                let mut v = ids(g);
                v.sort_unstable();
                v
            })
            .collect();

        contacts.reverse();
        let mut backward: Vec<Vec<u64>> = group_linkable(&contacts)
            .iter()
            .map(|g| {
                let mut v = ids(g);
                v.sort_unstable();
                v
            })
            .collect();
        backward.sort();

        let mut forward_sorted = forward;
        forward_sorted.sort();
        assert_eq!(forward_sorted, backward);
        assert_eq!(backward, vec![vec![1, 2, 3], vec![4]]);
    }

    #[test]
    fn group_linkable_is_stack_safe_on_long_chains() {
        let contacts: Vec<Contact> = (0..20_000u64)
            .map(|i| {
                // Neighbours alternate between sharing a phone and sharing an email.
                let email = format!("e{}", (i + 1) / 2);
                let phone = format!("p{}", i / 2);
                contact(i + 1, Some(&email), Some(&phone))
            })
            .collect();
        let groups = group_linkable(&contacts);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), contacts.len());
    }

    #[test]
    fn score_match_ranks_signals() {
        let full = contact(1, Some("a"), Some("1"));
        assert_eq!(score_match(&full, Some("a"), Some("1")), SCORE_EXACT);
        assert_eq!(score_match(&full, Some("a"), Some("2")), SCORE_FIELD);
        assert_eq!(score_match(&full, Some("a"), None), SCORE_FIELD + SCORE_NULL_SIDE);
        assert_eq!(score_match(&full, Some("b"), Some("2")), 0);

        let email_only = contact(2, Some("a"), None);
        assert_eq!(score_match(&email_only, Some("a"), Some("1")), SCORE_FIELD + SCORE_NULL_SIDE);
        assert_eq!(score_match(&email_only, Some("a"), None), SCORE_FIELD + SCORE_NULL_SIDE);
    }

    #[test]
    fn validate_chain_accepts_a_clean_chain() {
        let chain = vec![contact(1, Some("a"), None), secondary(2, 1), secondary(3, 1)];
        assert!(validate_chain(&chain).is_empty());
    }

    #[test]
    fn validate_chain_reports_each_violation() {
        let mut orphan_null = secondary(4, 0);
        orphan_null.linked_id = None;
        let set = vec![
            contact(1, Some("a"), None),
            contact(2, Some("b"), None),
            secondary(3, 1),
            orphan_null,
            secondary(5, 99),
            secondary(6, 3),
        ];
        let violations = validate_chain(&set);

        assert!(violations.contains(&ChainViolation::MultiplePrimaries {
            ids: vec![ContactId::new(1), ContactId::new(2)],
        }));
        assert!(violations.contains(&ChainViolation::OrphanedSecondary {
            id: ContactId::new(4),
            linked_id: None,
        }));
        assert!(violations.contains(&ChainViolation::OrphanedSecondary {
            id: ContactId::new(5),
            linked_id: Some(ContactId::new(99)),
        }));
        assert!(violations.contains(&ChainViolation::SecondaryToSecondary {
            id: ContactId::new(6),
            linked_id: ContactId::new(3),
        }));
        assert!(!violations.iter().any(|v| matches!(v, ChainViolation::Cycle { .. })));
    }

    #[test]
    fn validate_chain_reports_cycles_once() {
        let set = vec![secondary(1, 2), secondary(2, 3), secondary(3, 1), secondary(4, 1)];
        let cycles: Vec<_> = validate_chain(&set)
            .into_iter()
            .filter(|v| matches!(v, ChainViolation::Cycle { .. }))
            .collect();
        assert_eq!(
            cycles,
            vec![ChainViolation::Cycle {
                ids: vec![ContactId::new(1), ContactId::new(2), ContactId::new(3)],
            }]
        );
    }
}
