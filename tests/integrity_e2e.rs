use std::sync::Arc;
use std::time::Duration;

use kyro_identity::{
    ContactId, ContactStore, IdentifyRequest, InMemoryContactStore, IntegrityConfig,
    IntegrityGuard, LinkPrecedence, LinkageUpdate, NewContact, RepairKind, RepairWorker,
    RepairWorkerConfig, Resolver,
};

fn secondary(store: &InMemoryContactStore, linked: u64, email: &str) -> ContactId {
    store
        .create_contact(NewContact::secondary(ContactId::new(linked), Some(email.to_string()), None))
        .unwrap()
        .id
}

/// Builds one of each violation the guard knows how to heal.
fn corrupted_store() -> Arc<InMemoryContactStore> {
    let store = Arc::new(InMemoryContactStore::new());

    // 1: primary carrying a stale link
    let anchor = store
        .create_contact(NewContact::primary(Some("anchor".into()), None))
        .unwrap();
    store
        .update_linkage(
            anchor.id,
            LinkageUpdate {
                linked_id: Some(Some(ContactId::new(77))),
                ..LinkageUpdate::default()
            },
        )
        .unwrap();

    // 2: empty contact
    store.create_contact(NewContact::primary(None, None)).unwrap();

    // 3 -> 4 -> 3: two secondaries pointing at each other. Promoting 3 leaves
    // 4 validly linked under it.
    secondary(&store, 4, "loop-a");
    secondary(&store, 3, "loop-b");

    // 5: secondary whose target never existed
    secondary(&store, 500, "orphan");

    // 6 -> 1, 7 -> 6: nested secondary
    secondary(&store, 1, "child");
    secondary(&store, 6, "grandchild");

    store
}

#[test]
fn repair_heals_every_violation_in_order() {
    let store = corrupted_store();
    let guard = IntegrityGuard::new(store.clone());

    let report = guard.repair().unwrap();

    assert!(report.failures.is_empty());
    let kinds: Vec<(u64, RepairKind)> = report
        .actions
        .iter()
        .map(|a| (a.contact_id.get(), a.kind))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (1, RepairKind::PrimaryWithLink),
            (2, RepairKind::EmptyContact),
            (3, RepairKind::Cycle),
            (5, RepairKind::OrphanedSecondary),
            (7, RepairKind::SecondaryToSecondary),
        ]
    );

    assert_eq!(store.find_by_id(ContactId::new(1)).unwrap().unwrap().linked_id, None);
    assert!(!store.find_by_id(ContactId::new(2)).unwrap().unwrap().is_active());
    assert_eq!(
        store.find_by_id(ContactId::new(4)).unwrap().unwrap().linked_id,
        Some(ContactId::new(3))
    );
    assert_eq!(
        store.find_by_id(ContactId::new(6)).unwrap().unwrap().linked_id,
        Some(ContactId::new(1))
    );
}

#[test]
fn second_repair_run_is_clean() {
    let store = corrupted_store();
    let guard = IntegrityGuard::new(store.clone());

    assert!(!guard.repair().unwrap().is_clean());
    let second = guard.repair().unwrap();
    assert!(second.is_clean());
    assert!(guard.scan().unwrap().is_empty());
}

#[test]
fn scan_reports_without_writing() {
    let store = corrupted_store();
    let guard = IntegrityGuard::new(store.clone());
    let before = store.list_active().unwrap();

    let planned = guard.scan().unwrap();

    assert_eq!(planned.len(), 5);
    assert_eq!(store.list_active().unwrap(), before);
    assert_eq!(guard.repair().unwrap().actions, planned);
}

#[test]
fn empty_contacts_survive_when_purge_disabled() {
    let store = corrupted_store();
    let guard = IntegrityGuard::with_config(
        store.clone(),
        IntegrityConfig {
            purge_empty_contacts: false,
            ..IntegrityConfig::default()
        },
    );

    let report = guard.repair().unwrap();

    assert_eq!(report.count(RepairKind::EmptyContact), 0);
    assert!(store.find_by_id(ContactId::new(2)).unwrap().unwrap().is_active());
}

#[test]
fn resolver_works_on_repaired_store() {
    let store = corrupted_store();
    IntegrityGuard::new(store.clone()).repair().unwrap();
    let resolver = Resolver::new(store.clone());

    let response = resolver.identify(&IdentifyRequest::pair("grandchild", "9")).unwrap();

    assert_eq!(response.contact.primary_contact_id, ContactId::new(7));
    assert_eq!(response.contact.emails, vec!["grandchild"]);
    assert_eq!(response.contact.phone_numbers, vec!["9"]);
    let primary = store.find_by_id(ContactId::new(7)).unwrap().unwrap();
    assert_eq!(primary.link_precedence, LinkPrecedence::Primary);
}

#[test]
fn worker_runs_on_demand_and_shuts_down() {
    let store = corrupted_store();
    let guard = Arc::new(IntegrityGuard::new(store.clone()));
    let worker = RepairWorker::start(guard, RepairWorkerConfig::default()).unwrap();

    let first = worker
        .trigger()
        .unwrap()
        .join_timeout(Duration::from_secs(5))
        .unwrap();
    assert_eq!(first.actions.len(), 5);
    assert!(worker.run_now().unwrap().is_clean());
    assert_eq!(worker.completed_runs(), 2);

    worker.shutdown();
}
