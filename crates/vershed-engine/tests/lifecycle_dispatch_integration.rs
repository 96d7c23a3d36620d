#![forbid(unsafe_code)]

//! Integration tests for reconcile-callback dispatch and the housekeeping
//! handlers riding it.
//!
//! Covers: ReconcilePhase, ReconcileArgs gating, HandlerRegistry dispatch
//! order, StorageMigrationHandler gating, secret retirement, annotation
//! carryover, policy membership sync, relationship labels, normalization.

use std::collections::{BTreeMap, BTreeSet};

use vershed_engine::event::{EventBuffer, EventKind};
use vershed_engine::housekeeping::{
    qualified_account_name, AnnotationCarryoverHandler, PolicyMembershipSyncHandler,
    RelationshipLabelsHandler, SecretRetirementHandler, TypeNormalizationHandler,
    POLICY_MEMBERSHIP_ANNOTATION,
};
use vershed_engine::lifecycle::{
    HandlerRegistry, LifecycleError, ReconcileArgs, ReconcileHandler, ReconcilePhase,
};
use vershed_engine::migration::{MigrationConfig, StorageMigrationHandler};
use vershed_engine::object::{
    ConfigMap, Deployment, ObjectKind, ObjectMeta, ObjectRef, Secret, SecurityPolicy,
    ServiceAccount, WatchedObject, CONTROLLER_COMPONENT, CONTROLLER_COMPONENT_LABEL,
};
use vershed_engine::store::InMemoryStore;
use vershed_engine::type_definition::{SchemaVersionDecl, TypeDefinition};

const TYPE_NAME: &str = "widgets.example.io";
const KIND: &str = "Widget";

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn controller_deployment(ready: bool) -> Deployment {
    let mut meta = ObjectMeta::new("infra", "vershed-controller");
    meta.labels.insert(
        CONTROLLER_COMPONENT_LABEL.to_string(),
        CONTROLLER_COMPONENT.to_string(),
    );
    Deployment {
        meta,
        desired_replicas: 2,
        ready_replicas: if ready { 2 } else { 1 },
    }
}

fn migrating_store(instances: usize) -> InMemoryStore {
    let mut store = InMemoryStore::new();
    let mut td = TypeDefinition::new(
        TYPE_NAME,
        "example.io",
        KIND,
        vec![
            SchemaVersionDecl::served("v1alpha1"),
            SchemaVersionDecl::storage("v1beta1"),
        ],
    );
    td.status.stored_versions = ["v1alpha1", "v1beta1"]
        .into_iter()
        .map(String::from)
        .collect();
    store.insert_type_definition(td);
    for i in 0..instances {
        store.seed_instance(KIND, "default", &format!("w-{i:03}"), "v1alpha1");
    }
    store
}

fn migration_handler() -> ReconcileHandler {
    ReconcileHandler::StorageMigration(StorageMigrationHandler::new(
        TYPE_NAME,
        MigrationConfig::default(),
    ))
}

fn post_read_args(deployment: Deployment) -> ReconcileArgs {
    ReconcileArgs::new(ReconcilePhase::PostRead, "infra")
        .with_current(WatchedObject::Deployment(deployment))
}

// =========================================================================
// Section 1: StorageMigrationHandler gating
// =========================================================================

#[test]
fn migration_runs_for_ready_controller_deployment() {
    let mut store = migrating_store(5);
    let mut registry = HandlerRegistry::new();
    registry.register(ReconcilePhase::PostRead, migration_handler());
    let mut events = EventBuffer::new();
    let mut args = post_read_args(controller_deployment(true));

    let invoked = registry
        .dispatch(&mut args, &mut store, &mut events)
        .expect("dispatch");
    assert_eq!(invoked, 1);
    assert_eq!(events.of_kind(EventKind::SweepCompleted).len(), 1);
    assert_eq!(
        store
            .type_definition(TYPE_NAME)
            .expect("type definition")
            .status
            .stored_versions,
        BTreeSet::from(["v1beta1".to_string()])
    );
}

#[test]
fn migration_skips_unready_controller_deployment() {
    let mut store = migrating_store(5);
    let mut registry = HandlerRegistry::new();
    registry.register(ReconcilePhase::PostRead, migration_handler());
    let mut events = EventBuffer::new();
    let mut args = post_read_args(controller_deployment(false));

    registry
        .dispatch(&mut args, &mut store, &mut events)
        .expect("dispatch");
    assert!(events.is_empty());
    assert_eq!(store.list_calls(), 0);
}

#[test]
fn migration_skips_non_controller_deployment() {
    let mut store = migrating_store(5);
    let mut registry = HandlerRegistry::new();
    registry.register(ReconcilePhase::PostRead, migration_handler());
    let mut events = EventBuffer::new();
    let plain = Deployment {
        meta: ObjectMeta::new("infra", "web"),
        desired_replicas: 1,
        ready_replicas: 1,
    };
    let mut args = post_read_args(plain);

    registry
        .dispatch(&mut args, &mut store, &mut events)
        .expect("dispatch");
    assert_eq!(store.list_calls(), 0);
}

#[test]
fn migration_skips_other_phases_and_kinds() {
    let mut store = migrating_store(2);
    let mut registry = HandlerRegistry::new();
    registry.register(ReconcilePhase::PostRead, migration_handler());
    let mut events = EventBuffer::new();

    // Wrong kind at the right phase.
    let mut args = ReconcileArgs::new(ReconcilePhase::PostRead, "infra").with_current(
        WatchedObject::Secret(Secret {
            meta: ObjectMeta::new("infra", "s"),
        }),
    );
    registry
        .dispatch(&mut args, &mut store, &mut events)
        .expect("dispatch");

    // Right kind at a phase the handler is not registered for.
    let mut args = ReconcileArgs::new(ReconcilePhase::PreUpdate, "infra")
        .with_current(WatchedObject::Deployment(controller_deployment(true)));
    registry
        .dispatch(&mut args, &mut store, &mut events)
        .expect("dispatch");

    assert_eq!(store.list_calls(), 0);
}

// =========================================================================
// Section 2: Secret retirement
// =========================================================================

#[test]
fn retired_secrets_are_deleted_and_missing_ones_skipped() {
    let mut store = migrating_store(0);
    store.insert_object(WatchedObject::Secret(Secret {
        meta: ObjectMeta::new("infra", "legacy-api-cert"),
    }));
    store.insert_object(WatchedObject::Secret(Secret {
        meta: ObjectMeta::new("infra", "unrelated"),
    }));

    let handler = SecretRetirementHandler::new(vec![
        "legacy-api-cert".to_string(),
        "legacy-proxy-key".to_string(),
    ]);
    let mut registry = HandlerRegistry::new();
    registry.register(
        ReconcilePhase::PostRead,
        ReconcileHandler::SecretRetirement(handler),
    );
    let mut events = EventBuffer::new();
    let mut args = post_read_args(controller_deployment(true));
    registry
        .dispatch(&mut args, &mut store, &mut events)
        .expect("dispatch");

    assert!(store
        .object(&ObjectRef::new(ObjectKind::Secret, "infra", "legacy-api-cert"))
        .is_none());
    assert!(store
        .object(&ObjectRef::new(ObjectKind::Secret, "infra", "unrelated"))
        .is_some());
    assert_eq!(events.of_kind(EventKind::SecretDeleted).len(), 1);
    assert!(events.of_kind(EventKind::SecretDeleteFailed).is_empty());
}

#[test]
fn secret_retirement_needs_the_controller_deployment() {
    let mut store = migrating_store(0);
    store.insert_object(WatchedObject::Secret(Secret {
        meta: ObjectMeta::new("infra", "legacy-api-cert"),
    }));
    let handler = SecretRetirementHandler::new(vec!["legacy-api-cert".to_string()]);
    let mut registry = HandlerRegistry::new();
    registry.register(
        ReconcilePhase::PostRead,
        ReconcileHandler::SecretRetirement(handler),
    );
    let mut events = EventBuffer::new();
    let mut args = ReconcileArgs::new(ReconcilePhase::PostRead, "infra");
    registry
        .dispatch(&mut args, &mut store, &mut events)
        .expect("dispatch");
    assert!(store
        .object(&ObjectRef::new(ObjectKind::Secret, "infra", "legacy-api-cert"))
        .is_some());
}

// =========================================================================
// Section 3: Annotation carryover and normalization through dispatch
// =========================================================================

#[test]
fn carryover_rewrites_current_service_account_in_place() {
    let mut store = InMemoryStore::new();
    let mut registry = HandlerRegistry::new();
    registry.register(
        ReconcilePhase::PostRead,
        ReconcileHandler::AnnotationCarryover(AnnotationCarryoverHandler::new(
            POLICY_MEMBERSHIP_ANNOTATION,
        )),
    );
    let mut desired = ServiceAccount {
        meta: ObjectMeta::new("infra", "worker"),
    };
    desired.meta.annotations.insert(
        POLICY_MEMBERSHIP_ANNOTATION.to_string(),
        "[\"restricted\"]".to_string(),
    );
    let mut current = ServiceAccount {
        meta: ObjectMeta::new("infra", "worker"),
    };
    current
        .meta
        .annotations
        .insert(POLICY_MEMBERSHIP_ANNOTATION.to_string(), "stale".to_string());
    let mut args = ReconcileArgs::new(ReconcilePhase::PostRead, "infra")
        .with_current(WatchedObject::ServiceAccount(current))
        .with_desired(WatchedObject::ServiceAccount(desired));
    let mut events = EventBuffer::new();
    registry
        .dispatch(&mut args, &mut store, &mut events)
        .expect("dispatch");

    let sa = args
        .current
        .as_ref()
        .and_then(WatchedObject::as_service_account)
        .expect("service account");
    assert_eq!(
        sa.meta
            .annotations
            .get(POLICY_MEMBERSHIP_ANNOTATION)
            .map(String::as_str),
        Some("[\"restricted\"]")
    );
    // In-place mutation only; nothing was written to the store.
    assert_eq!(store.writes(), 0);
}

#[test]
fn normalization_runs_only_at_pre_update() {
    let mut store = InMemoryStore::new();
    let mut registry = HandlerRegistry::new();
    registry.register(
        ReconcilePhase::PreUpdate,
        ReconcileHandler::TypeNormalization(TypeNormalizationHandler),
    );
    let mut td = TypeDefinition::new(TYPE_NAME, "example.io", KIND, Vec::new());
    td.spec.preserve_unknown_fields = true;
    let mut args = ReconcileArgs::new(ReconcilePhase::PreUpdate, "")
        .with_current(WatchedObject::TypeDefinition(td));
    let mut events = EventBuffer::new();
    registry
        .dispatch(&mut args, &mut store, &mut events)
        .expect("dispatch");
    let Some(WatchedObject::TypeDefinition(td)) = &args.current else {
        panic!("wrong kind")
    };
    assert!(!td.spec.preserve_unknown_fields);
}

// =========================================================================
// Section 4: Policy membership sync through dispatch
// =========================================================================

#[test]
fn membership_follows_the_annotation_across_phases() {
    let mut store = InMemoryStore::new();
    let member = qualified_account_name("infra", "worker");
    store.insert_object(WatchedObject::SecurityPolicy(SecurityPolicy {
        meta: ObjectMeta::new("", "restricted"),
        users: Vec::new(),
    }));

    let mut registry = HandlerRegistry::new();
    for phase in [
        ReconcilePhase::PreCreate,
        ReconcilePhase::PreUpdate,
        ReconcilePhase::PostDelete,
        ReconcilePhase::OperatorDelete,
    ] {
        registry.register(
            phase,
            ReconcileHandler::PolicyMembershipSync(PolicyMembershipSyncHandler),
        );
    }

    let mut account = ServiceAccount {
        meta: ObjectMeta::new("infra", "worker"),
    };
    account.meta.annotations.insert(
        POLICY_MEMBERSHIP_ANNOTATION.to_string(),
        "[\"restricted\"]".to_string(),
    );
    let mut events = EventBuffer::new();

    // PreUpdate inserts the member.
    let mut args = ReconcileArgs::new(ReconcilePhase::PreUpdate, "infra")
        .with_current(WatchedObject::ServiceAccount(account.clone()));
    registry
        .dispatch(&mut args, &mut store, &mut events)
        .expect("dispatch");
    let WatchedObject::SecurityPolicy(policy) = store
        .object(&ObjectRef::new(ObjectKind::SecurityPolicy, "", "restricted"))
        .expect("policy")
    else {
        panic!("wrong kind")
    };
    assert_eq!(policy.users, vec![member.clone()]);

    // OperatorDelete removes it again.
    let mut args = ReconcileArgs::new(ReconcilePhase::OperatorDelete, "infra")
        .with_current(WatchedObject::ServiceAccount(account));
    registry
        .dispatch(&mut args, &mut store, &mut events)
        .expect("dispatch");
    let WatchedObject::SecurityPolicy(policy) = store
        .object(&ObjectRef::new(ObjectKind::SecurityPolicy, "", "restricted"))
        .expect("policy")
    else {
        panic!("wrong kind")
    };
    assert!(policy.users.is_empty());
}

// =========================================================================
// Section 5: Relationship labels
// =========================================================================

#[test]
fn labels_stamped_once_then_stable() {
    let mut store = migrating_store(0);
    store.insert_object(WatchedObject::ConfigMap(ConfigMap {
        meta: ObjectMeta::new("infra", "leader-election"),
    }));
    let tracked = vec![
        ObjectRef::new(ObjectKind::ConfigMap, "infra", "leader-election"),
        ObjectRef::new(ObjectKind::Secret, "infra", "absent-secret"),
    ];
    let labels: BTreeMap<String, String> =
        [("app.kubernetes.io/managed-by", "vershed-operator")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
    let mut registry = HandlerRegistry::new();
    registry.register(
        ReconcilePhase::PostRead,
        ReconcileHandler::RelationshipLabels(RelationshipLabelsHandler::new(tracked, labels)),
    );
    let mut events = EventBuffer::new();

    let mut args = post_read_args(controller_deployment(true));
    registry
        .dispatch(&mut args, &mut store, &mut events)
        .expect("dispatch");
    assert_eq!(events.of_kind(EventKind::LabelsStamped).len(), 1);
    let stamped = store
        .object(&ObjectRef::new(ObjectKind::ConfigMap, "infra", "leader-election"))
        .expect("config map");
    assert_eq!(
        stamped
            .meta()
            .labels
            .get("app.kubernetes.io/managed-by")
            .map(String::as_str),
        Some("vershed-operator")
    );

    // Second dispatch finds everything already labeled.
    let writes_before = store.writes();
    let mut args = post_read_args(controller_deployment(true));
    registry
        .dispatch(&mut args, &mut store, &mut events)
        .expect("dispatch");
    assert_eq!(store.writes(), writes_before);
}

#[test]
fn labels_wait_for_a_ready_controller() {
    let mut store = migrating_store(0);
    store.insert_object(WatchedObject::ConfigMap(ConfigMap {
        meta: ObjectMeta::new("infra", "leader-election"),
    }));
    let tracked = vec![ObjectRef::new(ObjectKind::ConfigMap, "infra", "leader-election")];
    let labels: BTreeMap<String, String> = [("k".to_string(), "v".to_string())].into();
    let mut registry = HandlerRegistry::new();
    registry.register(
        ReconcilePhase::PostRead,
        ReconcileHandler::RelationshipLabels(RelationshipLabelsHandler::new(tracked, labels)),
    );
    let mut events = EventBuffer::new();
    let mut args = post_read_args(controller_deployment(false));
    registry
        .dispatch(&mut args, &mut store, &mut events)
        .expect("dispatch");
    assert_eq!(store.writes(), 0);
}

// =========================================================================
// Section 6: Error handling across handlers
// =========================================================================

#[test]
fn first_handler_error_stops_dispatch() {
    let mut store = migrating_store(0);
    // Two storage flags make the migration handler fail.
    let mut td = store
        .type_definition(TYPE_NAME)
        .expect("type definition")
        .clone();
    td.spec.versions = vec![
        SchemaVersionDecl::storage("v1alpha1"),
        SchemaVersionDecl::storage("v1beta1"),
    ];
    let mut fresh = InMemoryStore::new();
    fresh.insert_type_definition(td);
    fresh.insert_object(WatchedObject::ConfigMap(ConfigMap {
        meta: ObjectMeta::new("infra", "leader-election"),
    }));

    let mut registry = HandlerRegistry::new();
    registry.register(ReconcilePhase::PostRead, migration_handler());
    registry.register(
        ReconcilePhase::PostRead,
        ReconcileHandler::RelationshipLabels(RelationshipLabelsHandler::new(
            vec![ObjectRef::new(ObjectKind::ConfigMap, "infra", "leader-election")],
            [("k".to_string(), "v".to_string())].into(),
        )),
    );
    let mut events = EventBuffer::new();
    let mut args = post_read_args(controller_deployment(true));
    let err = registry
        .dispatch(&mut args, &mut fresh, &mut events)
        .unwrap_err();
    assert!(matches!(err, LifecycleError::Migration(_)));

    // The later handler never ran.
    let cm = fresh
        .object(&ObjectRef::new(ObjectKind::ConfigMap, "infra", "leader-election"))
        .expect("config map");
    assert!(cm.meta().labels.is_empty());
}
