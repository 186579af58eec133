#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::collections::HashSet;
use std::time::Duration;

use common::{eight_steps, fast_config, helpdesk, tenant, versions};
use tenant_schema::backend::HeldLock;
use tenant_schema::ident::lock_key;
use tenant_schema::{SchemaBackend, SchemaError};
use tenant_schema_sdk::{Scope, TenantState};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_provisioning_creates_one_namespace() {
    let (backend, lifecycle) = helpdesk(fast_config());
    let acme = tenant("acme");

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let lifecycle = lifecycle.clone();
            let acme = acme.clone();
            tokio::spawn(async move { lifecycle.provision(&acme).await })
        })
        .collect();

    let mut created = 0;
    let mut applied = 0;
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        created += usize::from(outcome.created);
        applied += outcome.migration.applied;
        assert_eq!(outcome.state, TenantState::Ready);
    }

    assert_eq!(created, 1);
    assert_eq!(applied, 6, "the full sequence ran exactly once");
    assert_eq!(backend.namespace_creations(), 1);

    let ledger = versions(&backend, "tenant_acme");
    assert_eq!(ledger, [1, 2, 3, 4, 5, 6]);
    let unique: HashSet<_> = ledger.iter().collect();
    assert_eq!(unique.len(), ledger.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn different_tenants_migrate_in_parallel() {
    let (backend, lifecycle) = eight_steps(fast_config());
    // A slow migration in every namespace; serialized runs would take 8 x 200ms.
    backend.stall_on_version(3, Duration::from_millis(200));

    let started = tokio::time::Instant::now();
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.provision(&tenant(&format!("t{i}"))).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert!(started.elapsed() < Duration::from_millis(1_200));

    for i in 0..8 {
        assert_eq!(versions(&backend, &format!("tenant_t{i}")).len(), 8);
    }
}

#[tokio::test]
async fn busy_lock_surfaces_as_contention() {
    let mut cfg = fast_config();
    cfg.lock_timeout = Duration::from_millis(100);
    let (backend, lifecycle) = helpdesk(cfg);
    let acme = tenant("acme");

    let held = backend
        .try_lock(&lock_key(Scope::PerTenant, "tenant_acme"))
        .await
        .unwrap()
        .unwrap();

    let err = lifecycle.provision(&acme).await.unwrap_err();
    assert!(matches!(err, SchemaError::LockContention { .. }), "{err}");
    assert!(err.is_transient());
    assert_ne!(
        lifecycle.tenants().state(&acme).await.unwrap(),
        TenantState::Degraded,
        "contention is not a tenant fault"
    );
    assert_eq!(backend.namespace_creations(), 0);

    held.release().await.unwrap();
    lifecycle.provision(&acme).await.unwrap();
    assert_eq!(backend.namespace_creations(), 1);
}

#[tokio::test]
async fn shared_and_tenant_locks_are_independent() {
    let mut cfg = fast_config();
    cfg.lock_timeout = Duration::from_millis(100);
    let (backend, lifecycle) = helpdesk(cfg);

    let _shared = backend
        .try_lock(&lock_key(Scope::Shared, "public"))
        .await
        .unwrap()
        .unwrap();

    lifecycle.provision(&tenant("acme")).await.unwrap();
    assert!(matches!(
        lifecycle.migrate_shared().await.unwrap_err(),
        SchemaError::LockContention { .. }
    ));
}

#[tokio::test]
async fn stalled_migration_times_out_and_rolls_back() {
    let mut cfg = fast_config();
    cfg.statement_timeout = Duration::from_millis(50);
    let (backend, lifecycle) = eight_steps(cfg);
    backend.stall_on_version(2, Duration::from_secs(5));

    let err = lifecycle.provision(&tenant("acme")).await.unwrap_err();
    match &err {
        SchemaError::MigrationFailed { version, cause, .. } => {
            assert_eq!(*version, 2);
            assert!(cause.contains("timed out"), "{cause}");
        }
        other => panic!("expected MigrationFailed, got {other:?}"),
    }
    assert_eq!(versions(&backend, "tenant_acme"), [1]);
    let events = backend.snapshot("tenant_acme").unwrap();
    assert!(!events.table("events").unwrap().columns.contains_key("c2"));

    backend.clear_faults();
    let outcome = lifecycle.provision(&tenant("acme")).await.unwrap();
    assert_eq!(outcome.migration.applied_versions, [2, 3, 4, 5, 6, 7, 8]);
}

#[tokio::test]
async fn lock_is_released_after_a_failed_run() {
    let mut cfg = fast_config();
    cfg.lock_timeout = Duration::from_millis(100);
    let (backend, lifecycle) = eight_steps(cfg);
    backend.fail_on_version(1, "permission denied for schema tenant_acme");

    assert!(lifecycle.provision(&tenant("acme")).await.is_err());
    let lock = backend
        .try_lock(&lock_key(Scope::PerTenant, "tenant_acme"))
        .await
        .unwrap();
    assert!(lock.is_some(), "failed provisioning must not keep the lock");
}
