#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eight_steps, fast_config, helpdesk, tenant, versions};
use tenant_schema_sdk::{TenantSchemaClient, TenantSchemaError, TenantState};

#[tokio::test]
async fn ensure_ready_provisions_unknown_tenants() {
    let (backend, lifecycle) = helpdesk(fast_config());
    let acme = tenant("acme");

    lifecycle.ensure_tenant_ready(&acme).await.unwrap();
    assert_eq!(lifecycle.tenants().state(&acme).await.unwrap(), TenantState::Ready);
    assert_eq!(versions(&backend, "tenant_acme"), [1, 2, 3, 4, 5, 6]);
}

#[tokio::test]
async fn lookalike_tenant_ids_get_their_own_namespace() {
    let (backend, lifecycle) = helpdesk(fast_config());
    let upper = tenant("Acme");
    lifecycle.ensure_tenant_ready(&upper).await.unwrap();
    let upper_ns = lifecycle.tenants().namespace_for(&upper);

    let lookalike = tenant(upper_ns.strip_prefix("tenant_").unwrap());
    lifecycle.ensure_tenant_ready(&lookalike).await.unwrap();
    let lookalike_ns = lifecycle.tenants().namespace_for(&lookalike);

    assert_ne!(upper_ns, lookalike_ns);
    assert_eq!(backend.namespace_creations(), 2);
    assert_eq!(versions(&backend, &upper_ns).len(), 6);
    assert_eq!(versions(&backend, &lookalike_ns).len(), 6);
}

#[tokio::test]
async fn ready_tenants_are_served_from_cache_until_ttl() {
    let mut cfg = fast_config();
    cfg.ready_cache_ttl = Duration::from_millis(100);
    let (backend, lifecycle) = helpdesk(cfg);
    let acme = tenant("acme");
    lifecycle.ensure_tenant_ready(&acme).await.unwrap();

    // Every backend call fails from now on; only the cache can answer.
    backend.fail_connections(usize::MAX);
    lifecycle.ensure_tenant_ready(&acme).await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    let err = lifecycle.ensure_tenant_ready(&acme).await.unwrap_err();
    assert!(err.is_retryable(), "{err}");

    backend.clear_faults();
    lifecycle.ensure_tenant_ready(&acme).await.unwrap();
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let (backend, lifecycle) = helpdesk(fast_config());
    backend.fail_connections(2);
    lifecycle.ensure_tenant_ready(&tenant("acme")).await.unwrap();
}

#[tokio::test]
async fn retries_are_bounded() {
    let (backend, lifecycle) = helpdesk(fast_config());
    backend.fail_connections(3);

    let err = lifecycle.ensure_tenant_ready(&tenant("acme")).await.unwrap_err();
    match err {
        TenantSchemaError::NotReady {
            retryable, reason, ..
        } => {
            assert!(retryable);
            assert!(reason.contains("connection"), "{reason}");
        }
        TenantSchemaError::Internal(e) => panic!("unexpected internal error: {e}"),
    }

    lifecycle.ensure_tenant_ready(&tenant("acme")).await.unwrap();
}

#[tokio::test]
async fn drift_is_healed_on_the_way_in() {
    let mut cfg = fast_config();
    cfg.ready_cache_ttl = Duration::ZERO;
    let (backend, lifecycle) = helpdesk(cfg);
    let acme = tenant("acme");
    lifecycle.ensure_tenant_ready(&acme).await.unwrap();

    backend.drop_table("tenant_acme", "audit_log");
    backend.drop_index("tenant_acme", "tickets", "idx_tickets_status");
    lifecycle.ensure_tenant_ready(&acme).await.unwrap();

    let live = backend.snapshot("tenant_acme").unwrap();
    assert!(live.table("audit_log").is_some());
    assert!(live.table("tickets").unwrap().indexes.contains_key("idx_tickets_status"));
    assert_eq!(lifecycle.tenants().state(&acme).await.unwrap(), TenantState::Ready);
}

#[tokio::test]
async fn validation_only_mode_reports_not_ready() {
    let mut cfg = fast_config();
    cfg.ready_cache_ttl = Duration::ZERO;
    cfg.healing_enabled = false;
    let (backend, lifecycle) = helpdesk(cfg);
    let acme = tenant("acme");
    lifecycle.ensure_tenant_ready(&acme).await.unwrap();

    backend.drop_column("tenant_acme", "tickets", "priority");
    let err = lifecycle.ensure_tenant_ready(&acme).await.unwrap_err();
    assert!(err.is_not_ready());
    assert!(!err.is_retryable());
    assert!(err.to_string().contains("healing is disabled"), "{err}");
    assert!(!backend.snapshot("tenant_acme").unwrap().tables["tickets"].columns.contains_key("priority"));
    assert_eq!(lifecycle.tenants().state(&acme).await.unwrap(), TenantState::Degraded);
}

#[tokio::test]
async fn unsafe_drift_keeps_tenant_degraded() {
    let mut cfg = fast_config();
    cfg.ready_cache_ttl = Duration::ZERO;
    let (backend, lifecycle) = helpdesk(cfg);
    let acme = tenant("acme");
    lifecycle.ensure_tenant_ready(&acme).await.unwrap();

    backend.alter_column_type("tenant_acme", "tickets", "number", "text");
    let err = lifecycle.ensure_tenant_ready(&acme).await.unwrap_err();
    assert!(!err.is_retryable());
    assert!(err.to_string().contains("not a safe repair"), "{err}");

    let record = lifecycle.tenants().record(&acme).await.unwrap().unwrap();
    assert_eq!(record.state, TenantState::Degraded);
    assert!(record.last_error.unwrap().contains("tickets.number"));
}

#[tokio::test]
async fn failed_migration_is_not_retried_but_recovers_after_fix() {
    let (backend, lifecycle) = eight_steps(fast_config());
    let acme = tenant("acme");
    backend.fail_on_version(3, "column \"c3\" of relation \"events\" already exists");

    let err = lifecycle.ensure_tenant_ready(&acme).await.unwrap_err();
    assert!(err.is_not_ready() && !err.is_retryable());
    assert_eq!(versions(&backend, "tenant_acme"), [1, 2]);
    assert_eq!(lifecycle.tenants().state(&acme).await.unwrap(), TenantState::Degraded);

    backend.clear_faults();
    lifecycle.ensure_tenant_ready(&acme).await.unwrap();
    assert_eq!(versions(&backend, "tenant_acme").len(), 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_share_one_provisioning() {
    let (backend, lifecycle) = helpdesk(fast_config());
    let client: Arc<dyn TenantSchemaClient> = lifecycle;

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.ensure_tenant_ready(&tenant("acme")).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(backend.namespace_creations(), 1);
    assert_eq!(versions(&backend, "tenant_acme"), [1, 2, 3, 4, 5, 6]);
}

#[tokio::test]
async fn health_report_through_the_client_trait() {
    let (backend, lifecycle) = helpdesk(fast_config());
    lifecycle.setup().await.unwrap();
    let client: Arc<dyn TenantSchemaClient> = lifecycle;
    client.ensure_tenant_ready(&tenant("a")).await.unwrap();
    client.ensure_tenant_ready(&tenant("b")).await.unwrap();
    backend.drop_column("tenant_b", "ticket_comments", "internal");

    let report = client.get_health_report().await.unwrap();
    assert_eq!(report.summary.total, 2);
    assert_eq!(report.summary.compliant, 1);
    assert_eq!(report.summary.partial, 1);
    assert_eq!(report.summary.compliance_bps, 5_000);

    backend.fail_connections(1);
    let err = client.get_health_report().await.unwrap_err();
    assert!(matches!(err, TenantSchemaError::Internal(_)));
}
