//! Proxy reconciliation against a recording controller

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{harness, harness_with, test_settings};
use portico_control::{AttachRoute, ControlError, CycleOutcome, CyclePhase};

fn root_route(domain_id: &str, tls: bool) -> AttachRoute {
    AttachRoute {
        domain_id: domain_id.to_string(),
        service_id: "web".to_string(),
        path: "/".to_string(),
        port: 8080,
        tls,
    }
}

#[tokio::test]
async fn test_unchanged_state_is_not_reapplied() {
    let h = harness().await;
    let id = h.active_domain("steady.example.com").await;
    h.plane.attach_route(root_route(&id, true)).await.unwrap();

    let first = h.plane.reconciler().reconcile_once(false).await.unwrap();
    let CycleOutcome::Applied { hash } = first else {
        panic!("expected an applied cycle, got {first:?}");
    };
    let second = h.plane.reconciler().reconcile_once(false).await.unwrap();
    assert_eq!(second, CycleOutcome::Unchanged { hash: hash.clone() });
    assert_eq!(h.controller.applied_count(), 1);

    let status = h.plane.proxy_status();
    assert_eq!(status.phase, CyclePhase::Idle);
    assert_eq!(status.applied_hash.as_deref(), Some(hash.as_str()));
    assert!(status.last_error.is_none());

    // Forcing applies the same text again
    assert_eq!(h.plane.force_reload().await.unwrap(), hash);
    assert_eq!(h.controller.applied_count(), 2);
    let applied = h.controller.applied.lock().unwrap().clone();
    assert_eq!(applied[0], applied[1]);
}

#[tokio::test]
async fn test_rejected_config_keeps_previous_configuration() {
    let h = harness().await;
    let id = h.active_domain("safe.example.com").await;

    let CycleOutcome::Applied { hash } = h.plane.reconciler().reconcile_once(false).await.unwrap()
    else {
        panic!("first cycle should apply");
    };

    h.plane.attach_route(root_route(&id, true)).await.unwrap();
    h.controller.reject.store(true, Ordering::SeqCst);

    let outcome = h.plane.reconciler().reconcile_once(false).await.unwrap();
    assert!(
        matches!(&outcome, CycleOutcome::Aborted { reason } if reason.contains("test rejection")),
        "{outcome:?}"
    );
    assert_eq!(h.controller.applied_count(), 1);

    let status = h.plane.proxy_status();
    assert_eq!(status.applied_hash.as_deref(), Some(hash.as_str()));
    assert!(status.last_error.unwrap().contains("test rejection"));
    assert!(h.audit.names().contains(&"config.rejected"));

    let err = h.plane.force_reload().await.unwrap_err();
    assert!(matches!(err, ControlError::ConfigApply(_)), "{err:?}");

    let err = h.plane.validate_config().await.unwrap_err();
    assert!(matches!(err, ControlError::ConfigApply(_)), "{err:?}");

    // The proxy accepts it again, but the same state is not re-checked on its own
    h.controller.reject.store(false, Ordering::SeqCst);
    let checks = h.controller.validated.lock().unwrap().len();
    let outcome = h.plane.reconciler().reconcile_once(false).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Aborted { .. }), "{outcome:?}");
    assert_eq!(h.controller.validated.lock().unwrap().len(), checks);

    // A passing manual check lifts the rejection and the next cycle applies
    h.plane.validate_config().await.unwrap();
    let outcome = h.plane.reconciler().reconcile_once(false).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Applied { .. }), "{outcome:?}");
    assert!(h.controller.last_applied().unwrap().contains("proxy_pass http://web:8080;"));
    assert!(h.plane.proxy_status().last_error.is_none());
}

#[tokio::test]
async fn test_rejected_config_is_not_revalidated_until_state_changes() {
    let h = harness().await;
    let id = h.active_domain("stubborn.example.com").await;
    h.plane.reconciler().reconcile_once(false).await.unwrap();

    h.controller.reject.store(true, Ordering::SeqCst);
    h.plane.attach_route(root_route(&id, true)).await.unwrap();
    let outcome = h.plane.reconciler().reconcile_once(false).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Aborted { .. }), "{outcome:?}");
    let checks = h.controller.validated.lock().unwrap().len();

    for _ in 0..3 {
        let outcome = h.plane.reconciler().reconcile_once(false).await.unwrap();
        assert!(
            matches!(&outcome, CycleOutcome::Aborted { reason } if reason.contains("test rejection")),
            "{outcome:?}"
        );
    }
    assert_eq!(h.controller.validated.lock().unwrap().len(), checks);
    let rejections = h
        .audit
        .names()
        .into_iter()
        .filter(|name| *name == "config.rejected")
        .count();
    assert_eq!(rejections, 1);
    assert!(h.plane.proxy_status().last_error.is_some());

    // A different desired state is checked again
    h.plane
        .attach_route(AttachRoute {
            path: "/api".to_string(),
            ..root_route(&id, true)
        })
        .await
        .unwrap();
    h.plane.reconciler().reconcile_once(false).await.unwrap();
    assert_eq!(h.controller.validated.lock().unwrap().len(), checks + 1);

    // So is a forced reload of the same state
    h.plane.force_reload().await.unwrap_err();
    assert_eq!(h.controller.validated.lock().unwrap().len(), checks + 2);
    assert_eq!(h.controller.applied_count(), 1);
}

#[tokio::test]
async fn test_concurrent_applies_are_serialized() {
    let h = harness().await;
    h.active_domain("busy.example.com").await;
    h.controller.apply_delay_ms.store(30, Ordering::SeqCst);

    let reconciler = h.plane.reconciler().clone();
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let reconciler = reconciler.clone();
            tokio::spawn(async move { reconciler.force_apply().await })
        })
        .collect();
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        assert!(matches!(outcome, CycleOutcome::Applied { .. }));
    }

    assert_eq!(h.controller.applied_count(), 4);
    assert_eq!(h.controller.max_concurrent.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_verified_domain_without_certificate_is_excluded() {
    let h = harness().await;
    let id = h.active_domain("lapsed.example.com").await;
    h.plane.attach_route(root_route(&id, true)).await.unwrap();

    // The served certificate lapses; the domain drops back to verified
    let later = chrono::Utc::now() + chrono::Duration::days(120);
    let sweep = h.plane.certificates().sweep(later).await.unwrap();
    assert_eq!(sweep.expired.len(), 1);

    let generated = h.plane.render_config().await.unwrap();
    assert!(!generated.text.contains("server_name lapsed.example.com"));
    assert_eq!(generated.excluded.len(), 1);
    assert_eq!(generated.excluded[0].name, "lapsed.example.com");

    let outcome = h.plane.reconciler().reconcile_once(false).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Applied { .. }));
    assert_eq!(h.plane.proxy_status().excluded.len(), 1);
}

#[tokio::test]
async fn test_plain_http_route_is_served_without_certificate() {
    let h = harness().await;
    let id = h.active_domain("plain.example.com").await;
    h.plane.attach_route(root_route(&id, false)).await.unwrap();

    let generated = h.plane.render_config().await.unwrap();
    assert!(generated.text.contains("server_name plain.example.com"));
    assert!(generated.text.contains("proxy_pass http://web:8080;"));
}

#[tokio::test]
async fn test_live_config_seeds_applied_hash() {
    let h = harness().await;
    let CycleOutcome::Applied { hash } = h.plane.reconciler().reconcile_once(false).await.unwrap()
    else {
        panic!("first cycle should apply");
    };

    // A restarted control plane sees the configuration already in effect
    h.plane.reconciler().load_live_config().await.unwrap();
    let outcome = h.plane.reconciler().reconcile_once(false).await.unwrap();
    assert_eq!(outcome, CycleOutcome::Unchanged { hash });
}

#[tokio::test]
async fn test_run_loop_reacts_to_store_changes() {
    let mut settings = test_settings();
    settings.reconciler.interval_secs = 3600;
    settings.reconciler.sweep_interval_secs = 3600;
    let h = harness_with(settings).await;
    let id = h.active_domain("live.example.com").await;

    h.plane.start().await.unwrap();

    let wait_for = |needle: &'static str| {
        let controller = h.controller.clone();
        async move {
            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    if controller
                        .last_applied()
                        .is_some_and(|c| c.contains(needle))
                    {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .is_ok()
        }
    };

    assert!(wait_for("server_name live.example.com").await);
    h.plane.attach_route(root_route(&id, true)).await.unwrap();
    assert!(wait_for("proxy_pass http://web:8080;").await);

    h.plane.shutdown().await;
    let applied = h.controller.applied_count();
    let routes = h.plane.list_routes(Some(&id)).await.unwrap();
    h.plane.detach_route(&routes[0].id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.controller.applied_count(), applied);
}

#[tokio::test]
async fn test_triggers_during_a_cycle_coalesce_into_one_follow_up() {
    let mut settings = test_settings();
    settings.reconciler.interval_secs = 3600;
    settings.reconciler.sweep_interval_secs = 3600;
    let h = harness_with(settings).await;
    let id = h.active_domain("queue.example.com").await;
    h.controller.apply_delay_ms.store(200, Ordering::SeqCst);

    // Drop the change signal left by the setup above
    h.stores.signal.notified().await;

    h.plane.start().await.unwrap();

    let reconciler = h.plane.reconciler().clone();
    let applying = tokio::time::timeout(Duration::from_secs(5), async {
        while reconciler.status().phase != CyclePhase::Applying {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(applying.is_ok(), "first cycle never reached apply");

    h.plane.attach_route(root_route(&id, true)).await.unwrap();
    for _ in 0..5 {
        h.stores.signal.notify();
    }

    let controller = h.controller.clone();
    let second = tokio::time::timeout(Duration::from_secs(5), async {
        while controller.applied_count() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(second.is_ok(), "follow-up cycle never applied");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let status = h.plane.proxy_status();
    assert_eq!(status.cycles, 2);
    assert_eq!(status.phase, CyclePhase::Idle);
    assert_eq!(h.controller.applied_count(), 2);
    assert!(h.controller.last_applied().unwrap().contains("proxy_pass http://web:8080;"));

    h.plane.shutdown().await;
}
