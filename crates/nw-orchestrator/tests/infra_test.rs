//! Scaffolding probes and setup against the fake router

mod common;

use nw_core::error::WardenError;
use nw_core::types::Phase;
use nw_orchestrator::infra::Component;

use common::{group_sync, FakeRouter};

#[tokio::test]
async fn test_fresh_router_is_missing_everything() {
    let router = FakeRouter::new();
    let (_controller, sync) = group_sync(&router);

    let first = sync.reconciler().check_existing().await.unwrap();
    assert!(!first.all_satisfied);
    assert_eq!(first.missing, Component::ALL.to_vec());

    // Probing changes nothing
    let second = sync.reconciler().check_existing().await.unwrap();
    assert_eq!(first, second);
    assert!(router.mutations().is_empty());
}

#[tokio::test]
async fn test_ensure_creates_everything_once() {
    let router = FakeRouter::new();
    let (_controller, sync) = group_sync(&router);

    let report = sync.reconciler().ensure(false).await.unwrap();
    assert_eq!(report.created, Component::ALL.to_vec());
    assert_eq!(report.cleanup_failures, 0);

    let check = sync.reconciler().check_existing().await.unwrap();
    assert!(check.all_satisfied, "{:?}", check.details);
    assert_eq!(
        router.chain("mangle", "FORWARD").unwrap(),
        vec!["-j NW_GROUPS".to_string()]
    );
    let document = sync.store().load().await.unwrap();
    assert!(document.infrastructure.base_setup_complete);

    router.clear_log();
    let again = sync.reconciler().ensure(false).await.unwrap();
    assert!(again.is_empty());
    assert!(router.mutations().is_empty());
}

#[tokio::test]
async fn test_shaping_covers_every_interface_but_loopback() {
    let router = FakeRouter::new();
    let (_controller, sync) = group_sync(&router);

    sync.reconciler().ensure(false).await.unwrap();

    for iface in ["br-lan", "eth0"] {
        assert_eq!(router.class_ids(iface), vec![1, 10, 20]);
        assert_eq!(router.filter_class(iface, 10), Some(10));
        assert_eq!(router.filter_class(iface, 20), Some(20));
    }
    assert!(router.class_ids("lo").is_empty());
}

#[tokio::test]
async fn test_only_missing_component_is_created() {
    let router = FakeRouter::new();
    let (_controller, sync) = group_sync(&router);
    sync.reconciler().ensure(false).await.unwrap();
    router.remove_chain("mangle", "NW_DENY");
    router.clear_log();

    let check = sync.reconciler().check_existing().await.unwrap();
    assert_eq!(check.missing, vec![Component::DenyChain]);

    let report = sync.reconciler().ensure(false).await.unwrap();
    assert_eq!(report.created, vec![Component::DenyChain]);
    assert!(router.ran("iptables -t mangle -N NW_DENY"));
    assert!(!router.ran("iptables -t mangle -N NW_ALLOW"));
    assert!(!router.ran("tc qdisc"));
}

#[tokio::test]
async fn test_restart_recreates_present_components() {
    let router = FakeRouter::new();
    let (_controller, sync) = group_sync(&router);
    sync.reconciler().ensure(false).await.unwrap();
    router.clear_log();

    let report = sync.reconciler().ensure(true).await.unwrap();
    assert_eq!(report.created, Component::ALL.to_vec());
    assert!(router.ran("tc qdisc replace dev 'br-lan'"));

    // Still exactly one hook after re-running setup
    assert_eq!(router.chain("mangle", "FORWARD").unwrap().len(), 1);
}

#[tokio::test]
async fn test_restart_empties_existing_chains() {
    let router = FakeRouter::new();
    let (_controller, sync) = group_sync(&router);
    sync.reconciler().ensure(false).await.unwrap();
    router.add_rule("mangle", "NW_GROUPS", "-d 10.0.0.66 -j MARK --set-mark 555");
    router.add_rule("mangle", "NW_DENY", "-d 10.0.0.66 -j RETURN");

    // A plain ensure leaves stale rules alone
    sync.reconciler().ensure(false).await.unwrap();
    assert_eq!(router.chain("mangle", "NW_GROUPS").unwrap().len(), 1);

    sync.reconciler().ensure(true).await.unwrap();
    assert!(router.chain("mangle", "NW_GROUPS").unwrap().is_empty());
    assert!(router.chain("mangle", "NW_DENY").unwrap().is_empty());
    assert_eq!(
        router.chain("mangle", "FORWARD").unwrap(),
        vec!["-j NW_GROUPS".to_string()]
    );
}

#[tokio::test]
async fn test_missing_tc_binary_fails_setup() {
    let router = FakeRouter::new();
    let (_controller, sync) = group_sync(&router);
    router.fail_command("tc qdisc replace", "sh: tc: not found");

    let err = sync.reconciler().ensure(false).await.unwrap_err();
    assert!(matches!(
        err,
        WardenError::CommandFailure { phase: Phase::Infrastructure, ref stderr, .. }
            if stderr.contains("tc: not found")
    ));

    let check = sync.reconciler().check_existing().await.unwrap();
    assert!(check.missing.contains(&Component::ShapingClasses));
}

#[tokio::test]
async fn test_legacy_chains_are_removed() {
    let router = FakeRouter::new();
    let (_controller, sync) = group_sync(&router);
    router.add_rule("filter", "NW_WHITELIST", "-j ACCEPT");
    router.add_rule("filter", "FORWARD", "-j NW_WHITELIST");

    let report = sync.reconciler().ensure(false).await.unwrap();
    assert_eq!(report.cleanup_failures, 0);
    assert!(router.chain("filter", "NW_WHITELIST").is_none());
    assert!(router.chain("filter", "FORWARD").unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_probe_counts_as_missing() {
    let router = FakeRouter::new();
    let (_controller, sync) = group_sync(&router);
    sync.reconciler().ensure(false).await.unwrap();
    router.fail_command("-nL NW_ALLOW", "iptables: Permission denied (you must be root).");

    let check = sync.reconciler().check_existing().await.unwrap();
    assert_eq!(check.missing, vec![Component::AllowChain]);
    assert!(check.details[&Component::AllowChain].starts_with("probe failed"));
    assert_eq!(check.details[&Component::DenyChain], "present");
}

#[tokio::test]
async fn test_preview_runs_no_mutation() {
    let router = FakeRouter::new();
    let (_controller, sync) = group_sync(&router);

    let report = sync.reconciler().preview(false).await.unwrap();
    assert_eq!(report.created, Component::ALL.to_vec());
    assert!(!report.commands.is_empty());
    assert!(router.mutations().is_empty());
}
