//! Namespace discovery and merged health fetches.


use std::collections::HashMap;
use std::sync::Arc;

use consul_esm::reconcile::fetch_health_checks;
use esm_catalog::{Catalog, CheckStatus, HealthCheck, HttpCatalog};
use harness::{test_config, TestCatalog};

fn seed_check(catalog: &TestCatalog, ns: &str) {
    let name = if ns.is_empty() {
        "test_svc".to_string()
    } else {
        format!("{ns}_svc")
    };
    catalog.state().upsert_check(HealthCheck {
        node: "foo".to_string(),
        check_id: format!("{name}_ck"),
        name: format!("{name}_ck1"),
        status: CheckStatus::Passing,
        service_id: format!("{name}1"),
        service_name: name.clone(),
        check_type: "http".to_string(),
        namespace: ns.to_string(),
        ..Default::default()
    });
}

#[tokio::test]
async fn no_namespace_build_polls_once() {
    let catalog = TestCatalog::start().await;
    seed_check(&catalog, "");

    let config = test_config(&catalog);
    let client: Arc<dyn Catalog> = Arc::new(HttpCatalog::new(&catalog.addr).expect("client"));
    let mut indexes = HashMap::new();

    let checks = fetch_health_checks(&client, &config, &mut indexes, None)
        .await
        .expect("fetch");
    assert_eq!(checks.len(), 1);
    assert_eq!(checks[0].check_id, "test_svc_ck");
    assert_eq!(checks[0].namespace, "");

    let state = catalog.state();
    assert_eq!(state.health_state_ns_calls, vec![String::new()]);
}

#[tokio::test]
async fn namespaces_are_each_polled_and_merged() {
    let catalog = TestCatalog::start().await;
    catalog.set_namespaces(&["default", "ns1", "ns2"]);
    seed_check(&catalog, "ns1");
    seed_check(&catalog, "ns2");

    let config = test_config(&catalog);
    let client: Arc<dyn Catalog> = Arc::new(HttpCatalog::new(&catalog.addr).expect("client"));
    let mut indexes = HashMap::new();

    let mut checks = fetch_health_checks(&client, &config, &mut indexes, None)
        .await
        .expect("fetch");
    checks.sort_by(|a, b| a.check_id.cmp(&b.check_id));

    assert_eq!(checks.len(), 2);
    assert_eq!(checks[0].check_id, "ns1_svc_ck");
    assert_eq!(checks[1].check_id, "ns2_svc_ck");

    // One state call per namespace, each scoped with ns=<name>.
    let state = catalog.state();
    let mut calls = state.health_state_ns_calls.clone();
    calls.sort();
    assert_eq!(calls, vec!["default", "ns1", "ns2"]);

    // Cursors tracked per namespace.
    assert_eq!(indexes.len(), 3);
}

#[tokio::test]
async fn duplicate_checks_across_polls_are_merged_once() {
    let catalog = TestCatalog::start().await;
    catalog.set_namespaces(&["default", "ns1"]);
    seed_check(&catalog, "");

    // The mock returns namespace-less checks for every ns filter, so the
    // same check comes back from both polls; the merge must dedupe it.
    let config = test_config(&catalog);
    let client: Arc<dyn Catalog> = Arc::new(HttpCatalog::new(&catalog.addr).expect("client"));
    let mut indexes = HashMap::new();

    let checks = fetch_health_checks(&client, &config, &mut indexes, None)
        .await
        .expect("fetch");
    assert_eq!(checks.len(), 1);
}
