//! Instance registration lifecycle against a mock catalog.


use std::collections::HashMap;
use std::time::Duration;

use consul_esm::agent::TTL_CHECK_NAME;
use esm_catalog::CheckStatus;
use harness::{spawn_agent, start_agent, test_config, TestCatalog};

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn registration_round_trip() {
    let catalog = TestCatalog::start().await;

    let mut config = test_config(&catalog);
    config.instance_id = "round-trip".to_string();
    config.tag = "test".to_string();
    let (agent, handle) = start_agent(config).await;
    let service_id = agent.service_id();
    let check_id = agent.ttl_check_id();

    // Service and TTL check registered with the expected shape.
    catalog
        .wait_for(WAIT, "service + passing TTL check", |state| {
            let services = state.services_named("consul-esm");
            if services.len() != 1 {
                return false;
            }
            let svc = &services[0];
            assert_eq!(svc.id, service_id);
            assert_eq!(svc.tags, vec!["test".to_string()]);
            assert_eq!(
                svc.meta,
                HashMap::from([("external-source".to_string(), "consul-esm".to_string())])
            );

            let checks = state.checks_for_service("consul-esm");
            checks.len() == 1
                && checks[0].check_id == check_id
                && checks[0].name == TTL_CHECK_NAME
                && checks[0].status == CheckStatus::Passing
        })
        .await;

    // An external actor deregisters us; the instance must heal itself.
    {
        let mut state = catalog.state();
        let id = service_id.clone();
        state.services.remove(&id);
        state.checks.retain(|_, c| c.service_id != id);
    }
    catalog
        .wait_for(WAIT, "re-registration after external deregister", |state| {
            state.services_named("consul-esm").len() == 1
                && state.checks_for_service("consul-esm").len() == 1
        })
        .await;

    // Graceful shutdown leaves no residue.
    agent.shutdown();
    let result = tokio::time::timeout(WAIT, handle).await.expect("run joined");
    result.expect("task").expect("clean run");

    let state = catalog.state();
    assert!(state.services_named("consul-esm").is_empty());
    assert!(state.checks_for_service("consul-esm").is_empty());
    assert!(state.kv.is_empty(), "instance lock not cleaned up");
}

#[tokio::test]
async fn unique_instance_ids_coexist() {
    let catalog = TestCatalog::start().await;

    let mut config1 = test_config(&catalog);
    config1.instance_id = "unique-instance-id-1".to_string();
    let (agent1, handle1) = start_agent(config1).await;

    catalog
        .wait_for(WAIT, "first instance registered", |state| {
            state.services_named("consul-esm").len() == 1
        })
        .await;

    let mut config2 = test_config(&catalog);
    config2.instance_id = "unique-instance-id-2".to_string();
    let (agent2, handle2) = start_agent(config2).await;

    catalog
        .wait_for(WAIT, "both instances registered", |state| {
            let services = state.services_named("consul-esm");
            services.len() == 2
                && services[0].id == "consul-esm:unique-instance-id-1"
                && services[1].id == "consul-esm:unique-instance-id-2"
        })
        .await;

    agent1.shutdown();
    agent2.shutdown();
    let _ = tokio::time::timeout(WAIT, handle1).await;
    let _ = tokio::time::timeout(WAIT, handle2).await;
}

#[tokio::test]
async fn duplicate_instance_id_fails() {
    let catalog = TestCatalog::start().await;

    let mut config1 = test_config(&catalog);
    config1.instance_id = "not-unique-instance-id".to_string();
    let (agent1, handle1) = start_agent(config1).await;

    catalog
        .wait_for(WAIT, "first instance registered", |state| {
            state.services_named("consul-esm").len() == 1
        })
        .await;

    // Second instance under the same id must fail fast with
    // AlreadyExists and leave the first untouched.
    let mut config2 = test_config(&catalog);
    config2.instance_id = "not-unique-instance-id".to_string();
    let (_agent2, handle2) = spawn_agent(config2);

    let result = tokio::time::timeout(WAIT, handle2)
        .await
        .expect("second run returned")
        .expect("task");
    let err = result.expect_err("duplicate registration must fail");
    assert!(err.is_already_exists(), "wrong error kind: {err}");

    assert!(!handle1.is_finished(), "first instance must keep running");
    assert_eq!(catalog.state().services_named("consul-esm").len(), 1);

    agent1.shutdown();
    let _ = tokio::time::timeout(WAIT, handle1).await;
}
