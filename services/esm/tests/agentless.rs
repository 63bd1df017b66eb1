//! Agentless (virtual node) mode.


use std::time::Duration;

use consul_esm::agent::TTL_CHECK_NAME;
use esm_catalog::CheckStatus;
use harness::{start_agent, test_config, TestCatalog};

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn virtual_node_with_two_sessions() {
    let catalog = TestCatalog::start().await;

    let mut config = test_config(&catalog);
    config.instance_id = "agentless-1".to_string();
    config.tag = "test".to_string();
    config.enable_agentless = true;
    config
        .node_meta
        .insert("initial-health".to_string(), "passing".to_string());
    let (agent, handle) = start_agent(config).await;

    let node_id = agent.agentless_node_id();
    let service_id = agent.service_id();
    let check_id = agent.ttl_check_id();

    catalog
        .wait_for(WAIT, "virtual node, service, and check", |state| {
            let services = state.services_named("consul-esm");
            if services.len() != 1 {
                return false;
            }
            assert_eq!(services[0].id, service_id);
            assert_eq!(services[0].node, node_id);
            assert_eq!(services[0].tags, vec!["test".to_string()]);

            let checks = state.node_checks(&node_id);
            checks.len() == 1
                && checks[0].check_id == check_id
                && checks[0].name == TTL_CHECK_NAME
                && checks[0].status == CheckStatus::Passing
        })
        .await;

    // Exactly two sessions: the node session and the service session,
    // each bound to the liveness check.
    catalog
        .wait_for(WAIT, "both sessions", |state| state.sessions.len() == 2)
        .await;
    {
        let state = catalog.state();
        let mut names: Vec<String> = state.sessions.values().map(|s| s.name.clone()).collect();
        names.sort();
        assert!(names.contains(&agent.agentless_session_name()));
        for session in state.sessions.values() {
            assert_eq!(session.node, node_id);
            assert_eq!(session.node_checks, vec![check_id.clone()]);
            assert_eq!(session.checks, vec![check_id.clone()]);
        }
    }

    // Reap the virtual node out from under the instance; it must
    // restore itself.
    {
        let mut state = catalog.state();
        state.nodes.remove(&node_id);
        let node = node_id.clone();
        state.services.retain(|_, s| s.node != node);
        state.checks.retain(|_, c| c.node != node);
    }
    catalog
        .wait_for(WAIT, "virtual node restored", |state| {
            state.services_named("consul-esm").len() == 1
                && state.node_checks(&node_id).len() == 1
        })
        .await;

    agent.shutdown();
    let result = tokio::time::timeout(WAIT, handle).await.expect("run joined");
    result.expect("task").expect("clean run");

    let state = catalog.state();
    assert!(state.services_named("consul-esm").is_empty());
    assert!(state.sessions.is_empty(), "sessions not destroyed");
    assert!(!state.nodes.contains_key(&node_id), "virtual node left behind");
}

#[tokio::test]
async fn virtual_node_health_defaults_to_critical() {
    let catalog = TestCatalog::start().await;

    let mut config = test_config(&catalog);
    config.instance_id = "agentless-2".to_string();
    config.enable_agentless = true;
    let (agent, handle) = start_agent(config).await;

    let node_id = agent.agentless_node_id();
    catalog
        .wait_for(WAIT, "critical liveness check", |state| {
            let checks = state.node_checks(&node_id);
            checks.len() == 1 && checks[0].status == CheckStatus::Critical
        })
        .await;

    agent.shutdown();
    let _ = tokio::time::timeout(WAIT, handle).await;
}
