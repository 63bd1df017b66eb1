//! Version compatibility and partition propagation.


use std::sync::Arc;
use std::time::Duration;

use consul_esm::compat::verify_compatibility;
use consul_esm::ErrorKind;
use esm_catalog::{Catalog, CheckStatus, HealthCheck, HealthCheckDefinition, HttpCatalog};
use harness::{start_agent, test_config, TestCatalog};

const WAIT: Duration = Duration::from_secs(10);

async fn run_compat_case(
    agent_version: &str,
    peer_version: Option<&str>,
) -> Result<(), consul_esm::EsmError> {
    let catalog = TestCatalog::start().await;
    catalog.set_agent_version(agent_version);
    catalog.register_peer("consul-esm", "consul-esm:peer-1", peer_version);

    let config = test_config(&catalog);
    let client: Arc<dyn Catalog> = Arc::new(HttpCatalog::new(&catalog.addr).expect("client"));
    verify_compatibility(&client, &config).await
}

#[tokio::test]
async fn compatibility_matrix() {
    // Catalog and peer both at the minimum: pass.
    run_compat_case("1.10.0", Some("1.10.0"))
        .await
        .expect("both at minimum");

    // Old catalog server: fail.
    let err = run_compat_case("1.0.0", Some("1.10.0"))
        .await
        .expect_err("old server must fail");
    assert_eq!(err.kind(), ErrorKind::Incompatible);

    // Old peer: fail.
    let err = run_compat_case("1.10.0", Some("1.0.0"))
        .await
        .expect_err("old peer must fail");
    assert_eq!(err.kind(), ErrorKind::Incompatible);

    // Peer without version metadata: pass (with a warning).
    run_compat_case("1.10.0", None)
        .await
        .expect("peer without version metadata is tolerated");
}

#[tokio::test]
async fn partition_rides_on_every_request() {
    let partition = "test-partition";
    let catalog = TestCatalog::start().await;
    catalog.expect_partition(partition);
    catalog.set_namespaces(&["default", "ns1", "ns2"]);

    // Seed an external node with a check so the probe path runs too.
    catalog.register_external_node("ext-1", "127.0.0.1");
    catalog.state().upsert_check(HealthCheck {
        node: "ext-1".to_string(),
        check_id: "ext-1-tcp".to_string(),
        name: "ext tcp".to_string(),
        status: CheckStatus::Critical,
        service_id: "ext-svc-1".to_string(),
        service_name: "ext-svc".to_string(),
        check_type: "tcp".to_string(),
        namespace: "ns1".to_string(),
        partition: partition.to_string(),
        definition: HealthCheckDefinition {
            tcp: "127.0.0.1:1".to_string(),
            interval: "500ms".to_string(),
            timeout: "500ms".to_string(),
            ..Default::default()
        },
        ..Default::default()
    });

    let mut config = test_config(&catalog);
    config.instance_id = "partitioned".to_string();
    config.partition = partition.to_string();
    let (agent, handle) = start_agent(config).await;

    // Let registration, roster polling, reconciliation, and writeback
    // all take a few laps.
    catalog
        .wait_for(WAIT, "probe result written", |state| {
            state
                .checks
                .values()
                .any(|c| c.check_id == "ext-1-tcp" && c.output.contains("TCP connect"))
        })
        .await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    agent.shutdown();
    let _ = tokio::time::timeout(WAIT, handle).await;

    let state = catalog.state();
    assert!(
        state.partition_violations.is_empty(),
        "requests missing partition: {:?}",
        state.partition_violations
    );
}
