//! End-to-end cluster scenarios against the in-memory runtime

use flotilla::cluster::{ClusterGraph, ClusterOrchestrator, ClusterState, ManifestParser, ReuseRegistry, StartMode};
use flotilla::container::{ContainerScript, RuntimeEvent, SimulatedRuntime};
use flotilla::error::FlotillaError;
use flotilla::network::{NetworkFabric, Vantage};
use flotilla::node::{NodeState, ReadinessPolicy, ServiceNode};
use flotilla::settings::Settings;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const BROKER_READY: &str = "[KafkaServer id=1] Kafka Server started (kafka.server.KafkaServer)";
const REGISTRY_READY: &str = "Server started, listening for requests...";
const SQL_READY: &str = "INFO Server up and running";

fn launches(runtime: &SimulatedRuntime) -> Vec<String> {
    runtime.journal().unwrap().into_iter()
        .filter_map(|e| match e {
            RuntimeEvent::Launched(node) => Some(node),
            _ => None,
        })
        .collect()
}

fn stops(runtime: &SimulatedRuntime) -> Vec<String> {
    runtime.journal().unwrap().into_iter()
        .filter_map(|e| match e {
            RuntimeEvent::Stopped(node) => Some(node),
            _ => None,
        })
        .collect()
}

fn script_ready(runtime: &SimulatedRuntime) {
    runtime.script("broker", ContainerScript::new().log(Duration::from_millis(20), BROKER_READY)).unwrap();
    runtime.script("registry", ContainerScript::new().log(Duration::from_millis(20), REGISTRY_READY)).unwrap();
    runtime.script("sqlserver", ContainerScript::new().log(Duration::from_millis(20), SQL_READY)).unwrap();
}

fn confluent_graph(registry: ServiceNode) -> ClusterGraph {
    let mut graph = ClusterGraph::new();
    graph.add_node(ServiceNode::broker("broker"), &[]).unwrap();
    graph.add_node(registry, &["broker"]).unwrap();
    graph.add_node(ServiceNode::sql_server("sqlserver"), &["broker", "registry"]).unwrap();
    graph
}

fn log_ready_registry() -> ServiceNode {
    ServiceNode::schema_registry("registry")
        .with_readiness(ReadinessPolicy::log_pattern("Server started, listening"))
}

fn cluster(runtime: &SimulatedRuntime, graph: ClusterGraph, network: &str) -> ClusterOrchestrator {
    ClusterOrchestrator::new(graph, Arc::new(NetworkFabric::new(network)), Arc::new(runtime.clone()))
        .with_default_timeout(Duration::from_secs(5))
}

/// Answer every request with `503 Service Unavailable`
async fn unavailable_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                    .await;
            });
        }
    });

    port
}

#[tokio::test]
async fn confluent_stack_starts_in_dependency_order() {
    let runtime = SimulatedRuntime::new();
    script_ready(&runtime);
    let mut cluster = cluster(&runtime, confluent_graph(log_ready_registry()), "scenario-order");

    assert!(matches!(cluster.endpoint("registry"), Err(FlotillaError::NotRunning(_))));

    cluster.start().await.unwrap();
    assert_eq!(launches(&runtime), vec!["broker", "registry", "sqlserver"]);

    let registry = cluster.endpoint("registry").unwrap();
    assert_eq!(registry.address(Vantage::Fabric), "schema-registry:8081");
    assert_eq!(registry.internal_http_url(), "http://schema-registry:8081");
    assert!(registry.http_url().starts_with("http://127.0.0.1:"));

    let spec = runtime.launched_spec("registry").unwrap().unwrap();
    assert_eq!(spec.env["SCHEMA_REGISTRY_KAFKASTORE_BOOTSTRAP_SERVERS"], "PLAINTEXT://kafka:9092");
    assert_eq!(spec.env["SCHEMA_REGISTRY_HOST_NAME"], "schema-registry");

    cluster.stop().await.unwrap();
    assert_eq!(stops(&runtime), vec!["sqlserver", "registry", "broker"]);
    assert!(runtime.running().unwrap().is_empty());
}

#[tokio::test]
async fn http_probe_timeout_stops_started_nodes() {
    let port = unavailable_server().await;

    let runtime = SimulatedRuntime::new();
    script_ready(&runtime);
    runtime.script("registry", ContainerScript::new().publish(8081, port)).unwrap();

    let registry = ServiceNode::schema_registry("registry")
        .with_readiness(ReadinessPolicy::http_status("/subjects", 200).with_interval(Duration::from_millis(50)))
        .with_startup_timeout(Duration::from_millis(600));
    let mut cluster = cluster(&runtime, confluent_graph(registry), "scenario-timeout");

    let err = cluster.start().await.unwrap_err();

    match err.root() {
        FlotillaError::StartupTimeout { node, last, .. } => {
            assert_eq!(node, "registry");
            assert!(last.as_deref().unwrap_or_default().contains("503"));
        }
        other => panic!("expected a startup timeout, got {other}"),
    }
    assert_eq!(cluster.state(), ClusterState::Failed);
    assert_eq!(launches(&runtime), vec!["broker", "registry"]);
    assert_eq!(stops(&runtime), vec!["registry", "broker"]);
    assert_eq!(cluster.node("sqlserver").unwrap().state(), NodeState::Created);
    assert_eq!(runtime.network_count().unwrap(), 0);
}

#[tokio::test]
async fn process_exit_is_reported_before_timeout() {
    let runtime = SimulatedRuntime::new();
    script_ready(&runtime);
    runtime.script("broker", ContainerScript::new()
        .log(Duration::ZERO, "ERROR Exiting Kafka due to fatal exception")
        .exit(Duration::from_millis(30), 1)).unwrap();

    let mut cluster = cluster(&runtime, confluent_graph(log_ready_registry()), "scenario-exit");
    let started = tokio::time::Instant::now();
    let err = cluster.start().await.unwrap_err();

    assert!(matches!(err.root(), FlotillaError::ProcessExit { node, code: Some(1) } if node == "broker"));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(launches(&runtime), vec!["broker"]);
}

#[tokio::test]
async fn stop_is_idempotent() {
    let runtime = SimulatedRuntime::new();
    script_ready(&runtime);
    let mut cluster = cluster(&runtime, confluent_graph(log_ready_registry()), "scenario-idempotent");

    // stopping before start does nothing
    cluster.stop().await.unwrap();
    assert_eq!(cluster.state(), ClusterState::Unstarted);

    cluster.start().await.unwrap();
    cluster.stop().await.unwrap();
    cluster.stop().await.unwrap();

    assert_eq!(cluster.state(), ClusterState::Stopped);
    assert_eq!(stops(&runtime).len(), 3);
}

#[tokio::test]
async fn aliases_are_unique_per_fabric() {
    let runtime = SimulatedRuntime::new();
    let fabric = Arc::new(NetworkFabric::new("scenario-alias"));

    let mut graph = ClusterGraph::new();
    graph.add_node(ServiceNode::broker("broker"), &[]).unwrap();
    graph.add_node(ServiceNode::generic("cache", "redis:7", 6379).unwrap().with_alias("kafka"), &[]).unwrap();

    let mut cluster = ClusterOrchestrator::new(graph, fabric.clone(), Arc::new(runtime.clone()));
    let err = cluster.start().await.unwrap_err();

    assert!(matches!(err, FlotillaError::AliasConflict { ref alias, .. } if alias == "kafka"));
    assert!(runtime.journal().unwrap().is_empty());
    assert!(fabric.members().unwrap().is_empty());
}

#[tokio::test]
async fn cancellation_cleans_up_partial_cluster() {
    let runtime = SimulatedRuntime::new();
    script_ready(&runtime);
    runtime.script("sqlserver", ContainerScript::new().log(Duration::ZERO, "waiting for registry")).unwrap();

    let mut cluster = cluster(&runtime, confluent_graph(log_ready_registry()), "scenario-cancel");
    let err = cluster
        .start_until(tokio::time::sleep(Duration::from_millis(500)))
        .await
        .unwrap_err();

    assert!(matches!(err.root(), FlotillaError::Cancelled));
    assert_eq!(stops(&runtime), vec!["sqlserver", "registry", "broker"]);
    assert!(runtime.running().unwrap().is_empty());
    assert!(cluster.fabric().members().unwrap().is_empty());
}

#[tokio::test]
async fn cancelling_during_launch_removes_the_container() {
    let runtime = SimulatedRuntime::new();
    script_ready(&runtime);
    runtime.script("broker", ContainerScript::new()
        .log(Duration::ZERO, BROKER_READY)
        .launch_delay(Duration::from_millis(800))).unwrap();

    let mut graph = ClusterGraph::new();
    graph.add_node(ServiceNode::broker("broker"), &[]).unwrap();

    let mut cluster = cluster(&runtime, graph, "scenario-cancel-launch");
    let err = cluster
        .start_until(tokio::time::sleep(Duration::from_millis(200)))
        .await
        .unwrap_err();

    assert!(matches!(err.root(), FlotillaError::Cancelled));
    assert!(err.teardown_errors().is_empty());
    assert!(cluster.node("broker").unwrap().container_id().is_none());
    assert_eq!(launches(&runtime), vec!["broker"]);
    assert_eq!(stops(&runtime), vec!["broker"]);
    assert!(runtime.running().unwrap().is_empty());
    assert_eq!(runtime.network_count().unwrap(), 0);
}

#[tokio::test]
async fn parallel_mode_starts_independent_nodes_together() {
    let runtime = SimulatedRuntime::new();
    script_ready(&runtime);
    runtime.script("broker", ContainerScript::new().log(Duration::from_millis(150), BROKER_READY)).unwrap();

    let mut graph = confluent_graph(log_ready_registry());
    graph.add_node(ServiceNode::generic("tools", "alpine:3.19", 0).unwrap(), &[]).unwrap();
    assert_eq!(
        graph.start_waves().unwrap(),
        vec![vec!["broker", "tools"], vec!["registry"], vec!["sqlserver"]]
    );

    let mut cluster = cluster(&runtime, graph, "scenario-parallel").with_start_mode(StartMode::Parallel);
    cluster.start().await.unwrap();

    let launched = launches(&runtime);
    let mut first_wave = launched[..2].to_vec();
    first_wave.sort();
    assert_eq!(first_wave, vec!["broker", "tools"]);
    assert_eq!(launched[2..], ["registry", "sqlserver"]);

    cluster.stop().await.unwrap();
    assert_eq!(stops(&runtime), vec!["tools", "sqlserver", "registry", "broker"]);
}

#[tokio::test]
async fn identical_nodes_are_reused_across_clusters() {
    let runtime = SimulatedRuntime::new();
    script_ready(&runtime);
    runtime.script("tools", ContainerScript::new()).unwrap();

    let fabric = Arc::new(NetworkFabric::new("scenario-reuse"));
    let registry = Arc::new(ReuseRegistry::new());

    let mut first_graph = ClusterGraph::new();
    first_graph.add_node(ServiceNode::broker("broker").with_reuse(true), &[]).unwrap();
    let mut first = ClusterOrchestrator::new(first_graph, fabric.clone(), Arc::new(runtime.clone()))
        .with_reuse(registry.clone());
    first.start().await.unwrap();
    assert_eq!(registry.len(), 1);

    let mut second_graph = ClusterGraph::new();
    second_graph.add_node(ServiceNode::broker("broker").with_reuse(true), &[]).unwrap();
    second_graph.add_node(
        ServiceNode::generic("tools", "alpine:3.19", 0).unwrap()
            .with_binding("broker", "BOOTSTRAP", "{alias}:{port}"),
        &["broker"],
    ).unwrap();
    let mut second = ClusterOrchestrator::new(second_graph, fabric.clone(), Arc::new(runtime.clone()))
        .with_reuse(registry.clone());
    second.start().await.unwrap();

    assert_eq!(launches(&runtime), vec!["broker", "tools"]);
    assert!(second.node("broker").unwrap().is_reused());
    assert_eq!(
        second.endpoint("broker").unwrap().container_id,
        first.endpoint("broker").unwrap().container_id
    );
    let tools = runtime.launched_spec("tools").unwrap().unwrap();
    assert_eq!(tools.env["BOOTSTRAP"], "kafka:9092");

    // the reused broker survives the second cluster
    second.stop().await.unwrap();
    assert_eq!(stops(&runtime), vec!["tools"]);
    assert_eq!(registry.len(), 1);
    assert_eq!(fabric.member("kafka").unwrap().as_deref(), Some("broker"));
    assert_eq!(fabric.member("tools").unwrap(), None);

    first.stop().await.unwrap();
    assert_eq!(stops(&runtime), vec!["tools", "broker"]);
    assert_eq!(fabric.member("kafka").unwrap(), None);
    assert!(registry.is_empty());
    assert_eq!(runtime.network_count().unwrap(), 0);
}

#[tokio::test]
async fn manifest_drives_a_full_cluster() {
    let manifest = ManifestParser::parse_str(
        r#"
name: manifest
network: scenario-manifest
services:
  sqlserver:
    profile: sql-server
    depends_on: [broker, registry]
    environment:
      KSQL_KSQL_SERVICE_ID: flotilla_
  broker:
    profile: broker
  registry:
    profile: schema-registry
    depends_on: [broker]
    readiness:
      kind: log-pattern
      pattern: Server started, listening
"#,
    )
    .unwrap();
    assert!(ManifestParser::validate(&manifest).unwrap().is_empty());

    let runtime = SimulatedRuntime::new();
    script_ready(&runtime);

    let mut cluster = manifest.build_orchestrator(&Settings::default(), Arc::new(runtime.clone())).unwrap();
    assert_eq!(cluster.fabric().name(), "scenario-manifest");

    cluster.start().await.unwrap();
    assert_eq!(launches(&runtime), vec!["broker", "registry", "sqlserver"]);

    let spec = runtime.launched_spec("sqlserver").unwrap().unwrap();
    assert_eq!(spec.env["KSQL_KSQL_SERVICE_ID"], "flotilla_");
    assert_eq!(spec.env["KSQL_BOOTSTRAP_SERVERS"], "PLAINTEXT://kafka:9092");

    cluster.stop().await.unwrap();
    assert_eq!(cluster.state(), ClusterState::Stopped);
}
