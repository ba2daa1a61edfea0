//! Supervisor behaviour against real (non-fabric) child processes.
//!
//! The children here are plain Unix tools without health endpoints, which
//! exercises the startup-timeout, required-agent, and operator-query paths.

use std::collections::BTreeMap;
use std::time::Duration;

use fabric_net::wire;
use fabric_net::{EndpointKind, EndpointOptions, EndpointPool};
use fabric_primitives::{AgentName, EndpointAddress, MachineId};
use fabric_runtime::{EXIT_OK, EXIT_REQUIRED, ErrorReporter};
use fabric_supervisor::protocol::{StatusReply, SupervisorRequest};
use fabric_supervisor::{
    AgentDescriptor, AgentState, GroupManifest, SpawnContext, Supervisor, SupervisorPolicies,
};
use tokio_util::sync::CancellationToken;

fn descriptor(toml_text: &str) -> AgentDescriptor {
    toml::from_str(toml_text).expect("descriptor")
}

fn manifest(agents: &[(&str, &str)]) -> GroupManifest {
    let raw: BTreeMap<String, AgentDescriptor> = agents
        .iter()
        .map(|(name, text)| ((*name).to_string(), descriptor(text)))
        .collect();
    GroupManifest::from_descriptors("test", raw).expect("valid manifest")
}

fn supervisor(
    manifest: GroupManifest,
    query_bind: Option<EndpointAddress>,
    logs_dir: std::path::PathBuf,
) -> Supervisor {
    let policies = SupervisorPolicies {
        health_probe_interval: Duration::from_millis(100),
        shutdown_grace: Duration::from_millis(500),
        query_bind,
        ..SupervisorPolicies::default()
    };
    let spawn_ctx = SpawnContext {
        logs_dir,
        machine: MachineId::new("testmachine").unwrap(),
        group: "test".into(),
        bind_host: "127.0.0.1".into(),
        registry: None,
        error_bus: None,
    };
    let pool = EndpointPool::new();
    let (reporter, _worker) = ErrorReporter::spawn(
        pool.clone(),
        None,
        AgentName::new("supervisor").unwrap(),
        MachineId::new("testmachine").unwrap(),
        256,
    );
    Supervisor::new(manifest, policies, spawn_ctx, pool, reporter)
}

#[tokio::test]
async fn required_agent_missing_ready_aborts_with_exit_three() {
    let dir = tempfile::tempdir().expect("tempdir");
    // Sleeps forever but never answers health probes.
    let manifest = manifest(&[(
        "mute",
        r#"
            executable = "/bin/sleep"
            args = ["30"]
            request_port = 29701
            required = true
            start_timeout = "1s"
            health_timeout = "200ms"
        "#,
    )]);
    let supervisor = supervisor(manifest, None, dir.path().to_path_buf());
    let code = supervisor.run(CancellationToken::new()).await;
    assert_eq!(code, EXIT_REQUIRED);
}

#[tokio::test]
async fn optional_agent_failure_does_not_abort_the_group() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manifest = manifest(&[(
        "flaky",
        r#"
            executable = "/bin/false"
            request_port = 29711
            required = false
            restart_policy = "never"
            start_timeout = "1s"
            health_timeout = "200ms"
        "#,
    )]);
    let supervisor = supervisor(manifest, None, dir.path().to_path_buf());
    let shutdown = CancellationToken::new();
    let stopper = {
        let token = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            token.cancel();
        })
    };
    let code = supervisor.run(shutdown).await;
    stopper.await.unwrap();
    assert_eq!(code, EXIT_OK);
}

#[tokio::test]
async fn status_query_reports_failed_agents() {
    let dir = tempfile::tempdir().expect("tempdir");
    let query_bind = EndpointAddress::new("127.0.0.1", 29_721).unwrap();
    let manifest = manifest(&[(
        "mute",
        r#"
            executable = "/bin/sleep"
            args = ["30"]
            request_port = 29731
            required = false
            restart_policy = "never"
            start_timeout = "1s"
            health_timeout = "200ms"
        "#,
    )]);
    let supervisor = supervisor(manifest, Some(query_bind.clone()), dir.path().to_path_buf());
    let shutdown = CancellationToken::new();
    let runner = {
        let token = shutdown.clone();
        tokio::spawn(async move { supervisor.run(token).await })
    };

    // Let startup time out and the steady loop begin.
    tokio::time::sleep(Duration::from_millis(2500)).await;

    let pool = EndpointPool::new();
    let client = pool
        .acquire(EndpointKind::Request, &query_bind, EndpointOptions::default())
        .await
        .expect("connect query endpoint");
    let request = wire::encode(&SupervisorRequest::Status {}).unwrap();
    let reply = client.request(&request).await.expect("status request");
    let reply: StatusReply = wire::decode(&reply).expect("status reply");
    let StatusReply::Ok { group, agents } = reply else {
        panic!("expected status ok");
    };
    assert_eq!(group, "test");
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].name, "mute");
    assert_eq!(agents[0].state, AgentState::Failed);

    pool.release(client).await.expect("release");
    shutdown.cancel();
    let code = tokio::time::timeout(Duration::from_secs(10), runner)
        .await
        .expect("supervisor exits")
        .expect("join");
    assert_eq!(code, EXIT_OK);
}
