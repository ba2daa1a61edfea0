//! End-to-end exercise of the agent runtime over real sockets.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fabric_config::{ConfigLoader, FabricPaths};
use fabric_net::wire;
use fabric_net::{EndpointKind, EndpointOptions, EndpointPool};
use fabric_primitives::{AgentName, EndpointAddress, HealthSnapshot, MachineId};
use fabric_runtime::protocol::{ControlReply, ControlRequest, ErrorReply, PingReply, ProbeRequest};
use fabric_runtime::{Agent, AgentContext, AgentRuntime, HandlerError, HandlerResult, RuntimeOptions};

struct EchoAgent;

#[async_trait]
impl Agent for EchoAgent {
    async fn on_request(&self, _ctx: &AgentContext, payload: Bytes) -> HandlerResult<Vec<u8>> {
        match &payload[..] {
            b"fail" => Err(HandlerError::failed("echo", "asked to fail")),
            b"block" => {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(b"unblocked".to_vec())
            }
            other => Ok(other.to_vec()),
        }
    }
}

fn options(request_port: u16, max_message_bytes: usize, reentrant: bool) -> RuntimeOptions {
    RuntimeOptions {
        name: AgentName::new("echo").unwrap(),
        machine: MachineId::new("testmachine").unwrap(),
        bind_host: "127.0.0.1".into(),
        advertise_host: "127.0.0.1".into(),
        request_port,
        health_port: request_port + 1,
        registry: None,
        error_bus: None,
        capabilities: Vec::new(),
        publish_port: None,
        shutdown_grace: Duration::from_secs(2),
        refresh_interval: None,
        reentrant,
        max_message_bytes,
    }
}

fn spawn_agent(
    request_port: u16,
    max_message_bytes: usize,
    reentrant: bool,
) -> tokio::task::JoinHandle<i32> {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = FabricPaths::rooted_at(dir.path()).expect("paths");
    let config = ConfigLoader::new(paths.clone()).load("echo").expect("config");
    let runtime = AgentRuntime::with_options(
        EchoAgent,
        options(request_port, max_message_bytes, reentrant),
        config,
        paths,
    );
    tokio::spawn(async move {
        // Keep the temp directory alive for the process lifetime.
        let _dir = dir;
        runtime.run().await
    })
}

async fn request(pool: &EndpointPool, address: &EndpointAddress, payload: &[u8]) -> Vec<u8> {
    let handle = pool
        .acquire(EndpointKind::Request, address, EndpointOptions::default())
        .await
        .expect("connect");
    let reply = handle.request(payload).await.expect("request");
    pool.release(handle).await.expect("release");
    reply.to_vec()
}

#[tokio::test]
async fn serves_requests_and_reports_handler_errors() {
    let agent = spawn_agent(29_601, wire::MAX_MESSAGE_BYTES, false);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let pool = EndpointPool::new();
    let address = EndpointAddress::new("127.0.0.1", 29_601).unwrap();
    let reply = request(&pool, &address, b"hello fabric").await;
    assert_eq!(reply, b"hello fabric");

    let reply = request(&pool, &address, b"fail").await;
    let error: ErrorReply = wire::decode(&reply).expect("error reply");
    assert_eq!(error.status, "error");
    assert_eq!(error.fault.kind, "echo");

    // Control stop on the health endpoint shuts the process down cleanly.
    let health = EndpointAddress::new("127.0.0.1", 29_602).unwrap();
    let stop = wire::encode(&ControlRequest::Stop {}).unwrap();
    let reply = request(&pool, &health, &stop).await;
    let ack: ControlReply = wire::decode(&reply).expect("control reply");
    assert_eq!(ack.status, "ok");

    let code = tokio::time::timeout(Duration::from_secs(10), agent)
        .await
        .expect("agent exits")
        .expect("join");
    assert_eq!(code, 0);
}

#[tokio::test]
async fn health_stays_live_while_a_handler_blocks() {
    let agent = spawn_agent(29_611, wire::MAX_MESSAGE_BYTES, false);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let address = EndpointAddress::new("127.0.0.1", 29_611).unwrap();
    let health = EndpointAddress::new("127.0.0.1", 29_612).unwrap();

    // Occupy the request loop with a slow handler.
    let blocker = {
        let address = address.clone();
        tokio::spawn(async move {
            let pool = EndpointPool::new();
            request(&pool, &address, b"block").await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Pings must still answer within their budget.
    let pool = EndpointPool::new();
    let ping = wire::encode(&ProbeRequest::Ping {}).unwrap();
    let started = std::time::Instant::now();
    let reply = request(&pool, &health, &ping).await;
    let elapsed = started.elapsed();
    let ping_reply: PingReply = wire::decode(&reply).expect("ping reply");
    assert!(ping_reply.is_ok());
    assert!(elapsed < Duration::from_millis(900), "ping took {elapsed:?}");

    // The full probe returns a complete snapshot.
    let full = wire::encode(&ProbeRequest::Full {}).unwrap();
    let reply = request(&pool, &health, &full).await;
    let snapshot: HealthSnapshot = wire::decode(&reply).expect("snapshot");
    assert!(snapshot.checks().contains_key("self"));
    assert!(snapshot.checks().contains_key("endpoints"));
    assert!(snapshot.checks().contains_key("registry"));

    assert_eq!(blocker.await.expect("join"), b"unblocked");

    let stop = wire::encode(&ControlRequest::Stop {}).unwrap();
    let _ = request(&pool, &health, &stop).await;
    let _ = tokio::time::timeout(Duration::from_secs(10), agent).await;
}

#[tokio::test]
async fn reentrant_agent_overlaps_handlers() {
    let agent = spawn_agent(29_631, wire::MAX_MESSAGE_BYTES, true);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let address = EndpointAddress::new("127.0.0.1", 29_631).unwrap();

    // First peer occupies a handler for a full second.
    let blocker = {
        let address = address.clone();
        tokio::spawn(async move {
            let pool = EndpointPool::new();
            request(&pool, &address, b"block").await
        })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;

    // A second peer gets its reply while the first handler still runs; a
    // serialized agent would sit behind the full block.
    let pool = EndpointPool::new();
    let started = std::time::Instant::now();
    let reply = request(&pool, &address, b"quick").await;
    let elapsed = started.elapsed();
    assert_eq!(reply, b"quick");
    assert!(elapsed < Duration::from_millis(700), "overlapped request took {elapsed:?}");

    assert_eq!(blocker.await.expect("join"), b"unblocked");

    let health = EndpointAddress::new("127.0.0.1", 29_632).unwrap();
    let stop = wire::encode(&ControlRequest::Stop {}).unwrap();
    let reply = request(&pool, &health, &stop).await;
    let ack: ControlReply = wire::decode(&reply).expect("control reply");
    assert_eq!(ack.status, "ok");
    let code = tokio::time::timeout(Duration::from_secs(10), agent)
        .await
        .expect("agent exits")
        .expect("join");
    assert_eq!(code, 0);
}

#[tokio::test]
async fn oversized_requests_are_rejected_structurally() {
    let agent = spawn_agent(29_621, 1024, false);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let pool = EndpointPool::new();
    let address = EndpointAddress::new("127.0.0.1", 29_621).unwrap();
    let oversized = vec![0u8; 2048];
    let reply = request(&pool, &address, &oversized).await;
    let error: ErrorReply = wire::decode(&reply).expect("error reply");
    assert_eq!(error.fault.kind, "message_too_large");

    // A request exactly at the limit passes through to the handler.
    let at_limit = vec![7u8; 1024];
    let reply = request(&pool, &address, &at_limit).await;
    assert_eq!(reply, at_limit);

    let health = EndpointAddress::new("127.0.0.1", 29_622).unwrap();
    let stop = wire::encode(&ControlRequest::Stop {}).unwrap();
    let _ = request(&pool, &health, &stop).await;
    let _ = tokio::time::timeout(Duration::from_secs(10), agent).await;
}
