//! Minimal fabric agent demonstrating the runtime contract.
//!
//! Run under the supervisor with `FABRIC_REQUEST_PORT` set, or standalone:
//!
//! ```text
//! FABRIC_REQUEST_PORT=5570 echo-agent
//! ```

use std::process::ExitCode;

use agent_fabric::net::wire;
use agent_fabric::primitives::{ComponentHealth, Severity};
use agent_fabric::runtime::{
    Agent, AgentContext, AgentRuntime, HandlerError, HandlerResult,
};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Request accepted by the echo agent.
#[derive(Debug, Serialize, Deserialize)]
struct EchoRequest {
    action: String,
    #[serde(default)]
    text: String,
}

/// Reply returned on success.
#[derive(Debug, Serialize, Deserialize)]
struct EchoReply {
    status: String,
    text: String,
}

struct EchoAgent;

#[async_trait]
impl Agent for EchoAgent {
    async fn on_start(&self, ctx: &AgentContext) -> HandlerResult {
        info!(agent = %ctx.name(), machine = %ctx.machine(), "echo agent starting");
        Ok(())
    }

    async fn on_request(&self, ctx: &AgentContext, payload: Bytes) -> HandlerResult<Vec<u8>> {
        let request: EchoRequest = wire::decode(&payload)
            .map_err(|err| HandlerError::bad_request(err.to_string()))?;
        match request.action.as_str() {
            "echo" => {
                let reply = EchoReply {
                    status: "ok".into(),
                    text: request.text,
                };
                wire::encode(&reply).map_err(|err| HandlerError::failed("encode", err.to_string()))
            }
            "grumble" => {
                // Exercises the error-bus path end to end.
                ctx.publish_error(Severity::Warning, "demo", "asked to grumble", None);
                Err(HandlerError::failed("grumble", "this agent was asked to fail"))
            }
            other => Err(HandlerError::bad_request(format!("unknown action `{other}`"))),
        }
    }

    fn health_components(&self) -> Vec<(String, ComponentHealth)> {
        vec![("echo".to_string(), ComponentHealth::ok())]
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = agent_fabric::telemetry::init("info", None) {
        eprintln!("error: {err}");
        return ExitCode::from(2);
    }
    let name =
        std::env::var("FABRIC_AGENT_NAME").unwrap_or_else(|_| "echo-agent".to_string());
    let runtime = match AgentRuntime::bootstrap(&name, EchoAgent) {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("error: {err}");
            let code = u8::try_from(err.exit_code()).unwrap_or(1);
            return ExitCode::from(code);
        }
    };
    let code = runtime.run().await;
    u8::try_from(code).map_or(ExitCode::FAILURE, ExitCode::from)
}
