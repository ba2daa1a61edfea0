//! Health probing of supervised agents.

use std::time::Duration;

use fabric_net::wire;
use fabric_net::{EndpointKind, EndpointOptions, EndpointPool};
use fabric_primitives::EndpointAddress;
use fabric_runtime::protocol::{ControlReply, ControlRequest, PingReply, ProbeRequest};
use thiserror::Error;

/// Result alias for probe operations.
pub type ProbeResult<T> = Result<T, ProbeError>;

/// Probe failures; each contributes to the supervisor's crash
/// classification.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The exchange failed or timed out.
    #[error("probe transport failure: {detail}")]
    Transport {
        /// Underlying failure.
        detail: String,
    },
    /// The agent answered something that is not a probe reply.
    #[error("malformed probe reply: {detail}")]
    Malformed {
        /// What was wrong.
        detail: String,
    },
    /// The agent answered with a non-ok status.
    #[error("agent reported status `{status}`")]
    NotOk {
        /// Status token from the reply.
        status: String,
    },
}

/// Issues `ping` probes and control `stop` messages to health endpoints.
///
/// A request endpoint that times out mid-exchange is poisoned, so failed
/// probes discard their pooled socket and the next probe reconnects fresh.
pub struct ProbeClient {
    pool: EndpointPool,
}

impl ProbeClient {
    /// Creates a prober over its own endpoint pool.
    #[must_use]
    pub fn new(pool: EndpointPool) -> Self {
        Self { pool }
    }

    /// Sends one `ping` probe with the given budget.
    ///
    /// # Errors
    ///
    /// Returns a [`ProbeError`] when the agent cannot be reached, answers
    /// garbage, or reports a non-ok status.
    pub async fn ping(&self, address: &EndpointAddress, budget: Duration) -> ProbeResult<PingReply> {
        let payload = wire::encode(&ProbeRequest::Ping {}).map_err(|err| ProbeError::Malformed {
            detail: err.to_string(),
        })?;
        let raw = self.exchange(address, budget, &payload).await?;
        let reply: PingReply = wire::decode(&raw).map_err(|err| ProbeError::Malformed {
            detail: err.to_string(),
        })?;
        if reply.is_ok() {
            Ok(reply)
        } else {
            Err(ProbeError::NotOk {
                status: reply.status,
            })
        }
    }

    /// Sends a control `stop`, asking the agent to shut down gracefully.
    ///
    /// # Errors
    ///
    /// Returns a [`ProbeError`] when the agent cannot be reached or did not
    /// acknowledge.
    pub async fn stop(&self, address: &EndpointAddress, budget: Duration) -> ProbeResult<()> {
        let payload = wire::encode(&ControlRequest::Stop {}).map_err(|err| ProbeError::Malformed {
            detail: err.to_string(),
        })?;
        let raw = self.exchange(address, budget, &payload).await?;
        let reply: ControlReply = wire::decode(&raw).map_err(|err| ProbeError::Malformed {
            detail: err.to_string(),
        })?;
        if reply.status == "ok" {
            Ok(())
        } else {
            Err(ProbeError::NotOk {
                status: reply.status,
            })
        }
    }

    async fn exchange(
        &self,
        address: &EndpointAddress,
        budget: Duration,
        payload: &[u8],
    ) -> ProbeResult<Vec<u8>> {
        let options = EndpointOptions::default().with_timeouts(budget);
        let handle = self
            .pool
            .acquire(EndpointKind::Request, address, options)
            .await
            .map_err(|err| ProbeError::Transport {
                detail: err.to_string(),
            })?;
        match handle.request(payload).await {
            Ok(reply) => {
                if let Err(err) = self.pool.release(handle).await {
                    tracing::debug!(error = %err, "probe endpoint release failed");
                }
                Ok(reply.to_vec())
            }
            Err(err) => {
                self.pool.discard(handle).await;
                Err(ProbeError::Transport {
                    detail: err.to_string(),
                })
            }
        }
    }
}
