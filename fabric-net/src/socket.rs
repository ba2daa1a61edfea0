//! Socket kinds, per-endpoint options, and the transport wrapper.

use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use bytes::Bytes;
use fabric_primitives::EndpointAddress;
use thiserror::Error;
use tokio::time::timeout;
use zeromq::{
    PubSocket, RepSocket, ReqSocket, RouterSocket, Socket, SocketRecv, SocketSend, SubSocket,
    ZmqMessage,
};

/// Messaging role of an endpoint.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum EndpointKind {
    /// Client side of request/reply; connects to a peer's reply endpoint.
    Request,
    /// Server side of request/reply; binds and serves one request at a time.
    Reply,
    /// Fan-out publisher.
    Publish,
    /// Topic-filtered subscriber; connects to a publisher.
    Subscribe,
}

impl EndpointKind {
    /// Returns `true` when the kind binds its address by default.
    #[must_use]
    pub const fn binds_by_default(self) -> bool {
        matches!(self, Self::Reply | Self::Publish)
    }

    /// Returns the lowercase display token for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Reply => "reply",
            Self::Publish => "publish",
            Self::Subscribe => "subscribe",
        }
    }
}

impl Display for EndpointKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tunables applied when an endpoint is created.
#[derive(Clone, Copy, Debug)]
pub struct EndpointOptions {
    /// Maximum wait for one send to be accepted by the transport.
    pub send_timeout: Duration,
    /// Maximum wait for one receive.
    pub recv_timeout: Duration,
    /// Grace given to in-flight sends when the pool closes the endpoint.
    pub linger: Duration,
    /// Queue depth consumers of this endpoint should buffer before shedding.
    pub high_water_mark: usize,
    /// Overrides the bind/connect decision derived from the kind.
    ///
    /// A publish endpoint normally binds (peers subscribe to it); set
    /// `Some(false)` when connecting a publisher into the error bus frontend.
    pub bind: Option<bool>,
    /// Serves a reply endpoint with a routing socket, so replies may be
    /// sent out of receive order. Required for reentrant request handling;
    /// exchanges then go through [`recv_routed`](crate::EndpointHandle::recv_routed)
    /// and [`send_routed`](crate::EndpointHandle::send_routed).
    pub routed_reply: bool,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(5),
            recv_timeout: Duration::from_secs(10),
            linger: Duration::from_secs(1),
            high_water_mark: 1000,
            bind: None,
            routed_reply: false,
        }
    }
}

impl EndpointOptions {
    /// Returns options with both timeouts set to `value`.
    #[must_use]
    pub fn with_timeouts(mut self, value: Duration) -> Self {
        self.send_timeout = value;
        self.recv_timeout = value;
        self
    }

    /// Returns options that connect rather than bind (or vice versa).
    #[must_use]
    pub const fn with_bind(mut self, bind: bool) -> Self {
        self.bind = Some(bind);
        self
    }
}

/// One message received from a subscribe endpoint.
#[derive(Clone, Debug)]
pub struct Published {
    /// Topic frame the publisher stamped.
    pub topic: String,
    /// Payload frame.
    pub payload: Bytes,
}

/// One request received on a routed reply endpoint.
///
/// The routing envelope (peer identity and any delimiter frames) is opaque;
/// the reply echoes it so the transport can deliver out-of-order replies to
/// the right peer.
#[derive(Clone, Debug)]
pub struct RoutedRequest {
    envelope: Vec<Bytes>,
    /// Payload frame.
    pub payload: Bytes,
}

impl RoutedRequest {
    /// Returns the opaque routing envelope.
    #[must_use]
    pub fn envelope(&self) -> &[Bytes] {
        &self.envelope
    }
}

/// Result alias for transport operations.
pub type EndpointResult<T> = Result<T, EndpointError>;

/// Errors surfaced by endpoint creation and use.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// Binding the address failed.
    #[error("bind failed on {address}: {source}")]
    Bind {
        /// Address that was being bound.
        address: String,
        /// Underlying transport error.
        source: zeromq::ZmqError,
    },
    /// Connecting to the address failed.
    #[error("connect failed on {address}: {source}")]
    Connect {
        /// Address that was being connected.
        address: String,
        /// Underlying transport error.
        source: zeromq::ZmqError,
    },
    /// A send was rejected by the transport.
    #[error("send failed on {address}: {source}")]
    Send {
        /// Endpoint address.
        address: String,
        /// Underlying transport error.
        source: zeromq::ZmqError,
    },
    /// A receive failed at the transport level.
    #[error("receive failed on {address}: {source}")]
    Recv {
        /// Endpoint address.
        address: String,
        /// Underlying transport error.
        source: zeromq::ZmqError,
    },
    /// An operation exceeded its timeout budget.
    #[error("{operation} timed out after {timeout:?} on {address}")]
    Timeout {
        /// Endpoint address.
        address: String,
        /// Operation that timed out (`send`, `recv`, `request`).
        operation: &'static str,
        /// Budget that was exceeded.
        timeout: Duration,
    },
    /// A received message did not match the expected framing.
    #[error("malformed frame on {address}: {reason}")]
    MalformedFrame {
        /// Endpoint address.
        address: String,
        /// What was wrong with the frame layout.
        reason: String,
    },
    /// The pool has been closed; no further acquisitions are possible.
    #[error("endpoint pool is closed")]
    PoolClosed,
    /// A handle was released twice.
    #[error("endpoint handle for {address} released twice")]
    DoubleRelease {
        /// Endpoint address.
        address: String,
    },
    /// The operation does not apply to this endpoint kind.
    #[error("{kind} endpoint does not support {operation}")]
    Unsupported {
        /// Kind of the endpoint.
        kind: EndpointKind,
        /// Operation that was attempted.
        operation: &'static str,
    },
}

pub(crate) enum RawSocket {
    Request(ReqSocket),
    Reply(RepSocket),
    RoutedReply(RouterSocket),
    Publish(PubSocket),
    Subscribe(SubSocket),
}

/// A kind-aware wrapper over one ZeroMQ socket with timeout discipline.
pub(crate) struct FabricSocket {
    kind: EndpointKind,
    address: EndpointAddress,
    options: EndpointOptions,
    raw: RawSocket,
}

impl FabricSocket {
    /// Creates and binds/connects a socket for the given kind.
    pub(crate) async fn open(
        kind: EndpointKind,
        address: &EndpointAddress,
        options: EndpointOptions,
    ) -> EndpointResult<Self> {
        let uri = address.uri();
        let bind = options.bind.unwrap_or_else(|| kind.binds_by_default());
        let raw = match kind {
            EndpointKind::Request => {
                let mut socket = ReqSocket::new();
                attach(&mut socket, &uri, bind).await?;
                RawSocket::Request(socket)
            }
            EndpointKind::Reply if options.routed_reply => {
                let mut socket = RouterSocket::new();
                attach(&mut socket, &uri, bind).await?;
                RawSocket::RoutedReply(socket)
            }
            EndpointKind::Reply => {
                let mut socket = RepSocket::new();
                attach(&mut socket, &uri, bind).await?;
                RawSocket::Reply(socket)
            }
            EndpointKind::Publish => {
                let mut socket = PubSocket::new();
                attach(&mut socket, &uri, bind).await?;
                RawSocket::Publish(socket)
            }
            EndpointKind::Subscribe => {
                let mut socket = SubSocket::new();
                attach(&mut socket, &uri, bind).await?;
                RawSocket::Subscribe(socket)
            }
        };
        Ok(Self {
            kind,
            address: address.clone(),
            options,
            raw,
        })
    }

    pub(crate) const fn options(&self) -> &EndpointOptions {
        &self.options
    }

    /// Sends a request and waits for the reply. Request kind only.
    ///
    /// A timeout here leaves the underlying socket in a half-completed
    /// exchange; callers must discard the endpoint rather than reuse it.
    pub(crate) async fn request(&mut self, payload: &[u8]) -> EndpointResult<Bytes> {
        let address = self.address.uri();
        let RawSocket::Request(socket) = &mut self.raw else {
            return Err(EndpointError::Unsupported {
                kind: self.kind,
                operation: "request",
            });
        };
        let message = ZmqMessage::from(payload.to_vec());
        bounded(&address, "send", self.options.send_timeout, socket.send(message))
            .await?
            .map_err(|source| EndpointError::Send {
                address: address.clone(),
                source,
            })?;
        let reply = bounded(&address, "recv", self.options.recv_timeout, socket.recv())
            .await?
            .map_err(|source| EndpointError::Recv {
                address: address.clone(),
                source,
            })?;
        first_frame(&address, &reply)
    }

    /// Receives the next request. Reply kind only.
    pub(crate) async fn recv_request(&mut self) -> EndpointResult<Bytes> {
        let address = self.address.uri();
        let RawSocket::Reply(socket) = &mut self.raw else {
            return Err(EndpointError::Unsupported {
                kind: self.kind,
                operation: "recv_request",
            });
        };
        let message = bounded(&address, "recv", self.options.recv_timeout, socket.recv())
            .await?
            .map_err(|source| EndpointError::Recv {
                address: address.clone(),
                source,
            })?;
        first_frame(&address, &message)
    }

    /// Sends the reply to the request received last. Reply kind only.
    pub(crate) async fn send_reply(&mut self, payload: &[u8]) -> EndpointResult<()> {
        let address = self.address.uri();
        let RawSocket::Reply(socket) = &mut self.raw else {
            return Err(EndpointError::Unsupported {
                kind: self.kind,
                operation: "send_reply",
            });
        };
        let message = ZmqMessage::from(payload.to_vec());
        bounded(&address, "send", self.options.send_timeout, socket.send(message))
            .await?
            .map_err(|source| EndpointError::Send { address, source })
    }

    /// Receives the next request together with its routing envelope.
    /// Routed reply endpoints only.
    pub(crate) async fn recv_routed(&mut self) -> EndpointResult<RoutedRequest> {
        let address = self.address.uri();
        let RawSocket::RoutedReply(socket) = &mut self.raw else {
            return Err(EndpointError::Unsupported {
                kind: self.kind,
                operation: "recv_routed",
            });
        };
        let message = bounded(&address, "recv", self.options.recv_timeout, socket.recv())
            .await?
            .map_err(|source| EndpointError::Recv {
                address: address.clone(),
                source,
            })?;
        // Frames are [identity, (delimiter,)? payload]; the payload is the
        // final frame and everything before it is echoed on the reply.
        let mut frames = message.into_vec();
        if frames.len() < 2 {
            return Err(EndpointError::MalformedFrame {
                address,
                reason: "routed request without an envelope".into(),
            });
        }
        let payload = frames.pop().unwrap_or_default();
        Ok(RoutedRequest {
            envelope: frames,
            payload,
        })
    }

    /// Answers one routed request, echoing its envelope. Routed reply
    /// endpoints only.
    pub(crate) async fn send_routed(
        &mut self,
        request: &RoutedRequest,
        payload: &[u8],
    ) -> EndpointResult<()> {
        let address = self.address.uri();
        let RawSocket::RoutedReply(socket) = &mut self.raw else {
            return Err(EndpointError::Unsupported {
                kind: self.kind,
                operation: "send_routed",
            });
        };
        let envelope = request.envelope();
        let Some(first) = envelope.first() else {
            return Err(EndpointError::MalformedFrame {
                address,
                reason: "reply without a routing envelope".into(),
            });
        };
        let mut message = ZmqMessage::from(first.to_vec());
        for frame in &envelope[1..] {
            message.push_back(frame.clone());
        }
        message.push_back(Bytes::copy_from_slice(payload));
        bounded(&address, "send", self.options.send_timeout, socket.send(message))
            .await?
            .map_err(|source| EndpointError::Send { address, source })
    }

    /// Publishes a `[topic, payload]` pair. Publish kind only.
    pub(crate) async fn publish(&mut self, topic: &str, payload: &[u8]) -> EndpointResult<()> {
        let address = self.address.uri();
        let RawSocket::Publish(socket) = &mut self.raw else {
            return Err(EndpointError::Unsupported {
                kind: self.kind,
                operation: "publish",
            });
        };
        let mut message = ZmqMessage::from(topic.to_string());
        message.push_back(Bytes::copy_from_slice(payload));
        bounded(&address, "send", self.options.send_timeout, socket.send(message))
            .await?
            .map_err(|source| EndpointError::Send { address, source })
    }

    /// Adds a topic prefix filter. Subscribe kind only.
    pub(crate) async fn subscribe(&mut self, prefix: &str) -> EndpointResult<()> {
        let address = self.address.uri();
        let RawSocket::Subscribe(socket) = &mut self.raw else {
            return Err(EndpointError::Unsupported {
                kind: self.kind,
                operation: "subscribe",
            });
        };
        socket
            .subscribe(prefix)
            .await
            .map_err(|source| EndpointError::Connect { address, source })
    }

    /// Receives the next published `[topic, payload]` pair. Subscribe kind
    /// only. Waits without a deadline so idle topics do not error; callers
    /// impose their own timeouts where needed.
    pub(crate) async fn next_published(&mut self) -> EndpointResult<Published> {
        let address = self.address.uri();
        let RawSocket::Subscribe(socket) = &mut self.raw else {
            return Err(EndpointError::Unsupported {
                kind: self.kind,
                operation: "next_published",
            });
        };
        let message = socket.recv().await.map_err(|source| EndpointError::Recv {
            address: address.clone(),
            source,
        })?;
        split_published(&address, &message)
    }
}

async fn attach<S: Socket>(socket: &mut S, uri: &str, bind: bool) -> EndpointResult<()> {
    if bind {
        socket.bind(uri).await.map_err(|source| EndpointError::Bind {
            address: uri.to_string(),
            source,
        })?;
    } else {
        socket
            .connect(uri)
            .await
            .map_err(|source| EndpointError::Connect {
                address: uri.to_string(),
                source,
            })?;
    }
    Ok(())
}

async fn bounded<T>(
    address: &str,
    operation: &'static str,
    budget: Duration,
    future: impl Future<Output = T>,
) -> EndpointResult<T> {
    timeout(budget, future)
        .await
        .map_err(|_| EndpointError::Timeout {
            address: address.to_string(),
            operation,
            timeout: budget,
        })
}

fn first_frame(address: &str, message: &ZmqMessage) -> EndpointResult<Bytes> {
    message
        .get(0)
        .cloned()
        .ok_or_else(|| EndpointError::MalformedFrame {
            address: address.to_string(),
            reason: "empty message".into(),
        })
}

fn split_published(address: &str, message: &ZmqMessage) -> EndpointResult<Published> {
    let topic = message
        .get(0)
        .ok_or_else(|| EndpointError::MalformedFrame {
            address: address.to_string(),
            reason: "missing topic frame".into(),
        })?;
    let topic = std::str::from_utf8(topic)
        .map_err(|_| EndpointError::MalformedFrame {
            address: address.to_string(),
            reason: "topic frame is not utf-8".into(),
        })?
        .to_string();
    let payload = message.get(1).cloned().unwrap_or_else(Bytes::new);
    Ok(Published { topic, payload })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_bind_or_connect_by_role() {
        assert!(EndpointKind::Reply.binds_by_default());
        assert!(EndpointKind::Publish.binds_by_default());
        assert!(!EndpointKind::Request.binds_by_default());
        assert!(!EndpointKind::Subscribe.binds_by_default());
    }

    #[test]
    fn bind_override_wins() {
        let options = EndpointOptions::default().with_bind(false);
        assert_eq!(options.bind, Some(false));
    }
}
