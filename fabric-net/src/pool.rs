//! Reference-counted endpoint cache keyed by `(kind, address)`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fabric_primitives::EndpointAddress;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::socket::{
    EndpointError, EndpointKind, EndpointOptions, EndpointResult, FabricSocket, Published,
    RoutedRequest,
};

type PoolKey = (EndpointKind, String);

struct PoolEntry {
    refcount: usize,
    socket: Arc<Mutex<FabricSocket>>,
}

struct PoolInner {
    closed: bool,
    entries: HashMap<PoolKey, PoolEntry>,
    /// Keys in first-acquisition order; `close_all` walks this in reverse.
    order: Vec<PoolKey>,
}

/// Shared cache of live endpoints for one process.
///
/// The pool is the only shared mutable transport state in a process. Handles
/// are checked back in through [`EndpointPool::release`]; the socket closes
/// when its last handle is released or when [`EndpointPool::close_all`] runs
/// at shutdown.
#[derive(Clone)]
pub struct EndpointPool {
    inner: Arc<Mutex<PoolInner>>,
}

impl Default for EndpointPool {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                closed: false,
                entries: HashMap::new(),
                order: Vec::new(),
            })),
        }
    }

    /// Returns a handle for `(kind, address)`, creating the endpoint on first
    /// acquisition. Concurrent acquisitions of the same key share one
    /// underlying socket.
    ///
    /// The options of the first acquisition win; later acquisitions of a
    /// cached endpoint reuse them.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::PoolClosed`] after `close_all`, or a
    /// bind/connect error from endpoint creation.
    pub async fn acquire(
        &self,
        kind: EndpointKind,
        address: &EndpointAddress,
        options: EndpointOptions,
    ) -> EndpointResult<EndpointHandle> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(EndpointError::PoolClosed);
        }
        let key: PoolKey = (kind, address.uri());
        if let Some(entry) = inner.entries.get_mut(&key) {
            entry.refcount += 1;
            return Ok(EndpointHandle {
                kind,
                address: address.clone(),
                socket: Arc::clone(&entry.socket),
                released: false,
            });
        }

        // First acquisition: create while holding the pool lock so a racing
        // acquire of the same key observes the finished entry.
        let socket = FabricSocket::open(kind, address, options).await?;
        let socket = Arc::new(Mutex::new(socket));
        inner.entries.insert(
            key.clone(),
            PoolEntry {
                refcount: 1,
                socket: Arc::clone(&socket),
            },
        );
        inner.order.push(key);
        debug!(kind = %kind, address = %address, "endpoint created");
        Ok(EndpointHandle {
            kind,
            address: address.clone(),
            socket,
            released: false,
        })
    }

    /// Checks a handle back in, closing the endpoint when this was the last
    /// outstanding handle.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::DoubleRelease`] if the pool's refcount for
    /// this endpoint is already zero, which indicates a bookkeeping bug.
    pub async fn release(&self, mut handle: EndpointHandle) -> EndpointResult<()> {
        handle.released = true;
        let key: PoolKey = (handle.kind, handle.address.uri());
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.entries.get_mut(&key) else {
            // Endpoint was discarded or the pool already closed; the handle's
            // socket reference dies with the handle.
            return Ok(());
        };
        if entry.refcount == 0 {
            return Err(EndpointError::DoubleRelease {
                address: handle.address.uri(),
            });
        }
        entry.refcount -= 1;
        if entry.refcount == 0 {
            inner.entries.remove(&key);
            inner.order.retain(|k| *k != key);
            debug!(kind = %handle.kind, address = %handle.address, "endpoint closed");
        }
        Ok(())
    }

    /// Removes a poisoned endpoint from the cache.
    ///
    /// Request endpoints that time out mid-exchange cannot be reused; the
    /// next `acquire` for the same key creates a fresh connection. Handles
    /// still referencing the old socket keep it alive until they are
    /// released.
    pub async fn discard(&self, mut handle: EndpointHandle) {
        handle.released = true;
        let key: PoolKey = (handle.kind, handle.address.uri());
        let mut inner = self.inner.lock().await;
        if inner.entries.remove(&key).is_some() {
            inner.order.retain(|k| *k != key);
            debug!(kind = %handle.kind, address = %handle.address, "endpoint discarded");
        }
    }

    /// Closes every endpoint in reverse acquisition order and rejects all
    /// further acquisitions. Called once at process shutdown.
    pub async fn close_all(&self) {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        let mut linger = Duration::ZERO;
        let order: Vec<PoolKey> = inner.order.drain(..).rev().collect();
        for key in order {
            if let Some(entry) = inner.entries.remove(&key) {
                if entry.refcount > 0 {
                    warn!(
                        kind = %key.0,
                        address = %key.1,
                        refcount = entry.refcount,
                        "closing endpoint with outstanding handles"
                    );
                }
                let socket = entry.socket.lock().await;
                linger = linger.max(socket.options().linger);
            }
        }
        drop(inner);
        // Give queued sends a chance to flush before the sockets drop.
        if linger > Duration::ZERO {
            tokio::time::sleep(linger.min(Duration::from_secs(1))).await;
        }
    }

    /// Returns the number of live endpoints, for health reporting.
    pub async fn live_endpoints(&self) -> usize {
        self.inner.lock().await.entries.len()
    }
}

/// A checked-out reference to one pooled endpoint.
///
/// The handle serializes access to the socket, so a request-kind handle is
/// safe to share across tasks: each exchange runs under the socket lock.
pub struct EndpointHandle {
    kind: EndpointKind,
    address: EndpointAddress,
    socket: Arc<Mutex<FabricSocket>>,
    released: bool,
}

impl std::fmt::Debug for EndpointHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointHandle")
            .field("kind", &self.kind)
            .field("address", &self.address)
            .field("released", &self.released)
            .finish()
    }
}

impl EndpointHandle {
    /// Returns the endpoint kind.
    #[must_use]
    pub const fn kind(&self) -> EndpointKind {
        self.kind
    }

    /// Returns the endpoint address.
    #[must_use]
    pub const fn address(&self) -> &EndpointAddress {
        &self.address
    }

    /// Sends a request and awaits the reply. Request kind only.
    ///
    /// # Errors
    ///
    /// Returns a transport error; after a [`EndpointError::Timeout`] the
    /// handle must be discarded via [`EndpointPool::discard`].
    pub async fn request(&self, payload: &[u8]) -> EndpointResult<Bytes> {
        self.socket.lock().await.request(payload).await
    }

    /// Receives the next inbound request. Reply kind only.
    ///
    /// # Errors
    ///
    /// Returns a transport error or timeout.
    pub async fn recv_request(&self) -> EndpointResult<Bytes> {
        self.socket.lock().await.recv_request().await
    }

    /// Answers the request received last. Reply kind only.
    ///
    /// # Errors
    ///
    /// Returns a transport error or timeout.
    pub async fn send_reply(&self, payload: &[u8]) -> EndpointResult<()> {
        self.socket.lock().await.send_reply(payload).await
    }

    /// Receives the next request with its routing envelope. Routed reply
    /// endpoints only (see [`EndpointOptions::routed_reply`]).
    ///
    /// # Errors
    ///
    /// Returns a transport error or timeout.
    pub async fn recv_routed(&self) -> EndpointResult<RoutedRequest> {
        self.socket.lock().await.recv_routed().await
    }

    /// Answers one routed request; replies may be sent in any order
    /// relative to receives. Routed reply endpoints only.
    ///
    /// # Errors
    ///
    /// Returns a transport error or timeout.
    pub async fn send_routed(&self, request: &RoutedRequest, payload: &[u8]) -> EndpointResult<()> {
        self.socket.lock().await.send_routed(request, payload).await
    }

    /// Publishes a `[topic, payload]` pair. Publish kind only.
    ///
    /// # Errors
    ///
    /// Returns a transport error or timeout.
    pub async fn publish(&self, topic: &str, payload: &[u8]) -> EndpointResult<()> {
        self.socket.lock().await.publish(topic, payload).await
    }

    /// Adds a topic prefix filter. Subscribe kind only.
    ///
    /// # Errors
    ///
    /// Returns a transport error.
    pub async fn subscribe(&self, prefix: &str) -> EndpointResult<()> {
        self.socket.lock().await.subscribe(prefix).await
    }

    /// Receives the next published message. Subscribe kind only.
    ///
    /// # Errors
    ///
    /// Returns a transport error.
    pub async fn next_published(&self) -> EndpointResult<Published> {
        self.socket.lock().await.next_published().await
    }
}

impl Drop for EndpointHandle {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                kind = %self.kind,
                address = %self.address,
                "endpoint handle dropped without release"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback(port: u16) -> EndpointAddress {
        EndpointAddress::new("127.0.0.1", port).expect("address")
    }

    #[tokio::test]
    async fn acquire_caches_by_key() {
        let pool = EndpointPool::new();
        let address = loopback(29_431);
        let first = pool
            .acquire(EndpointKind::Reply, &address, EndpointOptions::default())
            .await
            .expect("first acquire");
        let second = pool
            .acquire(EndpointKind::Reply, &address, EndpointOptions::default())
            .await
            .expect("second acquire");

        assert!(Arc::ptr_eq(&first.socket, &second.socket));
        assert_eq!(pool.live_endpoints().await, 1);

        pool.release(first).await.expect("release first");
        assert_eq!(pool.live_endpoints().await, 1);
        pool.release(second).await.expect("release second");
        assert_eq!(pool.live_endpoints().await, 0);
    }

    #[tokio::test]
    async fn request_reply_round_trip() {
        let pool = EndpointPool::new();
        let address = loopback(29_433);
        let server = pool
            .acquire(EndpointKind::Reply, &address, EndpointOptions::default())
            .await
            .expect("bind reply");
        let client = pool
            .acquire(EndpointKind::Request, &address, EndpointOptions::default())
            .await
            .expect("connect request");

        let echo = tokio::spawn(async move {
            let request = server.recv_request().await.expect("recv");
            server.send_reply(&request).await.expect("reply");
            server
        });

        let reply = client.request(b"hello").await.expect("request");
        assert_eq!(&reply[..], b"hello");

        let server = echo.await.expect("join");
        pool.release(client).await.expect("release client");
        pool.release(server).await.expect("release server");
    }

    #[tokio::test]
    async fn routed_reply_answers_out_of_receive_order() {
        let server_pool = EndpointPool::new();
        let address = loopback(29_441);
        let server = server_pool
            .acquire(
                EndpointKind::Reply,
                &address,
                EndpointOptions {
                    routed_reply: true,
                    ..EndpointOptions::default()
                },
            )
            .await
            .expect("bind routed reply");

        // Two distinct peers, each with its own request socket.
        let pool_a = EndpointPool::new();
        let pool_b = EndpointPool::new();
        let client_a = pool_a
            .acquire(EndpointKind::Request, &address, EndpointOptions::default())
            .await
            .expect("connect a");
        let client_b = pool_b
            .acquire(EndpointKind::Request, &address, EndpointOptions::default())
            .await
            .expect("connect b");

        let task_a = tokio::spawn(async move {
            let reply = client_a.request(b"from-a").await.expect("request a");
            pool_a.release(client_a).await.expect("release a");
            reply
        });
        let task_b = tokio::spawn(async move {
            let reply = client_b.request(b"from-b").await.expect("request b");
            pool_b.release(client_b).await.expect("release b");
            reply
        });

        // Take both requests, then answer them in reverse receive order.
        let first = server.recv_routed().await.expect("recv first");
        let second = server.recv_routed().await.expect("recv second");
        let echo = |payload: &[u8]| {
            let mut reply = b"reply-".to_vec();
            reply.extend_from_slice(payload);
            reply
        };
        server
            .send_routed(&second, &echo(&second.payload))
            .await
            .expect("reply second");
        server
            .send_routed(&first, &echo(&first.payload))
            .await
            .expect("reply first");

        let reply_a = task_a.await.expect("join a");
        let reply_b = task_b.await.expect("join b");
        assert_eq!(&reply_a[..], b"reply-from-a");
        assert_eq!(&reply_b[..], b"reply-from-b");

        server_pool.release(server).await.expect("release server");
    }

    #[tokio::test]
    async fn closed_pool_rejects_acquire() {
        let pool = EndpointPool::new();
        pool.close_all().await;
        let err = pool
            .acquire(
                EndpointKind::Reply,
                &loopback(29_435),
                EndpointOptions::default(),
            )
            .await
            .expect_err("closed");
        assert!(matches!(err, EndpointError::PoolClosed));
    }

    #[tokio::test]
    async fn discard_forces_fresh_endpoint() {
        let pool = EndpointPool::new();
        let address = loopback(29_437);
        let handle = pool
            .acquire(EndpointKind::Reply, &address, EndpointOptions::default())
            .await
            .expect("acquire");
        pool.discard(handle).await;
        assert_eq!(pool.live_endpoints().await, 0);

        // Same key is creatable again once the old socket has closed.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let handle = pool
            .acquire(EndpointKind::Reply, &address, EndpointOptions::default())
            .await
            .expect("reacquire");
        pool.release(handle).await.expect("release");
    }
}
