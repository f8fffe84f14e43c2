//! Pooled TCP connections to peer agents.
//!
//! Every remote address gets one pooled resource, so at most one connection is kept open per
//! peer. The total number of open connections is bounded by pool capacity. Connecting to a new
//! peer when the pool is full closes an idle connection, in the eviction order of [`Pool`]:
//! the one returned the longest time ago goes first.

use std::{collections::HashMap, io, sync::Arc, time::Duration};

use async_trait::async_trait;
use fleetkit_resourcepool::{AllocateRelease, Checkout, Pool, PoolConfig, PoolState, Resource};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use socket2::{SockRef, TcpKeepalive};
use thiserror::Error;
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    sync::{Mutex as AsyncMutex, OwnedMutexGuard},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, Instrument};

/// Slot holding the live stream of a peer, if connected.
type SharedStream = Arc<AsyncMutex<Option<TcpStream>>>;

/// Error type used for peer connections.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PeerError {
    /// Unable to connect to peer.
    #[error("Unable to connect to peer {0}: {1}")]
    Connect(String, #[source] io::Error),
    /// Connection attempt took too long.
    #[error("Timed out connecting to peer {0}")]
    ConnectTimeout(String),
    /// Unable to set socket options.
    #[error("Unable to set socket options: {0}")]
    Socket(#[source] io::Error),
    /// Connection was not shut down cleanly.
    #[error("Error shutting down connection to peer {0}: {1}")]
    Shutdown(String, #[source] io::Error),
    /// Connection was closed while checked out.
    #[error("Peer connection is closed")]
    NotConnected,
    /// Connection pool error.
    #[error(transparent)]
    Pool(#[from] fleetkit_resourcepool::Error),
}

/// Peer connection pool configuration.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct PeerPoolConfig {
    /// Connection pool settings.
    #[serde(default = "PeerPoolConfig::default_pool")]
    pub pool: PoolConfig,
    /// Maximum time to spend establishing a TCP connection.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "humantime_serde"
    )]
    pub connect_timeout: Option<Duration>,
    /// Maximum time to wait for a connection to become available, not counting time spent
    /// connecting. Waits indefinitely if not set.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "humantime_serde"
    )]
    pub acquire_timeout: Option<Duration>,
    /// Set `TCP_NODELAY` socket option on new connections.
    #[serde(default = "crate::util::default_true")]
    pub nodelay: bool,
    /// Duration to remain idle before sending TCP keepalive probes. TCP keepalive is disabled if
    /// value is not provided.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "humantime_serde"
    )]
    pub keepalive: Option<Duration>,
}

impl Default for PeerPoolConfig {
    fn default() -> Self {
        Self {
            pool: Self::default_pool(),
            connect_timeout: None,
            acquire_timeout: None,
            nodelay: true,
            keepalive: None,
        }
    }
}

impl PeerPoolConfig {
    /// Create configuration for a pool of given capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pool: PoolConfig::with_capacity(capacity).with_name("peers"),
            ..Default::default()
        }
    }

    /// Set connection timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set timeout for waiting on a busy or saturated pool.
    #[must_use]
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    /// Default value for [`Self::pool`].
    #[must_use]
    #[inline]
    fn default_pool() -> PoolConfig {
        PoolConfig::default().with_name("peers")
    }
}

/// Allocation strategy for a TCP connection to a single peer.
pub struct PeerConnector {
    /// Remote address, in `host:port` form.
    addr: String,
    connect_timeout: Option<Duration>,
    nodelay: bool,
    keepalive: Option<Duration>,
    /// Live stream, shared with checked out [`PeerConnection`]s.
    stream: SharedStream,
}

impl PeerConnector {
    /// Create connector for a given peer address.
    pub fn new(addr: impl ToString, cfg: &PeerPoolConfig) -> Self {
        Self {
            addr: addr.to_string(),
            connect_timeout: cfg.connect_timeout,
            nodelay: cfg.nodelay,
            keepalive: cfg.keepalive,
            stream: Arc::new(AsyncMutex::new(None)),
        }
    }

    /// Remote peer address.
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn connect(&self) -> Result<TcpStream, PeerError> {
        let connecting = TcpStream::connect(self.addr.as_str());
        let stream = match self.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connecting)
                .await
                .map_err(|_| PeerError::ConnectTimeout(self.addr.clone()))?,
            None => connecting.await,
        }
        .map_err(|err| PeerError::Connect(self.addr.clone(), err))?;
        stream.set_nodelay(self.nodelay).map_err(PeerError::Socket)?;
        if let Some(idle) = self.keepalive {
            SockRef::from(&stream)
                .set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))
                .map_err(PeerError::Socket)?;
        }
        Ok(stream)
    }
}

impl std::fmt::Debug for PeerConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnector")
            .field("addr", &self.addr)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AllocateRelease for PeerConnector {
    type Error = PeerError;

    async fn allocate(&mut self) -> Result<(), Self::Error> {
        let stream = self.connect().await?;
        debug!(peer = %self.addr, local = ?stream.local_addr().ok(), "connected to peer");
        *self.stream.lock().await = Some(stream);
        Ok(())
    }

    async fn release(&mut self) -> Result<(), Self::Error> {
        let Some(mut stream) = self.stream.lock().await.take() else {
            return Ok(());
        };
        debug!(peer = %self.addr, "disconnecting from peer");
        match stream.shutdown().await {
            Err(err) if err.kind() != io::ErrorKind::NotConnected => {
                Err(PeerError::Shutdown(self.addr.clone(), err))
            }
            _ => Ok(()),
        }
    }
}

/// Known peer.
struct Peer {
    resource: Resource<PeerConnector>,
    stream: SharedStream,
    /// Closing was requested. Entry stays until the connection is closed.
    forgotten: bool,
}

impl Peer {
    /// Forgotten, and nothing left to close.
    fn is_gone(&self) -> bool {
        self.forgotten && self.resource.is_dormant()
    }
}

/// Pool of TCP connections to peer agents, at most one per peer address.
pub struct PeerPool {
    pool: Pool<PeerConnector>,
    peers: Mutex<HashMap<String, Peer>>,
    cfg: PeerPoolConfig,
}

impl PeerPool {
    /// Create connection pool from configuration.
    #[must_use]
    pub fn new(cfg: PeerPoolConfig) -> Self {
        Self {
            pool: Pool::from_config(&cfg.pool),
            peers: Mutex::new(HashMap::new()),
            cfg,
        }
    }

    /// Check out a connection to the peer at `addr`, connecting if necessary.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Pool`] if the connection is not available within configured acquire
    /// timeout, or if connecting failed.
    pub async fn connection(&self, addr: &str) -> Result<PeerConnection, PeerError> {
        let span = debug_span!("peer_connection", peer = addr);
        self.checkout(addr).instrument(span).await
    }

    async fn checkout(&self, addr: &str) -> Result<PeerConnection, PeerError> {
        let (resource, stream) = self.peer(addr);
        let checkout = match self.cfg.acquire_timeout {
            Some(timeout) => resource.checkout_timeout(timeout).await?,
            None => resource.checkout(&CancellationToken::new()).await?,
        };
        // Nobody else can hold the stream while the resource is checked out.
        let stream = stream.lock_owned().await;
        Ok(PeerConnection {
            addr: addr.to_string(),
            stream,
            checkout,
        })
    }

    /// Close the connection to a peer and stop tracking it.
    ///
    /// A connection that is checked out is closed once it is returned. Until then, new
    /// connections to the same peer wait for it, and reconnect afterwards. Returns `false` if the
    /// peer was not known.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the connection was not shut down cleanly.
    pub async fn forget(&self, addr: &str) -> Result<bool, PeerError> {
        let resource = {
            let mut peers = self.peers.lock();
            match peers.get_mut(addr) {
                Some(peer) if !peer.forgotten => {
                    peer.forgotten = true;
                    peer.resource.clone()
                }
                _ => return Ok(false),
            }
        };
        let res = resource.schedule_release().await;
        prune(&mut self.peers.lock());
        res?;
        Ok(true)
    }

    /// Number of known peers.
    #[must_use]
    pub fn len(&self) -> usize {
        let mut peers = self.peers.lock();
        prune(&mut peers);
        peers.values().filter(|peer| !peer.forgotten).count()
    }

    /// Check whether no peers are known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of connection pool bookkeeping.
    #[must_use]
    pub fn state(&self) -> PoolState {
        self.pool.state()
    }

    fn peer(&self, addr: &str) -> (Resource<PeerConnector>, SharedStream) {
        let mut peers = self.peers.lock();
        prune(&mut peers);
        // A forgotten peer still closing its connection is picked up again, so that the new
        // checkout waits for the old one.
        let peer = peers.entry(addr.to_string()).or_insert_with(|| {
            let connector = PeerConnector::new(addr, &self.cfg);
            let stream = Arc::clone(&connector.stream);
            Peer {
                resource: self.pool.create(connector),
                stream,
                forgotten: false,
            }
        });
        peer.forgotten = false;
        (peer.resource.clone(), Arc::clone(&peer.stream))
    }
}

/// Drop entries of forgotten peers whose connections are closed.
fn prune(peers: &mut HashMap<String, Peer>) {
    peers.retain(|_, peer| !peer.is_gone());
}

impl std::fmt::Debug for PeerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerPool")
            .field("pool", &self.pool)
            .field("peers", &self.len())
            .finish()
    }
}

/// Exclusive use of a pooled peer connection.
///
/// Returned to the pool when dropped.
#[must_use = "connection is returned to the pool as soon as it is dropped"]
pub struct PeerConnection {
    addr: String,
    /// Must be dropped before the checkout ends.
    stream: OwnedMutexGuard<Option<TcpStream>>,
    checkout: Checkout<PeerConnector>,
}

impl PeerConnection {
    /// Remote peer address.
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Connected stream.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::NotConnected`] if the connection was closed in the meantime.
    pub fn stream_mut(&mut self) -> Result<&mut TcpStream, PeerError> {
        self.stream.as_mut().ok_or(PeerError::NotConnected)
    }

    /// Return the connection to the pool for reuse.
    pub async fn put(self) {
        let Self {
            stream, checkout, ..
        } = self;
        drop(stream);
        checkout.put().await;
    }

    /// Close the connection instead of returning it for reuse, e.g. after a protocol error.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the connection was not shut down cleanly.
    pub async fn release_early(self) -> Result<(), PeerError> {
        let Self {
            addr,
            stream,
            checkout,
        } = self;
        drop(stream);
        debug!(peer = %addr, "closing peer connection early");
        checkout.release().await.map_err(Into::into)
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("addr", &self.addr)
            .field("connected", &self.stream.is_some())
            .finish()
    }
}
