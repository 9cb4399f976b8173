//! Frontend listeners
//!
//! One `Frontend` per listening address and transport, carrying the
//! per-listener counters. The UDP listener processes packets inline in its
//! receive loop; the TCP acceptor hands each connection to its own task,
//! bounded by a connection cap that closes surplus connections instead of
//! queueing them.
//!
//! Encrypted transports (DoT, DoH, DNSCrypt) are external: they terminate
//! their protocol elsewhere and feed the engine through the same entry
//! points, tagged with their frontend kind.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, info, trace};

use crate::engine::{ProcessOutcome, QueryEngine};
use crate::error::{Error, Result};
use crate::question::{self, QueryContext};
use crate::rules::action::synthesize_rcode;

/// Incoming UDP datagrams larger than this are not accepted.
pub const UDP_INCOMING_BUFFER_SIZE: usize = 1500;

/// Default cap on concurrently served TCP connections per frontend.
pub const DEFAULT_MAX_TCP_CONNECTIONS: usize = 1024;

/// Default cap on queries served over one TCP connection.
pub const DEFAULT_MAX_TCP_QUERIES_PER_CONN: usize = 64;

/// Default idle deadline while waiting for a TCP query.
pub const DEFAULT_TCP_RECV_TIMEOUT: Duration = Duration::from_secs(30);

/// The transport a frontend terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontendKind {
    /// Plain DNS over UDP
    Udp,
    /// Plain DNS over TCP
    Tcp,
    /// DNS over TLS, terminated externally
    Dot,
    /// DNS over HTTPS, terminated externally
    Doh,
    /// DNSCrypt, terminated externally
    DnsCrypt,
}

impl FrontendKind {
    /// Human-readable transport name.
    #[must_use]
    pub fn describe(self) -> &'static str {
        match self {
            Self::Udp => "UDP",
            Self::Tcp => "TCP",
            Self::Dot => "TCP (DNS over TLS)",
            Self::Doh => "TCP (DNS over HTTPS)",
            Self::DnsCrypt => "UDP (DNSCrypt)",
        }
    }
}

/// Per-listener counters.
#[derive(Debug, Default)]
pub struct FrontendStats {
    /// Queries accepted on this listener
    pub queries: AtomicU64,
    /// Responses delivered from this listener
    pub responses: AtomicU64,
    /// Connections that died while reading a query
    pub tcp_died_reading_query: AtomicU64,
    /// Connections that died while sending a response
    pub tcp_died_sending_response: AtomicU64,
    /// Connections closed because the connection cap was reached
    pub tcp_gave_up: AtomicU64,
    /// Connections that idled out waiting for a query
    pub tcp_client_timeouts: AtomicU64,
    /// Currently served connections
    pub tcp_current_connections: AtomicU64,
}

/// One listening endpoint.
#[derive(Debug)]
pub struct Frontend {
    /// The listening address
    pub local: SocketAddr,
    /// The transport
    pub kind: FrontendKind,
    /// Accept queries but never answer
    pub muted: bool,
    /// Listener counters
    pub stats: Arc<FrontendStats>,
}

impl Frontend {
    /// Describe a listener on `local`.
    #[must_use]
    pub fn new(local: SocketAddr, kind: FrontendKind) -> Arc<Self> {
        Self::with_muted(local, kind, false)
    }

    /// Describe a listener that may be muted: a muted listener accepts and
    /// processes queries but never answers.
    #[must_use]
    pub fn with_muted(local: SocketAddr, kind: FrontendKind, muted: bool) -> Arc<Self> {
        Arc::new(Self {
            local,
            kind,
            muted,
            stats: Arc::new(FrontendStats::default()),
        })
    }
}

// ============================================================================
// UDP listener
// ============================================================================

/// A bound UDP listener processing queries inline.
pub struct UdpFrontend {
    frontend: Arc<Frontend>,
    socket: Arc<UdpSocket>,
    engine: QueryEngine,
}

impl UdpFrontend {
    /// Bind a UDP listener.
    pub async fn bind(frontend: Arc<Frontend>, engine: QueryEngine) -> Result<Self> {
        let socket = UdpSocket::bind(frontend.local)
            .await
            .map_err(|e| Error::network_io(format!("binding UDP {}", frontend.local), e))?;
        info!(addr = %frontend.local, "UDP listener bound");
        Ok(Self {
            frontend,
            socket: Arc::new(socket),
            engine,
        })
    }

    /// The bound address, useful with port zero.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|e| Error::network_io("local_addr", e))
    }

    /// The listener's shared socket; replies to in-flight queries go out
    /// through it.
    #[must_use]
    pub fn socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }

    /// The listener description.
    #[must_use]
    pub fn frontend(&self) -> &Arc<Frontend> {
        &self.frontend
    }

    /// Receive loop. Runs until the task is aborted.
    pub async fn run(&self) {
        let mut buf = [0u8; UDP_INCOMING_BUFFER_SIZE];
        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((n, peer)) => self.handle_packet(&buf[..n], peer).await,
                Err(e) => {
                    debug!(addr = %self.frontend.local, error = %e, "UDP receive failed");
                }
            }
        }
    }

    /// Process one datagram.
    pub async fn handle_packet(&self, data: &[u8], peer: SocketAddr) {
        self.frontend.stats.queries.fetch_add(1, Ordering::Relaxed);
        if !self.engine.sanity_check(data) {
            return;
        }
        let mut ctx = match QueryContext::from_packet(
            BytesMut::from(data),
            self.frontend.local,
            peer,
            false,
            Instant::now(),
        ) {
            Ok(ctx) => ctx,
            Err(e) => {
                trace!(client = %peer, error = %e, "unparseable question");
                self.engine
                    .stats()
                    .non_compliant_queries
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        match self.engine.process_query(&mut ctx) {
            ProcessOutcome::Drop => {}
            ProcessOutcome::Answer => {
                self.send_answer(ctx).await;
            }
            ProcessOutcome::Forward(backend) => {
                let wants_cache = !ctx.skip_cache
                    && self
                        .engine
                        .runtime()
                        .pool(&ctx.pool_name)
                        .is_some_and(|pool| pool.cache().is_some());
                let (key, key_no_ecs) = if wants_cache {
                    (Some(ctx.cache_key()), Some(ctx.cache_key_no_ecs()))
                } else {
                    (None, None)
                };
                let payload = crate::backend::SlotPayload::from_query(
                    &ctx,
                    self.socket(),
                    Arc::clone(&self.frontend.stats),
                    self.frontend.muted,
                    key,
                    key_no_ecs,
                );
                if let Err(e) = backend.send_query(ctx.packet, payload).await {
                    self.engine
                        .stats()
                        .downstream_send_errors
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(backend = %backend.name_with_addr(), error = %e, "forward failed");
                }
            }
        }
    }

    async fn send_answer(&self, ctx: QueryContext) {
        if self.frontend.muted {
            return;
        }
        account_answer(&self.engine, &self.frontend, &ctx.packet);

        let delay = Duration::from_millis(u64::from(ctx.delay_ms));
        let socket = self.socket();
        let client = ctx.remote;
        let packet = ctx.packet;
        if delay.is_zero() {
            if let Err(e) = socket.send_to(&packet, client).await {
                debug!(client = %client, error = %e, "answer send failed");
            }
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = socket.send_to(&packet, client).await {
                    debug!(client = %client, error = %e, "delayed answer send failed");
                }
            });
        }
    }
}

/// Count a locally produced answer on the engine and frontend counters.
fn account_answer(engine: &QueryEngine, frontend: &Frontend, packet: &[u8]) {
    let stats = engine.stats();
    stats.responses.fetch_add(1, Ordering::Relaxed);
    frontend.stats.responses.fetch_add(1, Ordering::Relaxed);
    match question::rcode(packet).unwrap_or(0) {
        0 => {
            stats.frontend_noerror.fetch_add(1, Ordering::Relaxed);
        }
        2 => {
            stats.frontend_servfail.fetch_add(1, Ordering::Relaxed);
            stats.servfail_responses.fetch_add(1, Ordering::Relaxed);
        }
        3 => {
            stats.frontend_nxdomain.fetch_add(1, Ordering::Relaxed);
        }
        _ => {}
    }
}

// ============================================================================
// TCP listener
// ============================================================================

/// Tuning for one TCP frontend.
#[derive(Debug, Clone)]
pub struct TcpFrontendConfig {
    /// Concurrent connection cap; surplus connections are closed
    pub max_connections: usize,
    /// Queries served over one connection before it is closed
    pub max_queries_per_conn: usize,
    /// Idle deadline while waiting for the next query
    pub recv_timeout: Duration,
}

impl Default for TcpFrontendConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_TCP_CONNECTIONS,
            max_queries_per_conn: DEFAULT_MAX_TCP_QUERIES_PER_CONN,
            recv_timeout: DEFAULT_TCP_RECV_TIMEOUT,
        }
    }
}

/// A bound TCP acceptor dispatching connections to per-connection tasks.
pub struct TcpFrontend {
    frontend: Arc<Frontend>,
    listener: TcpListener,
    engine: QueryEngine,
    config: TcpFrontendConfig,
    permits: Arc<Semaphore>,
}

impl TcpFrontend {
    /// Bind a TCP listener.
    pub async fn bind(
        frontend: Arc<Frontend>,
        engine: QueryEngine,
        config: TcpFrontendConfig,
    ) -> Result<Self> {
        let listener = TcpListener::bind(frontend.local)
            .await
            .map_err(|e| Error::network_io(format!("binding TCP {}", frontend.local), e))?;
        info!(addr = %frontend.local, "TCP listener bound");
        let permits = Arc::new(Semaphore::new(config.max_connections.max(1)));
        Ok(Self {
            frontend,
            listener,
            engine,
            config,
            permits,
        })
    }

    /// The bound address, useful with port zero.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| Error::network_io("local_addr", e))
    }

    /// Accept loop. Runs until the task is aborted.
    pub async fn run(&self) {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    debug!(addr = %self.frontend.local, error = %e, "accept failed");
                    continue;
                }
            };
            // back-pressure: at the cap, close instead of queueing
            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                self.frontend
                    .stats
                    .tcp_gave_up
                    .fetch_add(1, Ordering::Relaxed);
                self.engine
                    .stats()
                    .tcp_queue_full
                    .fetch_add(1, Ordering::Relaxed);
                drop(stream);
                continue;
            };

            let frontend = Arc::clone(&self.frontend);
            let engine = self.engine.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                let _permit = permit;
                frontend
                    .stats
                    .tcp_current_connections
                    .fetch_add(1, Ordering::Relaxed);
                serve_tcp_connection(stream, peer, &frontend, &engine, &config).await;
                frontend
                    .stats
                    .tcp_current_connections
                    .fetch_sub(1, Ordering::Relaxed);
            });
        }
    }
}

async fn serve_tcp_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    frontend: &Arc<Frontend>,
    engine: &QueryEngine,
    config: &TcpFrontendConfig,
) {
    for _ in 0..config.max_queries_per_conn {
        // length-prefixed framing per RFC 1035
        let mut len_buf = [0u8; 2];
        match timeout(config.recv_timeout, stream.read_exact(&mut len_buf)).await {
            Err(_) => {
                frontend
                    .stats
                    .tcp_client_timeouts
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }
            Ok(Err(_)) => return, // orderly close or reset between queries
            Ok(Ok(_)) => {}
        }
        let len = usize::from(u16::from_be_bytes(len_buf));
        if len == 0 {
            return;
        }
        let mut data = vec![0u8; len];
        match timeout(config.recv_timeout, stream.read_exact(&mut data)).await {
            Ok(Ok(_)) => {}
            _ => {
                frontend
                    .stats
                    .tcp_died_reading_query
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        frontend.stats.queries.fetch_add(1, Ordering::Relaxed);
        if !engine.sanity_check(&data) {
            continue;
        }
        let mut ctx = match QueryContext::from_packet(
            BytesMut::from(&data[..]),
            frontend.local,
            peer,
            true,
            Instant::now(),
        ) {
            Ok(ctx) => ctx,
            Err(_) => {
                engine
                    .stats()
                    .non_compliant_queries
                    .fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };

        let answer = match engine.process_query(&mut ctx) {
            ProcessOutcome::Drop => continue,
            ProcessOutcome::Answer => true,
            ProcessOutcome::Forward(backend) => {
                if engine.forward_over_tcp(&backend, &mut ctx).await {
                    true
                } else {
                    // downstream failed for this stream client, tell it so
                    match synthesize_rcode(&ctx, hickory_proto::op::ResponseCode::ServFail) {
                        Ok(response) => {
                            ctx.packet = response;
                            true
                        }
                        Err(_) => false,
                    }
                }
            }
        };
        if !answer || frontend.muted {
            continue;
        }

        account_answer(engine, frontend, &ctx.packet);
        if ctx.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(u64::from(ctx.delay_ms))).await;
        }
        let len = ctx.packet.len().min(usize::from(u16::MAX)) as u16;
        let write = async {
            stream.write_all(&len.to_be_bytes()).await?;
            stream.write_all(&ctx.packet[..usize::from(len)]).await?;
            stream.flush().await
        };
        if write.await.is_err() {
            frontend
                .stats
                .tcp_died_sending_response
                .fetch_add(1, Ordering::Relaxed);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_describe() {
        assert_eq!(FrontendKind::Udp.describe(), "UDP");
        assert_eq!(FrontendKind::Dot.describe(), "TCP (DNS over TLS)");
        assert_eq!(FrontendKind::DnsCrypt.describe(), "UDP (DNSCrypt)");
    }

    #[test]
    fn test_frontend_defaults() {
        let frontend = Frontend::new("127.0.0.1:53".parse().unwrap(), FrontendKind::Udp);
        assert!(!frontend.muted);
        assert_eq!(frontend.stats.queries.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_tcp_config_defaults() {
        let config = TcpFrontendConfig::default();
        assert_eq!(config.max_connections, DEFAULT_MAX_TCP_CONNECTIONS);
        assert_eq!(config.max_queries_per_conn, DEFAULT_MAX_TCP_QUERIES_PER_CONN);
        assert_eq!(config.recv_timeout, DEFAULT_TCP_RECV_TIMEOUT);
    }
}
