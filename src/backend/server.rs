//! Downstream backend servers
//!
//! A `Backend` owns everything about one resolver the engine forwards to:
//! a fan-out of connected UDP sockets, the in-flight correlation table, the
//! query rate limiter, health state fed by synthetic probes, the weight and
//! order that drive the selection policies, and the precomputed positions
//! on the consistent-hash ring.
//!
//! Responder tasks (one per socket) read backend answers and hand them to
//! the engine's response path; the slot table does the correlation back to
//! the original client.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::BytesMut;
use hickory_proto::op::{Message, MessageType, Query};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::health::{HealthCheckConfig, HealthState};
use super::slot::{SlotPayload, SlotTable};
use crate::error::{Error, Result};
use crate::limiter::QpsLimiter;
use crate::question::{self, MAX_UDP_PACKET_SIZE};

/// Default number of UDP sockets opened towards a backend.
pub const DEFAULT_SOCKET_COUNT: usize = 1;

/// Default in-flight table capacity.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 65_536;

/// Default time an unanswered UDP query stays in flight.
pub const DEFAULT_UDP_TIMEOUT: Duration = Duration::from_secs(2);

/// Construction parameters for a backend.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Operator-facing name
    pub name: String,
    /// The resolver to forward to
    pub remote: SocketAddr,
    /// Local address to bind the fan-out sockets to
    pub source_address: Option<SocketAddr>,
    /// Interface to bind the fan-out sockets to (Linux)
    pub source_interface: Option<String>,
    /// Number of UDP sockets in the fan-out
    pub socket_count: usize,
    /// Steady-state query rate gate, zero for unlimited
    pub qps_rate: u32,
    /// Burst capacity of the rate gate
    pub qps_burst: u32,
    /// Relative weight for the weighted and hashed policies
    pub weight: u32,
    /// Sort order inside pools, lowest first
    pub order: u32,
    /// In-flight table capacity
    pub max_in_flight: usize,
    /// How long an unanswered UDP query stays in flight
    pub udp_timeout: Duration,
    /// TCP connect deadline for stream queries
    pub tcp_connect_timeout: Duration,
    /// TCP read deadline for stream queries
    pub tcp_read_timeout: Duration,
    /// TCP write deadline for stream queries
    pub tcp_write_timeout: Duration,
    /// Re-open the fan-out sockets when the backend comes back up
    pub reconnect_on_up: bool,
    /// Probe configuration
    pub health: HealthCheckConfig,
}

impl BackendConfig {
    /// Parameters for a backend at `remote` with every knob at its default.
    #[must_use]
    pub fn new(name: impl Into<String>, remote: SocketAddr) -> Self {
        Self {
            name: name.into(),
            remote,
            source_address: None,
            source_interface: None,
            socket_count: DEFAULT_SOCKET_COUNT,
            qps_rate: 0,
            qps_burst: 0,
            weight: 1,
            order: 1,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            udp_timeout: DEFAULT_UDP_TIMEOUT,
            tcp_connect_timeout: Duration::from_secs(5),
            tcp_read_timeout: Duration::from_secs(30),
            tcp_write_timeout: Duration::from_secs(30),
            reconnect_on_up: false,
            health: HealthCheckConfig::default(),
        }
    }

    /// Set the rate gate.
    #[must_use]
    pub fn with_qps(mut self, rate: u32, burst: u32) -> Self {
        self.qps_rate = rate;
        self.qps_burst = burst;
        self
    }

    /// Set the selection weight.
    #[must_use]
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight.max(1);
        self
    }

    /// Set the pool sort order.
    #[must_use]
    pub fn with_order(mut self, order: u32) -> Self {
        self.order = order;
        self
    }

    /// Set the fan-out width.
    #[must_use]
    pub fn with_socket_count(mut self, count: usize) -> Self {
        self.socket_count = count.max(1);
        self
    }
}

/// Aggregate counters for one backend.
#[derive(Debug, Default)]
pub struct BackendStats {
    /// Queries sent
    pub queries: AtomicU64,
    /// Responses received and matched
    pub responses: AtomicU64,
    /// Send failures
    pub send_errors: AtomicU64,
    /// Slots reused before their response arrived
    pub reuseds: AtomicU64,
    /// Slots released by the timeout sweep
    pub timeouts: AtomicU64,
}

/// One downstream resolver.
pub struct Backend {
    /// Stable identity, preserved across reconnects
    pub id: Uuid,
    name: String,
    name_with_addr: String,
    /// The resolver address
    pub remote: SocketAddr,
    source_address: Option<SocketAddr>,
    source_interface: Option<String>,
    socket_count: usize,
    sockets: RwLock<Vec<Arc<UdpSocket>>>,
    // serializes reconnects, not the fan-out reads
    connect_lock: Mutex<()>,
    socket_cursor: AtomicUsize,
    /// Per-backend query rate gate
    pub limiter: QpsLimiter,
    /// In-flight correlation table
    pub slots: SlotTable,
    weight: AtomicU32,
    order: u32,
    pools: RwLock<BTreeSet<String>>,
    /// Probe-driven health state
    pub health: HealthState,
    /// Probe configuration
    pub health_config: HealthCheckConfig,
    /// Aggregate counters
    pub stats: BackendStats,
    /// Exponentially weighted round-trip average, microseconds (f64 bits)
    latency_usec: AtomicU64,
    ring_hashes: ArcSwap<Vec<u64>>,
    last_probe: Mutex<Option<std::time::Instant>>,
    connected: AtomicBool,
    stopped: AtomicBool,
    /// How long an unanswered UDP query stays in flight
    pub udp_timeout: Duration,
    /// TCP connect deadline for stream queries
    pub tcp_connect_timeout: Duration,
    /// TCP read deadline for stream queries
    pub tcp_read_timeout: Duration,
    /// TCP write deadline for stream queries
    pub tcp_write_timeout: Duration,
    /// Re-open sockets on a down-to-up transition
    pub reconnect_on_up: bool,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("remote", &self.remote)
            .field("status", &self.health.status())
            .field("outstanding", &self.slots.outstanding())
            .finish()
    }
}

impl Backend {
    /// Create a backend in the disconnected state. Call [`Backend::connect`]
    /// to open the socket fan-out.
    #[must_use]
    pub fn new(config: BackendConfig) -> Arc<Self> {
        let name_with_addr = if config.name.is_empty() {
            config.remote.to_string()
        } else {
            format!("{} ({})", config.name, config.remote)
        };
        let backend = Arc::new(Self {
            id: Uuid::new_v4(),
            name: config.name,
            name_with_addr,
            remote: config.remote,
            source_address: config.source_address,
            source_interface: config.source_interface,
            socket_count: config.socket_count.max(1),
            sockets: RwLock::new(Vec::new()),
            connect_lock: Mutex::new(()),
            socket_cursor: AtomicUsize::new(0),
            limiter: QpsLimiter::new(config.qps_rate, config.qps_burst),
            slots: SlotTable::new(config.max_in_flight),
            weight: AtomicU32::new(config.weight.max(1)),
            order: config.order,
            pools: RwLock::new(BTreeSet::new()),
            health: HealthState::new(&config.health),
            health_config: config.health,
            stats: BackendStats::default(),
            latency_usec: AtomicU64::new(0f64.to_bits()),
            ring_hashes: ArcSwap::from_pointee(Vec::new()),
            last_probe: Mutex::new(None),
            connected: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            udp_timeout: config.udp_timeout,
            tcp_connect_timeout: config.tcp_connect_timeout,
            tcp_read_timeout: config.tcp_read_timeout,
            tcp_write_timeout: config.tcp_write_timeout,
            reconnect_on_up: config.reconnect_on_up,
        });
        backend.rehash();
        backend
    }

    /// Operator-facing name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name and address, for logs.
    #[must_use]
    pub fn name_with_addr(&self) -> &str {
        &self.name_with_addr
    }

    /// Effective availability.
    #[must_use]
    pub fn is_up(&self) -> bool {
        self.health.is_up()
    }

    /// Whether `stop` was called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Whether the socket fan-out is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Queries awaiting a response.
    #[must_use]
    pub fn outstanding(&self) -> u64 {
        self.slots.outstanding()
    }

    /// Pool sort order.
    #[must_use]
    pub fn order(&self) -> u32 {
        self.order
    }

    /// Selection weight.
    #[must_use]
    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    /// Change the selection weight and recompute the ring positions.
    ///
    /// Pools containing this backend re-sort on their next edit; weight
    /// does not participate in the order-based sort.
    pub fn set_weight(&self, weight: u32) {
        self.weight.store(weight.max(1), Ordering::Relaxed);
        self.rehash();
    }

    /// The backend's positions on the consistent-hash ring.
    #[must_use]
    pub fn ring_hashes(&self) -> Arc<Vec<u64>> {
        self.ring_hashes.load_full()
    }

    /// Recompute the ring positions from the current weight.
    pub fn rehash(&self) {
        let weight = self.weight();
        let mut hashes = Vec::with_capacity(weight as usize);
        for i in 0..weight {
            let mut hasher = DefaultHasher::new();
            self.name_with_addr.hash(&mut hasher);
            i.hash(&mut hasher);
            hashes.push(hasher.finish());
        }
        hashes.sort_unstable();
        self.ring_hashes.store(Arc::new(hashes));
    }

    /// Smoothed round-trip time in microseconds.
    #[must_use]
    pub fn latency_usec(&self) -> f64 {
        f64::from_bits(self.latency_usec.load(Ordering::Relaxed))
    }

    /// Blend one observed round trip into the smoothed latency.
    pub fn record_latency(&self, usec: f64) {
        let mut current = self.latency_usec.load(Ordering::Relaxed);
        loop {
            let blended = (127.0 * f64::from_bits(current) / 128.0) + usec / 128.0;
            match self.latency_usec.compare_exchange_weak(
                current,
                blended.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Record pool membership.
    pub fn add_pool(&self, name: &str) {
        self.pools.write().insert(name.to_string());
    }

    /// Drop pool membership.
    pub fn remove_pool(&self, name: &str) {
        self.pools.write().remove(name);
    }

    /// Names of the pools this backend belongs to.
    #[must_use]
    pub fn pools(&self) -> Vec<String> {
        self.pools.read().iter().cloned().collect()
    }

    // ========================================================================
    // Sockets
    // ========================================================================

    fn make_socket(&self) -> Result<UdpSocket> {
        let domain = if self.remote.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| Error::network_io("creating backend socket", e))?;

        #[cfg(target_os = "linux")]
        if let Some(interface) = &self.source_interface {
            socket
                .bind_device(Some(interface.as_bytes()))
                .map_err(|e| Error::network_io(format!("binding to {interface}"), e))?;
        }
        if let Some(source) = self.source_address {
            socket
                .bind(&source.into())
                .map_err(|e| Error::network_io(format!("binding to {source}"), e))?;
        }
        socket
            .set_nonblocking(true)
            .map_err(|e| Error::network_io("setting non-blocking", e))?;
        socket
            .connect(&self.remote.into())
            .map_err(|e| Error::network_io(format!("connecting to {}", self.remote), e))?;

        UdpSocket::from_std(socket.into())
            .map_err(|e| Error::network_io("registering backend socket", e))
    }

    /// Open (or re-open) the socket fan-out.
    pub fn connect(&self) -> Result<()> {
        let _guard = self.connect_lock.lock();
        let mut fresh = Vec::with_capacity(self.socket_count);
        for _ in 0..self.socket_count {
            fresh.push(Arc::new(self.make_socket()?));
        }
        *self.sockets.write() = fresh;
        self.connected.store(true, Ordering::Release);
        debug!(backend = %self.name_with_addr, sockets = self.socket_count, "backend connected");
        Ok(())
    }

    /// Close and re-open the fan-out under the connect lock.
    pub fn reconnect(&self) -> Result<()> {
        info!(backend = %self.name_with_addr, "reconnecting");
        self.connected.store(false, Ordering::Release);
        self.connect()
    }

    /// Stop the backend: responders exit on their next wakeup and the
    /// in-flight table is drained.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let drained = self.slots.drain();
        if drained > 0 {
            debug!(backend = %self.name_with_addr, drained, "drained in-flight slots on stop");
        }
    }

    fn pick_socket(&self) -> Option<Arc<UdpSocket>> {
        let sockets = self.sockets.read();
        if sockets.is_empty() {
            return None;
        }
        let index = self.socket_cursor.fetch_add(1, Ordering::Relaxed) % sockets.len();
        Some(Arc::clone(&sockets[index]))
    }

    /// The socket at a fan-out index, for the responder tasks.
    #[must_use]
    pub fn socket_at(&self, index: usize) -> Option<Arc<UdpSocket>> {
        self.sockets.read().get(index).map(Arc::clone)
    }

    /// Width of the socket fan-out.
    #[must_use]
    pub fn socket_count(&self) -> usize {
        self.socket_count
    }

    // ========================================================================
    // Forwarding
    // ========================================================================

    /// Claim a slot and forward `packet` to the resolver.
    ///
    /// The forwarded packet's transaction id becomes the slot index; the
    /// original id travels in the payload and is restored on the reply. A
    /// send failure releases the slot immediately.
    pub async fn send_query(&self, mut packet: BytesMut, payload: SlotPayload) -> Result<()> {
        let claimed = self.slots.claim(payload);
        if claimed.reused {
            self.stats.reuseds.fetch_add(1, Ordering::Relaxed);
        }
        question::set_dns_id(&mut packet, claimed.index)?;

        let Some(socket) = self.pick_socket() else {
            self.slots.force_release(claimed.index);
            self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
            return Err(Error::network("backend is not connected"));
        };

        self.stats.queries.fetch_add(1, Ordering::Relaxed);
        match socket.send(&packet).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.slots.force_release(claimed.index);
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(Error::network_io(
                    format!("sending to {}", self.name_with_addr),
                    e,
                ))
            }
        }
    }

    /// Resolve one query over a dedicated TCP exchange.
    ///
    /// Stream clients are served synchronously: connect, length-prefixed
    /// write, length-prefixed read, each under its own deadline.
    pub async fn query_tcp(&self, packet: &[u8]) -> Result<BytesMut> {
        let mut stream = timeout(self.tcp_connect_timeout, TcpStream::connect(self.remote))
            .await
            .map_err(|_| Error::timeout("tcp connect", self.tcp_connect_timeout))?
            .map_err(|e| Error::network_io(format!("connecting to {}", self.remote), e))?;

        self.stats.queries.fetch_add(1, Ordering::Relaxed);
        let len = u16::try_from(packet.len())
            .map_err(|_| Error::serialize("query exceeds the stream frame size"))?;
        let write = async {
            stream.write_all(&len.to_be_bytes()).await?;
            stream.write_all(packet).await?;
            stream.flush().await
        };
        timeout(self.tcp_write_timeout, write)
            .await
            .map_err(|_| Error::timeout("tcp write", self.tcp_write_timeout))?
            .map_err(|e| Error::network_io("writing stream query", e))?;

        let read = async {
            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await?;
            let len = usize::from(u16::from_be_bytes(len_buf));
            let mut body = vec![0u8; len];
            stream.read_exact(&mut body).await?;
            Ok::<_, std::io::Error>(body)
        };
        let body = timeout(self.tcp_read_timeout, read)
            .await
            .map_err(|_| Error::timeout("tcp read", self.tcp_read_timeout))?
            .map_err(|e| Error::network_io("reading stream response", e))?;

        self.stats.responses.fetch_add(1, Ordering::Relaxed);
        Ok(BytesMut::from(&body[..]))
    }

    // ========================================================================
    // Probing
    // ========================================================================

    /// Send one synthetic probe and judge the answer.
    pub async fn probe(&self) -> bool {
        match self.probe_inner().await {
            Ok(healthy) => healthy,
            Err(e) => {
                debug!(backend = %self.name_with_addr, error = %e, "probe failed");
                false
            }
        }
    }

    async fn probe_inner(&self) -> Result<bool> {
        let id: u16 = rand::thread_rng().gen();
        let mut message = Message::new();
        message.set_id(id);
        message.set_message_type(MessageType::Query);
        message.set_recursion_desired(true);
        message.add_query(Query::query(
            self.health_config.check_name.clone(),
            self.health_config.check_type,
        ));
        let packet = message
            .to_bytes()
            .map_err(|e| Error::serialize(format!("probe: {e}")))?;

        let bind_addr: SocketAddr = if self.remote.is_ipv4() {
            "0.0.0.0:0".parse().expect("static addr")
        } else {
            "[::]:0".parse().expect("static addr")
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| Error::network_io("binding probe socket", e))?;
        socket
            .connect(self.remote)
            .await
            .map_err(|e| Error::network_io("connecting probe socket", e))?;
        socket
            .send(&packet)
            .await
            .map_err(|e| Error::network_io("sending probe", e))?;

        let mut buf = [0u8; MAX_UDP_PACKET_SIZE];
        let deadline = self.health_config.timeout;
        let n = timeout(deadline, socket.recv(&mut buf))
            .await
            .map_err(|_| Error::timeout("probe", deadline))?
            .map_err(|e| Error::network_io("receiving probe answer", e))?;

        let response = Message::from_bytes(&buf[..n])
            .map_err(|e| Error::parse(format!("probe answer: {e}")))?;
        if response.id() != id {
            return Ok(false);
        }
        if response.message_type() != MessageType::Response {
            return Ok(false);
        }
        let rcode = response.response_code();
        let healthy = if self.health_config.must_resolve {
            rcode == hickory_proto::op::ResponseCode::NoError
        } else {
            rcode != hickory_proto::op::ResponseCode::ServFail
        };
        Ok(healthy)
    }

    /// Run one full health-check round: sweep the in-flight table for
    /// timeouts, probe if warranted, and apply the result.
    ///
    /// With lazy checks enabled, a backend whose limiter was never consulted
    /// since `round_started` is skipped entirely.
    pub async fn health_check_round(&self, round_started: std::time::Instant) -> usize {
        let harvested = self.slots.harvest_expired(self.udp_timeout);
        let timeouts = harvested.len();
        if timeouts > 0 {
            self.stats
                .timeouts
                .fetch_add(timeouts as u64, Ordering::Relaxed);
            // dropping the payloads closes any attached back-channel
        }

        if self.health.availability() == super::health::Availability::Auto {
            let due = {
                let mut last = self.last_probe.lock();
                let due = last.map_or(true, |at| {
                    round_started.saturating_duration_since(at) >= self.health_config.interval
                });
                if due {
                    *last = Some(round_started);
                }
                due
            };
            let idle = self.health_config.lazy
                && !round_started
                    .checked_sub(self.health_config.interval)
                    .map_or(true, |cutoff| self.limiter.seen_since(cutoff));
            if due && !idle {
                let healthy = self.probe().await;
                match self.health.record_probe(healthy) {
                    Some(super::health::Transition::Fell) => {
                        warn!(backend = %self.name_with_addr, "marked down after consecutive probe failures");
                    }
                    Some(super::health::Transition::Rose) => {
                        info!(backend = %self.name_with_addr, "marked up again");
                        if self.reconnect_on_up {
                            if let Err(e) = self.reconnect() {
                                warn!(backend = %self.name_with_addr, error = %e, "reconnect on rise failed");
                            }
                        }
                    }
                    None => {}
                }
            }
        }
        timeouts
    }
}

// ============================================================================
// Responder loop
// ============================================================================

/// Spawn one responder task per fan-out socket.
pub fn spawn_responders(backend: &Arc<Backend>, engine: &crate::engine::QueryEngine) {
    for index in 0..backend.socket_count() {
        tokio::spawn(responder_loop(
            Arc::clone(backend),
            index,
            engine.clone(),
        ));
    }
}

/// Read backend answers from one socket of the fan-out and feed them to
/// the engine's response path. Wakes up periodically so `stop()` is
/// noticed; picks the socket up fresh each pass so a reconnect swaps it
/// underneath without restarting the task.
pub async fn responder_loop(
    backend: Arc<Backend>,
    socket_index: usize,
    engine: crate::engine::QueryEngine,
) {
    let mut buf = [0u8; MAX_UDP_PACKET_SIZE];
    while !backend.is_stopped() {
        let Some(socket) = backend.socket_at(socket_index) else {
            tokio::time::sleep(Duration::from_millis(200)).await;
            continue;
        };
        match timeout(Duration::from_secs(1), socket.recv(&mut buf)).await {
            // wakeup, re-check the stopped flag
            Err(_) => continue,
            Ok(Ok(n)) => engine.handle_backend_response(&backend, &buf[..n]).await,
            Ok(Err(e)) => {
                debug!(backend = %backend.name_with_addr(), error = %e, "responder read failed");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
    debug!(backend = %backend.name_with_addr(), socket_index, "responder exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> BackendConfig {
        BackendConfig::new("test", "127.0.0.1:5300".parse().unwrap())
    }

    // ========================================================================
    // Construction Tests
    // ========================================================================

    #[test]
    fn test_new_backend_is_disconnected_and_down() {
        let backend = Backend::new(local_config());
        assert!(!backend.is_connected());
        assert!(!backend.is_up());
        assert!(!backend.is_stopped());
        assert_eq!(backend.outstanding(), 0);
        assert_eq!(backend.weight(), 1);
    }

    #[test]
    fn test_name_with_addr() {
        let backend = Backend::new(local_config());
        assert_eq!(backend.name_with_addr(), "test (127.0.0.1:5300)");
        let anonymous = Backend::new(BackendConfig::new("", "127.0.0.1:53".parse().unwrap()));
        assert_eq!(anonymous.name_with_addr(), "127.0.0.1:53");
    }

    // ========================================================================
    // Ring Hash Tests
    // ========================================================================

    #[test]
    fn test_ring_hashes_follow_weight() {
        let backend = Backend::new(local_config().with_weight(4));
        assert_eq!(backend.ring_hashes().len(), 4);
        backend.set_weight(8);
        assert_eq!(backend.ring_hashes().len(), 8);
    }

    #[test]
    fn test_ring_hashes_are_deterministic() {
        let a = Backend::new(local_config().with_weight(4));
        let b = Backend::new(local_config().with_weight(4));
        // same name and address produce the same ring positions
        assert_eq!(*a.ring_hashes(), *b.ring_hashes());
    }

    #[test]
    fn test_ring_hashes_sorted() {
        let backend = Backend::new(local_config().with_weight(16));
        let hashes = backend.ring_hashes();
        let mut sorted = (*hashes).clone();
        sorted.sort_unstable();
        assert_eq!(*hashes, sorted);
    }

    // ========================================================================
    // Latency Tests
    // ========================================================================

    #[test]
    fn test_latency_ewma_moves_towards_observations() {
        let backend = Backend::new(local_config());
        assert_eq!(backend.latency_usec(), 0.0);
        for _ in 0..512 {
            backend.record_latency(1_000.0);
        }
        let latency = backend.latency_usec();
        assert!(latency > 900.0, "ewma should approach 1000, got {latency}");
        assert!(latency <= 1_000.0);
    }

    // ========================================================================
    // Pool Membership Tests
    // ========================================================================

    #[test]
    fn test_pool_membership_is_by_name() {
        let backend = Backend::new(local_config());
        backend.add_pool("");
        backend.add_pool("abuse");
        assert_eq!(backend.pools(), vec![String::new(), "abuse".to_string()]);
        backend.remove_pool("abuse");
        assert_eq!(backend.pools(), vec![String::new()]);
    }

    // ========================================================================
    // Lifecycle Tests
    // ========================================================================

    #[tokio::test]
    async fn test_connect_then_stop_drains() {
        let backend = Backend::new(local_config().with_socket_count(2));
        backend.connect().unwrap();
        assert!(backend.is_connected());
        assert!(backend.socket_at(0).is_some());
        assert!(backend.socket_at(1).is_some());
        assert!(backend.socket_at(2).is_none());

        backend.stop();
        assert!(backend.is_stopped());
    }

    #[tokio::test]
    async fn test_send_query_without_sockets_releases_slot() {
        use crate::question::test_support::query_context;

        let backend = Backend::new(local_config());
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let ctx = query_context("example.com.", hickory_proto::rr::RecordType::A, "10.0.0.1:1");
        let payload = SlotPayload::from_query(
            &ctx,
            socket,
            Arc::new(crate::frontend::FrontendStats::default()),
            false,
            None,
            None,
        );
        let packet = ctx.packet.clone();

        let err = backend.send_query(packet, payload).await.unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(backend.outstanding(), 0);
        assert_eq!(backend.stats.send_errors.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_probe_against_nothing_fails() {
        let mut config = local_config();
        config.health = HealthCheckConfig::default().with_timeout(Duration::from_millis(50));
        // nothing listens on this port
        config.remote = "127.0.0.1:1".parse().unwrap();
        let backend = Backend::new(config);
        assert!(!backend.probe().await);
    }
}
