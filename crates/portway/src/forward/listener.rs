//! Listener - the bound acceptor for one rule's listen endpoint.
//!
//! A TCP listener accepts connections, dials the target for each one and
//! runs a Relay per connection. A UDP listener receives datagrams and keeps
//! one [`UdpSession`] per client address. Every relay runs in the
//! listener's `JoinSet` under a child of the listener's cancellation token,
//! so stopping the listener reaches all of them.

use super::relay::{self, RelayEnd, UdpSession, MAX_DATAGRAM};
use super::stats::RuleCounters;
use super::types::{ListenTuple, Rule, RuleId};
use super::ForwardError;
use crate::config::{EngineSettings, Protocol};
use parking_lot::Mutex;
use socket2::{Domain, Socket, Type};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause after a non-transient accept error before retrying
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Reported when a bound listener dies on its own
#[derive(Debug, Clone)]
pub struct ListenerFailure {
    pub rule_id: RuleId,
    /// Identifies the listener instance that failed
    pub listener_id: u64,
    pub reason: String,
}

/// Outcome of closing a listener's relays
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Relays that finished within the grace period
    pub drained: usize,
    /// Relays force-closed after the grace period
    pub forced: usize,
}

/// Unbound non-blocking socket for `addr`.
///
/// IPv6 sockets are v6-only so `[::]` and `0.0.0.0` stay separate tuples
/// for both protocols.
fn new_socket(addr: SocketAddr, ty: Type, protocol: socket2::Protocol) -> io::Result<Socket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, ty, Some(protocol))?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Create a TCP listen socket on `addr`
pub fn create_tcp_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = new_socket(addr, Type::STREAM, socket2::Protocol::TCP)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?; // Backlog size
    Ok(socket.into())
}

/// Create a UDP socket on `addr`.
///
/// No SO_REUSEADDR here: on UDP it would let a second socket share the port.
pub fn create_udp_socket(addr: SocketAddr) -> io::Result<std::net::UdpSocket> {
    let socket = new_socket(addr, Type::DGRAM, socket2::Protocol::UDP)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Run a blocking bind on the blocking pool, giving up after `limit`.
///
/// A bind that outlives the limit is abandoned; its socket is closed when
/// the blocking task finishes.
async fn bind_within<T, F>(tuple: &ListenTuple, limit: Duration, bind: F) -> Result<T, ForwardError>
where
    T: Send + 'static,
    F: FnOnce() -> io::Result<T> + Send + 'static,
{
    let bind_err = |reason: String| ForwardError::BindError {
        addr: tuple.to_string(),
        reason,
    };

    tokio::time::timeout(limit, tokio::task::spawn_blocking(bind))
        .await
        .map_err(|_| bind_err(format!("timed out after {}ms", limit.as_millis())))?
        .map_err(|e| bind_err(e.to_string()))?
        .map_err(|e| bind_err(e.to_string()))
}

/// Accept/recv errors that say nothing about the health of the listen socket
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

/// State shared by a listener's loop task
#[derive(Clone)]
struct LoopContext {
    rule_id: RuleId,
    target: Arc<str>,
    counters: Arc<RuleCounters>,
    settings: EngineSettings,
    cancel: CancellationToken,
    listener_id: u64,
    failures: mpsc::UnboundedSender<ListenerFailure>,
}

impl LoopContext {
    /// Count a non-transient error; true once the limit is reached
    fn accept_failed(&self, consecutive: &mut u32, e: &io::Error) -> bool {
        *consecutive += 1;
        warn!(
            rule_id = self.rule_id,
            error = %e,
            consecutive = *consecutive,
            "Listener I/O error"
        );
        *consecutive >= self.settings.max_accept_errors
    }

    /// Mark the listener failed and tell the supervisor
    fn fail(&self, reason: String) {
        error!(rule_id = self.rule_id, "Listener failed: {}", reason);
        self.counters.record_error(reason.clone());
        let _ = self.failures.send(ListenerFailure {
            rule_id: self.rule_id,
            listener_id: self.listener_id,
            reason,
        });
    }
}

/// A bound listener for one rule
pub struct Listener {
    id: u64,
    rule_id: RuleId,
    tuple: ListenTuple,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<DrainReport>>>,
}

impl Listener {
    /// Bind the rule's listen endpoint and start its loop task
    pub async fn bind(
        rule: &Rule,
        settings: EngineSettings,
        counters: Arc<RuleCounters>,
        failures: mpsc::UnboundedSender<ListenerFailure>,
    ) -> Result<Arc<Self>, ForwardError> {
        let tuple = rule.listen_tuple()?;
        let addr = tuple.socket_addr();
        let bind_err = |reason: String| ForwardError::BindError {
            addr: tuple.to_string(),
            reason,
        };

        let ctx = LoopContext {
            rule_id: rule.id,
            target: Arc::from(rule.target()),
            counters,
            settings,
            cancel: CancellationToken::new(),
            listener_id: NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed),
            failures,
        };

        let (local_addr, task) = match tuple.protocol {
            Protocol::Tcp => {
                let std_listener =
                    bind_within(&tuple, settings.bind_timeout, move || create_tcp_listener(addr))
                        .await?;
                let listener =
                    TcpListener::from_std(std_listener).map_err(|e| bind_err(e.to_string()))?;
                let local_addr = listener.local_addr().map_err(|e| bind_err(e.to_string()))?;
                (local_addr, tokio::spawn(run_tcp(listener, ctx.clone())))
            }
            Protocol::Udp => {
                let std_socket =
                    bind_within(&tuple, settings.bind_timeout, move || create_udp_socket(addr))
                        .await?;
                let socket = UdpSocket::from_std(std_socket).map_err(|e| bind_err(e.to_string()))?;
                let local_addr = socket.local_addr().map_err(|e| bind_err(e.to_string()))?;
                (local_addr, tokio::spawn(run_udp(socket, ctx.clone())))
            }
        };

        info!(
            rule_id = rule.id,
            "Listening on {}://{} -> {}",
            tuple.protocol,
            local_addr,
            ctx.target
        );

        Ok(Arc::new(Self {
            id: ctx.listener_id,
            rule_id: rule.id,
            tuple,
            local_addr,
            cancel: ctx.cancel,
            task: Mutex::new(Some(task)),
        }))
    }

    /// Unique per bound instance, never reused
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn rule_id(&self) -> RuleId {
        self.rule_id
    }

    /// The configured listen tuple (port 0 for ephemeral binds)
    pub fn tuple(&self) -> &ListenTuple {
        &self.tuple
    }

    /// The address actually bound
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, close all relays and wait for the loop task.
    ///
    /// Relays get `drain_grace` to finish before they are aborted. Calling
    /// this again after the first call returns an empty report.
    pub async fn shutdown(&self) -> DrainReport {
        self.cancel.cancel();
        let task = self.task.lock().take();
        match task {
            Some(handle) => match handle.await {
                Ok(report) => report,
                Err(e) => {
                    error!(rule_id = self.rule_id, "Listener task ended abnormally: {}", e);
                    DrainReport::default()
                }
            },
            None => DrainReport::default(),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Wait up to `grace` for relays to finish, then abort the rest
async fn drain(relays: &mut JoinSet<()>, grace: Duration) -> DrainReport {
    let mut report = DrainReport::default();
    let finished = tokio::time::timeout(grace, async {
        while relays.join_next().await.is_some() {
            report.drained += 1;
        }
    })
    .await;

    if finished.is_err() {
        report.forced = relays.len();
        relays.shutdown().await;
    }
    report
}

/// Abort every relay immediately
async fn force_close(relays: &mut JoinSet<()>) -> DrainReport {
    let report = DrainReport {
        drained: 0,
        forced: relays.len(),
    };
    relays.shutdown().await;
    report
}

fn reap(rule_id: RuleId, joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(rule_id, "Relay task panicked: {}", e);
        }
    }
}

async fn run_tcp(listener: TcpListener, ctx: LoopContext) -> DrainReport {
    let mut relays = JoinSet::new();
    let mut consecutive_errors = 0u32;

    loop {
        tokio::select! {
            biased;

            _ = ctx.cancel.cancelled() => break,

            Some(joined) = relays.join_next(), if !relays.is_empty() => {
                reap(ctx.rule_id, joined);
            }

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    consecutive_errors = 0;
                    relays.spawn(handle_tcp_connection(stream, peer, ctx.clone()));
                }
                Err(e) if is_transient(&e) => {
                    debug!(rule_id = ctx.rule_id, "Transient accept error: {}", e);
                }
                Err(e) => {
                    if ctx.accept_failed(&mut consecutive_errors, &e) {
                        ctx.fail(format!("accept failed {consecutive_errors} times in a row: {e}"));
                        ctx.cancel.cancel();
                        return force_close(&mut relays).await;
                    }
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }

    drop(listener);
    let report = drain(&mut relays, ctx.settings.drain_grace).await;
    debug!(rule_id = ctx.rule_id, ?report, "TCP listener stopped");
    report
}

async fn handle_tcp_connection(client: TcpStream, peer: SocketAddr, ctx: LoopContext) {
    let cancel = ctx.cancel.child_token();

    let dialed = tokio::select! {
        _ = cancel.cancelled() => return,
        dialed = relay::dial_tcp(&ctx.target, ctx.settings.connect_timeout) => dialed,
    };
    let target = match dialed {
        Ok(stream) => stream,
        Err(e) => {
            warn!(rule_id = ctx.rule_id, %peer, "Dial failed: {}", e);
            ctx.counters.record_error(e.to_string());
            return;
        }
    };

    let _guard = ctx.counters.connection_opened();
    debug!(rule_id = ctx.rule_id, %peer, "Relaying to {}", ctx.target);

    let end = relay::relay_tcp(
        client,
        target,
        &ctx.counters,
        &cancel,
        ctx.settings.buffer_size,
    )
    .await;

    match end {
        RelayEnd::Failed(e) => {
            debug!(rule_id = ctx.rule_id, %peer, "Relay error: {}", e);
            ctx.counters.record_error(format!("relay {peer}: {e}"));
        }
        end => debug!(rule_id = ctx.rule_id, %peer, "Relay closed: {}", end.as_str()),
    }
}

type Sessions = Arc<Mutex<HashMap<SocketAddr, Arc<UdpSession>>>>;

async fn run_udp(socket: UdpSocket, ctx: LoopContext) -> DrainReport {
    let socket = Arc::new(socket);
    let sessions: Sessions = Arc::new(Mutex::new(HashMap::new()));
    let mut relays = JoinSet::new();
    let mut consecutive_errors = 0u32;
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            biased;

            _ = ctx.cancel.cancelled() => break,

            Some(joined) = relays.join_next(), if !relays.is_empty() => {
                reap(ctx.rule_id, joined);
            }

            received = socket.recv_from(&mut buf) => match received {
                Ok((n, peer)) => {
                    consecutive_errors = 0;
                    let session = match open_session(&socket, &sessions, &mut relays, peer, &ctx).await {
                        Some(session) => session,
                        None => continue,
                    };
                    if let Err(e) = session.send_upstream(&buf[..n], &ctx.counters).await {
                        debug!(rule_id = ctx.rule_id, %peer, "Upstream send failed: {}", e);
                        ctx.counters.record_error(format!("send to {}: {e}", ctx.target));
                    }
                }
                Err(e) if is_transient(&e) => {
                    debug!(rule_id = ctx.rule_id, "Transient recv error: {}", e);
                }
                Err(e) => {
                    if ctx.accept_failed(&mut consecutive_errors, &e) {
                        ctx.fail(format!("recv failed {consecutive_errors} times in a row: {e}"));
                        ctx.cancel.cancel();
                        return force_close(&mut relays).await;
                    }
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }

    let report = drain(&mut relays, ctx.settings.drain_grace).await;
    debug!(rule_id = ctx.rule_id, ?report, "UDP listener stopped");
    report
}

/// Find the live session for `peer`, opening a new one if needed
async fn open_session(
    socket: &Arc<UdpSocket>,
    sessions: &Sessions,
    relays: &mut JoinSet<()>,
    peer: SocketAddr,
    ctx: &LoopContext,
) -> Option<Arc<UdpSession>> {
    let existing = sessions
        .lock()
        .get(&peer)
        .filter(|session| !session.is_closed())
        .cloned();
    if existing.is_some() {
        return existing;
    }

    let session = match UdpSession::open(peer, &ctx.target, ctx.settings.connect_timeout).await {
        Ok(session) => session,
        Err(e) => {
            warn!(rule_id = ctx.rule_id, %peer, "Dial failed: {}", e);
            ctx.counters.record_error(e.to_string());
            return None;
        }
    };
    sessions.lock().insert(peer, Arc::clone(&session));

    let guard = ctx.counters.connection_opened();
    let downstream = Arc::clone(socket);
    let counters = Arc::clone(&ctx.counters);
    let cancel = ctx.cancel.child_token();
    let idle_timeout = ctx.settings.udp_idle_timeout;
    let sessions = Arc::clone(sessions);
    let rule_id = ctx.rule_id;
    let task_session = Arc::clone(&session);

    relays.spawn(async move {
        let end = Arc::clone(&task_session)
            .run(downstream, counters, guard, cancel, idle_timeout)
            .await;
        debug!(rule_id, peer = %task_session.peer(), "UDP session closed: {}", end.as_str());

        let mut sessions = sessions.lock();
        if sessions
            .get(&peer)
            .is_some_and(|current| Arc::ptr_eq(current, &task_session))
        {
            sessions.remove(&peer);
        }
    });

    Some(session)
}
