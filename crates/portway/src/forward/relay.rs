//! Relay - per-connection byte copying between a client and a target.
//!
//! TCP relays copy both directions of one accepted connection. UDP has no
//! connection, so a [`UdpSession`] stands in for one: a client address
//! paired with a connected upstream socket, evicted after an idle timeout.

use super::stats::{ConnectionGuard, RuleCounters};
use super::ForwardError;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Largest payload a UDP datagram can carry
pub const MAX_DATAGRAM: usize = 65_535;

/// Why a relay finished
#[derive(Debug)]
pub enum RelayEnd {
    /// The client closed its side
    ClientClosed,
    /// The target closed its side
    TargetClosed,
    /// The owning Listener was stopped
    Cancelled,
    /// A UDP session saw no traffic for the idle timeout
    Idle,
    /// An I/O error on either side
    Failed(io::Error),
}

impl RelayEnd {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayEnd::ClientClosed => "client closed",
            RelayEnd::TargetClosed => "target closed",
            RelayEnd::Cancelled => "cancelled",
            RelayEnd::Idle => "idle",
            RelayEnd::Failed(_) => "failed",
        }
    }
}

/// Dial a TCP target (`host:port`) within `connect_timeout`
pub async fn dial_tcp(target: &str, connect_timeout: Duration) -> Result<TcpStream, ForwardError> {
    let dial_err = |reason: String| ForwardError::DialError {
        target: target.to_string(),
        reason,
    };

    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(target))
        .await
        .map_err(|_| dial_err(format!("timed out after {}ms", connect_timeout.as_millis())))?
        .map_err(|e| dial_err(e.to_string()))?;

    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", target, e);
    }
    Ok(stream)
}

/// Copy bytes between `client` and `target` until one side ends.
///
/// The first EOF or error from either side ends the relay and both
/// sockets are closed when they drop. Bytes are counted once written:
/// client to target as "in", target to client as "out".
///
/// Cancellation starts a drain: the client is no longer read, the target
/// gets end-of-stream, and its remaining output is still delivered until
/// it closes. A target that never closes keeps the relay alive until the
/// owning Listener aborts it.
pub async fn relay_tcp(
    client: TcpStream,
    target: TcpStream,
    counters: &RuleCounters,
    cancel: &CancellationToken,
    buffer_size: usize,
) -> RelayEnd {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut target_read, mut target_write) = target.into_split();
    let mut upstream = vec![0u8; buffer_size];
    let mut downstream = vec![0u8; buffer_size];
    let mut draining = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled(), if !draining => {
                draining = true;
                if let Err(e) = target_write.shutdown().await {
                    debug!("Half-close of target failed: {}", e);
                    return RelayEnd::Cancelled;
                }
            }

            read = client_read.read(&mut upstream), if !draining => {
                let n = match read {
                    Ok(0) => return RelayEnd::ClientClosed,
                    Ok(n) => n,
                    Err(e) => return RelayEnd::Failed(e),
                };
                if let Err(e) = target_write.write_all(&upstream[..n]).await {
                    return RelayEnd::Failed(e);
                }
                counters.add_bytes_in(n as u64);
            }

            read = target_read.read(&mut downstream) => {
                let n = match read {
                    Ok(0) if draining => return RelayEnd::Cancelled,
                    Ok(0) => return RelayEnd::TargetClosed,
                    Ok(n) => n,
                    Err(e) => return RelayEnd::Failed(e),
                };
                if let Err(e) = client_write.write_all(&downstream[..n]).await {
                    return RelayEnd::Failed(e);
                }
                counters.add_bytes_out(n as u64);
            }
        }
    }
}

/// One UDP client's pseudo-connection to the target
#[derive(Debug)]
pub struct UdpSession {
    peer: SocketAddr,
    upstream: UdpSocket,
    epoch: Instant,
    /// Milliseconds since `epoch` of the last datagram in either direction
    last_activity: AtomicU64,
    closed: AtomicBool,
}

impl UdpSession {
    /// Open an upstream socket connected to `target` on behalf of `peer`
    pub async fn open(
        peer: SocketAddr,
        target: &str,
        connect_timeout: Duration,
    ) -> Result<Arc<Self>, ForwardError> {
        let dial_err = |reason: String| ForwardError::DialError {
            target: target.to_string(),
            reason,
        };

        let connect = async {
            let addr = tokio::net::lookup_host(target)
                .await?
                .next()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address resolved"))?;
            let local = match addr.ip() {
                IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
                IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
            };
            let socket = UdpSocket::bind(local).await?;
            socket.connect(addr).await?;
            Ok::<_, io::Error>(socket)
        };

        let upstream = tokio::time::timeout(connect_timeout, connect)
            .await
            .map_err(|_| dial_err(format!("timed out after {}ms", connect_timeout.as_millis())))?
            .map_err(|e| dial_err(e.to_string()))?;

        Ok(Arc::new(Self {
            peer,
            upstream,
            epoch: Instant::now(),
            last_activity: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// True once the session task has exited
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_activity.store(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_activity.load(Ordering::Relaxed)))
    }

    /// Forward one client datagram to the target
    pub async fn send_upstream(&self, datagram: &[u8], counters: &RuleCounters) -> io::Result<()> {
        self.upstream.send(datagram).await?;
        self.touch();
        counters.add_bytes_in(datagram.len() as u64);
        Ok(())
    }

    /// Relay target replies back to the client through `downstream` until
    /// the session goes idle or is cancelled.
    pub async fn run(
        self: Arc<Self>,
        downstream: Arc<UdpSocket>,
        counters: Arc<RuleCounters>,
        _guard: ConnectionGuard,
        cancel: CancellationToken,
        idle_timeout: Duration,
    ) -> RelayEnd {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let end = loop {
            let idle = self.idle_for();
            if idle >= idle_timeout {
                break RelayEnd::Idle;
            }

            tokio::select! {
                _ = cancel.cancelled() => break RelayEnd::Cancelled,
                _ = tokio::time::sleep(idle_timeout - idle) => continue,
                received = self.upstream.recv(&mut buf) => match received {
                    Ok(n) => {
                        self.touch();
                        if let Err(e) = downstream.send_to(&buf[..n], self.peer).await {
                            break RelayEnd::Failed(e);
                        }
                        counters.add_bytes_out(n as u64);
                    }
                    // ICMP unreachable from the target surfaces on the next recv
                    Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                        counters.record_error(format!("upstream for {}: {}", self.peer, e));
                    }
                    Err(e) => break RelayEnd::Failed(e),
                },
            }
        };
        self.closed.store(true, Ordering::Release);
        end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::stats::StatsCollector;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_refused_is_dial_error() {
        // Grab a free port, then close it so nothing is listening
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let err = dial_tcp(&format!("127.0.0.1:{port}"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "dial_error");
    }

    #[tokio::test]
    async fn test_relay_counts_both_directions() {
        let collector = StatsCollector::new();
        let counters = collector.register(1);

        // target: reply "pong" to "ping"
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = target.accept().await.unwrap();
            let mut buf = [0u8; 4];
            s.read_exact(&mut buf).await.unwrap();
            s.write_all(b"pong").await.unwrap();
        });

        // front: the socket pair the relay sits between
        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();
        let mut client = TcpStream::connect(front_addr).await.unwrap();
        let (inbound, _) = front.accept().await.unwrap();
        let outbound = dial_tcp(&target_addr.to_string(), Duration::from_secs(1))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let relay = {
            let counters = Arc::clone(&counters);
            let cancel = cancel.clone();
            tokio::spawn(async move { relay_tcp(inbound, outbound, &counters, &cancel, 1024).await })
        };

        client.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");

        // target hangs up after replying
        let end = relay.await.unwrap();
        assert!(matches!(end, RelayEnd::TargetClosed), "got {}", end.as_str());

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.total_bytes_in, 4);
        assert_eq!(snapshot.total_bytes_out, 4);
    }

    #[tokio::test]
    async fn test_relay_observes_cancellation() {
        let collector = StatsCollector::new();
        let counters = collector.register(1);

        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut client = TcpStream::connect(front.local_addr().unwrap()).await.unwrap();
        let (inbound, _) = front.accept().await.unwrap();
        let outbound = TcpStream::connect(target_addr).await.unwrap();
        let (mut upstream, _) = target.accept().await.unwrap();

        let cancel = CancellationToken::new();
        let relay = {
            let cancel = cancel.clone();
            tokio::spawn(async move { relay_tcp(inbound, outbound, &counters, &cancel, 1024).await })
        };

        cancel.cancel();

        // target sees end-of-stream but may still answer
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(2), upstream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        upstream.write_all(b"late").await.unwrap();
        drop(upstream);

        let end = tokio::time::timeout(Duration::from_secs(2), relay)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(end, RelayEnd::Cancelled), "got {}", end.as_str());

        // the late reply reaches the client, then the connection closes
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"late");
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_draining_relay_waits_for_silent_target() {
        let collector = StatsCollector::new();
        let counters = collector.register(1);

        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let _client = TcpStream::connect(front.local_addr().unwrap()).await.unwrap();
        let (inbound, _) = front.accept().await.unwrap();
        let outbound = TcpStream::connect(target.local_addr().unwrap()).await.unwrap();
        let (_silent, _) = target.accept().await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let pending = tokio::time::timeout(
            Duration::from_millis(200),
            relay_tcp(inbound, outbound, &counters, &cancel, 1024),
        )
        .await;
        assert!(pending.is_err(), "relay must wait for the target to close");
    }

    #[tokio::test]
    async fn test_udp_session_goes_idle() {
        let collector = StatsCollector::new();
        let counters = collector.register(1);

        let target = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let downstream = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();

        let session = UdpSession::open(
            peer,
            &target.local_addr().unwrap().to_string(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        session.send_upstream(b"hello", &counters).await.unwrap();

        let guard = counters.connection_opened();
        let end = tokio::time::timeout(
            Duration::from_secs(2),
            Arc::clone(&session).run(
                downstream,
                Arc::clone(&counters),
                guard,
                CancellationToken::new(),
                Duration::from_millis(100),
            ),
        )
        .await
        .unwrap();

        assert!(matches!(end, RelayEnd::Idle));
        assert!(session.is_closed());
        let snapshot = counters.snapshot();
        assert_eq!(snapshot.active_connections, 0);
        assert_eq!(snapshot.total_bytes_in, 5);
    }
}
