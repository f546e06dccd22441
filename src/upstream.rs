//! Connections to the upstream forwarder.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::broadcast;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use crate::dns::transaction_id;
use crate::transport::MAX_DNS_PACKET_SIZE;
use crate::transport::tcp::{read_dns_message, write_dns_message};

/// First delay before redialing a broken forwarder socket.
const RECONNECT_BACKOFF_MIN: Duration = Duration::from_millis(250);

/// Longest delay between redial attempts.
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// A connected UDP socket owned by one forward shard.
pub struct UdpForwarder {
    addr: SocketAddr,
    socket: UdpSocket,
    io_timeout: Duration,
}

impl UdpForwarder {
    /// Bind an ephemeral socket and connect it to `addr`.
    pub async fn dial(addr: SocketAddr, io_timeout: Duration) -> io::Result<Self> {
        let local: SocketAddr = if addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        timeout_at(Instant::now() + io_timeout, socket.connect(addr)).await??;

        Ok(Self {
            addr,
            socket,
            io_timeout,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Send `query` and wait for the reply carrying the same transaction ID.
    ///
    /// Replies to earlier queries that timed out are discarded. The whole
    /// exchange shares one deadline; exceeding it yields `TimedOut`.
    pub async fn exchange(&self, query: &[u8]) -> io::Result<Vec<u8>> {
        let deadline = Instant::now() + self.io_timeout;
        let id = transaction_id(query);

        timeout_at(deadline, self.socket.send(query)).await??;

        let mut buf = vec![0u8; MAX_DNS_PACKET_SIZE];
        loop {
            let len = timeout_at(deadline, self.socket.recv(&mut buf)).await??;
            let reply = &buf[..len];
            if id.is_some() && transaction_id(reply) == id {
                buf.truncate(len);
                return Ok(buf);
            }
            debug!(forwarder = %self.addr, "discarding stale reply");
        }
    }

    /// Replace the socket with a freshly dialed one, retrying with
    /// exponential backoff until it succeeds.
    ///
    /// Returns false, leaving the broken socket in place, if `shutdown` fires
    /// first.
    pub async fn reconnect(&mut self, shutdown: &mut broadcast::Receiver<()>) -> bool {
        let (addr, io_timeout) = (self.addr, self.io_timeout);
        let mut backoff = RECONNECT_BACKOFF_MIN;
        loop {
            let attempt = async move {
                let result = Self::dial(addr, io_timeout).await;
                if result.is_err() {
                    tokio::time::sleep(backoff).await;
                }
                result
            };
            let result = tokio::select! {
                _ = shutdown.recv() => return false,
                result = attempt => result,
            };

            match result {
                Ok(fresh) => {
                    *self = fresh;
                    info!(forwarder = %self.addr, "reconnected to forwarder");
                    return true;
                }
                Err(e) => {
                    warn!(
                        forwarder = %self.addr,
                        error = %e,
                        retried_after = ?backoff,
                        "failed to reconnect to forwarder"
                    );
                    backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
                }
            }
        }
    }
}

/// Relay one query over a fresh TCP connection to `addr`.
///
/// `query` excludes the length prefix, and so does the returned reply.
pub async fn tcp_exchange(addr: SocketAddr, query: &[u8], io_timeout: Duration) -> io::Result<Vec<u8>> {
    let deadline = Instant::now() + io_timeout;

    let mut upstream = timeout_at(deadline, TcpStream::connect(addr)).await??;
    timeout_at(deadline, write_dns_message(&mut upstream, query)).await??;

    timeout_at(deadline, read_dns_message(&mut upstream))
        .await??
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "forwarder closed connection"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::tests::build_query;
    use tokio::net::TcpListener;

    async fn echo_upstream(stale_first: bool) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                let Ok((len, src)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                if stale_first {
                    let mut stale = buf[..len].to_vec();
                    stale[0] ^= 0xFF;
                    let _ = socket.send_to(&stale, src).await;
                }
                let mut reply = buf[..len].to_vec();
                reply[2] |= 0x80;
                let _ = socket.send_to(&reply, src).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn udp_exchange_returns_matching_reply() {
        let addr = echo_upstream(true).await;
        let forwarder = UdpForwarder::dial(addr, Duration::from_secs(5)).await.unwrap();
        let query = build_query(0x4242, "github.com", 1);

        let reply = forwarder.exchange(&query).await.unwrap();

        assert_eq!(transaction_id(&reply), Some(0x4242));
        assert_eq!(reply[2] & 0x80, 0x80);
        assert_eq!(forwarder.addr(), addr);
    }

    #[tokio::test]
    async fn udp_exchange_times_out_on_silent_upstream() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let forwarder = UdpForwarder::dial(silent.local_addr().unwrap(), Duration::from_millis(100))
            .await
            .unwrap();

        let err = forwarder
            .exchange(&build_query(1, "github.com", 1))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn reconnect_replaces_socket() {
        let addr = echo_upstream(false).await;
        let mut forwarder = UdpForwarder::dial(addr, Duration::from_secs(5)).await.unwrap();
        let before = forwarder.socket.local_addr().unwrap();
        let (_shutdown, mut stopped) = broadcast::channel(1);

        assert!(forwarder.reconnect(&mut stopped).await);

        assert_ne!(forwarder.socket.local_addr().unwrap(), before);
        assert!(forwarder.exchange(&build_query(9, "github.com", 1)).await.is_ok());
    }

    #[tokio::test]
    async fn reconnect_gives_up_on_shutdown() {
        let addr = echo_upstream(false).await;
        let mut forwarder = UdpForwarder::dial(addr, Duration::from_secs(1)).await.unwrap();
        // Connecting a UDP socket to the broadcast address without
        // SO_BROADCAST is refused, so every redial fails.
        forwarder.addr = "255.255.255.255:53".parse().unwrap();
        let (shutdown, mut stopped) = broadcast::channel(1);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(600)).await;
            let _ = shutdown.send(());
        });

        let reconnected =
            tokio::time::timeout(Duration::from_secs(5), forwarder.reconnect(&mut stopped))
                .await
                .expect("reconnect should observe shutdown");

        assert!(!reconnected);
    }

    #[tokio::test]
    async fn tcp_exchange_relays_framed_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let query = read_dns_message(&mut stream).await.unwrap().unwrap();
            let mut reply = query.clone();
            reply[2] |= 0x80;
            write_dns_message(&mut stream, &reply).await.unwrap();
        });
        let query = build_query(0x0102, "example.org", 1);

        let reply = tcp_exchange(addr, &query, Duration::from_secs(5)).await.unwrap();

        assert_eq!(reply.len(), query.len());
        assert_eq!(&reply[..2], &query[..2]);
        assert_eq!(reply[2] & 0x80, 0x80);
    }
}
