//! TCP transport for DNS queries.
//!
//! Each client connection is served by its own task. DNS messages over TCP
//! are prefixed with a 2-byte big-endian length; a connection may carry any
//! number of queries. Queries run through the gates inline rather than
//! through the shard queues, since TCP traffic is light. A query that fails a
//! gate closes the connection without an answer.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{Protocol, QueryLogger, elapsed_ms};
use crate::dns::build_blackhole_answer;
use crate::resolver::{QueryAction, Resolver};
use crate::upstream::tcp_exchange;

/// TCP transport for the DNS daemon.
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    /// Bind a TCP listener for the transport.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;

        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` fires or accepting fails.
    ///
    /// An accept error is returned to the caller; the listener is closed when
    /// this returns.
    pub async fn run(
        self,
        resolver: Arc<Resolver>,
        forwarder: SocketAddr,
        io_timeout: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> io::Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("TCP listener stopped");
                    return Ok(());
                }
                result = self.listener.accept() => {
                    let (client, peer) = result?;
                    tokio::spawn(handle_connection(
                        client,
                        peer,
                        resolver.clone(),
                        forwarder,
                        io_timeout,
                    ));
                }
            }
        }
    }
}

/// Serve queries on one connection until the client is done or a gate fails.
async fn handle_connection(
    mut client: TcpStream,
    peer: SocketAddr,
    resolver: Arc<Resolver>,
    forwarder: SocketAddr,
    io_timeout: Duration,
) {
    let logger = QueryLogger::new(Protocol::Tcp);

    loop {
        let query = match timeout(io_timeout, read_dns_message(&mut client)).await {
            Ok(Ok(Some(query))) => query,
            Ok(Ok(None)) => return,
            Ok(Err(e)) => {
                debug!(client = %peer, error = %e, "TCP read error");
                return;
            }
            Err(_) => {
                debug!(client = %peer, "TCP client idle, closing");
                return;
            }
        };
        let start = Instant::now();

        let response = match resolver.process_query(peer.ip(), &query).await {
            QueryAction::Drop(reason) => {
                debug!(client = %peer, ?reason, "dropping TCP query");
                return;
            }
            QueryAction::Blackhole { domain } => {
                let answer = build_blackhole_answer(&query);
                if answer.is_empty() {
                    resolver.stats().record_dropped();
                    return;
                }
                let elapsed = elapsed_ms(start);
                resolver.stats().record_blackholed(elapsed);
                logger.blocked(&domain, peer, elapsed);
                answer
            }
            QueryAction::Forward { domain } => {
                let upstream_start = Instant::now();
                match tcp_exchange(forwarder, &query, io_timeout).await {
                    Ok(reply) => {
                        let elapsed = elapsed_ms(start);
                        resolver.stats().record_forwarded(elapsed);
                        logger.forwarded(&domain, peer, elapsed, elapsed_ms(upstream_start));
                        reply
                    }
                    Err(e) => {
                        warn!(forwarder = %forwarder, error = %e, "TCP forward failed");
                        resolver.stats().record_dropped();
                        return;
                    }
                }
            }
        };

        match timeout(io_timeout, write_dns_message(&mut client, &response)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(client = %peer, error = %e, "TCP write error");
                return;
            }
            Err(_) => return,
        }
    }
}

/// Read one length-prefixed DNS message, without its prefix.
///
/// Returns `None` if the peer closed the stream before a new message began.
pub async fn read_dns_message<R>(stream: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 2];
    match stream.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let msg_len = u16::from_be_bytes(prefix) as usize;
    let mut msg = vec![0u8; msg_len];
    stream.read_exact(&mut msg).await?;

    Ok(Some(msg))
}

/// Write `msg` with its 2-byte length prefix.
pub async fn write_dns_message<W>(stream: &mut W, msg: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let msg_len = u16::try_from(msg.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "DNS message too long"))?;

    let mut framed = Vec::with_capacity(2 + msg.len());
    framed.extend_from_slice(&msg_len.to_be_bytes());
    framed.extend_from_slice(msg);
    stream.write_all(&framed).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn framing_reads_back_what_was_written() {
        let (mut a, mut b) = tokio::io::duplex(64);

        write_dns_message(&mut a, b"\x12\x34hello").await.unwrap();
        write_dns_message(&mut a, b"").await.unwrap();
        drop(a);

        assert_eq!(
            read_dns_message(&mut b).await.unwrap(),
            Some(b"\x12\x34hello".to_vec())
        );
        assert_eq!(read_dns_message(&mut b).await.unwrap(), Some(Vec::new()));
        assert_eq!(read_dns_message(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn truncated_message_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(64);

        a.write_all(&[0x00, 0x10, 0x01, 0x02]).await.unwrap();
        drop(a);

        let err = read_dns_message(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
