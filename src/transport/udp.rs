//! UDP transport for DNS queries.
//!
//! A single listener task reads datagrams and runs each through the gates.
//! Admitted queries are handed to the shard picked by the client's address;
//! the shard workers write the answers back through the same socket.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::MAX_DNS_PACKET_SIZE;
use crate::dispatch::{Shards, UdpQuery};
use crate::resolver::{QueryAction, Resolver, client_key};

/// UDP transport for the DNS daemon.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind the listening socket.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);

        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Handle to the listening socket, used by workers to answer clients.
    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    /// Read and dispatch queries until `shutdown` fires.
    ///
    /// The shards are dropped on return, which lets their workers finish the
    /// queries already queued and exit.
    pub async fn run(
        self,
        resolver: Arc<Resolver>,
        shards: Shards,
        mut shutdown: broadcast::Receiver<()>,
    ) -> io::Result<()> {
        let mut buf = vec![0u8; MAX_DNS_PACKET_SIZE];

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("UDP listener stopped");
                    return Ok(());
                }
                result = self.socket.recv_from(&mut buf) => {
                    let (len, src) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            warn!(error = %e, "UDP recv error");
                            continue;
                        }
                    };

                    let received = Instant::now();
                    let packet = &buf[..len];
                    let key = client_key(src.ip());

                    match resolver.process_query(src.ip(), packet).await {
                        QueryAction::Drop(reason) => {
                            debug!(client = %src, ?reason, "dropping UDP query");
                        }
                        QueryAction::Blackhole { domain } => {
                            shards.blackhole(&key, UdpQuery {
                                client: src,
                                packet: packet.to_vec(),
                                domain,
                                received,
                            });
                        }
                        QueryAction::Forward { domain } => {
                            shards.forward(&key, UdpQuery {
                                client: src,
                                packet: packet.to_vec(),
                                domain,
                                received,
                            });
                        }
                    }
                }
            }
        }
    }
}
