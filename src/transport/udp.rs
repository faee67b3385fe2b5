//! UDP transport for DNS queries.
//!
//! Each datagram is an independent transaction: the receive loop copies it
//! out, spawns a task to resolve it, and goes straight back to receiving so
//! that a slow upstream never holds up other clients.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{MAX_DNS_PACKET_SIZE, Protocol, ServeContext};
use crate::handler::{PendingQuery, plausible_query};

/// UDP listener for the masquerading server.
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

    /// Start the receive loop; it exits when `shutdown` fires.
    ///
    /// The socket is closed once the loop and every query task spawned from
    /// it have finished.
    pub fn start(self, ctx: ServeContext, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(run(self.socket, ctx, shutdown))
    }
}

async fn run(socket: Arc<UdpSocket>, ctx: ServeContext, shutdown: CancellationToken) {
    let mut buf = [0u8; MAX_DNS_PACKET_SIZE];

    loop {
        let (len, src) = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "UDP recv error");
                    continue;
                }
            },
        };

        if !plausible_query(&buf[..len]) {
            continue;
        }

        let timeout = ctx.handler.properties().query_timeout;
        let pending = PendingQuery::new(src, buf[..len].to_vec(), Protocol::Udp, timeout);
        let socket = socket.clone();
        let task_ctx = ctx.clone();

        ctx.tracker.spawn(async move {
            let Some(response) = task_ctx.resolve(&pending).await else {
                return;
            };
            if let Err(e) = socket.send_to(&response, pending.client).await {
                warn!(client = %pending.client, error = %e, "UDP response error");
            }
        });
    }

    debug!("UDP receive loop stopped");
}
