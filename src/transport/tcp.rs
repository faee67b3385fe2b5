//! TCP transport for DNS queries.
//!
//! Each client connection is handled independently. TCP DNS messages are
//! prefixed with a 2-byte length; a client may send several queries on one
//! connection, which are answered in order until it closes or goes idle.

use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{Protocol, ServeContext};
use crate::handler::{PendingQuery, plausible_query};

/// TCP listener for the masquerading server.
///
/// Each connection is handled in a separate task.
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

    /// Start the accept loop; it exits and closes the listener when
    /// `shutdown` fires.
    pub fn start(self, ctx: ServeContext, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(run_accept_loop(self.listener, ctx, shutdown))
    }
}

/// Accept loop - spawns a handler task for each incoming connection.
async fn run_accept_loop(listener: TcpListener, ctx: ServeContext, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = listener.accept() => match result {
                Ok((client, peer)) => {
                    let conn_ctx = ctx.clone();
                    let conn_shutdown = shutdown.clone();
                    ctx.tracker.spawn(handle_connection(client, peer, conn_ctx, conn_shutdown));
                }
                Err(e) => warn!(error = %e, "TCP accept error"),
            },
        }
    }

    debug!("TCP accept loop stopped");
}

/// Serve queries on one connection until EOF, idle timeout or shutdown.
async fn handle_connection(
    mut client: TcpStream,
    peer: SocketAddr,
    ctx: ServeContext,
    shutdown: CancellationToken,
) {
    loop {
        let timeout = ctx.handler.properties().query_timeout;
        let read = tokio::select! {
            _ = shutdown.cancelled() => return,
            read = tokio::time::timeout(timeout, read_dns_message(&mut client)) => read,
        };
        let query = match read {
            Ok(Ok(Some(query))) => query,
            Ok(Ok(None)) => return,
            Ok(Err(e)) => {
                trace!(client = %peer, error = %e, "TCP read error");
                return;
            }
            Err(_) => {
                trace!(client = %peer, "TCP connection idle");
                return;
            }
        };

        if !plausible_query(&query) {
            return;
        }

        let pending = PendingQuery::new(peer, query, Protocol::Tcp, timeout);
        let Some(response) = ctx.resolve(&pending).await else {
            return;
        };

        if let Err(e) = write_dns_message(&mut client, &response).await {
            warn!(client = %peer, error = %e, "TCP response error");
            return;
        }
    }
}

/// Read one length-prefixed DNS message, without the prefix.
///
/// Returns `None` on a clean EOF between messages.
async fn read_dns_message(stream: &mut TcpStream) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 2];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let mut buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
    stream.read_exact(&mut buf).await?;

    Ok(Some(buf))
}

async fn write_dns_message(stream: &mut TcpStream, message: &[u8]) -> io::Result<()> {
    let len = u16::try_from(message.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "DNS message too large"))?;
    let mut framed = Vec::with_capacity(message.len() + 2);
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(message);

    stream.write_all(&framed).await
}
