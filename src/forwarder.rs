//! Upstream forwarding.
//!
//! Queries without an override are relayed verbatim to the upstream
//! resolvers. All resolvers of a tier are asked at once and the first valid
//! reply wins; the remaining attempts are dropped, which closes their
//! sockets. Custom resolvers form the first tier, the host's own resolvers
//! the second.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, trace};

use crate::config::{self, ServerProperties};
use crate::dns::{self, Header};
use crate::error::ForwardError;
use crate::transport::Protocol;

/// Largest datagram an upstream can send; nothing is cut off on receive.
const MAX_UDP_RESPONSE_SIZE: usize = 65_535;

/// A relayed upstream answer.
#[derive(Debug, Clone)]
pub struct Forwarded {
    pub response: Vec<u8>,
    pub upstream: SocketAddr,
}

/// Relays queries to upstream resolvers.
pub struct UpstreamForwarder {
    system: Vec<SocketAddr>,
}

impl UpstreamForwarder {
    /// Forwarder with an explicit fallback resolver list.
    pub fn new(system: Vec<SocketAddr>) -> Self {
        Self { system }
    }

    /// Forwarder falling back to the host's resolvers.
    ///
    /// `listener` is left out of the list so the server never forwards to
    /// itself.
    pub fn from_system(listener: SocketAddr) -> Self {
        Self::new(without_listener(config::system_resolvers(), listener))
    }

    pub fn system_resolvers(&self) -> &[SocketAddr] {
        &self.system
    }

    /// Forward `query` and return the first valid response.
    ///
    /// Custom resolvers from `props` are tried first; if there are none, or
    /// all of them fail, the system resolvers are tried. Every attempt is
    /// bounded by `props.upstream_timeout` and by `deadline`.
    pub async fn forward(
        &self,
        query: &[u8],
        props: &ServerProperties,
        deadline: Instant,
        protocol: Protocol,
    ) -> Result<Forwarded, ForwardError> {
        let mut attempts = 0;

        for tier in [props.upstreams(), self.system.as_slice()] {
            if tier.is_empty() {
                continue;
            }
            attempts += tier.len();

            match race(tier, query, props.upstream_timeout, deadline, protocol).await {
                Ok(forwarded) => return Ok(forwarded),
                Err(e) => debug!(error = %e, upstreams = tier.len(), "upstream tier failed"),
            }

            if Instant::now() >= deadline {
                break;
            }
        }

        Err(ForwardError::NoUpstreamReachable { attempts })
    }
}

/// Drop resolvers that would route back to `listener`.
///
/// A wildcard listener also receives what is sent to loopback or to the
/// wildcard address on its port.
fn without_listener(resolvers: Vec<SocketAddr>, listener: SocketAddr) -> Vec<SocketAddr> {
    resolvers
        .into_iter()
        .filter(|addr| {
            let local = addr.ip().is_loopback() || addr.ip().is_unspecified();
            let loops_back = *addr == listener
                || (addr.port() == listener.port() && listener.ip().is_unspecified() && local);
            if loops_back {
                debug!(resolver = %addr, %listener, "skipping resolver that is this server");
            }
            !loops_back
        })
        .collect()
}

/// Ask every resolver in `upstreams` at once; first valid reply wins.
async fn race(
    upstreams: &[SocketAddr],
    query: &[u8],
    per_attempt: Duration,
    deadline: Instant,
    protocol: Protocol,
) -> Result<Forwarded, ForwardError> {
    let attempts: Vec<BoxFuture<'_, Result<Forwarded, ForwardError>>> = upstreams
        .iter()
        .map(|&addr| attempt(addr, query, per_attempt, deadline, protocol).boxed())
        .collect();

    // Losers are dropped here, cancelling their I/O.
    future::select_ok(attempts).await.map(|(winner, _rest)| winner)
}

async fn attempt(
    addr: SocketAddr,
    query: &[u8],
    per_attempt: Duration,
    deadline: Instant,
    protocol: Protocol,
) -> Result<Forwarded, ForwardError> {
    let sent = dns::transaction_id(query).ok_or(ForwardError::Malformed(addr))?;
    let attempt_deadline = deadline.min(Instant::now() + per_attempt);
    let started = Instant::now();

    let response = timeout_at(attempt_deadline, exchange_udp(addr, query, sent))
        .await
        .map_err(|_| ForwardError::Timeout(addr))??;

    let truncated = Header::parse(&response).is_some_and(|h| h.is_truncated());
    let response = if truncated && matches!(protocol, Protocol::Tcp) {
        trace!(upstream = %addr, "truncated reply, retrying over TCP");
        timeout_at(attempt_deadline, exchange_tcp(addr, query, sent))
            .await
            .map_err(|_| ForwardError::Timeout(addr))??
    } else {
        response
    };

    debug!(
        upstream = %addr,
        bytes = response.len(),
        elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
        "upstream answered"
    );

    Ok(Forwarded {
        response,
        upstream: addr,
    })
}

/// One UDP round trip on a fresh socket connected to `addr`.
async fn exchange_udp(addr: SocketAddr, query: &[u8], sent: u16) -> Result<Vec<u8>, ForwardError> {
    let io_err = |source| ForwardError::Io { addr, source };

    let bind_addr: SocketAddr = if addr.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind_addr).await.map_err(io_err)?;
    socket.connect(addr).await.map_err(io_err)?;
    socket.send(query).await.map_err(io_err)?;

    let mut buf = vec![0u8; MAX_UDP_RESPONSE_SIZE];
    let len = socket.recv(&mut buf).await.map_err(io_err)?;
    buf.truncate(len);

    validate_response(&buf, sent, addr)?;
    Ok(buf)
}

/// One TCP round trip with 2-byte length framing.
async fn exchange_tcp(addr: SocketAddr, query: &[u8], sent: u16) -> Result<Vec<u8>, ForwardError> {
    let io_err = |source| ForwardError::Io { addr, source };

    let mut stream = TcpStream::connect(addr).await.map_err(io_err)?;
    let mut framed = Vec::with_capacity(query.len() + 2);
    framed.extend_from_slice(&(query.len() as u16).to_be_bytes());
    framed.extend_from_slice(query);
    stream.write_all(&framed).await.map_err(io_err)?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await.map_err(io_err)?;
    let mut buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
    stream.read_exact(&mut buf).await.map_err(io_err)?;

    validate_response(&buf, sent, addr)?;
    Ok(buf)
}

/// Accept only well-formed responses echoing the transaction ID we sent.
fn validate_response(response: &[u8], sent: u16, addr: SocketAddr) -> Result<(), ForwardError> {
    let header = Header::parse(response).ok_or(ForwardError::Malformed(addr))?;
    if !header.is_response() {
        return Err(ForwardError::Malformed(addr));
    }
    if header.id != sent {
        trace!(upstream = %addr, sent, received = header.id, "discarding mismatched reply");
        return Err(ForwardError::TransactionMismatch {
            addr,
            sent,
            received: header.id,
        });
    }
    Ok(())
}
