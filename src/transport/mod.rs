//! Transport layer for the masquerading server.
//!
//! Provides UDP and TCP listeners that receive DNS queries from clients,
//! hand each one to the [`QueryHandler`] on its own task, and write the
//! answer back.

pub mod tcp;
pub mod udp;

/// Maximum size of a DNS packet (with some headroom).
pub const MAX_DNS_PACKET_SIZE: usize = 4096;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::handler::{Handled, Outcome, PendingQuery, QueryHandler};
use crate::stats::Stats;

/// Transport protocol a query arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

/// State shared by the listeners and their per-query tasks.
#[derive(Clone)]
pub struct ServeContext {
    pub handler: Arc<QueryHandler>,
    pub stats: Arc<Stats>,
    /// Tracks every per-query and per-connection task.
    pub tracker: TaskTracker,
    /// Fired when in-flight queries must give up without replying.
    pub abort: CancellationToken,
}

impl ServeContext {
    /// Resolve one query, or `None` if there is nothing to send.
    ///
    /// Returns `None` as well when the server aborts in-flight work, so a
    /// cancelled query never reaches the client.
    pub async fn resolve(&self, pending: &PendingQuery) -> Option<Vec<u8>> {
        let handled = tokio::select! {
            biased;
            _ = self.abort.cancelled() => {
                debug!(client = %pending.client, "query abandoned on shutdown");
                return None;
            }
            handled = self.handler.handle(pending) => handled,
        };

        let elapsed = pending.received.elapsed();
        self.stats.record(&handled.outcome, elapsed);
        log_query(
            pending.protocol,
            pending.client,
            &handled,
            elapsed,
            self.handler.properties().verbose(),
        );

        if self.abort.is_cancelled() {
            return None;
        }
        handled.response
    }
}

/// Log a finished query; `verbose` promotes the event to info level.
fn log_query(
    protocol: Protocol,
    client: SocketAddr,
    handled: &Handled,
    elapsed: Duration,
    verbose: bool,
) {
    let (domain, qtype) = match &handled.question {
        Some((domain, qtype)) => (domain.as_str(), *qtype),
        None => ("<unknown>", 0),
    };
    let total_ms = elapsed.as_secs_f64() * 1000.0;
    let proto = protocol.as_str();

    macro_rules! emit {
        ($($field:tt)*) => {
            if verbose {
                info!(proto, %client, domain, qtype, total_ms, $($field)*);
            } else {
                debug!(proto, %client, domain, qtype, total_ms, $($field)*);
            }
        };
    }

    match &handled.outcome {
        Outcome::Masqueraded { addr } => emit!(%addr, "MASQUERADED"),
        Outcome::Forwarded { upstream } => emit!(%upstream, "FORWARDED"),
        Outcome::ServerFailure { error } => emit!(%error, "SERVFAIL"),
        Outcome::FormatError => emit!("FORMERR"),
        Outcome::NotImplemented { opcode } => emit!(opcode, "NOTIMP"),
        Outcome::Dropped => debug!(proto, %client, "dropped non-query datagram"),
    }
}
