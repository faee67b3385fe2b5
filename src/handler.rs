//! Per-query resolution logic.
//!
//! Decides for each query whether to answer from the rule table, relay it
//! upstream, or reject it:
//! 1. Decode header and question (reject what cannot be served)
//! 2. Look up an override for the name and type
//! 3. Otherwise forward verbatim and relay the upstream reply
//!
//! Transports handle the actual I/O, the handler handles decisions.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::time::Instant;

use crate::config::ServerProperties;
use crate::dns::{
    CLASS_IN, DnsQuery, DnsResponse, HEADER_LEN, Header, OPCODE_QUERY, RCODE_FORMERR,
    RCODE_NOTIMP,
};
use crate::error::ForwardError;
use crate::forwarder::UpstreamForwarder;
use crate::rules::RuleTable;
use crate::transport::Protocol;

/// One in-flight request.
#[derive(Debug, Clone)]
pub struct PendingQuery {
    pub client: SocketAddr,
    pub query: Vec<u8>,
    pub protocol: Protocol,
    pub received: Instant,
    pub deadline: Instant,
}

impl PendingQuery {
    pub fn new(client: SocketAddr, query: Vec<u8>, protocol: Protocol, timeout: Duration) -> Self {
        let received = Instant::now();
        Self {
            client,
            query,
            protocol,
            received,
            deadline: received + timeout,
        }
    }
}

/// How a query was answered.
#[derive(Debug)]
pub enum Outcome {
    /// Answered from the rule table.
    Masqueraded { addr: IpAddr },
    /// Relayed from an upstream resolver.
    Forwarded { upstream: SocketAddr },
    /// No upstream answered; SERVFAIL sent.
    ServerFailure { error: ForwardError },
    /// Undecodable or multi-question query; FORMERR sent.
    FormatError,
    /// Unsupported opcode; NOTIMP sent.
    NotImplemented { opcode: u8 },
    /// Nothing sensible to reply to.
    Dropped,
}

/// Result of handling one query.
#[derive(Debug)]
pub struct Handled {
    pub response: Option<Vec<u8>>,
    pub outcome: Outcome,
    /// Queried name and type, when the question could be decoded.
    pub question: Option<(String, u16)>,
}

impl Handled {
    fn dropped() -> Self {
        Self {
            response: None,
            outcome: Outcome::Dropped,
            question: None,
        }
    }

    fn rejected(header: &Header, rcode: u8, outcome: Outcome) -> Self {
        Self {
            response: Some(DnsResponse::error(header, &[], rcode).to_bytes()),
            outcome,
            question: None,
        }
    }
}

/// Resolves queries against the rule table and the upstream resolvers.
///
/// Shared by all transports; every call reads the current rules and
/// preferences once, at the start.
pub struct QueryHandler {
    rules: Arc<RuleTable>,
    props: Arc<ArcSwap<ServerProperties>>,
    forwarder: Arc<UpstreamForwarder>,
}

impl QueryHandler {
    pub fn new(
        rules: Arc<RuleTable>,
        props: Arc<ArcSwap<ServerProperties>>,
        forwarder: Arc<UpstreamForwarder>,
    ) -> Self {
        Self {
            rules,
            props,
            forwarder,
        }
    }

    pub fn properties(&self) -> Arc<ServerProperties> {
        self.props.load_full()
    }

    /// Handle one query and produce the bytes to send back, if any.
    pub async fn handle(&self, pending: &PendingQuery) -> Handled {
        let raw = pending.query.as_slice();

        let Some(header) = Header::parse(raw) else {
            return Handled::dropped();
        };
        if header.is_response() {
            return Handled::dropped();
        }
        if header.opcode() != OPCODE_QUERY {
            let opcode = header.opcode();
            return Handled::rejected(&header, RCODE_NOTIMP, Outcome::NotImplemented { opcode });
        }
        let Some(query) = DnsQuery::parse(raw) else {
            return Handled::rejected(&header, RCODE_FORMERR, Outcome::FormatError);
        };
        let question = Some((query.domain.clone(), query.qtype));

        if query.qclass == CLASS_IN {
            if let Some(addr) = self.rules.lookup(&query.domain, query.qtype) {
                return Handled {
                    response: Some(DnsResponse::masqueraded(&query, raw, addr).to_bytes()),
                    outcome: Outcome::Masqueraded { addr },
                    question,
                };
            }
        }

        let props = self.props.load_full();
        match self
            .forwarder
            .forward(raw, &props, pending.deadline, pending.protocol)
            .await
        {
            Ok(forwarded) => Handled {
                response: Some(forwarded.response),
                outcome: Outcome::Forwarded {
                    upstream: forwarded.upstream,
                },
                question,
            },
            Err(error) => Handled {
                response: Some(DnsResponse::server_failure(&query, raw).to_bytes()),
                outcome: Outcome::ServerFailure { error },
                question,
            },
        }
    }
}

/// Quick sanity check used by transports before spawning a task.
pub fn plausible_query(data: &[u8]) -> bool {
    data.len() >= HEADER_LEN
}
