//! Error types for the masquerading engine.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while building or parsing a masquerade rule.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuleError {
    #[error("hostname is empty")]
    EmptyName,

    #[error("invalid hostname: {0}")]
    InvalidName(String),

    #[error("rule for {0} has neither an A nor an AAAA address")]
    NoAddress(String),

    #[error("malformed rule line: {0}")]
    MalformedLine(String),

    #[error("invalid address literal: {0}")]
    InvalidAddress(String),
}

/// Errors from a single upstream forward.
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("upstream {0} timed out")]
    Timeout(SocketAddr),

    #[error("upstream {addr} I/O error: {source}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("transaction ID mismatch from {addr}: sent {sent:#06x}, got {received:#06x}")]
    TransactionMismatch {
        addr: SocketAddr,
        sent: u16,
        received: u16,
    },

    #[error("malformed response from {0}")]
    Malformed(SocketAddr),

    #[error("no upstream resolver reachable ({attempts} attempts)")]
    NoUpstreamReachable { attempts: usize },
}

/// Errors surfaced by the listener service API.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("rule file {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
