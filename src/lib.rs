//! Umleitung - a local DNS masquerading server.
//!
//! Answers queries for a configurable set of hostnames with operator-chosen
//! A/AAAA records and forwards everything else to upstream resolvers.
//! [`MasqServer`] is the entry point for front ends.

pub mod config;
pub mod dns;
pub mod error;
pub mod forwarder;
pub mod handler;
pub mod logging;
pub mod rules;
pub mod server;
pub mod stats;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::{ListenerConfig, ServerProperties};
pub use error::{ForwardError, RuleError, ServerError};
pub use rules::MasqHost;
pub use server::{LoadReport, MasqServer};
