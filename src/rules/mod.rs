//! Masquerade rules.
//!
//! The rule table answers lookups on the query path; the codec moves rules
//! to and from rule files.

pub mod codec;
mod table;

pub use codec::{Decoded, Diagnostic};
pub use table::{MasqHost, RuleSet, RuleTable, normalize_name};
