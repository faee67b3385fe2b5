//! Masquerade rules and the table that serves them.

use std::borrow::Cow;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;

use crate::dns::{TYPE_A, TYPE_AAAA};
use crate::error::RuleError;

const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 253;

/// One override rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasqHost {
    name: String,
    a: Option<Ipv4Addr>,
    aaaa: Option<Ipv6Addr>,
}

impl MasqHost {
    /// Build a rule, normalizing the hostname.
    ///
    /// At least one address must be given.
    pub fn new(
        name: &str,
        a: Option<Ipv4Addr>,
        aaaa: Option<Ipv6Addr>,
    ) -> Result<Self, RuleError> {
        let name = normalize_name(name);
        validate_name(&name)?;
        if a.is_none() && aaaa.is_none() {
            return Err(RuleError::NoAddress(name.into_owned()));
        }

        Ok(Self {
            name: name.into_owned(),
            a,
            aaaa,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn a(&self) -> Option<Ipv4Addr> {
        self.a
    }

    pub fn aaaa(&self) -> Option<Ipv6Addr> {
        self.aaaa
    }

    /// Override address for a query type, if this rule has one.
    pub fn record(&self, qtype: u16) -> Option<IpAddr> {
        match qtype {
            TYPE_A => self.a.map(IpAddr::V4),
            TYPE_AAAA => self.aaaa.map(IpAddr::V6),
            _ => None,
        }
    }
}

impl fmt::Display for MasqHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        match self.a {
            Some(a) => write!(f, " a={}", a)?,
            None => write!(f, " a=-")?,
        }
        match self.aaaa {
            Some(aaaa) => write!(f, " aaaa={}", aaaa),
            None => write!(f, " aaaa=-"),
        }
    }
}

/// Lower-case a hostname and strip surrounding whitespace and the trailing dot.
///
/// Borrows when the name is already in canonical form, which is the common
/// case on the lookup path.
pub fn normalize_name(name: &str) -> Cow<'_, str> {
    let trimmed = name.trim().trim_end_matches('.');
    if trimmed.bytes().any(|b| b.is_ascii_uppercase()) {
        Cow::Owned(trimmed.to_ascii_lowercase())
    } else {
        Cow::Borrowed(trimmed)
    }
}

fn validate_name(name: &str) -> Result<(), RuleError> {
    if name.is_empty() {
        return Err(RuleError::EmptyName);
    }
    let invalid = name.len() > MAX_NAME_LEN
        || name
            .split('.')
            .any(|label| label.is_empty() || label.len() > MAX_LABEL_LEN)
        || name
            .chars()
            .any(|c| !c.is_ascii_graphic() || c == '#' || c == ';');
    if invalid {
        return Err(RuleError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// An immutable set of rules.
///
/// Readers hold one of these for the duration of a query; mutation always
/// produces a new set.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    hosts: Vec<MasqHost>,
    index: FxHashMap<String, usize>,
}

impl RuleSet {
    /// Build a set from rules in order; a later duplicate replaces the
    /// earlier one in place.
    pub fn from_hosts(hosts: impl IntoIterator<Item = MasqHost>) -> Self {
        let mut set = Self::default();
        for host in hosts {
            set.upsert(host);
        }
        set
    }

    pub fn lookup(&self, name: &str, qtype: u16) -> Option<IpAddr> {
        let name = normalize_name(name);
        let &slot = self.index.get(name.as_ref())?;
        self.hosts[slot].record(qtype)
    }

    pub fn get(&self, name: &str) -> Option<&MasqHost> {
        let name = normalize_name(name);
        self.index.get(name.as_ref()).map(|&slot| &self.hosts[slot])
    }

    pub fn hosts(&self) -> &[MasqHost] {
        &self.hosts
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    fn upsert(&mut self, host: MasqHost) {
        match self.index.get(host.name()) {
            Some(&slot) => self.hosts[slot] = host,
            None => {
                self.index.insert(host.name.clone(), self.hosts.len());
                self.hosts.push(host);
            }
        }
    }

    fn remove(&mut self, name: &str) -> bool {
        let Some(slot) = self.index.remove(name) else {
            return false;
        };
        self.hosts.remove(slot);
        for position in self.index.values_mut() {
            if *position > slot {
                *position -= 1;
            }
        }
        true
    }
}

/// Concurrent rule table.
///
/// Lookups load the current [`RuleSet`] without locking. Writers clone the
/// current set, edit the clone and publish it with a single pointer swap, so
/// a reader sees either the old or the new set and never a mix. Writers are
/// serialized among themselves so that no update is lost.
pub struct RuleTable {
    current: ArcSwap<RuleSet>,
    writer: Mutex<()>,
}

impl RuleTable {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(RuleSet::default()),
            writer: Mutex::new(()),
        }
    }

    pub fn lookup(&self, name: &str, qtype: u16) -> Option<IpAddr> {
        self.current.load().lookup(name, qtype)
    }

    /// Current rule set; stays valid and unchanged while held.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.current.load_full()
    }

    pub fn upsert(&self, host: MasqHost) {
        self.update(|set| set.upsert(host));
    }

    pub fn remove(&self, name: &str) -> bool {
        let name = normalize_name(name);
        let mut removed = false;
        self.update(|set| removed = set.remove(name.as_ref()));
        removed
    }

    /// Replace every rule at once.
    pub fn replace_all(&self, hosts: Vec<MasqHost>) {
        let set = RuleSet::from_hosts(hosts);
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        self.current.store(Arc::new(set));
    }

    pub fn list(&self) -> Vec<MasqHost> {
        self.current.load().hosts().to_vec()
    }

    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.load().is_empty()
    }

    fn update(&self, edit: impl FnOnce(&mut RuleSet)) {
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = RuleSet::clone(&self.current.load());
        edit(&mut next);
        self.current.store(Arc::new(next));
    }
}

impl Default for RuleTable {
    fn default() -> Self {
        Self::new()
    }
}
