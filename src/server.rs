//! Masquerading server orchestration.
//!
//! Owns the rule table, the preferences and the transports, and exposes the
//! operations a front end needs: start/stop, rule editing, rule files and
//! preferences.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::{ListenerConfig, ServerProperties};
use crate::error::ServerError;
use crate::forwarder::UpstreamForwarder;
use crate::handler::QueryHandler;
use crate::rules::{Diagnostic, MasqHost, RuleTable, codec};
use crate::stats::{Stats, StatsSnapshot};
use crate::transport::ServeContext;
use crate::transport::{tcp::TcpTransport, udp::UdpTransport};

/// Summary of a rule file load.
#[derive(Debug, Clone)]
pub struct LoadReport {
    /// Rules now active.
    pub rules: usize,
    /// Lines that were skipped.
    pub diagnostics: Vec<Diagnostic>,
}

struct Running {
    shutdown: CancellationToken,
    abort: CancellationToken,
    tracker: TaskTracker,
    loops: Vec<JoinHandle<()>>,
}

/// The DNS masquerading server.
pub struct MasqServer {
    listener: ListenerConfig,
    rules: Arc<RuleTable>,
    props: Arc<ArcSwap<ServerProperties>>,
    forwarder: Arc<UpstreamForwarder>,
    handler: Arc<QueryHandler>,
    stats: Arc<Stats>,
    lifecycle: Mutex<Option<Running>>,
    bound: ArcSwapOption<SocketAddr>,
}

impl MasqServer {
    /// Create a stopped server with an empty rule table that falls back to
    /// the host's resolvers.
    pub fn new(listener: ListenerConfig, props: ServerProperties) -> Self {
        let forwarder = UpstreamForwarder::from_system(listener.bind_addr);
        Self::with_forwarder(listener, props, forwarder)
    }

    /// Create a stopped server with an explicit forwarder.
    pub fn with_forwarder(
        listener: ListenerConfig,
        props: ServerProperties,
        forwarder: UpstreamForwarder,
    ) -> Self {
        let rules = Arc::new(RuleTable::new());
        let props = Arc::new(ArcSwap::from_pointee(props));
        let forwarder = Arc::new(forwarder);
        let handler = Arc::new(QueryHandler::new(
            rules.clone(),
            props.clone(),
            forwarder.clone(),
        ));

        Self {
            listener,
            rules,
            props,
            forwarder,
            handler,
            stats: Arc::new(Stats::new()),
            lifecycle: Mutex::new(None),
            bound: ArcSwapOption::empty(),
        }
    }

    /// Bind the listeners and start answering queries.
    ///
    /// Starting a running server does nothing and returns `Ok(true)`.
    pub async fn start(&self) -> Result<bool, ServerError> {
        let mut state = self.lifecycle.lock().await;
        if state.is_some() {
            debug!("server already running");
            return Ok(true);
        }

        let bind_addr = self.listener.bind_addr;
        let udp = UdpTransport::bind(bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: bind_addr,
                source,
            })?;
        let local_addr = udp.local_addr().map_err(|source| ServerError::Bind {
            addr: bind_addr,
            source,
        })?;
        let tcp = if self.listener.tcp {
            let tcp = TcpTransport::bind(local_addr)
                .await
                .map_err(|source| ServerError::Bind {
                    addr: local_addr,
                    source,
                })?;
            Some(tcp)
        } else {
            None
        };

        let mut running = Running {
            shutdown: CancellationToken::new(),
            abort: CancellationToken::new(),
            tracker: TaskTracker::new(),
            loops: Vec::with_capacity(2),
        };
        let ctx = ServeContext {
            handler: self.handler.clone(),
            stats: self.stats.clone(),
            tracker: running.tracker.clone(),
            abort: running.abort.clone(),
        };

        running
            .loops
            .push(udp.start(ctx.clone(), running.shutdown.clone()));
        if let Some(tcp) = tcp {
            running.loops.push(tcp.start(ctx, running.shutdown.clone()));
        }

        info!(
            addr = %local_addr,
            tcp = self.listener.tcp,
            rules = self.rules.len(),
            "DNS masquerading server listening"
        );

        *state = Some(running);
        self.bound.store(Some(Arc::new(local_addr)));

        Ok(true)
    }

    /// Stop listening and wind down in-flight queries.
    ///
    /// Queries still running after the grace period are cancelled and get no
    /// reply. Stopping a stopped server does nothing.
    pub async fn stop(&self) {
        let mut state = self.lifecycle.lock().await;
        let Some(running) = state.take() else {
            return;
        };

        running.shutdown.cancel();
        for handle in running.loops {
            report_loop_exit(handle.await);
        }

        running.tracker.close();
        let grace = self.listener.grace_period;
        if tokio::time::timeout(grace, running.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                pending = running.tracker.len(),
                grace_ms = grace.as_millis() as u64,
                "cancelling queries still in flight"
            );
            running.abort.cancel();
            running.tracker.wait().await;
        }

        self.bound.store(None);

        let stats = self.stats.snapshot();
        info!(
            requests = stats.requests,
            masqueraded = stats.masqueraded,
            forwarded = stats.forwarded,
            servfail = stats.server_failures,
            avg_response_ms = stats.avg_response_ms,
            "DNS masquerading server stopped"
        );
    }

    pub fn is_running(&self) -> bool {
        self.bound.load().is_some()
    }

    /// Address the UDP listener is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound.load().as_deref().copied()
    }

    /// Add or replace one rule; takes effect for the next query.
    pub fn add_rule(&self, host: MasqHost) {
        debug!(rule = %host, "adding rule");
        self.rules.upsert(host);
    }

    pub fn remove_rule(&self, name: &str) -> bool {
        self.rules.remove(name)
    }

    pub fn list_rules(&self) -> Vec<MasqHost> {
        self.rules.list()
    }

    /// Replace all rules with the contents of a rule file.
    ///
    /// The file is parsed completely before the new rules are published;
    /// if it cannot be read the current rules stay in place.
    pub fn load_config(&self, path: &Path) -> Result<LoadReport, ServerError> {
        let decoded = codec::read_file(path).map_err(|source| ServerError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;

        self.rules.replace_all(decoded.hosts);
        let rules = self.rules.len();

        info!(
            path = %path.display(),
            rules,
            skipped = decoded.diagnostics.len(),
            "loaded rule file"
        );

        Ok(LoadReport {
            rules,
            diagnostics: decoded.diagnostics,
        })
    }

    /// Write the current rules to a rule file.
    pub fn save_config(&self, path: &Path) -> Result<(), ServerError> {
        let hosts = self.rules.list();
        codec::write_file(path, &hosts).map_err(|source| ServerError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;

        info!(path = %path.display(), rules = hosts.len(), "saved rule file");
        Ok(())
    }

    /// Swap in new preferences; queries already running keep the old ones.
    pub fn set_preferences(&self, props: ServerProperties) {
        debug!(
            debug_level = props.debug_level,
            use_custom_dns = props.use_custom_dns,
            upstreams = ?props.custom_dns_servers,
            "updated preferences"
        );
        self.props.store(Arc::new(props));
    }

    pub fn preferences(&self) -> Arc<ServerProperties> {
        self.props.load_full()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Log the active rules and preferences.
    pub fn dump_running_config(&self) {
        let props = self.props.load();
        info!(
            running = self.is_running(),
            debug_level = props.debug_level,
            use_custom_dns = props.use_custom_dns,
            upstreams = ?props.upstreams(),
            system_resolvers = ?self.forwarder.system_resolvers(),
            "running config"
        );
        for host in self.rules.list() {
            info!(rule = %host, "masquerade rule");
        }
    }
}

/// Log a listener loop that ended abnormally; returns whether it panicked.
fn report_loop_exit(result: Result<(), JoinError>) -> bool {
    match result {
        Ok(()) => false,
        Err(e) if e.is_panic() => {
            warn!(error = %e, "listener loop panicked");
            true
        }
        Err(e) => {
            debug!(error = %e, "listener loop cancelled");
            false
        }
    }
}
