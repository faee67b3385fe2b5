use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info};

use umleitung::config::{self, DEFAULT_GRACE_PERIOD};
use umleitung::rules::{MasqHost, codec};
use umleitung::{ListenerConfig, MasqServer, ServerError, ServerProperties, logging};

/// Rule file loaded when `--rules` is not given, if it exists.
const DEFAULT_RULES_FILE: &str = "umleitung.conf";

#[derive(Parser)]
#[command(name = "umleitung")]
#[command(about = "Local DNS masquerading server", long_about = None)]
struct Args {
    /// Local port to listen on
    #[arg(short, long, default_value = "53")]
    port: u16,

    /// Bind address
    #[arg(short, long, default_value = "127.0.0.1")]
    bind: IpAddr,

    /// Rule file to load at startup
    #[arg(short, long)]
    rules: Option<PathBuf>,

    /// Extra rule in rule-file syntax, e.g. "evil.example.com 127.0.0.1" (repeatable)
    #[arg(short, long = "masq", value_parser = codec::parse_rule)]
    masq: Vec<MasqHost>,

    /// Custom upstream resolver, IP or IP:port (repeatable)
    #[arg(short, long = "upstream", value_parser = config::parse_upstream)]
    upstreams: Vec<SocketAddr>,

    /// Timeout for a single upstream attempt, in milliseconds
    #[arg(long, default_value = "2000")]
    timeout_ms: u64,

    /// Overall deadline for a forwarded query, in milliseconds
    #[arg(long, default_value = "5000")]
    deadline_ms: u64,

    /// Do not listen on TCP
    #[arg(long)]
    no_tcp: bool,

    /// Increase verbosity (-d logs every query, -dd traces)
    #[arg(short, long, action = clap::ArgAction::Count)]
    debug: u8,
}

impl Args {
    fn listener(&self) -> ListenerConfig {
        ListenerConfig {
            bind_addr: SocketAddr::new(self.bind, self.port),
            tcp: !self.no_tcp,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    fn properties(&self) -> ServerProperties {
        ServerProperties {
            debug_level: self.debug,
            use_custom_dns: !self.upstreams.is_empty(),
            custom_dns_servers: self.upstreams.clone(),
            upstream_timeout: Duration::from_millis(self.timeout_ms),
            query_timeout: Duration::from_millis(self.deadline_ms),
        }
    }
}

fn load_rules(server: &MasqServer, path: Option<&Path>) -> anyhow::Result<()> {
    let (path, explicit) = match path {
        Some(p) => (p, true),
        None => (Path::new(DEFAULT_RULES_FILE), false),
    };

    match server.load_config(path) {
        Ok(report) => {
            for diag in &report.diagnostics {
                info!(line = diag.line, error = %diag.error, "rule file line ignored");
            }
            Ok(())
        }
        Err(ServerError::ConfigIo { source, .. })
            if !explicit && source.kind() == io::ErrorKind::NotFound =>
        {
            debug!(path = %path.display(), "no default rule file");
            Ok(())
        }
        Err(e) => Err(e).context("loading rule file"),
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let server = MasqServer::new(args.listener(), args.properties());

    load_rules(&server, args.rules.as_deref())?;
    for host in args.masq {
        server.add_rule(host);
    }

    server.start().await.context("starting DNS listener")?;
    server.dump_running_config();

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    info!("shutting down");
    server.stop().await;

    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(args.debug);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(run(args))
}
