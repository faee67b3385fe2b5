//! End-to-end behaviour of the masquerading server over real sockets.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use umleitung::dns::{self, DnsQuery, DnsResponse, Header, RCODE_SERVFAIL, TYPE_A, TYPE_AAAA};
use umleitung::forwarder::UpstreamForwarder;
use umleitung::{ListenerConfig, MasqHost, MasqServer, RuleError, ServerProperties};

/// Upstream that answers every query with `answer`, or stays silent.
struct Upstream {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl Upstream {
    async fn spawn(answer: Option<IpAddr>) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        let task = tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            while let Ok((len, src)) = socket.recv_from(&mut buf).await {
                counter.fetch_add(1, Ordering::SeqCst);
                let Some(ip) = answer else {
                    continue;
                };
                let query = &buf[..len];
                if let Some(parsed) = DnsQuery::parse(query) {
                    let response = DnsResponse::masqueraded(&parsed, query, ip).to_bytes();
                    let _ = socket.send_to(&response, src).await;
                }
            }
        });

        Self { addr, hits, task }
    }
}

impl Drop for Upstream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn server(upstreams: Vec<SocketAddr>) -> MasqServer {
    let listener = ListenerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        tcp: false,
        grace_period: Duration::from_millis(200),
    };
    let props = ServerProperties {
        use_custom_dns: true,
        custom_dns_servers: upstreams,
        upstream_timeout: Duration::from_millis(400),
        query_timeout: Duration::from_secs(2),
        ..Default::default()
    };
    MasqServer::with_forwarder(listener, props, UpstreamForwarder::new(Vec::new()))
}

async fn ask(server: &MasqServer, id: u16, name: &str, qtype: u16) -> Vec<u8> {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let query = dns::encode_query(id, name, qtype);
    socket
        .send_to(&query, server.local_addr().unwrap())
        .await
        .unwrap();
    let mut buf = [0u8; 4096];
    let (len, _) = tokio::time::timeout(Duration::from_secs(3), socket.recv_from(&mut buf))
        .await
        .expect("no response from server")
        .unwrap();
    buf[..len].to_vec()
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

#[tokio::test]
async fn masqueraded_a_is_local_and_missing_aaaa_goes_upstream() {
    let upstream = Upstream::spawn(Some(ip("2606:2800:220:1::1"))).await;
    let server = server(vec![upstream.addr]);
    server.add_rule(
        MasqHost::new("evil.example.com", Some("127.0.0.1".parse().unwrap()), None).unwrap(),
    );
    server.start().await.unwrap();

    let a = ask(&server, 0x0001, "evil.example.com", TYPE_A).await;
    assert_eq!(dns::answer_addresses(&a), vec![ip("127.0.0.1")]);
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 0);

    let aaaa = ask(&server, 0x0002, "evil.example.com", TYPE_AAAA).await;
    assert_eq!(dns::answer_addresses(&aaaa), vec![ip("2606:2800:220:1::1")]);
    assert_eq!(dns::transaction_id(&aaaa), Some(0x0002));
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 1);

    server.stop().await;
}

#[tokio::test]
async fn slow_first_resolver_does_not_block_the_answer() {
    let timing_out = Upstream::spawn(None).await;
    let answering = Upstream::spawn(Some(ip("93.184.216.34"))).await;
    let server = server(vec![timing_out.addr, answering.addr]);
    server.start().await.unwrap();

    let started = Instant::now();
    let response = ask(&server, 0x0B0B, "example.com", TYPE_A).await;

    assert_eq!(dns::answer_addresses(&response), vec![ip("93.184.216.34")]);
    assert!(started.elapsed() < Duration::from_secs(2));
    server.stop().await;
}

#[tokio::test]
async fn all_resolvers_timing_out_yields_servfail() {
    let first = Upstream::spawn(None).await;
    let second = Upstream::spawn(None).await;
    let server = server(vec![first.addr, second.addr]);
    server.start().await.unwrap();

    let response = ask(&server, 0x0C0C, "unreachable.example.org", TYPE_A).await;
    let header = Header::parse(&response).unwrap();

    assert_eq!(header.id, 0x0C0C);
    assert!(header.is_response());
    assert_eq!(header.rcode(), RCODE_SERVFAIL);
    server.stop().await;
}

#[test]
fn one_malformed_line_among_valid_rules_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rules.conf");
    std::fs::write(
        &path,
        "# test rules\n\
         a.test 10.0.0.1\n\
         b.test 10.0.0.2 ::2\n\
         c.test 10.0.0.3 extra fields here\n\
         d.test - ::4\n\
         e.test fe80::5\n",
    )
    .unwrap();
    let server = server(Vec::new());

    let report = server.load_config(&path).unwrap();

    assert_eq!(report.rules, 4);
    assert_eq!(server.list_rules().len(), 4);
    assert_eq!(report.diagnostics.len(), 1);
    assert_eq!(report.diagnostics[0].line, 4);
    assert!(matches!(report.diagnostics[0].error, RuleError::MalformedLine(_)));
}

#[test]
fn save_and_reload_is_order_independent() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source.conf");
    let saved = dir.path().join("saved.conf");
    std::fs::write(
        &source,
        "zeta.test 10.0.0.26\nALPHA.test. - ::1\nmid.test 10.0.0.13 fe80::d\nzeta.test 10.0.0.99\n",
    )
    .unwrap();
    let server = server(Vec::new());

    server.load_config(&source).unwrap();
    let loaded = server.list_rules();
    server.save_config(&saved).unwrap();
    server.load_config(&saved).unwrap();

    assert_eq!(server.list_rules(), loaded);
    assert_eq!(loaded.len(), 3);
    assert_eq!(loaded[0].a(), Some("10.0.0.99".parse().unwrap()));
    assert_eq!(loaded[1].name(), "alpha.test");
}

#[test]
fn concurrent_readers_see_whole_rule_sets_during_reload() {
    let dir = tempfile::tempdir().unwrap();
    let old = dir.path().join("old.conf");
    let new = dir.path().join("new.conf");
    let lines = |prefix: &str| {
        (0..50)
            .map(|i| format!("{}{}.test 10.0.{}.1\n", prefix, i, i))
            .collect::<String>()
    };
    std::fs::write(&old, lines("old")).unwrap();
    std::fs::write(&new, lines("new")).unwrap();

    let server = Arc::new(server(Vec::new()));
    server.load_config(&old).unwrap();
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let server = server.clone();
            let done = done.clone();
            thread::spawn(move || {
                while !done.load(Ordering::Relaxed) {
                    let rules = server.list_rules();
                    let olds = rules.iter().filter(|h| h.name().starts_with("old")).count();
                    assert_eq!(rules.len(), 50);
                    assert!(olds == 0 || olds == 50, "torn rule set: {} old rules", olds);
                }
            })
        })
        .collect();

    for round in 0..100 {
        let path = if round % 2 == 0 { &new } else { &old };
        server.load_config(path).unwrap();
    }
    done.store(true, Ordering::Relaxed);

    for reader in readers {
        reader.join().unwrap();
    }
}
