//! In-process fake upstream resolvers for tests.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;

use crate::dns::{DnsQuery, DnsResponse};
use crate::transport::MAX_DNS_PACKET_SIZE;

/// How a fake upstream treats incoming queries.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Reply {
    Answer(IpAddr),
    /// Answer after a delay.
    Delayed(Duration, IpAddr),
    Silent,
    /// Answer with a transaction ID that does not match the query.
    WrongId,
    /// Empty truncated reply over UDP, full answer over TCP.
    Truncated(IpAddr),
}

pub(crate) struct FakeUpstream {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    tasks: Vec<JoinHandle<()>>,
}

impl FakeUpstream {
    pub async fn spawn(reply: Reply) -> Self {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();

        if let Reply::Truncated(ip) = reply {
            let listener = TcpListener::bind(addr).await.unwrap();
            tasks.push(tokio::spawn(async move {
                while let Ok((mut stream, _)) = listener.accept().await {
                    let mut len_buf = [0u8; 2];
                    if stream.read_exact(&mut len_buf).await.is_err() {
                        continue;
                    }
                    let mut query = vec![0u8; u16::from_be_bytes(len_buf) as usize];
                    if stream.read_exact(&mut query).await.is_err() {
                        continue;
                    }
                    let Some(response) = answer(&query, ip) else {
                        continue;
                    };
                    let mut framed = (response.len() as u16).to_be_bytes().to_vec();
                    framed.extend_from_slice(&response);
                    let _ = stream.write_all(&framed).await;
                }
            }));
        }

        let counter = hits.clone();
        tasks.push(tokio::spawn(async move {
            let mut buf = [0u8; MAX_DNS_PACKET_SIZE];
            loop {
                let Ok((len, src)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let query = buf[..len].to_vec();

                let response = match reply {
                    Reply::Answer(ip) => answer(&query, ip),
                    Reply::Delayed(delay, ip) => {
                        let socket = socket.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            if let Some(response) = answer(&query, ip) {
                                let _ = socket.send_to(&response, src).await;
                            }
                        });
                        None
                    }
                    Reply::Silent => None,
                    Reply::WrongId => answer(&query, IpAddr::from([6, 6, 6, 6])).map(|mut r| {
                        r[1] = r[1].wrapping_add(1);
                        r
                    }),
                    Reply::Truncated(ip) => DnsQuery::parse(&query).map(|q| {
                        let mut response = DnsResponse::masqueraded(&q, &query, ip);
                        response.answers.clear();
                        response.flags |= 0x0200;
                        response.to_bytes()
                    }),
                };

                if let Some(response) = response {
                    let _ = socket.send_to(&response, src).await;
                }
            }
        }));

        Self { addr, hits, tasks }
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for FakeUpstream {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn answer(query: &[u8], ip: IpAddr) -> Option<Vec<u8>> {
    let parsed = DnsQuery::parse(query)?;
    Some(DnsResponse::masqueraded(&parsed, query, ip).to_bytes())
}
