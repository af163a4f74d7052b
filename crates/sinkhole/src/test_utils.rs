use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::task::{JoinHandle, JoinSet};

use crate::QueryLog;

/// Keeps every event so tests can assert on them.
#[derive(Default)]
pub(crate) struct RecordingQueryLog {
    infos: Mutex<Vec<String>>,
    errors: Mutex<Vec<String>>,
    queries: Mutex<Vec<(IpAddr, String)>>,
    blocked: Mutex<Vec<(IpAddr, String)>>,
    cache_hits: Mutex<Vec<String>>,
}

impl RecordingQueryLog {
    pub fn infos(&self) -> Vec<String> {
        self.infos.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    pub fn queries(&self) -> Vec<(IpAddr, String)> {
        self.queries.lock().unwrap().clone()
    }

    pub fn blocked(&self) -> Vec<(IpAddr, String)> {
        self.blocked.lock().unwrap().clone()
    }

    pub fn cache_hits(&self) -> Vec<String> {
        self.cache_hits.lock().unwrap().clone()
    }
}

impl QueryLog for RecordingQueryLog {
    fn info(&self, message: fmt::Arguments<'_>) {
        self.infos.lock().unwrap().push(message.to_string());
    }

    fn error(&self, message: fmt::Arguments<'_>) {
        self.errors.lock().unwrap().push(message.to_string());
    }

    fn query(&self, client: IpAddr, domain: &str) {
        self.queries.lock().unwrap().push((client, domain.to_owned()));
    }

    fn blocked(&self, client: IpAddr, domain: &str) {
        self.blocked.lock().unwrap().push((client, domain.to_owned()));
    }

    fn cache_hit(&self, domain: &str) {
        self.cache_hits.lock().unwrap().push(domain.to_owned());
    }
}

/// A path in a fresh temp directory. The directory exists, the file doesn't.
pub(crate) fn temp_path(name: &str) -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!("sinkhole-test-{}-{}", std::process::id(), n));
    std::fs::create_dir_all(&dir).unwrap();
    dir.join(name)
}

/// An `A IN` query for `domain`.
pub(crate) fn build_query(domain: &str, id: u16) -> Vec<u8> {
    let mut query = id.to_be_bytes().to_vec();
    // RD, one question
    query.extend_from_slice(&[0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    for label in domain.split('.').filter(|label| !label.is_empty()) {
        query.push(label.len() as u8);
        query.extend_from_slice(label.as_bytes());
    }
    query.push(0);
    query.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
    query
}

/// Upstream resolver stand-in. Echoes every query back flagged as a response and counts
/// what it receives. Each query is answered by its own task.
pub(crate) struct FakeUpstream {
    pub addr: SocketAddr,
    received: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl FakeUpstream {
    pub async fn start() -> Self {
        FakeUpstream::with_delay(None).await
    }

    /// Waits `delay` before every reply.
    pub async fn with_delay(delay: Option<std::time::Duration>) -> Self {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        let received = Arc::new(AtomicUsize::new(0));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak_in_flight = Arc::new(AtomicUsize::new(0));

        let counter = received.clone();
        let peak = peak_in_flight.clone();
        let handle = tokio::spawn(async move {
            // Dropped with the task, which aborts pending replies
            let mut replies = JoinSet::new();
            let mut buf = vec![0; 4096];
            loop {
                let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(current, Ordering::SeqCst);

                let mut reply = buf[..len].to_vec();
                if reply.len() >= 4 {
                    reply[2] = 0x81;
                    reply[3] = 0x80;
                }
                let socket = socket.clone();
                let in_flight = in_flight.clone();
                replies.spawn(async move {
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    let _ = socket.send_to(&reply, from).await;
                });
                while replies.try_join_next().is_some() {}
            }
        });

        FakeUpstream {
            addr,
            received,
            peak_in_flight,
            handle,
        }
    }

    pub fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }

    /// Most queries received but not yet answered at any one time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

impl Drop for FakeUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
