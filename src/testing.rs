//! In-process tracker doubles for tests
use crate::infohash::InfoHash;
use crate::tracker::Tracker;
use crate::tracker::udp::{CONNECT_ACTION, ERROR_ACTION, PROTOCOL_ID, SCRAPE_ACTION};
use crate::util::TryBytes;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use url::Url;

const MOCK_CONNECTION_ID: u64 = 0x0123_4567_89AB_CDEF;

/// How a [`MockUdpTracker`] answers requests
#[derive(Clone, Debug, Default)]
pub(crate) struct MockBehavior {
    /// Swarm statistics as (seeders, completed, leechers); unknown hashes are
    /// reported as all zeroes
    pub(crate) stats: HashMap<InfoHash, (u32, u32, u32)>,
    /// Never reply to anything
    pub(crate) silent: bool,
    /// Precede each reply with one carrying the wrong transaction ID
    pub(crate) decoy_first: bool,
    /// Reply only with wrong transaction IDs
    pub(crate) decoy_only: bool,
    /// Answer scrape requests with this error message
    pub(crate) error: Option<String>,
    /// Wait this long before answering a scrape request
    pub(crate) delay: Duration,
    /// Leave this many scrape requests unanswered before answering any
    pub(crate) ignore_scrapes: usize,
    /// Answer scrape requests bearing a connection ID this tracker never
    /// handed out with an error reply instead of ignoring them
    pub(crate) reject_unknown_connections: bool,
}

#[derive(Debug)]
pub(crate) struct MockUdpTracker {
    addr: SocketAddr,
    connects: Arc<AtomicUsize>,
    scrapes: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl MockUdpTracker {
    pub(crate) async fn spawn(behavior: MockBehavior) -> MockUdpTracker {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let connects = Arc::new(AtomicUsize::new(0));
        let scrapes = Arc::new(AtomicUsize::new(0));
        let handle = tokio::spawn(serve_udp(
            socket,
            behavior,
            Arc::clone(&connects),
            Arc::clone(&scrapes),
        ));
        MockUdpTracker {
            addr,
            connects,
            scrapes,
            handle,
        }
    }

    pub(crate) fn url(&self) -> String {
        format!("udp://{}/announce", self.addr)
    }

    pub(crate) fn tracker(&self) -> Tracker {
        self.url().parse().unwrap()
    }

    /// Number of connect requests received
    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Number of scrape requests received with a valid connection ID,
    /// including ignored ones
    pub(crate) fn scrapes(&self) -> usize {
        self.scrapes.load(Ordering::SeqCst)
    }
}

impl Drop for MockUdpTracker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve_udp(
    socket: UdpSocket,
    behavior: MockBehavior,
    connects: Arc<AtomicUsize>,
    scrapes: Arc<AtomicUsize>,
) {
    let mut buf = vec![0u8; 65535];
    loop {
        let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
            return;
        };
        let mut packet = TryBytes::from(&buf[..len]);
        let (Ok(head), Ok(action), Ok(xid)) = (
            packet.try_get::<u64>(),
            packet.try_get::<u32>(),
            packet.try_get::<u32>(),
        ) else {
            continue;
        };
        let reply = if head == PROTOCOL_ID && action == CONNECT_ACTION {
            connects.fetch_add(1, Ordering::SeqCst);
            let mut out = BytesMut::with_capacity(16);
            out.put_u32(CONNECT_ACTION);
            out.put_u32(xid);
            out.put_u64(MOCK_CONNECTION_ID);
            out.freeze()
        } else if head != MOCK_CONNECTION_ID && action == SCRAPE_ACTION {
            if !behavior.reject_unknown_connections {
                continue;
            }
            error_reply(xid, "unknown connection ID")
        } else if action == SCRAPE_ACTION {
            if scrapes.fetch_add(1, Ordering::SeqCst) < behavior.ignore_scrapes {
                continue;
            }
            let mut hashes = Vec::new();
            while let Ok(ih) = packet.try_get::<InfoHash>() {
                hashes.push(ih);
            }
            if !behavior.delay.is_zero() {
                tokio::time::sleep(behavior.delay).await;
            }
            scrape_reply(&behavior, xid, &hashes)
        } else {
            continue;
        };
        if behavior.silent {
            continue;
        }
        if behavior.decoy_first || behavior.decoy_only {
            let _ = socket.send_to(&with_xid(&reply, xid ^ 1), peer).await;
        }
        if !behavior.decoy_only {
            let _ = socket.send_to(&reply, peer).await;
        }
    }
}

fn scrape_reply(behavior: &MockBehavior, xid: u32, hashes: &[InfoHash]) -> Bytes {
    if let Some(msg) = &behavior.error {
        return error_reply(xid, msg);
    }
    let mut out = BytesMut::new();
    out.put_u32(SCRAPE_ACTION);
    out.put_u32(xid);
    for ih in hashes {
        let (seeders, completed, leechers) = behavior.stats.get(ih).copied().unwrap_or_default();
        out.put_u32(seeders);
        out.put_u32(completed);
        out.put_u32(leechers);
    }
    out.freeze()
}

fn error_reply(xid: u32, msg: &str) -> Bytes {
    let mut out = BytesMut::new();
    out.put_u32(ERROR_ACTION);
    out.put_u32(xid);
    out.put_slice(msg.as_bytes());
    out.freeze()
}

fn with_xid(reply: &[u8], xid: u32) -> Bytes {
    let mut out = BytesMut::from(reply);
    out[4..8].copy_from_slice(&xid.to_be_bytes());
    out.freeze()
}

/// A bare-bones HTTP server that answers every request the same way
#[derive(Debug)]
pub(crate) struct MockHttpTracker {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
    accepted: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl MockHttpTracker {
    pub(crate) async fn spawn(body: Vec<u8>) -> MockHttpTracker {
        MockHttpTracker::start(Some((200, body))).await
    }

    /// Answer every request with the given status code and an empty body
    pub(crate) async fn spawn_status(status: u16) -> MockHttpTracker {
        MockHttpTracker::start(Some((status, Vec::new()))).await
    }

    /// Accept connections but never respond
    pub(crate) async fn spawn_silent() -> MockHttpTracker {
        MockHttpTracker::start(None).await
    }

    async fn start(reply: Option<(u16, Vec<u8>)>) -> MockHttpTracker {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::new(AtomicUsize::new(0));
        let handle = tokio::spawn(serve_http(
            listener,
            reply,
            Arc::clone(&requests),
            Arc::clone(&accepted),
        ));
        MockHttpTracker {
            addr,
            requests,
            accepted,
            handle,
        }
    }

    pub(crate) fn url(&self) -> String {
        format!("http://{}/announce", self.addr)
    }

    /// The server's address as a proxy URL
    pub(crate) fn proxy_url(&self) -> Url {
        Url::parse(&format!("http://{}", self.addr)).unwrap()
    }

    /// Request lines received so far
    pub(crate) fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    /// Number of connections accepted
    pub(crate) fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

impl Drop for MockHttpTracker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve_http(
    listener: TcpListener,
    reply: Option<(u16, Vec<u8>)>,
    requests: Arc<Mutex<Vec<String>>>,
    accepted: Arc<AtomicUsize>,
) {
    loop {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        accepted.fetch_add(1, Ordering::SeqCst);
        let Some((status, body)) = &reply else {
            // Hold the connection open until the client gives up
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
            });
            continue;
        };
        if let Some(line) = read_request_line(&mut stream).await {
            requests.lock().push(line);
        }
        let reason = if *status == 200 { "OK" } else { "Error" };
        let head = format!(
            "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        let _ = stream.write_all(head.as_bytes()).await;
        let _ = stream.write_all(body).await;
        let _ = stream.shutdown().await;
    }
}

/// Read a request's head and return its first line
async fn read_request_line(stream: &mut TcpStream) -> Option<String> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).await.ok()?;
        if n == 0 {
            break;
        }
        head.extend_from_slice(&buf[..n]);
    }
    let head = String::from_utf8_lossy(&head);
    head.lines().next().map(str::to_owned)
}
