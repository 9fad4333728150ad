use super::{Scrape, ScrapeError, ScrapeMap, TrackerUrlError, UdpSettings};
use crate::book::TrackerBook;
use crate::consts::{UDP_CONNECTION_LIFETIME, UDP_MAX_SCRAPE_HASHES, UDP_PACKET_LEN};
use crate::infohash::InfoHash;
use crate::util::{PacketError, TryBytes, backoff_delay};
use bytes::{BufMut, Bytes, BytesMut};
use rand::random;
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::{UdpSocket, lookup_host};
use tokio::time::{Instant, timeout_at};
use url::Url;

pub(crate) const PROTOCOL_ID: u64 = 0x41727101980;
pub(crate) const CONNECT_ACTION: u32 = 0;
pub(crate) const SCRAPE_ACTION: u32 = 2;
pub(crate) const ERROR_ACTION: u32 = 3;

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct UdpTracker(UdpUrl);

impl UdpTracker {
    pub(crate) fn url_string(&self) -> String {
        self.0.to_string()
    }

    #[tracing::instrument(name = "scrape-udp", skip_all, fields(tracker = %self.0))]
    pub(crate) async fn scrape(
        &self,
        hashes: &[InfoHash],
        settings: &UdpSettings,
        book: &TrackerBook,
    ) -> Result<ScrapeMap, ScrapeError> {
        let key = self.url_string();
        let socket = ConnectedUdpSocket::connect(&self.0.host, self.0.port).await?;
        let mut session = UdpTrackerSession::new(self, socket, settings);
        session.conn = book.udp_connection(&key);
        let r = session.scrape(hashes).await;
        if let Some(conn) = session.conn
            && conn.fresh
        {
            book.store_udp_connection(&key, conn);
        }
        r
    }
}

impl fmt::Display for UdpTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Tracker {}>", self.0)
    }
}

impl TryFrom<Url> for UdpTracker {
    type Error = TrackerUrlError;

    fn try_from(url: Url) -> Result<UdpTracker, TrackerUrlError> {
        UdpUrl::try_from(url).map(UdpTracker)
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct UdpUrl {
    host: String,
    port: u16,
    urldata: String,
}

impl fmt::Display for UdpUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "udp://")?;
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            write!(f, "{}", self.host)?;
        }
        write!(f, ":{}{}", self.port, self.urldata)?;
        Ok(())
    }
}

impl TryFrom<Url> for UdpUrl {
    type Error = TrackerUrlError;

    fn try_from(url: Url) -> Result<UdpUrl, TrackerUrlError> {
        let sch = url.scheme();
        if sch != "udp" {
            return Err(TrackerUrlError::UnsupportedScheme(sch.into()));
        }
        // Hosts in non-special URLs are left as written
        let Some(host) = url
            .host_str()
            .map(|h| h.trim_matches(['[', ']']).to_ascii_lowercase())
        else {
            return Err(TrackerUrlError::NoHost);
        };
        let Some(port) = url.port() else {
            return Err(TrackerUrlError::NoUdpPort);
        };
        let mut urldata = String::from(url.path());
        if let Some(query) = url.query() {
            urldata.push('?');
            urldata.push_str(query);
        }
        Ok(UdpUrl {
            host,
            port,
            urldata,
        })
    }
}

struct UdpTrackerSession<'a> {
    tracker: &'a UdpTracker,
    socket: ConnectedUdpSocket,
    settings: &'a UdpSettings,
    conn: Option<Connection>,
    /// Number of packets sent so far, across connects and scrapes
    sent: u32,
}

impl<'a> UdpTrackerSession<'a> {
    fn new(
        tracker: &'a UdpTracker,
        socket: ConnectedUdpSocket,
        settings: &'a UdpSettings,
    ) -> Self {
        UdpTrackerSession {
            tracker,
            socket,
            settings,
            conn: None,
            sent: 0,
        }
    }

    async fn scrape(&mut self, hashes: &[InfoHash]) -> Result<ScrapeMap, ScrapeError> {
        let mut scrapemap = ScrapeMap::new();
        for chunk in hashes.chunks(UDP_MAX_SCRAPE_HASHES) {
            scrapemap.extend(self.scrape_chunk(chunk).await?);
        }
        Ok(scrapemap)
    }

    async fn scrape_chunk(
        &mut self,
        hashes: &[InfoHash],
    ) -> Result<Vec<(InfoHash, Scrape)>, ScrapeError> {
        loop {
            let conn = self.get_connection().await?;
            let transaction_id = make_transaction_id();
            let msg = Bytes::from(UdpScrapeRequest {
                connection_id: conn.id,
                transaction_id,
                info_hashes: hashes.to_vec(),
            });
            tracing::trace!(hashes = hashes.len(), "Sending scrape request to {}", self.tracker);
            let reply = self
                .exchange(msg, transaction_id, Some(conn.expiration), |buf| {
                    UdpScrapeResponse::from_bytes(buf, hashes.len())
                })
                .await;
            match reply {
                Ok(Exchange::Reply(resp)) => {
                    return Ok(hashes.iter().copied().zip(resp.scrapes).collect());
                }
                Ok(Exchange::Expired) => {
                    tracing::trace!("Connection to {} expired; restarting", self.tracker);
                    self.reset_connection();
                }
                Err(ScrapeError::Failure(msg)) if !conn.fresh => {
                    // A remembered connection ID may have been invalidated by
                    // the tracker; get a new one before believing the error.
                    tracing::trace!(
                        "{} rejected remembered connection ({msg:?}); reconnecting",
                        self.tracker
                    );
                    self.reset_connection();
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_connection(&mut self) -> Result<Connection, ScrapeError> {
        if let Some(c) = self.conn {
            if Instant::now() < c.expiration {
                return Ok(c);
            } else {
                tracing::trace!("Connection to {} expired; will reconnect", self.tracker);
            }
        }
        let conn = self.connect().await?;
        self.conn = Some(conn);
        Ok(conn)
    }

    fn reset_connection(&mut self) {
        self.conn = None;
    }

    async fn connect(&mut self) -> Result<Connection, ScrapeError> {
        tracing::trace!("Sending connection request to {}", self.tracker);
        let transaction_id = make_transaction_id();
        let msg = Bytes::from(UdpConnectionRequest { transaction_id });
        loop {
            if let Exchange::Reply(resp) = self
                .exchange(msg.clone(), transaction_id, None, UdpConnectionResponse::try_from)
                .await?
            {
                tracing::trace!("Connected to {}", self.tracker);
                return Ok(Connection {
                    id: resp.connection_id,
                    expiration: Instant::now() + UDP_CONNECTION_LIFETIME,
                    fresh: true,
                });
            }
        }
    }

    /// Send `msg` and wait for a reply bearing `transaction_id`, resending
    /// with exponential backoff until the session's packet budget is spent.
    /// Replies with the wrong transaction ID or an unparsable body are
    /// discarded.  An error reply ends the exchange immediately.
    async fn exchange<T, F>(
        &mut self,
        msg: Bytes,
        transaction_id: u32,
        expiration: Option<Instant>,
        mut parser: F,
    ) -> Result<Exchange<T>, ScrapeError>
    where
        F: FnMut(Bytes) -> Result<T, UdpTrackerError>,
    {
        loop {
            if expiration.is_some_and(|exp| Instant::now() >= exp) {
                return Ok(Exchange::Expired);
            }
            if self.sent >= self.settings.attempts {
                tracing::trace!("Giving up on {} after {} packets", self.tracker, self.sent);
                return Err(ScrapeError::Timeout);
            }
            let wait = backoff_delay(self.settings.backoff_base, self.settings.backoff_cap, self.sent);
            self.sent += 1;
            self.socket.send(&msg).await?;
            let deadline = Instant::now() + wait;
            loop {
                let Ok(r) = timeout_at(deadline, self.socket.recv()).await else {
                    tracing::trace!("{} did not reply in time; resending message", self.tracker);
                    break;
                };
                match Response::from_bytes(r?, transaction_id, &mut parser) {
                    Ok(Response::Success(res)) => return Ok(Exchange::Reply(res)),
                    Ok(Response::Failure(message)) => return Err(ScrapeError::Failure(message)),
                    Err(e) => {
                        tracing::trace!(error = %e, "Discarding reply from {}", self.tracker);
                    }
                }
            }
        }
    }
}

fn make_transaction_id() -> u32 {
    random()
}

enum Exchange<T> {
    Reply(T),
    /// The connection ID in use expired before a reply arrived
    Expired,
}

struct ConnectedUdpSocket {
    inner: UdpSocket,
}

impl ConnectedUdpSocket {
    async fn connect(host: &str, port: u16) -> Result<ConnectedUdpSocket, UdpTrackerError> {
        let Some(addr) = lookup_host((host, port))
            .await
            .map_err(UdpTrackerError::Lookup)?
            .next()
        else {
            return Err(UdpTrackerError::NoResolve);
        };
        let bindaddr = match addr {
            SocketAddr::V4(_) => "0.0.0.0:0",
            SocketAddr::V6(_) => "[::]:0",
        };
        let socket = UdpSocket::bind(bindaddr)
            .await
            .map_err(UdpTrackerError::Bind)?;
        tracing::trace!(
            "Connected UDP socket to {} (IP address: {}), port {}",
            host,
            addr.ip(),
            port,
        );
        socket
            .connect(addr)
            .await
            .map_err(UdpTrackerError::Connect)?;
        Ok(ConnectedUdpSocket { inner: socket })
    }

    async fn send(&self, msg: &Bytes) -> Result<(), UdpTrackerError> {
        self.inner.send(msg).await.map_err(UdpTrackerError::Send)?;
        Ok(())
    }

    async fn recv(&self) -> Result<Bytes, UdpTrackerError> {
        let mut buf = BytesMut::with_capacity(UDP_PACKET_LEN);
        self.inner
            .recv_buf(&mut buf)
            .await
            .map_err(UdpTrackerError::Recv)?;
        Ok(buf.freeze())
    }
}

// UDP tracker psuedo-connection (BEP 15)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct Connection {
    pub(crate) id: u64,
    pub(crate) expiration: Instant,
    /// Whether the ID was obtained during the current scrape rather than
    /// remembered from an earlier one
    pub(crate) fresh: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Response<T> {
    Success(T),
    Failure(String),
}

impl<T> Response<T> {
    fn from_bytes<F>(buf: Bytes, transaction_id: u32, parser: F) -> Result<Self, UdpTrackerError>
    where
        F: FnOnce(Bytes) -> Result<T, UdpTrackerError>,
    {
        let mut view = TryBytes::from(buf.clone());
        let action = view.try_get::<u32>()?;
        let got = view.try_get::<u32>()?;
        if got != transaction_id {
            return Err(UdpTrackerError::XactionMismatch {
                expected: transaction_id,
                got,
            });
        }
        if action == ERROR_ACTION {
            Ok(Response::Failure(view.into_string_lossy()))
        } else {
            parser(buf).map(Response::Success)
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct UdpConnectionRequest {
    transaction_id: u32,
}

impl From<UdpConnectionRequest> for Bytes {
    fn from(req: UdpConnectionRequest) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u64(PROTOCOL_ID);
        buf.put_u32(CONNECT_ACTION);
        buf.put_u32(req.transaction_id);
        buf.freeze()
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct UdpConnectionResponse {
    transaction_id: u32,
    connection_id: u64,
}

impl TryFrom<Bytes> for UdpConnectionResponse {
    type Error = UdpTrackerError;

    fn try_from(buf: Bytes) -> Result<Self, UdpTrackerError> {
        let mut buf = TryBytes::from(buf);
        let action = buf.try_get::<u32>()?;
        if action != CONNECT_ACTION {
            return Err(UdpTrackerError::BadAction {
                expected: CONNECT_ACTION,
                got: action,
            });
        }
        let transaction_id = buf.try_get::<u32>()?;
        let connection_id = buf.try_get::<u64>()?;
        // Don't require EOF here, as "Clients ... should not assume packets to
        // be of a certain size"
        Ok(UdpConnectionResponse {
            transaction_id,
            connection_id,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
struct UdpScrapeRequest {
    connection_id: u64,
    transaction_id: u32,
    info_hashes: Vec<InfoHash>,
}

impl From<UdpScrapeRequest> for Bytes {
    fn from(req: UdpScrapeRequest) -> Bytes {
        let mut buf = BytesMut::with_capacity(16 + InfoHash::V1_LENGTH * req.info_hashes.len());
        buf.put_u64(req.connection_id);
        buf.put_u32(SCRAPE_ACTION);
        buf.put_u32(req.transaction_id);
        for ih in &req.info_hashes {
            buf.put_slice(ih.as_bytes());
        }
        buf.freeze()
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
struct UdpScrapeResponse {
    transaction_id: u32,
    scrapes: Vec<Scrape>,
}

impl UdpScrapeResponse {
    /// Parse a scrape response that is expected to contain statistics for
    /// `count` info hashes
    fn from_bytes(buf: Bytes, count: usize) -> Result<Self, UdpTrackerError> {
        let mut buf = TryBytes::from(buf);
        let action = buf.try_get::<u32>()?;
        if action != SCRAPE_ACTION {
            return Err(UdpTrackerError::BadAction {
                expected: SCRAPE_ACTION,
                got: action,
            });
        }
        let transaction_id = buf.try_get::<u32>()?;
        let mut scrapes = Vec::with_capacity(count);
        for _ in 0..count {
            let seeders = buf.try_get::<u32>()?;
            let completed = buf.try_get::<u32>()?;
            let leechers = buf.try_get::<u32>()?;
            scrapes.push(Scrape {
                seeders: u64::from(seeders),
                leechers: u64::from(leechers),
                completed: Some(u64::from(completed)),
            });
        }
        Ok(UdpScrapeResponse {
            transaction_id,
            scrapes,
        })
    }
}

#[derive(Debug, Error)]
pub enum UdpTrackerError {
    #[error("failed to resolve remote hostname")]
    Lookup(#[source] std::io::Error),
    #[error("remote hostname did not resolve to any IP addresses")]
    NoResolve,
    #[error("failed to bind UDP socket")]
    Bind(#[source] std::io::Error),
    #[error("failed to connect UDP socket")]
    Connect(#[source] std::io::Error),
    #[error("failed to send UDP packet")]
    Send(#[source] std::io::Error),
    #[error("failed to receive UDP packet")]
    Recv(#[source] std::io::Error),
    #[error("UDP tracker sent response with invalid length")]
    PacketLen(#[from] PacketError),
    #[error(
        "UDP tracker sent response with unexpected or unsupported action; expected {expected}, got {got}"
    )]
    BadAction { expected: u32, got: u32 },
    #[error(
        "response from UDP tracker did not contain expected transaction ID; expected {expected:#x}, got {got:#x}"
    )]
    XactionMismatch { expected: u32, got: u32 },
}
