use super::{HttpSettings, Scrape, ScrapeError, ScrapeMap, TrackerUrlError};
use crate::consts::USER_AGENT;
use crate::infohash::InfoHash;
use crate::util::{UnbencodeError, decode_bencode};
use bendy::decoding::{Error as BendyError, FromBencode, Object, ResultExt};
use bytes::Bytes;
use reqwest::{Client, Proxy};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct HttpTracker(Url);

impl HttpTracker {
    pub(crate) fn url_string(&self) -> String {
        self.0.to_string()
    }

    /// Derive the scrape URL from the announce URL as described in BEP 48:
    /// the final path component must begin with "announce", which is replaced
    /// with "scrape".
    pub(crate) fn scrape_url(&self) -> Result<Url, HttpTrackerError> {
        let mut url = self.0.clone();
        let path = url.path();
        let (dir, last) = path.rsplit_once('/').unwrap_or(("", path));
        let Some(rest) = last.strip_prefix("announce") else {
            return Err(HttpTrackerError::NoScrape);
        };
        let newpath = format!("{dir}/scrape{rest}");
        url.set_path(&newpath);
        url.set_fragment(None);
        Ok(url)
    }

    #[tracing::instrument(name = "scrape-http", skip_all, fields(tracker = %self.0))]
    pub(crate) async fn scrape(
        &self,
        hashes: &[InfoHash],
        settings: &HttpSettings,
    ) -> Result<ScrapeMap, ScrapeError> {
        let mut url = self.scrape_url()?;
        for ih in hashes {
            ih.add_query_param(&mut url);
        }
        let mut builder = Client::builder().user_agent(USER_AGENT);
        if let Some(proxy) = &settings.proxy {
            tracing::trace!(%proxy, "Routing request through proxy");
            builder = builder.proxy(
                Proxy::all(proxy.as_str()).map_err(HttpTrackerError::BuildClient)?,
            );
        }
        let client = builder.build().map_err(HttpTrackerError::BuildClient)?;
        let mut retries = 0;
        let buf = loop {
            match fetch(&client, url.clone(), settings.timeout).await {
                Ok(buf) => break buf,
                Err(e) if e.is_timeout() => {
                    if retries >= settings.retries {
                        return Err(ScrapeError::Timeout);
                    }
                    retries += 1;
                    tracing::debug!("Request to {} timed out; retrying", self.0);
                }
                Err(e) => return Err(e.into()),
            }
        };
        decode_bencode::<HttpScrapeResponse>(&buf)
            .map_err(HttpTrackerError::ParseResponse)?
            .result()
    }
}

async fn fetch(client: &Client, url: Url, timeout: Duration) -> Result<Bytes, HttpTrackerError> {
    tracing::trace!(%url, "Sending scrape request");
    client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(HttpTrackerError::SendRequest)?
        .error_for_status()
        .map_err(HttpTrackerError::HttpStatus)?
        .bytes()
        .await
        .map_err(HttpTrackerError::ReadBody)
}

impl fmt::Display for HttpTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Tracker {}>", self.0)
    }
}

impl TryFrom<Url> for HttpTracker {
    type Error = TrackerUrlError;

    fn try_from(mut url: Url) -> Result<HttpTracker, TrackerUrlError> {
        let sch = url.scheme();
        if sch != "http" && sch != "https" {
            return Err(TrackerUrlError::UnsupportedScheme(sch.into()));
        }
        if url.host().is_none() {
            return Err(TrackerUrlError::NoHost);
        }
        url.set_fragment(None);
        Ok(HttpTracker(url))
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum HttpScrapeResponse {
    Success(ScrapeMap),
    Failure(String),
}

impl HttpScrapeResponse {
    fn result(self) -> Result<ScrapeMap, ScrapeError> {
        match self {
            HttpScrapeResponse::Success(scrape) => Ok(scrape),
            HttpScrapeResponse::Failure(msg) => Err(ScrapeError::Failure(msg)),
        }
    }
}

impl FromBencode for HttpScrapeResponse {
    fn decode_bencode_object(object: Object<'_, '_>) -> Result<Self, BendyError> {
        let mut files = None;
        let mut failure_reason = None;
        let mut dd = object.try_into_dictionary()?;
        while let Some(kv) = dd.next_pair()? {
            match kv {
                (b"files", val) => {
                    let mut filemap = HashMap::new();
                    let mut fdict = val.try_into_dictionary().context("files")?;
                    while let Some((k, v)) = fdict.next_pair().context("files")? {
                        let infohash = InfoHash::try_from(k)
                            .map_err(|e| BendyError::malformed_content(e).context("files.<key>"))?;
                        let scrape = decode_file_stats(v).context("files.<value>")?;
                        filemap.insert(infohash, scrape);
                    }
                    files = Some(filemap);
                }
                (b"failure reason", val) => {
                    failure_reason = Some(
                        String::from_utf8_lossy(val.try_into_bytes().context("failure reason")?)
                            .into_owned(),
                    );
                }
                _ => (),
            }
        }
        match (files, failure_reason) {
            (_, Some(fr)) => Ok(HttpScrapeResponse::Failure(fr)),
            (Some(files), None) => Ok(HttpScrapeResponse::Success(files)),
            (None, None) => Err(BendyError::missing_field("files")),
        }
    }
}

fn decode_file_stats(object: Object<'_, '_>) -> Result<Scrape, BendyError> {
    let mut complete = None;
    let mut downloaded = None;
    let mut incomplete = None;
    let mut vdict = object.try_into_dictionary()?;
    while let Some(kv) = vdict.next_pair()? {
        match kv {
            (b"complete", val) => {
                complete = Some(u64::decode_bencode_object(val).context("complete")?);
            }
            (b"downloaded", val) => {
                downloaded = Some(u64::decode_bencode_object(val).context("downloaded")?);
            }
            (b"incomplete", val) => {
                incomplete = Some(u64::decode_bencode_object(val).context("incomplete")?);
            }
            _ => (),
        }
    }
    let seeders = complete.ok_or_else(|| BendyError::missing_field("complete"))?;
    let leechers = incomplete.ok_or_else(|| BendyError::missing_field("incomplete"))?;
    Ok(Scrape {
        seeders,
        leechers,
        completed: downloaded,
    })
}

#[derive(Debug, Error)]
pub enum HttpTrackerError {
    #[error("tracker URL does not support scraping")]
    NoScrape,
    #[error("failed to build HTTP client")]
    BuildClient(#[source] reqwest::Error),
    #[error("failed to send request to HTTP tracker")]
    SendRequest(#[source] reqwest::Error),
    #[error("HTTP tracker responded with HTTP error")]
    HttpStatus(#[source] reqwest::Error),
    #[error("failed to read HTTP tracker response")]
    ReadBody(#[source] reqwest::Error),
    #[error("failed to parse HTTP tracker response")]
    ParseResponse(#[source] UnbencodeError),
}

impl HttpTrackerError {
    fn is_timeout(&self) -> bool {
        match self {
            HttpTrackerError::SendRequest(e) | HttpTrackerError::ReadBody(e) => e.is_timeout(),
            _ => false,
        }
    }
}
