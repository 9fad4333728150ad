use crate::infohash::InfoHash;
use crate::tracker::Tracker;
use std::fmt;
use thiserror::Error;
use url::Url;
use url::form_urlencoded::byte_serialize;

/// A parsed magnet URI
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MagnetLink {
    pub info_hash: InfoHash,
    /// Advisory name of the torrent ("dn")
    pub display_name: Option<String>,
    /// Declared trackers ("tr"), deduplicated, in order of first appearance
    pub trackers: Vec<Tracker>,
    /// All other parameters, in order
    pub extra: Vec<(String, String)>,
}

impl MagnetLink {
    pub fn decode(uri: &str) -> Result<MagnetLink, DecodeError> {
        let url = Url::parse(uri.trim()).map_err(DecodeError::InvalidUri)?;
        if url.scheme() != "magnet" {
            return Err(DecodeError::UnsupportedScheme(url.scheme().into()));
        }
        let mut v1 = None;
        let mut v2 = None;
        let mut malformed = None;
        let mut display_name = None;
        let mut trackers: Vec<Tracker> = Vec::new();
        let mut extra = Vec::new();
        for (key, value) in url.query_pairs() {
            match param_name(&key) {
                "xt" => match parse_exact_topic(&value) {
                    Ok(Some(ih @ InfoHash::V1(_))) => {
                        v1.get_or_insert(ih);
                    }
                    Ok(Some(ih @ InfoHash::V2(_))) => {
                        v2.get_or_insert(ih);
                    }
                    Ok(None) => tracing::trace!(xt = %value, "Ignoring unsupported exact topic"),
                    Err(e) => {
                        malformed.get_or_insert(e);
                    }
                },
                "dn" => {
                    display_name.get_or_insert_with(|| value.into_owned());
                }
                "tr" => match value.parse::<Tracker>() {
                    Ok(tr) => {
                        if !trackers.contains(&tr) {
                            trackers.push(tr);
                        }
                    }
                    Err(e) => tracing::debug!(tracker = %value, error = %e, "Skipping unusable tracker"),
                },
                _ => extra.push((key.into_owned(), value.into_owned())),
            }
        }
        // Hybrid torrents declare both; trackers only understand 20-byte
        // hashes natively, so prefer v1.
        let Some(info_hash) = v1.or(v2) else {
            return Err(malformed.unwrap_or(DecodeError::MissingInfoHash));
        };
        Ok(MagnetLink {
            info_hash,
            display_name,
            trackers,
            extra,
        })
    }
}

impl fmt::Display for MagnetLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.info_hash {
            InfoHash::V1(_) => write!(f, "magnet:?xt=urn:btih:{}", self.info_hash)?,
            InfoHash::V2(_) => write!(f, "magnet:?xt=urn:btmh:1220{}", self.info_hash)?,
        }
        if let Some(dn) = &self.display_name {
            write!(f, "&dn={}", encode(dn))?;
        }
        for tr in &self.trackers {
            write!(f, "&tr={}", encode(&tr.url_string()))?;
        }
        for (key, value) in &self.extra {
            write!(f, "&{}={}", encode(key), encode(value))?;
        }
        Ok(())
    }
}

impl std::str::FromStr for MagnetLink {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<MagnetLink, DecodeError> {
        MagnetLink::decode(s)
    }
}

fn encode(s: &str) -> String {
    byte_serialize(s.as_bytes()).collect()
}

/// Strip a numeric suffix (as in "xt.1" or "tr.2") from a parameter name
fn param_name(key: &str) -> &str {
    match key.split_once('.') {
        Some((base, n)) if !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()) => base,
        _ => key,
    }
}

/// Parse an "xt" value.  Returns `Ok(None)` for URN types other than BitTorrent
/// info hashes.
fn parse_exact_topic(xt: &str) -> Result<Option<InfoHash>, DecodeError> {
    if let Some(hash) = strip_prefix_ignore_case(xt, "urn:btih:") {
        let r = match hash.len() {
            40 => InfoHash::from_hex(hash),
            32 => InfoHash::from_base32(hash),
            _ => return Err(DecodeError::MalformedHash(hash.into())),
        };
        r.map(Some)
            .map_err(|_| DecodeError::MalformedHash(hash.into()))
    } else if let Some(multihash) = strip_prefix_ignore_case(xt, "urn:btmh:") {
        // Multihash: 0x12 = SHA2-256, 0x20 = 32-byte digest
        match strip_prefix_ignore_case(multihash, "1220") {
            Some(hash) if hash.len() == 64 => InfoHash::from_hex(hash)
                .map(Some)
                .map_err(|_| DecodeError::MalformedHash(multihash.into())),
            _ => Err(DecodeError::MalformedHash(multihash.into())),
        }
    } else {
        Ok(None)
    }
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        s.get(prefix.len()..)
    } else {
        None
    }
}

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum DecodeError {
    #[error("input is not a valid URI")]
    InvalidUri(#[source] url::ParseError),
    #[error("unsupported URI scheme {0:?}; expected \"magnet\"")]
    UnsupportedScheme(String),
    #[error("magnet link does not contain a BitTorrent info hash")]
    MissingInfoHash,
    #[error("malformed info hash {0:?}")]
    MalformedHash(String),
}
