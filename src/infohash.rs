use crate::util::{PacketError, TryFromBuf};
use bytes::{Buf, Bytes};
use data_encoding::{BASE32, DecodeError, HEXLOWER_PERMISSIVE};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;
use url::Url;

/// The identifier of a torrent: the SHA-1 hash of a v1 info dictionary or the
/// SHA-256 hash of a v2 one
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum InfoHash {
    V1([u8; InfoHash::V1_LENGTH]),
    V2([u8; InfoHash::V2_LENGTH]),
}

impl InfoHash {
    pub const V1_LENGTH: usize = 20;
    pub const V2_LENGTH: usize = 32;

    /// Parse a hexadecimal info hash of either 40 or 64 digits
    pub fn from_hex(s: &str) -> Result<InfoHash, InfoHashError> {
        HEXLOWER_PERMISSIVE
            .decode(s.as_bytes())
            .map_err(InfoHashError::InvalidHex)?
            .try_into()
    }

    /// Parse a 32-character base32 v1 info hash.  Lowercase input is
    /// accepted.
    pub fn from_base32(s: &str) -> Result<InfoHash, InfoHashError> {
        let bs = BASE32
            .decode(s.to_ascii_uppercase().as_bytes())
            .map_err(InfoHashError::InvalidBase32)?;
        if bs.len() == InfoHash::V1_LENGTH {
            InfoHash::try_from(bs)
        } else {
            Err(InfoHashError::InvalidLength(bs.len()))
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            InfoHash::V1(bs) => bs.as_slice(),
            InfoHash::V2(bs) => bs.as_slice(),
        }
    }

    pub fn is_v2(&self) -> bool {
        matches!(self, InfoHash::V2(_))
    }

    /// The 20-byte form of the hash by which trackers identify the swarm.  v2
    /// hashes are truncated to their first 20 bytes (BEP 52).
    pub fn swarm_key(&self) -> InfoHash {
        match self {
            InfoHash::V1(_) => *self,
            InfoHash::V2(bs) => {
                let mut key = [0u8; InfoHash::V1_LENGTH];
                key.copy_from_slice(&bs[..InfoHash::V1_LENGTH]);
                InfoHash::V1(key)
            }
        }
    }

    pub(crate) fn add_query_param(&self, url: &mut Url) {
        add_bytes_query_param(url, "info_hash", self.as_bytes());
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.as_bytes() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for InfoHash {
    type Err = InfoHashError;

    fn from_str(s: &str) -> Result<InfoHash, InfoHashError> {
        if s.len() == 32 {
            InfoHash::from_base32(s)
        } else {
            InfoHash::from_hex(s)
        }
    }
}

impl From<&[u8; 20]> for InfoHash {
    fn from(value: &[u8; 20]) -> InfoHash {
        InfoHash::V1(*value)
    }
}

impl From<&[u8; 32]> for InfoHash {
    fn from(value: &[u8; 32]) -> InfoHash {
        InfoHash::V2(*value)
    }
}

impl TryFrom<&[u8]> for InfoHash {
    type Error = InfoHashError;

    fn try_from(bs: &[u8]) -> Result<InfoHash, InfoHashError> {
        if let Ok(barray) = <[u8; InfoHash::V1_LENGTH]>::try_from(bs) {
            Ok(InfoHash::V1(barray))
        } else if let Ok(barray) = <[u8; InfoHash::V2_LENGTH]>::try_from(bs) {
            Ok(InfoHash::V2(barray))
        } else {
            Err(InfoHashError::InvalidLength(bs.len()))
        }
    }
}

impl TryFrom<Vec<u8>> for InfoHash {
    type Error = InfoHashError;

    fn try_from(bs: Vec<u8>) -> Result<InfoHash, InfoHashError> {
        InfoHash::try_from(bs.as_slice())
    }
}

// Only v1-sized hashes ever appear on the wire.
impl TryFromBuf for InfoHash {
    fn try_from_buf(buf: &mut Bytes) -> Result<InfoHash, PacketError> {
        if buf.remaining() >= InfoHash::V1_LENGTH {
            let mut data = [0u8; InfoHash::V1_LENGTH];
            buf.copy_to_slice(&mut data);
            Ok(InfoHash::V1(data))
        } else {
            Err(PacketError::Short)
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, Error, PartialEq)]
pub enum InfoHashError {
    #[error("info hash is invalid hexadecimal")]
    InvalidHex(#[source] DecodeError),
    #[error("info hash is invalid base32")]
    InvalidBase32(#[source] DecodeError),
    #[error("info hash is {0} bytes long, expected 20 or 32")]
    InvalidLength(usize),
}

fn add_bytes_query_param(url: &mut Url, key: &str, value: &[u8]) {
    static SENTINEL: &str = "ADD_BYTES_QUERY_PARAM";
    url.query_pairs_mut()
        .encoding_override(Some(&|s| {
            if s == SENTINEL {
                Cow::from(value.to_vec())
            } else {
                Cow::from(s.as_bytes())
            }
        }))
        .append_pair(key, SENTINEL)
        .encoding_override(None);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_info_hash() {
        let info_hash = "28C55196F57753C40ACEB6FB58617E6995A7EDDB"
            .parse::<InfoHash>()
            .unwrap();
        assert_eq!(
            info_hash.as_bytes(),
            b"\x28\xC5\x51\x96\xF5\x77\x53\xC4\x0A\xCE\xB6\xFB\x58\x61\x7E\x69\x95\xA7\xED\xDB"
        );
        assert_eq!(
            info_hash.to_string(),
            "28c55196f57753c40aceb6fb58617e6995a7eddb"
        );
        assert!(!info_hash.is_v2());
    }

    #[test]
    fn test_base32_info_hash() {
        let from_b32 = "fdcvdfxvo5j4icwow35vqyl6ngk2p3o3"
            .parse::<InfoHash>()
            .unwrap();
        let from_hex = "28C55196F57753C40ACEB6FB58617E6995A7EDDB"
            .parse::<InfoHash>()
            .unwrap();
        assert_eq!(from_b32, from_hex);
    }

    #[test]
    fn test_v2_info_hash_swarm_key() {
        let hex = "caf1e1c30e81cb361b9ee167c4aa64228a7fa4fa9f6105232b28ad099f3a302e";
        let info_hash = hex.parse::<InfoHash>().unwrap();
        assert!(info_hash.is_v2());
        assert_eq!(info_hash.to_string(), hex);
        assert_eq!(
            info_hash.swarm_key().to_string(),
            "caf1e1c30e81cb361b9ee167c4aa64228a7fa4fa"
        );
    }

    #[test]
    fn test_bad_length() {
        assert_eq!(
            "28C55196F57753C40ACEB6FB58617E6995A7ED".parse::<InfoHash>(),
            Err(InfoHashError::InvalidLength(19))
        );
    }

    #[test]
    fn test_bad_hex() {
        assert!(matches!(
            "28C55196F57753C40ACEB6FB58617E6995A7EDZZ".parse::<InfoHash>(),
            Err(InfoHashError::InvalidHex(_))
        ));
    }

    #[test]
    fn test_add_query_param() {
        let info_hash = "28C55196F57753C40ACEB6FB58617E6995A7EDDB"
            .parse::<InfoHash>()
            .unwrap();
        let mut url = Url::parse("http://tracker.example.com:8080/scrape?here=there").unwrap();
        info_hash.add_query_param(&mut url);
        assert_eq!(
            url.as_str(),
            "http://tracker.example.com:8080/scrape?here=there&info_hash=%28%C5Q%96%F5wS%C4%0A%CE%B6%FBXa%7Ei%95%A7%ED%DB"
        );
    }
}
