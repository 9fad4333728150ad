use bendy::decoding::{Decoder, FromBencode};
use bytes::{Buf, Bytes};
use std::time::Duration;
use thiserror::Error;

/// A read-only view of a received packet from which big-endian integers can
/// be pulled without panicking on short input
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct TryBytes(Bytes);

impl TryBytes {
    pub(crate) fn try_get<T: TryFromBuf>(&mut self) -> Result<T, PacketError> {
        T::try_from_buf(&mut self.0)
    }

    pub(crate) fn into_string_lossy(self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

impl From<Bytes> for TryBytes {
    fn from(bs: Bytes) -> TryBytes {
        TryBytes(bs)
    }
}

impl From<&[u8]> for TryBytes {
    fn from(bs: &[u8]) -> TryBytes {
        TryBytes::from(Bytes::copy_from_slice(bs))
    }
}

// All integers are read in big-endian order.
pub(crate) trait TryFromBuf: Sized {
    fn try_from_buf(buf: &mut Bytes) -> Result<Self, PacketError>;
}

macro_rules! impl_tryfrombuf {
    ($t:ty, $len:literal, $arg:ident, $get:expr) => {
        impl TryFromBuf for $t {
            fn try_from_buf($arg: &mut Bytes) -> Result<Self, PacketError> {
                if $arg.remaining() >= $len {
                    Ok($get)
                } else {
                    Err(PacketError::Short)
                }
            }
        }
    };
}

impl_tryfrombuf!(u32, 4, buf, buf.get_u32());
impl_tryfrombuf!(u64, 8, buf, buf.get_u64());

#[derive(Copy, Clone, Debug, Error, Eq, PartialEq)]
pub enum PacketError {
    #[error("unexpected end of packet")]
    Short,
}

// Like `FromBencode::from_bencode()`, but it checks that there are no trailing
// bytes afterwards
pub(crate) fn decode_bencode<T: FromBencode>(buf: &[u8]) -> Result<T, UnbencodeError> {
    let mut decoder = Decoder::new(buf).with_max_depth(T::EXPECTED_RECURSION_DEPTH);
    let value = match decoder.next_object()? {
        Some(obj) => T::decode_bencode_object(obj)?,
        None => return Err(UnbencodeError::NoData),
    };
    if !matches!(decoder.next_object(), Ok(None)) {
        return Err(UnbencodeError::TrailingData);
    }
    Ok(value)
}

#[derive(Clone, Debug, Error)]
pub enum UnbencodeError {
    #[error(transparent)]
    Bendy(#[from] bendy::decoding::Error),
    #[error("no data in bencode packet")]
    NoData,
    #[error("trailing bytes after bencode structure")]
    TrailingData,
}

/// Compute the delay for retry number `n` (zero-based) of an exponential
/// backoff that starts at `base` and doubles up to `cap`
pub(crate) fn backoff_delay(base: Duration, cap: Duration, n: u32) -> Duration {
    let factor = 1u32.checked_shl(n.min(31)).unwrap_or(u32::MAX);
    base.checked_mul(factor).map_or(cap, |d| d.min(cap))
}
