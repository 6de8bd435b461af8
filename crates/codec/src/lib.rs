//! # Codec
//!
//! Block compression and packed metadata serialization for the EMU raster
//! container.
//!
//! Every payload in an EMU body — tile pixels, RAT chunks, metadata blobs —
//! is compressed independently so that any one of them can be fetched and
//! decoded without touching its neighbours. Two algorithms are supported:
//! an identity pass-through and zlib at the best-ratio setting. The
//! decompressor trusts the caller-supplied output length; the container
//! records it next to every payload, so a mismatch means the file (or the
//! index) is damaged.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("decode failed: {0}")]
    Decode(&'static str),
    #[error("unknown compression algorithm: {0}")]
    UnknownAlgorithm(u8),
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Compression algorithm, stored as a single byte before each payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Zlib,
}

impl Compression {
    pub fn code(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Zlib => 1,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Self::None),
            1 => Ok(Self::Zlib),
            other => Err(CodecError::UnknownAlgorithm(other)),
        }
    }
}

/// Compresses `src` with the given algorithm.
///
/// The identity algorithm borrows the input (no copy); zlib returns an owned
/// stream at `Compression::best()`, matching what the rest of the format
/// assumes about ratio over speed.
pub fn compress(algo: Compression, src: &[u8]) -> Result<Cow<'_, [u8]>> {
    match algo {
        Compression::None => Ok(Cow::Borrowed(src)),
        Compression::Zlib => {
            let mut encoder =
                ZlibEncoder::new(Vec::with_capacity(src.len() / 2), flate2::Compression::best());
            encoder.write_all(src)?;
            Ok(Cow::Owned(encoder.finish()?))
        }
    }
}

/// Decompresses `src` into `out`, which must be exactly the uncompressed
/// length the producer recorded.
///
/// A stream that ends early, a stream with bytes left over after `out` is
/// full, or an identity payload whose size differs from `out.len()` all
/// surface as [`CodecError::Decode`].
pub fn decompress(algo: Compression, src: &[u8], out: &mut [u8]) -> Result<()> {
    match algo {
        Compression::None => {
            if src.len() != out.len() {
                return Err(CodecError::Decode("identity payload length mismatch"));
            }
            out.copy_from_slice(src);
            Ok(())
        }
        Compression::Zlib => {
            let mut decoder = ZlibDecoder::new(src);
            decoder
                .read_exact(out)
                .map_err(|_| CodecError::Decode("zlib stream shorter than declared size"))?;
            let mut probe = [0u8; 1];
            match decoder.read(&mut probe) {
                Ok(0) => Ok(()),
                Ok(_) => Err(CodecError::Decode("zlib stream longer than declared size")),
                Err(_) => Err(CodecError::Decode("zlib stream corrupt past declared size")),
            }
        }
    }
}

/// Keys that are never serialized into a metadata blob. They live in typed
/// header fields and are reconstructed from those on read.
pub const RESERVED_KEYS: [&str; 5] = [
    "STATISTICS_MINIMUM",
    "STATISTICS_MAXIMUM",
    "STATISTICS_MEAN",
    "STATISTICS_STDDEV",
    "CLOUD_OPTIMISED",
];

fn is_reserved(key: &str) -> bool {
    RESERVED_KEYS.iter().any(|r| *r == key)
}

/// Packs a metadata mapping into the uncompressed blob form:
/// `key=value\0` per entry plus one terminating `\0`.
///
/// Reserved keys are dropped. If nothing survives the filter the result is
/// empty, and the container records an input size of zero — readers take
/// that as "no metadata".
pub fn pack_metadata(items: &BTreeMap<String, String>) -> Vec<u8> {
    let mut blob = Vec::new();
    for (key, value) in items {
        if is_reserved(key) {
            continue;
        }
        blob.extend_from_slice(key.as_bytes());
        blob.push(b'=');
        blob.extend_from_slice(value.as_bytes());
        blob.push(0);
    }
    if !blob.is_empty() {
        blob.push(0);
    }
    blob
}

/// Splits a metadata blob back into a mapping.
///
/// Tokens are delimited by `\0`; each parses at its first `=`. Tokens with
/// no `=` (including the empty terminator token) are ignored.
pub fn unpack_metadata(blob: &[u8]) -> BTreeMap<String, String> {
    let mut items = BTreeMap::new();
    for token in blob.split(|b| *b == 0) {
        let token = String::from_utf8_lossy(token);
        if let Some(eq) = token.find('=') {
            items.insert(token[..eq].to_string(), token[eq + 1..].to_string());
        }
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zlib_round_trip() {
        let src: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let packed = compress(Compression::Zlib, &src).unwrap();
        assert!(packed.len() < src.len());

        let mut out = vec![0u8; src.len()];
        decompress(Compression::Zlib, &packed, &mut out).unwrap();
        assert_eq!(out, src);
    }

    #[test]
    fn identity_borrows_input() {
        let src = b"raw bytes".to_vec();
        let packed = compress(Compression::None, &src).unwrap();
        assert!(matches!(packed, Cow::Borrowed(_)));
        assert_eq!(&*packed, &src[..]);
    }

    #[test]
    fn identity_length_mismatch_is_decode_error() {
        let mut out = vec![0u8; 4];
        let err = decompress(Compression::None, b"12345", &mut out).unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn zlib_wrong_declared_size_is_decode_error() {
        let packed = compress(Compression::Zlib, b"hello world").unwrap();

        let mut short = vec![0u8; 5];
        let err = decompress(Compression::Zlib, &packed, &mut short).unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));

        let mut long = vec![0u8; 64];
        let err = decompress(Compression::Zlib, &packed, &mut long).unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn unknown_algorithm_code_rejected() {
        let err = Compression::from_code(9).unwrap_err();
        assert!(matches!(err, CodecError::UnknownAlgorithm(9)));
    }

    #[test]
    fn metadata_blob_shape() {
        let mut items = BTreeMap::new();
        items.insert("FOO".to_string(), "bar".to_string());
        items.insert("STATISTICS_MINIMUM".to_string(), "99".to_string());

        let blob = pack_metadata(&items);
        assert_eq!(blob, b"FOO=bar\0\0");
    }

    #[test]
    fn metadata_all_reserved_packs_empty() {
        let mut items = BTreeMap::new();
        for key in RESERVED_KEYS {
            items.insert(key.to_string(), "x".to_string());
        }
        assert!(pack_metadata(&items).is_empty());
    }

    #[test]
    fn metadata_round_trip() {
        let mut items = BTreeMap::new();
        items.insert("AREA_OR_POINT".to_string(), "Area".to_string());
        items.insert("LAYER_TYPE".to_string(), "thematic".to_string());
        items.insert("empty".to_string(), String::new());

        let blob = pack_metadata(&items);
        assert_eq!(unpack_metadata(&blob), items);
    }

    #[test]
    fn unpack_ignores_tokens_without_equals() {
        let items = unpack_metadata(b"A=1\0garbage\0B=2\0\0");
        assert_eq!(items.len(), 2);
        assert_eq!(items["A"], "1");
        assert_eq!(items["B"], "2");
    }

    #[test]
    fn values_may_contain_equals() {
        let mut items = BTreeMap::new();
        items.insert("EXPR".to_string(), "a=b".to_string());
        let back = unpack_metadata(&pack_metadata(&items));
        assert_eq!(back["EXPR"], "a=b");
    }
}
