use std::{fmt, fs, ops::Range, path::Path};

use sha1::{Digest, Sha1};
use tracing::debug;

use crate::bencode_parser::{Dictionary, parse};
use crate::error::TorrentError;

/// Size of one SHA-1 piece hash inside `pieces`.
pub const HASH_LEN: usize = 20;

/// A validated single-file torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentMetadata {
    pub announce: String,
    pub info_hash: [u8; 20],
    pub pieces: Vec<[u8; 20]>,
    pub piece_length: u32,
    pub length: u64,
    pub name: String,
}

fn get_string(dict: &Dictionary, key: &'static str) -> Result<String, TorrentError> {
    let value = dict
        .get(key.as_bytes())
        .ok_or(TorrentError::MissingField(key))?;
    let text = value
        .as_str()
        .map_err(|source| TorrentError::WrongType { field: key, source })?;

    if text.is_empty() {
        return Err(TorrentError::EmptyField(key));
    }
    Ok(text.to_string())
}

fn get_positive(dict: &Dictionary, key: &'static str) -> Result<u64, TorrentError> {
    let value = dict
        .get(key.as_bytes())
        .ok_or(TorrentError::MissingField(key))?;
    let n = value
        .as_integer()
        .map_err(|source| TorrentError::WrongType { field: key, source })?;

    u64::try_from(n)
        .ok()
        .filter(|n| *n > 0)
        .ok_or(TorrentError::EmptyField(key))
}

/// Splits `bytes` into consecutive `N`-byte chunks.
///
/// Fails when the length is not an exact multiple of `N`; on success the
/// chunks concatenate back to `bytes`.
pub fn split_pieces<const N: usize>(bytes: &[u8]) -> Result<Vec<[u8; N]>, TorrentError> {
    if bytes.len() % N != 0 {
        return Err(TorrentError::InvalidPiecesLength {
            len: bytes.len(),
            chunk: N,
        });
    }

    Ok(bytes
        .chunks_exact(N)
        .map(|chunk| {
            let mut out = [0u8; N];
            out.copy_from_slice(chunk);
            out
        })
        .collect())
}

impl TorrentMetadata {
    /// Parse torrent from file path
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TorrentError> {
        let data = fs::read(path)?;
        Self::from_bytes(&data)
    }

    /// Parse torrent from byte slice
    pub fn from_bytes(data: &[u8]) -> Result<Self, TorrentError> {
        let top_level = parse(data)?;
        let dict = top_level
            .as_dict()
            .map_err(|source| TorrentError::WrongType {
                field: "<root>",
                source,
            })?;

        let announce = get_string(dict, "announce")?;
        let info = dict
            .get(b"info")
            .ok_or(TorrentError::MissingField("info"))?
            .as_dict()
            .map_err(|source| TorrentError::WrongType {
                field: "info",
                source,
            })?;
        let info_span = dict
            .info_span()
            .ok_or(TorrentError::MissingField("info"))?;

        let name = get_string(info, "name")?;
        let length = get_positive(info, "length")?;
        let piece_length = u32::try_from(get_positive(info, "piece length")?)
            .map_err(|_| TorrentError::EmptyField("piece length"))?;

        let pieces_bytes = info
            .get(b"pieces")
            .ok_or(TorrentError::MissingField("pieces"))?
            .as_bytes()
            .map_err(|source| TorrentError::WrongType {
                field: "pieces",
                source,
            })?;
        if pieces_bytes.is_empty() {
            return Err(TorrentError::EmptyField("pieces"));
        }
        let pieces = split_pieces::<HASH_LEN>(pieces_bytes)?;

        if pieces.len() as u64 != length.div_ceil(piece_length as u64) {
            return Err(TorrentError::PieceCountMismatch {
                hashes: pieces.len(),
                length,
                piece_length,
            });
        }

        let info_hash: [u8; 20] = Sha1::digest(info_span.bytes).into();
        debug!(
            name = %name,
            pieces = pieces.len(),
            piece_length,
            length,
            "loaded torrent metadata"
        );

        Ok(Self {
            announce,
            info_hash,
            pieces,
            piece_length,
            length,
            name,
        })
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Byte range of `index` within the content; empty past the last piece.
    pub fn piece_range(&self, index: usize) -> Range<u64> {
        let start = (index as u64 * self.piece_length as u64).min(self.length);
        let end = (start + self.piece_length as u64).min(self.length);
        start..end
    }

    /// Length of `index`; only the final piece may be shorter than nominal.
    pub fn piece_size(&self, index: usize) -> u32 {
        let range = self.piece_range(index);
        (range.end - range.start) as u32
    }

    /// Info hash as lowercase hex, the form trackers and clients display.
    pub fn info_hash_hex(&self) -> String {
        self.info_hash.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Display for TorrentMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "name:         {}", self.name)?;
        writeln!(f, "announce:     {}", self.announce)?;
        writeln!(f, "length:       {}", self.length)?;
        writeln!(f, "piece length: {}", self.piece_length)?;
        writeln!(f, "pieces:       {}", self.pieces.len())?;
        write!(f, "info hash:    {}", self.info_hash_hex())
    }
}
