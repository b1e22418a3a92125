use sha1::{Digest, Sha1};

use crate::torrent::TorrentMetadata;

/// One piece waiting to be downloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItem {
    pub index: u32,
    pub length: u32,
}

impl WorkItem {
    /// One item per piece; the last one is truncated to the remaining length.
    pub fn for_torrent(torrent: &TorrentMetadata) -> Vec<WorkItem> {
        (0..torrent.piece_count())
            .map(|index| WorkItem {
                index: index as u32,
                length: torrent.piece_size(index),
            })
            .collect()
    }
}

/// A downloaded piece whose hash has been checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceResult {
    pub index: u32,
    pub data: Vec<u8>,
}

pub fn hash_piece(data: &[u8]) -> [u8; 20] {
    Sha1::digest(data).into()
}

/// Checks `data` against the expected hash of piece `index`.
pub fn is_valid(data: &[u8], index: usize, hashes: &[[u8; 20]]) -> bool {
    hashes
        .get(index)
        .is_some_and(|expected| hash_piece(data) == *expected)
}
