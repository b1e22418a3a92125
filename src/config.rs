use std::time::Duration;

/// Standard block size requested from peers (16 KiB).
pub const BLOCK_SIZE: u32 = 16384;
/// Outstanding block requests allowed per peer.
pub const MAX_PENDING: u32 = 5;
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
pub const PIECE_TIMEOUT: Duration = Duration::from_secs(30);
/// Port reported to the tracker.
pub const DEFAULT_PORT: u16 = 6881;

/// Tunables for a download run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadConfig {
    /// Bound on dialing a peer.
    pub connect_timeout: Duration,
    /// Bound on the handshake exchange and on each whole piece download.
    pub piece_timeout: Duration,
    pub block_size: u32,
    pub max_pending: u32,
    pub port: u16,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            piece_timeout: PIECE_TIMEOUT,
            block_size: BLOCK_SIZE,
            max_pending: MAX_PENDING,
            port: DEFAULT_PORT,
        }
    }
}
