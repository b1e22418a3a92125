pub mod bencode_parser;
pub mod config;
pub mod download;
pub mod error;
pub mod peer;
pub mod piece;
pub mod torrent;
pub mod tracker;

// Re-export commonly used types and functions for easier access
pub use bencode_parser::{DecodeError, Value, decode, encode, parse};
pub use config::DownloadConfig;
pub use download::Downloader;
pub use error::Error;
pub use peer::PeerAddress;
pub use torrent::TorrentMetadata;
pub use tracker::{announce, generate_peer_id};
