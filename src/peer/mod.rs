use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

pub mod client;
pub mod handshake;
pub mod message;
pub mod state;

pub use client::PeerConnection;
pub use handshake::{Handshake, read_framed};
pub use message::{Bitfield, Message, MessageId};
pub use state::PeerSessionState;

const PSTR: &str = "BitTorrent protocol";
const PSTR_LEN: u8 = PSTR.len() as u8; // always 19

/// Largest frame accepted from a peer: well above a 16 KiB block or the
/// bitfield of any realistic torrent.
pub const MAX_FRAME_LEN: usize = 2 * 1024 * 1024;

/// A peer endpoint as returned by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    pub ip_addr: Ipv4Addr,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(ip_addr: Ipv4Addr, port: u16) -> Self {
        Self { ip_addr, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip_addr, self.port))
    }
}

impl From<SocketAddrV4> for PeerAddress {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(*addr.ip(), addr.port())
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip_addr, self.port)
    }
}
