use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::config::DownloadConfig;
use crate::error::{NetworkError, PeerError, ProtocolError};
use crate::peer::{MAX_FRAME_LEN, PSTR, PSTR_LEN, PeerAddress};

/// Reserved bytes, info hash and peer id following the protocol name.
const HANDSHAKE_TAIL: usize = 8 + 20 + 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub pstr: Vec<u8>,
    pub reserved: [u8; 8],
    pub infohash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(infohash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            pstr: PSTR.as_bytes().to_vec(),
            reserved: [0u8; 8],
            infohash,
            peer_id,
        }
    }

    /// Encoded size: `1 + pstr + 8 + 20 + 20`, 68 for the standard protocol.
    pub fn encoded_len(&self) -> usize {
        1 + self.pstr.len() + HANDSHAKE_TAIL
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.push(self.pstr.len() as u8);
        buf.extend_from_slice(&self.pstr);
        buf.extend_from_slice(&self.reserved);
        buf.extend_from_slice(&self.infohash);
        buf.extend_from_slice(&self.peer_id);

        buf
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, ProtocolError> {
        let pstr_len = *buf.first().ok_or(ProtocolError::HandshakeLength {
            expected: 1 + PSTR_LEN as usize + HANDSHAKE_TAIL,
            actual: 0,
        })? as usize;

        let expected = 1 + pstr_len + HANDSHAKE_TAIL;
        if buf.len() != expected {
            return Err(ProtocolError::HandshakeLength {
                expected,
                actual: buf.len(),
            });
        }

        let (pstr, rest) = buf[1..].split_at(pstr_len);
        let (reserved, rest) = rest.split_at(8);
        let (infohash, peer_id) = rest.split_at(20);

        let mut handshake = Self {
            pstr: pstr.to_vec(),
            reserved: [0u8; 8],
            infohash: [0u8; 20],
            peer_id: [0u8; 20],
        };
        handshake.reserved.copy_from_slice(reserved);
        handshake.infohash.copy_from_slice(infohash);
        handshake.peer_id.copy_from_slice(peer_id);

        Ok(handshake)
    }
}

/// Reads one length-prefixed frame.
///
/// A `prefix_len`-byte big-endian integer `n` is read first, then exactly
/// `n + extra` bytes. The returned buffer holds the prefix followed by the
/// body. Handshakes use `(1, 48)`; every wire message uses `(4, 0)`.
pub async fn read_framed<R>(
    reader: &mut R,
    prefix_len: usize,
    extra: usize,
) -> Result<Vec<u8>, PeerError>
where
    R: AsyncRead + Unpin,
{
    if prefix_len > 4 {
        return Err(ProtocolError::PrefixLength(prefix_len).into());
    }

    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix[4 - prefix_len..]).await?;
    let body_len = u32::from_be_bytes(prefix) as usize + extra;
    if body_len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(body_len).into());
    }

    let mut buf = Vec::with_capacity(prefix_len + body_len);
    buf.extend_from_slice(&prefix[4 - prefix_len..]);
    buf.resize(prefix_len + body_len, 0);
    reader.read_exact(&mut buf[prefix_len..]).await?;

    Ok(buf)
}

/// Sends `ours` and reads the peer's reply, which must name the same torrent.
pub async fn exchange_handshake<S>(
    stream: &mut S,
    ours: &Handshake,
    deadline: Duration,
) -> Result<Handshake, PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&ours.serialize()).await?;

    let reply = timeout(deadline, read_framed(stream, 1, HANDSHAKE_TAIL))
        .await
        .map_err(|_| NetworkError::Timeout("waiting for the handshake"))??;
    let theirs = Handshake::deserialize(&reply)?;

    if theirs.infohash != ours.infohash {
        return Err(ProtocolError::InfoHashMismatch.into());
    }
    Ok(theirs)
}

/// Dials `addr` and performs the handshake, returning the ready connection.
pub async fn perform_handshake(
    addr: PeerAddress,
    infohash: [u8; 20],
    peer_id: [u8; 20],
    config: &DownloadConfig,
) -> Result<TcpStream, PeerError> {
    let mut stream = timeout(config.connect_timeout, TcpStream::connect(addr.socket_addr()))
        .await
        .map_err(|_| NetworkError::Timeout("connecting"))?
        .map_err(|source| NetworkError::Connect { addr, source })?;

    let theirs = exchange_handshake(
        &mut stream,
        &Handshake::new(infohash, peer_id),
        config.piece_timeout,
    )
    .await?;
    debug!(
        peer = %addr,
        remote_id = %String::from_utf8_lossy(&theirs.peer_id),
        "handshake complete"
    );

    Ok(stream)
}
