use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::config::DownloadConfig;
use crate::error::{NetworkError, PeerError, ProtocolError};
use crate::peer::handshake::{perform_handshake, read_framed};
use crate::peer::message::Message;
use crate::peer::state::PeerSessionState;
use crate::peer::PeerAddress;
use crate::torrent::TorrentMetadata;

/// Reads and decodes the next wire message.
pub async fn read_message<S>(stream: &mut S) -> Result<Message, PeerError>
where
    S: AsyncRead + Unpin,
{
    let frame = read_framed(stream, 4, 0).await?;
    Ok(Message::deserialize(&frame)?)
}

/// An established, handshaken connection to one peer.
#[derive(Debug)]
pub struct PeerConnection<S = TcpStream> {
    addr: PeerAddress,
    stream: S,
    state: PeerSessionState,
    config: DownloadConfig,
}

impl PeerConnection<TcpStream> {
    /// Dials the peer, handshakes, and reads its bitfield.
    pub async fn connect(
        addr: PeerAddress,
        torrent: &TorrentMetadata,
        peer_id: [u8; 20],
        config: &DownloadConfig,
    ) -> Result<Self, PeerError> {
        let stream = perform_handshake(addr, torrent.info_hash, peer_id, config).await?;
        Self::establish(addr, stream, torrent.piece_count(), config).await
    }
}

impl<S> PeerConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Seeds the session from the peer's opening bitfield, then announces
    /// interest and unchokes the peer.
    pub async fn establish(
        addr: PeerAddress,
        mut stream: S,
        piece_count: usize,
        config: &DownloadConfig,
    ) -> Result<Self, PeerError> {
        let first = timeout(config.piece_timeout, read_message(&mut stream))
            .await
            .map_err(|_| NetworkError::Timeout("waiting for the bitfield"))??;

        let bitfield = match first {
            Message::Bitfield(bitfield) => bitfield,
            other => {
                return Err(ProtocolError::UnexpectedMessage {
                    expected: "bitfield",
                    found: other.name(),
                }
                .into());
            }
        };
        debug!(
            peer = %addr,
            available = bitfield.count_available(piece_count),
            "received bitfield"
        );

        let mut conn = Self {
            addr,
            stream,
            state: PeerSessionState::new(bitfield, piece_count),
            config: config.clone(),
        };
        conn.send(&Message::Interested).await?;
        conn.send(&Message::Unchoke).await?;

        Ok(conn)
    }

    pub fn address(&self) -> PeerAddress {
        self.addr
    }

    pub fn state(&self) -> &PeerSessionState {
        &self.state
    }

    pub fn has_piece(&self, index: usize) -> bool {
        self.state.has_piece(index)
    }

    pub async fn send(&mut self, message: &Message) -> Result<(), PeerError> {
        self.stream.write_all(&message.serialize()).await?;
        trace!(peer = %self.addr, message = message.name(), "sent");
        Ok(())
    }

    pub async fn read_message(&mut self) -> Result<Message, PeerError> {
        read_message(&mut self.stream).await
    }

    pub async fn send_have(&mut self, index: u32) -> Result<(), PeerError> {
        self.send(&Message::Have(index)).await
    }

    /// Downloads piece `index` of `length` bytes, bounded by the piece timeout.
    pub async fn download_piece(&mut self, index: u32, length: u32) -> Result<Vec<u8>, PeerError> {
        let deadline = self.config.piece_timeout;
        timeout(deadline, self.download_blocks(index, length))
            .await
            .map_err(|_| NetworkError::Timeout("downloading a piece"))?
    }

    async fn download_blocks(&mut self, index: u32, length: u32) -> Result<Vec<u8>, PeerError> {
        let (block_size, max_pending) = (self.config.block_size, self.config.max_pending);
        self.state.begin_piece(index, length);

        while !self.state.is_complete() {
            while let Some(request) = self.state.next_request(block_size, max_pending) {
                self.send(&request).await?;
            }

            let message = self.read_message().await?;
            trace!(peer = %self.addr, message = message.name(), "received");
            self.state.dispatch(message)?;
        }

        Ok(self.state.take_piece())
    }
}
