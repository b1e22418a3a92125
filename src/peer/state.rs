use tracing::trace;

use crate::error::ProtocolError;
use crate::peer::message::{Bitfield, Message};

/// Everything one worker knows about its peer and the piece in progress.
///
/// Owned by a single worker for the lifetime of its connection and only
/// changed through [`PeerSessionState::dispatch`] and the request pipeline.
#[derive(Debug, Clone)]
pub struct PeerSessionState {
    pub choked: bool,
    pub bitfield: Bitfield,
    /// Piece currently being downloaded.
    pub index: u32,
    /// Bytes received for the current piece.
    pub downloaded: u32,
    /// Offset of the next block to request.
    pub requested: u32,
    /// Requests sent and not yet answered.
    pub pending: u32,
    pub buffer: Vec<u8>,
}

impl PeerSessionState {
    /// Seeds the session from the peer's initial bitfield, padded so that
    /// later `Have` messages for any of `piece_count` pieces can be recorded.
    pub fn new(mut bitfield: Bitfield, piece_count: usize) -> Self {
        let needed = piece_count.div_ceil(8);
        if bitfield.bits.len() < needed {
            bitfield.bits.resize(needed, 0);
        }

        Self {
            choked: true,
            bitfield,
            index: 0,
            downloaded: 0,
            requested: 0,
            pending: 0,
            buffer: Vec::new(),
        }
    }

    pub fn has_piece(&self, index: usize) -> bool {
        self.bitfield.has_piece(index)
    }

    /// Resets the per-piece counters for a fresh attempt at `index`.
    pub fn begin_piece(&mut self, index: u32, length: u32) {
        self.index = index;
        self.downloaded = 0;
        self.requested = 0;
        self.pending = 0;
        self.buffer = vec![0; length as usize];
    }

    pub fn piece_length(&self) -> u32 {
        self.buffer.len() as u32
    }

    pub fn is_complete(&self) -> bool {
        self.downloaded >= self.piece_length()
    }

    /// Next block request to put on the wire, if the pipeline has room.
    pub fn next_request(&mut self, block_size: u32, max_pending: u32) -> Option<Message> {
        if self.choked || self.pending >= max_pending || self.requested >= self.piece_length() {
            return None;
        }

        let length = block_size.min(self.piece_length() - self.requested);
        let request = Message::Request {
            index: self.index,
            begin: self.requested,
            length,
        };
        self.requested += length;
        self.pending += 1;

        Some(request)
    }

    /// Applies one received message.
    pub fn dispatch(&mut self, message: Message) -> Result<(), ProtocolError> {
        match message {
            Message::Choke => self.choked = true,
            Message::Unchoke => self.choked = false,
            Message::Have(index) => self.bitfield.set_piece(index as usize),
            Message::Bitfield(mut bitfield) => {
                let needed = self.bitfield.bits.len();
                if bitfield.bits.len() < needed {
                    bitfield.bits.resize(needed, 0);
                }
                self.bitfield = bitfield;
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                let start = begin as usize;
                let end = start + block.len();
                if index != self.index || end > self.buffer.len() {
                    return Err(ProtocolError::UnexpectedBlock {
                        index,
                        begin,
                        len: block.len(),
                    });
                }

                self.buffer[start..end].copy_from_slice(&block);
                self.downloaded += block.len() as u32;
                self.pending = self.pending.saturating_sub(1);
            }
            other => trace!(message = other.name(), "ignoring message"),
        }
        Ok(())
    }

    /// Hands over the assembled piece, leaving an empty buffer behind.
    pub fn take_piece(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }
}
