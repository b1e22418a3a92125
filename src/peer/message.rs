use crate::error::ProtocolError;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),
            4 => Ok(Self::Have),
            5 => Ok(Self::Bitfield),
            6 => Ok(Self::Request),
            7 => Ok(Self::Piece),
            8 => Ok(Self::Cancel),
            _ => Err(()),
        }
    }
}

/// A peer wire message. `KeepAlive` is the empty frame with no id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bitfield),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    /// A message id this client does not implement; carried so it can be skipped.
    Unknown { id: u8, payload: Vec<u8> },
}

fn be_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn triple(index: u32, begin: u32, length: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(12);
    payload.extend_from_slice(&index.to_be_bytes());
    payload.extend_from_slice(&begin.to_be_bytes());
    payload.extend_from_slice(&length.to_be_bytes());
    payload
}

impl Message {
    pub fn id(&self) -> Option<u8> {
        let id = match self {
            Message::KeepAlive => return None,
            Message::Choke => MessageId::Choke,
            Message::Unchoke => MessageId::Unchoke,
            Message::Interested => MessageId::Interested,
            Message::NotInterested => MessageId::NotInterested,
            Message::Have(_) => MessageId::Have,
            Message::Bitfield(_) => MessageId::Bitfield,
            Message::Request { .. } => MessageId::Request,
            Message::Piece { .. } => MessageId::Piece,
            Message::Cancel { .. } => MessageId::Cancel,
            Message::Unknown { id, .. } => return Some(*id),
        };
        Some(id as u8)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::KeepAlive => "keep-alive",
            Message::Choke => "choke",
            Message::Unchoke => "unchoke",
            Message::Interested => "interested",
            Message::NotInterested => "not interested",
            Message::Have(_) => "have",
            Message::Bitfield(_) => "bitfield",
            Message::Request { .. } => "request",
            Message::Piece { .. } => "piece",
            Message::Cancel { .. } => "cancel",
            Message::Unknown { .. } => "unknown",
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => Vec::new(),
            Message::Have(index) => index.to_be_bytes().to_vec(),
            Message::Bitfield(bitfield) => bitfield.bits.clone(),
            Message::Request {
                index,
                begin,
                length,
            }
            | Message::Cancel {
                index,
                begin,
                length,
            } => triple(*index, *begin, *length),
            Message::Piece {
                index,
                begin,
                block,
            } => {
                let mut payload = Vec::with_capacity(8 + block.len());
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(block);
                payload
            }
            Message::Unknown { payload, .. } => payload.clone(),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let Some(id) = self.id() else {
            return vec![0; 4];
        };

        let payload = self.payload();
        let total_len = 1 + payload.len(); // 1 byte for ID
        let mut buf = Vec::with_capacity(4 + total_len);

        buf.extend_from_slice(&(total_len as u32).to_be_bytes());
        buf.push(id);
        buf.extend_from_slice(&payload);

        buf
    }

    /// Parses one complete frame, length prefix included.
    pub fn deserialize(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < 4 {
            return Err(ProtocolError::FrameLength {
                expected: 4,
                actual: buf.len(),
            });
        }

        let len = be_u32(buf, 0) as usize;
        if buf.len() != 4 + len {
            return Err(ProtocolError::FrameLength {
                expected: 4 + len,
                actual: buf.len(),
            });
        }
        if len == 0 {
            return Ok(Message::KeepAlive);
        }

        let id = buf[4];
        let payload = &buf[5..];
        let Ok(kind) = MessageId::try_from(id) else {
            return Ok(Message::Unknown {
                id,
                payload: payload.to_vec(),
            });
        };

        let expect_len = |kind: &'static str, ok: bool| {
            if ok {
                Ok(())
            } else {
                Err(ProtocolError::Payload {
                    kind,
                    len: payload.len(),
                })
            }
        };

        let message = match kind {
            MessageId::Choke => {
                expect_len("choke", payload.is_empty())?;
                Message::Choke
            }
            MessageId::Unchoke => {
                expect_len("unchoke", payload.is_empty())?;
                Message::Unchoke
            }
            MessageId::Interested => {
                expect_len("interested", payload.is_empty())?;
                Message::Interested
            }
            MessageId::NotInterested => {
                expect_len("not interested", payload.is_empty())?;
                Message::NotInterested
            }
            MessageId::Have => {
                expect_len("have", payload.len() == 4)?;
                Message::Have(be_u32(payload, 0))
            }
            MessageId::Bitfield => Message::Bitfield(Bitfield {
                bits: payload.to_vec(),
            }),
            MessageId::Request => {
                expect_len("request", payload.len() == 12)?;
                Message::Request {
                    index: be_u32(payload, 0),
                    begin: be_u32(payload, 4),
                    length: be_u32(payload, 8),
                }
            }
            MessageId::Piece => {
                expect_len("piece", payload.len() >= 8)?;
                Message::Piece {
                    index: be_u32(payload, 0),
                    begin: be_u32(payload, 4),
                    block: payload[8..].to_vec(),
                }
            }
            MessageId::Cancel => {
                expect_len("cancel", payload.len() == 12)?;
                Message::Cancel {
                    index: be_u32(payload, 0),
                    begin: be_u32(payload, 4),
                    length: be_u32(payload, 8),
                }
            }
        };

        Ok(message)
    }
}

/// Which pieces a peer can serve, one bit per piece, most significant bit first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    pub bits: Vec<u8>, // raw bytes
}

impl Bitfield {
    pub fn has_piece(&self, index: usize) -> bool {
        let byte = index / 8;
        let bit = 7 - (index % 8); // MSB first
        if byte >= self.bits.len() {
            return false;
        }
        self.bits[byte] & (1 << bit) != 0
    }

    pub fn set_piece(&mut self, index: usize) {
        let byte = index / 8;
        let bit = 7 - (index % 8);
        if byte < self.bits.len() {
            self.bits[byte] |= 1 << bit;
        }
    }

    pub fn from_piece_count(count: usize) -> Self {
        let num_bytes = count.div_ceil(8);
        Bitfield {
            bits: vec![0; num_bytes],
        }
    }

    /// Bitfield advertising every one of `count` pieces.
    pub fn full(count: usize) -> Self {
        let mut bitfield = Self::from_piece_count(count);
        for index in 0..count {
            bitfield.set_piece(index);
        }
        bitfield
    }

    pub fn count_available(&self, piece_count: usize) -> usize {
        (0..piece_count).filter(|&i| self.has_piece(i)).count()
    }
}

impl From<Bitfield> for Message {
    fn from(b: Bitfield) -> Self {
        Message::Bitfield(b)
    }
}
