use nom::error::{ErrorKind, ParseError};
use thiserror::Error;

/// Reason a bencode parser stopped, recorded against the remaining input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reason {
    MissingDelimiter(u8),
    NotANumber,
    OutOfBounds,
    NonStringKey,
    UnexpectedByte(u8),
    TooDeep,
}

/// Error type threaded through the nom parsers.
///
/// It keeps the unconsumed input so the absolute offset can be recovered once
/// parsing unwinds back to the caller's buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BencodeError<I> {
    pub(crate) input: I,
    pub(crate) reason: Reason,
}

impl<I> BencodeError<I> {
    pub(crate) fn new(input: I, reason: Reason) -> Self {
        Self { input, reason }
    }
}

impl<'a> ParseError<&'a [u8]> for BencodeError<&'a [u8]> {
    fn from_error_kind(input: &'a [u8], kind: ErrorKind) -> Self {
        let reason = match (kind, input.first()) {
            (_, None) => Reason::OutOfBounds,
            (ErrorKind::Digit, _) => Reason::NotANumber,
            (_, Some(&byte)) => Reason::UnexpectedByte(byte),
        };
        Self::new(input, reason)
    }

    fn append(_: &'a [u8], _: ErrorKind, other: Self) -> Self {
        other
    }
}

/// Failure to decode bencode, or to read a decoded value as the wrong shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("missing '{delimiter}' delimiter for value starting at offset {offset}")]
    MissingDelimiter { delimiter: char, offset: usize },

    #[error("malformed number at offset {offset}")]
    NotANumber { offset: usize },

    #[error("input ended before the value was complete (offset {offset})")]
    OutOfBounds { offset: usize },

    #[error("dictionary key at offset {offset} is not a byte string")]
    NonStringKey { offset: usize },

    #[error("nesting deeper than {max} levels at offset {offset}")]
    TooDeep { max: usize, offset: usize },

    #[error("unexpected byte {byte:#04x} at offset {offset}")]
    UnexpectedByte { byte: u8, offset: usize },

    #[error("expected {expected}, found {found}")]
    UnexpectedType {
        expected: &'static str,
        found: &'static str,
    },
}

impl DecodeError {
    /// Converts a parser error into a public error with an offset into `source`.
    pub(crate) fn from_parser(source: &[u8], err: nom::Err<BencodeError<&[u8]>>) -> Self {
        let err = match err {
            nom::Err::Error(e) | nom::Err::Failure(e) => e,
            nom::Err::Incomplete(_) => {
                return DecodeError::OutOfBounds {
                    offset: source.len(),
                };
            }
        };
        let offset = source.len() - err.input.len();

        match err.reason {
            Reason::MissingDelimiter(delimiter) => DecodeError::MissingDelimiter {
                delimiter: delimiter as char,
                offset,
            },
            Reason::NotANumber => DecodeError::NotANumber { offset },
            Reason::OutOfBounds => DecodeError::OutOfBounds { offset },
            Reason::NonStringKey => DecodeError::NonStringKey { offset },
            Reason::UnexpectedByte(byte) => DecodeError::UnexpectedByte { byte, offset },
            Reason::TooDeep => DecodeError::TooDeep {
                max: crate::bencode_parser::parser::MAX_DEPTH,
                offset,
            },
        }
    }
}
