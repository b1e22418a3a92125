use nom::{
    IResult, Parser,
    bytes::complete::{take, take_till},
    character::complete::{char, digit1},
    combinator::{all_consuming, opt, recognize},
    sequence::pair,
};
use std::{collections::BTreeMap, ops::Range};

use crate::bencode_parser::errors::{BencodeError, DecodeError, Reason};

type BenResult<'a, T = Value<'a>> = IResult<&'a [u8], T, BencodeError<&'a [u8]>>;

/// Dictionary key whose value span is kept verbatim for info-hash computation.
const INFO_KEY: &[u8] = b"info";

/// Deepest list/dictionary nesting accepted before decoding gives up.
pub const MAX_DEPTH: usize = 512;

/// A decoded bencode value borrowing its byte strings from the source buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value<'a> {
    Bytes(&'a [u8]),
    Integer(i64),
    List(Vec<Self>),
    Dictionary(Dictionary<'a>),
}

/// Exact location of an encoded value inside the decoded buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSpan<'a> {
    pub start: usize,
    pub end: usize,
    pub bytes: &'a [u8],
}

impl RawSpan<'_> {
    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }
}

#[derive(Debug, Clone, Default)]
pub struct Dictionary<'a> {
    entries: BTreeMap<&'a [u8], Value<'a>>,
    info: Option<RawSpan<'a>>,
}

impl<'a> Dictionary<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &[u8]) -> Option<&Value<'a>> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: &'a [u8], value: Value<'a>) -> Option<Value<'a>> {
        self.entries.insert(key, value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in ascending key order.
    pub fn iter(&self) -> impl Iterator<Item = (&'a [u8], &Value<'a>)> {
        self.entries.iter().map(|(key, value)| (*key, value))
    }

    /// Raw encoding of the value stored under `info`, when this dictionary
    /// was produced by the decoder and had such a key.
    pub fn info_span(&self) -> Option<RawSpan<'a>> {
        self.info
    }
}

// Two dictionaries are equal when they hold the same logical entries,
// wherever they were decoded from.
impl PartialEq for Dictionary<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl Eq for Dictionary<'_> {}

impl<'a> Value<'a> {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Bytes(_) => "byte string",
            Value::Integer(_) => "integer",
            Value::List(_) => "list",
            Value::Dictionary(_) => "dictionary",
        }
    }

    fn unexpected(&self, expected: &'static str) -> DecodeError {
        DecodeError::UnexpectedType {
            expected,
            found: self.kind(),
        }
    }

    pub fn as_bytes(&self) -> Result<&'a [u8], DecodeError> {
        match self {
            Value::Bytes(bytes) => Ok(bytes),
            other => Err(other.unexpected("byte string")),
        }
    }

    pub fn as_str(&self) -> Result<&'a str, DecodeError> {
        let bytes = self.as_bytes()?;
        std::str::from_utf8(bytes).map_err(|_| DecodeError::UnexpectedType {
            expected: "utf-8 string",
            found: "non utf-8 byte string",
        })
    }

    pub fn as_integer(&self) -> Result<i64, DecodeError> {
        match self {
            Value::Integer(n) => Ok(*n),
            other => Err(other.unexpected("integer")),
        }
    }

    pub fn as_list(&self) -> Result<&[Value<'a>], DecodeError> {
        match self {
            Value::List(items) => Ok(items),
            other => Err(other.unexpected("list")),
        }
    }

    pub fn as_dict(&self) -> Result<&Dictionary<'a>, DecodeError> {
        match self {
            Value::Dictionary(dict) => Ok(dict),
            other => Err(other.unexpected("dictionary")),
        }
    }
}

fn failure(input: &[u8], reason: Reason) -> nom::Err<BencodeError<&[u8]>> {
    nom::Err::Failure(BencodeError::new(input, reason))
}

fn delimiter(c: char, input: &[u8]) -> BenResult<'_, char> {
    char(c).parse(input)
}

fn until(byte: u8, input: &[u8]) -> BenResult<'_, &[u8]> {
    take_till(|b| b == byte).parse(input)
}

/// Parses a canonical unsigned decimal that must span the whole of `digits`.
fn length_prefix(digits: &[u8]) -> Option<usize> {
    let checked: BenResult<'_, &[u8]> = all_consuming(digit1).parse(digits);
    let (_, digits) = checked.ok()?;
    if digits.len() > 1 && digits[0] == b'0' {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// Parses a canonical signed decimal: no `+`, no `-0`, no leading zeros.
fn signed_integer(digits: &[u8]) -> Option<i64> {
    let checked: BenResult<'_, &[u8]> =
        all_consuming(recognize(pair(opt(char('-')), digit1))).parse(digits);
    let (_, digits) = checked.ok()?;

    let text = std::str::from_utf8(digits).ok()?;
    let magnitude = text.strip_prefix('-').unwrap_or(text);
    if magnitude.len() > 1 && magnitude.starts_with('0') {
        return None;
    }
    if text.starts_with('-') && magnitude == "0" {
        return None;
    }
    text.parse().ok()
}

/// Recursive descent over one buffer, so spans can be reported as offsets.
struct Decoder<'a> {
    source: &'a [u8],
}

impl<'a> Decoder<'a> {
    fn offset(&self, rest: &[u8]) -> usize {
        self.source.len() - rest.len()
    }

    fn value(&self, input: &'a [u8], depth: usize) -> BenResult<'a> {
        if depth > MAX_DEPTH {
            return Err(failure(input, Reason::TooDeep));
        }

        match input.first() {
            None => Err(failure(input, Reason::OutOfBounds)),
            Some(b'i') => self
                .integer(input)
                .map(|(rest, n)| (rest, Value::Integer(n))),
            Some(b'l') => self
                .list(input, depth)
                .map(|(rest, items)| (rest, Value::List(items))),
            Some(b'd') => self
                .dict(input, depth)
                .map(|(rest, dict)| (rest, Value::Dictionary(dict))),
            Some(b) if b.is_ascii_digit() => self
                .bytes(input)
                .map(|(rest, bytes)| (rest, Value::Bytes(bytes))),
            Some(&byte) => Err(failure(input, Reason::UnexpectedByte(byte))),
        }
    }

    fn bytes(&self, start: &'a [u8]) -> BenResult<'a, &'a [u8]> {
        let (input, digits) = until(b':', start)?;
        let (input, _) = delimiter(':', input)
            .map_err(|_| failure(start, Reason::MissingDelimiter(b':')))?;

        let length = length_prefix(digits).ok_or_else(|| failure(start, Reason::NotANumber))?;

        let taken: BenResult<'a, &'a [u8]> = take(length).parse(input);
        taken.map_err(|_| failure(input, Reason::OutOfBounds))
    }

    fn integer(&self, start: &'a [u8]) -> BenResult<'a, i64> {
        let (input, _) = delimiter('i', start)?;
        let (input, digits) = until(b'e', input)?;
        let (input, _) = delimiter('e', input)
            .map_err(|_| failure(start, Reason::MissingDelimiter(b'e')))?;

        let n = signed_integer(digits).ok_or_else(|| failure(start, Reason::NotANumber))?;
        Ok((input, n))
    }

    fn list(&self, start: &'a [u8], depth: usize) -> BenResult<'a, Vec<Value<'a>>> {
        let (mut input, _) = delimiter('l', start)?;
        let mut items = Vec::new();

        loop {
            match input.first() {
                None => return Err(failure(input, Reason::OutOfBounds)),
                Some(b'e') => return Ok((&input[1..], items)),
                Some(_) => {
                    let (rest, item) = self.value(input, depth + 1)?;
                    items.push(item);
                    input = rest;
                }
            }
        }
    }

    fn dict(&self, start: &'a [u8], depth: usize) -> BenResult<'a, Dictionary<'a>> {
        let (mut input, _) = delimiter('d', start)?;
        let mut dict = Dictionary::new();

        loop {
            match input.first() {
                None => return Err(failure(input, Reason::OutOfBounds)),
                Some(b'e') => return Ok((&input[1..], dict)),
                Some(b) if !b.is_ascii_digit() => {
                    return Err(failure(input, Reason::NonStringKey));
                }
                Some(_) => {
                    let (value_start, key) = self.bytes(input)?;
                    let (rest, value) = self.value(value_start, depth + 1)?;

                    if key == INFO_KEY {
                        let consumed = value_start.len() - rest.len();
                        dict.info = Some(RawSpan {
                            start: self.offset(value_start),
                            end: self.offset(rest),
                            bytes: &value_start[..consumed],
                        });
                    }

                    dict.insert(key, value);
                    input = rest;
                }
            }
        }
    }
}

/// Decodes one value starting at `offset` in `input`.
///
/// Returns the value and the number of bytes it occupied. Error offsets and
/// retained spans are absolute positions in `input`.
pub fn decode(input: &[u8], offset: usize) -> Result<(Value<'_>, usize), DecodeError> {
    let start = input
        .get(offset..)
        .ok_or(DecodeError::OutOfBounds { offset })?;

    let decoder = Decoder { source: input };
    let (rest, value) = decoder
        .value(start, 0)
        .map_err(|e| DecodeError::from_parser(input, e))?;

    Ok((value, start.len() - rest.len()))
}

/// Decodes the value at the start of `source`, ignoring anything after it.
pub fn parse(source: &[u8]) -> Result<Value<'_>, DecodeError> {
    decode(source, 0).map(|(value, _)| value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_decode_bytes() {
        let (value, consumed) = decode(b"4:spam", 0).unwrap();
        assert_eq!(value, Value::Bytes(b"spam"));
        assert_eq!(consumed, 6);

        let (value, _) = decode(b"11:hello world", 0).unwrap();
        assert_eq!(value.as_str().unwrap(), "hello world");
    }

    #[test]
    fn test_decode_empty_bytes() {
        let (value, consumed) = decode(b"0:", 0).unwrap();
        assert_eq!(value, Value::Bytes(b""));
        assert_eq!(consumed, 2);
    }

    #[test]
    fn test_decode_integer() {
        let (value, consumed) = decode(b"i-3e", 0).unwrap();
        assert_eq!(value, Value::Integer(-3));
        assert_eq!(consumed, 4);

        assert_eq!(parse(b"i3e").unwrap(), Value::Integer(3));
        assert_eq!(parse(b"i100e").unwrap(), Value::Integer(100));
        assert_eq!(parse(b"i0e").unwrap(), Value::Integer(0));
    }

    #[test]
    fn test_decode_list() {
        let value = parse(b"l4:spam4:eggse").unwrap();
        assert_eq!(
            value,
            Value::List(vec![Value::Bytes(b"spam"), Value::Bytes(b"eggs")])
        );

        let value = parse(b"l11:hello worldi3ei-3ee").unwrap();
        assert_eq!(
            value.as_list().unwrap(),
            &[
                Value::Bytes(b"hello world"),
                Value::Integer(3),
                Value::Integer(-3)
            ]
        );

        assert_eq!(parse(b"le").unwrap(), Value::List(vec![]));
    }

    #[test]
    fn test_decode_dictionary() {
        let value = parse(b"d3:cow3:moo4:spam4:eggse").unwrap();
        let dict = value.as_dict().unwrap();

        assert_eq!(dict.len(), 2);
        assert_eq!(dict.get(b"cow"), Some(&Value::Bytes(b"moo")));
        assert_eq!(dict.get(b"spam"), Some(&Value::Bytes(b"eggs")));
        assert!(dict.info_span().is_none());
    }

    #[test]
    fn test_decode_nested_dictionary() {
        let value = parse(b"d4:spaml1:a1:bee").unwrap();
        let spam = value.as_dict().unwrap().get(b"spam").unwrap();
        assert_eq!(
            spam,
            &Value::List(vec![Value::Bytes(b"a"), Value::Bytes(b"b")])
        );
        assert!(parse(b"de").unwrap().as_dict().unwrap().is_empty());
    }

    #[test]
    fn test_decode_keeps_info_span() {
        let source = b"d8:announce3:url4:infod4:name1:xee";
        let value = parse(source).unwrap();
        let span = value.as_dict().unwrap().info_span().unwrap();

        assert_eq!(span.bytes, b"d4:name1:xe");
        assert_eq!(&source[span.range()], b"d4:name1:xe");
        assert_eq!(span.start, 22);
    }

    #[test]
    fn test_decode_from_offset() {
        let source = b"xxi42e4:tail";
        let (value, consumed) = decode(source, 2).unwrap();
        assert_eq!(value, Value::Integer(42));
        assert_eq!(consumed, 4);

        let (value, consumed) = decode(source, 6).unwrap();
        assert_eq!(value, Value::Bytes(b"tail"));
        assert_eq!(consumed, 6);
    }

    #[test]
    fn test_decode_string_errors() {
        assert_matches!(
            parse(b"100"),
            Err(DecodeError::MissingDelimiter {
                delimiter: ':',
                offset: 0
            })
        );
        assert_matches!(parse(b"1abc:"), Err(DecodeError::NotANumber { .. }));
        assert_matches!(parse(b"100:"), Err(DecodeError::OutOfBounds { offset: 4 }));
    }

    #[test]
    fn test_decode_integer_errors() {
        assert_matches!(
            parse(b"i100"),
            Err(DecodeError::MissingDelimiter { delimiter: 'e', .. })
        );
        assert_matches!(parse(b"iabce"), Err(DecodeError::NotANumber { .. }));
        assert_matches!(parse(b"ie"), Err(DecodeError::NotANumber { .. }));
        assert_matches!(parse(b"i-0e"), Err(DecodeError::NotANumber { .. }));
        assert_matches!(parse(b"i03e"), Err(DecodeError::NotANumber { .. }));
    }

    #[test]
    fn test_decode_list_errors() {
        assert_matches!(parse(b"l"), Err(DecodeError::OutOfBounds { offset: 1 }));
        assert!(parse(b"li100").is_err());
        assert_matches!(parse(b"li100e"), Err(DecodeError::OutOfBounds { .. }));
    }

    #[test]
    fn test_decode_dictionary_errors() {
        assert_matches!(parse(b"d"), Err(DecodeError::OutOfBounds { .. }));
        assert_matches!(parse(b"dabc"), Err(DecodeError::NonStringKey { offset: 1 }));
        assert_matches!(parse(b"di100e"), Err(DecodeError::NonStringKey { .. }));
        assert_matches!(parse(b"d3:cow"), Err(DecodeError::OutOfBounds { offset: 6 }));
        assert_matches!(
            parse(b"d3:cowabc"),
            Err(DecodeError::UnexpectedByte { byte: b'a', .. })
        );
        assert_matches!(parse(b"d3:cow3:moo"), Err(DecodeError::OutOfBounds { .. }));
    }

    #[test]
    fn test_decode_unexpected_leading_byte() {
        assert_matches!(
            parse(b"x"),
            Err(DecodeError::UnexpectedByte { byte: b'x', offset: 0 })
        );
        assert_matches!(parse(b""), Err(DecodeError::OutOfBounds { offset: 0 }));
        assert_matches!(decode(b"i1e", 9), Err(DecodeError::OutOfBounds { offset: 9 }));
    }

    #[test]
    fn test_decode_length_prefix_must_be_canonical() {
        assert_matches!(parse(b"04:spam"), Err(DecodeError::NotANumber { offset: 0 }));
        assert_matches!(parse(b"00:"), Err(DecodeError::NotANumber { .. }));
        assert_matches!(parse(b"l4:spam04:eggse"), Err(DecodeError::NotANumber { offset: 7 }));
        assert_eq!(parse(b"0:").unwrap(), Value::Bytes(b""));
        assert_eq!(parse(b"10:0123456789").unwrap(), Value::Bytes(b"0123456789"));
    }

    #[test]
    fn test_decode_deep_nesting_is_rejected() {
        let source = vec![b'l'; 1_000_000];
        assert_matches!(
            parse(&source),
            Err(DecodeError::TooDeep { max: MAX_DEPTH, offset }) if offset == MAX_DEPTH + 1
        );

        let dicts = b"d1:a".repeat(10_000);
        assert_matches!(parse(&dicts), Err(DecodeError::TooDeep { .. }));
    }

    #[test]
    fn test_decode_nesting_at_the_limit() {
        let mut source = vec![b'l'; MAX_DEPTH + 1];
        source.extend(vec![b'e'; MAX_DEPTH + 1]);

        let mut value = &parse(&source).unwrap();
        let mut depth = 0;
        while let Value::List(items) = value {
            match items.first() {
                Some(inner) => value = inner,
                None => break,
            }
            depth += 1;
        }
        assert_eq!(depth, MAX_DEPTH);
    }

    #[test]
    fn test_accessor_type_mismatch() {
        let value = parse(b"i7e").unwrap();
        assert_matches!(
            value.as_bytes(),
            Err(DecodeError::UnexpectedType {
                expected: "byte string",
                found: "integer"
            })
        );
        assert_matches!(value.as_dict(), Err(DecodeError::UnexpectedType { .. }));
        assert_eq!(value.as_integer().unwrap(), 7);
    }
}
