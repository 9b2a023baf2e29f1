//! Bencode encoding and decoding
//!
//! Decoded dictionaries remember the order their keys had on the wire and the byte span every
//! value occupied in the input, so a sub-structure such as the `info` dictionary of a ".torrent"
//! file can be hashed over its exact original octets.

use super::FormatError;
use std::ops::Range;

/// Deepest nesting of lists and dictionaries the decoder accepts
pub const MAX_DEPTH: usize = 256;

/// A bencoded value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeValue {
    Integer(u64),
    Bytes(Vec<u8>),
    List(Vec<BencodeValue>),
    Dict(Dictionary),
}

impl BencodeValue {
    /// Create a byte string value from a &str
    pub fn string(s: &str) -> Self {
        Self::Bytes(s.as_bytes().to_vec())
    }

    pub fn integer(i: u64) -> Self {
        Self::Integer(i)
    }

    /// Name of the variant, used in error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Integer(_) => "integer",
            Self::Bytes(_) => "byte string",
            Self::List(_) => "list",
            Self::Dict(_) => "dictionary",
        }
    }

    pub fn as_integer(&self) -> Result<u64, FormatError> {
        match self {
            Self::Integer(i) => Ok(*i),
            other => Err(other.wrong_type("integer")),
        }
    }

    pub fn as_bytes(&self) -> Result<&[u8], FormatError> {
        match self {
            Self::Bytes(bytes) => Ok(bytes),
            other => Err(other.wrong_type("byte string")),
        }
    }

    /// Narrows to a byte string that must also be valid UTF-8
    pub fn as_str(&self) -> Result<&str, FormatError> {
        std::str::from_utf8(self.as_bytes()?).map_err(|_| FormatError::InvalidUtf8)
    }

    pub fn as_list(&self) -> Result<&[BencodeValue], FormatError> {
        match self {
            Self::List(list) => Ok(list),
            other => Err(other.wrong_type("list")),
        }
    }

    pub fn as_dict(&self) -> Result<&Dictionary, FormatError> {
        match self {
            Self::Dict(dict) => Ok(dict),
            other => Err(other.wrong_type("dictionary")),
        }
    }

    fn wrong_type(&self, expected: &'static str) -> FormatError {
        FormatError::WrongType {
            expected,
            found: self.kind(),
        }
    }

    /// Encode to bencoded bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    /// Encode into an existing buffer
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Integer(i) => {
                buf.push(b'i');
                buf.extend_from_slice(i.to_string().as_bytes());
                buf.push(b'e');
            }
            Self::Bytes(bytes) => encode_bytes(bytes, buf),
            Self::List(list) => {
                buf.push(b'l');
                for item in list {
                    item.encode_into(buf);
                }
                buf.push(b'e');
            }
            Self::Dict(dict) => {
                buf.push(b'd');
                for entry in &dict.entries {
                    encode_bytes(&entry.key, buf);
                    entry.value.encode_into(buf);
                }
                buf.push(b'e');
            }
        }
    }
}

impl From<Dictionary> for BencodeValue {
    fn from(dict: Dictionary) -> Self {
        Self::Dict(dict)
    }
}

fn encode_bytes(bytes: &[u8], buf: &mut Vec<u8>) {
    buf.extend_from_slice(bytes.len().to_string().as_bytes());
    buf.push(b':');
    buf.extend_from_slice(bytes);
}

#[derive(Debug, Clone)]
struct Entry {
    key: Vec<u8>,
    value: BencodeValue,
    /// Where the value sat in the decoded input, None for entries built in code
    span: Option<Range<usize>>,
}

/// A bencoded dictionary
///
/// Dictionaries built with [Dictionary::insert] keep their keys sorted, which is the canonical
/// form. Dictionaries produced by the decoder keep the key order of the input verbatim, so
/// encoding them reproduces the original bytes.
#[derive(Debug, Clone, Default)]
pub struct Dictionary {
    entries: Vec<Entry>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a key-value pair, replacing the value of an existing key in place
    pub fn insert(&mut self, key: impl Into<Vec<u8>>, value: BencodeValue) -> Option<BencodeValue> {
        let key = key.into();
        if let Some(entry) = self.entries.iter_mut().find(|e| e.key == key) {
            entry.span = None;
            return Some(std::mem::replace(&mut entry.value, value));
        }
        let at = self.entries.partition_point(|e| e.key < key);
        self.entries.insert(at, Entry { key, value, span: None });
        None
    }

    /// Insert a key-value pair (builder pattern)
    pub fn with(mut self, key: &str, value: BencodeValue) -> Self {
        self.insert(key.as_bytes(), value);
        self
    }

    pub fn get(&self, key: &[u8]) -> Option<&BencodeValue> {
        self.entry(key).map(|e| &e.value)
    }

    /// Like [Dictionary::get], but a missing key is a [FormatError::MissingKey]
    pub fn require(&self, key: &str) -> Result<&BencodeValue, FormatError> {
        self.get(key.as_bytes())
            .ok_or_else(|| FormatError::MissingKey(key.to_owned()))
    }

    /// Byte range the value of `key` occupied in the input this dictionary was decoded from
    pub fn span(&self, key: &[u8]) -> Option<Range<usize>> {
        self.entry(key).and_then(|e| e.span.clone())
    }

    /// Iterates the entries in encoding order
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &BencodeValue)> {
        self.entries.iter().map(|e| (e.key.as_slice(), &e.value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(&self, key: &[u8]) -> Option<&Entry> {
        self.entries.iter().find(|e| e.key == key)
    }
}

// Spans only describe where a value came from, two dictionaries with the same entries in the
// same order are equal
impl PartialEq for Dictionary {
    fn eq(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .zip(&other.entries)
                .all(|(a, b)| a.key == b.key && a.value == b.value)
    }
}

impl Eq for Dictionary {}

/// Decodes the top-level dictionary of a ".torrent" file or a tracker response
///
/// An empty input decodes to an empty dictionary. Anything following the top-level dictionary is
/// ignored.
pub fn decode(input: &[u8]) -> Result<BencodeValue, FormatError> {
    match input.first() {
        None => Ok(BencodeValue::Dict(Dictionary::new())),
        Some(b'd') => Decoder::new(input).decode_value(),
        Some(&other) => Err(FormatError::NotADictionary(other)),
    }
}

/// Streaming decoder over a byte slice, offsets in errors and spans are relative to its start
pub struct Decoder<'a> {
    input: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0, depth: 0 }
    }

    /// Offset of the next byte to be read
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Decodes a single value of any variant, picked by a one byte lookahead
    pub fn decode_value(&mut self) -> Result<BencodeValue, FormatError> {
        match self.peek() {
            None => Err(FormatError::UnexpectedEof(self.pos)),
            Some(b'i') => self.decode_integer().map(BencodeValue::Integer),
            Some(b'l') => self.decode_list(),
            Some(b'd') => self.decode_dict(),
            Some(_) => self.decode_bytes().map(|b| BencodeValue::Bytes(b.to_vec())),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    /// Returns the bytes up to `terminator` and moves past it
    fn take_until(&mut self, terminator: u8) -> Result<&'a [u8], FormatError> {
        let rest = &self.input[self.pos..];
        match rest.iter().position(|&b| b == terminator) {
            Some(len) => {
                self.pos += len + 1;
                Ok(&rest[..len])
            }
            None => Err(FormatError::UnexpectedEof(self.input.len())),
        }
    }

    // i<base 10 digits>e
    fn decode_integer(&mut self) -> Result<u64, FormatError> {
        let start = self.pos;
        self.pos += 1;
        let digits = self.take_until(b'e')?;
        parse_decimal(digits).ok_or(FormatError::InvalidInteger(start))
    }

    // <length>:<bytes>
    fn decode_bytes(&mut self) -> Result<&'a [u8], FormatError> {
        let start = self.pos;
        let digits = self.take_until(b':')?;
        let declared = parse_decimal(digits)
            .and_then(|len| usize::try_from(len).ok())
            .ok_or(FormatError::InvalidLength(start))?;

        let available = self.input.len() - self.pos;
        if declared > available {
            return Err(FormatError::Truncated {
                offset: start,
                declared,
                available,
            });
        }
        let bytes = &self.input[self.pos..self.pos + declared];
        self.pos += declared;
        Ok(bytes)
    }

    fn decode_list(&mut self) -> Result<BencodeValue, FormatError> {
        let start = self.enter()?;
        let mut list = Vec::new();
        loop {
            match self.peek() {
                None => {
                    return Err(FormatError::Unterminated {
                        kind: "list",
                        offset: start,
                    })
                }
                Some(b'e') => break,
                Some(_) => list.push(self.decode_value()?),
            }
        }
        self.leave();
        Ok(BencodeValue::List(list))
    }

    fn decode_dict(&mut self) -> Result<BencodeValue, FormatError> {
        let start = self.enter()?;
        let mut dict = Dictionary::new();
        loop {
            match self.peek() {
                None => {
                    return Err(FormatError::Unterminated {
                        kind: "dictionary",
                        offset: start,
                    })
                }
                Some(b'e') => break,
                Some(b'0'..=b'9') => {
                    let key = self.decode_bytes()?.to_vec();
                    let value_start = self.pos;
                    let value = self.decode_value()?;
                    if dict.entry(&key).is_some() {
                        return Err(FormatError::DuplicateKey(String::from_utf8_lossy(&key).into_owned()));
                    }
                    // Wire order is kept as is, it's what the original bytes hash to
                    dict.entries.push(Entry {
                        key,
                        value,
                        span: Some(value_start..self.pos),
                    });
                }
                Some(_) => return Err(FormatError::InvalidKey(self.pos)),
            }
        }
        self.leave();
        Ok(BencodeValue::Dict(dict))
    }

    /// Steps over the opening 'l' or 'd' and returns its offset
    fn enter(&mut self) -> Result<usize, FormatError> {
        if self.depth == MAX_DEPTH {
            return Err(FormatError::TooDeep(MAX_DEPTH));
        }
        self.depth += 1;
        let start = self.pos;
        self.pos += 1;
        Ok(start)
    }

    /// Steps over the closing 'e'
    fn leave(&mut self) {
        self.depth -= 1;
        self.pos += 1;
    }
}

/// Unsigned base 10 with no sign and no leading zero, except for "0" itself
fn parse_decimal(digits: &[u8]) -> Option<u64> {
    match digits {
        [] => None,
        [b'0', _, ..] => None,
        _ if !digits.iter().all(u8::is_ascii_digit) => None,
        _ => std::str::from_utf8(digits).ok()?.parse().ok(),
    }
}
