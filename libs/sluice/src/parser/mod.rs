pub mod bencode;
pub mod torrent_parser;

pub use bencode::{BencodeValue, Dictionary};
pub use torrent_parser::{load_torrent, LoadError, TorrentDescriptor};

/// Everything that can be wrong with bencoded input, whether it's the raw encoding itself or the
/// shape of a decoded ".torrent" file or tracker response
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("expected a bencoded dictionary, found leading byte {0:#04x}")]
    NotADictionary(u8),

    #[error("unexpected end of input at offset {0}")]
    UnexpectedEof(usize),

    #[error("malformed length prefix at offset {0}")]
    InvalidLength(usize),

    #[error("byte string at offset {offset} declares {declared} bytes but only {available} remain")]
    Truncated {
        offset: usize,
        declared: usize,
        available: usize,
    },

    #[error("invalid integer at offset {0}")]
    InvalidInteger(usize),

    #[error("unterminated {kind} starting at offset {offset}")]
    Unterminated { kind: &'static str, offset: usize },

    #[error("dictionary key at offset {0} is not a byte string")]
    InvalidKey(usize),

    #[error("duplicate dictionary key {0:?}")]
    DuplicateKey(String),

    #[error("values nested deeper than {0} levels")]
    TooDeep(usize),

    #[error("expected {expected}, found {found}")]
    WrongType {
        expected: &'static str,
        found: &'static str,
    },

    #[error("byte string is not valid UTF-8")]
    InvalidUtf8,

    #[error("missing required key `{0}`")]
    MissingKey(String),

    #[error("`piece length` must be greater than zero")]
    ZeroPieceLength,

    #[error("`pieces` is {0} bytes long, which is not a multiple of 20")]
    InvalidPieces(usize),

    #[error("`{key}` is {value}, which is more than {max}")]
    OutOfRange {
        key: &'static str,
        value: u64,
        max: u64,
    },

    #[error("content length does not fit in 64 bits")]
    LengthOverflow,

    #[error("torrent declares {declared} pieces but its length needs {expected}")]
    PieceCountMismatch { declared: usize, expected: u64 },

    #[error("compact peer list is {0} bytes long, which is not a multiple of 6")]
    InvalidCompactPeers(usize),

    #[error("invalid peer address {0:?}")]
    InvalidPeerAddress(String),
}
