use super::bencode::{self, BencodeValue, Dictionary};
use super::FormatError;
use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};
use std::{fs, io};

/// SHA-1 of the bencoded "info" dictionary, identifies a torrent on the tracker and in handshakes
pub type InfoHash = [u8; 20];

/// Length of a single SHA-1 piece hash inside "pieces"
const HASH_LEN: usize = 20;

/// Error types while loading a ".torrent" file from disk
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// Thrown when there is some issue while reading the file path provided
    #[error("could not read {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },

    /// Thrown when the bytes of the file are not a valid ".torrent" description
    #[error("{path:?} is not a valid torrent file: {source}")]
    Format { path: PathBuf, source: FormatError },
}

/// Everything the client needs to know about a torrent, taken from a ".torrent" file
///
/// Immutable once created, it's shared between the tracker, the peers and the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentDescriptor {
    /// Suggested name of the file, or of the directory for multi-file torrents
    pub name: String,

    /// URL of the tracker from the "announce" field
    pub tracker_url: String,

    pub info_hash: InfoHash,

    /// Size of every piece but the last one, which may be shorter
    pub bytes_per_piece: u64,

    /// One SHA-1 hash per piece, in piece order
    pub piece_hashes: Vec<[u8; 20]>,

    total_length: u64,
}

impl TorrentDescriptor {
    /// Reads and parses the ".torrent" file at the given path
    ///
    /// ```no_run
    /// use sluice::parser::TorrentDescriptor;
    ///
    /// match TorrentDescriptor::from_torrent_file("x/y/z/zz.torrent") {
    ///     Ok(descriptor) => println!("{} has {} pieces", descriptor.name, descriptor.total_pieces()),
    ///     Err(err) => eprintln!("{err}"),
    /// }
    /// ```
    pub fn from_torrent_file(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|source| LoadError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::from_bytes(&bytes).map_err(|source| LoadError::Format {
            path: path.to_owned(),
            source,
        })
    }

    /// Builds the descriptor from the raw bytes of a ".torrent" file
    ///
    /// The info hash is computed over the exact bytes "info" occupied in the input, so torrents
    /// whose "info" keys are not in canonical order still hash to what every other client sees
    ///
    /// Stricter than the bare format in a few ways:
    ///
    /// - when "length" or "files" is present, the number of piece hashes must be exactly what
    ///   that length needs, otherwise [FormatError::PieceCountMismatch]
    /// - "piece length" and the number of pieces must fit in a u32, as they do on the wire, and
    ///   the content length in a u64, otherwise [FormatError::OutOfRange] or
    ///   [FormatError::LengthOverflow]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        let root = bencode::decode(bytes)?;
        let root = root.as_dict()?;

        let tracker_url = root.require("announce")?.as_str()?.to_owned();
        let info = root.require("info")?.as_dict()?;

        let name = String::from_utf8_lossy(info.require("name")?.as_bytes()?).into_owned();

        let bytes_per_piece = info.require("piece length")?.as_integer()?;
        if bytes_per_piece == 0 {
            return Err(FormatError::ZeroPieceLength);
        }
        check_fits_u32("piece length", bytes_per_piece)?;

        let pieces = info.require("pieces")?.as_bytes()?;
        if pieces.len() % HASH_LEN != 0 {
            return Err(FormatError::InvalidPieces(pieces.len()));
        }
        let piece_hashes: Vec<[u8; 20]> = pieces
            .chunks_exact(HASH_LEN)
            .map(|chunk| {
                let mut hash = [0; HASH_LEN];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();
        check_fits_u32("pieces", piece_hashes.len() as u64)?;

        let total_length = match declared_length(info)? {
            Some(length) => {
                let expected = length.div_ceil(bytes_per_piece);
                if expected != piece_hashes.len() as u64 {
                    return Err(FormatError::PieceCountMismatch {
                        declared: piece_hashes.len(),
                        expected,
                    });
                }
                length
            }
            None => bytes_per_piece
                .checked_mul(piece_hashes.len() as u64)
                .ok_or(FormatError::LengthOverflow)?,
        };

        // `require` above already proved "info" is present, so it has a span
        let span = root
            .span(b"info")
            .ok_or_else(|| FormatError::MissingKey("info".into()))?;
        let info_hash: InfoHash = Sha1::digest(&bytes[span]).into();

        Ok(Self {
            name,
            tracker_url,
            info_hash,
            bytes_per_piece,
            piece_hashes,
            total_length,
        })
    }

    pub fn total_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Size of the whole content in bytes
    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Size in bytes of the piece at `index`, None if the torrent has no such piece
    pub fn piece_size(&self, index: u32) -> Option<u64> {
        let index = index as u64;
        let total_pieces = self.total_pieces() as u64;
        if index >= total_pieces {
            return None;
        }
        if index + 1 < total_pieces {
            return Some(self.bytes_per_piece);
        }
        Some(self.total_length - self.bytes_per_piece * index)
    }

    /// The info hash as lowercase hex, the way it's usually shown to users
    pub fn info_hash_hex(&self) -> String {
        self.info_hash.iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Content length from "length" (single file) or the sum of "files[*].length" (multi file)
fn declared_length(info: &Dictionary) -> Result<Option<u64>, FormatError> {
    if let Some(length) = info.get(b"length") {
        return length.as_integer().map(Some);
    }
    let Some(files) = info.get(b"files") else {
        return Ok(None);
    };
    let mut total = 0u64;
    for file in files.as_list()? {
        let length = file.as_dict()?.require("length")?.as_integer()?;
        total = total.checked_add(length).ok_or(FormatError::LengthOverflow)?;
    }
    Ok(Some(total))
}

/// Piece indexes and block offsets are u32 on the peer wire
fn check_fits_u32(key: &'static str, value: u64) -> Result<(), FormatError> {
    if value > u32::MAX as u64 {
        return Err(FormatError::OutOfRange {
            key,
            value,
            max: u32::MAX as u64,
        });
    }
    Ok(())
}

/// Loads the torrent at `path`, see [TorrentDescriptor::from_torrent_file]
pub fn load_torrent(path: impl AsRef<Path>) -> Result<TorrentDescriptor, LoadError> {
    TorrentDescriptor::from_torrent_file(path)
}

impl From<&TorrentDescriptor> for BencodeValue {
    /// Rebuilds a canonical "info" dictionary, mainly useful to produce torrent files in tests
    fn from(descriptor: &TorrentDescriptor) -> Self {
        let pieces: Vec<u8> = descriptor.piece_hashes.iter().flatten().copied().collect();
        Dictionary::new()
            .with("name", BencodeValue::string(&descriptor.name))
            .with("length", BencodeValue::integer(descriptor.total_length))
            .with("piece length", BencodeValue::integer(descriptor.bytes_per_piece))
            .with("pieces", BencodeValue::Bytes(pieces))
            .into()
    }
}
