use async_trait::async_trait;
use sluice::core::peer::piece::Piece;
use sluice::core::PieceSink;
use sluice::parser::TorrentDescriptor;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

/// Writes verified pieces at their offset in a single output file
///
/// Multi-file torrents are written as one blob, the concatenation of their files
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file: Mutex<File>,
    piece_hashes: Vec<[u8; 20]>,
    bytes_per_piece: u64,
}

impl FileSink {
    /// Creates the output file in `dir`, named after the torrent and sized to its content
    pub async fn create(dir: &Path, descriptor: &TorrentDescriptor) -> io::Result<Self> {
        fs::create_dir_all(dir).await?;

        // The name comes from the torrent file, keep it from pointing outside of `dir`
        let name = Path::new(&descriptor.name)
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(descriptor.info_hash_hex()));
        let path = dir.join(name);

        let file = OpenOptions::new().create(true).write(true).open(&path).await?;
        file.set_len(descriptor.total_length()).await?;

        Ok(Self {
            path,
            file: Mutex::new(file),
            piece_hashes: descriptor.piece_hashes.clone(),
            bytes_per_piece: descriptor.bytes_per_piece,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PieceSink for FileSink {
    async fn persist(&self, piece: &Piece) -> io::Result<()> {
        let hash = self.piece_hashes.get(piece.index as usize).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("no piece with index {}", piece.index))
        })?;
        if !piece.is_valid(hash) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("piece {} does not match its hash", piece.index),
            ));
        }

        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(piece.index as u64 * self.bytes_per_piece)).await?;
        file.write_all(&piece.data).await?;
        file.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha1::{Digest, Sha1};
    use sluice::parser::{BencodeValue, Dictionary};

    const CONTENT: &[u8; 10] = b"abcdefghij";

    fn descriptor() -> TorrentDescriptor {
        let pieces: Vec<u8> = CONTENT
            .chunks(4)
            .flat_map(|chunk| {
                let hash: [u8; 20] = Sha1::digest(chunk).into();
                hash
            })
            .collect();
        let info = Dictionary::new()
            .with("name", BencodeValue::string("../escape.bin"))
            .with("length", BencodeValue::integer(CONTENT.len() as u64))
            .with("piece length", BencodeValue::integer(4))
            .with("pieces", BencodeValue::Bytes(pieces));
        let torrent = Dictionary::new()
            .with("announce", BencodeValue::string("http://tracker.test/announce"))
            .with("info", info.into());
        TorrentDescriptor::from_bytes(&BencodeValue::Dict(torrent).encode()).unwrap()
    }

    fn piece(index: u32, data: &'static [u8]) -> Piece {
        Piece::new(index, data.into())
    }

    fn scratch_dir(test: &str) -> PathBuf {
        std::env::temp_dir().join(format!("sluice-{}-{test}", std::process::id()))
    }

    #[tokio::test]
    async fn writes_verified_pieces_at_their_offset() {
        let dir = scratch_dir("offsets");
        let sink = FileSink::create(&dir, &descriptor()).await.unwrap();
        assert_eq!(sink.path(), dir.join("escape.bin"));

        sink.persist(&piece(2, b"ij")).await.unwrap();
        sink.persist(&piece(0, b"abcd")).await.unwrap();
        sink.persist(&piece(1, b"efgh")).await.unwrap();

        assert_eq!(fs::read(sink.path()).await.unwrap(), CONTENT.to_vec());
        fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn refuses_pieces_that_do_not_match_their_hash() {
        let dir = scratch_dir("mismatch");
        let sink = FileSink::create(&dir, &descriptor()).await.unwrap();

        let err = sink.persist(&piece(0, b"abcX")).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        let err = sink.persist(&piece(7, b"abcd")).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        // Nothing was written, the file is still all zeroes
        assert_eq!(fs::read(sink.path()).await.unwrap(), vec![0; 10]);
        fs::remove_dir_all(&dir).await.unwrap();
    }
}
