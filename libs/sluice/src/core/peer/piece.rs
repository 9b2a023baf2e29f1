use super::messages::BlockRequest;
use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};

/// Holds all the raw data of a piece and the piece's index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    /// Zero based index of the piece
    pub index: u32,

    /// Raw data of the piece
    pub data: Bytes,
}

impl Piece {
    pub fn new(index: u32, data: Bytes) -> Self {
        Self { index, data }
    }

    /// Checks the validity of the piece by tallying it with the hash provided as parameter, usually
    /// we take hash of the piece from the ".torrent" file
    pub fn is_valid(&self, hash: &[u8; 20]) -> bool {
        let computed: [u8; 20] = Sha1::digest(&self.data).into();
        computed == *hash
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockState {
    Missing,
    Requested,
    Received,
}

/// Assembles a piece out of the blocks the peer sends us
///
/// Blocks are requested in order of their offset, but may arrive in any order
#[derive(Debug)]
pub(crate) struct PieceBuffer {
    index: u32,
    block_size: u32,
    data: BytesMut,
    blocks: Vec<BlockState>,
}

impl PieceBuffer {
    pub fn new(index: u32, length: u32, block_size: u32) -> Self {
        let block_count = length.div_ceil(block_size) as usize;
        let mut data = BytesMut::with_capacity(length as usize);
        data.put_bytes(0, length as usize);
        Self {
            index,
            block_size,
            data,
            blocks: vec![BlockState::Missing; block_count],
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Picks the first block nobody asked for yet and marks it as requested
    pub fn next_request(&mut self) -> Option<BlockRequest> {
        let slot = self.blocks.iter().position(|b| *b == BlockState::Missing)?;
        self.blocks[slot] = BlockState::Requested;

        let begin = slot as u32 * self.block_size;
        let length = self.block_size.min(self.data.len() as u32 - begin);
        Some(BlockRequest {
            index: self.index,
            begin,
            length,
        })
    }

    /// Copies a received block into the piece
    ///
    /// Returns false if the block doesn't line up with a block of this piece, or if that block
    /// has already been received
    pub fn insert(&mut self, begin: u32, block: &[u8]) -> bool {
        if begin % self.block_size != 0 {
            return false;
        }
        let slot = (begin / self.block_size) as usize;
        let Some(state) = self.blocks.get(slot).copied() else {
            return false;
        };
        let begin = begin as usize;
        let expected = (self.block_size as usize).min(self.data.len() - begin);
        if state == BlockState::Received || block.len() != expected {
            return false;
        }
        self.data[begin..begin + expected].copy_from_slice(block);
        self.blocks[slot] = BlockState::Received;
        true
    }

    /// Forgets about outstanding requests, a choking peer discards them
    pub fn reset_requested(&mut self) {
        for block in &mut self.blocks {
            if *block == BlockState::Requested {
                *block = BlockState::Missing;
            }
        }
    }

    /// Number of requested blocks that have not arrived yet
    pub fn in_flight(&self) -> usize {
        self.blocks.iter().filter(|b| **b == BlockState::Requested).count()
    }

    pub fn is_complete(&self) -> bool {
        self.blocks.iter().all(|b| *b == BlockState::Received)
    }

    pub fn into_piece(self) -> Piece {
        Piece::new(self.index, self.data.freeze())
    }
}
