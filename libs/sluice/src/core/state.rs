use crate::core::peer::piece::Piece;
use crate::parser::TorrentDescriptor;
use crate::ACell;
use crossbeam::atomic::AtomicCell;
use paste::paste;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

/// Used to generate getter and setter for AtomicCell<T> types
/// Eg.
/// If there is field like
/// xyz : AtomicCell<i32>
///
/// Then we can simply use following code in the impl block
/// cell_get_set!(xyz: i32);
///
/// It wll generate two methods to get and set value from and in the AtomicCell
///
/// pub fn xyz(&self){/*...*/}
/// pub fn set_xyz(&self, value){/*...*/}
macro_rules! cell_get_set {
    ($field:ident: $ty:ty) => {
        pub fn $field(&self) -> $ty {
            self.$field.load()
        }

        paste! {
            pub fn [<set_ $field>](&self, val: $ty) {
                self.$field.store(val)
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownState {
    /// Nothing has been downloaded yet, the tracker might still be getting contacted
    Unknown,
    /// At least one peer is connected and pieces are being requested
    Downloading,
    /// Every piece is held
    Complete,
}

/// One slot per piece, each of which can be filled exactly once
///
/// Only the piece distribution loop writes into the store, everyone else can read it without
/// taking a lock
#[derive(Debug)]
pub struct PieceStore {
    slots: Vec<OnceLock<Piece>>,
}

impl PieceStore {
    pub fn new(total_pieces: usize) -> Self {
        Self {
            slots: (0..total_pieces).map(|_| OnceLock::new()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_held(&self, index: u32) -> bool {
        self.get(index).is_some()
    }

    pub fn get(&self, index: u32) -> Option<&Piece> {
        self.slots.get(index as usize).and_then(OnceLock::get)
    }

    /// Fills the slot of the piece, handing the piece back if it's out of range or already held
    pub(crate) fn try_store(&self, piece: Piece) -> Result<(), Piece> {
        match self.slots.get(piece.index as usize) {
            Some(slot) => slot.set(piece),
            None => Err(piece),
        }
    }

    pub fn held_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.get().is_some()).count()
    }
}

/// A thread shareable state of the torrent being downloaded.
///
/// Data that can be showed to the user is stored in [State]
#[derive(Debug)]
pub struct State {
    pub descriptor: Arc<TorrentDescriptor>,

    /// Every piece accepted so far
    pub pieces: PieceStore,

    d_state: AtomicCell<DownState>,

    /// Total downloaded pieces
    pieces_downloaded: AtomicCell<usize>,

    /// Total bytes downloaded, counting only accepted pieces
    bytes_complete: AtomicCell<u64>,

    /// Peers that completed the handshake and are still connected
    connected_peers: AtomicCell<usize>,

    /// Why the last announce failed, cleared by the next successful one
    last_tracker_error: Mutex<Option<String>>,
}

impl State {
    pub fn new(descriptor: Arc<TorrentDescriptor>) -> Self {
        let pieces = PieceStore::new(descriptor.total_pieces());
        let d_state = if pieces.is_empty() {
            DownState::Complete
        } else {
            DownState::Unknown
        };
        Self {
            descriptor,
            pieces,
            d_state: ACell!(d_state),
            pieces_downloaded: ACell!(0),
            bytes_complete: ACell!(0),
            connected_peers: ACell!(0),
            last_tracker_error: Mutex::new(None),
        }
    }

    /// Bytes still to be downloaded, reported to the tracker as "left"
    pub fn bytes_left(&self) -> u64 {
        self.descriptor.total_length().saturating_sub(self.bytes_complete())
    }

    cell_get_set!(d_state: DownState);

    cell_get_set!(pieces_downloaded: usize);

    cell_get_set!(bytes_complete: u64);

    cell_get_set!(connected_peers: usize);

    pub fn last_tracker_error(&self) -> Option<String> {
        self.last_tracker_error.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_last_tracker_error(&self, error: Option<String>) {
        *self.last_tracker_error.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn slots_are_filled_once() {
        let store = PieceStore::new(2);
        assert!(store.try_store(Piece::new(1, Bytes::from_static(b"first"))).is_ok());

        let rejected = store.try_store(Piece::new(1, Bytes::from_static(b"second"))).unwrap_err();
        assert_eq!(rejected.data, Bytes::from_static(b"second"));
        assert_eq!(store.get(1).unwrap().data, Bytes::from_static(b"first"));

        assert!(store.try_store(Piece::new(2, Bytes::new())).is_err());
        assert!(!store.is_held(0));
        assert_eq!(store.held_count(), 1);
    }
}
