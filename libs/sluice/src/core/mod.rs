pub mod config;
pub mod peer;
pub mod state;
pub mod torrent_file;
pub mod tracker;

use percent_encoding::{percent_encode, NON_ALPHANUMERIC};

pub use config::ClientConfig;
pub use torrent_file::{start_download, DownloadError, PieceSink, TorrentFile};

#[macro_export]
macro_rules! ACell {
    ($e : expr) => {
        crossbeam::atomic::AtomicCell::new($e)
    };
}

/// Encode the given bytes, usually an info hash or a peer id, into a percent encoded String
/// that can be placed in the query of a tracker URL
pub fn perc_encode(bytes: impl AsRef<[u8]>) -> String {
    percent_encode(bytes.as_ref(), NON_ALPHANUMERIC).to_string()
}
