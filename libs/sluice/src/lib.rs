/// Contains items to let someone simply provide a raw torrent input source and get the
/// abstractions built out of its contents
pub mod parser;

/// Contains the main data structures and their abstractions to drive the download of a torrent
pub mod core;
