use rand::{distributions::Alphanumeric, Rng};
use std::time::Duration;

/// 20 byte id this client uses in tracker announces and peer handshakes
pub type PeerId = [u8; 20];

/// Client id prefix in the Azureus style, "-" + two letters + four digits of version + "-"
pub const PEER_ID_PREFIX: &[u8; 8] = b"-SL0100-";

/// Default upper bound of simultaneously connected peers
pub const MAX_PEERS: usize = 30;

/// Startup configuration of a download session
///
/// Everything that would otherwise be global state (the peer id, the listen port, the timeouts)
/// lives here so it can be fixed in tests
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub peer_id: PeerId,

    /// TCP port we listen on and report to the tracker, 0 lets the OS pick one
    pub listen_port: u16,

    pub max_peers: usize,

    /// Bound on TCP connect plus handshake with a single peer
    pub connect_timeout: Duration,

    /// A connected peer that sends nothing for this long is dropped
    pub peer_idle_timeout: Duration,

    /// Delay before announcing again after a failed announce
    pub tracker_retry: Duration,

    /// Size of a single block request, the last block of a piece may be shorter
    pub block_size: u32,

    /// Number of block requests kept in flight per peer
    pub pipeline_depth: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            peer_id: generate_peer_id(),
            listen_port: 6881,
            max_peers: MAX_PEERS,
            connect_timeout: Duration::from_secs(2),
            peer_idle_timeout: Duration::from_secs(120),
            tracker_retry: Duration::from_secs(30),
            block_size: 16 * 1024,
            pipeline_depth: 5,
        }
    }
}

/// Generates a peer id made of [PEER_ID_PREFIX] followed by 12 random alphanumeric characters
pub fn generate_peer_id() -> PeerId {
    let mut peer_id = [0; 20];
    peer_id[..PEER_ID_PREFIX.len()].copy_from_slice(PEER_ID_PREFIX);
    let mut rng = rand::thread_rng();
    for byte in &mut peer_id[PEER_ID_PREFIX.len()..] {
        *byte = rng.sample(Alphanumeric);
    }
    peer_id
}
