use crate::core::config::ClientConfig;
use crate::core::peer::messages::Bitfield;
use crate::core::peer::piece::Piece;
use crate::core::peer::{Peer, PeerAddress, PeerEvent};
use crate::core::state::{DownState, State};
use crate::core::tracker::{AnnounceParams, Tracker, TrackerError};
use crate::parser::TorrentDescriptor;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, trace, warn};

/// Shortest wait between two announces, whatever interval the tracker asks for
const MIN_REANNOUNCE: Duration = Duration::from_secs(1);

/// Capacity of the channel carrying the signals of every peer to the coordinator
const EVENT_QUEUE: usize = 64;

/// Capacity of the channel carrying discovered addresses from the tracker to the pool
const DISCOVERY_QUEUE: usize = 64;

/// Where accepted pieces go, usually a file on disk
///
/// Called once for every piece the coordinator accepts. Returning an error, for instance because
/// the piece doesn't match its hash, leaves the piece missing so it gets downloaded again
#[async_trait]
pub trait PieceSink: Send + Sync {
    async fn persist(&self, piece: &Piece) -> io::Result<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("invalid tracker URL {0:?}")]
    InvalidTrackerUrl(String),

    #[error(transparent)]
    Tracker(TrackerError),

    #[error("could not listen on port {port}: {source}")]
    Listen { port: u16, source: io::Error },

    #[error("every peer channel closed before the download completed")]
    ChannelsClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// A slot is reserved while we connect and handshake
    Connecting,
    /// Handshake went through
    Active,
}

/// Peers we're connected or connecting to, keyed by address
#[derive(Debug)]
pub struct PeerPool {
    peers: HashMap<PeerAddress, PeerStatus>,
    max_peers: usize,
}

impl PeerPool {
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: HashMap::new(),
            max_peers,
        }
    }

    /// Reserves a slot for `addr`, false if the pool is full or already tracks that address
    pub fn admit(&mut self, addr: PeerAddress) -> bool {
        if self.peers.len() >= self.max_peers || self.peers.contains_key(&addr) {
            return false;
        }
        self.peers.insert(addr, PeerStatus::Connecting);
        true
    }

    pub fn mark_active(&mut self, addr: PeerAddress) {
        if let Some(status) = self.peers.get_mut(&addr) {
            *status = PeerStatus::Active;
        }
    }

    /// Frees the slot of `addr`, false if it wasn't tracked
    pub fn release(&mut self, addr: PeerAddress) -> bool {
        self.peers.remove(&addr).is_some()
    }

    pub fn status(&self, addr: &PeerAddress) -> Option<PeerStatus> {
        self.peers.get(addr).copied()
    }

    pub fn active_count(&self) -> usize {
        self.peers.values().filter(|s| **s == PeerStatus::Active).count()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// What peer tasks report back to the pool manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolUpdate {
    Connected(PeerAddress),
    Closed(PeerAddress),
}

/// What happened to a piece a peer handed in
#[derive(Debug)]
pub enum Acceptance {
    Accepted,
    /// The piece is already held
    Duplicate,
    /// The torrent has no piece with that index
    OutOfRange,
    /// The data isn't as long as the piece should be
    WrongLength,
    /// The sink refused the piece
    Rejected(io::Error),
}

/// Keeps track of the missing pieces and hands them out to peers
///
/// Only ever driven by the coordinator loop, which makes it the single writer of the piece store
#[derive(Debug)]
pub struct PieceDistributor {
    missing: BTreeSet<u32>,
    state: Arc<State>,
}

impl PieceDistributor {
    pub fn new(state: Arc<State>) -> Self {
        let missing = (0..state.pieces.len() as u32)
            .filter(|i| !state.pieces.is_held(*i))
            .collect();
        Self { missing, state }
    }

    pub fn missing_count(&self) -> usize {
        self.missing.len()
    }

    /// Lowest missing piece, among the ones the peer advertised if it advertised any
    pub fn next_wanted(&self, available: Option<&Bitfield>) -> Option<u32> {
        match available {
            None => self.missing.first().copied(),
            Some(bitfield) => self.missing.iter().copied().find(|i| bitfield.has(*i)),
        }
    }

    /// Hands a downloaded piece to the sink and stores it if it's still missing
    pub async fn accept(&mut self, piece: Piece, sink: &dyn PieceSink) -> Acceptance {
        let index = piece.index;
        let Some(expected) = self.state.descriptor.piece_size(index) else {
            return Acceptance::OutOfRange;
        };
        if !self.missing.contains(&index) {
            return Acceptance::Duplicate;
        }
        if piece.data.len() as u64 != expected {
            return Acceptance::WrongLength;
        }
        if let Err(err) = sink.persist(&piece).await {
            return Acceptance::Rejected(err);
        }
        if self.state.pieces.try_store(piece).is_err() {
            return Acceptance::Duplicate;
        }

        self.missing.remove(&index);
        self.state.set_pieces_downloaded(self.state.pieces_downloaded() + 1);
        self.state.set_bytes_complete(self.state.bytes_complete() + expected);
        Acceptance::Accepted
    }
}

/// A single torrent being downloaded
///
/// [TorrentFile::run] drives three tasks besides itself :
///
/// - the tracker loop, announcing and forwarding the peers it learns about
/// - the peer pool, connecting to those peers and running one task per connection
/// - the inbound listener, accepting and dropping incoming connections since we don't seed
///
/// while the coordinator loop answers the peers' want and have signals until no piece is missing
pub struct TorrentFile {
    /// The data that changes during runtime and gets observed by other entity to display the
    /// progress
    pub state: Arc<State>,

    config: Arc<ClientConfig>,

    tracker: Tracker,

    sink: Arc<dyn PieceSink>,
}

impl TorrentFile {
    pub fn new(
        descriptor: TorrentDescriptor,
        config: ClientConfig,
        sink: Arc<dyn PieceSink>,
    ) -> Result<Self, DownloadError> {
        let tracker = Tracker::new(&descriptor.tracker_url).map_err(|err| match err {
            TrackerError::InvalidUrl(url) => DownloadError::InvalidTrackerUrl(url),
            err => DownloadError::Tracker(err),
        })?;
        Ok(Self::with_tracker(descriptor, config, sink, tracker))
    }

    /// Same as [TorrentFile::new] with an already built [Tracker]
    pub fn with_tracker(
        descriptor: TorrentDescriptor,
        config: ClientConfig,
        sink: Arc<dyn PieceSink>,
        tracker: Tracker,
    ) -> Self {
        Self {
            state: Arc::new(State::new(Arc::new(descriptor))),
            config: Arc::new(config),
            tracker,
            sink,
        }
    }

    pub fn state(&self) -> Arc<State> {
        self.state.clone()
    }

    /// Downloads every piece, returns once the last one is accepted
    pub async fn run(self) -> Result<(), DownloadError> {
        let Self {
            state,
            config,
            tracker,
            sink,
        } = self;

        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.listen_port))
            .await
            .map_err(|source| DownloadError::Listen {
                port: config.listen_port,
                source,
            })?;
        let port = listener
            .local_addr()
            .map_err(|source| DownloadError::Listen {
                port: config.listen_port,
                source,
            })?
            .port();
        info!(
            torrent = %state.descriptor.name,
            info_hash = %state.descriptor.info_hash_hex(),
            pieces = state.descriptor.total_pieces(),
            port,
            "starting download"
        );

        let (events_tx, events) = mpsc::channel(EVENT_QUEUE);
        let (discovered_tx, discovered) = mpsc::channel(DISCOVERY_QUEUE);

        let mut tasks = JoinSet::new();
        tasks.spawn(accept_inbound(listener));
        tasks.spawn(tracker_loop(tracker, state.clone(), config.clone(), port, discovered_tx));
        tasks.spawn(manage_peers(state.clone(), config, discovered, events_tx));

        let result = distribute(PieceDistributor::new(state.clone()), events, sink.as_ref()).await;

        // Dropping the pool task drops every peer task it spawned
        tasks.shutdown().await;
        if result.is_ok() {
            state.set_d_state(DownState::Complete);
            info!(torrent = %state.descriptor.name, "download complete");
        }
        result
    }
}

/// Downloads the torrent described by `descriptor` into `sink`, returns once every piece is held
pub async fn start_download(
    descriptor: TorrentDescriptor,
    config: ClientConfig,
    sink: Arc<dyn PieceSink>,
) -> Result<(), DownloadError> {
    TorrentFile::new(descriptor, config, sink)?.run().await
}

/// The coordinator loop, answers want and have signals in the order they arrive
async fn distribute(
    mut distributor: PieceDistributor,
    mut events: mpsc::Receiver<PeerEvent>,
    sink: &dyn PieceSink,
) -> Result<(), DownloadError> {
    while distributor.missing_count() > 0 {
        let Some(event) = events.recv().await else {
            return Err(DownloadError::ChannelsClosed);
        };
        match event {
            PeerEvent::Want { from, available, reply } => {
                let wanted = distributor.next_wanted(available.as_ref());
                trace!(peer = %from, ?wanted, "assigning piece");
                // The peer may be gone already
                let _ = reply.send(wanted);
            }
            PeerEvent::Have { from, piece } => {
                let index = piece.index;
                match distributor.accept(piece, sink).await {
                    Acceptance::Accepted => debug!(
                        peer = %from,
                        index,
                        missing = distributor.missing_count(),
                        "accepted piece"
                    ),
                    Acceptance::Rejected(err) => warn!(peer = %from, index, error = %err, "piece rejected"),
                    other => debug!(peer = %from, index, outcome = ?other, "discarding piece"),
                }
            }
        }
    }
    Ok(())
}

/// Announces right away, then every time the tracker allows it, forwarding the peers it returns
async fn tracker_loop(
    mut tracker: Tracker,
    state: Arc<State>,
    config: Arc<ClientConfig>,
    port: u16,
    discovered: mpsc::Sender<PeerAddress>,
) {
    loop {
        let params = AnnounceParams {
            info_hash: state.descriptor.info_hash,
            peer_id: config.peer_id,
            port,
            uploaded: 0,
            downloaded: state.bytes_complete(),
            left: state.bytes_left(),
        };

        let wake_at = match tracker.announce(&params).await {
            Ok(response) => {
                state.set_last_tracker_error(None);
                for addr in response.peers {
                    if discovered.send(addr).await.is_err() {
                        return;
                    }
                }
                let floor = Instant::now() + MIN_REANNOUNCE;
                tracker.next_announce_at().map_or(floor, |next| next.max(floor))
            }
            Err(TrackerError::TooSoon { retry_in }) => Instant::now() + retry_in,
            Err(err) => {
                warn!(tracker = %tracker.address, error = %err, "announce failed");
                state.set_last_tracker_error(Some(err.to_string()));
                let retry = Instant::now() + config.tracker_retry;
                tracker.next_announce_at().map_or(retry, |next| next.max(retry))
            }
        };
        sleep_until(wake_at).await;
    }
}

/// Starts a connection for every new address while the pool has room, and keeps the pool in
/// sync with the connections as they complete their handshake and close
async fn manage_peers(
    state: Arc<State>,
    config: Arc<ClientConfig>,
    mut discovered: mpsc::Receiver<PeerAddress>,
    events: mpsc::Sender<PeerEvent>,
) {
    let (updates_tx, mut updates) = mpsc::unbounded_channel();
    let mut pool = PeerPool::new(config.max_peers);
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            Some(addr) = discovered.recv() => {
                if pool.admit(addr) {
                    sessions.spawn(peer_session(
                        addr,
                        state.descriptor.clone(),
                        config.clone(),
                        events.clone(),
                        updates_tx.clone(),
                    ));
                } else {
                    trace!(peer = %addr, pooled = pool.len(), "ignoring peer");
                }
            }
            Some(update) = updates.recv() => {
                match update {
                    PoolUpdate::Connected(addr) => {
                        pool.mark_active(addr);
                        if state.d_state() == DownState::Unknown {
                            state.set_d_state(DownState::Downloading);
                        }
                    }
                    PoolUpdate::Closed(addr) => {
                        pool.release(addr);
                    }
                }
                state.set_connected_peers(pool.active_count());
            }
            Some(_) = sessions.join_next() => {}
        }
    }
}

/// Connects to one peer and downloads from it until either side is done
async fn peer_session(
    addr: PeerAddress,
    descriptor: Arc<TorrentDescriptor>,
    config: Arc<ClientConfig>,
    events: mpsc::Sender<PeerEvent>,
    updates: mpsc::UnboundedSender<PoolUpdate>,
) {
    let mut peer = Peer::new(addr, descriptor.total_pieces());
    if peer
        .connect(&descriptor.info_hash, &config.peer_id, config.connect_timeout)
        .await
        .is_ok()
    {
        let _ = updates.send(PoolUpdate::Connected(addr));
        if let Err(err) = peer.run(descriptor, config, events).await {
            debug!(peer = %addr, error = %err, "connection closed");
        }
    }
    let _ = updates.send(PoolUpdate::Closed(addr));
}

/// We don't upload, incoming connections are closed as soon as they're accepted
async fn accept_inbound(listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                debug!(peer = %addr, "closing inbound connection");
                drop(socket);
            }
            Err(err) => {
                warn!(error = %err, "could not accept inbound connection");
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
