pub mod codec;
pub mod messages;
pub mod piece;

use crate::core::config::{ClientConfig, PeerId};
use crate::parser::torrent_parser::InfoHash;
use crate::parser::TorrentDescriptor;
use codec::PeerMessageCodec;
use futures::{SinkExt, StreamExt};
use messages::{Bitfield, Handshake, Message};
use piece::{Piece, PieceBuffer};
use std::fmt;
use std::io;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, trace};

/// IPv4 address and port of a remote peer, which is also what tells two peers apart
pub type PeerAddress = SocketAddrV4;

/// Lifecycle of the connection with a remote peer, it only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Haven't even made a TCP Connection
    Idle,

    /// Made or making a TCP Connection and exchanging Handshake messages
    Handshaking,

    /// Handshake went through, messages can be exchanged
    Connected,

    /// The socket is gone, either because something failed or because we closed it
    Closed,
}

/// Choke and interest flags of both sides of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerState {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
}

impl Default for PeerState {
    /// Every connection starts out choked and not interested on both sides
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeFailure {
    /// The peer closed the connection without answering
    Empty,
    /// The peer closed the connection in the middle of its Handshake
    Truncated,
    /// The peer serves another torrent
    InfoHashMismatch,
}

impl fmt::Display for HandshakeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "peer sent no handshake"),
            Self::Truncated => write!(f, "peer sent a truncated handshake"),
            Self::InfoHashMismatch => write!(f, "peer answered with another info hash"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection with the peer was already attempted")]
    AlreadyConnected,

    #[error("peer did not answer in time")]
    Timeout,

    #[error("could not open a TCP connection: {0}")]
    Refused(#[source] io::Error),

    #[error("handshake failed: {0}")]
    HandshakeFailed(HandshakeFailure),

    #[error("peer is not connected")]
    NotConnected,

    #[error("peer announced piece {0}, which the torrent doesn't have")]
    UnknownPiece(u32),

    #[error("peer sent a {0} byte bitfield, longer than the torrent needs")]
    OversizedBitfield(usize),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Signals a peer raises to the download coordinator
///
/// Both kinds travel on the same channel so the coordinator sees them in the order a peer raised
/// them
#[derive(Debug)]
pub enum PeerEvent {
    /// The peer is ready to download a piece, the coordinator replies with the index of a missing
    /// piece or None if it has nothing this peer can provide
    Want {
        from: PeerAddress,
        available: Option<Bitfield>,
        reply: oneshot::Sender<Option<u32>>,
    },

    /// The peer downloaded a whole piece
    Have { from: PeerAddress, piece: Piece },
}

/// A single remote peer and our TCP connection with it
#[derive(Debug)]
pub struct Peer {
    /// The socket address of the peer
    pub socket_adr: PeerAddress,

    state: ConnectionState,

    flags: PeerState,

    /// Peer id the remote sent in its Handshake
    remote_peer_id: Option<PeerId>,

    /// Pieces the peer told us it has, None until it sends a Bitfield or a Have message
    available: Option<Bitfield>,

    /// Number of pieces of the torrent, bounds what the peer can announce
    total_pieces: usize,

    stream: Option<Framed<TcpStream, PeerMessageCodec>>,
}

impl Peer {
    /// Creates a new peer instance with the given socket address of the peer, for a torrent of
    /// `total_pieces` pieces
    pub fn new(socket_adr: PeerAddress, total_pieces: usize) -> Self {
        Self {
            socket_adr,
            state: ConnectionState::Idle,
            flags: PeerState::default(),
            remote_peer_id: None,
            available: None,
            total_pieces,
            stream: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn flags(&self) -> PeerState {
        self.flags
    }

    pub fn remote_peer_id(&self) -> Option<&PeerId> {
        self.remote_peer_id.as_ref()
    }

    pub fn available(&self) -> Option<&Bitfield> {
        self.available.as_ref()
    }

    /// Opens a TCP connection with the peer and exchanges Handshake messages
    ///
    /// Opening the connection and the whole Handshake exchange share `connect_timeout`. Whatever
    /// goes wrong, the socket gets dropped and the peer ends up [ConnectionState::Closed], a peer
    /// is only ever connected once
    pub async fn connect(
        &mut self,
        info_hash: &InfoHash,
        peer_id: &PeerId,
        connect_timeout: Duration,
    ) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::Idle {
            return Err(ConnectionError::AlreadyConnected);
        }
        self.state = ConnectionState::Handshaking;

        let attempt = timeout(connect_timeout, Self::open(self.socket_adr, info_hash, peer_id)).await;
        match attempt.unwrap_or(Err(ConnectionError::Timeout)) {
            Ok((stream, remote_peer_id)) => {
                self.stream = Some(Framed::new(stream, PeerMessageCodec));
                self.remote_peer_id = Some(remote_peer_id);
                self.flags = PeerState::default();
                self.state = ConnectionState::Connected;
                debug!(peer = %self.socket_adr, "handshake complete");
                Ok(())
            }
            Err(err) => {
                self.state = ConnectionState::Closed;
                debug!(peer = %self.socket_adr, error = %err, "could not connect");
                Err(err)
            }
        }
    }

    async fn open(
        socket_adr: PeerAddress,
        info_hash: &InfoHash,
        peer_id: &PeerId,
    ) -> Result<(TcpStream, PeerId), ConnectionError> {
        let mut stream = TcpStream::connect(socket_adr)
            .await
            .map_err(ConnectionError::Refused)?;
        stream.write_all(&Handshake::new(*info_hash, *peer_id).to_bytes()).await?;

        let remote = read_handshake(&mut stream).await?;
        if remote.info_hash != *info_hash {
            return Err(ConnectionError::HandshakeFailed(HandshakeFailure::InfoHashMismatch));
        }
        Ok((stream, remote.peer_id))
    }

    /// Sends a message to the peer, keeping track of our own choke and interest flags
    pub async fn send(&mut self, message: Message) -> Result<(), ConnectionError> {
        let stream = self.stream.as_mut().ok_or(ConnectionError::NotConnected)?;
        let flags = &mut self.flags;
        match message {
            Message::Choke => flags.am_choking = true,
            Message::Unchoke => flags.am_choking = false,
            Message::Interested => flags.am_interested = true,
            Message::NotInterested => flags.am_interested = false,
            _ => {}
        }
        trace!(peer = %self.socket_adr, ?message, "sending");
        let sent = stream.send(message).await;
        if let Err(err) = sent {
            self.close();
            return Err(err.into());
        }
        Ok(())
    }

    /// Waits for the next message of the peer, for at most `idle`
    ///
    /// Flag changes, Have and Bitfield messages are applied to the peer before the message is
    /// handed back. A silent, closed or misbehaving peer closes the connection, and so does one
    /// announcing pieces past the end of the torrent.
    pub async fn receive(&mut self, idle: Duration) -> Result<Message, ConnectionError> {
        let stream = self.stream.as_mut().ok_or(ConnectionError::NotConnected)?;
        let received = match timeout(idle, stream.next()).await {
            Err(_) => Err(ConnectionError::Timeout),
            Ok(None) => Err(ConnectionError::Io(io::ErrorKind::UnexpectedEof.into())),
            Ok(Some(message)) => message.map_err(ConnectionError::Io),
        };
        let message = match received {
            Ok(message) => message,
            Err(err) => {
                self.close();
                return Err(err);
            }
        };

        trace!(peer = %self.socket_adr, ?message, "received");
        match &message {
            Message::Choke => self.flags.peer_choking = true,
            Message::Unchoke => self.flags.peer_choking = false,
            Message::Interested => self.flags.peer_interested = true,
            Message::NotInterested => self.flags.peer_interested = false,
            Message::Have(index) => {
                if *index as usize >= self.total_pieces {
                    self.close();
                    return Err(ConnectionError::UnknownPiece(*index));
                }
                self.available.get_or_insert_with(Bitfield::default).set(*index)
            }
            Message::Bitfield(bitfield) => {
                let len = bitfield.as_bytes().len();
                if len > self.total_pieces.div_ceil(8) {
                    self.close();
                    return Err(ConnectionError::OversizedBitfield(len));
                }
                self.available = Some(bitfield.clone())
            }
            _ => {}
        }
        Ok(message)
    }

    /// Drops the socket
    pub fn close(&mut self) {
        self.stream = None;
        self.state = ConnectionState::Closed;
    }

    /// Downloads pieces from a connected peer until the coordinator stops listening
    ///
    /// Steps :
    ///
    /// 1. Tell the peer we're interested and wait to be unchoked
    /// 2. Ask the coordinator which piece to download
    /// 3. Request the piece block by block and hand the assembled piece to the coordinator
    ///
    /// Returns once the coordinator is gone, or with the error that broke the connection
    pub async fn run(
        mut self,
        descriptor: Arc<TorrentDescriptor>,
        config: Arc<ClientConfig>,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<(), ConnectionError> {
        self.send(Message::Interested).await?;

        loop {
            while self.flags.peer_choking {
                self.receive(config.peer_idle_timeout).await?;
            }

            let (reply, assigned) = oneshot::channel();
            let want = PeerEvent::Want {
                from: self.socket_adr,
                available: self.available.clone(),
                reply,
            };
            if events.send(want).await.is_err() {
                break;
            }
            let Ok(assigned) = assigned.await else {
                break;
            };

            let assignment = assigned.and_then(|i| Some((i, u32::try_from(descriptor.piece_size(i)?).ok()?)));
            let Some((index, length)) = assignment else {
                // Nothing we need from this peer right now, wait for it to announce more pieces
                self.receive(config.peer_idle_timeout).await?;
                continue;
            };

            let piece = self.download_piece(index, length, &config).await?;
            debug!(peer = %self.socket_adr, index, "downloaded piece");
            if events
                .send(PeerEvent::Have {
                    from: self.socket_adr,
                    piece,
                })
                .await
                .is_err()
            {
                break;
            }
        }

        self.close();
        Ok(())
    }

    /// Requests the blocks of one piece, keeping up to `pipeline_depth` requests in flight
    ///
    /// NOTE : A choke discards every outstanding request, they're sent again after the next unchoke
    async fn download_piece(
        &mut self,
        index: u32,
        length: u32,
        config: &ClientConfig,
    ) -> Result<Piece, ConnectionError> {
        let mut buffer = PieceBuffer::new(index, length, config.block_size);
        loop {
            if buffer.is_complete() {
                return Ok(buffer.into_piece());
            }

            if !self.flags.peer_choking {
                while buffer.in_flight() < config.pipeline_depth {
                    let Some(request) = buffer.next_request() else {
                        break;
                    };
                    self.send(Message::Request(request)).await?;
                }
            }

            match self.receive(config.peer_idle_timeout).await? {
                Message::Piece(block) if block.index == buffer.index() => {
                    if !buffer.insert(block.begin, &block.data) {
                        trace!(peer = %self.socket_adr, index, begin = block.begin, "ignoring unexpected block");
                    }
                }
                Message::Choke => buffer.reset_requested(),
                _ => {}
            }
        }
    }
}

/// Reads the Handshake the peer sends back, byte by byte exactly as long as it is so that what
/// follows it stays in the socket for the message codec
async fn read_handshake(stream: &mut TcpStream) -> Result<Handshake, ConnectionError> {
    let pstrlen = match stream.read_u8().await {
        Ok(pstrlen) => pstrlen,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(ConnectionError::HandshakeFailed(HandshakeFailure::Empty))
        }
        Err(err) => return Err(err.into()),
    };

    let mut body = vec![0; pstrlen as usize + 48];
    match stream.read_exact(&mut body).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(ConnectionError::HandshakeFailed(HandshakeFailure::Truncated))
        }
        Err(err) => return Err(err.into()),
    }

    Handshake::from_body(pstrlen, &body).ok_or(ConnectionError::HandshakeFailed(HandshakeFailure::Truncated))
}
