use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use sha1::{Digest, Sha1};
use sluice::core::peer::codec::PeerMessageCodec;
use sluice::core::peer::messages::{Bitfield, Block, Handshake, Message, HANDSHAKE_LEN};
use sluice::core::peer::piece::Piece;
use sluice::core::state::DownState;
use sluice::core::tracker::Tracker;
use sluice::core::{ClientConfig, PieceSink, TorrentFile};
use sluice::parser::{BencodeValue, Dictionary, TorrentDescriptor};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

const CONTENT: &[u8; 30] = b"0123456789abcdefghijABCDEFGHIJ";
const PIECE_LENGTH: usize = 20;

fn torrent(tracker_url: &str) -> TorrentDescriptor {
    let pieces: Vec<u8> = CONTENT
        .chunks(PIECE_LENGTH)
        .flat_map(|piece| {
            let hash: [u8; 20] = Sha1::digest(piece).into();
            hash
        })
        .collect();
    let info = Dictionary::new()
        .with("name", BencodeValue::string("content.bin"))
        .with("length", BencodeValue::integer(CONTENT.len() as u64))
        .with("piece length", BencodeValue::integer(PIECE_LENGTH as u64))
        .with("pieces", BencodeValue::Bytes(pieces));
    let torrent = Dictionary::new()
        .with("announce", BencodeValue::string(tracker_url))
        .with("info", info.into());
    TorrentDescriptor::from_bytes(&BencodeValue::Dict(torrent).encode()).unwrap()
}

/// Answers every announce with the same compact peer list and reports the request targets
async fn stub_tracker(peer: SocketAddr) -> (String, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    let SocketAddr::V4(peer) = peer else {
        unreachable!("peer listens on IPv4")
    };
    let mut body = b"d8:intervali1800e5:peers6:".to_vec();
    body.extend_from_slice(&peer.ip().octets());
    body.extend_from_slice(&peer.port().to_be_bytes());
    body.push(b'e');

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let request = String::from_utf8_lossy(&request).into_owned();
            let _ = tx.send(request.split_whitespace().nth(1).unwrap_or_default().to_owned());

            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(&body).await.unwrap();
        }
    });

    (format!("http://{addr}/announce"), rx)
}

/// A seeder holding both pieces, reports the piece index of every request it serves
async fn stub_seeder(listener: TcpListener, info_hash: [u8; 20], requested: mpsc::UnboundedSender<u32>) {
    let (mut socket, _) = listener.accept().await.unwrap();
    let mut handshake = [0; HANDSHAKE_LEN];
    socket.read_exact(&mut handshake).await.unwrap();
    assert_eq!(Handshake::from_body(handshake[0], &handshake[1..]).unwrap().info_hash, info_hash);
    socket
        .write_all(&Handshake::new(info_hash, *b"-XX0001-seedseedseed").to_bytes())
        .await
        .unwrap();

    let mut framed = Framed::new(socket, PeerMessageCodec);
    framed.send(Message::Bitfield(Bitfield::from_bytes(vec![0b1100_0000]))).await.unwrap();
    framed.send(Message::Unchoke).await.unwrap();

    while let Some(Ok(message)) = framed.next().await {
        if let Message::Request(request) = message {
            let start = request.index as usize * PIECE_LENGTH + request.begin as usize;
            let data = Bytes::copy_from_slice(&CONTENT[start..start + request.length as usize]);
            let _ = requested.send(request.index);
            let block = Block {
                index: request.index,
                begin: request.begin,
                data,
            };
            if framed.send(Message::Piece(block)).await.is_err() {
                break;
            }
        }
    }
}

struct VerifyingSink {
    hashes: Vec<[u8; 20]>,
    persisted: Mutex<Vec<u32>>,
}

#[async_trait]
impl PieceSink for VerifyingSink {
    async fn persist(&self, piece: &Piece) -> io::Result<()> {
        if !piece.is_valid(&self.hashes[piece.index as usize]) {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "hash mismatch"));
        }
        self.persisted.lock().unwrap().push(piece.index);
        Ok(())
    }
}

#[tokio::test]
async fn downloads_a_two_piece_torrent_from_one_peer() {
    let seeder = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (tracker_url, mut announces) = stub_tracker(seeder.local_addr().unwrap()).await;

    let descriptor = torrent(&tracker_url);
    assert_eq!(descriptor.total_pieces(), 2);
    let (requested_tx, mut requested) = mpsc::unbounded_channel();
    tokio::spawn(stub_seeder(seeder, descriptor.info_hash, requested_tx));

    let sink = Arc::new(VerifyingSink {
        hashes: descriptor.piece_hashes.clone(),
        persisted: Mutex::new(Vec::new()),
    });
    let config = ClientConfig {
        listen_port: 0,
        ..ClientConfig::default()
    };
    let client = reqwest::Client::builder().no_proxy().build().unwrap();
    let tracker = Tracker::with_client(&tracker_url, client).unwrap();
    let torrent = TorrentFile::with_tracker(descriptor, config, sink.clone(), tracker);
    let state = torrent.state();

    tokio::time::timeout(Duration::from_secs(10), torrent.run())
        .await
        .expect("download should finish")
        .unwrap();

    assert_eq!(*sink.persisted.lock().unwrap(), vec![0, 1]);
    assert_eq!(requested.recv().await, Some(0));
    assert_eq!(requested.recv().await, Some(1));

    assert_eq!(state.d_state(), DownState::Complete);
    assert_eq!(state.pieces_downloaded(), 2);
    assert_eq!(state.bytes_complete(), 30);
    assert_eq!(state.bytes_left(), 0);
    assert_eq!(state.pieces.get(0).unwrap().data, Bytes::from_static(&CONTENT[..20]));
    assert_eq!(state.pieces.get(1).unwrap().data, Bytes::from_static(&CONTENT[20..]));

    let announce = announces.recv().await.unwrap();
    assert!(announce.contains("left=30"));
    assert!(announce.contains("compact=1"));
    assert!(announce.ends_with("event=started"));
}
