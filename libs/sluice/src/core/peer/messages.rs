/*
 *
 *NOTE : This file contains all the structs and methods related to
 *Bittorent Message
 *
 *All the messages and their specified protocol is taken from :
 *https://wiki.theory.org/index.php/BitTorrentSpecification#Messages
 *
 *Initially we as a peer start as :
 *
 * NOT_INTERESTED and
 * CHOKING
 *
 */

use crate::core::config::PeerId;
use crate::parser::torrent_parser::InfoHash;
use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use std::io;

/// Protocol identifier of BitTorrent V1
pub const PSTR: &[u8; 19] = b"BitTorrent protocol";

/// A V1 Handshake is always 49 + 19 bytes long
pub const HANDSHAKE_LEN: usize = 49 + PSTR.len();

/// Handshake Message :
///
/// It's the first message to be exchanged by us (the initiator of the connection), with the peer.
/// A Handshake message has fixed 68 byte length. The peer also sends HANDSHAKE as the first
/// message to us.
///
/// NOTE : If a peer sends a Handshake message with different info hash, then we are suppose to
/// drop the connection right there.
///
/// Structure :
/// Handshake : <pstrlen><pstr><reserved><info_hash><peer_id>  WHERE
///
/// - pstrlen : String length of <pstr>, as a single raw byte, in BitTorrent V1, pstrlen = 19
/// - pstr : String identifier of the protocol, in BitTorrent V1, pstr = "BitTorrent protocol"
/// - reserved : Eight(8) reserved bytes, which is all zeroes. Each bit in this field can be
///              used to change the behaviour of the protocol
/// - info_hash : 20 byte SHA1 hash of the info key in the metainfo file i.e ".torrent" file
/// - peer_id : 20 byte String, used as a unique ID for the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    /// Creates a instance of Handshake in order to send it to a peer.
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    /// Serializes the Handshake instance into bytes
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PSTR.len() as u8);
        buf.put_slice(PSTR);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf
    }

    /// Deserializes the part of a handshake that follows the leading <pstrlen> byte
    ///
    /// The protocol string itself isn't checked, the info hash is read right after
    /// <pstr><reserved> whatever the announced pstrlen is. Returns None if `body` is too short.
    pub fn from_body(pstrlen: u8, body: &[u8]) -> Option<Self> {
        let start = pstrlen as usize;
        let rest = body.get(start..start + 48)?;

        let mut handshake = Self::new([0; 20], [0; 20]);
        handshake.reserved.copy_from_slice(&rest[..8]);
        handshake.info_hash.copy_from_slice(&rest[8..28]);
        handshake.peer_id.copy_from_slice(&rest[28..48]);
        Some(handshake)
    }
}

/// Payload of the Request and Cancel messages
///
/// Structure :
///
/// <len=0013><id=6 or 8><index><begin><length>
///
///  index - A u32 integer specifying the zero based piece index
///  begin - A u32 integer specifying the zero based byte offset within the piece
///  length - A u32 integer specifying the requested length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

impl BlockRequest {
    fn from_payload(payload: &[u8]) -> io::Result<Self> {
        if payload.len() != 12 {
            return Err(invalid_length("request", payload.len()));
        }
        Ok(Self {
            index: BigEndian::read_u32(&payload[0..4]),
            begin: BigEndian::read_u32(&payload[4..8]),
            length: BigEndian::read_u32(&payload[8..12]),
        })
    }

    fn put(&self, buf: &mut BytesMut, id: u8) {
        buf.put_u32(13);
        buf.put_u8(id);
        buf.put_u32(self.index);
        buf.put_u32(self.begin);
        buf.put_u32(self.length);
    }
}

/// Payload of the Piece message, a single block of a piece
///
/// Structure :
///
/// <len=0009+X><id=7><index><begin><block>
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub index: u32,
    pub begin: u32,
    pub data: Bytes,
}

/// Pieces the peer claims to have, the high bit of the first byte is piece 0
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
}

impl Bitfield {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self { bits: bytes.into() }
    }

    pub fn has(&self, index: u32) -> bool {
        let byte = (index / 8) as usize;
        let mask = 0x80 >> (index % 8);
        self.bits.get(byte).is_some_and(|b| b & mask != 0)
    }

    /// Marks the piece as present, growing the bitfield when needed. Used for Have messages
    pub fn set(&mut self, index: u32) {
        let byte = (index / 8) as usize;
        if byte >= self.bits.len() {
            self.bits.resize(byte + 1, 0);
        }
        self.bits[byte] |= 0x80 >> (index % 8);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}

/// Messages sent to the peer and received from the peer once the handshake is done
///
/// Every message but KeepAlive is framed as <length prefix><message id><payload>
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// <len=0000>
    KeepAlive,
    /// <len=0001><id=0>
    Choke,
    /// <len=0001><id=1>
    Unchoke,
    /// <len=0001><id=2>
    Interested,
    /// <len=0001><id=3>
    NotInterested,
    /// <len=0005><id=4><piece index>
    Have(u32),
    /// <len=0001+X><id=5><bitfield>
    Bitfield(Bitfield),
    /// <len=0013><id=6><index><begin><length>
    Request(BlockRequest),
    /// <len=0009+X><id=7><index><begin><block>
    Piece(Block),
    /// <len=0013><id=8><index><begin><length>
    Cancel(BlockRequest),
    /// <len=0003><id=9><listen-port>
    Port(u16),
    /// A message id we don't know about, kept as is so the connection can go on
    Unknown { id: u8, payload: Bytes },
}

impl Message {
    /// Parses the message carried by a single frame, `id` is the first byte after the length
    /// prefix and `payload` everything after it
    pub fn from_frame(id: u8, payload: Bytes) -> io::Result<Self> {
        match id {
            0..=3 if !payload.is_empty() => Err(invalid_length("state", payload.len())),
            0 => Ok(Message::Choke),
            1 => Ok(Message::Unchoke),
            2 => Ok(Message::Interested),
            3 => Ok(Message::NotInterested),
            4 if payload.len() == 4 => Ok(Message::Have(BigEndian::read_u32(&payload))),
            4 => Err(invalid_length("have", payload.len())),
            5 => Ok(Message::Bitfield(Bitfield::from_bytes(payload.to_vec()))),
            6 => BlockRequest::from_payload(&payload).map(Message::Request),
            7 if payload.len() >= 8 => Ok(Message::Piece(Block {
                index: BigEndian::read_u32(&payload[0..4]),
                begin: BigEndian::read_u32(&payload[4..8]),
                data: payload.slice(8..),
            })),
            7 => Err(invalid_length("piece", payload.len())),
            8 => BlockRequest::from_payload(&payload).map(Message::Cancel),
            9 if payload.len() == 2 => Ok(Message::Port(BigEndian::read_u16(&payload))),
            9 => Err(invalid_length("port", payload.len())),
            id => Ok(Message::Unknown { id, payload }),
        }
    }

    /// Serializes the message along with its length prefix
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        match self {
            Message::KeepAlive => buf.put_u32(0),
            Message::Choke => put_bare(&mut buf, 0),
            Message::Unchoke => put_bare(&mut buf, 1),
            Message::Interested => put_bare(&mut buf, 2),
            Message::NotInterested => put_bare(&mut buf, 3),
            Message::Have(index) => {
                buf.put_u32(5);
                buf.put_u8(4);
                buf.put_u32(*index);
            }
            Message::Bitfield(bitfield) => {
                buf.put_u32(1 + bitfield.bits.len() as u32);
                buf.put_u8(5);
                buf.put_slice(&bitfield.bits);
            }
            Message::Request(request) => request.put(&mut buf, 6),
            Message::Piece(block) => {
                buf.put_u32(9 + block.data.len() as u32);
                buf.put_u8(7);
                buf.put_u32(block.index);
                buf.put_u32(block.begin);
                buf.put_slice(&block.data);
            }
            Message::Cancel(request) => request.put(&mut buf, 8),
            Message::Port(port) => {
                buf.put_u32(3);
                buf.put_u8(9);
                buf.put_u16(*port);
            }
            Message::Unknown { id, payload } => {
                buf.put_u32(1 + payload.len() as u32);
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
        }
        buf
    }
}

fn put_bare(buf: &mut BytesMut, id: u8) {
    buf.put_u32(1);
    buf.put_u8(id);
}

fn invalid_length(message: &str, len: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("{message} message with a payload of {len} bytes"),
    )
}
