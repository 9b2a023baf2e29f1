use super::messages::Message;
use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Largest frame we accept, a 16 KiB block plus its header fits comfortably, and so does the
/// bitfield of any sane torrent
pub const MAX_MESSAGE_LEN: usize = 1 << 20;

/// Splits the byte stream of a connected peer into [Message]s
///
/// Only used after the handshake, which isn't length prefixed and is exchanged on the raw socket
#[derive(Debug, Default)]
pub struct PeerMessageCodec;

impl Decoder for PeerMessageCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let length = BigEndian::read_u32(&src[..4]) as usize;
        if length > MAX_MESSAGE_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {length} bytes exceeds the {MAX_MESSAGE_LEN} bytes limit"),
            ));
        }

        // Wait for the rest of the frame
        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        if length == 0 {
            return Ok(Some(Message::KeepAlive));
        }
        let mut frame = src.split_to(length);
        let id = frame.get_u8();
        Message::from_frame(id, frame.freeze()).map(Some)
    }
}

impl Encoder<Message> for PeerMessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put(item.to_bytes());
        Ok(())
    }
}
