use crate::core::config::PeerId;
use crate::core::peer::PeerAddress;
use crate::core::perc_encode;
use crate::parser::bencode::{self, BencodeValue};
use crate::parser::torrent_parser::InfoHash;
use crate::parser::FormatError;
use byteorder::{BigEndian, ByteOrder};
use std::net::Ipv4Addr;
use std::time::Duration;

/// Longest re-announce interval accepted from a tracker, in seconds. A week is far beyond what
/// real trackers ask for
pub const MAX_INTERVAL_SECS: u64 = 7 * 24 * 60 * 60;

/// Data sent to the tracker in the query string of an "Announce" request
///
/// Reference : https://wiki.theory.org/BitTorrentSpecification#Tracker_Request_Parameters
///
/// - info_hash : 20 byte SHA1 hash of the info key in the ".torrent" file, percent encoded
/// - peer_id : 20 byte id of this client, percent encoded
/// - port : TCP port this client listens on
/// - uploaded, downloaded : bytes uploaded and downloaded since the first "started" announce
/// - left : bytes this client still has to download
/// - compact : always 1, we ask for the 6 bytes per peer form
/// - no_peer_id : always 1, the tracker can omit peer ids in the non compact form
/// - event : "started" on the first announce only
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceParams {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

impl AnnounceParams {
    /// Builds the query string of the request, without the leading '?'
    pub fn to_query(&self, event: Option<&str>) -> String {
        let mut query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&no_peer_id=1",
            perc_encode(self.info_hash),
            perc_encode(self.peer_id),
            self.port,
            self.uploaded,
            self.downloaded,
            self.left,
        );
        if let Some(event) = event {
            query.push_str("&event=");
            query.push_str(event);
        }
        query
    }

    /// Appends the query to the announce URL of the tracker, which may already carry a query of
    /// its own
    pub fn to_url(&self, base: &str, event: Option<&str>) -> String {
        let separator = if base.contains('?') { '&' } else { '?' };
        format!("{base}{separator}{}", self.to_query(event))
    }
}

/// Decoded body of a successful "Announce" response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    /// Peers in the order the tracker listed them
    pub peers: Vec<PeerAddress>,

    /// Time to wait before the next announce
    pub interval: Duration,

    /// Peers with the whole file, from "complete"
    pub seeders: Option<u64>,

    /// Peers still downloading, from "incomplete"
    pub leechers: Option<u64>,
}

/// What the body of a tracker response turned out to be
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnounceOutcome {
    Peers(AnnounceResponse),
    /// The tracker refused the request, with the reason it gave
    Failure(String),
}

impl AnnounceResponse {
    /// Decodes a tracker response body
    ///
    /// A non empty "failure reason" wins over everything else in the body. Otherwise "interval"
    /// is required, and "peers" may be either the compact byte string or a list of dictionaries
    pub fn from_bytes(body: &[u8]) -> Result<AnnounceOutcome, FormatError> {
        let root = bencode::decode(body)?;
        let root = root.as_dict()?;

        if let Some(reason) = root.get(b"failure reason") {
            let reason = String::from_utf8_lossy(reason.as_bytes()?).into_owned();
            if !reason.is_empty() {
                return Ok(AnnounceOutcome::Failure(reason));
            }
        }

        let interval = root.require("interval")?.as_integer()?;
        if interval > MAX_INTERVAL_SECS {
            return Err(FormatError::OutOfRange {
                key: "interval",
                value: interval,
                max: MAX_INTERVAL_SECS,
            });
        }
        let interval = Duration::from_secs(interval);
        let peers = match root.get(b"peers") {
            None => Vec::new(),
            Some(BencodeValue::Bytes(compact)) => decode_compact_peers(compact)?,
            Some(BencodeValue::List(list)) => decode_peer_list(list)?,
            Some(other) => {
                return Err(FormatError::WrongType {
                    expected: "byte string or list",
                    found: other.kind(),
                })
            }
        };
        let count = |key: &[u8]| root.get(key).map(BencodeValue::as_integer).transpose();

        Ok(AnnounceOutcome::Peers(Self {
            peers,
            interval,
            seeders: count(b"complete")?,
            leechers: count(b"incomplete")?,
        }))
    }
}

/// Decodes the compact peer list, 4 bytes of IPv4 address followed by 2 bytes of port, both in
/// network byte order
pub fn decode_compact_peers(bytes: &[u8]) -> Result<Vec<PeerAddress>, FormatError> {
    if bytes.len() % 6 != 0 {
        return Err(FormatError::InvalidCompactPeers(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(6)
        .map(|peer| {
            let ip = Ipv4Addr::new(peer[0], peer[1], peer[2], peer[3]);
            PeerAddress::new(ip, BigEndian::read_u16(&peer[4..6]))
        })
        .collect())
}

/// Decodes the original peer list, each peer being a dictionary with "ip" and "port"
fn decode_peer_list(list: &[BencodeValue]) -> Result<Vec<PeerAddress>, FormatError> {
    list.iter()
        .map(|peer| {
            let peer = peer.as_dict()?;
            let ip = peer.require("ip")?.as_str()?;
            let ip: Ipv4Addr = ip
                .parse()
                .map_err(|_| FormatError::InvalidPeerAddress(ip.to_owned()))?;
            let port = peer.require("port")?.as_integer()?;
            let port = u16::try_from(port).map_err(|_| FormatError::InvalidPeerAddress(format!("{ip}:{port}")))?;
            Ok(PeerAddress::new(ip, port))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> AnnounceParams {
        AnnounceParams {
            info_hash: [0x12; 20],
            peer_id: *b"-SL0100-abcdefghijkl",
            port: 6881,
            uploaded: 0,
            downloaded: 100,
            left: 900,
        }
    }

    #[test]
    fn builds_the_announce_url() {
        let url = params().to_url("http://tracker.test/announce", Some("started"));
        assert_eq!(
            url,
            format!(
                "http://tracker.test/announce?info_hash={}&peer_id=%2DSL0100%2Dabcdefghijkl&port=6881&uploaded=0&downloaded=100&left=900&compact=1&no_peer_id=1&event=started",
                "%12".repeat(20)
            )
        );

        let url = params().to_url("http://tracker.test/announce?key=1", None);
        assert!(url.starts_with("http://tracker.test/announce?key=1&info_hash="));
        assert!(!url.contains("event"));
    }

    #[test]
    fn decodes_compact_peers() {
        let peers = decode_compact_peers(&[192, 168, 1, 1, 0x1A, 0xE1, 10, 0, 0, 1, 0x1A, 0xE2]).unwrap();
        assert_eq!(
            peers,
            vec![
                "192.168.1.1:6881".parse::<PeerAddress>().unwrap(),
                "10.0.0.1:6882".parse().unwrap()
            ]
        );
        assert_eq!(decode_compact_peers(&[]).unwrap(), vec![]);
        assert_eq!(decode_compact_peers(&[0; 7]), Err(FormatError::InvalidCompactPeers(7)));
        assert_eq!(decode_compact_peers(&[0; 13]), Err(FormatError::InvalidCompactPeers(13)));
    }

    #[test]
    fn decodes_a_compact_response() {
        let mut body = b"d8:completei5e10:incompletei3e8:intervali1800e5:peers6:".to_vec();
        body.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1]);
        body.push(b'e');

        assert_eq!(
            AnnounceResponse::from_bytes(&body).unwrap(),
            AnnounceOutcome::Peers(AnnounceResponse {
                peers: vec!["127.0.0.1:6881".parse().unwrap()],
                interval: Duration::from_secs(1800),
                seeders: Some(5),
                leechers: Some(3),
            })
        );
    }

    #[test]
    fn decodes_a_peer_list_response() {
        let body = b"d8:intervali60e5:peersld2:ip8:10.0.0.24:porti51413eeee";
        let AnnounceOutcome::Peers(response) = AnnounceResponse::from_bytes(body).unwrap() else {
            panic!("expected peers");
        };
        assert_eq!(response.peers, vec!["10.0.0.2:51413".parse().unwrap()]);
        assert_eq!(response.seeders, None);

        let body = b"d8:intervali60e5:peersld2:ip11:example.org4:porti1eeee";
        assert_eq!(
            AnnounceResponse::from_bytes(body),
            Err(FormatError::InvalidPeerAddress("example.org".into()))
        );
    }

    #[test]
    fn failure_reason_comes_first() {
        let body = b"d14:failure reason12:unregistered5:peers7:garbagee";
        assert_eq!(
            AnnounceResponse::from_bytes(body).unwrap(),
            AnnounceOutcome::Failure("unregistered".into())
        );
    }

    #[test]
    fn interval_is_required() {
        assert_eq!(
            AnnounceResponse::from_bytes(b"d5:peers0:e"),
            Err(FormatError::MissingKey("interval".into()))
        );
        assert_eq!(
            AnnounceResponse::from_bytes(b"d8:intervali60e5:peers7:garbagee"),
            Err(FormatError::InvalidCompactPeers(7))
        );
    }

    #[test]
    fn interval_is_bounded() {
        assert_eq!(
            AnnounceResponse::from_bytes(b"d8:intervali18446744073709551615e5:peers0:e"),
            Err(FormatError::OutOfRange {
                key: "interval",
                value: u64::MAX,
                max: MAX_INTERVAL_SECS
            })
        );
        let body = format!("d8:intervali{MAX_INTERVAL_SECS}e5:peers0:e");
        let AnnounceOutcome::Peers(response) = AnnounceResponse::from_bytes(body.as_bytes()).unwrap() else {
            panic!("expected peers");
        };
        assert_eq!(response.interval, Duration::from_secs(MAX_INTERVAL_SECS));
    }
}
