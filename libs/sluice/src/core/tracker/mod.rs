mod announce_req_res;

pub use announce_req_res::{
    decode_compact_peers, AnnounceOutcome, AnnounceParams, AnnounceResponse, MAX_INTERVAL_SECS,
};

use crate::parser::FormatError;
use reqwest::{StatusCode, Url};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{event, Level};

/// Value of the "event" parameter of the first announce
pub const STARTED_EVENT: &str = "started";

/// Bound on a whole announce round trip
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// The previous response asked us to wait longer, no request was made
    #[error("tracker can't be announced to for another {retry_in:?}")]
    TooSoon { retry_in: Duration },

    #[error("could not reach the tracker: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("tracker answered with HTTP status {0}")]
    HttpStatus(StatusCode),

    #[error("tracker refused the announce: {0}")]
    TrackerFailure(String),

    #[error("malformed tracker response: {0}")]
    Format(#[from] FormatError),

    #[error("invalid tracker URL {0:?}")]
    InvalidUrl(String),
}

/// A tracker in BitTorrent is simply, a "URL", that uses certain request and response technique in
/// order to get information about peers
///
/// Only HTTP(S) trackers are supported. A tracker is either never contacted or contacted, the
/// very first announce attempt, successful or not, is the only one that carries `event=started`
#[derive(Debug)]
pub struct Tracker {
    /// A Url instance of reqwest crate, parsed out of the "announce" field
    pub address: Url,

    client: reqwest::Client,

    has_been_contacted: bool,

    /// Set from the "interval" of the last successful response
    next_announce_not_before: Option<Instant>,
}

impl Tracker {
    pub fn new(address: &str) -> Result<Self, TrackerError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(TrackerError::Transport)?;
        Self::with_client(address, client)
    }

    /// Same as [Tracker::new], with a preconfigured HTTP client
    pub fn with_client(address: &str, client: reqwest::Client) -> Result<Self, TrackerError> {
        let url = Url::parse(address).map_err(|_| TrackerError::InvalidUrl(address.to_owned()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(TrackerError::InvalidUrl(address.to_owned()));
        }
        Ok(Self {
            address: url,
            client,
            has_been_contacted: false,
            next_announce_not_before: None,
        })
    }

    pub fn has_been_contacted(&self) -> bool {
        self.has_been_contacted
    }

    /// Earliest time the next announce is allowed, None before the first successful one
    pub fn next_announce_at(&self) -> Option<Instant> {
        self.next_announce_not_before
    }

    /// Announces ourselves to the tracker and returns the peers it knows about
    ///
    /// Calling it before the interval of the last response elapsed fails with
    /// [TrackerError::TooSoon] without touching the network
    pub async fn announce(&mut self, params: &AnnounceParams) -> Result<AnnounceResponse, TrackerError> {
        let now = Instant::now();
        if let Some(not_before) = self.next_announce_not_before {
            if now < not_before {
                return Err(TrackerError::TooSoon {
                    retry_in: not_before - now,
                });
            }
        }

        let announce_event = if self.has_been_contacted {
            None
        } else {
            Some(STARTED_EVENT)
        };
        self.has_been_contacted = true;

        let url = params.to_url(self.address.as_str(), announce_event);
        event!(Level::DEBUG, tracker = %self.address, started = announce_event.is_some(), "announcing");

        let response = self.client.get(url).send().await.map_err(TrackerError::Transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(TrackerError::HttpStatus(status));
        }
        let body = response.bytes().await.map_err(TrackerError::Transport)?;

        match AnnounceResponse::from_bytes(&body)? {
            AnnounceOutcome::Failure(reason) => Err(TrackerError::TrackerFailure(reason)),
            AnnounceOutcome::Peers(response) => {
                let not_before = Instant::now().checked_add(response.interval).ok_or(FormatError::OutOfRange {
                    key: "interval",
                    value: response.interval.as_secs(),
                    max: MAX_INTERVAL_SECS,
                })?;
                self.next_announce_not_before = Some(not_before);
                event!(
                    Level::INFO,
                    tracker = %self.address,
                    peers = response.peers.len(),
                    interval = ?response.interval,
                    "tracker responded"
                );
                Ok(response)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Serves one canned response per connection and reports the request target of each
    pub(crate) async fn stub_tracker(responses: Vec<(u16, Vec<u8>)>) -> (String, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            for (status, body) in responses {
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
                let target = request.split_whitespace().nth(1).unwrap_or_default().to_owned();
                tx.send(target).unwrap();

                let head = format!(
                    "HTTP/1.1 {status} Stub\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                socket.write_all(head.as_bytes()).await.unwrap();
                socket.write_all(&body).await.unwrap();
            }
        });

        (format!("http://{addr}/announce"), rx)
    }

    pub(crate) fn tracker(url: &str) -> Tracker {
        let client = reqwest::Client::builder().no_proxy().build().unwrap();
        Tracker::with_client(url, client).unwrap()
    }

    fn params() -> AnnounceParams {
        AnnounceParams {
            info_hash: [1; 20],
            peer_id: *b"-SL0100-000000000000",
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 30,
        }
    }

    fn ok_body(interval: u64) -> Vec<u8> {
        let mut body = format!("d8:intervali{interval}e5:peers12:").into_bytes();
        body.extend_from_slice(&[192, 168, 1, 1, 0x1A, 0xE1, 10, 0, 0, 1, 0x1A, 0xE2]);
        body.push(b'e');
        body
    }

    #[tokio::test]
    async fn first_announce_is_started_then_waits_for_interval() {
        let (url, mut requests) = stub_tracker(vec![(200, ok_body(1800))]).await;
        let mut tracker = tracker(&url);
        assert!(!tracker.has_been_contacted());

        let response = tracker.announce(&params()).await.unwrap();
        assert_eq!(
            response.peers,
            vec!["192.168.1.1:6881".parse().unwrap(), "10.0.0.1:6882".parse().unwrap()]
        );
        assert_eq!(response.interval, Duration::from_secs(1800));

        let target = requests.recv().await.unwrap();
        assert!(target.starts_with("/announce?info_hash=%01%01"));
        assert!(target.contains("&port=6881&uploaded=0&downloaded=0&left=30&compact=1&no_peer_id=1"));
        assert!(target.ends_with("&event=started"));

        assert!(tracker.next_announce_at().unwrap() > Instant::now() + Duration::from_secs(1700));
        let err = tracker.announce(&params()).await.unwrap_err();
        assert!(matches!(err, TrackerError::TooSoon { retry_in } if retry_in > Duration::from_secs(1700)));
        assert!(requests.try_recv().is_err());
    }

    #[tokio::test]
    async fn later_announces_carry_no_event() {
        let (url, mut requests) = stub_tracker(vec![(200, ok_body(0)), (200, ok_body(0))]).await;
        let mut tracker = tracker(&url);

        tracker.announce(&params()).await.unwrap();
        tracker.announce(&params()).await.unwrap();
        assert!(requests.recv().await.unwrap().contains("event=started"));
        assert!(!requests.recv().await.unwrap().contains("event"));
    }

    #[tokio::test]
    async fn failed_announces_still_count_as_contact() {
        let (url, mut requests) = stub_tracker(vec![
            (200, b"d14:failure reason17:torrent not founde".to_vec()),
            (404, Vec::new()),
            (200, b"this is not bencode".to_vec()),
        ])
        .await;
        let mut tracker = tracker(&url);

        let err = tracker.announce(&params()).await.unwrap_err();
        assert!(matches!(err, TrackerError::TrackerFailure(ref reason) if reason == "torrent not found"));
        assert!(tracker.has_been_contacted());
        assert_eq!(tracker.next_announce_at(), None);

        let err = tracker.announce(&params()).await.unwrap_err();
        assert!(matches!(err, TrackerError::HttpStatus(StatusCode::NOT_FOUND)));

        let err = tracker.announce(&params()).await.unwrap_err();
        assert!(matches!(err, TrackerError::Format(FormatError::NotADictionary(b't'))));

        assert!(requests.recv().await.unwrap().ends_with("event=started"));
        assert!(!requests.recv().await.unwrap().contains("event"));
    }

    #[tokio::test]
    async fn oversized_interval_is_a_format_error() {
        let (url, _requests) = stub_tracker(vec![(200, b"d8:intervali18446744073709551615e5:peers0:e".to_vec())]).await;
        let mut tracker = tracker(&url);

        let err = tracker.announce(&params()).await.unwrap_err();
        assert!(matches!(
            err,
            TrackerError::Format(FormatError::OutOfRange { key: "interval", value: u64::MAX, .. })
        ));
        assert!(tracker.has_been_contacted());
        assert_eq!(tracker.next_announce_at(), None);
    }

    #[tokio::test]
    async fn unreachable_tracker_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut tracker = tracker(&format!("http://{addr}/announce"));
        let err = tracker.announce(&params()).await.unwrap_err();
        assert!(matches!(err, TrackerError::Transport(_)));
        assert!(tracker.has_been_contacted());
    }

    #[test]
    fn only_http_trackers_are_accepted() {
        assert!(matches!(Tracker::new("udp://tracker.test:80"), Err(TrackerError::InvalidUrl(_))));
        assert!(matches!(Tracker::new("not a url"), Err(TrackerError::InvalidUrl(_))));
        assert!(Tracker::new("https://tracker.test/announce").is_ok());
    }
}
