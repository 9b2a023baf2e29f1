use clap::{ArgAction, Parser};
use sluice::core::config::MAX_PEERS;
use sluice::core::ClientConfig;
use std::path::PathBuf;
use tracing::level_filters::LevelFilter;

#[derive(Debug, Parser)]
#[clap(version, about = "Downloads the content of a torrent file")]
pub struct Arguments {
    /// Path to the torrent file you wish to download
    #[arg(short('f'))]
    pub torrent_file: PathBuf,

    /// Directory the downloaded content is written to
    #[arg(short('o'), default_value = ".")]
    pub output_dir: PathBuf,

    /// TCP port to listen on and to report to the tracker
    #[arg(short('p'), default_value_t = 6881)]
    pub port: u16,

    /// Maximum number of peers to be connected to at once
    #[arg(long, default_value_t = MAX_PEERS)]
    pub max_peers: usize,

    /// Logs more, -v for debug and -vv for trace. RUST_LOG takes precedence
    #[arg(short('v'), action = ArgAction::Count)]
    pub verbose: u8,
}

impl Arguments {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            listen_port: self.port,
            max_peers: self.max_peers,
            ..ClientConfig::default()
        }
    }

    pub fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = Arguments::try_parse_from(["sluice", "-f", "debian.torrent"]).unwrap();
        assert_eq!(args.torrent_file, PathBuf::from("debian.torrent"));
        assert_eq!(args.output_dir, PathBuf::from("."));
        assert_eq!(args.log_level(), LevelFilter::INFO);

        let config = args.client_config();
        assert_eq!(config.listen_port, 6881);
        assert_eq!(config.max_peers, 30);
    }

    #[test]
    fn overrides() {
        let args = Arguments::try_parse_from([
            "sluice", "-f", "a.torrent", "-o", "/tmp/out", "-p", "7000", "--max-peers", "5", "-vv",
        ])
        .unwrap();
        assert_eq!(args.output_dir, PathBuf::from("/tmp/out"));
        assert_eq!(args.log_level(), LevelFilter::TRACE);

        let config = args.client_config();
        assert_eq!(config.listen_port, 7000);
        assert_eq!(config.max_peers, 5);
    }

    #[test]
    fn torrent_file_is_required() {
        assert!(Arguments::try_parse_from(["sluice"]).is_err());
    }
}
