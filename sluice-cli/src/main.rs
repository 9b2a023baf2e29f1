mod arguments;
mod storage;

use arguments::Arguments;
use clap::Parser;
use sluice::core::state::State;
use sluice::core::{DownloadError, TorrentFile};
use sluice::parser::{load_torrent, LoadError};
use std::io;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use storage::FileSink;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// How often progress gets logged
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("could not create the output file: {0}")]
    Output(#[from] io::Error),

    #[error(transparent)]
    Download(#[from] DownloadError),
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Arguments::parse();
    init_logging(args.log_level());

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: LevelFilter) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .init();
}

async fn run(args: Arguments) -> Result<(), CliError> {
    let descriptor = load_torrent(&args.torrent_file)?;
    info!(
        name = %descriptor.name,
        pieces = descriptor.total_pieces(),
        bytes = descriptor.total_length(),
        "loaded torrent"
    );

    let sink = FileSink::create(&args.output_dir, &descriptor).await?;
    info!(path = %sink.path().display(), "writing to");

    let torrent = TorrentFile::new(descriptor, args.client_config(), Arc::new(sink))?;
    let progress = tokio::spawn(report_progress(torrent.state()));
    let result = torrent.run().await;
    progress.abort();
    Ok(result?)
}

/// Logs the progress of the download until aborted
async fn report_progress(state: Arc<State>) {
    let total = state.descriptor.total_pieces();
    let mut ticks = tokio::time::interval(PROGRESS_INTERVAL);
    ticks.tick().await;
    loop {
        ticks.tick().await;
        info!(
            pieces = state.pieces_downloaded(),
            total,
            bytes_left = state.bytes_left(),
            peers = state.connected_peers(),
            "progress"
        );
        if let Some(err) = state.last_tracker_error() {
            warn!(error = %err, "tracker unavailable");
        }
    }
}
