//! irsnap: stream a camera and save snapshots on demand

use std::path::PathBuf;
use std::sync::Arc;

use color_eyre::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use irsnap::pipeline::StreamSession;
use irsnap::transport::{PatternTransport, Transport};
use irsnap::{Config, SessionState, SnapshotConfig, SnapshotController, SnapshotError, SnapshotRequest, SourceKind};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("irsnap=debug")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("irsnap launching...");

    // Load configuration
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;

    let transport = build_transport(&config)?;
    info!(
        "Using {} source, device {}",
        transport.name(),
        config.capture.device
    );

    let session = StreamSession::from_config(transport, config.session.clone());
    session.start(&config.capture.device)?;
    let snapshots = session.snapshots();

    println!("commands: <enter>/c = snapshot, s = status, q = quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut state_rx = session.subscribe_state();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line?.as_deref().map(str::trim) {
                    None | Some("q") => break,
                    Some("") | Some("c") => take_snapshot(&snapshots, &config.snapshot),
                    Some("s") => println!(
                        "state: {}, published: {}, buffer: {:?}",
                        session.state(),
                        session.frames_published(),
                        session.buffer().stats()
                    ),
                    Some(other) => println!("unknown command {other:?}"),
                }
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = state_rx.borrow_and_update().clone();
                if state.is_terminal() {
                    println!("stream ended: {state}");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    session.stop();
    if let SessionState::Error(reason) = session.state() {
        warn!("Session ended with error: {}", reason);
    }

    info!("irsnap shutting down");
    Ok(())
}

fn build_transport(config: &Config) -> Result<Arc<dyn Transport>> {
    match config.capture.source {
        SourceKind::Pattern => Ok(Arc::new(PatternTransport::from_config(&config.capture))),
        #[cfg(feature = "v4l2")]
        SourceKind::V4l2 => Ok(Arc::new(irsnap::transport::V4l2Transport::new(
            config.capture.clone(),
        ))),
        #[cfg(not(feature = "v4l2"))]
        SourceKind::V4l2 => Err(color_eyre::eyre::eyre!("built without the `v4l2` feature")),
    }
}

fn take_snapshot(snapshots: &SnapshotController, config: &SnapshotConfig) {
    let snapshot = match snapshots.fulfil(SnapshotRequest::now()) {
        Ok(snapshot) => snapshot,
        Err(SnapshotError::NotAvailable) => {
            println!("no frame yet, stream not active");
            return;
        }
        Err(e) => {
            println!("{e}");
            return;
        }
    };

    let (height, width, channels) = snapshot.shape();
    println!(
        "captured frame {} (version {}), shape {}x{}x{}, {:?} old",
        snapshot.frame.sequence(),
        snapshot.version,
        height,
        width,
        channels,
        snapshot.age
    );

    if let Err(e) = std::fs::create_dir_all(&config.output_dir) {
        error!("Cannot create {}: {}", config.output_dir.display(), e);
        return;
    }
    let path = config.output_dir.join(format!(
        "snapshot-{:06}.{}",
        snapshot.version, config.extension
    ));
    match snapshot.save(&path) {
        Ok(()) => println!("saved {}", path.display()),
        Err(e) => error!("Failed to save snapshot: {}", e),
    }
}
