mod config;
mod error;
mod media;
mod room;
mod rtsp;
mod runner;
mod storage;
mod stream;
mod web;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::media::MediaPipeline;
use crate::room::PeerRoom;
use crate::storage::{BlobStore, FsBlobStore};
use crate::stream::StreamerService;
use crate::web::AppState;

fn parse_args() -> (PathBuf, Option<u16>) {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("./config/reel.toml");
    let mut port_override = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    port_override = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    (config_path, port_override)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (config_path, port_override) = parse_args();

    // Load configuration
    let mut config = config::load_config(&config_path)?;
    if let Some(p) = port_override {
        config.server.port = p;
    }
    // Validate configuration semantics
    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{}", issue);
            } else {
                tracing::warn!("{}", issue);
            }
        }
        if has_errors {
            tracing::error!(
                "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
                issues.len()
            );
            std::process::exit(1);
        }
    }

    // Warn when the static client is missing so /static doesn't silently 404
    if !std::path::Path::new(&config.server.web_root).is_dir() {
        tracing::warn!(
            "Web root '{}' does not exist — the player UI will not load. \
             Set server.web_root in the config.",
            config.server.web_root
        );
    }

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .context("Invalid bind address")?;

    // Root cancellation: SIGINT/SIGTERM tear down every stream, relay, and
    // ffmpeg child.
    let cancel = CancellationToken::new();

    // Blob store
    let store: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(&config.storage.root));
    store
        .ensure_bucket()
        .await
        .map_err(|e| anyhow::anyhow!("failed to prepare storage root: {e}"))?;

    // Media pipeline + streamer + peer room
    let pipeline = Arc::new(MediaPipeline::new(
        Arc::clone(&store),
        config.ffmpeg.clone(),
        cancel.clone(),
    ));
    let streamer = StreamerService::new(
        Arc::clone(&pipeline),
        config.rtsp.clone(),
        cancel.clone(),
    );
    let room = PeerRoom::new(streamer, cancel.clone());

    // Periodic PLI so late joiners get a keyframe promptly
    tokio::spawn(Arc::clone(&room).run_key_frame_ticker());

    let state = Arc::new(AppState {
        config,
        store,
        pipeline,
        room,
    });
    let app = web::build_router(state);

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;

    tracing::info!("===========================================");
    tracing::info!("  Reel Media Relay v0.1.0");
    tracing::info!("  Listening on http://{bind_addr}");
    tracing::info!("===========================================");

    let shutdown_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    tracing::error!("failed to install SIGTERM handler: {e}");
                    let _ = tokio::signal::ctrl_c().await;
                    shutdown_cancel.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received SIGINT, shutting down");
                }
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, shutting down");
                }
            }
            shutdown_cancel.cancel();
        })
        .await?;

    // Everything downstream of the root token is gone or going; nothing to
    // persist for this service.
    cancel.cancel();
    tracing::info!("Reel server shut down cleanly");

    Ok(())
}
