//! Plain-text stats endpoint
//!
//! An axum router serving the session report at `stats.path` (default
//! `GET /stats/session/plain` on `127.0.0.1:6001`). `HEAD` gets the same
//! headers without a body, other methods get `405` and every other path
//! answers `404`.

use std::io;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::recorder::SessionRecorder;
use super::report::render_report;
use crate::config::StatsConfig;

/// HTTP server for the session report
pub struct StatsServer {
    /// Configuration
    config: StatsConfig,

    /// Session source
    recorder: Arc<SessionRecorder>,

    /// Shutdown signal sender
    shutdown_tx: broadcast::Sender<()>,
}

impl StatsServer {
    /// Create a new stats server
    pub fn new(config: StatsConfig, recorder: Arc<SessionRecorder>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            recorder,
            shutdown_tx,
        }
    }

    /// Bind the configured address and serve until shutdown
    ///
    /// # Errors
    ///
    /// Returns an error if the listen address cannot be bound.
    pub async fn run(&self) -> io::Result<()> {
        if !self.config.enabled {
            info!("Stats server disabled");
            return Ok(());
        }

        let listener = TcpListener::bind(self.config.listen).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown
    ///
    /// # Errors
    ///
    /// Returns an error if the configured path is not a literal route or
    /// the listener fails.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        self.config
            .validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

        let app = router(&self.config.path, Arc::clone(&self.recorder));
        info!("Stats server listening on {}", listener.local_addr()?);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("Stats server shutting down");
            })
            .await
    }

    /// Get a shutdown signal sender
    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Initiate shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

fn router(path: &str, recorder: Arc<SessionRecorder>) -> Router {
    Router::new()
        .route(path, get(plain_report))
        .fallback(not_found)
        .with_state(recorder)
}

async fn plain_report(State(recorder): State<Arc<SessionRecorder>>) -> String {
    let snapshot = recorder.snapshot();
    debug!(
        "Stats report: {} active, {} completed",
        snapshot.active.len(),
        snapshot.completed.len()
    );
    render_report(&snapshot)
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "404 page not found\n")
}
