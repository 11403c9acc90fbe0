// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Local status surface. `POST /connect` feeds credentials to a startup
//! that is still waiting for them; `GET /status` exposes connection and
//! per-peer state as JSON.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use olm_wgtunnel_common::SiteId;
use olm_wgtunnel_monitor::Selection;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectRequest {
    pub id: String,
    pub secret: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerStatus {
    pub connected: bool,
    pub rtt_ms: Option<u64>,
    pub selection: &'static str,
}

fn selection_label(selection: Selection) -> &'static str {
    match selection {
        Selection::Unknown => "unknown",
        Selection::Primary => "primary",
        Selection::Unreachable => "unreachable",
        Selection::Relay => "relay",
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    connected: bool,
    peers: HashMap<u64, PeerStatus>,
}

pub struct HttpServer {
    state: Arc<HttpState>,
}

struct HttpState {
    connected: AtomicBool,
    peers: RwLock<HashMap<u64, PeerStatus>>,
    connect_tx: mpsc::Sender<ConnectRequest>,
}

impl HttpServer {
    pub fn new() -> (Self, mpsc::Receiver<ConnectRequest>) {
        let (connect_tx, connect_rx) = mpsc::channel(8);
        let server = Self {
            state: Arc::new(HttpState {
                connected: AtomicBool::new(false),
                peers: RwLock::new(HashMap::new()),
                connect_tx,
            }),
        };
        (server, connect_rx)
    }

    /// Binds and serves in the background.
    #[instrument(skip(self))]
    pub async fn start(&self, addr: &str) -> anyhow::Result<()> {
        let router = Router::new()
            .route("/connect", post(handle_connect))
            .route("/status", get(handle_status))
            .with_state(Arc::clone(&self.state));

        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, "status HTTP server listening");

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                warn!(error = %e, "status HTTP server exited");
            }
        });

        Ok(())
    }

    pub fn update_peer_status(
        &self,
        site_id: SiteId,
        connected: bool,
        rtt: Option<Duration>,
        selection: Selection,
    ) {
        let mut peers = self.state.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.insert(
            site_id.0,
            PeerStatus {
                connected,
                rtt_ms: rtt.map(|d| d.as_millis() as u64),
                selection: selection_label(selection),
            },
        );
    }

    pub fn remove_peer(&self, site_id: SiteId) {
        let mut peers = self.state.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.remove(&site_id.0);
    }

    pub fn set_connection_status(&self, connected: bool) {
        self.state.connected.store(connected, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn snapshot(&self) -> StatusResponse {
        StatusResponse {
            connected: self.state.connected.load(Ordering::SeqCst),
            peers: self
                .state
                .peers
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }
}

async fn handle_connect(
    State(state): State<Arc<HttpState>>,
    Json(request): Json<ConnectRequest>,
) -> StatusCode {
    info!(id = %request.id, endpoint = %request.endpoint, "received connect request over HTTP");

    match state.connect_tx.try_send(request) {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn handle_status(State(state): State<Arc<HttpState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        connected: state.connected.load(Ordering::SeqCst),
        peers: state.peers.read().unwrap_or_else(|e| e.into_inner()).clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn peer_status_updates_are_visible() {
        let (server, _rx) = HttpServer::new();

        server.update_peer_status(SiteId(1), false, None, Selection::Unknown);
        server.update_peer_status(
            SiteId(1),
            true,
            Some(Duration::from_millis(12)),
            Selection::Primary,
        );
        server.set_connection_status(true);

        let snapshot = server.snapshot();
        assert!(snapshot.connected);
        let peer = snapshot.peers.get(&1).unwrap();
        assert!(peer.connected);
        assert_eq!(peer.rtt_ms, Some(12));
        assert_eq!(peer.selection, "primary");
    }

    #[tokio::test]
    async fn removed_peers_leave_the_snapshot() {
        let (server, _rx) = HttpServer::new();
        server.update_peer_status(SiteId(1), true, None, Selection::Relay);
        server.remove_peer(SiteId(1));
        assert!(server.snapshot().peers.is_empty());
    }

    #[tokio::test]
    async fn connect_requests_reach_the_channel() {
        let (server, mut rx) = HttpServer::new();

        let status = handle_connect(
            State(Arc::clone(&server.state)),
            Json(ConnectRequest {
                id: "olm-1".to_string(),
                secret: "s".to_string(),
                endpoint: "https://p.example".to_string(),
            }),
        )
        .await;

        assert_eq!(status, StatusCode::ACCEPTED);
        let received = rx.recv().await.unwrap();
        assert_eq!(received.id, "olm-1");
    }
}
