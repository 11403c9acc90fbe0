// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! NAT pinhole emitter. Sends a small datagram carrying the client id from
//! the fixed source port toward the server once a second, until told to
//! stop. The socket is dropped when the task exits, which is what frees the
//! port for the WireGuard device; the connect handler awaits this task
//! before binding.

use olm_wgtunnel_engine::resolve_endpoint;
use serde::Serialize;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, warn};
use url::Url;

pub const HOLEPUNCH_CADENCE: Duration = Duration::from_secs(1);

/// Port the server's hole-punch responder listens on when the endpoint URL
/// does not carry an explicit one.
const DEFAULT_HOLEPUNCH_PORT: u16 = 3478;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Hello<'a> {
    olm_id: &'a str,
}

/// `host:port` the emitter should target, derived from the server endpoint.
pub fn holepunch_target(endpoint: &str) -> Option<String> {
    let url = Url::parse(endpoint).ok()?;
    let host = url.host_str()?;
    let port = url.port().unwrap_or(DEFAULT_HOLEPUNCH_PORT);
    Some(format!("{host}:{port}"))
}

pub fn spawn(
    endpoint: String,
    olm_id: String,
    source_port: u16,
    mut stop: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let Some(target) = holepunch_target(&endpoint) else {
            warn!(endpoint, "cannot derive hole-punch target from endpoint");
            return;
        };

        let addr = match resolve_endpoint(&target).await {
            Ok(addr) => addr,
            Err(e) => {
                warn!(target, error = %e, "cannot resolve hole-punch target");
                return;
            }
        };

        let socket = match UdpSocket::bind(("0.0.0.0", source_port)).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!(source_port, error = %e, "cannot bind hole-punch socket");
                return;
            }
        };

        let payload = serde_json::to_vec(&Hello { olm_id: &olm_id }).unwrap_or_default();

        debug!(%addr, source_port, "hole-punch emitter started");

        let mut ticker = tokio::time::interval(HOLEPUNCH_CADENCE);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }

                _ = ticker.tick() => {
                    if let Err(e) = socket.send_to(&payload, addr).await {
                        debug!(error = %e, "hole-punch send failed");
                    }
                }
            }
        }

        debug!("hole-punch emitter stopped");
        // socket drops here, releasing the fixed source port
    })
}
