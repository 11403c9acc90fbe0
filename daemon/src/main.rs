// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

mod config;
mod holepunch;
mod http;
mod supervisor;

use clap::Parser;
use config::{Args, Config};
use http::{ConnectRequest, HttpServer};
use olm_control::{default_credentials_path, ControlClient};
use olm_wgtunnel_common::WgKeyPair;
use olm_wgtunnel_monitor::{TesterClient, TEST_TIMEOUT};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if args.version {
        println!("olm {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let mut config = match Config::resolve(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_filter())),
        )
        .init();

    if args.test {
        run_test_mode(args.test_target.as_deref()).await;
        return;
    }

    // status surface comes up first so it can hand us credentials
    let (http_server, connect_rx) = HttpServer::new();
    let http = if config.enable_http {
        if let Err(e) = http_server.start(&config.http_listen_addr()).await {
            error!(error = %e, "failed to start status HTTP server");
            std::process::exit(1);
        }
        Some(Arc::new(http_server))
    } else {
        None
    };

    wait_for_credentials(&mut config, connect_rx).await;

    let keypair = WgKeyPair::generate();
    debug!(public_key = %keypair.public_key(), "generated WireGuard keypair");

    let source_port = match supervisor::find_available_udp_port(49152, 65535) {
        Ok(port) => port,
        Err(e) => {
            error!(error = %e, "could not find an available UDP port");
            std::process::exit(1);
        }
    };
    info!(source_port, "selected fixed source port");

    let control = match ControlClient::new(
        &config.id,
        &config.secret,
        &config.endpoint,
        default_credentials_path(),
    )
    .await
    {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!(error = %e, "failed to create control client");
            std::process::exit(1);
        }
    };

    let supervisor = supervisor::Supervisor::new(config, keypair, source_port, control, http);
    supervisor.register_handlers().await;
    supervisor.start().await;

    wait_for_signal().await;
    info!("interrupt received, shutting down");

    supervisor.shutdown().await;
}

async fn run_test_mode(target: Option<&str>) {
    let Some(target) = target else {
        eprintln!("test mode requires --test-target to be set to a server:port");
        std::process::exit(1);
    };

    info!(target, "running in test mode");

    let tester = match TesterClient::new(target).await {
        Ok(tester) => tester,
        Err(e) => {
            eprintln!("failed to create tester client: {e}");
            std::process::exit(1);
        }
    };

    match tester.test_connection(TEST_TIMEOUT).await {
        Some(rtt) => {
            println!("Connection test successful! RTT: {rtt:?}");
        }
        None => {
            println!("Connection test failed - no response received");
            std::process::exit(1);
        }
    }
}

/// Blocks until id, secret, and endpoint are all known, either from config
/// or from a `POST /connect` on the status surface.
async fn wait_for_credentials(config: &mut Config, mut connect_rx: mpsc::Receiver<ConnectRequest>) {
    while !config.has_credentials() {
        tokio::select! {
            request = connect_rx.recv() => {
                if let Some(request) = request {
                    info!(id = %request.id, endpoint = %request.endpoint, "credentials supplied over HTTP");
                    config.id = request.id;
                    config.secret = request.secret;
                    config.endpoint = request.endpoint;
                }
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                debug!("waiting for client ID, secret, and endpoint...");
            }
        }
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
