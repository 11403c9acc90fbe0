// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Wires the control client, hole-punch emitter, device, and peer monitor
//! together, and owns every piece of state the directive handlers share.

use crate::config::Config;
use crate::holepunch;
use crate::http::HttpServer;
use futures::FutureExt;
use olm_control::{ControlClient, MessageHandler};
use olm_wgtunnel_common::message::types;
use olm_wgtunnel_common::{
    HolePunchData, PeerData, RegisterData, RelayPeerData, RemovePeerData, SiteConfig, WgData,
    WgKeyPair, WgPublicKey,
};
use olm_wgtunnel_engine::{platform, resolve_endpoint, TunDevice, UapiHandle, UapiListener, WgDevice};
use olm_wgtunnel_monitor::{MonitorConfig, NotifyFn, PeerMonitor, ReconfigureFn, Selection};
use serde_json::Value;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

const REGISTER_CADENCE: Duration = Duration::from_secs(1);

/// Picks a random unused UDP port in `[min, max]`. This becomes the fixed
/// source port for the lifetime of the process.
pub fn find_available_udp_port(min: u16, max: u16) -> std::io::Result<u16> {
    for _ in 0..128 {
        let port = min + fastrand::u16(..(max - min + 1));
        if std::net::UdpSocket::bind(("0.0.0.0", port)).is_ok() {
            return Ok(port);
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AddrInUse,
        "no free UDP port in range",
    ))
}

pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    config: Config,
    keypair: WgKeyPair,
    source_port: u16,
    control: Arc<ControlClient>,
    http: Option<Arc<HttpServer>>,
    device: Mutex<Option<Arc<WgDevice>>>,
    uapi: Mutex<Option<UapiHandle>>,
    wg_data: Mutex<Option<WgData>>,
    monitor: Mutex<Option<Arc<PeerMonitor>>>,
    server_key: Arc<RwLock<Option<WgPublicKey>>>,
    connect_times: AtomicU32,
    stop_holepunch: watch::Sender<bool>,
    stop_register: watch::Sender<bool>,
    stop_ping: watch::Sender<bool>,
    holepunch_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    // reconnects re-fire on_connect; these keep the loops single-instance
    register_active: AtomicBool,
    ping_active: AtomicBool,
}

impl Supervisor {
    pub fn new(
        config: Config,
        keypair: WgKeyPair,
        source_port: u16,
        control: Arc<ControlClient>,
        http: Option<Arc<HttpServer>>,
    ) -> Self {
        let (stop_holepunch, _) = watch::channel(false);
        let (stop_register, _) = watch::channel(false);
        let (stop_ping, _) = watch::channel(false);

        Self {
            inner: Arc::new(SupervisorInner {
                config,
                keypair,
                source_port,
                control,
                http,
                device: Mutex::new(None),
                uapi: Mutex::new(None),
                wg_data: Mutex::new(None),
                monitor: Mutex::new(None),
                server_key: Arc::new(RwLock::new(None)),
                connect_times: AtomicU32::new(0),
                stop_holepunch,
                stop_register,
                stop_ping,
                holepunch_task: Mutex::new(None),
                register_active: AtomicBool::new(false),
                ping_active: AtomicBool::new(false),
            }),
        }
    }

    /// Installs the directive handlers. Must run before `start`.
    pub async fn register_handlers(&self) {
        self.register(types::HOLEPUNCH, handle_holepunch).await;
        self.register(types::CONNECT, handle_connect).await;
        self.register(types::PEER_UPDATE, handle_peer_update).await;
        self.register(types::PEER_ADD, handle_peer_add).await;
        self.register(types::PEER_REMOVE, handle_peer_remove).await;
        self.register(types::PEER_RELAY, handle_peer_relay).await;
        self.register(types::TERMINATE, handle_terminate).await;
    }

    async fn register<F, Fut>(&self, message_type: &str, handler: F)
    where
        F: Fn(Arc<SupervisorInner>, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let wrapped: MessageHandler = Arc::new(move |data| {
            let inner = Arc::clone(&inner);
            handler(inner, data).boxed()
        });
        self.inner.control.register_handler(message_type, wrapped).await;
    }

    /// Starts the hole-punch emitter and the control channel.
    #[instrument(skip(self))]
    pub async fn start(&self) {
        let task = holepunch::spawn(
            self.inner.config.endpoint.clone(),
            self.inner.config.id.clone(),
            self.inner.source_port,
            self.inner.stop_holepunch.subscribe(),
        );
        *self.inner.holepunch_task.lock().await = Some(task);

        {
            let inner = Arc::clone(&self.inner);
            self.inner
                .control
                .on_connect(Arc::new(move || {
                    let inner = Arc::clone(&inner);
                    async move {
                        info!("control channel up, announcing public key");
                        if !inner.register_active.swap(true, Ordering::SeqCst) {
                            tokio::spawn(register_loop(Arc::clone(&inner)));
                        }
                        if !inner.ping_active.swap(true, Ordering::SeqCst) {
                            tokio::spawn(ping_loop(Arc::clone(&inner)));
                        }
                        if let Some(http) = &inner.http {
                            http.set_connection_status(true);
                        }
                    }
                    .boxed()
                }))
                .await;
        }

        self.inner
            .control
            .on_token_update(Arc::new(|_token| {
                debug!("session token refreshed");
            }))
            .await;

        self.inner.control.connect();
    }

    /// Cancels every loop and closes the device. Each signal is a watch
    /// channel, so repeated shutdowns are harmless.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let _ = self.inner.stop_holepunch.send(true);
        let _ = self.inner.stop_register.send(true);
        let _ = self.inner.stop_ping.send(true);

        if let Some(task) = self.inner.holepunch_task.lock().await.take() {
            let _ = task.await;
        }

        if let Some(monitor) = self.inner.monitor.lock().await.take() {
            monitor.stop().await;
        }

        self.inner.control.close().await;

        if let Some(mut uapi) = self.inner.uapi.lock().await.take() {
            uapi.close();
        }

        if let Some(device) = self.inner.device.lock().await.take() {
            device.close().await;
        }

        if let Some(http) = &self.inner.http {
            http.set_connection_status(false);
        }

        info!("shutdown complete");
    }
}

async fn register_loop(inner: Arc<SupervisorInner>) {
    let mut stop = inner.stop_register.subscribe();
    if *stop.borrow() {
        inner.register_active.store(false, Ordering::SeqCst);
        return;
    }

    let mut ticker = tokio::time::interval(REGISTER_CADENCE);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let payload = RegisterData {
        public_key: *inner.keypair.public_key(),
    };

    loop {
        tokio::select! {
            biased;

            _ = stop.changed() => {
                if *stop.borrow() {
                    debug!("registration loop stopped");
                    break;
                }
            }

            _ = ticker.tick() => {
                if let Err(e) = inner.control.send_message(types::REGISTER, &payload).await {
                    debug!(error = %e, "registration send failed");
                }
            }
        }
    }

    inner.register_active.store(false, Ordering::SeqCst);
}

async fn ping_loop(inner: Arc<SupervisorInner>) {
    let mut stop = inner.stop_ping.subscribe();
    if *stop.borrow() {
        inner.ping_active.store(false, Ordering::SeqCst);
        return;
    }

    let mut ticker = tokio::time::interval(inner.config.ping_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = stop.changed() => {
                if *stop.borrow() {
                    debug!("ping loop stopped");
                    break;
                }
            }

            _ = ticker.tick() => {
                let send = inner.control.send_message(types::PING, serde_json::json!({}));
                match timeout(inner.config.ping_timeout, send).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(error = %e, "ping failed"),
                    Err(_) => warn!("ping timed out"),
                }
            }
        }
    }

    inner.ping_active.store(false, Ordering::SeqCst);
}

async fn handle_holepunch(inner: Arc<SupervisorInner>, data: Value) {
    let payload: HolePunchData = match serde_json::from_value(data) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "malformed hole-punch directive");
            return;
        }
    };

    debug!(server_key = %payload.server_pub_key, "cached relay server public key");
    *inner.server_key.write().await = Some(payload.server_pub_key);
}

async fn handle_connect(inner: Arc<SupervisorInner>, data: Value) {
    // handlers are dispatched serially, so this check cannot race; the
    // counter only latches on success, leaving failed attempts retryable
    if inner.connect_times.load(Ordering::SeqCst) > 0 {
        info!("already connected, ignoring new connect directive");
        return;
    }

    let wg_data: WgData = match serde_json::from_value(data) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "malformed connect directive");
            return;
        }
    };

    let _ = inner.stop_register.send(true);

    // the emitter must release the fixed source port before the device
    // binds it; await the task so the socket is actually gone
    let _ = inner.stop_holepunch.send(true);
    if let Some(task) = inner.holepunch_task.lock().await.take() {
        let _ = task.await;
    }

    let mtu = wg_data.mtu.unwrap_or(inner.config.mtu);
    let tun = match TunDevice::create(&inner.config.interface, mtu) {
        Ok(tun) => tun,
        Err(e) => {
            error!(error = %e, "failed to create TUN device");
            return;
        }
    };
    let ifname = tun.name().to_string();

    let device = match WgDevice::new(tun, inner.source_port, inner.keypair.private_key().clone())
        .await
    {
        Ok(device) => Arc::new(device),
        Err(e) => {
            error!(error = %e, "failed to bind WireGuard device");
            return;
        }
    };

    match UapiListener::bind(&ifname) {
        Ok(listener) => {
            *inner.uapi.lock().await = Some(listener.spawn(Arc::clone(&device)));
            info!("UAPI listener started");
        }
        Err(e) => error!(error = %e, "UAPI listen error"),
    }

    if let Err(e) = Arc::clone(&device).up().await {
        error!(error = %e, "failed to bring up WireGuard device");
        abort_attempt(&inner, &device).await;
        return;
    }

    let dns = wg_data.dns.clone().unwrap_or_else(|| inner.config.dns.clone());
    if let Err(e) = platform::configure_interface(&ifname, &wg_data.address, mtu, Some(dns.as_str()))
    {
        error!(error = %e, "failed to configure interface");
    }

    let monitor = Arc::new(new_monitor(&inner, Arc::clone(&device)));

    for site in &wg_data.sites {
        if let Some(http) = &inner.http {
            http.update_peer_status(site.site_id, false, None, Selection::Unknown);
        }

        let endpoint = match resolve_endpoint(&site.endpoint).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                error!(site_id = %site.site_id, error = %e, "failed to resolve site endpoint");
                abort_attempt(&inner, &device).await;
                return;
            }
        };

        if let Err(e) = device.configure_peer(site, endpoint).await {
            error!(site_id = %site.site_id, error = %e, "failed to configure peer");
            abort_attempt(&inner, &device).await;
            return;
        }

        install_route(&site.server_ip, &ifname);

        monitor.add_site(site.clone(), endpoint).await;
        info!(peer = %site.public_key, "configured peer");
    }

    monitor.start().await;

    *inner.device.lock().await = Some(device);
    *inner.wg_data.lock().await = Some(wg_data);
    *inner.monitor.lock().await = Some(monitor);
    inner.connect_times.fetch_add(1, Ordering::SeqCst);

    info!("WireGuard device created");
}

/// Tears down a half-built device so a later `connect` directive can start
/// over on a clean slate.
async fn abort_attempt(inner: &Arc<SupervisorInner>, device: &Arc<WgDevice>) {
    if let Some(mut uapi) = inner.uapi.lock().await.take() {
        uapi.close();
    }
    device.close().await;
}

fn new_monitor(inner: &Arc<SupervisorInner>, device: Arc<WgDevice>) -> PeerMonitor {
    let http = inner.http.clone();
    let notify: NotifyFn = Arc::new(move |site_id, connected, rtt, selection| {
        if let Some(http) = &http {
            http.update_peer_status(site_id, connected, rtt, selection);
        }
        if connected {
            info!(%site_id, ?rtt, ?selection, "peer is now connected");
        } else {
            warn!(%site_id, "peer is disconnected");
        }
    });

    let reconfigure: ReconfigureFn = Arc::new(move |site: SiteConfig, endpoint| {
        let device = Arc::clone(&device);
        async move { device.configure_peer(&site, endpoint).await }.boxed()
    });

    let cadence = inner.config.ping_interval;
    PeerMonitor::new(
        notify,
        reconfigure,
        Arc::clone(&inner.control),
        Arc::clone(&inner.server_key),
        MonitorConfig {
            cadence,
            probe_timeout: inner.config.ping_timeout.min(cadence),
        },
    )
}

fn install_route(server_ip: &str, ifname: &str) {
    match server_ip.parse::<IpAddr>() {
        Ok(ip) => {
            if let Err(e) = platform::add_route(ip, ifname) {
                error!(%ip, error = %e, "failed to add route for peer");
            }
        }
        Err(_) => error!(server_ip, "invalid peer overlay address"),
    }
}

async fn upsert_peer(inner: &Arc<SupervisorInner>, site: SiteConfig, add_route: bool) {
    let Some(device) = inner.device.lock().await.clone() else {
        error!("WireGuard device not initialized");
        return;
    };

    let endpoint = match resolve_endpoint(&site.endpoint).await {
        Ok(endpoint) => endpoint,
        Err(e) => {
            error!(site_id = %site.site_id, error = %e, "failed to resolve peer endpoint");
            return;
        }
    };

    if let Err(e) = device.configure_peer(&site, endpoint).await {
        error!(site_id = %site.site_id, error = %e, "failed to configure peer");
        return;
    }

    if add_route {
        install_route(&site.server_ip, device.name());
        if let Some(http) = &inner.http {
            http.update_peer_status(site.site_id, false, None, Selection::Unknown);
        }
    }

    if let Some(data) = inner.wg_data.lock().await.as_mut() {
        data.upsert_site(site.clone());
    }

    if let Some(monitor) = inner.monitor.lock().await.as_ref() {
        monitor.update_site(site.clone(), endpoint).await;
    }

    info!(site_id = %site.site_id, "peer configured");
}

async fn handle_peer_update(inner: Arc<SupervisorInner>, data: Value) {
    let payload: PeerData = match serde_json::from_value(data) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "malformed peer update directive");
            return;
        }
    };

    upsert_peer(&inner, payload.into(), false).await;
}

async fn handle_peer_add(inner: Arc<SupervisorInner>, data: Value) {
    let payload: PeerData = match serde_json::from_value(data) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "malformed peer add directive");
            return;
        }
    };

    upsert_peer(&inner, payload.into(), true).await;
}

async fn handle_peer_remove(inner: Arc<SupervisorInner>, data: Value) {
    let payload: RemovePeerData = match serde_json::from_value(data) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "malformed peer remove directive");
            return;
        }
    };

    let Some(device) = inner.device.lock().await.clone() else {
        error!("WireGuard device not initialized");
        return;
    };

    let site = {
        let mut wg_data = inner.wg_data.lock().await;
        let Some(data) = wg_data.as_mut() else {
            error!("no tunnel configuration present");
            return;
        };
        match data.remove_site(payload.site_id) {
            Some(site) => site,
            None => {
                error!(site_id = %payload.site_id, "peer not found");
                return;
            }
        }
    };

    if let Err(e) = device.remove_peer(site.site_id, &site.public_key).await {
        error!(site_id = %site.site_id, error = %e, "failed to remove peer");
    }

    match site.server_ip.parse::<IpAddr>() {
        Ok(ip) => {
            if let Err(e) = platform::remove_route(ip) {
                error!(%ip, error = %e, "failed to remove route for peer");
            }
        }
        Err(_) => error!(server_ip = %site.server_ip, "invalid peer overlay address"),
    }

    if let Some(monitor) = inner.monitor.lock().await.as_ref() {
        monitor.remove_site(site.site_id).await;
    }

    if let Some(http) = &inner.http {
        http.remove_peer(site.site_id);
    }

    info!(site_id = %site.site_id, "removed peer");
}

async fn handle_peer_relay(inner: Arc<SupervisorInner>, data: Value) {
    let payload: RelayPeerData = match serde_json::from_value(data) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "malformed peer relay directive");
            return;
        }
    };

    let Some(monitor) = inner.monitor.lock().await.clone() else {
        error!("peer monitor not running");
        return;
    };

    // resolve up front so probes and the device work on an address, not a
    // name; a literal host:port parses without touching DNS
    let relay = match resolve_endpoint(&payload.endpoint).await {
        Ok(addr) => addr,
        Err(e) => {
            warn!(endpoint = %payload.endpoint, error = %e, "failed to resolve relay endpoint");
            return;
        }
    };

    if let Err(e) = monitor.handle_failover(payload.site_id, relay).await {
        error!(site_id = %payload.site_id, error = %e, "failover failed");
    }
}

async fn handle_terminate(inner: Arc<SupervisorInner>, _data: Value) {
    info!("received terminate directive");
    inner.control.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Args, Config};

    async fn supervisor() -> Supervisor {
        let config = Config::resolve(&Args::default()).unwrap();
        let control = Arc::new(
            ControlClient::new("olm-1", "secret", "https://p.example", None)
                .await
                .unwrap(),
        );
        Supervisor::new(config, WgKeyPair::generate(), 51820, control, None)
    }

    #[test]
    fn port_picker_stays_in_range() {
        for _ in 0..16 {
            let port = find_available_udp_port(49152, 65535).unwrap();
            assert!((49152..=65535).contains(&port));
            // still bindable right after being picked
            std::net::UdpSocket::bind(("0.0.0.0", port)).unwrap();
        }
    }

    #[tokio::test]
    async fn holepunch_directive_caches_server_key() {
        let sup = supervisor().await;
        let key = *WgKeyPair::generate().public_key();

        handle_holepunch(
            Arc::clone(&sup.inner),
            serde_json::json!({ "serverPubKey": key.to_base64() }),
        )
        .await;

        assert_eq!(*sup.inner.server_key.read().await, Some(key));
    }

    #[tokio::test]
    async fn malformed_holepunch_is_dropped() {
        let sup = supervisor().await;
        handle_holepunch(Arc::clone(&sup.inner), serde_json::json!({ "nope": 1 })).await;
        assert!(sup.inner.server_key.read().await.is_none());
    }

    #[tokio::test]
    async fn peer_directives_without_device_are_ignored() {
        let sup = supervisor().await;

        handle_peer_remove(
            Arc::clone(&sup.inner),
            serde_json::json!({ "siteId": 1 }),
        )
        .await;

        handle_peer_update(
            Arc::clone(&sup.inner),
            serde_json::json!({
                "siteId": 1,
                "publicKey": WgKeyPair::generate().public_key().to_base64(),
                "endpoint": "127.0.0.1:51820",
                "serverIP": "10.0.0.1",
                "serverPort": 51820
            }),
        )
        .await;

        assert!(sup.inner.device.lock().await.is_none());
        assert!(sup.inner.wg_data.lock().await.is_none());
    }

    #[tokio::test]
    async fn relay_directive_without_monitor_is_ignored() {
        let sup = supervisor().await;
        handle_peer_relay(
            Arc::clone(&sup.inner),
            serde_json::json!({ "siteId": 1, "endpoint": "127.0.0.1:51820" }),
        )
        .await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let sup = supervisor().await;
        sup.shutdown().await;
        sup.shutdown().await;
    }
}
