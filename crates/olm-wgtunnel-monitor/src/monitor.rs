// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{MonitorError, Result};
use crate::failover::{self, Selection};
use crate::probe::probe_endpoint;
use futures::future::BoxFuture;
use olm_control::ControlClient;
use olm_wgtunnel_common::message::types;
use olm_wgtunnel_common::{PeerStatusData, SiteConfig, SiteId, WgPublicKey};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
	pub cadence: Duration,
	pub probe_timeout: Duration,
}

impl Default for MonitorConfig {
	fn default() -> Self {
		Self {
			cadence: Duration::from_secs(3),
			probe_timeout: Duration::from_secs(2),
		}
	}
}

/// Connection-state callback: `(site, connected, rtt, selection)`.
pub type NotifyFn = Arc<dyn Fn(SiteId, bool, Option<Duration>, Selection) + Send + Sync>;

/// Applies an endpoint change to the WireGuard device for one site.
pub type ReconfigureFn = Arc<
	dyn Fn(SiteConfig, SocketAddr) -> BoxFuture<'static, olm_wgtunnel_engine::Result<()>>
		+ Send
		+ Sync,
>;

struct SiteState {
	site: SiteConfig,
	primary_endpoint: SocketAddr,
	relay_endpoint: Option<SocketAddr>,
	selection: Selection,
	last_rtt: Option<Duration>,
	last_seen: Option<Instant>,
	consecutive_failures: u32,
	// bumped by every directive; probe results sampled under an older
	// generation are discarded, so a directive always wins the race
	generation: u64,
	announced_connected: bool,
	task: Option<tokio::task::JoinHandle<()>>,
}

/// Per-site reachability monitor and failover driver.
pub struct PeerMonitor {
	inner: Arc<MonitorInner>,
}

struct MonitorInner {
	sites: Mutex<HashMap<SiteId, SiteState>>,
	notify: NotifyFn,
	reconfigure: ReconfigureFn,
	control: Arc<ControlClient>,
	server_key: Arc<RwLock<Option<WgPublicKey>>>,
	config: MonitorConfig,
	running: AtomicBool,
	shutdown_tx: watch::Sender<bool>,
	shutdown_rx: watch::Receiver<bool>,
}

impl PeerMonitor {
	pub fn new(
		notify: NotifyFn,
		reconfigure: ReconfigureFn,
		control: Arc<ControlClient>,
		server_key: Arc<RwLock<Option<WgPublicKey>>>,
		config: MonitorConfig,
	) -> Self {
		let (shutdown_tx, shutdown_rx) = watch::channel(false);

		Self {
			inner: Arc::new(MonitorInner {
				sites: Mutex::new(HashMap::new()),
				notify,
				reconfigure,
				control,
				server_key,
				config,
				running: AtomicBool::new(false),
				shutdown_tx,
				shutdown_rx,
			}),
		}
	}

	/// Registers a site with its already-resolved primary endpoint. An
	/// existing site with the same id is replaced (`add` converges to
	/// `update`).
	#[instrument(skip(self, site), fields(site_id = %site.site_id, %primary))]
	pub async fn add_site(&self, site: SiteConfig, primary: SocketAddr) {
		let site_id = site.site_id;
		let mut sites = self.inner.sites.lock().await;

		if let Some(state) = sites.get_mut(&site_id) {
			state.generation += 1;
			state.site = site;
			state.primary_endpoint = primary;
			state.consecutive_failures = 0;
			debug!("updated monitored site");
			return;
		}

		let mut state = SiteState {
			site,
			primary_endpoint: primary,
			relay_endpoint: None,
			selection: Selection::Unknown,
			last_rtt: None,
			last_seen: None,
			consecutive_failures: 0,
			generation: 0,
			announced_connected: false,
			task: None,
		};

		if self.inner.running.load(Ordering::SeqCst) {
			state.task = Some(spawn_probe_task(Arc::clone(&self.inner), site_id));
		}

		sites.insert(site_id, state);
		info!("added monitored site");
	}

	pub async fn update_site(&self, site: SiteConfig, primary: SocketAddr) {
		self.add_site(site, primary).await;
	}

	#[instrument(skip(self), fields(site_id = %site_id))]
	pub async fn remove_site(&self, site_id: SiteId) {
		let mut sites = self.inner.sites.lock().await;
		if let Some(state) = sites.remove(&site_id) {
			if let Some(task) = state.task {
				task.abort();
			}
			info!("removed monitored site");
		}
	}

	/// Starts one probe task per registered site.
	#[instrument(skip(self))]
	pub async fn start(&self) {
		if self.inner.running.swap(true, Ordering::SeqCst) {
			return;
		}

		let mut sites = self.inner.sites.lock().await;
		for (site_id, state) in sites.iter_mut() {
			if state.task.is_none() {
				state.task = Some(spawn_probe_task(Arc::clone(&self.inner), *site_id));
			}
		}

		info!(sites = sites.len(), "peer monitor started");
	}

	/// Applies a relay directive: pins the site to `relay` and reconfigures
	/// the device. The bumped generation invalidates any in-flight probe.
	#[instrument(skip(self), fields(site_id = %site_id, %relay))]
	pub async fn handle_failover(&self, site_id: SiteId, relay: SocketAddr) -> Result<()> {
		let site = {
			let mut sites = self.inner.sites.lock().await;
			let state = sites
				.get_mut(&site_id)
				.ok_or(MonitorError::UnknownSite(site_id))?;

			state.generation += 1;
			state.relay_endpoint = Some(relay);
			state.selection = Selection::Relay;
			state.consecutive_failures = 0;
			state.announced_connected = false;
			state.site.clone()
		};

		(self.inner.reconfigure)(site, relay).await?;

		info!("failed over to relay endpoint");
		Ok(())
	}

	pub async fn selection(&self, site_id: SiteId) -> Option<Selection> {
		self.inner
			.sites
			.lock()
			.await
			.get(&site_id)
			.map(|s| s.selection)
	}

	pub async fn site_count(&self) -> usize {
		self.inner.sites.lock().await.len()
	}

	/// Stops every probe task. Idempotent.
	#[instrument(skip(self))]
	pub async fn stop(&self) {
		let _ = self.inner.shutdown_tx.send(true);
		self.inner.running.store(false, Ordering::SeqCst);

		let mut sites = self.inner.sites.lock().await;
		for state in sites.values_mut() {
			if let Some(task) = state.task.take() {
				task.abort();
			}
		}

		info!("peer monitor stopped");
	}
}

fn spawn_probe_task(inner: Arc<MonitorInner>, site_id: SiteId) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		let mut shutdown_rx = inner.shutdown_rx.clone();
		let mut ticker = tokio::time::interval(inner.config.cadence);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

		loop {
			tokio::select! {
				biased;

				_ = shutdown_rx.changed() => {
					if *shutdown_rx.borrow() {
						debug!(%site_id, "probe task shutting down");
						break;
					}
				}

				_ = ticker.tick() => {
					let Some((generation, target, selection, primary)) =
						snapshot(&inner, site_id).await
					else {
						break;
					};

					let expected = *inner.server_key.read().await;
					let result = probe_endpoint(
						target,
						inner.config.probe_timeout,
						expected.as_ref(),
					)
					.await;

					apply_probe_result(&inner, site_id, generation, result).await;

					// relay-pinned sites keep watching the primary path
					if failover::should_probe_primary(selection)
						&& probe_endpoint(primary, inner.config.probe_timeout, expected.as_ref())
							.await
							.is_ok()
					{
						revert_to_primary(&inner, site_id, generation).await;
					}
				}
			}
		}
	})
}

async fn snapshot(
	inner: &MonitorInner,
	site_id: SiteId,
) -> Option<(u64, SocketAddr, Selection, SocketAddr)> {
	let sites = inner.sites.lock().await;
	let state = sites.get(&site_id)?;

	let target = match state.selection {
		Selection::Relay => state.relay_endpoint.unwrap_or(state.primary_endpoint),
		_ => state.primary_endpoint,
	};

	Some((
		state.generation,
		target,
		state.selection,
		state.primary_endpoint,
	))
}

async fn apply_probe_result(
	inner: &MonitorInner,
	site_id: SiteId,
	generation: u64,
	result: Result<Duration>,
) {
	let event = {
		let mut sites = inner.sites.lock().await;
		let Some(state) = sites.get_mut(&site_id) else {
			return;
		};

		if state.generation != generation {
			debug!(%site_id, "discarding stale probe result");
			return;
		}

		match result {
			Ok(rtt) => {
				state.consecutive_failures = 0;
				state.last_rtt = Some(rtt);
				state.last_seen = Some(Instant::now());
				state.selection = failover::after_success(state.selection);

				if !state.announced_connected {
					state.announced_connected = true;
					Some((true, Some(rtt), state.selection))
				} else {
					None
				}
			}
			Err(e) => {
				state.consecutive_failures += 1;
				state.selection =
					failover::after_failure(state.selection, state.consecutive_failures);

				if failover::crossed_threshold(state.consecutive_failures)
					&& state.announced_connected
				{
					state.announced_connected = false;
					debug!(%site_id, error = %e, "site became unreachable");
					Some((false, None, state.selection))
				} else {
					None
				}
			}
		}
	};

	if let Some((connected, rtt, selection)) = event {
		(inner.notify)(site_id, connected, rtt, selection);
		emit_status(inner, site_id, connected, rtt).await;
	}
}

async fn revert_to_primary(inner: &MonitorInner, site_id: SiteId, generation: u64) {
	let reverted = {
		let mut sites = inner.sites.lock().await;
		let Some(state) = sites.get_mut(&site_id) else {
			return;
		};

		// a newer directive outranks this probe observation
		if state.generation != generation || state.selection != Selection::Relay {
			return;
		}

		state.generation += 1;
		state.selection = Selection::Primary;
		state.consecutive_failures = 0;
		state.announced_connected = false;
		Some((state.site.clone(), state.primary_endpoint))
	};

	if let Some((site, primary)) = reverted {
		info!(%site_id, "primary path recovered, reverting from relay");
		if let Err(e) = (inner.reconfigure)(site, primary).await {
			warn!(%site_id, error = %e, "failed to reconfigure peer back to primary");
		}
	}
}

async fn emit_status(inner: &MonitorInner, site_id: SiteId, connected: bool, rtt: Option<Duration>) {
	let status = PeerStatusData {
		site_id,
		connected,
		rtt_ms: rtt.map(|d| d.as_millis() as u64),
	};

	if let Err(e) = inner.control.send_message(types::PEER_STATUS, &status).await {
		debug!(error = %e, "could not emit peer status");
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::probe::{build_probe_response, REQUEST_LEN};
	use olm_wgtunnel_common::WgKeyPair;
	use std::sync::Mutex as StdMutex;
	use tokio::net::UdpSocket;

	fn test_config() -> MonitorConfig {
		MonitorConfig {
			cadence: Duration::from_millis(50),
			probe_timeout: Duration::from_millis(40),
		}
	}

	fn site(id: u64, endpoint: SocketAddr) -> SiteConfig {
		SiteConfig {
			site_id: SiteId(id),
			public_key: *WgKeyPair::generate().public_key(),
			endpoint: endpoint.to_string(),
			server_ip: "10.0.0.1".to_string(),
			server_port: endpoint.port(),
		}
	}

	async fn control() -> Arc<ControlClient> {
		Arc::new(
			ControlClient::new("olm-test", "secret", "https://p.example", None)
				.await
				.unwrap(),
		)
	}

	type Events = Arc<StdMutex<Vec<(SiteId, bool)>>>;

	fn monitor_with(
		control: Arc<ControlClient>,
		reconfigured: Arc<StdMutex<Vec<SocketAddr>>>,
	) -> (PeerMonitor, Events) {
		let events: Events = Arc::default();
		let notify_events = Arc::clone(&events);

		let monitor = PeerMonitor::new(
			Arc::new(move |id, connected, _rtt, _selection| {
				notify_events.lock().unwrap().push((id, connected));
			}),
			Arc::new(move |_site, endpoint| {
				let reconfigured = Arc::clone(&reconfigured);
				Box::pin(async move {
					reconfigured.lock().unwrap().push(endpoint);
					Ok(())
				})
			}),
			control,
			Arc::new(RwLock::new(None)),
			test_config(),
		);

		(monitor, events)
	}

	async fn spawn_responder() -> SocketAddr {
		let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let addr = socket.local_addr().unwrap();
		let key = *WgKeyPair::generate().public_key();

		tokio::spawn(async move {
			let mut buf = [0u8; 64];
			while let Ok((len, from)) = socket.recv_from(&mut buf).await {
				if len == REQUEST_LEN {
					let seq = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]);
					let _ = socket.send_to(&build_probe_response(seq, &key), from).await;
				}
			}
		});

		addr
	}

	async fn wait_for_selection(
		monitor: &PeerMonitor,
		site_id: SiteId,
		want: Selection,
	) -> bool {
		for _ in 0..100 {
			if monitor.selection(site_id).await == Some(want) {
				return true;
			}
			tokio::time::sleep(Duration::from_millis(20)).await;
		}
		false
	}

	#[tokio::test]
	async fn first_success_promotes_to_primary_and_notifies() {
		let target = spawn_responder().await;
		let (monitor, events) = monitor_with(control().await, Arc::default());

		monitor.add_site(site(1, target), target).await;
		monitor.start().await;

		assert!(wait_for_selection(&monitor, SiteId(1), Selection::Primary).await);
		assert!(events
			.lock()
			.unwrap()
			.contains(&(SiteId(1), true)));

		monitor.stop().await;
	}

	#[tokio::test]
	async fn repeated_failures_mark_unreachable() {
		// bound but never answered
		let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let target = silent.local_addr().unwrap();

		let (monitor, events) = monitor_with(control().await, Arc::default());
		monitor.add_site(site(1, target), target).await;

		// pretend a previous success announced the site
		{
			let mut sites = monitor.inner.sites.lock().await;
			let state = sites.get_mut(&SiteId(1)).unwrap();
			state.selection = Selection::Primary;
			state.announced_connected = true;
		}

		monitor.start().await;

		assert!(wait_for_selection(&monitor, SiteId(1), Selection::Unreachable).await);
		assert!(events
			.lock()
			.unwrap()
			.contains(&(SiteId(1), false)));

		monitor.stop().await;
	}

	#[tokio::test]
	async fn failover_directive_pins_relay() {
		let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let target = silent.local_addr().unwrap();
		let relay: SocketAddr = "127.0.0.1:55555".parse().unwrap();

		let reconfigured: Arc<StdMutex<Vec<SocketAddr>>> = Arc::default();
		let (monitor, _) = monitor_with(control().await, Arc::clone(&reconfigured));

		monitor.add_site(site(1, target), target).await;
		monitor.handle_failover(SiteId(1), relay).await.unwrap();

		assert_eq!(
			monitor.selection(SiteId(1)).await,
			Some(Selection::Relay)
		);
		assert_eq!(reconfigured.lock().unwrap().as_slice(), &[relay]);
	}

	#[tokio::test]
	async fn failover_for_unknown_site_errors() {
		let (monitor, _) = monitor_with(control().await, Arc::default());
		let err = monitor
			.handle_failover(SiteId(9), "127.0.0.1:1".parse().unwrap())
			.await
			.unwrap_err();
		assert!(matches!(err, MonitorError::UnknownSite(SiteId(9))));
	}

	#[tokio::test]
	async fn relay_reverts_when_primary_recovers() {
		let primary = spawn_responder().await;
		let relay = spawn_responder().await;

		let reconfigured: Arc<StdMutex<Vec<SocketAddr>>> = Arc::default();
		let (monitor, _) = monitor_with(control().await, Arc::clone(&reconfigured));

		monitor.add_site(site(1, primary), primary).await;
		monitor.handle_failover(SiteId(1), relay).await.unwrap();
		monitor.start().await;

		assert!(wait_for_selection(&monitor, SiteId(1), Selection::Primary).await);
		assert_eq!(
			reconfigured.lock().unwrap().last().copied(),
			Some(primary)
		);

		monitor.stop().await;
	}

	#[tokio::test]
	async fn add_with_existing_id_updates_in_place() {
		let (monitor, _) = monitor_with(control().await, Arc::default());
		let target: SocketAddr = "127.0.0.1:50000".parse().unwrap();
		let moved: SocketAddr = "127.0.0.1:50001".parse().unwrap();

		monitor.add_site(site(1, target), target).await;
		monitor.add_site(site(1, moved), moved).await;

		assert_eq!(monitor.site_count().await, 1);
		let sites = monitor.inner.sites.lock().await;
		assert_eq!(sites.get(&SiteId(1)).unwrap().primary_endpoint, moved);
	}

	#[tokio::test]
	async fn remove_site_stops_tracking() {
		let (monitor, _) = monitor_with(control().await, Arc::default());
		let target: SocketAddr = "127.0.0.1:50000".parse().unwrap();

		monitor.add_site(site(1, target), target).await;
		monitor.remove_site(SiteId(1)).await;
		assert_eq!(monitor.site_count().await, 0);

		// removing again is harmless
		monitor.remove_site(SiteId(1)).await;
	}
}
