// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{EngineError, Result};
use crate::router::{extract_dst_ip, Router};
use crate::tun::TunDevice;
use defguard_boringtun::noise::{Tunn, TunnResult};
use defguard_boringtun::x25519::{PublicKey, StaticSecret};
use olm_wgtunnel_common::{SiteConfig, SiteId, WgPrivateKey, WgPublicKey};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, instrument, trace, warn};

pub const PERSISTENT_KEEPALIVE: u16 = 25;

const TIMER_TICK: std::time::Duration = std::time::Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
	Created,
	Up,
	Closed,
}

struct PeerTunnel {
	site_id: SiteId,
	public_key: WgPublicKey,
	allowed_ip: IpAddr,
	keepalive: u16,
	tunn: Mutex<Tunn>,
	endpoint: RwLock<SocketAddr>,
}

pub(crate) struct PeerSnapshot {
	pub public_key: WgPublicKey,
	pub endpoint: SocketAddr,
	pub allowed_ip: IpAddr,
	pub keepalive: u16,
}

/// The process-wide WireGuard device. Created at most once, on the first
/// `connect` directive, after the hole-punch loop has released the fixed
/// source port.
pub struct WgDevice {
	private_key: WgPrivateKey,
	udp: UdpSocket,
	tun: TunDevice,
	peers: RwLock<Vec<Arc<PeerTunnel>>>,
	router: RwLock<Router>,
	state: Mutex<DeviceState>,
	shutdown_tx: watch::Sender<bool>,
	shutdown_rx: watch::Receiver<bool>,
	next_index: AtomicU32,
}

impl WgDevice {
	/// Binds the data-plane UDP socket to `source_port`. The caller must have
	/// stopped the hole-punch emitter before this point; the port is expected
	/// to be free.
	#[instrument(skip(tun, private_key), fields(ifname = %tun.name(), source_port))]
	pub async fn new(tun: TunDevice, source_port: u16, private_key: WgPrivateKey) -> Result<Self> {
		let udp = UdpSocket::bind(("0.0.0.0", source_port)).await?;
		let (shutdown_tx, shutdown_rx) = watch::channel(false);

		info!("created WireGuard device");

		Ok(Self {
			private_key,
			udp,
			tun,
			peers: RwLock::new(Vec::new()),
			router: RwLock::new(Router::new()),
			state: Mutex::new(DeviceState::Created),
			shutdown_tx,
			shutdown_rx,
			next_index: AtomicU32::new(0),
		})
	}

	pub fn name(&self) -> &str {
		self.tun.name()
	}

	pub fn listen_port(&self) -> u16 {
		self.udp
			.local_addr()
			.map(|a| a.port())
			.unwrap_or_default()
	}

	pub(crate) fn private_key(&self) -> &WgPrivateKey {
		&self.private_key
	}

	pub async fn state(&self) -> DeviceState {
		*self.state.lock().await
	}

	/// Brings the device up: spawns the recv, send, and timer loops.
	#[instrument(skip(self))]
	pub async fn up(self: Arc<Self>) -> Result<()> {
		let mut state = self.state.lock().await;
		match *state {
			DeviceState::Created => *state = DeviceState::Up,
			DeviceState::Up => return Ok(()),
			DeviceState::Closed => return Err(EngineError::Closed),
		}
		drop(state);

		Arc::clone(&self).spawn_recv_loop();
		Arc::clone(&self).spawn_send_loop();
		Arc::clone(&self).spawn_timer_loop();

		info!("device is up");
		Ok(())
	}

	/// Upserts a peer. A known public key only has its endpoint and
	/// keepalive refreshed, allowed IPs stay untouched. A known site id with
	/// a new public key replaces the old peer (key rotation).
	#[instrument(skip(self, site), fields(site_id = %site.site_id, endpoint = %endpoint))]
	pub async fn configure_peer(&self, site: &SiteConfig, endpoint: SocketAddr) -> Result<()> {
		if *self.state.lock().await == DeviceState::Closed {
			return Err(EngineError::Closed);
		}

		let allowed_ip: IpAddr = site
			.server_ip
			.parse()
			.map_err(|_| EngineError::InvalidAddress(site.server_ip.clone()))?;

		let mut peers = self.peers.write().await;

		if let Some(peer) = peers.iter().find(|p| p.public_key == site.public_key) {
			*peer.endpoint.write().await = endpoint;
			debug!("refreshed endpoint for existing peer");
			return Ok(());
		}

		// key rotation: drop the previous tunnel for this site first
		if let Some(pos) = peers.iter().position(|p| p.site_id == site.site_id) {
			let old = peers.remove(pos);
			self.router.write().await.remove_peer(&old.public_key);
			debug!(old_key = %old.public_key, "replaced peer key for site");
		}

		let index = self.next_index.fetch_add(1, Ordering::Relaxed);
		let tunn = Tunn::new(
			StaticSecret::from(*self.private_key.as_bytes()),
			PublicKey::from(*site.public_key.as_bytes()),
			None,
			Some(PERSISTENT_KEEPALIVE),
			index,
			None,
		);

		peers.push(Arc::new(PeerTunnel {
			site_id: site.site_id,
			public_key: site.public_key,
			allowed_ip,
			keepalive: PERSISTENT_KEEPALIVE,
			tunn: Mutex::new(tunn),
			endpoint: RwLock::new(endpoint),
		}));

		self.router.write().await.add_route(allowed_ip, site.public_key);

		info!(peer = %site.public_key, "configured peer");
		Ok(())
	}

	#[instrument(skip(self), fields(site_id = %site_id, peer = %public_key))]
	pub async fn remove_peer(&self, site_id: SiteId, public_key: &WgPublicKey) -> Result<()> {
		let mut peers = self.peers.write().await;
		let before = peers.len();
		peers.retain(|p| !(p.site_id == site_id && p.public_key == *public_key));

		if peers.len() == before {
			return Err(EngineError::PeerNotFound(site_id));
		}

		self.router.write().await.remove_peer(public_key);

		info!("removed peer");
		Ok(())
	}

	pub async fn peer_endpoint(&self, site_id: SiteId) -> Option<SocketAddr> {
		let peers = self.peers.read().await;
		for peer in peers.iter() {
			if peer.site_id == site_id {
				return Some(*peer.endpoint.read().await);
			}
		}
		None
	}

	pub async fn peer_count(&self) -> usize {
		self.peers.read().await.len()
	}

	pub(crate) async fn snapshot_peers(&self) -> Vec<PeerSnapshot> {
		let peers = self.peers.read().await;
		let mut out = Vec::with_capacity(peers.len());
		for peer in peers.iter() {
			out.push(PeerSnapshot {
				public_key: peer.public_key,
				endpoint: *peer.endpoint.read().await,
				allowed_ip: peer.allowed_ip,
				keepalive: peer.keepalive,
			});
		}
		out
	}

	/// Shuts the device down. Safe to call more than once.
	#[instrument(skip(self))]
	pub async fn close(&self) {
		let mut state = self.state.lock().await;
		if *state == DeviceState::Closed {
			return;
		}
		*state = DeviceState::Closed;
		drop(state);

		let _ = self.shutdown_tx.send(true);

		self.peers.write().await.clear();

		#[cfg(any(target_os = "linux", target_os = "macos"))]
		crate::platform::restore_dns();

		info!("closed WireGuard device");
	}

	fn spawn_recv_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
		let mut shutdown_rx = self.shutdown_rx.clone();

		tokio::spawn(async move {
			let mut buf = vec![0u8; 65536];
			let mut dst_buf = vec![0u8; 65536];

			loop {
				tokio::select! {
					biased;

					_ = shutdown_rx.changed() => {
						if *shutdown_rx.borrow() {
							debug!("recv loop shutting down");
							break;
						}
					}

					result = self.udp.recv_from(&mut buf) => {
						match result {
							Ok((len, from)) => {
								self.handle_inbound(&buf[..len], from, &mut dst_buf).await;
							}
							Err(e) => {
								warn!(error = %e, "UDP recv error");
							}
						}
					}
				}
			}
		})
	}

	async fn handle_inbound(&self, datagram: &[u8], from: SocketAddr, dst_buf: &mut [u8]) {
		let peers = self.peers.read().await;

		// fast path: source address matches a configured endpoint
		let mut matched = None;
		for peer in peers.iter() {
			if *peer.endpoint.read().await == from {
				matched = Some(Arc::clone(peer));
				break;
			}
		}

		let candidates: Vec<Arc<PeerTunnel>> = match matched {
			Some(peer) => vec![peer],
			None => peers.iter().cloned().collect(),
		};
		drop(peers);

		for peer in candidates {
			let mut tunn = peer.tunn.lock().await;
			let result = tunn.decapsulate(None, datagram, dst_buf);
			drop(tunn);

			match result {
				TunnResult::Done => {
					trace!(peer = %peer.public_key, "packet processed, no output");
					return;
				}
				TunnResult::WriteToNetwork(data) => {
					trace!(len = data.len(), "sending handshake response");
					if let Err(e) = self.udp.send_to(data, from).await {
						warn!(error = %e, "failed to send handshake response");
					}
					self.note_roaming(&peer, from).await;
					return;
				}
				TunnResult::WriteToTunnelV4(data, _) | TunnResult::WriteToTunnelV6(data, _) => {
					trace!(len = data.len(), "decrypted packet for TUN");
					if let Err(e) = self.tun.send(data).await {
						warn!(error = %e, "failed to write packet to TUN");
					}
					self.note_roaming(&peer, from).await;
					return;
				}
				TunnResult::Err(e) => {
					trace!(peer = %peer.public_key, ?e, "decapsulate failed, trying next peer");
				}
			}
		}

		debug!(?from, "dropped datagram matching no peer");
	}

	async fn note_roaming(&self, peer: &PeerTunnel, from: SocketAddr) {
		let mut endpoint = peer.endpoint.write().await;
		if *endpoint != from {
			info!(peer = %peer.public_key, old = %*endpoint, new = %from, "peer endpoint roamed");
			*endpoint = from;
		}
	}

	fn spawn_send_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
		let mut shutdown_rx = self.shutdown_rx.clone();

		tokio::spawn(async move {
			let mut buf = vec![0u8; 65536];
			let mut dst_buf = vec![0u8; 65536];

			loop {
				tokio::select! {
					biased;

					_ = shutdown_rx.changed() => {
						if *shutdown_rx.borrow() {
							debug!("send loop shutting down");
							break;
						}
					}

					result = self.tun.recv(&mut buf) => {
						match result {
							Ok(len) => {
								self.handle_outbound(&buf[..len], &mut dst_buf).await;
							}
							Err(e) => {
								warn!(error = %e, "TUN read error");
							}
						}
					}
				}
			}
		})
	}

	async fn handle_outbound(&self, packet: &[u8], dst_buf: &mut [u8]) {
		let Some(dst) = extract_dst_ip(packet) else {
			return;
		};

		let Some(key) = self.router.read().await.route(dst).copied() else {
			trace!(%dst, "no route for destination");
			return;
		};

		let peers = self.peers.read().await;
		let Some(peer) = peers.iter().find(|p| p.public_key == key).cloned() else {
			return;
		};
		drop(peers);

		let mut tunn = peer.tunn.lock().await;
		let result = tunn.encapsulate(packet, dst_buf);
		drop(tunn);

		match result {
			TunnResult::WriteToNetwork(data) => {
				let endpoint = *peer.endpoint.read().await;
				trace!(len = data.len(), %endpoint, "sending encrypted packet");
				if let Err(e) = self.udp.send_to(data, endpoint).await {
					warn!(error = %e, "failed to send encrypted packet");
				}
			}
			TunnResult::Done => {
				trace!("encapsulate queued packet until handshake completes");
			}
			TunnResult::Err(e) => {
				debug!(peer = %peer.public_key, ?e, "encapsulate error");
			}
			_ => {}
		}
	}

	fn spawn_timer_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
		let mut shutdown_rx = self.shutdown_rx.clone();

		tokio::spawn(async move {
			let mut dst_buf = vec![0u8; 65536];

			loop {
				tokio::select! {
					biased;

					_ = shutdown_rx.changed() => {
						if *shutdown_rx.borrow() {
							debug!("timer loop shutting down");
							break;
						}
					}

					_ = tokio::time::sleep(TIMER_TICK) => {
						let peers: Vec<Arc<PeerTunnel>> =
							self.peers.read().await.iter().cloned().collect();

						for peer in peers {
							let mut tunn = peer.tunn.lock().await;
							let result = tunn.update_timers(&mut dst_buf);
							drop(tunn);

							match result {
								TunnResult::WriteToNetwork(data) => {
									let endpoint = *peer.endpoint.read().await;
									trace!(len = data.len(), peer = %peer.public_key, "sending keepalive/handshake");
									if let Err(e) = self.udp.send_to(data, endpoint).await {
										warn!(peer = %peer.public_key, error = %e, "failed to send timer packet");
									}
								}
								TunnResult::Err(e) => {
									trace!(peer = %peer.public_key, ?e, "timer update error");
								}
								_ => {}
							}
						}
					}
				}
			}
		})
	}
}
