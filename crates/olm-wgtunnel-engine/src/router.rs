// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use olm_wgtunnel_common::WgPublicKey;
use std::collections::HashMap;
use std::net::IpAddr;

/// Maps a peer's overlay IP to its public key. Allowed IPs are exact hosts
/// (`/32`), so a plain map lookup is sufficient.
#[derive(Debug, Default)]
pub struct Router {
	routes: HashMap<IpAddr, WgPublicKey>,
}

impl Router {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add_route(&mut self, ip: IpAddr, peer: WgPublicKey) {
		self.routes.insert(ip, peer);
	}

	pub fn route(&self, dst: IpAddr) -> Option<&WgPublicKey> {
		self.routes.get(&dst)
	}

	pub fn remove_peer(&mut self, peer: &WgPublicKey) {
		self.routes.retain(|_, key| key != peer);
	}

	pub fn len(&self) -> usize {
		self.routes.len()
	}

	pub fn is_empty(&self) -> bool {
		self.routes.is_empty()
	}
}

/// Extracts the destination address from a raw IP packet, v4 or v6.
pub fn extract_dst_ip(packet: &[u8]) -> Option<IpAddr> {
	match packet.first()? >> 4 {
		4 if packet.len() >= 20 => {
			let mut dst = [0u8; 4];
			dst.copy_from_slice(&packet[16..20]);
			Some(IpAddr::from(dst))
		}
		6 if packet.len() >= 40 => {
			let mut dst = [0u8; 16];
			dst.copy_from_slice(&packet[24..40]);
			Some(IpAddr::from(dst))
		}
		_ => None,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use olm_wgtunnel_common::WgKeyPair;

	#[test]
	fn exact_host_lookup() {
		let mut router = Router::new();
		let key = *WgKeyPair::generate().public_key();
		let ip: IpAddr = "10.0.0.1".parse().unwrap();

		router.add_route(ip, key);
		assert_eq!(router.route(ip), Some(&key));
		assert!(router.route("10.0.0.2".parse().unwrap()).is_none());
	}

	#[test]
	fn remove_peer_drops_all_its_routes() {
		let mut router = Router::new();
		let key = *WgKeyPair::generate().public_key();
		let other = *WgKeyPair::generate().public_key();

		router.add_route("10.0.0.1".parse().unwrap(), key);
		router.add_route("10.0.0.2".parse().unwrap(), key);
		router.add_route("10.0.0.3".parse().unwrap(), other);

		router.remove_peer(&key);
		assert_eq!(router.len(), 1);
		assert_eq!(router.route("10.0.0.3".parse().unwrap()), Some(&other));
	}

	#[test]
	fn extract_ipv4_dst() {
		let mut packet = vec![0u8; 20];
		packet[0] = 0x45;
		packet[16..20].copy_from_slice(&[10, 0, 0, 7]);
		assert_eq!(
			extract_dst_ip(&packet),
			Some("10.0.0.7".parse::<IpAddr>().unwrap())
		);
	}

	#[test]
	fn extract_ipv6_dst() {
		let mut packet = vec![0u8; 40];
		packet[0] = 0x60;
		let dst: std::net::Ipv6Addr = "fd00::7".parse().unwrap();
		packet[24..40].copy_from_slice(&dst.octets());
		assert_eq!(extract_dst_ip(&packet), Some(IpAddr::from(dst)));
	}

	#[test]
	fn extract_rejects_truncated() {
		assert!(extract_dst_ip(&[0x45u8; 10]).is_none());
		assert!(extract_dst_ip(&[]).is_none());
	}
}
