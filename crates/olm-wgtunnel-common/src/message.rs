// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::keys::WgPublicKey;
use crate::site::{SiteConfig, SiteId};
use serde::{Deserialize, Serialize};

pub mod types {
	pub const HOLEPUNCH: &str = "olm/wg/holepunch";
	pub const CONNECT: &str = "olm/wg/connect";
	pub const PEER_UPDATE: &str = "olm/wg/peer/update";
	pub const PEER_ADD: &str = "olm/wg/peer/add";
	pub const PEER_REMOVE: &str = "olm/wg/peer/remove";
	pub const PEER_RELAY: &str = "olm/wg/peer/relay";
	pub const TERMINATE: &str = "olm/terminate";

	pub const REGISTER: &str = "newt/wg/register";
	pub const PING: &str = "olm/ping";
	pub const PEER_STATUS: &str = "olm/wg/peer/status";
}

/// Envelope shared by every control-plane frame. The payload is decoded in
/// a second pass by the handler registered for `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsMessage {
	#[serde(rename = "type")]
	pub message_type: String,
	#[serde(default)]
	pub data: serde_json::Value,
}

/// `olm/wg/holepunch`: the relay server's WireGuard public key, used to
/// authenticate monitoring probe responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HolePunchData {
	pub server_pub_key: WgPublicKey,
}

/// Shared payload of `olm/wg/peer/add` and `olm/wg/peer/update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerData {
	pub site_id: SiteId,
	pub public_key: WgPublicKey,
	pub endpoint: String,
	#[serde(rename = "serverIP")]
	pub server_ip: String,
	pub server_port: u16,
}

impl From<PeerData> for SiteConfig {
	fn from(data: PeerData) -> Self {
		SiteConfig {
			site_id: data.site_id,
			public_key: data.public_key,
			endpoint: data.endpoint,
			server_ip: data.server_ip,
			server_port: data.server_port,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovePeerData {
	pub site_id: SiteId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayPeerData {
	pub site_id: SiteId,
	pub endpoint: String,
}

/// Outbound `newt/wg/register` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterData {
	pub public_key: WgPublicKey,
}

/// Outbound `olm/wg/peer/status` payload emitted by the peer monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStatusData {
	pub site_id: SiteId,
	pub connected: bool,
	pub rtt_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn envelope_two_pass_decode() {
		let raw = r#"{"type":"olm/wg/peer/remove","data":{"siteId":7}}"#;
		let msg: WsMessage = serde_json::from_str(raw).unwrap();
		assert_eq!(msg.message_type, types::PEER_REMOVE);

		let payload: RemovePeerData = serde_json::from_value(msg.data).unwrap();
		assert_eq!(payload.site_id, SiteId(7));
	}

	#[test]
	fn envelope_tolerates_missing_data() {
		let msg: WsMessage = serde_json::from_str(r#"{"type":"olm/terminate"}"#).unwrap();
		assert_eq!(msg.message_type, types::TERMINATE);
		assert!(msg.data.is_null());
	}

	#[test]
	fn peer_data_converts_to_site_config() {
		let raw = r#"{
			"siteId": 2,
			"publicKey": "2axsD0xz7dfxQdQzRZuq7LKorOz3uaWI6zpcGvQxnlQ=",
			"endpoint": "relay.example:51820",
			"serverIP": "10.0.0.2",
			"serverPort": 51820
		}"#;
		let data: PeerData = serde_json::from_str(raw).unwrap();
		let site: SiteConfig = data.into();
		assert_eq!(site.site_id, SiteId(2));
		assert_eq!(site.endpoint, "relay.example:51820");
	}

	#[test]
	fn relay_payload_decodes() {
		let raw = r#"{"siteId":1,"endpoint":"relay.example:51820"}"#;
		let data: RelayPeerData = serde_json::from_str(raw).unwrap();
		assert_eq!(data.site_id, SiteId(1));
		assert_eq!(data.endpoint, "relay.example:51820");
	}
}
