// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::keys::WgPublicKey;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric identifier of a remote site. Unique within the peer set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(pub u64);

impl fmt::Display for SiteId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// One remote WireGuard peer as announced by the control plane.
///
/// `endpoint` is a `host:port` string and may carry a DNS name; it is
/// resolved at configuration time, not here. `server_ip` is the peer's
/// overlay address and doubles as the allowed-IP/route target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteConfig {
	pub site_id: SiteId,
	pub public_key: WgPublicKey,
	pub endpoint: String,
	#[serde(rename = "serverIP")]
	pub server_ip: String,
	pub server_port: u16,
}

/// Initial tunnel configuration delivered by the `connect` directive.
/// Sites are mutated in place afterwards by `peer/add|update|remove`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WgData {
	pub address: String,
	#[serde(default)]
	pub mtu: Option<u16>,
	#[serde(default)]
	pub dns: Option<String>,
	pub sites: Vec<SiteConfig>,
}

impl WgData {
	pub fn site(&self, id: SiteId) -> Option<&SiteConfig> {
		self.sites.iter().find(|s| s.site_id == id)
	}

	/// Inserts or replaces the site with the same id. Returns true when an
	/// existing entry was replaced.
	pub fn upsert_site(&mut self, site: SiteConfig) -> bool {
		if let Some(existing) = self.sites.iter_mut().find(|s| s.site_id == site.site_id) {
			*existing = site;
			true
		} else {
			self.sites.push(site);
			false
		}
	}

	/// Removes the site by id, returning it when present.
	pub fn remove_site(&mut self, id: SiteId) -> Option<SiteConfig> {
		let pos = self.sites.iter().position(|s| s.site_id == id)?;
		Some(self.sites.remove(pos))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::keys::WgKeyPair;

	fn site(id: u64) -> SiteConfig {
		SiteConfig {
			site_id: SiteId(id),
			public_key: *WgKeyPair::generate().public_key(),
			endpoint: "1.2.3.4:51820".to_string(),
			server_ip: "10.0.0.1".to_string(),
			server_port: 51820,
		}
	}

	#[test]
	fn site_config_wire_format() {
		let json = r#"{
			"siteId": 1,
			"publicKey": "2axsD0xz7dfxQdQzRZuq7LKorOz3uaWI6zpcGvQxnlQ=",
			"endpoint": "1.2.3.4:51820",
			"serverIP": "10.0.0.1",
			"serverPort": 51820
		}"#;

		let parsed: SiteConfig = serde_json::from_str(json).unwrap();
		assert_eq!(parsed.site_id, SiteId(1));
		assert_eq!(parsed.server_ip, "10.0.0.1");
		assert_eq!(parsed.server_port, 51820);

		let back = serde_json::to_value(&parsed).unwrap();
		assert!(back.get("serverIP").is_some());
		assert!(back.get("siteId").is_some());
	}

	#[test]
	fn wg_data_optional_fields_default() {
		let json = r#"{"address": "10.0.0.2/24", "sites": []}"#;
		let parsed: WgData = serde_json::from_str(json).unwrap();
		assert!(parsed.mtu.is_none());
		assert!(parsed.dns.is_none());
		assert!(parsed.sites.is_empty());
	}

	#[test]
	fn upsert_replaces_same_site_id() {
		let mut data = WgData {
			address: "10.0.0.2/24".to_string(),
			mtu: None,
			dns: None,
			sites: vec![site(1)],
		};

		let mut replacement = site(1);
		replacement.endpoint = "5.6.7.8:51820".to_string();

		assert!(data.upsert_site(replacement.clone()));
		assert_eq!(data.sites.len(), 1);
		assert_eq!(data.sites[0].endpoint, "5.6.7.8:51820");

		assert!(!data.upsert_site(site(2)));
		assert_eq!(data.sites.len(), 2);
	}

	#[test]
	fn remove_unknown_site_is_none() {
		let mut data = WgData {
			address: "10.0.0.2/24".to_string(),
			mtu: None,
			dns: None,
			sites: vec![site(1)],
		};

		assert!(data.remove_site(SiteId(9)).is_none());
		let removed = data.remove_site(SiteId(1)).unwrap();
		assert_eq!(removed.site_id, SiteId(1));
		assert!(data.sites.is_empty());
	}
}
