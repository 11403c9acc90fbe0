// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

pub mod keys;
pub mod message;
pub mod site;

pub use keys::{KeyError, WgKeyPair, WgPrivateKey, WgPublicKey};
pub use message::{
	HolePunchData, PeerData, PeerStatusData, RegisterData, RelayPeerData, RemovePeerData,
	WsMessage,
};
pub use site::{SiteConfig, SiteId, WgData};
