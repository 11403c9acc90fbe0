// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use defguard_boringtun::x25519::{PublicKey, StaticSecret};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyError {
	#[error("invalid base64: {0}")]
	Base64(#[from] base64::DecodeError),

	#[error("key must be 32 bytes, got {0}")]
	InvalidLength(usize),
}

pub type Result<T> = std::result::Result<T, KeyError>;

fn decode_key(s: &str) -> Result<[u8; 32]> {
	let bytes = B64.decode(s.trim())?;
	let len = bytes.len();
	bytes
		.try_into()
		.map_err(|_| KeyError::InvalidLength(len))
}

/// A WireGuard Curve25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct WgPublicKey([u8; 32]);

impl WgPublicKey {
	pub fn from_bytes(bytes: [u8; 32]) -> Self {
		Self(bytes)
	}

	pub fn from_base64(s: &str) -> Result<Self> {
		Ok(Self(decode_key(s)?))
	}

	pub fn as_bytes(&self) -> &[u8; 32] {
		&self.0
	}

	pub fn to_base64(&self) -> String {
		B64.encode(self.0)
	}
}

impl fmt::Display for WgPublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.to_base64())
	}
}

impl fmt::Debug for WgPublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "WgPublicKey({})", self.to_base64())
	}
}

impl Serialize for WgPublicKey {
	fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.to_base64())
	}
}

impl<'de> Deserialize<'de> for WgPublicKey {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		Self::from_base64(&s).map_err(serde::de::Error::custom)
	}
}

/// A WireGuard private key. Never printed; `Debug` shows only the derived
/// public key.
#[derive(Clone)]
pub struct WgPrivateKey([u8; 32]);

impl WgPrivateKey {
	pub fn from_base64(s: &str) -> Result<Self> {
		Ok(Self(decode_key(s)?))
	}

	pub fn to_base64(&self) -> String {
		B64.encode(self.0)
	}

	pub fn as_bytes(&self) -> &[u8; 32] {
		&self.0
	}

	pub fn public_key(&self) -> WgPublicKey {
		let secret = StaticSecret::from(self.0);
		WgPublicKey(PublicKey::from(&secret).to_bytes())
	}
}

impl fmt::Debug for WgPrivateKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "WgPrivateKey(pub={})", self.public_key().to_base64())
	}
}

#[derive(Clone)]
pub struct WgKeyPair {
	private: WgPrivateKey,
	public: WgPublicKey,
}

impl WgKeyPair {
	/// Generates a fresh keypair. Compatible with `wg genkey`.
	pub fn generate() -> Self {
		let secret = StaticSecret::random_from_rng(rand_core::OsRng);
		Self::from_private_key(WgPrivateKey(secret.to_bytes()))
	}

	pub fn from_private_key(private: WgPrivateKey) -> Self {
		let public = private.public_key();
		Self { private, public }
	}

	pub fn private_key(&self) -> &WgPrivateKey {
		&self.private
	}

	pub fn public_key(&self) -> &WgPublicKey {
		&self.public
	}
}

impl fmt::Debug for WgKeyPair {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WgKeyPair")
			.field("public", &self.public)
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	// checks compatibility with `wg genkey | tee privatekey | wg pubkey`
	#[test]
	fn public_key_matches_wg_tools() {
		let private =
			WgPrivateKey::from_base64("cNXxrzWM8kXEF4rhnar/Hd8TrPkVglo0dqfrwzLWKmY=").unwrap();
		let public = private.public_key();
		assert_eq!(
			public.to_base64(),
			"2axsD0xz7dfxQdQzRZuq7LKorOz3uaWI6zpcGvQxnlQ="
		);
	}

	#[test]
	fn base64_roundtrip() {
		let pair = WgKeyPair::generate();
		let b64 = pair.public_key().to_base64();
		let parsed = WgPublicKey::from_base64(&b64).unwrap();
		assert_eq!(*pair.public_key(), parsed);
	}

	#[test]
	fn rejects_short_key() {
		let err = WgPublicKey::from_base64("aGVsbG8=").unwrap_err();
		assert!(matches!(err, KeyError::InvalidLength(5)));
	}

	#[test]
	fn rejects_bad_base64() {
		assert!(WgPublicKey::from_base64("not base64!!!").is_err());
	}

	#[test]
	fn generate_produces_distinct_keys() {
		let a = WgKeyPair::generate();
		let b = WgKeyPair::generate();
		assert_ne!(a.public_key(), b.public_key());
	}

	#[test]
	fn public_key_serde_as_base64_string() {
		let pair = WgKeyPair::generate();
		let json = serde_json::to_string(pair.public_key()).unwrap();
		let expected = format!("\"{}\"", pair.public_key().to_base64());
		assert_eq!(json, expected);

		let back: WgPublicKey = serde_json::from_str(&json).unwrap();
		assert_eq!(back, *pair.public_key());
	}
}
