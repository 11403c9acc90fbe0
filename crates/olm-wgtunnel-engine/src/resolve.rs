// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{EngineError, Result};
use std::net::SocketAddr;
use tracing::debug;

/// Resolves a `host:port` endpoint string to a socket address. Literal
/// addresses short-circuit; names go through the system resolver and the
/// first answer wins.
pub async fn resolve_endpoint(endpoint: &str) -> Result<SocketAddr> {
	if let Ok(addr) = endpoint.parse::<SocketAddr>() {
		return Ok(addr);
	}

	let mut addrs = tokio::net::lookup_host(endpoint)
		.await
		.map_err(|_| EngineError::Resolve(endpoint.to_string()))?;

	let addr = addrs
		.next()
		.ok_or_else(|| EngineError::Resolve(endpoint.to_string()))?;

	debug!(endpoint, %addr, "resolved endpoint");
	Ok(addr)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn literal_addr_short_circuits() {
		let addr = resolve_endpoint("1.2.3.4:51820").await.unwrap();
		assert_eq!(addr, "1.2.3.4:51820".parse().unwrap());
	}

	#[tokio::test]
	async fn localhost_resolves() {
		let addr = resolve_endpoint("localhost:51820").await.unwrap();
		assert_eq!(addr.port(), 51820);
		assert!(addr.ip().is_loopback());
	}

	#[tokio::test]
	async fn unresolvable_name_errors() {
		let err = resolve_endpoint("no-such-host.invalid:51820")
			.await
			.unwrap_err();
		assert!(matches!(err, EngineError::Resolve(_)));
	}
}
