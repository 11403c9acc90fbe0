// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::Result;
use crate::probe::probe_endpoint;
use olm_wgtunnel_engine::resolve_endpoint;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::instrument;

/// Default timeout for the one-shot connectivity test.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(2);

/// One-shot connectivity tester behind `--test`. Probes a single target
/// without touching the control plane.
pub struct TesterClient {
	target: SocketAddr,
}

impl TesterClient {
	#[instrument]
	pub async fn new(target: &str) -> Result<Self> {
		let target = resolve_endpoint(target).await?;
		Ok(Self { target })
	}

	pub fn target(&self) -> SocketAddr {
		self.target
	}

	/// Probes once. `Some(rtt)` on reply, `None` on timeout or any other
	/// probe failure.
	pub async fn test_connection(&self, timeout: Duration) -> Option<Duration> {
		probe_endpoint(self.target, timeout, None).await.ok()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::probe::{build_probe_response, REQUEST_LEN};
	use olm_wgtunnel_common::WgKeyPair;
	use tokio::net::UdpSocket;

	#[tokio::test]
	async fn tester_reports_rtt_on_reply() {
		let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let addr = responder.local_addr().unwrap();

		let key = *WgKeyPair::generate().public_key();
		tokio::spawn(async move {
			let mut buf = [0u8; 64];
			let (len, from) = responder.recv_from(&mut buf).await.unwrap();
			assert_eq!(len, REQUEST_LEN);
			let seq = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]);
			responder
				.send_to(&build_probe_response(seq, &key), from)
				.await
				.unwrap();
		});

		let tester = TesterClient::new(&addr.to_string()).await.unwrap();
		assert!(tester.test_connection(TEST_TIMEOUT).await.is_some());
	}

	#[tokio::test]
	async fn tester_reports_none_on_timeout() {
		let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let addr = silent.local_addr().unwrap();

		let tester = TesterClient::new(&addr.to_string()).await.unwrap();
		assert!(tester
			.test_connection(Duration::from_millis(100))
			.await
			.is_none());
	}
}
