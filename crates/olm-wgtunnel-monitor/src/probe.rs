// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Reachability probe wire format and the probe round-trip itself.
//!
//! Request:  `magic(4) | kind(1)=0x01 | seq(u32 be)`
//! Response: `magic(4) | kind(1)=0x02 | seq(u32 be) | server_pubkey(32)`
//!
//! The responder runs next to each site's WireGuard listener; the embedded
//! public key lets the monitor reject responses forged by third parties once
//! the control plane has announced the expected key.

use crate::error::{MonitorError, Result};
use olm_wgtunnel_common::WgPublicKey;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

pub const PROBE_MAGIC: &[u8; 4] = b"OLMP";

const KIND_REQUEST: u8 = 0x01;
const KIND_RESPONSE: u8 = 0x02;

pub const REQUEST_LEN: usize = 9;
pub const RESPONSE_LEN: usize = 41;

pub fn build_probe_request(seq: u32) -> [u8; REQUEST_LEN] {
	let mut packet = [0u8; REQUEST_LEN];
	packet[..4].copy_from_slice(PROBE_MAGIC);
	packet[4] = KIND_REQUEST;
	packet[5..9].copy_from_slice(&seq.to_be_bytes());
	packet
}

/// Parses a response, checking magic, kind, and sequence. Returns the
/// responder's public key for validation by the caller.
pub fn parse_probe_response(data: &[u8], expected_seq: u32) -> Result<WgPublicKey> {
	if data.len() < RESPONSE_LEN {
		return Err(MonitorError::InvalidResponse);
	}
	if &data[..4] != PROBE_MAGIC || data[4] != KIND_RESPONSE {
		return Err(MonitorError::InvalidResponse);
	}

	let seq = u32::from_be_bytes([data[5], data[6], data[7], data[8]]);
	if seq != expected_seq {
		return Err(MonitorError::InvalidResponse);
	}

	let mut key = [0u8; 32];
	key.copy_from_slice(&data[9..41]);
	Ok(WgPublicKey::from_bytes(key))
}

#[cfg(test)]
pub fn build_probe_response(seq: u32, server_key: &WgPublicKey) -> [u8; RESPONSE_LEN] {
	let mut packet = [0u8; RESPONSE_LEN];
	packet[..4].copy_from_slice(PROBE_MAGIC);
	packet[4] = KIND_RESPONSE;
	packet[5..9].copy_from_slice(&seq.to_be_bytes());
	packet[9..41].copy_from_slice(server_key.as_bytes());
	packet
}

/// Sends one probe from an ephemeral socket and waits for the matching
/// response. Returns the measured round-trip time.
#[instrument(skip(expected_key), fields(%target))]
pub async fn probe_endpoint(
	target: SocketAddr,
	probe_timeout: Duration,
	expected_key: Option<&WgPublicKey>,
) -> Result<Duration> {
	let socket = UdpSocket::bind("0.0.0.0:0").await?;
	let seq = fastrand::u32(..);
	let request = build_probe_request(seq);

	let started = Instant::now();
	socket.send_to(&request, target).await?;

	let mut buf = [0u8; 128];
	loop {
		let remaining = probe_timeout
			.checked_sub(started.elapsed())
			.ok_or(MonitorError::Timeout)?;

		let (len, from) = match timeout(remaining, socket.recv_from(&mut buf)).await {
			Ok(Ok(received)) => received,
			Ok(Err(e)) => return Err(MonitorError::Io(e)),
			Err(_) => return Err(MonitorError::Timeout),
		};

		if from != target {
			debug!(?from, "ignoring response from unexpected source");
			continue;
		}

		let server_key = match parse_probe_response(&buf[..len], seq) {
			Ok(key) => key,
			Err(e) => {
				debug!(error = %e, "ignoring invalid probe response");
				continue;
			}
		};

		if let Some(expected) = expected_key {
			if server_key != *expected {
				warn!(got = %server_key, want = %expected, "probe response key mismatch");
				return Err(MonitorError::KeyMismatch);
			}
		}

		return Ok(started.elapsed());
	}
}
