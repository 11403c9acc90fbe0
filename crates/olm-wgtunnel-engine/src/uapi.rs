// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Read-only userspace administrative interface. Tools like `wg show`
//! query the device over a stream socket speaking the standard UAPI text
//! protocol; all mutation flows through the control plane, so `set`
//! requests are rejected.

use crate::device::{PeerSnapshot, WgDevice};
use crate::error::{EngineError, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, instrument, warn};

/// Environment variable carrying an inherited UAPI listener descriptor.
pub const ENV_UAPI_FD: &str = "OLM_UAPI_FD";

const SOCKET_DIR: &str = "/var/run/wireguard";

pub struct UapiListener {
	listener: UnixListener,
	path: Option<PathBuf>,
}

impl UapiListener {
	/// Binds the UAPI socket at `/var/run/wireguard/<ifname>.sock`, or adopts
	/// a listener inherited via `OLM_UAPI_FD`.
	#[instrument(fields(ifname = %ifname))]
	pub fn bind(ifname: &str) -> Result<Self> {
		if let Ok(fd_str) = std::env::var(ENV_UAPI_FD) {
			return Self::from_inherited_fd(&fd_str);
		}

		std::fs::create_dir_all(SOCKET_DIR)?;
		let path = PathBuf::from(SOCKET_DIR).join(format!("{ifname}.sock"));

		// a previous unclean exit may have left the socket file behind
		if path.exists() {
			std::fs::remove_file(&path)?;
		}

		let listener = UnixListener::bind(&path)?;
		info!(path = %path.display(), "UAPI listener bound");

		Ok(Self {
			listener,
			path: Some(path),
		})
	}

	#[cfg(unix)]
	fn from_inherited_fd(fd_str: &str) -> Result<Self> {
		use std::os::fd::FromRawFd;

		let fd: i32 = fd_str
			.parse()
			.map_err(|_| EngineError::Uapi(format!("invalid {ENV_UAPI_FD}: {fd_str}")))?;

		let std_listener = unsafe { std::os::unix::net::UnixListener::from_raw_fd(fd) };
		std_listener.set_nonblocking(true)?;
		let listener = UnixListener::from_std(std_listener)?;

		info!(fd, "adopted inherited UAPI listener");

		Ok(Self {
			listener,
			path: None,
		})
	}

	/// Consumes the listener and starts the accept loop. The returned handle
	/// closes the socket when dropped or explicitly closed.
	pub fn spawn(self, device: Arc<WgDevice>) -> UapiHandle {
		let path = self.path.clone();
		let listener = self.listener;

		let task = tokio::spawn(async move {
			loop {
				match listener.accept().await {
					Ok((stream, _)) => {
						let device = Arc::clone(&device);
						tokio::spawn(async move {
							if let Err(e) = handle_connection(stream, device).await {
								debug!(error = %e, "UAPI connection error");
							}
						});
					}
					Err(e) => {
						warn!(error = %e, "UAPI accept failed");
						break;
					}
				}
			}
		});

		UapiHandle {
			task: Some(task),
			path,
		}
	}
}

pub struct UapiHandle {
	task: Option<tokio::task::JoinHandle<()>>,
	path: Option<PathBuf>,
}

impl UapiHandle {
	/// Stops the accept loop and unlinks the socket file. Idempotent.
	pub fn close(&mut self) {
		if let Some(task) = self.task.take() {
			task.abort();
		}
		if let Some(path) = self.path.take() {
			if let Err(e) = std::fs::remove_file(&path) {
				debug!(path = %path.display(), error = %e, "failed to unlink UAPI socket");
			}
		}
	}
}

impl Drop for UapiHandle {
	fn drop(&mut self) {
		self.close();
	}
}

async fn handle_connection(stream: UnixStream, device: Arc<WgDevice>) -> std::io::Result<()> {
	let (read_half, mut write_half) = stream.into_split();
	let mut reader = BufReader::new(read_half);
	let mut line = String::new();

	reader.read_line(&mut line).await?;

	let response = match line.trim() {
		"get=1" => {
			let peers = device.snapshot_peers().await;
			format_get_response(
				device.private_key().as_bytes(),
				device.listen_port(),
				&peers,
			)
		}
		_ => "errno=1\n\n".to_string(),
	};

	write_half.write_all(response.as_bytes()).await?;
	write_half.shutdown().await?;
	Ok(())
}

fn format_get_response(private_key: &[u8; 32], listen_port: u16, peers: &[PeerSnapshot]) -> String {
	let mut out = String::new();
	out.push_str(&format!("private_key={}\n", hex(private_key)));
	out.push_str(&format!("listen_port={listen_port}\n"));

	for peer in peers {
		out.push_str(&format!("public_key={}\n", hex(peer.public_key.as_bytes())));
		out.push_str(&format!("endpoint={}\n", format_endpoint(peer.endpoint)));
		out.push_str(&format!("allowed_ip={}/32\n", peer.allowed_ip));
		out.push_str(&format!(
			"persistent_keepalive_interval={}\n",
			peer.keepalive
		));
	}

	out.push_str("errno=0\n\n");
	out
}

fn format_endpoint(addr: SocketAddr) -> String {
	match addr {
		SocketAddr::V4(v4) => v4.to_string(),
		SocketAddr::V6(v6) => format!("[{}]:{}", v6.ip(), v6.port()),
	}
}

fn hex(bytes: &[u8]) -> String {
	bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use olm_wgtunnel_common::WgKeyPair;

	#[test]
	fn hex_encodes_lowercase() {
		assert_eq!(hex(&[0x00, 0xff, 0x0a]), "00ff0a");
	}

	#[test]
	fn get_response_shape() {
		let pair = WgKeyPair::generate();
		let peer_pair = WgKeyPair::generate();

		let peers = vec![PeerSnapshot {
			public_key: *peer_pair.public_key(),
			endpoint: "1.2.3.4:51820".parse().unwrap(),
			allowed_ip: "10.0.0.1".parse().unwrap(),
			keepalive: 25,
		}];

		let response = format_get_response(pair.private_key().as_bytes(), 51913, &peers);

		assert!(response.starts_with("private_key="));
		assert!(response.contains("listen_port=51913\n"));
		assert!(response.contains("endpoint=1.2.3.4:51820\n"));
		assert!(response.contains("allowed_ip=10.0.0.1/32\n"));
		assert!(response.contains("persistent_keepalive_interval=25\n"));
		assert!(response.ends_with("errno=0\n\n"));
	}

	#[test]
	fn v6_endpoint_is_bracketed() {
		let addr: SocketAddr = "[fd00::1]:51820".parse().unwrap();
		assert_eq!(format_endpoint(addr), "[fd00::1]:51820");
	}
}
