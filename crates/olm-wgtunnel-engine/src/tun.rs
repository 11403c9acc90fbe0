// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{EngineError, Result};
use std::io;
use tracing::{info, instrument};

/// Environment variable carrying an inherited TUN file descriptor.
pub const ENV_TUN_FD: &str = "OLM_TUN_FD";

/// A platform TUN device. Either created by us or adopted from a file
/// descriptor handed down by a supervising process.
pub struct TunDevice {
	inner: TunInner,
	name: String,
	mtu: u16,
}

enum TunInner {
	#[cfg(unix)]
	Kernel(tokio_tun::Tun),
	#[cfg(unix)]
	Inherited(tokio::io::unix::AsyncFd<std::fs::File>),
}

impl TunDevice {
	/// Creates the TUN interface. On macOS the requested name is ignored in
	/// favor of the first unused `utun` index. Honors `OLM_TUN_FD`.
	#[instrument(skip_all, fields(name = %name, mtu))]
	pub fn create(name: &str, mtu: u16) -> Result<Self> {
		if let Ok(fd_str) = std::env::var(ENV_TUN_FD) {
			return Self::from_inherited_fd(&fd_str, name, mtu);
		}

		#[cfg(target_os = "macos")]
		let name = &find_unused_utun()?;

		let tun = tokio_tun::Tun::builder()
			.name(name)
			.tap(false)
			.packet_info(false)
			.mtu(mtu as i32)
			.up()
			.try_build()
			.map_err(|e| EngineError::Tun(e.to_string()))?;

		let real_name = tun.name().to_string();
		info!(name = %real_name, "created TUN device");

		Ok(Self {
			inner: TunInner::Kernel(tun),
			name: real_name,
			mtu,
		})
	}

	#[cfg(unix)]
	fn from_inherited_fd(fd_str: &str, name: &str, mtu: u16) -> Result<Self> {
		use std::os::fd::FromRawFd;

		let fd: i32 = fd_str
			.parse()
			.map_err(|_| EngineError::Tun(format!("invalid {ENV_TUN_FD}: {fd_str}")))?;

		// Ownership of the fd transfers to us; the parent must not close it.
		let file = unsafe { std::fs::File::from_raw_fd(fd) };
		set_nonblocking(&file)?;
		let async_fd = tokio::io::unix::AsyncFd::new(file)?;

		info!(fd, "adopted inherited TUN file descriptor");

		Ok(Self {
			inner: TunInner::Inherited(async_fd),
			name: name.to_string(),
			mtu,
		})
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn mtu(&self) -> u16 {
		self.mtu
	}

	pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
		match &self.inner {
			TunInner::Kernel(tun) => tun.recv(buf).await,
			TunInner::Inherited(fd) => loop {
				let mut guard = fd.readable().await?;
				match guard.try_io(|inner| {
					let n = unsafe {
						libc::read(
							std::os::fd::AsRawFd::as_raw_fd(inner.get_ref()),
							buf.as_mut_ptr() as *mut libc::c_void,
							buf.len(),
						)
					};
					if n < 0 {
						Err(io::Error::last_os_error())
					} else {
						Ok(n as usize)
					}
				}) {
					Ok(result) => return result,
					Err(_would_block) => continue,
				}
			},
		}
	}

	pub async fn send(&self, buf: &[u8]) -> io::Result<usize> {
		match &self.inner {
			TunInner::Kernel(tun) => tun.send(buf).await,
			TunInner::Inherited(fd) => loop {
				let mut guard = fd.writable().await?;
				match guard.try_io(|inner| {
					let n = unsafe {
						libc::write(
							std::os::fd::AsRawFd::as_raw_fd(inner.get_ref()),
							buf.as_ptr() as *const libc::c_void,
							buf.len(),
						)
					};
					if n < 0 {
						Err(io::Error::last_os_error())
					} else {
						Ok(n as usize)
					}
				}) {
					Ok(result) => return result,
					Err(_would_block) => continue,
				}
			},
		}
	}
}

#[cfg(unix)]
fn set_nonblocking(file: &std::fs::File) -> io::Result<()> {
	use std::os::fd::AsRawFd;

	let fd = file.as_raw_fd();
	let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
	if flags < 0 {
		return Err(io::Error::last_os_error());
	}
	if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
		return Err(io::Error::last_os_error());
	}
	Ok(())
}

/// Scans existing interfaces and returns the first free `utunN` name.
#[cfg(target_os = "macos")]
fn find_unused_utun() -> Result<String> {
	let output = std::process::Command::new("ifconfig")
		.arg("-l")
		.output()
		.map_err(EngineError::Io)?;
	let present = String::from_utf8_lossy(&output.stdout);

	for index in 0..255u32 {
		let candidate = format!("utun{index}");
		if !present.split_whitespace().any(|ifname| ifname == candidate) {
			tracing::debug!(name = %candidate, "selected unused utun index");
			return Ok(candidate);
		}
	}

	Err(EngineError::Tun("no unused utun index available".to_string()))
}
