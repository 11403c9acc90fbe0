// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Host networking configuration: interface addresses, MTU, DNS, and the
//! per-peer host routes. Everything here shells out to the platform's
//! networking tools; failures are surfaced as `EngineError::Platform` and
//! treated as non-fatal by callers.

use crate::error::{EngineError, Result};
use std::net::IpAddr;
use std::process::Command;
use tracing::{info, instrument, warn};

#[cfg(target_os = "linux")]
const RESOLV_CONF_PATH: &str = "/etc/resolv.conf";
#[cfg(target_os = "linux")]
const RESOLV_CONF_BACKUP_PATH: &str = "/etc/resolv.conf.olm.bak";

/// Assigns the overlay address and MTU to the interface and applies the DNS
/// override when one is configured.
#[instrument(skip_all, fields(ifname = %ifname, address = %address, mtu))]
pub fn configure_interface(
	ifname: &str,
	address: &str,
	mtu: u16,
	dns: Option<&str>,
) -> Result<()> {
	#[cfg(target_os = "linux")]
	{
		run_cmd(&format!("ip link set dev {ifname} mtu {mtu}"))?;
		run_cmd(&format!("ip addr add {address} dev {ifname}"))?;
	}

	#[cfg(target_os = "macos")]
	{
		run_cmd(&format!("ifconfig {ifname} mtu {mtu}"))?;
		let ip = address.split('/').next().unwrap_or(address);
		run_cmd(&format!("ifconfig {ifname} {ip} {ip}"))?;
	}

	if let Some(dns) = dns {
		if let Err(e) = configure_dns(dns) {
			warn!(error = %e, "failed to apply DNS override, queries may leak");
		} else {
			info!(dns, "applied DNS override");
		}
	}

	Ok(())
}

/// Installs a host route for one peer's overlay IP.
#[instrument(skip_all, fields(ip = %ip, ifname = %ifname))]
pub fn add_route(ip: IpAddr, ifname: &str) -> Result<()> {
	#[cfg(target_os = "linux")]
	run_cmd(&format!("ip route replace {ip}/32 dev {ifname}"))?;

	#[cfg(target_os = "macos")]
	run_cmd(&format!("route -n add -host {ip} -interface {ifname}"))?;

	Ok(())
}

/// Removes the host route for a peer's overlay IP.
#[instrument(skip_all, fields(ip = %ip))]
pub fn remove_route(ip: IpAddr) -> Result<()> {
	#[cfg(target_os = "linux")]
	run_cmd(&format!("ip route del {ip}/32"))?;

	#[cfg(target_os = "macos")]
	run_cmd(&format!("route -n delete -host {ip}"))?;

	Ok(())
}

#[cfg(target_os = "linux")]
fn configure_dns(dns: &str) -> Result<()> {
	use std::path::Path;

	if Path::new(RESOLV_CONF_BACKUP_PATH).exists() {
		warn!("DNS backup already present, a previous run may not have cleaned up");
	} else {
		std::fs::copy(RESOLV_CONF_PATH, RESOLV_CONF_BACKUP_PATH)?;
	}

	let content: String = dns
		.split(',')
		.map(str::trim)
		.filter(|s| !s.is_empty())
		.map(|s| format!("nameserver {s}\n"))
		.collect();
	std::fs::write(RESOLV_CONF_PATH, content)?;
	Ok(())
}

#[cfg(target_os = "linux")]
pub fn restore_dns() {
	use std::path::Path;

	if Path::new(RESOLV_CONF_BACKUP_PATH).exists() {
		if let Err(e) = std::fs::rename(RESOLV_CONF_BACKUP_PATH, RESOLV_CONF_PATH) {
			warn!(error = %e, "failed to restore resolv.conf");
		}
	}
}

#[cfg(target_os = "macos")]
fn configure_dns(dns: &str) -> Result<()> {
	let service = primary_network_service()?;
	let servers = dns.replace(',', " ");
	run_cmd(&format!("networksetup -setdnsservers {service} {servers}"))
}

#[cfg(target_os = "macos")]
pub fn restore_dns() {
	if let Ok(service) = primary_network_service() {
		let _ = run_cmd(&format!("networksetup -setdnsservers {service} empty"));
	}
}

#[cfg(target_os = "macos")]
fn primary_network_service() -> Result<String> {
	let output = Command::new("networksetup")
		.arg("-listallnetworkservices")
		.output()?;
	let services = String::from_utf8_lossy(&output.stdout);
	services
		.lines()
		.skip(1)
		.map(str::trim)
		.find(|s| {
			let lower = s.to_lowercase();
			lower.contains("wi-fi") || lower.contains("ethernet")
		})
		.map(|s| s.to_string())
		.ok_or_else(|| EngineError::Platform("no primary network service found".to_string()))
}

fn run_cmd(cmd: &str) -> Result<()> {
	let args: Vec<&str> = cmd.split_whitespace().collect();
	let Some((program, rest)) = args.split_first() else {
		return Ok(());
	};

	let output = Command::new(program).args(rest).output()?;
	if !output.status.success() {
		let stderr = String::from_utf8_lossy(&output.stderr);
		return Err(EngineError::Platform(format!(
			"'{cmd}' failed: {}",
			stderr.trim()
		)));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn run_cmd_empty_is_ok() {
		assert!(run_cmd("").is_ok());
	}

	#[test]
	fn run_cmd_reports_failure() {
		let err = run_cmd("false").unwrap_err();
		assert!(matches!(err, EngineError::Platform(_)));
	}

	#[test]
	fn run_cmd_success() {
		assert!(run_cmd("true").is_ok());
	}
}
