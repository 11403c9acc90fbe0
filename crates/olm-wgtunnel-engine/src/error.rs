// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use olm_wgtunnel_common::SiteId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("TUN device error: {0}")]
	Tun(String),

	#[error("device is closed")]
	Closed,

	#[error("no peer for site {0}")]
	PeerNotFound(SiteId),

	#[error("invalid overlay address: {0}")]
	InvalidAddress(String),

	#[error("failed to resolve endpoint {0}")]
	Resolve(String),

	#[error("platform command failed: {0}")]
	Platform(String),

	#[error("UAPI error: {0}")]
	Uapi(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
