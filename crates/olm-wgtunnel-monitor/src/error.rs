// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use olm_wgtunnel_common::SiteId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MonitorError {
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("probe timed out")]
	Timeout,

	#[error("invalid probe response")]
	InvalidResponse,

	#[error("probe response signed by unexpected server key")]
	KeyMismatch,

	#[error("unknown site {0}")]
	UnknownSite(SiteId),

	#[error("no usable relay endpoint: {0}")]
	BadRelayEndpoint(String),

	#[error("engine error: {0}")]
	Engine(#[from] olm_wgtunnel_engine::EngineError),
}

pub type Result<T> = std::result::Result<T, MonitorError>;
