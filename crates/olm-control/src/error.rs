// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
	#[error("HTTP request failed: {0}")]
	Http(#[from] reqwest::Error),

	#[error("authentication failed: {0}")]
	Auth(String),

	#[error("not connected")]
	NotConnected,

	#[error("WebSocket error: {0}")]
	WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),

	#[error("URL parse error: {0}")]
	Url(#[from] url::ParseError),

	#[error("invalid endpoint: {0}")]
	InvalidEndpoint(String),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("client closed")]
	Closed,
}

pub type Result<T> = std::result::Result<T, ControlError>;
