// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{ControlError, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, instrument};

pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

const TOKEN_PATH: &str = "/api/v1/auth/olm/get-token";
const CSRF_HEADER: &str = "X-CSRF-Token";
const CSRF_VALUE: &str = "x-csrf-protection";
const TOKEN_STILL_VALID: &str = "Token session already valid";

#[derive(Debug, Deserialize)]
struct TokenResponse {
	success: bool,
	#[serde(default)]
	message: String,
	#[serde(default)]
	data: Option<TokenData>,
}

#[derive(Debug, Deserialize)]
struct TokenData {
	#[serde(default)]
	token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenRequest<'a> {
	olm_id: &'a str,
	secret: &'a str,
	#[serde(skip_serializing_if = "Option::is_none")]
	token: Option<&'a str>,
}

fn token_url(endpoint: &str) -> String {
	format!("{}{}", endpoint.trim_end_matches('/'), TOKEN_PATH)
}

/// Obtains a session token. A cached token is revalidated first and reused
/// when the server confirms the session is still alive; otherwise a fresh
/// token is requested.
#[instrument(skip_all, fields(olm_id = %olm_id))]
pub async fn acquire_token(
	http: &reqwest::Client,
	endpoint: &str,
	olm_id: &str,
	secret: &str,
	cached: Option<&str>,
) -> Result<String> {
	let url = token_url(endpoint);

	if let Some(token) = cached {
		let response: TokenResponse = http
			.post(&url)
			.header(CSRF_HEADER, CSRF_VALUE)
			.json(&TokenRequest {
				olm_id,
				secret,
				token: Some(token),
			})
			.send()
			.await?
			.json()
			.await?;

		if response.success && response.message == TOKEN_STILL_VALID {
			debug!("cached token still valid");
			return Ok(token.to_string());
		}
	}

	let response: TokenResponse = http
		.post(&url)
		.header(CSRF_HEADER, CSRF_VALUE)
		.json(&json!({ "olmId": olm_id, "secret": secret }))
		.send()
		.await?
		.json()
		.await?;

	if !response.success {
		return Err(ControlError::Auth(response.message));
	}

	let token = response.data.map(|d| d.token).unwrap_or_default();
	if token.is_empty() {
		return Err(ControlError::Auth(
			"server returned an empty token".to_string(),
		));
	}

	debug!("acquired fresh token");
	Ok(token)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn token_url_strips_trailing_slash() {
		assert_eq!(
			token_url("https://pangolin.example/"),
			"https://pangolin.example/api/v1/auth/olm/get-token"
		);
		assert_eq!(
			token_url("https://pangolin.example"),
			"https://pangolin.example/api/v1/auth/olm/get-token"
		);
	}

	#[test]
	fn token_request_omits_absent_token() {
		let body = serde_json::to_value(TokenRequest {
			olm_id: "a",
			secret: "b",
			token: None,
		})
		.unwrap();
		assert_eq!(body.get("olmId").unwrap(), "a");
		assert!(body.get("token").is_none());
	}

	#[test]
	fn token_response_tolerates_missing_data() {
		let parsed: TokenResponse =
			serde_json::from_str(r#"{"success":false,"message":"nope"}"#).unwrap();
		assert!(!parsed.success);
		assert!(parsed.data.is_none());
	}
}
