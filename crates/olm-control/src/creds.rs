// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::instrument;

/// Control-plane credentials persisted between runs so a refreshed token
/// survives a restart. The token is optional and revalidated on first use.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
	pub olm_id: String,
	pub secret: String,
	pub endpoint: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub token: Option<String>,
}

impl fmt::Debug for Credentials {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Credentials")
			.field("olm_id", &self.olm_id)
			.field("endpoint", &self.endpoint)
			.field("secret", &"<redacted>")
			.field("token", &self.token.as_ref().map(|_| "<redacted>"))
			.finish()
	}
}

pub fn default_credentials_path() -> Option<PathBuf> {
	dirs::home_dir().map(|h| h.join(".olm").join("credentials.json"))
}

#[instrument(skip_all, fields(path = %path.as_ref().display()))]
pub async fn load_credentials(path: impl AsRef<Path>) -> Result<Option<Credentials>> {
	let path = path.as_ref();
	if !path.exists() {
		return Ok(None);
	}

	let content = fs::read_to_string(path).await?;
	let creds = serde_json::from_str(&content)?;
	Ok(Some(creds))
}

#[instrument(skip_all, fields(path = %path.as_ref().display()))]
pub async fn save_credentials(creds: &Credentials, path: impl AsRef<Path>) -> Result<()> {
	let path = path.as_ref();

	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent).await?;
	}

	let content = serde_json::to_string_pretty(creds)?;

	#[cfg(unix)]
	{
		use std::os::unix::fs::OpenOptionsExt;
		use tokio::fs::OpenOptions;
		use tokio::io::AsyncWriteExt;

		let mut file = OpenOptions::new()
			.write(true)
			.create(true)
			.truncate(true)
			.mode(0o600)
			.open(path)
			.await?;
		file.write_all(content.as_bytes()).await?;
	}

	#[cfg(not(unix))]
	{
		fs::write(path, content).await?;
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	fn creds() -> Credentials {
		Credentials {
			olm_id: "olm-1".to_string(),
			secret: "hunter2".to_string(),
			endpoint: "https://pangolin.example".to_string(),
			token: Some("tok".to_string()),
		}
	}

	#[tokio::test]
	async fn save_and_load_roundtrip() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("credentials.json");

		save_credentials(&creds(), &path).await.unwrap();
		let loaded = load_credentials(&path).await.unwrap().unwrap();

		assert_eq!(loaded.olm_id, "olm-1");
		assert_eq!(loaded.secret, "hunter2");
		assert_eq!(loaded.token.as_deref(), Some("tok"));
	}

	#[tokio::test]
	async fn load_missing_file_is_none() {
		let dir = TempDir::new().unwrap();
		let loaded = load_credentials(dir.path().join("nope.json")).await.unwrap();
		assert!(loaded.is_none());
	}

	#[tokio::test]
	#[cfg(unix)]
	async fn saved_file_is_private() {
		use std::os::unix::fs::PermissionsExt;

		let dir = TempDir::new().unwrap();
		let path = dir.path().join("credentials.json");
		save_credentials(&creds(), &path).await.unwrap();

		let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
		assert_eq!(mode, 0o600);
	}

	#[test]
	fn debug_redacts_secret_material() {
		let formatted = format!("{:?}", creds());
		assert!(!formatted.contains("hunter2"));
		assert!(!formatted.contains("tok\""));
		assert!(formatted.contains("<redacted>"));
	}

	#[test]
	fn token_field_optional_on_disk() {
		let json = r#"{"olmId":"a","secret":"b","endpoint":"https://p.example"}"#;
		let parsed: Credentials = serde_json::from_str(json).unwrap();
		assert!(parsed.token.is_none());
	}
}
