// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use clap::Parser;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// olm - WireGuard mesh overlay client for Pangolin
#[derive(Parser, Debug, Default)]
#[command(name = "olm")]
pub struct Args {
    /// Endpoint of your Pangolin server
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Olm ID
    #[arg(long)]
    pub id: Option<String>,

    /// Olm secret
    #[arg(long)]
    pub secret: Option<String>,

    /// MTU to use
    #[arg(long)]
    pub mtu: Option<String>,

    /// DNS server to use
    #[arg(long)]
    pub dns: Option<String>,

    /// Log level (DEBUG, INFO, WARN, ERROR)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Name of the WireGuard interface
    #[arg(long)]
    pub interface: Option<String>,

    /// HTTP server address (e.g. ':9452')
    #[arg(long)]
    pub http_addr: Option<String>,

    /// Interval for pinging the server
    #[arg(long)]
    pub ping_interval: Option<String>,

    /// Timeout for each ping
    #[arg(long)]
    pub ping_timeout: Option<String>,

    /// Enable the status HTTP server
    #[arg(long)]
    pub http: bool,

    /// Test connectivity to a target and exit
    #[arg(long)]
    pub test: bool,

    /// Target server:port for test mode
    #[arg(long)]
    pub test_target: Option<String>,

    /// Print the version
    #[arg(long)]
    pub version: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid MTU value: {0}")]
    InvalidMtu(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub endpoint: String,
    pub id: String,
    pub secret: String,
    pub mtu: u16,
    pub dns: String,
    pub log_level: String,
    pub interface: String,
    pub http_addr: String,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub enable_http: bool,
}

impl Config {
    /// Merges environment variables and CLI flags. An environment variable,
    /// when set and non-empty, wins over its flag; flags fill the gaps.
    pub fn resolve(args: &Args) -> Result<Self, ConfigError> {
        let endpoint = pick("PANGOLIN_ENDPOINT", &args.endpoint, "");
        let id = pick("OLM_ID", &args.id, "");
        let secret = pick("OLM_SECRET", &args.secret, "");

        let mtu_str = pick("MTU", &args.mtu, "1280");
        let mtu: u16 = mtu_str
            .parse()
            .map_err(|_| ConfigError::InvalidMtu(mtu_str.clone()))?;

        let ping_interval = duration_or(
            "PING_INTERVAL",
            &args.ping_interval,
            Duration::from_secs(3),
        );
        let ping_timeout = duration_or("PING_TIMEOUT", &args.ping_timeout, Duration::from_secs(5));

        Ok(Self {
            endpoint,
            id,
            secret,
            mtu,
            dns: pick("DNS", &args.dns, "8.8.8.8"),
            log_level: pick("LOG_LEVEL", &args.log_level, "INFO"),
            interface: pick("INTERFACE", &args.interface, "olm"),
            http_addr: pick("HTTP_ADDR", &args.http_addr, ":9452"),
            ping_interval,
            ping_timeout,
            enable_http: args.http,
        })
    }

    pub fn has_credentials(&self) -> bool {
        !self.id.is_empty() && !self.secret.is_empty() && !self.endpoint.is_empty()
    }

    /// `":9452"` style addresses bind every interface.
    pub fn http_listen_addr(&self) -> String {
        if self.http_addr.starts_with(':') {
            format!("0.0.0.0{}", self.http_addr)
        } else {
            self.http_addr.clone()
        }
    }

    /// Tracing filter directive for the configured level.
    pub fn log_filter(&self) -> String {
        match self.log_level.to_ascii_uppercase().as_str() {
            "DEBUG" => "debug",
            "WARN" => "warn",
            "ERROR" | "FATAL" => "error",
            _ => "info",
        }
        .to_string()
    }
}

fn pick(env_name: &str, flag: &Option<String>, default: &str) -> String {
    if let Ok(value) = std::env::var(env_name) {
        if !value.is_empty() {
            return value;
        }
    }
    flag.clone().unwrap_or_else(|| default.to_string())
}

fn duration_or(env_name: &str, flag: &Option<String>, default: Duration) -> Duration {
    let raw = pick(env_name, flag, "");
    if raw.is_empty() {
        return default;
    }
    match parse_duration(&raw) {
        Some(parsed) => parsed,
        None => {
            warn!(value = %raw, "invalid {env_name} value, using default {default:?}");
            default
        }
    }
}

/// Parses `500ms`, `3s`, `1m` style durations; a bare number means seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();

    if let Some(ms) = s.strip_suffix("ms") {
        return ms.trim().parse::<u64>().ok().map(Duration::from_millis);
    }
    if let Some(secs) = s.strip_suffix('s') {
        return secs.trim().parse::<u64>().ok().map(Duration::from_secs);
    }
    if let Some(mins) = s.strip_suffix('m') {
        return mins
            .trim()
            .parse::<u64>()
            .ok()
            .map(|m| Duration::from_secs(m * 60));
    }
    s.parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_forms() {
        assert_eq!(parse_duration("3s"), Some(Duration::from_secs(3)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("7"), Some(Duration::from_secs(7)));
        assert_eq!(parse_duration("abc"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = Config::resolve(&Args::default()).unwrap();
        assert_eq!(config.mtu, 1280);
        assert_eq!(config.dns, "8.8.8.8");
        assert_eq!(config.interface, "olm");
        assert_eq!(config.http_addr, ":9452");
        assert_eq!(config.ping_interval, Duration::from_secs(3));
        assert_eq!(config.ping_timeout, Duration::from_secs(5));
        assert!(!config.has_credentials());
    }

    #[test]
    fn env_wins_over_flag() {
        std::env::set_var("OLM_TEST_PRECEDENCE_DNS", "1.1.1.1");
        let flag = Some("9.9.9.9".to_string());
        assert_eq!(pick("OLM_TEST_PRECEDENCE_DNS", &flag, "8.8.8.8"), "1.1.1.1");
        std::env::remove_var("OLM_TEST_PRECEDENCE_DNS");
    }

    #[test]
    fn flag_fills_gap_when_env_unset() {
        let flag = Some("9.9.9.9".to_string());
        assert_eq!(pick("OLM_TEST_UNSET_VAR", &flag, "8.8.8.8"), "9.9.9.9");
        assert_eq!(pick("OLM_TEST_UNSET_VAR", &None, "8.8.8.8"), "8.8.8.8");
    }

    #[test]
    fn invalid_mtu_is_fatal() {
        let args = Args {
            mtu: Some("not-a-number".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            Config::resolve(&args),
            Err(ConfigError::InvalidMtu(_))
        ));
    }

    #[test]
    fn http_listen_addr_expands_bare_port() {
        let mut config = Config::resolve(&Args::default()).unwrap();
        assert_eq!(config.http_listen_addr(), "0.0.0.0:9452");

        config.http_addr = "127.0.0.1:8080".to_string();
        assert_eq!(config.http_listen_addr(), "127.0.0.1:8080");
    }

    #[test]
    fn log_filter_mapping() {
        let mut config = Config::resolve(&Args::default()).unwrap();
        assert_eq!(config.log_filter(), "info");

        config.log_level = "DEBUG".to_string();
        assert_eq!(config.log_filter(), "debug");

        config.log_level = "FATAL".to_string();
        assert_eq!(config.log_filter(), "error");
    }
}
