// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

pub mod error;
pub mod failover;
pub mod monitor;
pub mod probe;
pub mod tester;

pub use error::{MonitorError, Result};
pub use failover::{Selection, FAILURE_THRESHOLD};
pub use monitor::{MonitorConfig, NotifyFn, PeerMonitor, ReconfigureFn};
pub use probe::{build_probe_request, parse_probe_response, probe_endpoint, PROBE_MAGIC};
pub use tester::{TesterClient, TEST_TIMEOUT};
