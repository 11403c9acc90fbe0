// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

pub mod device;
pub mod error;
pub mod platform;
pub mod resolve;
pub mod router;
pub mod tun;
pub mod uapi;

pub use device::{DeviceState, WgDevice, PERSISTENT_KEEPALIVE};
pub use error::{EngineError, Result};
pub use resolve::resolve_endpoint;
pub use router::{extract_dst_ip, Router};
pub use tun::{TunDevice, ENV_TUN_FD};
pub use uapi::{UapiHandle, UapiListener, ENV_UAPI_FD};
