// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

pub mod client;
pub mod creds;
pub mod error;
pub mod token;

pub use client::{ConnectCallback, ControlClient, MessageHandler, TokenCallback};
pub use creds::{default_credentials_path, load_credentials, save_credentials, Credentials};
pub use error::{ControlError, Result};
pub use token::acquire_token;
