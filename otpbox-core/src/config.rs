// File:    config.rs
// Author:  apezoo
// Date:    2026-10-16
//
// Description: Session configuration loaded once from JSON and shared read-only by every module.
//
// License:
// This project is licensed under the terms of the GNU AGPLv3 license.
// See the LICENSE.md file in the project root for full license information.

//! Engine configuration.
//!
//! A [`Config`] is read once at start-up and handed to every component
//! behind an `Arc`. Missing fields fall back to the defaults below.

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::framing::SendMethod;
use crate::keystore::KEY_STORE_WIRE_LEN;

/// Tunnel engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path of the shared OTP image.
    pub otp_image_path: PathBuf,
    /// Path of the JSON file holding the image cursors between sessions.
    pub otp_position_path: PathBuf,
    /// Budget of the incoming cluster stock, in KiB.
    pub otp_in_buffer_kb: usize,
    /// Budget of the outgoing cluster stock, in KiB. Zero dispatches synchronously.
    pub otp_out_buffer_kb: usize,
    /// Budget of clusters held back while a sequence gap is open, in KiB.
    pub seq_gap_buffer_kb: usize,
    /// Longest time a partial page waits for more data, in ms. Zero sends every page at once.
    pub page_delivery_timelimit_ms: u64,
    /// Time a sequence gap may stay open before the session fails, in ms.
    pub gap_expiration_limit_ms: u64,
    /// Time allowed for the first key package to arrive, in ms.
    pub connection_gap_timelimit_ms: u64,
    /// In-memory budget of the incoming key queue, in KiB.
    pub aes_in_keystorage_kb: usize,
    /// In-memory budget of the outgoing key queue, in KiB.
    pub aes_out_keystorage_kb: usize,
    /// Budget of each key backlog file, in KiB.
    pub aes_backlog_key_limit_kb: usize,
    /// Number of keys generated per pre-send batch.
    pub aes_presend_keys_num: usize,
    /// Pre-shared password of the first key; both peers derive the magic word from it.
    pub aes_first_key_password: String,
    /// Directory of the key backlog files.
    pub backlog_dir: PathBuf,
    /// Channel selection policy for outgoing clusters.
    pub send_method: SendMethod,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            otp_image_path: PathBuf::from("./imageotp"),
            otp_position_path: PathBuf::from("./otp_position"),
            otp_in_buffer_kb: 5 * 1024,
            otp_out_buffer_kb: 0,
            seq_gap_buffer_kb: 10 * 1024,
            page_delivery_timelimit_ms: 80,
            gap_expiration_limit_ms: 10_000,
            connection_gap_timelimit_ms: 10_000,
            aes_in_keystorage_kb: 2 * 1024,
            aes_out_keystorage_kb: 1024,
            aes_backlog_key_limit_kb: 10 * 1024,
            aes_presend_keys_num: 512,
            aes_first_key_password: String::from("CryptoBox.v1.0.0"),
            backlog_dir: PathBuf::from("./backlog"),
            send_method: SendMethod::Different,
        }
    }
}

impl Config {
    /// Reads and validates a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Writes the configuration as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("cannot serialize configuration: {e}")))?;
        fs::write(path, text)?;
        Ok(())
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.aes_in_keystorage_kb == 0 || self.aes_out_keystorage_kb == 0 {
            return Err(Error::Config("key storage budgets must be non-zero".into()));
        }
        if self.aes_first_key_password.is_empty() {
            return Err(Error::Config("first key password must not be empty".into()));
        }
        if self.aes_presend_keys_num == 0 {
            return Err(Error::Config("pre-send batch must hold at least one key".into()));
        }
        if self.aes_presend_keys_num > self.out_keep_num() {
            return Err(Error::Config(format!(
                "pre-send batch of {} keys exceeds the outgoing key storage of {} keys",
                self.aes_presend_keys_num,
                self.out_keep_num()
            )));
        }
        Ok(())
    }

    /// Number of keys the outgoing queue keeps in memory.
    #[must_use]
    pub const fn out_keep_num(&self) -> usize {
        keep_num(self.aes_out_keystorage_kb)
    }

    /// Number of keys the incoming queue keeps in memory.
    #[must_use]
    pub const fn in_keep_num(&self) -> usize {
        keep_num(self.aes_in_keystorage_kb)
    }
}

/// Keys fitting a budget of `kb` KiB, counting id and key store per entry.
#[must_use]
pub const fn keep_num(kb: usize) -> usize {
    kb * 1024 / (KEY_STORE_WIRE_LEN + 8)
}
