// File:    position.rs
// Author:  apezoo
// Date:    2026-10-16
//
// Description: Persists the image cursors between sessions as JSON.
//
// License:
// This project is licensed under the terms of the GNU AGPLv3 license.
// See the LICENSE.md file in the project root for full license information.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Where both sides of a session stopped reading the image.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImagePosition {
    /// Next image cluster ordinal for encoding.
    pub out_ordinal: u64,
    /// Next image cluster ordinal expected for decoding.
    pub in_ordinal: u64,
    /// Cluster count of the image the ordinals refer to.
    pub image_clusters: u64,
}

impl ImagePosition {
    /// Rewinds of the outgoing cursor.
    #[must_use]
    pub const fn out_rewinds(&self) -> u64 {
        if self.image_clusters == 0 {
            0
        } else {
            self.out_ordinal / self.image_clusters
        }
    }
}

/// Loads the saved position, or `None` when no file exists yet.
pub fn load_position(path: &Path) -> Result<Option<ImagePosition>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(path)?;
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| Error::Config(format!("cannot parse position file {}: {e}", path.display())))
}

/// Saves the position.
pub fn save_position(path: &Path, position: &ImagePosition) -> Result<()> {
    let text = serde_json::to_string_pretty(position)
        .map_err(|e| Error::Config(format!("cannot serialize position: {e}")))?;
    fs::write(path, text)?;
    Ok(())
}
