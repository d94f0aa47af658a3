// File:    image.rs
// Author:  apezoo
// Date:    2026-10-16
//
// Description: Creation of and cluster-wise access to the shared OTP image file.
//
// License:
// This project is licensed under the terms of the GNU AGPLv3 license.
// See the LICENSE.md file in the project root for full license information.

//! The OTP image: a file of random bytes read in 4096-byte clusters.
//!
//! Both peers hold an identical copy. A session walks the image cluster by
//! cluster; past the last cluster it rewinds to the first one.

use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{info, warn};
use rand::{TryRngCore, rngs::OsRng};

use crate::error::{Error, Result};
use crate::framing::CLUSTER_DATALEN;

/// One image cluster of pad bytes.
pub type PadCluster = [u8; CLUSTER_DATALEN];

const BYTES_PER_MB: u64 = 1024 * 1024;
const WRITE_CHUNK: usize = 64 * 1024;

/// Creates an image of `size_mb` MiB of OS random bytes at `path`.
///
/// Returns the number of clusters written.
///
/// # Errors
///
/// Fails if `size_mb` is zero, the random source fails, or the file cannot be written.
pub fn create_image(path: &Path, size_mb: u32) -> Result<u64> {
    if size_mb == 0 {
        return Err(Error::Config("image size must be at least 1 MiB".into()));
    }
    let mut rng = OsRng;
    let mut file = BufWriter::new(File::create(path)?);
    let mut buffer = vec![0u8; WRITE_CHUNK];
    let total = u64::from(size_mb) * BYTES_PER_MB;
    let mut written = 0u64;
    while written < total {
        rng.try_fill_bytes(&mut buffer).map_err(io::Error::other)?;
        file.write_all(&buffer)?;
        written += WRITE_CHUNK as u64;
    }
    file.flush()?;
    let clusters = total / CLUSTER_DATALEN as u64;
    info!("Created OTP image {} ({size_mb} MiB, {clusters} clusters)", path.display());
    Ok(clusters)
}

/// An open handle on the OTP image.
#[derive(Debug)]
pub struct OtpImage {
    file: File,
    path: PathBuf,
    clusters: u64,
}

impl OtpImage {
    /// Opens the image at `path`.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be opened or holds less than one cluster.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        let clusters = len / CLUSTER_DATALEN as u64;
        if clusters == 0 {
            return Err(Error::ImageIo(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} holds less than one cluster", path.display()),
            )));
        }
        if len % CLUSTER_DATALEN as u64 != 0 {
            warn!(
                "OTP image {} has {} trailing bytes that will never be used",
                path.display(),
                len % CLUSTER_DATALEN as u64
            );
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
            clusters,
        })
    }

    /// Opens a second, independent handle on the same file.
    ///
    /// The encode and decode sides each read through their own handle.
    pub fn duplicate(&self) -> Result<Self> {
        Self::open(&self.path)
    }

    /// Number of whole clusters in the image.
    #[must_use]
    pub const fn size_in_clusters(&self) -> u64 {
        self.clusters
    }

    /// Path of the image file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads cluster `index` of the file, `index < size_in_clusters()`.
    pub fn read_cluster(&mut self, index: u64) -> Result<PadCluster> {
        if index >= self.clusters {
            return Err(Error::ImageIo(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("cluster {index} beyond image end ({} clusters)", self.clusters),
            )));
        }
        let mut pad = [0u8; CLUSTER_DATALEN];
        self.file.seek(SeekFrom::Start(index * CLUSTER_DATALEN as u64))?;
        self.file.read_exact(&mut pad)?;
        Ok(pad)
    }
}

/// Position of one side of the session inside the image.
///
/// The ordinal counts image clusters since the start of the pad and never
/// goes back; the file index and rewind count are derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageCursor {
    ordinal: u64,
    clusters: u64,
}

impl ImageCursor {
    /// Cursor at `ordinal` over an image of `clusters` clusters.
    #[must_use]
    pub const fn new(clusters: u64, ordinal: u64) -> Self {
        Self { ordinal, clusters }
    }

    /// Monotonic image cluster counter.
    #[must_use]
    pub const fn ordinal(&self) -> u64 {
        self.ordinal
    }

    /// Index of the current cluster in the file.
    #[must_use]
    pub const fn file_index(&self) -> u64 {
        self.ordinal % self.clusters
    }

    /// How many times the cursor has wrapped past the end of the image.
    #[must_use]
    pub const fn rewinds(&self) -> u64 {
        self.ordinal / self.clusters
    }

    /// Moves to the next cluster. Returns true when this wrapped to the first cluster.
    pub fn advance(&mut self) -> bool {
        self.ordinal += 1;
        self.file_index() == 0
    }

    /// Jumps to `ordinal`.
    pub fn seek(&mut self, ordinal: u64) {
        self.ordinal = ordinal;
    }

    /// Jumps to the first cluster of the next pass over the image.
    pub fn rewind(&mut self) {
        self.ordinal = (self.rewinds() + 1) * self.clusters;
    }
}
