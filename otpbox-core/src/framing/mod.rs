// File:    mod.rs
// Author:  apezoo
// Date:    2026-10-16
//
// Description: Binary framing of AES packages and OTP clusters, shared constants and cluster id arithmetic.
//
// License:
// This project is licensed under the terms of the GNU AGPLv3 license.
// See the LICENSE.md file in the project root for full license information.

//! Binary framing layer.
//!
//! Two families of frames travel through the tunnel:
//!
//! * [`AesPackage`] - the AES-level frames: pre-send key bundles, key-only
//!   and IV-only packages, ciphered and deciphered data.
//! * [`Cluster`] - the OTP-level frame: a 14-byte header followed by up to
//!   4096 payload bytes combined with one image cluster of the pad.
//!
//! All multi-byte integers are little-endian.

mod aes;
mod cluster;
mod package_type;
mod wire;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use aes::{AesPackage, aligned_data_len};
pub use cluster::{
    Cluster, DecodeContext, Marker, MarkerKind, make_cluster_id_from_num,
    make_cluster_num_from_id, page_slot, successor_id,
};
pub use package_type::{AesKind, PackageType};

/// Largest raw payload accepted by the tunnel.
pub const MAX_RAWPACKAGE_SIZE: usize = 0x10_0000;
/// Largest AES package including header.
pub const MAX_AESPACKAGE_SIZE: usize = 0x10_0010;
/// Header length of CRData / DCData packages: id (8) + data length (4).
pub const AES_CR_HEADER_LEN: usize = 12;
/// Header overhead of key packages: magic word (8) + id (8).
pub const AES_KEY_HEADER_LEN: usize = 16;
/// Offset of the data length field in CRData / DCData packages.
pub const AES_DATALEN_OFFSET: usize = 8;
/// AES-256 key length.
pub const AES_KEY_LEN: usize = 32;
/// AES block / IV length.
pub const AES_IV_LEN: usize = 16;

/// Payload bytes of one image cluster.
pub const CLUSTER_DATALEN: usize = 0x1000;
/// OTP cluster header: id (8) + chunk field (2) + used length (4).
pub const OTP_HEADER_LEN: usize = 14;
/// Offset of the chunk field in the cluster header.
pub const OTP_CHUNKID_OFFSET: usize = 8;
/// Offset of the used length field in the cluster header.
pub const OTP_USEDLEN_OFFSET: usize = 10;
/// Largest cluster on the wire.
pub const MAX_OTPCLUSTER_SIZE: usize = OTP_HEADER_LEN + CLUSTER_DATALEN;

/// Chunk field flag: the last region starts a package continued in the next cluster.
pub const BEG_OF_CHAIN: u16 = 0x2000;
/// Chunk field flag: the first region continues a package started earlier.
pub const END_OF_CHAIN: u16 = 0x4000;
/// Chunk field flag: this page closes its image cluster.
pub const END_OF_CLUSTER: u16 = 0x8000;
/// Chunk field value marking a corrupted cluster.
pub const INVALID_CHUNK: u16 = 0xFFFF;
/// Highest chunk index a chain may reach.
pub const MAX_CHUNK_INDEX: u16 = 0x200;

/// Id of a key or cluster not yet bound to an image cluster.
pub const UNASSIGNED_CLUSTER_ID: u64 = 0;
/// Id of the first image cluster; every assigned id has bit 63 set.
pub const FIRST_ASSIGNED_CLUSTER_ID: u64 = 0x8000_0000_0000_0000;
/// Number of page slots (and bound keys) per image cluster.
pub const CLUSTER_SLOTS: u64 = 0x80;

/// Channel the gap detector picks for an outgoing cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendMethod {
    /// Always the first SSL channel.
    ChannelOne,
    /// Always the second SSL channel.
    ChannelTwo,
    /// A random channel per cluster.
    Random,
    /// Alternate the two channels.
    #[default]
    Different,
}

impl fmt::Display for SendMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ChannelOne => "channel_one",
            Self::ChannelTwo => "channel_two",
            Self::Random => "random",
            Self::Different => "different",
        })
    }
}

/// Session magic word identifying key packages inside decoded payloads.
///
/// Pre-send bundles carry the word itself, IV packages `word ^ 16`, key
/// packages `word ^ 32`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MagicWord(u64);

impl MagicWord {
    /// Wraps a raw 64-bit word.
    #[must_use]
    pub const fn new(word: u64) -> Self {
        Self(word)
    }

    /// The raw word.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Tag written at the head of a package of `kind`, or `None` for data packages.
    #[must_use]
    pub const fn tag_for(self, kind: AesKind) -> Option<u64> {
        match kind {
            AesKind::PreSend => Some(self.0),
            AesKind::Iv => Some(self.0 ^ 16),
            AesKind::Key => Some(self.0 ^ 32),
            AesKind::CrData | AesKind::DcData => None,
        }
    }

    /// Classifies the first eight bytes of a payload region.
    #[must_use]
    pub const fn classify(self, head: u64) -> Option<AesKind> {
        if head == self.0 {
            Some(AesKind::PreSend)
        } else if head == self.0 ^ 16 {
            Some(AesKind::Iv)
        } else if head == self.0 ^ 32 {
            Some(AesKind::Key)
        } else {
            None
        }
    }
}

impl fmt::Debug for MagicWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MagicWord({:#018x})", self.0)
    }
}

/// Inclusive id window accepted for decoded key packages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceLimits {
    /// Lowest accepted id.
    pub low: u64,
    /// Highest accepted id.
    pub high: u64,
}

impl SequenceLimits {
    /// A window accepting every id.
    #[must_use]
    pub const fn unbounded() -> Self {
        Self {
            low: 0,
            high: u64::MAX,
        }
    }

    /// Whether `id` must be checked and lies inside the window.
    ///
    /// Ids without bit 63 set are order ids and are not range-checked.
    #[must_use]
    pub const fn admits(&self, id: u64) -> bool {
        id & FIRST_ASSIGNED_CLUSTER_ID == 0 || (id >= self.low && id <= self.high)
    }
}

/// A typed byte buffer as it travels between modules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    kind: PackageType,
    bytes: Vec<u8>,
    send_method: SendMethod,
}

impl RawMessage {
    /// Wraps `bytes` tagged with `kind`.
    #[must_use]
    pub const fn new(kind: PackageType, bytes: Vec<u8>) -> Self {
        Self {
            kind,
            bytes,
            send_method: SendMethod::Different,
        }
    }

    /// Sets the channel hint.
    #[must_use]
    pub const fn with_send_method(mut self, method: SendMethod) -> Self {
        self.send_method = method;
        self
    }

    /// Type tag.
    #[must_use]
    pub const fn kind(&self) -> PackageType {
        self.kind
    }

    /// Channel hint.
    #[must_use]
    pub const fn send_method(&self) -> SendMethod {
        self.send_method
    }

    /// Borrowed bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True for an empty buffer.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Consumes the message and returns its buffer.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Read access shared by every frame variant.
pub trait Framed {
    /// Type tag of the frame.
    fn package_type(&self) -> PackageType;
    /// Frame id (order id, cluster id or application id).
    fn id(&self) -> u64;
    /// Header length in bytes.
    fn header_len(&self) -> usize;
    /// Payload length in bytes.
    fn data_len(&self) -> usize;
    /// The complete frame as it goes on the wire.
    fn as_bytes(&self) -> &[u8];

    /// Payload bytes.
    fn data(&self) -> &[u8] {
        let start = self.header_len();
        let bytes = self.as_bytes();
        bytes.get(start..start + self.data_len()).unwrap_or_default()
    }

    /// Wraps a copy of the frame into a [`RawMessage`].
    fn to_message(&self) -> RawMessage {
        RawMessage::new(self.package_type(), self.as_bytes().to_vec())
    }
}
