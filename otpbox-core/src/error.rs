// File:    error.rs
// Author:  apezoo
// Date:    2026-10-16
//
// Description: Error taxonomy shared by the framing layer, key agent, gap detector and OTP processor.
//
// License:
// This project is licensed under the terms of the GNU AGPLv3 license.
// See the LICENSE.md file in the project root for full license information.

//! Error types for the OTP tunnel engine.
//!
//! Every fallible operation returns [`Result<T>`], which wraps [`Error`].
//! Framing problems carry their own [`FramingError`] so callers can tell a
//! rejected message apart from a session-fatal condition.

use thiserror::Error;

/// Reasons a byte buffer was rejected by the framing layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    /// The buffer content does not form a package at all.
    #[error("garbled package: {0}")]
    Garbled(&'static str),

    /// An empty buffer was handed to a cast.
    #[error("zero-length package")]
    ZeroLength,

    /// The buffer is shorter than the header of the requested variant.
    #[error("package too short: {len} bytes, need more than {min}")]
    TooShort {
        /// Actual buffer length.
        len: usize,
        /// Minimum length the variant requires.
        min: usize,
    },

    /// The buffer exceeds the maximum size of the requested variant.
    #[error("package too long: {len} bytes, max {max}")]
    TooLong {
        /// Actual buffer length.
        len: usize,
        /// Maximum length the variant allows.
        max: usize,
    },

    /// The type tag does not match the requested variant.
    #[error("invalid package type tag {0:#04x}")]
    InvalidType(u8),

    /// The length declared in the header disagrees with the buffer.
    #[error("declared data length {declared} does not match buffer payload {actual}")]
    LengthMismatch {
        /// Length read from the header.
        declared: usize,
        /// Payload length actually present.
        actual: usize,
    },

    /// The chunk field of a cluster header is corrupted.
    #[error("invalid chunk field {0:#06x}")]
    InvalidChunk(u16),

    /// A key package carries a cluster id outside the current sequence window.
    #[error("cluster id {0:#018x} outside the current sequence limits")]
    SequenceOutOfRange(u64),
}

/// Error type for all tunnel engine operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A message failed framing validation.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// A missing cluster did not arrive before the gap timer expired.
    #[error("sequence gap: cluster {cluster_id:#018x} was not received in time")]
    SequenceGap {
        /// Id of the cluster declared lost.
        cluster_id: u64,
    },

    /// No AES key package arrived before the connection timer expired.
    #[error("connection gap: no key package received within {waited_ms} ms")]
    ConnectionGap {
        /// Configured waiting time.
        waited_ms: u64,
    },

    /// Clusters held back for reordering exceed the configured budget.
    #[error("reorder buffer overflow: {held} bytes held, budget {budget}")]
    ReorderOverflow {
        /// Bytes the buffer would hold with the rejected cluster.
        held: usize,
        /// Configured budget in bytes.
        budget: usize,
    },

    /// Reading or writing the OTP image, a state file or the random source failed.
    #[error("I/O error: {0}")]
    ImageIo(#[from] std::io::Error),

    /// The key backlog store failed.
    #[error("key backlog error: {0}")]
    Backlog(String),

    /// No key is available for the outgoing hot path.
    #[error("no outgoing AES key available")]
    KeyExhaustion,

    /// A pre-send order id is not present in the outgoing queue.
    #[error("order id {order_id} is not present in the key queue")]
    KeyNotAssigned {
        /// Order id that was looked up.
        order_id: u64,
    },

    /// Chunk chains or merged clusters are inconsistent.
    #[error("data integrity violation: {0}")]
    DataIntegrity(String),

    /// Configuration could not be loaded or is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// The queue or module has been shut down.
    #[error("queue closed")]
    Closed,

    /// An operation was called in the wrong processor state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

/// Result type alias for tunnel engine operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns true when the session cannot continue after this error.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::Closed)
    }
}
