// File:    lib.rs
// Author:  apezoo
// Date:    2026-10-16
//
// Description: The core library of otpbox: a one-time-pad tunnel engine with cluster framing, AES key exchange and gap detection.
//
// License:
// This project is licensed under the terms of the GNU AGPLv3 license.
// See the LICENSE.md file in the project root for full license information.

//! # otpbox core
//!
//! Two peers share a large random file, the OTP image. Outgoing AES
//! packages are laid into the image cluster by cluster, XOR-ed with the pad
//! and sent as network pages over one of two channels. The receiving side
//! restores page order, removes the pad at the same offsets and rebuilds
//! the AES packages, routing key material to the key agent and data to the
//! application.
//!
//! The entry point is [`processor::OtpProcessor`], fed through the
//! [`pipeline::Communicator`] seam.

/// Key backlog stores.
pub mod backlog;
/// Engine configuration.
pub mod config;
/// Pad arithmetic and hashing helpers.
pub mod crypto;
/// Error taxonomy.
pub mod error;
/// Wire formats: AES packages, OTP clusters and raw messages.
pub mod framing;
/// Reordering of received clusters and the session timers.
pub mod gap_detector;
/// The OTP image file and cursors over it.
pub mod image;
/// Generation and exchange of AES keys.
pub mod key_agent;
/// Ordered key queues with backlog spill.
pub mod key_queue;
/// AES key material.
pub mod keystore;
/// Queues and workers connecting the modules.
pub mod pipeline;
/// Persisted image position.
pub mod position;
/// The OTP encode/decode engine.
pub mod processor;
/// Delayed and repeating tasks on one thread.
pub mod scheduler;
/// Throughput measurement.
pub mod throughput;

pub use config::Config;
pub use error::{Error, FramingError, Result};
pub use processor::{DecodedPackage, OtpProcessor, SessionState};
