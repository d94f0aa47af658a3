// File:    aes.rs
// Author:  apezoo
// Date:    2026-10-16
//
// Description: AES-level packages: pre-send key bundles, key-only, IV-only, ciphered and deciphered data.
//
// License:
// This project is licensed under the terms of the GNU AGPLv3 license.
// See the LICENSE.md file in the project root for full license information.

use std::fmt;

use super::wire::{get_array, get_u32, get_u64, put_slice, put_u32, put_u64};
use super::{
    AES_CR_HEADER_LEN, AES_DATALEN_OFFSET, AES_IV_LEN, AES_KEY_HEADER_LEN, AES_KEY_LEN, AesKind,
    Framed, MAX_AESPACKAGE_SIZE, MagicWord, PackageType,
};
use crate::error::FramingError;
use crate::keystore::{KEY_STORE_WIRE_LEN, KeyStore};

/// Wire length of a data payload of `len` bytes.
///
/// Computed as `len + (len + 12) % 8`. For most lengths this lands the package
/// on an 8-byte boundary; peers rely on the exact formula, not the alignment.
#[must_use]
pub const fn aligned_data_len(len: usize) -> usize {
    len + (len + AES_CR_HEADER_LEN) % 8
}

const fn key_payload_len(kind: AesKind) -> usize {
    match kind {
        AesKind::PreSend => KEY_STORE_WIRE_LEN,
        AesKind::Key => AES_KEY_LEN,
        AesKind::Iv => AES_IV_LEN,
        AesKind::CrData | AesKind::DcData => 0,
    }
}

const fn id_offset(kind: AesKind) -> usize {
    if kind.is_key_material() {
        8 + key_payload_len(kind)
    } else {
        0
    }
}

/// Total length of a key-material package of `kind`.
pub(super) const fn key_package_len(kind: AesKind) -> usize {
    AES_KEY_HEADER_LEN + key_payload_len(kind)
}

/// An AES package owning its wire buffer.
///
/// Key-material layout: `magic(8) | payload | id(8)`.
/// Data layout: `id(8) | data_len(4) | data | padding`.
#[derive(Clone, PartialEq, Eq)]
pub struct AesPackage {
    kind: AesKind,
    buf: Vec<u8>,
}

impl AesPackage {
    /// Pre-send bundle carrying the full key store under a queue order id.
    #[must_use]
    pub fn pre_send(key: &KeyStore, order_id: u64, magic: MagicWord) -> Self {
        Self::key_material(AesKind::PreSend, &key.to_bytes(), order_id, magic)
    }

    /// Key-only package for `cluster_id`.
    #[must_use]
    pub fn key_only(key: &KeyStore, cluster_id: u64, magic: MagicWord) -> Self {
        Self::key_material(AesKind::Key, &key.key, cluster_id, magic)
    }

    /// IV-only package for `cluster_id`.
    #[must_use]
    pub fn iv_only(key: &KeyStore, cluster_id: u64, magic: MagicWord) -> Self {
        Self::key_material(AesKind::Iv, &key.iv, cluster_id, magic)
    }

    fn key_material(kind: AesKind, payload: &[u8], id: u64, magic: MagicWord) -> Self {
        let mut buf = Vec::with_capacity(key_package_len(kind));
        buf.extend_from_slice(&magic.tag_for(kind).unwrap_or_default().to_le_bytes());
        buf.extend_from_slice(payload);
        buf.extend_from_slice(&id.to_le_bytes());
        Self { kind, buf }
    }

    /// Ciphered data package.
    pub fn cr_data(id: u64, data: &[u8]) -> Result<Self, FramingError> {
        Self::data_package(AesKind::CrData, id, data)
    }

    /// Deciphered data package.
    pub fn dc_data(id: u64, data: &[u8]) -> Result<Self, FramingError> {
        Self::data_package(AesKind::DcData, id, data)
    }

    fn data_package(kind: AesKind, id: u64, data: &[u8]) -> Result<Self, FramingError> {
        if data.is_empty() {
            return Err(FramingError::ZeroLength);
        }
        let max = MAX_AESPACKAGE_SIZE - AES_CR_HEADER_LEN;
        if aligned_data_len(data.len()) > max {
            return Err(FramingError::TooLong {
                len: data.len(),
                max,
            });
        }
        let mut package = Self {
            kind,
            buf: vec![0; AES_CR_HEADER_LEN],
        };
        put_u64(&mut package.buf, 0, id)?;
        package.write_data(data)?;
        Ok(package)
    }

    /// Validates `buf` as a package of the variant named by `kind` and takes ownership.
    ///
    /// Data packages are accepted in exact (`12 + len`) and aligned
    /// (`12 + aligned_data_len(len)`) form.
    pub fn cast(kind: PackageType, buf: Vec<u8>) -> Result<Self, FramingError> {
        let kind = AesKind::from_type(kind)?;
        let size = buf.len();
        if size == 0 {
            return Err(FramingError::ZeroLength);
        }
        if size > MAX_AESPACKAGE_SIZE {
            return Err(FramingError::TooLong {
                len: size,
                max: MAX_AESPACKAGE_SIZE,
            });
        }

        if kind.is_key_material() {
            let expected = key_package_len(kind);
            if size < expected {
                return Err(FramingError::TooShort {
                    len: size,
                    min: expected,
                });
            }
            if size > expected {
                return Err(FramingError::TooLong {
                    len: size,
                    max: expected,
                });
            }
            return Ok(Self { kind, buf });
        }

        if size <= AES_CR_HEADER_LEN {
            return Err(FramingError::TooShort {
                len: size,
                min: AES_CR_HEADER_LEN,
            });
        }
        let declared = get_u32(&buf, AES_DATALEN_OFFSET)? as usize;
        if declared == 0 {
            return Err(FramingError::Garbled("data package declares zero length"));
        }
        let actual = size - AES_CR_HEADER_LEN;
        if actual != declared && actual != aligned_data_len(declared) {
            return Err(FramingError::LengthMismatch { declared, actual });
        }
        Ok(Self { kind, buf })
    }

    /// Variant of this package.
    #[must_use]
    pub const fn kind(&self) -> AesKind {
        self.kind
    }

    /// Rewrites the package id.
    pub fn set_id(&mut self, id: u64) -> Result<(), FramingError> {
        put_u64(&mut self.buf, id_offset(self.kind), id)
    }

    /// Length of the payload once aligned for the wire.
    #[must_use]
    pub fn aligned_data_len(&self) -> usize {
        if self.kind.is_key_material() {
            self.data_len()
        } else {
            aligned_data_len(self.data_len())
        }
    }

    /// Replaces the payload of a data package, clamped to the maximum size.
    ///
    /// Key-material packages overwrite their fixed payload from the front.
    /// Returns the number of bytes taken from `data`.
    pub fn set_data(&mut self, data: &[u8]) -> Result<usize, FramingError> {
        if self.kind.is_key_material() {
            let n = data.len().min(key_payload_len(self.kind));
            put_slice(&mut self.buf, 8, &data[..n])?;
            return Ok(n);
        }
        let n = data.len().min(self.max_data_len());
        self.write_data(&data[..n])?;
        Ok(n)
    }

    /// Appends to the payload of a data package, clamped to the maximum size.
    ///
    /// Returns the number of bytes taken from `data`.
    pub fn add_data(&mut self, data: &[u8]) -> Result<usize, FramingError> {
        if self.kind.is_key_material() {
            return Err(FramingError::InvalidType(self.kind.package_type().bits()));
        }
        let current = self.data().to_vec();
        let n = data.len().min(self.max_data_len().saturating_sub(current.len()));
        let mut joined = current;
        joined.extend_from_slice(&data[..n]);
        self.write_data(&joined)?;
        Ok(n)
    }

    fn max_data_len(&self) -> usize {
        if self.kind.is_key_material() {
            return key_payload_len(self.kind);
        }
        // Largest length whose aligned form still fits.
        let limit = MAX_AESPACKAGE_SIZE - AES_CR_HEADER_LEN;
        (limit - 7..=limit)
            .rev()
            .find(|&n| aligned_data_len(n) <= limit)
            .unwrap_or(0)
    }

    fn write_data(&mut self, data: &[u8]) -> Result<(), FramingError> {
        let declared = u32::try_from(data.len()).map_err(|_| FramingError::TooLong {
            len: data.len(),
            max: MAX_AESPACKAGE_SIZE,
        })?;
        self.buf.truncate(AES_CR_HEADER_LEN);
        self.buf.extend_from_slice(data);
        self.buf
            .resize(AES_CR_HEADER_LEN + aligned_data_len(data.len()), 0);
        put_u32(&mut self.buf, AES_DATALEN_OFFSET, declared)
    }

    /// Magic tag at the head of a key-material package.
    #[must_use]
    pub fn magic_tag(&self) -> Option<u64> {
        if self.kind.is_key_material() {
            get_u64(&self.buf, 0).ok()
        } else {
            None
        }
    }

    /// Stamps the session magic word, tagged for this variant.
    pub fn set_magic(&mut self, magic: MagicWord) -> Result<(), FramingError> {
        let tag = magic
            .tag_for(self.kind)
            .ok_or(FramingError::InvalidType(self.kind.package_type().bits()))?;
        put_u64(&mut self.buf, 0, tag)
    }

    /// Key store carried by a pre-send bundle.
    pub fn key_store(&self) -> Result<KeyStore, FramingError> {
        if self.kind != AesKind::PreSend {
            return Err(FramingError::InvalidType(self.kind.package_type().bits()));
        }
        KeyStore::from_bytes(self.data())
    }

    /// AES key carried by a pre-send bundle or key-only package.
    #[must_use]
    pub fn key_bytes(&self) -> Option<[u8; AES_KEY_LEN]> {
        match self.kind {
            AesKind::PreSend | AesKind::Key => get_array(&self.buf, 8).ok(),
            _ => None,
        }
    }

    /// IV carried by a pre-send bundle or IV-only package.
    #[must_use]
    pub fn iv_bytes(&self) -> Option<[u8; AES_IV_LEN]> {
        match self.kind {
            AesKind::PreSend => get_array(&self.buf, 8 + AES_KEY_LEN).ok(),
            AesKind::Iv => get_array(&self.buf, 8).ok(),
            _ => None,
        }
    }

    /// Consumes the package and returns its wire buffer.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

impl Framed for AesPackage {
    fn package_type(&self) -> PackageType {
        self.kind.package_type()
    }

    fn id(&self) -> u64 {
        get_u64(&self.buf, id_offset(self.kind)).unwrap_or_default()
    }

    fn header_len(&self) -> usize {
        if self.kind.is_key_material() {
            8
        } else {
            AES_CR_HEADER_LEN
        }
    }

    fn data_len(&self) -> usize {
        if self.kind.is_key_material() {
            key_payload_len(self.kind)
        } else {
            get_u32(&self.buf, AES_DATALEN_OFFSET).map_or(0, |n| n as usize)
        }
    }

    fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

impl fmt::Debug for AesPackage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AesPackage")
            .field("kind", &self.kind)
            .field("id", &format_args!("{:#x}", self.id()))
            .field("data_len", &self.data_len())
            .finish_non_exhaustive()
    }
}
