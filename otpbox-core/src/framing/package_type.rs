// File:    package_type.rs
// Author:  apezoo
// Date:    2026-10-16
//
// Description: Byte-sized package type tag with bit-flag composition.
//
// License:
// This project is licensed under the terms of the GNU AGPLv3 license.
// See the LICENSE.md file in the project root for full license information.

use std::fmt;

use crate::error::FramingError;

/// Package type tag carried alongside every message.
///
/// The tag is a composed bitmask: `CR` marks encrypted content, `FRAGMENT`
/// marks one chunk of a larger unit, and `KEY` is shared by the three
/// key-material variants.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PackageType(u8);

impl PackageType {
    /// Invalid / unset tag.
    pub const INVALID: Self = Self(0);
    /// Encrypted flag.
    pub const CR: Self = Self(1);
    /// Chunked package flag.
    pub const FRAGMENT: Self = Self(2);
    /// AES package.
    pub const AES: Self = Self(4);
    /// AES package carrying deciphered data.
    pub const DC_DATA: Self = Self(4);
    /// AES package carrying ciphered data.
    pub const CR_DATA: Self = Self(5);
    /// OTP cluster.
    pub const OTP: Self = Self(8);
    /// OTP cluster combined with the pad.
    pub const CR_CLUSTER: Self = Self(9);
    /// Ethernet frame.
    pub const ETHERNET: Self = Self(16);
    /// IP package.
    pub const IP: Self = Self(24);
    /// AES key package.
    pub const KEY: Self = Self(36);
    /// ARP package.
    pub const ARP: Self = Self(40);
    /// IPv6 package.
    pub const IPV6: Self = Self(56);
    /// AES IV package.
    pub const IV: Self = Self(100);
    /// Pre-send key bundle.
    pub const PRE_SEND: Self = Self(164);
    /// Raw, untyped package.
    pub const RAW: Self = Self(255);

    /// Builds a tag from its wire byte.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Returns the wire byte.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// True when every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True for the key, IV and pre-send variants.
    #[must_use]
    pub const fn is_key(self) -> bool {
        self.contains(Self::KEY)
    }

    /// True for a chunk of a larger logical unit.
    #[must_use]
    pub const fn is_fragment(self) -> bool {
        self.contains(Self::FRAGMENT)
    }

    /// True for encrypted content.
    #[must_use]
    pub const fn is_encoded(self) -> bool {
        self.contains(Self::CR)
    }

    /// True when the tag denotes an OTP cluster, encoded or not.
    #[must_use]
    pub const fn is_cluster(self) -> bool {
        self.0 & !(Self::CR.0 | Self::FRAGMENT.0) == Self::OTP.0
    }

    /// Returns the tag with the fragment flag set or cleared.
    #[must_use]
    pub const fn with_fragment(self, enable: bool) -> Self {
        if enable {
            Self(self.0 | Self::FRAGMENT.0)
        } else {
            Self(self.0 & !Self::FRAGMENT.0)
        }
    }

    /// Returns the tag with the encrypted flag set or cleared.
    #[must_use]
    pub const fn with_encoded(self, encoded: bool) -> Self {
        if encoded {
            Self(self.0 | Self::CR.0)
        } else {
            Self(self.0 & !Self::CR.0)
        }
    }
}

impl fmt::Debug for PackageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::INVALID => "Invalid",
            Self::CR => "CR",
            Self::FRAGMENT => "Fragment",
            Self::AES => "AES",
            Self::CR_DATA => "CRData",
            Self::OTP => "OTP",
            Self::CR_CLUSTER => "CRCluster",
            Self::ETHERNET => "Ethernet",
            Self::IP => "IP",
            Self::KEY => "AesKey",
            Self::ARP => "ARP",
            Self::IPV6 => "IPv6",
            Self::IV => "AesIV",
            Self::PRE_SEND => "AesPreSend",
            Self::RAW => "Raw",
            _ => return write!(f, "PackageType({:#04x})", self.0),
        };
        f.write_str(name)
    }
}

/// The five AES package variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AesKind {
    /// Pre-send bundle: magic word, full key store, order id.
    PreSend,
    /// Key-only package: tagged magic word, 32-byte key, id.
    Key,
    /// IV-only package: tagged magic word, 16-byte IV, id.
    Iv,
    /// Ciphered data: id, length, payload.
    CrData,
    /// Deciphered data: id, length, payload.
    DcData,
}

impl AesKind {
    /// Resolves the AES variant of a type tag.
    pub const fn from_type(kind: PackageType) -> Result<Self, FramingError> {
        match kind {
            PackageType::PRE_SEND => Ok(Self::PreSend),
            PackageType::IV => Ok(Self::Iv),
            PackageType::KEY => Ok(Self::Key),
            PackageType::CR_DATA => Ok(Self::CrData),
            PackageType::DC_DATA => Ok(Self::DcData),
            other => Err(FramingError::InvalidType(other.bits())),
        }
    }

    /// Returns the type tag of this variant.
    #[must_use]
    pub const fn package_type(self) -> PackageType {
        match self {
            Self::PreSend => PackageType::PRE_SEND,
            Self::Key => PackageType::KEY,
            Self::Iv => PackageType::IV,
            Self::CrData => PackageType::CR_DATA,
            Self::DcData => PackageType::DC_DATA,
        }
    }

    /// True for the key-material variants.
    #[must_use]
    pub const fn is_key_material(self) -> bool {
        matches!(self, Self::PreSend | Self::Key | Self::Iv)
    }
}
