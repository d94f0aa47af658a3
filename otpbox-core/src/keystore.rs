// File:    keystore.rs
// Author:  apezoo
// Date:    2026-10-16
//
// Description: AES key material: generation, password derivation, wire form and the session magic word.
//
// License:
// This project is licensed under the terms of the GNU AGPLv3 license.
// See the LICENSE.md file in the project root for full license information.

//! AES key material exchanged through the tunnel.
//!
//! A [`KeyStore`] holds the 32-byte key and 16-byte IV together with the
//! password and salt they were derived from. Its 96-byte wire form is
//! `key(32) | iv(16) | password(17, NUL-terminated) | pad(3) | salt(2 x u32) | reserved(20)`.

use std::fmt;

use rand::{TryRngCore, rngs::OsRng};

use crate::crypto::sha256;
use crate::error::FramingError;
use crate::framing::{AES_IV_LEN, AES_KEY_LEN, MagicWord};

/// Length of the key store wire form.
pub const KEY_STORE_WIRE_LEN: usize = 96;
/// Length of the incoming backlog form: key and IV only.
pub const INCOMING_WIRE_LEN: usize = AES_KEY_LEN + AES_IV_LEN;
/// Number of password characters.
pub const PASSWORD_LEN: usize = 16;
/// Rounds of the key derivation.
pub const KEYGEN_ROUNDS: usize = 10;

const PASSWORD_OFFSET: usize = AES_KEY_LEN + AES_IV_LEN;
const SALT_OFFSET: usize = 68;

/// Key material for one AES-protected package.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyStore {
    /// AES-256 key.
    pub key: [u8; AES_KEY_LEN],
    /// AES initialisation vector.
    pub iv: [u8; AES_IV_LEN],
    /// Password the key was derived from, NUL-terminated.
    pub password: [u8; PASSWORD_LEN + 1],
    /// Derivation salt.
    pub salt: [u32; 2],
}

impl KeyStore {
    /// Generates fresh key material from the OS random source.
    ///
    /// The password is 16 alphanumeric ASCII characters, each salt a
    /// five-digit number.
    pub fn generate() -> std::io::Result<Self> {
        let mut rng = OsRng;
        let mut password = [0u8; PASSWORD_LEN + 1];
        let mut filled = 0;
        let mut pool = [0u8; 64];
        while filled < PASSWORD_LEN {
            rng.try_fill_bytes(&mut pool).map_err(std::io::Error::other)?;
            for &b in &pool {
                // Rejection sampling keeps the distribution uniform.
                let c = 48 + b % 75;
                if b < 225 && c.is_ascii_alphanumeric() && filled < PASSWORD_LEN {
                    password[filled] = c;
                    filled += 1;
                }
            }
        }
        let mut salt = [0u32; 2];
        for s in &mut salt {
            let raw = rng.try_next_u32().map_err(std::io::Error::other)?;
            *s = 10_000 + raw % 90_000;
        }
        Ok(Self::derive(password, salt))
    }

    /// Deterministic key material from a pre-shared password and zero salt.
    ///
    /// Both peers derive the first key, and from it the magic word, this way.
    #[must_use]
    pub fn from_password(password: &str) -> Self {
        let mut buf = [0u8; PASSWORD_LEN + 1];
        let n = password.len().min(PASSWORD_LEN);
        buf[..n].copy_from_slice(&password.as_bytes()[..n]);
        Self::derive(buf, [0, 0])
    }

    fn derive(password: [u8; PASSWORD_LEN + 1], salt: [u32; 2]) -> Self {
        let pw = &password[..PASSWORD_LEN];
        let mut salt_bytes = [0u8; 8];
        salt_bytes[..4].copy_from_slice(&salt[0].to_le_bytes());
        salt_bytes[4..].copy_from_slice(&salt[1].to_le_bytes());

        let mut digest = sha256(&[pw, &salt_bytes]);
        for _ in 1..KEYGEN_ROUNDS {
            digest = sha256(&[&digest, pw, &salt_bytes]);
        }
        let iv_digest = sha256(&[&digest, pw]);
        let mut iv = [0u8; AES_IV_LEN];
        iv.copy_from_slice(&iv_digest[..AES_IV_LEN]);

        Self {
            key: digest,
            iv,
            password,
            salt,
        }
    }

    /// Serializes the 96-byte wire form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; KEY_STORE_WIRE_LEN] {
        let mut out = [0u8; KEY_STORE_WIRE_LEN];
        out[..AES_KEY_LEN].copy_from_slice(&self.key);
        out[AES_KEY_LEN..PASSWORD_OFFSET].copy_from_slice(&self.iv);
        out[PASSWORD_OFFSET..=PASSWORD_OFFSET + PASSWORD_LEN].copy_from_slice(&self.password);
        out[SALT_OFFSET..SALT_OFFSET + 4].copy_from_slice(&self.salt[0].to_le_bytes());
        out[SALT_OFFSET + 4..SALT_OFFSET + 8].copy_from_slice(&self.salt[1].to_le_bytes());
        out
    }

    /// Parses the 96-byte wire form or the 48-byte key-and-IV form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FramingError> {
        let mut store = match bytes.len() {
            KEY_STORE_WIRE_LEN | INCOMING_WIRE_LEN => Self::empty(),
            0 => return Err(FramingError::ZeroLength),
            len => {
                return Err(FramingError::LengthMismatch {
                    declared: KEY_STORE_WIRE_LEN,
                    actual: len,
                });
            }
        };
        store.key.copy_from_slice(&bytes[..AES_KEY_LEN]);
        store.iv.copy_from_slice(&bytes[AES_KEY_LEN..PASSWORD_OFFSET]);
        if bytes.len() == KEY_STORE_WIRE_LEN {
            store
                .password
                .copy_from_slice(&bytes[PASSWORD_OFFSET..=PASSWORD_OFFSET + PASSWORD_LEN]);
            for (i, s) in store.salt.iter_mut().enumerate() {
                let at = SALT_OFFSET + 4 * i;
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&bytes[at..at + 4]);
                *s = u32::from_le_bytes(raw);
            }
        }
        Ok(store)
    }

    /// Key and IV only, as kept for incoming keys.
    #[must_use]
    pub fn to_incoming_bytes(&self) -> [u8; INCOMING_WIRE_LEN] {
        let mut out = [0u8; INCOMING_WIRE_LEN];
        out[..AES_KEY_LEN].copy_from_slice(&self.key);
        out[AES_KEY_LEN..].copy_from_slice(&self.iv);
        out
    }

    /// All-zero key material, filled in piecewise by key-only and IV-only packages.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            key: [0; AES_KEY_LEN],
            iv: [0; AES_IV_LEN],
            password: [0; PASSWORD_LEN + 1],
            salt: [0; 2],
        }
    }

    /// The session magic word derived from this key material.
    #[must_use]
    pub fn magic(&self) -> MagicWord {
        let salt0 = self.salt[0].to_le_bytes();
        let salt1 = self.salt[1].to_le_bytes();
        let digest = sha256(&[&self.key, &self.iv, &self.password, &salt0, &salt1]);
        let mut word = [0u8; 8];
        word.copy_from_slice(&digest[..8]);
        MagicWord::new(u64::from_le_bytes(word))
    }
}

impl fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyStore")
            .field("key", &"<redacted>")
            .field("salt", &self.salt)
            .finish_non_exhaustive()
    }
}
