// File:    wire.rs
// Author:  apezoo
// Date:    2026-10-16
//
// Description: Bounds-checked little-endian field access on byte buffers.
//
// License:
// This project is licensed under the terms of the GNU AGPLv3 license.
// See the LICENSE.md file in the project root for full license information.

use crate::error::FramingError;

fn field<const N: usize>(buf: &[u8], offset: usize) -> Result<[u8; N], FramingError> {
    let end = offset.checked_add(N).ok_or(FramingError::Garbled("field offset overflow"))?;
    buf.get(offset..end)
        .and_then(|s| s.try_into().ok())
        .ok_or(FramingError::TooShort { len: buf.len(), min: end })
}

fn field_mut<const N: usize>(
    buf: &mut [u8],
    offset: usize,
    bytes: [u8; N],
) -> Result<(), FramingError> {
    let len = buf.len();
    let end = offset.checked_add(N).ok_or(FramingError::Garbled("field offset overflow"))?;
    buf.get_mut(offset..end)
        .ok_or(FramingError::TooShort { len, min: end })?
        .copy_from_slice(&bytes);
    Ok(())
}

pub(crate) fn get_u64(buf: &[u8], offset: usize) -> Result<u64, FramingError> {
    field(buf, offset).map(u64::from_le_bytes)
}

pub(crate) fn get_u32(buf: &[u8], offset: usize) -> Result<u32, FramingError> {
    field(buf, offset).map(u32::from_le_bytes)
}

pub(crate) fn get_u16(buf: &[u8], offset: usize) -> Result<u16, FramingError> {
    field(buf, offset).map(u16::from_le_bytes)
}

pub(crate) fn put_u64(buf: &mut [u8], offset: usize, value: u64) -> Result<(), FramingError> {
    field_mut(buf, offset, value.to_le_bytes())
}

pub(crate) fn put_u32(buf: &mut [u8], offset: usize, value: u32) -> Result<(), FramingError> {
    field_mut(buf, offset, value.to_le_bytes())
}

/// Copies `N` bytes starting at `offset`.
pub(crate) fn get_array<const N: usize>(buf: &[u8], offset: usize) -> Result<[u8; N], FramingError> {
    field(buf, offset)
}

/// Writes `bytes` starting at `offset`.
pub(crate) fn put_slice(buf: &mut [u8], offset: usize, bytes: &[u8]) -> Result<(), FramingError> {
    let len = buf.len();
    let end = offset
        .checked_add(bytes.len())
        .ok_or(FramingError::Garbled("field offset overflow"))?;
    buf.get_mut(offset..end)
        .ok_or(FramingError::TooShort { len, min: end })?
        .copy_from_slice(bytes);
    Ok(())
}

