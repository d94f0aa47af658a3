// File:    cluster.rs
// Author:  apezoo
// Date:    2026-10-16
//
// Description: OTP cluster frames: header access, chunk chains, pad combination and page splitting.
//
// License:
// This project is licensed under the terms of the GNU AGPLv3 license.
// See the LICENSE.md file in the project root for full license information.

use std::fmt;
use std::ops::Range;

use super::aes::key_package_len;
use super::wire::{get_u16, get_u32, get_u64};
use super::{
    AES_CR_HEADER_LEN, AES_DATALEN_OFFSET, AesKind, BEG_OF_CHAIN, CLUSTER_DATALEN, END_OF_CHAIN,
    END_OF_CLUSTER, FIRST_ASSIGNED_CLUSTER_ID, Framed, INVALID_CHUNK, MAX_AESPACKAGE_SIZE,
    MAX_CHUNK_INDEX, MAX_OTPCLUSTER_SIZE, MagicWord, OTP_CHUNKID_OFFSET, OTP_HEADER_LEN,
    OTP_USEDLEN_OFFSET, PackageType, SendMethod, SequenceLimits, UNASSIGNED_CLUSTER_ID,
    aligned_data_len,
};
use crate::crypto::xor_in_place;
use crate::error::{Error, FramingError};

const CHUNK_INDEX_MASK: u16 = 0x1FFF;
const CHAIN_FLAGS: u16 = BEG_OF_CHAIN | END_OF_CHAIN;

/// Cluster id of image cluster ordinal `num`, page slot 0.
#[must_use]
pub const fn make_cluster_id_from_num(num: u64) -> u64 {
    FIRST_ASSIGNED_CLUSTER_ID ^ (num << 7)
}

/// Image cluster ordinal of a cluster id.
#[must_use]
pub const fn make_cluster_num_from_id(id: u64) -> u64 {
    (FIRST_ASSIGNED_CLUSTER_ID ^ id) >> 7
}

/// Page slot (or key slot) encoded in the low seven bits of an id.
#[must_use]
pub const fn page_slot(id: u64) -> u64 {
    id & 0x7F
}

/// Id of the cluster expected after `id`.
#[must_use]
pub const fn successor_id(id: u64, end_of_cluster: bool) -> u64 {
    if end_of_cluster {
        make_cluster_id_from_num(make_cluster_num_from_id(id) + 1)
    } else {
        id.wrapping_add(1)
    }
}

/// What a payload region holds after decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    /// Pre-send key bundle.
    PreSend,
    /// Key-only package.
    Key,
    /// IV-only package.
    Iv,
    /// Ciphered data package.
    CrData,
    /// Tail of a package started in an earlier cluster.
    Continuation,
    /// Unused bytes closing an image cluster.
    Filler,
}

impl MarkerKind {
    const fn from_aes(kind: AesKind) -> Self {
        match kind {
            AesKind::PreSend => Self::PreSend,
            AesKind::Key => Self::Key,
            AesKind::Iv => Self::Iv,
            AesKind::CrData | AesKind::DcData => Self::CrData,
        }
    }

    /// The AES variant a region of this kind holds.
    #[must_use]
    pub const fn aes_kind(self) -> Option<AesKind> {
        match self {
            Self::PreSend => Some(AesKind::PreSend),
            Self::Key => Some(AesKind::Key),
            Self::Iv => Some(AesKind::Iv),
            Self::CrData => Some(AesKind::CrData),
            Self::Continuation | Self::Filler => None,
        }
    }
}

/// A region of a decoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    /// Payload range of the region.
    pub range: Range<usize>,
    /// Region content.
    pub kind: MarkerKind,
    /// False when the package runs past the end of this cluster.
    pub complete: bool,
}

/// Session context needed to classify a decoded payload.
#[derive(Debug, Clone, Copy)]
pub struct DecodeContext {
    /// Incoming magic word.
    pub magic: MagicWord,
    /// Window for key package ids.
    pub limits: SequenceLimits,
    /// Bytes still owed to a package begun in the previous cluster.
    pub carried: usize,
}

/// An OTP cluster owning its wire buffer.
///
/// Layout: `id(8) | chunk(2) | used_len(4) | payload`.
#[derive(Clone, PartialEq, Eq)]
pub struct Cluster {
    buf: Vec<u8>,
    max_data_len: usize,
    send_method: SendMethod,
    encoded: bool,
    markers: Vec<Marker>,
    owed: usize,
}

impl Cluster {
    /// Empty cluster with the given id.
    #[must_use]
    pub fn new(id: u64) -> Self {
        let mut cluster = Self {
            buf: vec![0; OTP_HEADER_LEN],
            max_data_len: CLUSTER_DATALEN,
            send_method: SendMethod::default(),
            encoded: false,
            markers: Vec::new(),
            owed: 0,
        };
        cluster.set_id(id);
        cluster
    }

    /// Validates `buf` as an encoded wire cluster and takes ownership.
    pub fn cast(buf: Vec<u8>) -> Result<Self, FramingError> {
        let size = buf.len();
        if size == 0 {
            return Err(FramingError::ZeroLength);
        }
        if size <= OTP_HEADER_LEN {
            return Err(FramingError::TooShort {
                len: size,
                min: OTP_HEADER_LEN,
            });
        }
        if size > MAX_OTPCLUSTER_SIZE {
            return Err(FramingError::TooLong {
                len: size,
                max: MAX_OTPCLUSTER_SIZE,
            });
        }
        let declared = get_u32(&buf, OTP_USEDLEN_OFFSET)? as usize;
        if declared != size - OTP_HEADER_LEN {
            return Err(FramingError::LengthMismatch {
                declared,
                actual: size - OTP_HEADER_LEN,
            });
        }
        validate_chunk_field(get_u16(&buf, OTP_CHUNKID_OFFSET)?)?;
        Ok(Self {
            buf,
            max_data_len: CLUSTER_DATALEN,
            send_method: SendMethod::default(),
            encoded: true,
            markers: Vec::new(),
            owed: 0,
        })
    }

    /// Slices a standalone buffer into whole-image-cluster pages.
    ///
    /// Every page occupies its own image cluster and is flagged `EndOfCluster`.
    pub fn from_raw_otp(bytes: &[u8]) -> Result<Vec<Self>, FramingError> {
        if bytes.is_empty() {
            return Err(FramingError::ZeroLength);
        }
        Ok(bytes
            .chunks(CLUSTER_DATALEN)
            .map(|chunk| {
                let mut page = Self::new(UNASSIGNED_CLUSTER_ID);
                page.set_data(chunk);
                page.set_end_of_cluster(true);
                page
            })
            .collect())
    }

    /// Slices an AES package that starts at `offset` of the current image cluster.
    ///
    /// Pages reaching the image cluster boundary are flagged `EndOfCluster`;
    /// the trailing short page stays open. Multi-page packages get chain flags
    /// and chunk indices.
    pub fn from_raw_aes(bytes: &[u8], offset: usize) -> Result<Vec<Self>, FramingError> {
        if bytes.is_empty() {
            return Err(FramingError::ZeroLength);
        }
        if bytes.len() > MAX_AESPACKAGE_SIZE {
            return Err(FramingError::TooLong {
                len: bytes.len(),
                max: MAX_AESPACKAGE_SIZE,
            });
        }
        let mut pages = Vec::new();
        let mut room = CLUSTER_DATALEN - offset % CLUSTER_DATALEN;
        let mut rest = bytes;
        while !rest.is_empty() {
            let n = room.min(rest.len());
            let mut page = Self::new(UNASSIGNED_CLUSTER_ID);
            page.set_data(&rest[..n]);
            page.set_end_of_cluster(n == room);
            pages.push(page);
            rest = &rest[n..];
            room = CLUSTER_DATALEN;
        }

        let count = pages.len();
        if count > 1 {
            for (index, page) in pages.iter_mut().enumerate() {
                if index > 0 {
                    let chunk = u16::try_from(index).map_err(|_| FramingError::InvalidChunk(INVALID_CHUNK))?;
                    page.set_chunk_id(chunk, true)?;
                }
                page.set_chain_head(index + 1 < count);
            }
        }
        Ok(pages)
    }

    /// Cluster id.
    #[must_use]
    pub fn id(&self) -> u64 {
        get_u64(&self.buf, 0).unwrap_or_default()
    }

    /// Rewrites the cluster id.
    pub fn set_id(&mut self, id: u64) {
        self.buf[..8].copy_from_slice(&id.to_le_bytes());
    }

    /// Raw chunk field.
    #[must_use]
    pub fn chunk_field(&self) -> u16 {
        get_u16(&self.buf, OTP_CHUNKID_OFFSET).unwrap_or(INVALID_CHUNK)
    }

    fn set_chunk_field(&mut self, value: u16) {
        self.buf[OTP_CHUNKID_OFFSET..OTP_USEDLEN_OFFSET].copy_from_slice(&value.to_le_bytes());
    }

    /// Chunk index of the continuation region.
    #[must_use]
    pub fn chunk_id(&self) -> u16 {
        self.chunk_field() & CHUNK_INDEX_MASK
    }

    /// Sets the chunk index and marks the cluster as chain end or chain start.
    ///
    /// `EndOfCluster` is preserved.
    pub fn set_chunk_id(&mut self, chunk_id: u16, end_of_chunk: bool) -> Result<(), FramingError> {
        if chunk_id > MAX_CHUNK_INDEX {
            return Err(FramingError::InvalidChunk(chunk_id));
        }
        let flag = if end_of_chunk { END_OF_CHAIN } else { BEG_OF_CHAIN };
        let keep = self.chunk_field() & END_OF_CLUSTER;
        self.set_chunk_field(chunk_id | flag | keep);
        Ok(())
    }

    /// Sets or clears the flag telling that the last region continues in the next cluster.
    pub fn set_chain_head(&mut self, open: bool) {
        let field = self.chunk_field();
        self.set_chunk_field(if open {
            field | BEG_OF_CHAIN
        } else {
            field & !BEG_OF_CHAIN
        });
    }

    /// Clears chain flags and chunk index, keeping `EndOfCluster`.
    pub fn reset_chunk_state(&mut self) {
        let keep = self.chunk_field() & END_OF_CLUSTER;
        self.set_chunk_field(keep);
    }

    /// True when the last region is a package head continued in the next cluster.
    pub fn is_start_chunk(&self) -> Result<bool, FramingError> {
        let field = validate_chunk_field(self.chunk_field())?;
        Ok(field & BEG_OF_CHAIN != 0)
    }

    /// True when the first region finishes or continues an earlier package.
    pub fn is_finish_chunk(&self) -> Result<bool, FramingError> {
        let field = validate_chunk_field(self.chunk_field())?;
        Ok(field & END_OF_CHAIN != 0)
    }

    /// True when this page closes its image cluster.
    #[must_use]
    pub fn is_end_of_cluster(&self) -> bool {
        self.chunk_field() & END_OF_CLUSTER != 0
    }

    /// Sets or clears `EndOfCluster`.
    pub fn set_end_of_cluster(&mut self, end: bool) {
        let field = self.chunk_field();
        self.set_chunk_field(if end {
            field | END_OF_CLUSTER
        } else {
            field & !END_OF_CLUSTER
        });
    }

    /// Channel hint.
    #[must_use]
    pub const fn send_method(&self) -> SendMethod {
        self.send_method
    }

    /// Sets the channel hint.
    pub const fn set_send_method(&mut self, method: SendMethod) {
        self.send_method = method;
    }

    /// True while the payload is combined with the pad.
    #[must_use]
    pub const fn is_encoded(&self) -> bool {
        self.encoded
    }

    /// Regions found by the last [`Cluster::decode`].
    #[must_use]
    pub fn markers(&self) -> &[Marker] {
        &self.markers
    }

    /// Bytes of the last package still expected from following clusters.
    #[must_use]
    pub const fn owed_bytes(&self) -> usize {
        self.owed
    }

    /// Maximum payload length.
    #[must_use]
    pub const fn max_data_len(&self) -> usize {
        self.max_data_len
    }

    /// Room left for payload.
    #[must_use]
    pub fn free_space(&self) -> usize {
        self.max_data_len - self.data_len()
    }

    /// Replaces the payload, clamped to the maximum length. Returns bytes taken.
    pub fn set_data(&mut self, data: &[u8]) -> usize {
        self.buf.truncate(OTP_HEADER_LEN);
        self.add_data(data)
    }

    /// Appends to the payload, clamped to the maximum length. Returns bytes taken.
    pub fn add_data(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.free_space());
        self.buf.extend_from_slice(&data[..n]);
        self.sync_used_len();
        n
    }

    fn sync_used_len(&mut self) {
        // Payload never exceeds MAX_AESPACKAGE_SIZE, so the length fits a u32.
        let used = (self.buf.len() - OTP_HEADER_LEN) as u32;
        self.buf[OTP_USEDLEN_OFFSET..OTP_HEADER_LEN].copy_from_slice(&used.to_le_bytes());
    }

    fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buf[OTP_HEADER_LEN..]
    }

    /// Combines the payload with `pad` starting at `offset` inside the image cluster.
    pub fn encode(&mut self, pad: &[u8], offset: usize) -> Result<(), FramingError> {
        let pad = pad.get(offset..).ok_or(FramingError::TooShort {
            len: pad.len(),
            min: offset,
        })?;
        xor_in_place(self.payload_mut(), pad)?;
        self.encoded = true;
        Ok(())
    }

    /// Removes the pad and records the payload regions.
    ///
    /// Fails when chunk flags disagree with the regions found, when a region
    /// cannot be classified, or when a key package id lies outside
    /// `ctx.limits`.
    pub fn decode(
        &mut self,
        pad: &[u8],
        offset: usize,
        ctx: &DecodeContext,
    ) -> Result<(), FramingError> {
        let pad_rest = pad.get(offset..).ok_or(FramingError::TooShort {
            len: pad.len(),
            min: offset,
        })?;
        xor_in_place(self.payload_mut(), pad_rest)?;
        self.encoded = false;

        let field = validate_chunk_field(self.chunk_field())?;
        let closes_image = self.is_end_of_cluster() && offset + self.data_len() == CLUSTER_DATALEN;
        let payload = self.data();
        let len = payload.len();
        let mut markers = Vec::new();
        let mut owed = 0;
        let mut pos = 0;

        if ctx.carried > 0 {
            if field & END_OF_CHAIN == 0 {
                return Err(FramingError::InvalidChunk(field));
            }
            let n = ctx.carried.min(len);
            markers.push(Marker {
                range: 0..n,
                kind: MarkerKind::Continuation,
                complete: n == ctx.carried,
            });
            owed = ctx.carried - n;
            pos = n;
        } else if field & END_OF_CHAIN != 0 {
            return Err(FramingError::InvalidChunk(field));
        }

        while pos < len {
            if len - pos < AES_CR_HEADER_LEN {
                if closes_image {
                    markers.push(Marker {
                        range: pos..len,
                        kind: MarkerKind::Filler,
                        complete: true,
                    });
                    break;
                }
                return Err(FramingError::Garbled("truncated package head"));
            }
            let head = get_u64(payload, pos)?;
            let (kind, total) = match ctx.magic.classify(head) {
                Some(kind) => (kind, key_package_len(kind)),
                None => {
                    let declared = get_u32(payload, pos + AES_DATALEN_OFFSET)? as usize;
                    let total = AES_CR_HEADER_LEN + aligned_data_len(declared);
                    if declared == 0 || total > MAX_AESPACKAGE_SIZE {
                        return Err(FramingError::Garbled("implausible data length"));
                    }
                    (AesKind::CrData, total)
                }
            };
            let end = pos + total;
            if end <= len {
                if kind.is_key_material() {
                    let id = get_u64(payload, end - 8)?;
                    if !ctx.limits.admits(id) {
                        return Err(FramingError::SequenceOutOfRange(id));
                    }
                }
                markers.push(Marker {
                    range: pos..end,
                    kind: MarkerKind::from_aes(kind),
                    complete: true,
                });
                pos = end;
            } else {
                markers.push(Marker {
                    range: pos..len,
                    kind: MarkerKind::from_aes(kind),
                    complete: false,
                });
                owed = end - len;
                pos = len;
            }
        }

        if (owed > 0) != (field & BEG_OF_CHAIN != 0) {
            return Err(FramingError::InvalidChunk(field));
        }
        self.markers = markers;
        self.owed = owed;
        Ok(())
    }

    /// Appends the payload of a later page carrying the same id.
    ///
    /// Used when consecutive writes land in the same network page. Chain
    /// state is combined: the continuation of `self` is kept, the open head
    /// of `other` is taken over.
    pub fn merge(&mut self, other: Self) -> Result<(), Error> {
        if other.id() != self.id() {
            return Err(Error::DataIntegrity(format!(
                "cannot merge cluster {:#x} into {:#x}",
                other.id(),
                self.id()
            )));
        }
        if other.data_len() > self.free_space() {
            return Err(Error::DataIntegrity(format!(
                "merged cluster {:#x} would exceed {} bytes",
                self.id(),
                self.max_data_len
            )));
        }
        let mine = self.chunk_field();
        let theirs = other.chunk_field();
        if self.data_len() > 0 && (mine & BEG_OF_CHAIN != 0 || theirs & END_OF_CHAIN != 0) {
            return Err(Error::DataIntegrity(format!(
                "merge into cluster {:#x} would split a chain",
                self.id()
            )));
        }
        let field = if self.data_len() == 0 {
            theirs | (mine & END_OF_CLUSTER)
        } else {
            (mine & !BEG_OF_CHAIN) | (theirs & (BEG_OF_CHAIN | END_OF_CLUSTER))
        };
        let shift = self.data_len();
        self.markers.extend(other.markers.iter().map(|m| Marker {
            range: m.range.start + shift..m.range.end + shift,
            ..m.clone()
        }));
        self.owed = other.owed;
        self.buf.extend_from_slice(other.data());
        self.sync_used_len();
        self.set_chunk_field(field);
        Ok(())
    }

    /// Starts a reassembly accumulator from the open package head at the end of this cluster.
    ///
    /// A cluster without markers is taken as one head from end to end.
    pub fn start_chain(&self) -> Result<Self, Error> {
        let (range, kind) = match self.markers.last() {
            None => (0..self.data_len(), MarkerKind::CrData),
            Some(m) if !m.complete && m.kind != MarkerKind::Continuation => (m.range.clone(), m.kind),
            Some(_) => {
                return Err(Error::DataIntegrity(format!(
                    "cluster {:#x} does not end with an open package head",
                    self.id()
                )));
            }
        };
        let mut acc = Self::new(self.id());
        acc.max_data_len = MAX_AESPACKAGE_SIZE;
        acc.add_data(&self.data()[range]);
        acc.set_chunk_field(BEG_OF_CHAIN | (self.chunk_field() & END_OF_CLUSTER));
        acc.markers = vec![Marker {
            range: 0..acc.data_len(),
            kind,
            complete: false,
        }];
        Ok(acc)
    }

    /// Appends the continuation region of `other` to this chain accumulator.
    ///
    /// `other` must carry `EndOfChain`, the next chunk index, and the id
    /// that follows the last cluster added.
    pub fn add_cluster(&mut self, other: &Self) -> Result<(), Error> {
        if !other.is_finish_chunk()? {
            return Err(Error::DataIntegrity(format!(
                "cluster {:#x} does not continue a chain",
                other.id()
            )));
        }
        let index = self.chunk_id() + 1;
        if other.chunk_id() != index {
            return Err(Error::DataIntegrity(format!(
                "chunk index {} where {index} was expected",
                other.chunk_id()
            )));
        }
        let expected = successor_id(self.id(), self.is_end_of_cluster());
        if other.id() != expected {
            return Err(Error::DataIntegrity(format!(
                "chain jumps from {:#x} to {:#x}",
                self.id(),
                other.id()
            )));
        }
        let (range, complete) = match other.markers.first() {
            None => (0..other.data_len(), !other.is_start_chunk()?),
            Some(m) if m.kind == MarkerKind::Continuation => (m.range.clone(), m.complete),
            Some(_) => {
                return Err(Error::DataIntegrity(format!(
                    "cluster {:#x} starts without a continuation region",
                    other.id()
                )));
            }
        };
        if range.len() > self.free_space() {
            return Err(Error::DataIntegrity(format!(
                "chain exceeds {} bytes",
                self.max_data_len
            )));
        }
        self.add_data(&other.data()[range]);
        self.set_id(other.id());
        self.set_chunk_id(index, true)?;
        self.set_chain_head(!complete);
        self.set_end_of_cluster(other.is_end_of_cluster());
        let len = self.data_len();
        if let Some(head) = self.markers.first_mut() {
            head.range.end = len;
            head.complete = complete;
        }
        Ok(())
    }

    /// True once an accumulator holds a whole package.
    #[must_use]
    pub fn is_chain_complete(&self) -> bool {
        self.markers.first().is_some_and(|m| m.complete)
    }

    /// Consumes the cluster and returns its wire buffer.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

fn validate_chunk_field(field: u16) -> Result<u16, FramingError> {
    if field == INVALID_CHUNK || field & CHUNK_INDEX_MASK > MAX_CHUNK_INDEX {
        return Err(FramingError::InvalidChunk(field));
    }
    Ok(field)
}

impl Framed for Cluster {
    fn package_type(&self) -> PackageType {
        PackageType::OTP
            .with_encoded(self.encoded)
            .with_fragment(self.chunk_field() & CHAIN_FLAGS != 0)
    }

    fn id(&self) -> u64 {
        Self::id(self)
    }

    fn header_len(&self) -> usize {
        OTP_HEADER_LEN
    }

    fn data_len(&self) -> usize {
        self.buf.len() - OTP_HEADER_LEN
    }

    fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("id", &format_args!("{:#x}", self.id()))
            .field("ordinal", &make_cluster_num_from_id(self.id()))
            .field("slot", &page_slot(self.id()))
            .field("chunk", &format_args!("{:#06x}", self.chunk_field()))
            .field("data_len", &self.data_len())
            .field("send_method", &self.send_method)
            .finish_non_exhaustive()
    }
}
