//! Segment records delivered to observers
//!
//! A segment is one erasure-coded part of an object. The stream id is the
//! parent key: all segments of one object share it, and partitioning never
//! separates them. Everything else is payload the loop passes through
//! untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::rangeloop::error::{LoopError, LoopResult};

/// Length of a row key: stream id followed by the encoded position.
pub const ROW_KEY_LEN: usize = 16 + 8;

/// Length of one encoded alias piece entry.
const ALIAS_PIECE_LEN: usize = 6;

/// 32-byte storage node identity
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub [u8; 32]);

/// 32-byte root piece identity of a segment
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PieceId(pub [u8; 32]);

macro_rules! impl_id_bytes {
    ($name:ident) => {
        impl $name {
            /// Build the id from a byte slice, which must be exactly 32 bytes long
            pub fn from_bytes(bytes: &[u8]) -> LoopResult<Self> {
                let array: [u8; 32] = bytes.try_into().map_err(|_| {
                    LoopError::malformed(format!(
                        "{} must be 32 bytes, got {}",
                        stringify!($name),
                        bytes.len()
                    ))
                })?;
                Ok(Self(array))
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for byte in &self.0 {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }
    };
}

impl_id_bytes!(NodeId);
impl_id_bytes!(PieceId);

/// Position of a segment inside its object
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SegmentPosition {
    pub part: u32,
    pub index: u32,
}

impl SegmentPosition {
    pub fn new(part: u32, index: u32) -> Self {
        Self { part, index }
    }

    /// `part` in the high 32 bits, `index` in the low 32 bits
    pub fn encode(&self) -> u64 {
        (u64::from(self.part) << 32) | u64::from(self.index)
    }

    pub fn from_encoded(encoded: u64) -> Self {
        Self {
            part: (encoded >> 32) as u32,
            index: encoded as u32,
        }
    }
}

/// Erasure coding parameters of a segment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedundancyScheme {
    pub algorithm: u8,
    pub share_size: u32,
    pub required_shares: u8,
    pub repair_shares: u8,
    pub optimal_shares: u8,
    pub total_shares: u8,
}

impl RedundancyScheme {
    /// Whether no erasure coding is configured (inline segments)
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    /// Bytes of one stripe: one share from each required piece
    pub fn stripe_size(&self) -> i64 {
        i64::from(self.share_size) * i64::from(self.required_shares)
    }

    /// Size of each stored piece for `data_size` bytes of encrypted data
    pub fn piece_size(&self, data_size: i64) -> i64 {
        let stripe_size = self.stripe_size();
        if stripe_size <= 0 || data_size <= 0 {
            return 0;
        }
        let stripes = (data_size + stripe_size - 1) / stripe_size;
        stripes * i64::from(self.share_size)
    }

    /// Pack into the exported integer form.
    ///
    /// Layout from the most significant byte: algorithm (8 bits), share size
    /// (24 bits), required, repair, optimal and total shares (8 bits each).
    pub fn pack(&self) -> i64 {
        let packed = (u64::from(self.algorithm) << 56)
            | (u64::from(self.share_size & 0x00FF_FFFF) << 32)
            | (u64::from(self.required_shares) << 24)
            | (u64::from(self.repair_shares) << 16)
            | (u64::from(self.optimal_shares) << 8)
            | u64::from(self.total_shares);
        packed as i64
    }

    pub fn unpack(packed: i64) -> Self {
        let packed = packed as u64;
        Self {
            algorithm: (packed >> 56) as u8,
            share_size: ((packed >> 32) & 0x00FF_FFFF) as u32,
            required_shares: (packed >> 24) as u8,
            repair_shares: (packed >> 16) as u8,
            optimal_shares: (packed >> 8) as u8,
            total_shares: packed as u8,
        }
    }
}

/// Piece location as stored: node referenced through its compact alias
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasPiece {
    pub number: u16,
    pub alias: u32,
}

/// Piece location with the resolved node id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Piece {
    pub number: u16,
    pub node: NodeId,
}

/// Encode alias pieces as repeated `number (u16 BE) | alias (u32 BE)` entries
pub fn encode_alias_pieces(pieces: &[AliasPiece]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(pieces.len() * ALIAS_PIECE_LEN);
    for piece in pieces {
        bytes.extend_from_slice(&piece.number.to_be_bytes());
        bytes.extend_from_slice(&piece.alias.to_be_bytes());
    }
    bytes
}

pub fn decode_alias_pieces(bytes: &[u8]) -> LoopResult<Vec<AliasPiece>> {
    if bytes.len() % ALIAS_PIECE_LEN != 0 {
        return Err(LoopError::malformed(format!(
            "alias pieces length {} is not a multiple of {}",
            bytes.len(),
            ALIAS_PIECE_LEN
        )));
    }
    Ok(bytes
        .chunks_exact(ALIAS_PIECE_LEN)
        .map(|chunk| AliasPiece {
            number: u16::from_be_bytes([chunk[0], chunk[1]]),
            alias: u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]),
        })
        .collect())
}

/// Where a segment was read from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SegmentSource {
    #[default]
    Memory,
    RocksDb,
    Avro,
}

/// One row of segment metadata
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Segment {
    pub stream_id: Uuid,
    pub position: SegmentPosition,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub repaired_at: Option<DateTime<Utc>>,
    pub root_piece_id: PieceId,
    pub encrypted_size: i32,
    pub plain_offset: i64,
    pub plain_size: i32,
    pub redundancy: RedundancyScheme,
    pub placement: u16,
    pub alias_pieces: Vec<AliasPiece>,
    pub pieces: Vec<Piece>,
    pub source: SegmentSource,
}

impl Segment {
    /// Inline segments keep their data in the metadata and have no pieces
    pub fn is_inline(&self) -> bool {
        self.redundancy.is_zero() && self.pieces.is_empty() && self.alias_pieces.is_empty()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at < now)
    }

    /// Size of each piece stored on a node
    pub fn piece_size(&self) -> i64 {
        self.redundancy.piece_size(i64::from(self.encrypted_size))
    }

    /// Storage key: stream id followed by the big-endian encoded position
    pub fn row_key(&self) -> [u8; ROW_KEY_LEN] {
        encode_row_key(&self.stream_id, self.position)
    }
}

pub fn encode_row_key(stream_id: &Uuid, position: SegmentPosition) -> [u8; ROW_KEY_LEN] {
    let mut key = [0u8; ROW_KEY_LEN];
    key[..16].copy_from_slice(stream_id.as_bytes());
    key[16..].copy_from_slice(&position.encode().to_be_bytes());
    key
}

pub fn decode_row_key(key: &[u8]) -> LoopResult<(Uuid, SegmentPosition)> {
    if key.len() != ROW_KEY_LEN {
        return Err(LoopError::malformed(format!(
            "row key must be {} bytes, got {}",
            ROW_KEY_LEN,
            key.len()
        )));
    }
    let stream_id = Uuid::from_slice(&key[..16])
        .map_err(|e| LoopError::malformed(format!("invalid stream id: {}", e)))?;
    let mut position = [0u8; 8];
    position.copy_from_slice(&key[16..]);
    Ok((
        stream_id,
        SegmentPosition::from_encoded(u64::from_be_bytes(position)),
    ))
}
