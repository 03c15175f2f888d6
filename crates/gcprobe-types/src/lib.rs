//! # gcprobe-types: Core types for `gcprobe`
//!
//! This crate contains the value types shared across the harness:
//! - Temporal types ([`Timestamp`])
//! - Key space identifiers ([`TableId`], [`RowHandle`])
//! - Encoded keys and the row-key codec ([`Key`])
//! - Lock records ([`Lock`])
//! - Region routing ([`RegionId`], [`RegionLocation`])

use std::fmt::{Debug, Display};

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

// ============================================================================
// Timestamps
// ============================================================================

/// Number of low bits holding the logical component of a [`Timestamp`].
pub const LOGICAL_BITS: u32 = 18;

const LOGICAL_MASK: u64 = (1 << LOGICAL_BITS) - 1;

/// A hybrid logical timestamp issued by the timestamp oracle.
///
/// **Bit Layout**:
/// - Upper 46 bits: physical time in milliseconds
/// - Lower 18 bits: logical counter within the millisecond
///
/// The zero timestamp never names a real transaction. The timestamp source
/// returns it to signal that the oracle is gone for good.
///
/// # Examples
///
/// ```
/// # use gcprobe_types::Timestamp;
/// let ts = Timestamp::compose(1_700_000_000_000, 7);
/// assert_eq!(ts.physical(), 1_700_000_000_000);
/// assert_eq!(ts.logical(), 7);
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Composes a timestamp from its physical (ms) and logical parts.
    pub fn compose(physical_ms: u64, logical: u64) -> Self {
        Self((physical_ms << LOGICAL_BITS) | (logical & LOGICAL_MASK))
    }

    pub fn physical(self) -> u64 {
        self.0 >> LOGICAL_BITS
    }

    pub fn logical(self) -> u64 {
        self.0 & LOGICAL_MASK
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Timestamp> for u64 {
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

// ============================================================================
// Key Space Identifiers
// ============================================================================

/// Identifier of a key-space partition (a table), resolved once at setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableId(i64);

impl TableId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }
}

impl Display for TableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for TableId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<TableId> for i64 {
    fn from(id: TableId) -> Self {
        id.0
    }
}

/// Row offset within a table.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct RowHandle(i64);

impl RowHandle {
    pub fn new(handle: i64) -> Self {
        Self(handle)
    }

    /// Returns the handle `n` rows after this one.
    pub fn offset(self, n: i64) -> Self {
        Self(self.0 + n)
    }
}

impl Display for RowHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for RowHandle {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<RowHandle> for i64 {
    fn from(handle: RowHandle) -> Self {
        handle.0
    }
}

// ============================================================================
// Keys
// ============================================================================

const TABLE_PREFIX: u8 = b't';
const RECORD_SEP: &[u8] = b"_r";
const SIGN_MASK: u64 = 0x8000_0000_0000_0000;
const ENC_INT_LEN: usize = 8;

/// Row key length: prefix byte, table id, separator, handle.
const ROW_KEY_LEN: usize = 1 + ENC_INT_LEN + RECORD_SEP.len() + ENC_INT_LEN;

/// An encoded key in the store's ordered key space.
///
/// Row keys are laid out as `t{table}_r{handle}` with both integers encoded
/// memcomparably (big-endian, sign bit flipped) so byte order matches
/// numeric order. The empty key is both the smallest key and, as a region
/// end bound, "unbounded".
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Key(Bytes);

impl Key {
    /// The empty key.
    pub fn empty() -> Self {
        Self(Bytes::new())
    }

    pub fn from_static(bytes: &'static [u8]) -> Self {
        Self(Bytes::from_static(bytes))
    }

    /// Encodes the row key for `handle` in `table`.
    ///
    /// # Examples
    ///
    /// ```
    /// # use gcprobe_types::{Key, RowHandle, TableId};
    /// let key = Key::row(TableId::new(42), RowHandle::new(7));
    /// assert_eq!(key.decode_row(), Some((TableId::new(42), RowHandle::new(7))));
    /// ```
    pub fn row(table: TableId, handle: RowHandle) -> Self {
        let mut buf = BytesMut::with_capacity(ROW_KEY_LEN);
        buf.put_u8(TABLE_PREFIX);
        buf.put_u64(encode_int(table.0));
        buf.put_slice(RECORD_SEP);
        buf.put_u64(encode_int(handle.0));
        Self(buf.freeze())
    }

    /// Encodes the prefix shared by every key of `table`.
    pub fn table_prefix(table: TableId) -> Self {
        let mut buf = BytesMut::with_capacity(1 + ENC_INT_LEN);
        buf.put_u8(TABLE_PREFIX);
        buf.put_u64(encode_int(table.0));
        Self(buf.freeze())
    }

    /// Decodes a row key produced by [`Key::row`].
    pub fn decode_row(&self) -> Option<(TableId, RowHandle)> {
        let b = self.0.as_ref();
        if b.len() != ROW_KEY_LEN || b[0] != TABLE_PREFIX || &b[9..11] != RECORD_SEP {
            return None;
        }
        let table = decode_int(&b[1..9])?;
        let handle = decode_int(&b[11..19])?;
        Some((TableId(table), RowHandle(handle)))
    }

    /// Returns the smallest key strictly greater than this one.
    pub fn next_key(&self) -> Self {
        let mut buf = BytesMut::with_capacity(self.0.len() + 1);
        buf.put_slice(&self.0);
        buf.put_u8(0);
        Self(buf.freeze())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

fn encode_int(v: i64) -> u64 {
    (v as u64) ^ SIGN_MASK
}

fn decode_int(b: &[u8]) -> Option<i64> {
    let raw: [u8; ENC_INT_LEN] = b.try_into().ok()?;
    Some((u64::from_be_bytes(raw) ^ SIGN_MASK) as i64)
}

impl Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Key(\"{}\")", self.0.escape_ascii())
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.escape_ascii())
    }
}

impl From<Vec<u8>> for Key {
    fn from(value: Vec<u8>) -> Self {
        Self(Bytes::from(value))
    }
}

impl From<Bytes> for Key {
    fn from(value: Bytes) -> Self {
        Self(value)
    }
}

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// ============================================================================
// Locks
// ============================================================================

/// An outstanding transactional lock: a key held by the transaction that
/// started at `ts`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Lock {
    /// Locked key.
    pub key: Key,
    /// Primary key of the owning transaction.
    pub primary: Key,
    /// Start timestamp of the owning transaction.
    pub ts: Timestamp,
    /// Lock time-to-live in milliseconds.
    pub ttl_ms: u64,
}

impl Display for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lock(key={}, ts={})", self.key, self.ts)
    }
}

// ============================================================================
// Regions
// ============================================================================

/// Identifier of a region (a contiguous key range served by one replica group).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct RegionId(u64);

impl RegionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl Display for RegionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for RegionId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<RegionId> for u64 {
    fn from(id: RegionId) -> Self {
        id.0
    }
}

/// Result of locating a key: the region and its `[start_key, end_key)` range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionLocation {
    pub id: RegionId,
    pub start_key: Key,
    /// Exclusive end; empty means the region extends to the end of the key space.
    pub end_key: Key,
}

impl RegionLocation {
    /// Returns true if `key` falls inside this region.
    pub fn contains(&self, key: &Key) -> bool {
        *key >= self.start_key && (self.end_key.is_empty() || *key < self.end_key)
    }
}

impl Display for RegionLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "region {} [\"{}\", \"{}\")",
            self.id, self.start_key, self.end_key
        )
    }
}
