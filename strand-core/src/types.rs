// vim: tw=80
//! Common type definitions used throughout strand

use divbuf::{DivBuf, DivBufMut};
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use std::{
    cmp::Ordering,
    fmt::{self, Display, Formatter},
};

/// Our `IoVec`.  Unlike the standard library's, ours is reference-counted so
/// it can have more than one owner, which mirror writes require.
pub type IoVec = DivBuf;

/// Mutable version of `IoVec`.  Uniquely owned.
pub type IoVecMut = DivBufMut;

/// A byte length that never ends.  The protocol encodes "to end of file" as
/// all-ones.
pub const LENGTH_EOF: u64 = u64::MAX;

/// An error reported by a single storage server during layout-based I/O.
///
/// The ordering reflects severity.  When a multi-device operation collects
/// errors from several devices, only the most severe is surfaced, so a
/// resource shortage never masks a hard I/O failure.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Error, Ord, PartialEq,
         PartialOrd, Serialize)]
pub enum DeviceError {
    /// Transient resource exhaustion on the client or device
    #[error("out of resources")]
    Resource,
    /// The device rejected our credential
    #[error("permission denied")]
    AccessDenied,
    /// The device could not be reached
    #[error("device unreachable")]
    Unreachable,
    /// The addressed object does not exist on the device
    #[error("object not found")]
    NotFound,
    /// The device is out of space
    #[error("no space left on device")]
    NoSpace,
    /// Generic I/O failure
    #[error("I/O error")]
    Io,
}

/// strand's error type
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum Error {
    /// A storage server failed; carries the worst per-device severity
    #[error(transparent)]
    Device(#[from] DeviceError),
    /// Malformed or semantically invalid layout reply from the server
    #[error("invalid layout")]
    Invalid,
    /// No layout driver is configured for this file class
    #[error("no layout driver")]
    NoDriver,
    /// The device identifier could not be resolved
    #[error("unknown device identifier")]
    NoDevice,
    /// The server cannot grant a layout right now; retry later
    #[error("layout try later")]
    TryLater,
    /// The metadata server rejected the operation
    #[error("metadata server error")]
    ServerFault,
    /// The layout stateid is stale with respect to the recall barrier
    #[error("stale layout stateid")]
    Stale,
    /// The layout cannot place this I/O; no byte of it was issued, so the
    /// caller may still route it through the metadata server
    #[error("i/o not attempted through the layout")]
    NotAttempted,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Identifies one file (or metadata object) on the mount
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq,
         PartialOrd, Serialize)]
pub struct FileId(pub u64);

impl Display for FileId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Distinguishes the primary data layout from the independent
/// metadata/replication layout that may coexist on the same file.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum FileClass {
    Data,
    Meta,
}

/// Opaque identifier naming one storage backend, assigned by the metadata
/// server.  Resolved at most once per session through the device cache.
#[derive(Clone, Copy, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct DeviceId(pub [u8; 16]);

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "DeviceId(")?;
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}

/// A monotonically-sequenced token proving the client's current layout grant
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Stateid {
    /// Sequence number.  Compared with wraparound-safe arithmetic.
    pub seq: u32,
    /// The remainder of the token, opaque to the client
    pub other: [u8; 12],
}

impl Stateid {
    pub const fn new(seq: u32, other: [u8; 12]) -> Self {
        Stateid { seq, other }
    }

    /// Is `self` strictly newer than `oldseq`, accounting for wraparound?
    pub fn newer_than(&self, oldseq: u32) -> bool {
        (self.seq.wrapping_sub(oldseq) as i32) > 0
    }
}

/// Access mode of a layout range or query
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum IoMode {
    Read,
    Rw,
    /// Wildcard, used by queries and invalidation filters only; a granted
    /// segment is always `Read` or `Rw`.
    Any,
}

impl IoMode {
    /// iomode matching rules for lookup:
    ///
    /// | query | segment | match |
    /// |-------|---------|-------|
    /// | ANY   | READ    | true  |
    /// | ANY   | RW      | true  |
    /// | RW    | READ    | false |
    /// | RW    | RW      | true  |
    /// | READ  | READ    | true  |
    /// | READ  | RW      | true  |
    pub fn matches(self, segment: IoMode) -> bool {
        self != IoMode::Rw || segment == IoMode::Rw
    }

    /// Invalidation filter rule: `Any` hits every segment, otherwise the
    /// modes must be equal.
    pub fn filter(self, segment: IoMode) -> bool {
        self == IoMode::Any || self == segment
    }
}

/// A byte range within a file.  `length == LENGTH_EOF` means "to infinity".
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct LayoutRange {
    pub offset: u64,
    pub length: u64,
}

impl LayoutRange {
    pub const fn new(offset: u64, length: u64) -> Self {
        LayoutRange { offset, length }
    }

    /// The whole file
    pub const fn all() -> Self {
        LayoutRange { offset: 0, length: LENGTH_EOF }
    }

    /// One byte past the end of the range, saturating at infinity
    pub fn end(&self) -> u64 {
        crate::util::end_offset(self.offset, self.length)
    }

    /// Do the two half-open ranges share at least one byte?
    pub fn intersects(&self, other: &LayoutRange) -> bool {
        let end1 = self.end();
        let end2 = other.end();
        (end1 == LENGTH_EOF || end1 > other.offset) &&
            (end2 == LENGTH_EOF || end2 > self.offset)
    }

    /// Is `other` fully contained within `self`?
    pub fn contains(&self, other: &LayoutRange) -> bool {
        self.offset <= other.offset && self.end() >= other.end()
    }

    /// Does `self` contain the single byte at `offset`?
    pub fn contains_byte(&self, offset: u64) -> bool {
        self.contains(&LayoutRange::new(offset, 1))
    }
}

/// Sort key for the segment collection: higher offset first, then longer
/// length, then read-write before read-only.  `Greater` sorts earlier.
///
/// Lookup relies on this order to stop scanning at the first entry whose key
/// is below the query.
pub fn cmp_layout(l1: &(LayoutRange, IoMode), l2: &(LayoutRange, IoMode))
    -> Ordering
{
    fn rank(mode: IoMode) -> u8 {
        // read-write sorts before read at equal range
        match mode {
            IoMode::Rw => 2,
            IoMode::Read => 1,
            IoMode::Any => 0,
        }
    }
    l1.0.offset.cmp(&l2.0.offset)
        .then(l1.0.length.cmp(&l2.0.length))
        .then(rank(l1.1).cmp(&rank(l2.1)))
}

/// Credential captured at write time and spent by the next LAYOUTCOMMIT
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Credential(pub String);

/// Per-mount configuration consumed at layout acquisition time
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MountConfig {
    /// Is layout-based I/O enabled for this mount at all?
    pub layout_enabled: bool,
    /// Largest layout body we are willing to accept from the server
    pub max_layout_size: u64,
    /// Smallest layout the server may usefully grant; requests are clamped
    /// up to this unless the request itself is shorter.
    pub min_layout_length: u64,
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            layout_enabled: true,
            max_layout_size: 8 * 1024 * 1024,
            min_layout_length: crate::util::BYTES_PER_PAGE as u64,
        }
    }
}

// LCOV_EXCL_STOP
