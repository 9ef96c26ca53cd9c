// vim: tw=80
//! Placement engine
//!
//! Pure translation from a logical file interval to per-device sub-requests,
//! parameterized by the geometry decoded from a layout segment.  Three
//! geometry variants exist, one per layout driver.

use enum_dispatch::enum_dispatch;

// enum_dispatch expands the payload enum's trait impl at the trait's site,
// so the variant types must be nameable here.
use crate::segment::{BlockPayload, FilePayload, LayoutPayload, ObjectPayload};
use crate::types::Result;

pub mod block_extent;
pub mod file_layout;
pub mod object_raid;

/// Is the caller going to read or write the placed range?
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PlaceMode {
    Read,
    Write,
}

/// What should the I/O layer do with a sub-request?
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubKind {
    /// Transfer bytes to/from the targeted device(s)
    Io,
    /// Fill the caller's buffer with zeros locally; no device involved.
    /// Produced for reads of holes and uninitialized extents.
    Zero,
}

/// One device-level piece of a placed I/O request.
///
/// Sub-requests are produced in ascending file-offset order with contiguous
/// coverage, so the caller can carve its buffer sequentially by `length`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SubRequest {
    /// Target device indices within the segment's device table.  More than
    /// one entry only for mirrored writes, which must reach every target.
    /// Empty for `SubKind::Zero`.
    pub devices: Vec<u32>,
    /// File handle index, used by the file-striping driver only
    pub fh: u32,
    /// Byte offset on the device (or within the per-device object)
    pub dev_offset: u64,
    pub length: u64,
    pub kind: SubKind,
}

impl SubRequest {
    pub fn io(device: u32, fh: u32, dev_offset: u64, length: u64) -> Self {
        SubRequest {
            devices: vec![device],
            fh,
            dev_offset,
            length,
            kind: SubKind::Io,
        }
    }

    pub fn zero(length: u64) -> Self {
        SubRequest {
            devices: Vec::new(),
            fh: 0,
            dev_offset: 0,
            length,
            kind: SubKind::Zero,
        }
    }
}

/// Placement interface implemented by every segment payload kind.
#[enum_dispatch]
pub trait Placement {
    /// Split `[offset, offset + length)` into device-level sub-requests, in
    /// file-offset order with contiguous coverage.
    fn place(&self, mode: PlaceMode, offset: u64, length: u64)
        -> Result<Vec<SubRequest>>;

    /// How many entries are in this payload's device table?
    fn device_count(&self) -> u32;
}

// LCOV_EXCL_START
#[cfg(test)]
/// Assert that `subs` covers exactly `length` bytes with no gaps or overlaps.
pub(crate) fn assert_contiguous(subs: &[SubRequest], length: u64) {
    let total: u64 = subs.iter().map(|s| s.length).sum();
    assert_eq!(total, length);
    assert!(subs.iter().all(|s| s.length > 0));
}
// LCOV_EXCL_STOP
