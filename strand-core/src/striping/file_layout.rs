// vim: tw=80
//! Dense and sparse file striping
//!
//! The file driver stripes a file round-robin across a list of data servers
//! in fixed-size stripe units.  Sparse packing addresses each data server
//! with the logical file offset; dense packing compresses out the bytes held
//! by other stripes so each server sees a contiguous address space.

use crate::{
    striping::{PlaceMode, SubRequest},
    types::{Error, LayoutRange, Result},
    util::is_page_aligned,
};

/// How stripe units are addressed on the data servers
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Packing {
    /// Data servers are addressed by logical file offset
    Sparse,
    /// Each data server sees a compressed, contiguous address space
    Dense,
}

/// Striping geometry of one file-driver layout segment.  Immutable after
/// decode.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileGeometry {
    pub stripe_unit: u64,
    pub first_stripe_index: u32,
    pub pattern_offset: u64,
    pub packing: Packing,
    /// Number of data servers in the stripe
    pub stripe_count: u32,
    /// Number of file handles supplied by the server
    pub fh_count: u32,
    /// Route COMMIT through the metadata server instead of the data servers
    pub commit_through_mds: bool,
}

impl FileGeometry {
    /// Semantic validation, applied once after decode.
    pub fn check(&self, range: &LayoutRange) -> Result<()> {
        if self.stripe_unit == 0 || !is_page_aligned(self.stripe_unit) {
            return Err(Error::Invalid);
        }
        if self.pattern_offset > range.offset {
            return Err(Error::Invalid);
        }
        if self.stripe_count == 0 ||
            self.first_stripe_index >= self.stripe_count
        {
            return Err(Error::Invalid);
        }
        let fh_ok = match self.packing {
            Packing::Sparse => {
                self.fh_count == 1 ||
                    self.fh_count == self.stripe_count
            }
            Packing::Dense => self.fh_count == self.stripe_count,
        };
        if !fh_ok {
            return Err(Error::Invalid);
        }
        Ok(())
    }

    /// Which stripe does `offset` fall in?
    pub fn stripe_index(&self, offset: u64) -> u32 {
        let rel = offset - self.pattern_offset;
        ((rel / self.stripe_unit + u64::from(self.first_stripe_index)) %
            u64::from(self.stripe_count)) as u32
    }

    /// Which file handle addresses stripe `j`?
    pub fn fh_index(&self, j: u32) -> u32 {
        match self.packing {
            Packing::Sparse if self.fh_count == 1 => 0,
            _ => j,
        }
    }

    /// The byte offset to send to the data server for logical `offset`.
    pub fn dserver_offset(&self, offset: u64) -> u64 {
        match self.packing {
            Packing::Sparse => offset,
            Packing::Dense => {
                let rel = offset - self.pattern_offset;
                let width = self.stripe_unit *
                    u64::from(self.stripe_count);
                rel / width * self.stripe_unit + rel % self.stripe_unit
            }
        }
    }

    /// Invert [`FileGeometry::dserver_offset`] for a dense layout.
    ///
    /// `column` is the stripe column the original offset belonged to, i.e.
    /// `((offset - pattern_offset) / stripe_unit) mod stripe_count`.  The
    /// round trip through `dserver_offset` and back must be exact.
    pub fn restore_offset(&self, dense_offset: u64, column: u32) -> u64 {
        match self.packing {
            Packing::Sparse => dense_offset,
            Packing::Dense => {
                let width = self.stripe_unit *
                    u64::from(self.stripe_count);
                self.pattern_offset +
                    dense_offset / self.stripe_unit * width +
                    u64::from(column) * self.stripe_unit +
                    dense_offset % self.stripe_unit
            }
        }
    }

    /// The stripe column of `offset`, for use with
    /// [`FileGeometry::restore_offset`].
    pub fn column(&self, offset: u64) -> u32 {
        let rel = offset - self.pattern_offset;
        (rel / self.stripe_unit % u64::from(self.stripe_count)) as u32
    }

    /// Do two byte offsets land in the same stripe unit?  Requests within
    /// one stripe unit may be coalesced into a single data server RPC.
    pub fn same_stripe_unit(&self, a: u64, b: u64) -> bool {
        let rel_a = a - self.pattern_offset;
        let rel_b = b - self.pattern_offset;
        rel_a / self.stripe_unit == rel_b / self.stripe_unit
    }

    /// Split the interval into one sub-request per stripe-unit chunk.
    pub fn place(&self, _mode: PlaceMode, offset: u64, length: u64)
        -> Result<Vec<SubRequest>>
    {
        debug_assert!(length > 0);
        if offset < self.pattern_offset {
            return Err(Error::Invalid);
        }
        let mut subs = Vec::new();
        let mut cur = offset;
        let mut remaining = length;
        while remaining > 0 {
            let in_unit = (cur - self.pattern_offset) % self.stripe_unit;
            let chunk = remaining.min(self.stripe_unit - in_unit);
            let j = self.stripe_index(cur);
            subs.push(SubRequest::io(
                j,
                self.fh_index(j),
                self.dserver_offset(cur),
                chunk,
            ));
            cur += chunk;
            remaining -= chunk;
        }
        Ok(subs)
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
use pretty_assertions::assert_eq;
use rstest::rstest;

use crate::striping::assert_contiguous;
use super::*;

fn geom(packing: Packing) -> FileGeometry {
    FileGeometry {
        stripe_unit: 4096,
        first_stripe_index: 0,
        pattern_offset: 0,
        packing,
        stripe_count: 4,
        fh_count: 4,
        commit_through_mds: false,
    }
}

#[test]
fn dense_round_trip() {
    let g = geom(Packing::Dense);
    let offset = 20000;
    let dense = g.dserver_offset(offset);
    assert_eq!(dense, 7712);
    assert_eq!(g.restore_offset(dense, g.column(offset)), offset);
}

#[test]
fn sparse_is_identity() {
    let g = geom(Packing::Sparse);
    assert_eq!(g.dserver_offset(20000), 20000);
    assert_eq!(g.restore_offset(20000, g.column(20000)), 20000);
}

#[test]
fn stripe_index_rotation() {
    let mut g = geom(Packing::Sparse);
    g.first_stripe_index = 2;
    assert_eq!(g.stripe_index(0), 2);
    assert_eq!(g.stripe_index(4096), 3);
    assert_eq!(g.stripe_index(8192), 0);
    assert_eq!(g.stripe_index(16384), 2);
}

#[test]
fn sparse_single_fh() {
    let mut g = geom(Packing::Sparse);
    g.fh_count = 1;
    assert_eq!(g.fh_index(3), 0);
}

#[test]
fn place_spans_units() {
    let g = geom(Packing::Sparse);
    // 2 bytes short of a unit boundary, spanning three units
    let subs = g.place(PlaceMode::Read, 4094, 8194).unwrap();
    assert_contiguous(&subs, 8194);
    assert_eq!(subs.len(), 3);
    assert_eq!(subs[0].devices, vec![0]);
    assert_eq!(subs[0].length, 2);
    assert_eq!(subs[1].devices, vec![1]);
    assert_eq!(subs[1].length, 4096);
    assert_eq!(subs[2].devices, vec![2]);
    assert_eq!(subs[2].length, 4096);
}

#[test]
fn dense_place_compresses() {
    let g = geom(Packing::Dense);
    let subs = g.place(PlaceMode::Write, 20000, 100).unwrap();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].devices, vec![0]);
    assert_eq!(subs[0].dev_offset, 7712);
}

#[rstest]
#[case::unaligned_stripe_unit(
    FileGeometry { stripe_unit: 5000, .. geom(Packing::Sparse) })]
#[case::zero_devices(
    FileGeometry { stripe_count: 0, .. geom(Packing::Sparse) })]
#[case::first_index_oob(
    FileGeometry { first_stripe_index: 4, .. geom(Packing::Sparse) })]
#[case::dense_fh_mismatch(
    FileGeometry { fh_count: 1, .. geom(Packing::Dense) })]
#[case::sparse_fh_mismatch(
    FileGeometry { fh_count: 3, .. geom(Packing::Sparse) })]
fn check_rejects(#[case] g: FileGeometry) {
    assert_eq!(g.check(&LayoutRange::all()), Err(Error::Invalid));
}

#[test]
fn check_rejects_pattern_past_range() {
    let mut g = geom(Packing::Sparse);
    g.pattern_offset = 8192;
    assert_eq!(g.check(&LayoutRange::new(4096, 100)), Err(Error::Invalid));
    assert!(g.check(&LayoutRange::new(8192, 100)).is_ok());
}

#[test]
fn coalescing() {
    let g = geom(Packing::Sparse);
    assert!(g.same_stripe_unit(4096, 8191));
    assert!(!g.same_stripe_unit(4096, 8192));
}
}
// LCOV_EXCL_STOP
