// vim: tw=80
//! Grouped RAID-0 striping with optional mirroring
//!
//! The object driver stripes a file across component objects arranged in
//! groups.  Each group holds `group_width` primary components; components
//! cycle row by row for `group_depth` rows before the pattern moves to the
//! next group, and after the last group the cycle wraps back to the first
//! with a higher per-object offset.  Mirrored layouts interleave
//! `mirror_count` replica components after each primary, so a primary's
//! index in the full component table is its logical index times
//! `mirror_count + 1`.

use crate::{
    striping::{PlaceMode, SubRequest},
    types::{Error, Result},
    util::is_page_aligned,
};

/// Striping geometry of one object-driver layout segment.  Immutable after
/// decode.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObjectGeometry {
    pub stripe_unit: u64,
    /// Primary components per group
    pub group_width: u32,
    /// Rows per group before the pattern moves on
    pub group_depth: u64,
    pub group_count: u64,
    pub mirror_count: u32,
    /// Total component count, replicas included
    pub device_count: u32,
}

/// Where one file offset lands in the component table
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StripeInfo {
    /// Index of the primary component in the full table
    pub device: u32,
    /// Byte offset within that component's object
    pub obj_offset: u64,
    /// Bytes until the request crosses into the next group
    pub group_length: u64,
    /// Offset within the current stripe unit
    pub unit_off: u64,
}

impl ObjectGeometry {
    fn mirrors_p1(&self) -> u64 {
        u64::from(self.mirror_count) + 1
    }

    /// Semantic validation, applied once after decode.
    pub fn check(&self) -> Result<()> {
        if self.stripe_unit == 0 || !is_page_aligned(self.stripe_unit) {
            return Err(Error::Invalid);
        }
        if self.group_width == 0 || self.group_count == 0 ||
            self.device_count == 0
        {
            return Err(Error::Invalid);
        }
        if u64::from(self.device_count) % self.mirrors_p1() != 0 {
            return Err(Error::Invalid);
        }
        let primaries = u64::from(self.device_count) / self.mirrors_p1();
        if u64::from(self.group_width) * self.group_count != primaries {
            return Err(Error::Invalid);
        }
        Ok(())
    }

    /// Map absolute file offset `l` onto the component table.
    pub fn stripe_info(&self, l: u64) -> StripeInfo {
        let u = self.stripe_unit * u64::from(self.group_width);
        let t = u * self.group_depth;
        let s = t * self.group_count;

        let m = l / s;
        let lmod = l - m * s;
        let g = lmod / t;
        let h = lmod - g * t;
        let n = h / u;

        let unit_off = l % self.stripe_unit;
        let obj_offset = unit_off + n * self.stripe_unit +
            m * self.group_depth * self.stripe_unit;
        let device = (((h - n * u) / self.stripe_unit +
            g * u64::from(self.group_width)) * self.mirrors_p1()) as u32;

        StripeInfo {
            device,
            obj_offset,
            group_length: t - h,
            unit_off,
        }
    }

    /// All component indices a write to primary `device` must reach.
    pub fn mirror_targets(&self, device: u32) -> Vec<u32> {
        (device..device + u32::from(self.mirror_count) + 1).collect()
    }

    /// Split the interval into sub-requests, one per stripe-unit chunk,
    /// advancing across group boundaries.
    pub fn place(&self, mode: PlaceMode, offset: u64, length: u64)
        -> Result<Vec<SubRequest>>
    {
        debug_assert!(length > 0);
        let mirrors_p1 = self.mirrors_p1() as u32;
        let devs_in_group = self.group_width * mirrors_p1;
        let num_comps = self.device_count;

        let si = self.stripe_info(offset);
        let mut dev = si.device;
        let mut obj_offset = si.obj_offset;
        let mut unit_off = si.unit_off;
        let mut group_left = si.group_length;
        let mut major = offset /
            (self.stripe_unit * u64::from(self.group_width) *
             self.group_depth * self.group_count);
        let mut remaining = length;
        let mut subs = Vec::new();

        while remaining > 0 {
            if group_left == 0 {
                // Crossed a group boundary: the cycle index advances, the
                // per-object offset rebases from it, and the device moves to
                // the next group's first component, wrapping past the last
                // group.
                group_left = self.stripe_unit *
                    u64::from(self.group_width) * self.group_depth;
                unit_off = 0;
                major += 1;
                obj_offset = major * self.stripe_unit * self.group_depth;
                dev = (dev - dev % devs_in_group + devs_in_group) %
                    num_comps;
            }
            let chunk = remaining
                .min(self.stripe_unit - unit_off)
                .min(group_left);
            let devices = match mode {
                PlaceMode::Write => self.mirror_targets(dev),
                PlaceMode::Read => vec![dev],
            };
            subs.push(SubRequest {
                devices,
                fh: 0,
                dev_offset: obj_offset,
                length: chunk,
                kind: crate::striping::SubKind::Io,
            });
            remaining -= chunk;
            group_left -= chunk;
            unit_off += chunk;
            if unit_off == self.stripe_unit {
                // Next unit moves to the next component in the group,
                // wrapping to a new row at the group edge.
                unit_off = 0;
                let group_base = dev - dev % devs_in_group;
                let next = dev + mirrors_p1;
                if next - group_base == devs_in_group {
                    dev = group_base;
                    obj_offset = obj_offset - obj_offset % self.stripe_unit +
                        self.stripe_unit;
                } else {
                    dev = next;
                    obj_offset -= obj_offset % self.stripe_unit;
                }
            } else {
                obj_offset += chunk;
            }
        }
        Ok(subs)
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
use pretty_assertions::assert_eq;

use crate::striping::assert_contiguous;
use super::*;

fn geom() -> ObjectGeometry {
    ObjectGeometry {
        stripe_unit: 65536,
        group_width: 2,
        group_depth: 4,
        group_count: 2,
        mirror_count: 0,
        device_count: 4,
    }
}

#[test]
fn worked_example() {
    let g = geom();
    let si = g.stripe_info(600000);
    assert_eq!(si.device, 3);
    assert_eq!(si.obj_offset, 10176);
    assert_eq!(si.unit_off, 10176);
    assert_eq!(si.group_length, 448576);
    assert!(si.device < g.device_count);
    // Determinism
    assert_eq!(g.stripe_info(600000), si);
}

#[test]
fn group_boundary_split() {
    let g = geom();
    // One group is 65536 * 2 * 4 = 524288 bytes.  Start one unit before
    // the boundary and span into the next group.
    let offset = 524288 - 65536;
    let len = 3 * 65536;
    let subs = g.place(PlaceMode::Read, offset, len as u64).unwrap();
    assert_contiguous(&subs, len as u64);
    assert_eq!(subs.len(), 3);
    // Last unit of group 0: row 3, second component
    assert_eq!(subs[0].devices, vec![1]);
    assert_eq!(subs[0].dev_offset, 3 * 65536);
    // First units of group 1, cycle index rebased past the boundary
    assert_eq!(subs[1].devices, vec![2]);
    assert_eq!(subs[1].dev_offset, 4 * 65536);
    assert_eq!(subs[2].devices, vec![3]);
    assert_eq!(subs[2].dev_offset, 4 * 65536);
}

#[test]
fn super_cycle_wraps() {
    let g = geom();
    // 1 MB into the file is one full cycle; the pattern returns to
    // component 0 with a per-object offset one group_depth further along.
    let si = g.stripe_info(1048576);
    assert_eq!(si.device, 0);
    assert_eq!(si.obj_offset, 4 * 65536);
}

#[test]
fn mirrored_writes_fan_out() {
    let g = ObjectGeometry {
        mirror_count: 1,
        device_count: 8,
        .. geom()
    };
    let subs = g.place(PlaceMode::Write, 65536, 65536).unwrap();
    assert_eq!(subs.len(), 1);
    // Second primary of group 0 is component 2; its replica follows it.
    assert_eq!(subs[0].devices, vec![2, 3]);

    let reads = g.place(PlaceMode::Read, 65536, 65536).unwrap();
    assert_eq!(reads[0].devices, vec![2]);
}

#[test]
fn check_rejects_bad_component_count() {
    let mut g = geom();
    g.device_count = 5;
    assert_eq!(g.check(), Err(Error::Invalid));
    g.device_count = 4;
    assert!(g.check().is_ok());
    g.mirror_count = 1;
    assert_eq!(g.check(), Err(Error::Invalid));
    g.device_count = 8;
    assert!(g.check().is_ok());
}

/// With a single group, placement agrees with `stripe_info` recomputed
/// chunk by chunk, across several cycle wraparounds.
#[test]
fn place_matches_stripe_info() {
    let g = ObjectGeometry {
        group_count: 1,
        device_count: 2,
        .. geom()
    };
    let offset = 600000;
    let len = 2000000;
    let subs = g.place(PlaceMode::Read, offset, len).unwrap();
    assert_contiguous(&subs, len);
    let mut cur = offset;
    for sub in subs.iter() {
        let si = g.stripe_info(cur);
        assert_eq!(sub.devices, vec![si.device], "at offset {cur}");
        assert_eq!(sub.dev_offset, si.obj_offset, "at offset {cur}");
        cur += sub.length;
    }
}
}
// LCOV_EXCL_STOP
