// vim: tw=80
//! Layout segments and their geometry payloads

use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, Mutex,
};

use enum_dispatch::enum_dispatch;

use crate::{
    device::{DeviceCache, DeviceNode, DeviceRef},
    striping::{
        block_extent::{ExtentMap, InitTracker},
        file_layout::FileGeometry,
        object_raid::ObjectGeometry,
        PlaceMode, Placement, SubRequest,
    },
    types::{IoMode, LayoutRange, Result},
};

/// File-striping payload: one device node whose address table lists the
/// data servers, plus the file handles that address the file on them.
#[derive(Debug)]
pub struct FilePayload {
    pub geometry: FileGeometry,
    /// Opaque per-data-server file handles
    pub fhs: Vec<Vec<u8>>,
    pub device: DeviceRef,
}

impl Placement for FilePayload {
    fn place(&self, mode: PlaceMode, offset: u64, length: u64)
        -> Result<Vec<SubRequest>>
    {
        self.geometry.place(mode, offset, length)
    }

    fn device_count(&self) -> u32 {
        self.geometry.stripe_count
    }
}

/// Object-striping payload: one device node per component object
#[derive(Debug)]
pub struct ObjectPayload {
    pub geometry: ObjectGeometry,
    pub devices: Vec<DeviceRef>,
}

impl Placement for ObjectPayload {
    fn place(&self, mode: PlaceMode, offset: u64, length: u64)
        -> Result<Vec<SubRequest>>
    {
        self.geometry.place(mode, offset, length)
    }

    fn device_count(&self) -> u32 {
        self.devices.len() as u32
    }
}

/// Block payload: extent mappings onto a single volume device
#[derive(Debug)]
pub struct BlockPayload {
    pub extents: ExtentMap,
    /// Which blocks of uninitialized extents have been written, for the
    /// next commit to report
    pub tracker: Mutex<InitTracker>,
    pub device: DeviceRef,
}

impl Placement for BlockPayload {
    fn place(&self, mode: PlaceMode, offset: u64, length: u64)
        -> Result<Vec<SubRequest>>
    {
        match mode {
            PlaceMode::Read => {
                let tracker = self.tracker.lock().unwrap();
                self.extents.place_read(offset, length, &tracker)
            }
            PlaceMode::Write => {
                let subs = self.extents.place_write(offset, length)?;
                if self.extents.writes_need_tracking(offset, length) {
                    self.tracker.lock().unwrap()
                        .mark_written(offset, length);
                }
                Ok(subs)
            }
        }
    }

    fn device_count(&self) -> u32 {
        1
    }
}

/// Geometry payload of one segment, owned exclusively by it and immutable
/// after decode.
#[enum_dispatch(Placement)]
#[derive(Debug)]
pub enum LayoutPayload {
    File(FilePayload),
    Object(ObjectPayload),
    Block(BlockPayload),
}

impl LayoutPayload {
    /// Resolve a sub-request's device index to a node and an index into its
    /// address table.
    pub fn target(&self, device: u32) -> (&Arc<DeviceNode>, usize) {
        match self {
            LayoutPayload::File(p) =>
                (p.device.node(), device as usize),
            LayoutPayload::Object(p) =>
                (p.devices[device as usize].node(), 0),
            LayoutPayload::Block(p) => (p.device.node(), 0),
        }
    }

    /// The cache that connections to this payload's devices go through
    pub fn device_cache(&self) -> &Arc<DeviceCache> {
        match self {
            LayoutPayload::File(p) => p.device.cache(),
            LayoutPayload::Object(p) => p.devices[0].cache(),
            LayoutPayload::Block(p) => p.device.cache(),
        }
    }

    /// File handle for a sub-request, where the driver uses them
    pub fn fh(&self, idx: u32) -> Option<&[u8]> {
        match self {
            LayoutPayload::File(p) =>
                p.fhs.get(idx as usize).map(|v| v.as_slice()),
            _ => None,
        }
    }

    /// Must COMMIT be routed through the metadata server?  Block writes go
    /// straight to the volume, so only LAYOUTCOMMIT remains for them.
    pub fn commit_through_mds(&self) -> bool {
        match self {
            LayoutPayload::File(p) => p.geometry.commit_through_mds,
            LayoutPayload::Object(_) => false,
            LayoutPayload::Block(_) => true,
        }
    }

    /// Volume ranges newly written into uninitialized extents, drained for
    /// the next LAYOUTCOMMIT to report.  Empty for drivers that don't
    /// track initialization.
    pub fn take_written_ranges(&self) -> Vec<LayoutRange> {
        match self {
            LayoutPayload::Block(p) =>
                p.tracker.lock().unwrap().take_ranges(),
            _ => Vec::new(),
        }
    }
}

/// One granted, byte-range-bounded I/O authorization.
///
/// A segment is a member of its header's ordered collection only while its
/// validity flag is set.  The collection membership holds one reference;
/// in-flight I/O holds more.  The payload is torn down when the count
/// reaches zero, which also releases the payload's device references.
#[derive(Debug)]
pub struct LayoutSegment {
    pub range: LayoutRange,
    pub mode: IoMode,
    valid: AtomicBool,
    refs: AtomicU32,
    pub payload: LayoutPayload,
}

impl LayoutSegment {
    /// A new segment starts valid, with the one reference belonging to its
    /// collection membership.
    pub fn new(range: LayoutRange, mode: IoMode, payload: LayoutPayload)
        -> Self
    {
        LayoutSegment {
            range,
            mode,
            valid: AtomicBool::new(true),
            refs: AtomicU32::new(1),
            payload,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Clear the validity flag.  Returns whether it was set, so the caller
    /// knows to release the collection's reference exactly once.
    pub fn mark_invalid(&self) -> bool {
        self.valid.swap(false, Ordering::AcqRel)
    }

    /// Take an additional reference.  Only legal while at least one is
    /// already held.
    pub fn get(&self) {
        let prev = self.refs.fetch_add(1, Ordering::Relaxed);
        debug_assert!(prev > 0);
    }

    /// Drop one reference.  Returns true on the final one; the caller must
    /// then run collection cleanup.
    #[must_use]
    pub fn put(&self) -> bool {
        self.refs.fetch_sub(1, Ordering::AcqRel) == 1
    }

    #[cfg(test)]
    pub fn refcount(&self) -> u32 {
        self.refs.load(Ordering::Relaxed)
    }

    /// Does this segment satisfy a lookup for `range` in `mode`?  The
    /// segment only needs to cover the first byte of the query.
    pub fn matches(&self, range: &LayoutRange, mode: IoMode) -> bool {
        self.is_valid() &&
            mode.matches(self.mode) &&
            self.range.contains_byte(range.offset)
    }
}

// LCOV_EXCL_START
#[cfg(test)]
pub(crate) mod t {
use pretty_assertions::assert_eq;
use rstest::rstest;

use crate::striping::file_layout::Packing;
use super::*;

pub(crate) fn stub_payload() -> LayoutPayload {
    LayoutPayload::File(FilePayload {
        geometry: FileGeometry {
            stripe_unit: 4096,
            first_stripe_index: 0,
            pattern_offset: 0,
            packing: Packing::Sparse,
            stripe_count: 1,
            fh_count: 1,
            commit_through_mds: false,
        },
        fhs: vec![vec![0u8; 4]],
        device: DeviceRef::stub(),
    })
}

/// All nine query-mode by segment-mode combinations.  A segment is never
/// granted with the wildcard mode, but the rule is defined for it anyway.
#[rstest]
#[case(IoMode::Any, IoMode::Read, true)]
#[case(IoMode::Any, IoMode::Rw, true)]
#[case(IoMode::Any, IoMode::Any, true)]
#[case(IoMode::Rw, IoMode::Read, false)]
#[case(IoMode::Rw, IoMode::Rw, true)]
#[case(IoMode::Rw, IoMode::Any, false)]
#[case(IoMode::Read, IoMode::Read, true)]
#[case(IoMode::Read, IoMode::Rw, true)]
#[case(IoMode::Read, IoMode::Any, true)]
fn mode_compatibility(
    #[case] query: IoMode,
    #[case] segment: IoMode,
    #[case] matches: bool)
{
    assert_eq!(query.matches(segment), matches);
}

#[test]
fn first_byte_containment() {
    let seg = LayoutSegment::new(
        LayoutRange::new(4096, 4096), IoMode::Rw, stub_payload());
    // Only the first byte of the query needs to be covered
    assert!(seg.matches(&LayoutRange::new(8191, 1 << 20), IoMode::Rw));
    assert!(!seg.matches(&LayoutRange::new(8192, 1), IoMode::Rw));
    assert!(!seg.matches(&LayoutRange::new(4095, 4096), IoMode::Rw));
    assert!(seg.put());
}

#[test]
fn written_ranges_drain_once() {
    let payload = stub_payload();
    assert!(payload.take_written_ranges().is_empty());

    let mut extents = ExtentMap::new();
    extents.add(crate::striping::block_extent::Extent {
        f_offset: 0,
        length: 1 << 20,
        v_offset: 0,
        state: crate::striping::block_extent::ExtentState::Invalid,
    }).unwrap();
    let payload = LayoutPayload::Block(BlockPayload {
        extents,
        tracker: Mutex::new(InitTracker::new(4096)),
        device: DeviceRef::stub(),
    });
    payload.place(PlaceMode::Write, 0, 8192).unwrap();
    assert_eq!(payload.take_written_ranges(),
               vec![LayoutRange::new(0, 8192)]);
    assert!(payload.take_written_ranges().is_empty());
}

/// Data written into an uninitialized extent is visible to reads through
/// the same payload before any commit promotes the extent.
#[test]
fn tracked_write_reads_back_from_volume() {
    let mut extents = ExtentMap::new();
    extents.add(crate::striping::block_extent::Extent {
        f_offset: 0,
        length: 1 << 20,
        v_offset: 0,
        state: crate::striping::block_extent::ExtentState::Invalid,
    }).unwrap();
    let payload = LayoutPayload::Block(BlockPayload {
        extents,
        tracker: Mutex::new(InitTracker::new(4096)),
        device: DeviceRef::stub(),
    });
    payload.place(PlaceMode::Write, 0, 8192).unwrap();
    let subs = payload.place(PlaceMode::Read, 0, 8192).unwrap();
    assert_eq!(subs, vec![SubRequest::io(0, 0, 0, 8192)]);
}

#[test]
fn invalid_segments_never_match() {
    let seg = LayoutSegment::new(
        LayoutRange::all(), IoMode::Rw, stub_payload());
    assert!(seg.matches(&LayoutRange::new(0, 1), IoMode::Read));
    assert!(seg.mark_invalid());
    assert!(!seg.matches(&LayoutRange::new(0, 1), IoMode::Read));
    // Only the first invalidation reports the flag as previously set
    assert!(!seg.mark_invalid());
    assert!(seg.put());
}
}
// LCOV_EXCL_STOP
