// vim: tw=80
//! Layout driver dispatch
//!
//! One driver exists per storage geometry.  The transport hands us a
//! structurally decoded reply body; the driver validates it semantically,
//! resolves the devices it names, and produces the segment payload.

use std::sync::{Arc, Mutex};

use serde_derive::{Deserialize, Serialize};

use crate::{
    client::MetadataServer,
    device::{DeviceCache, DeviceRef},
    segment::{BlockPayload, FilePayload, LayoutPayload, ObjectPayload},
    striping::{
        block_extent::{Extent, ExtentMap, InitTracker},
        file_layout::{FileGeometry, Packing},
        object_raid::ObjectGeometry,
    },
    types::{DeviceId, Error, LayoutRange, Result},
    util::BYTES_PER_PAGE,
};

/// The closed set of layout drivers
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum DriverKind {
    File,
    Object,
    Block,
}

/// File-driver reply body
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileBody {
    pub device: DeviceId,
    pub stripe_unit: u64,
    pub first_stripe_index: u32,
    pub pattern_offset: u64,
    pub packing: Packing,
    pub commit_through_mds: bool,
    pub fhs: Vec<Vec<u8>>,
}

/// Object-driver reply body
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObjectBody {
    pub stripe_unit: u64,
    pub group_width: u32,
    /// Zero means unbounded: a single group that never wraps
    pub group_depth: u64,
    pub group_count: u64,
    pub mirror_count: u32,
    pub components: Vec<DeviceId>,
}

/// Block-driver reply body
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockBody {
    pub volume: DeviceId,
    pub extents: Vec<Extent>,
}

/// Geometry-specific portion of a LAYOUTGET reply, already structurally
/// decoded by the transport
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LayoutBody {
    File(FileBody),
    Object(ObjectBody),
    Block(BlockBody),
}

impl LayoutBody {
    fn kind(&self) -> DriverKind {
        match self {
            LayoutBody::File(_) => DriverKind::File,
            LayoutBody::Object(_) => DriverKind::Object,
            LayoutBody::Block(_) => DriverKind::Block,
        }
    }
}

/// Validate a reply body and resolve its devices into a segment payload.
///
/// A reply whose body does not match the mount's driver for this file
/// class is rejected outright.  Device references taken for a payload that
/// fails validation are released again before returning.
pub async fn decode(
    kind: DriverKind,
    body: LayoutBody,
    range: &LayoutRange,
    devices: &Arc<DeviceCache>,
    server: &dyn MetadataServer,
) -> Result<LayoutPayload> {
    if body.kind() != kind {
        return Err(Error::NoDriver);
    }
    match body {
        LayoutBody::File(b) => {
            let node = devices.resolve(b.device, server).await?;
            let device = DeviceRef::new(devices.clone(), node);
            let geometry = FileGeometry {
                stripe_unit: b.stripe_unit,
                first_stripe_index: b.first_stripe_index,
                pattern_offset: b.pattern_offset,
                packing: b.packing,
                stripe_count: device.node().addrs.len() as u32,
                fh_count: b.fhs.len() as u32,
                commit_through_mds: b.commit_through_mds,
            };
            geometry.check(range)?;
            Ok(LayoutPayload::File(FilePayload {
                geometry,
                fhs: b.fhs,
                device,
            }))
        }
        LayoutBody::Object(b) => {
            let geometry = ObjectGeometry {
                stripe_unit: b.stripe_unit,
                group_width: b.group_width,
                group_depth: if b.group_depth == 0 {
                    u64::MAX / (b.stripe_unit.max(1) *
                        u64::from(b.group_width.max(1)))
                } else {
                    b.group_depth
                },
                group_count: if b.group_depth == 0 {
                    1
                } else {
                    b.group_count
                },
                mirror_count: b.mirror_count,
                device_count: b.components.len() as u32,
            };
            geometry.check()?;
            let mut refs = Vec::with_capacity(b.components.len());
            for id in b.components.iter() {
                let node = devices.resolve(*id, server).await?;
                refs.push(DeviceRef::new(devices.clone(), node));
            }
            Ok(LayoutPayload::Object(ObjectPayload {
                geometry,
                devices: refs,
            }))
        }
        LayoutBody::Block(b) => {
            let mut extents = ExtentMap::new();
            for e in b.extents.into_iter() {
                extents.add(e)?;
            }
            if extents.is_empty() {
                return Err(Error::Invalid);
            }
            let node = devices.resolve(b.volume, server).await?;
            Ok(LayoutPayload::Block(BlockPayload {
                extents,
                tracker: Mutex::new(
                    InitTracker::new(BYTES_PER_PAGE as u64)),
                device: DeviceRef::new(devices.clone(), node),
            }))
        }
    }
}

// LCOV_EXCL_STOP
