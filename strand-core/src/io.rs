// vim: tw=80
//! Layout-based I/O: fan a placed request out to the storage servers and
//! aggregate the per-device results.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{stream::FuturesUnordered, StreamExt};
#[cfg(test)] use mockall::automock;

use crate::{
    header::SegmentRef,
    striping::{PlaceMode, Placement, SubKind},
    types::{
        Credential, DeviceError, Error, IoVec, IoVecMut, LayoutRange,
        Result,
    },
};

/// A live connection to one storage server.
///
/// The transfer itself lives behind this boundary; this crate only decides
/// where each byte goes.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DataServer: Send + Sync {
    /// Read up to `length` bytes.  A short return is not an error; it
    /// means the read ran past the end of what the server holds.
    async fn read_at(
        &self,
        fh: Option<Vec<u8>>,
        offset: u64,
        length: u64,
    ) -> std::result::Result<IoVec, DeviceError>;

    async fn write_at(
        &self,
        fh: Option<Vec<u8>>,
        offset: u64,
        buf: IoVec,
    ) -> std::result::Result<(), DeviceError>;

    /// Flush previously written data to stable storage
    async fn commit(
        &self,
        fh: Option<Vec<u8>>,
    ) -> std::result::Result<(), DeviceError>;
}

/// Establishes [`DataServer`] connections on demand
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, addr: &str)
        -> std::result::Result<Arc<dyn DataServer>, DeviceError>;
}

/// Aggregated outcome of a multi-device operation.
///
/// `valid_bytes` counts the contiguous prefix of the request that
/// completed successfully; `error` is the most severe per-device error
/// observed anywhere in the request, if any.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IoResult {
    pub valid_bytes: u64,
    pub error: Option<DeviceError>,
}

impl IoResult {
    fn aggregate(
        lengths: &[u64],
        outcomes: &[Option<std::result::Result<(), DeviceError>>],
    ) -> Self {
        let mut valid_bytes = 0;
        let mut error = None;
        let mut prefix_ok = true;
        for (len, o) in lengths.iter().zip(outcomes.iter()) {
            match o {
                Some(Ok(())) => {
                    if prefix_ok {
                        valid_bytes += *len;
                    }
                }
                Some(Err(e)) => {
                    prefix_ok = false;
                    if error.map(|w| *e > w).unwrap_or(true) {
                        error = Some(*e);
                    }
                }
                None => prefix_ok = false,
            }
        }
        IoResult { valid_bytes, error }
    }
}

/// Read `buf.len()` bytes starting at file offset `offset` through the
/// segment's layout.  A placement failure reports the operation as not
/// attempted so the caller can fall back to routing the I/O through the
/// metadata server.
///
/// Short reads past end-of-file are recovered by zero-filling the unread
/// tail.
pub async fn read(seg: &SegmentRef, offset: u64, mut buf: IoVecMut)
    -> Result<IoResult>
{
    let length = buf.len() as u64;
    debug_assert!(seg.range.contains_byte(offset));
    let subs = seg.payload.place(PlaceMode::Read, offset, length)
        .map_err(|_| Error::NotAttempted)?;

    let mut lengths = Vec::with_capacity(subs.len());
    let futs = FuturesUnordered::new();
    for (i, sub) in subs.into_iter().enumerate() {
        lengths.push(sub.length);
        let mut chunk = buf.split_to(sub.length as usize);
        futs.push(async move {
            let r = match sub.kind {
                SubKind::Zero => {
                    chunk[..].fill(0);
                    Ok(())
                }
                SubKind::Io => {
                    read_sub(seg, sub.devices[0], sub.fh, sub.dev_offset,
                             &mut chunk).await
                }
            };
            (i, r)
        });
    }
    Ok(collect(lengths, futs).await)
}

async fn read_sub(
    seg: &SegmentRef,
    device: u32,
    fh_idx: u32,
    dev_offset: u64,
    chunk: &mut IoVecMut,
) -> std::result::Result<(), DeviceError> {
    let (node, addr_idx) = seg.payload.target(device);
    let cache = seg.payload.device_cache();
    let ds = cache.connect(node, addr_idx).await
        .map_err(|_| DeviceError::Unreachable)?;
    let fh = seg.payload.fh(fh_idx).map(<[u8]>::to_vec);
    let data = ds.read_at(fh, dev_offset, chunk.len() as u64).await?;
    let got = data.len().min(chunk.len());
    chunk[..got].copy_from_slice(&data[..got]);
    // Reading past end-of-file comes back short; the tail reads as zeros.
    chunk[got..].fill(0);
    Ok(())
}

/// Write `buf` at file offset `offset` through the segment's layout,
/// fanning mirrored sub-requests out to every replica.  On any success the
/// header's dirty range is extended for the next LAYOUTCOMMIT under
/// `cred`.
pub async fn write(
    seg: &SegmentRef,
    offset: u64,
    mut buf: IoVec,
    cred: &Credential,
) -> Result<IoResult> {
    let length = buf.len() as u64;
    debug_assert!(seg.range.contains_byte(offset));
    let subs = seg.payload.place(PlaceMode::Write, offset, length)
        .map_err(|_| Error::NotAttempted)?;

    let mut lengths = Vec::with_capacity(subs.len());
    let futs = FuturesUnordered::new();
    for (i, sub) in subs.into_iter().enumerate() {
        lengths.push(sub.length);
        let chunk = buf.split_to(sub.length as usize);
        futs.push(async move {
            (i, write_sub(seg, &sub.devices, sub.fh, sub.dev_offset,
                          chunk).await)
        });
    }
    let result = collect(lengths, futs).await;
    if result.valid_bytes > 0 {
        seg.header().update_last_write(offset, result.valid_bytes, cred);
    }
    Ok(result)
}

/// A mirrored write must reach every replica; the worst replica error
/// stands for the whole sub-request.
async fn write_sub(
    seg: &SegmentRef,
    devices: &[u32],
    fh_idx: u32,
    dev_offset: u64,
    chunk: IoVec,
) -> std::result::Result<(), DeviceError> {
    let cache = seg.payload.device_cache();
    let fh = seg.payload.fh(fh_idx).map(<[u8]>::to_vec);
    let mut worst = None;
    let mut futs = devices.iter()
        .map(|d| {
            let chunk = chunk.clone();
            let fh = fh.clone();
            async move {
                let (node, addr_idx) = seg.payload.target(*d);
                let ds = cache.connect(node, addr_idx).await
                    .map_err(|_| DeviceError::Unreachable)?;
                ds.write_at(fh, dev_offset, chunk).await
            }
        }).collect::<FuturesUnordered<_>>();
    while let Some(r) = futs.next().await {
        if let Err(e) = r {
            if worst.map(|w| e > w).unwrap_or(true) {
                worst = Some(e);
            }
        }
    }
    match worst {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn collect<F>(lengths: Vec<u64>, mut futs: FuturesUnordered<F>)
    -> IoResult
    where F: std::future::Future<
        Output = (usize, std::result::Result<(), DeviceError>)>
{
    let mut outcomes = vec![None; lengths.len()];
    while let Some((i, r)) = futs.next().await {
        outcomes[i] = Some(r);
    }
    IoResult::aggregate(&lengths, &outcomes)
}

/// Where the flush for a written range must go
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CommitTarget {
    /// Data servers flushed directly; nothing further to do
    DataServers,
    /// The layout requires COMMIT to go through the metadata server
    MetadataServer,
}

/// Flush a written range to stable storage, sending one COMMIT per device
/// involved.  Layouts flagged commit-through-MDS skip the data servers
/// entirely and tell the caller to route its commit to the metadata
/// server instead.
pub async fn commit(seg: &SegmentRef, range: &LayoutRange)
    -> Result<CommitTarget>
{
    if seg.payload.commit_through_mds() {
        return Ok(CommitTarget::MetadataServer);
    }
    let subs = seg.payload
        .place(PlaceMode::Write, range.offset, range.length)
        .map_err(|_| Error::NotAttempted)?;
    // One commit per distinct target, not per sub-request
    let mut targets: Vec<(u32, u32)> = Vec::new();
    for sub in subs.iter() {
        for d in sub.devices.iter() {
            if !targets.iter().any(|(td, _)| td == d) {
                targets.push((*d, sub.fh));
            }
        }
    }
    let mut worst: Option<DeviceError> = None;
    for (device, fh_idx) in targets.into_iter() {
        let (node, addr_idx) = seg.payload.target(device);
        let cache = seg.payload.device_cache();
        let fh = seg.payload.fh(fh_idx).map(<[u8]>::to_vec);
        let r = match cache.connect(node, addr_idx).await {
            Ok(ds) => ds.commit(fh).await,
            Err(_) => Err(DeviceError::Unreachable),
        };
        if let Err(e) = r {
            if worst.map(|w| e > w).unwrap_or(true) {
                worst = Some(e);
            }
        }
    }
    match worst {
        Some(e) => Err(Error::Device(e)),
        None => Ok(CommitTarget::DataServers),
    }
}

// LCOV_EXCL_STOP
