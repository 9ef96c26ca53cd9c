// vim: tw=80
//! Layout acquisition, return, and commit orchestration.
//!
//! One [`LayoutClient`] exists per mount session.  It owns the per-file
//! header registry and the session-wide list of headers holding (or about
//! to hold) layout state, which server-initiated recall walks.

use std::{
    collections::HashMap,
    hash::BuildHasherDefault,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use metrohash::MetroHash64;
#[cfg(test)] use mockall::automock;

use crate::{
    device::DeviceCache,
    driver::{self, DriverKind, LayoutBody},
    header::{AcquireCheck, CommitData, LayoutHeader, SegmentRef},
    io::Connector,
    segment::LayoutSegment,
    types::{
        Credential, DeviceId, Error, FileClass, FileId, IoMode, LayoutRange,
        MountConfig, Result, Stateid,
    },
    util::new_metro_hashmap,
};

/// Arguments of one LAYOUTGET round trip
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LayoutGetArgs {
    pub fileid: FileId,
    pub class: FileClass,
    pub range: LayoutRange,
    pub mode: IoMode,
    /// Smallest grant the server may usefully return
    pub min_length: u64,
    /// Largest reply body we are willing to accept
    pub max_size: u64,
    /// Current layout stateid, absent on the file's first LAYOUTGET
    pub stateid: Option<Stateid>,
}

/// A successful LAYOUTGET reply, structurally decoded by the transport
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LayoutGetReply {
    pub stateid: Stateid,
    /// Granted range; may exceed the requested one
    pub range: LayoutRange,
    pub mode: IoMode,
    pub return_on_close: bool,
    pub body: LayoutBody,
}

/// Arguments of one LAYOUTCOMMIT round trip
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LayoutCommitArgs {
    pub fileid: FileId,
    pub range: LayoutRange,
    /// Highest byte offset written through the layout
    pub last_byte: u64,
    pub stateid: Stateid,
    pub cred: Credential,
    /// Volume ranges newly written into uninitialized extents.  Only block
    /// layouts report these.
    pub written: Vec<LayoutRange>,
}

/// The metadata server, as seen from the layout cache.  Calls block the
/// logical caller until the round trip resolves.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MetadataServer: Send + Sync {
    /// Resolve a device identifier to its network address list
    async fn getdeviceinfo(&self, id: DeviceId) -> Result<Vec<String>>;

    async fn layoutget(&self, args: LayoutGetArgs) -> Result<LayoutGetReply>;

    async fn layoutreturn(
        &self,
        fileid: FileId,
        class: FileClass,
        range: LayoutRange,
        stateid: Stateid,
    ) -> Result<()>;

    async fn layoutcommit(&self, args: LayoutCommitArgs) -> Result<()>;
}

type HeaderMap = HashMap<(FileId, FileClass), Arc<LayoutHeader>,
                         BuildHasherDefault<MetroHash64>>;

/// Per-session layout state machine
pub struct LayoutClient {
    config: MountConfig,
    /// Driver granted for the primary data layout
    data_driver: DriverKind,
    /// Driver granted for the metadata/replication layout
    meta_driver: DriverKind,
    server: Arc<dyn MetadataServer>,
    devices: Arc<DeviceCache>,
    headers: Mutex<HeaderMap>,
    /// Headers holding layout state or with a LAYOUTGET outstanding.
    /// Bulk recall walks this list.
    active: Mutex<Vec<Arc<LayoutHeader>>>,
}

impl LayoutClient {
    pub fn new(
        config: MountConfig,
        data_driver: DriverKind,
        meta_driver: DriverKind,
        server: Arc<dyn MetadataServer>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        LayoutClient {
            config,
            data_driver,
            meta_driver,
            server,
            devices: Arc::new(DeviceCache::new(connector)),
            headers: Mutex::new(new_metro_hashmap(16)),
            active: Mutex::new(Vec::new()),
        }
    }

    pub fn devices(&self) -> &Arc<DeviceCache> {
        &self.devices
    }

    fn driver_for(&self, class: FileClass) -> DriverKind {
        match class {
            FileClass::Data => self.data_driver,
            FileClass::Meta => self.meta_driver,
        }
    }

    /// The file's header, created on first use
    fn header(&self, fileid: FileId, class: FileClass) -> Arc<LayoutHeader> {
        self.headers.lock().unwrap()
            .entry((fileid, class))
            .or_insert_with(|| LayoutHeader::new(fileid, class))
            .clone()
    }

    fn lookup(&self, fileid: FileId, class: FileClass)
        -> Option<Arc<LayoutHeader>>
    {
        self.headers.lock().unwrap().get(&(fileid, class)).cloned()
    }

    /// Drop a header from the session-wide recall list.  The per-file
    /// entry stays; it remembers the fail bits and the recall barrier.
    fn deregister(&self, lo: &Arc<LayoutHeader>) {
        self.active.lock().unwrap().retain(|h| !Arc::ptr_eq(h, lo));
    }

    /// Drop a header from both registries once nothing uses it
    fn release_header(&self, lo: &Arc<LayoutHeader>) {
        self.deregister(lo);
        if lo.is_unused() {
            self.headers.lock().unwrap()
                .retain(|_, h| !Arc::ptr_eq(h, lo));
        }
    }

    /// Find or acquire a layout segment covering the first byte of
    /// `range` with access mode `mode`.
    ///
    /// `Ok(None)` means layout-based I/O is unavailable for this range
    /// right now and the caller should route the I/O through the metadata
    /// server instead.  Replies that lose a race with a recall are
    /// silently forgotten; the caller observes a miss and may retry.
    pub async fn update_layout(
        &self,
        fileid: FileId,
        class: FileClass,
        range: &LayoutRange,
        mode: IoMode,
    ) -> Result<Option<SegmentRef>> {
        if !self.config.layout_enabled {
            return Ok(None);
        }
        let lo = self.header(fileid, class);
        let (register, stateid) = loop {
            match lo.check_acquire(range, mode) {
                AcquireCheck::Found(r) => return Ok(Some(r)),
                AcquireCheck::Failed => return Ok(None),
                AcquireCheck::Blocked => lo.wait_acquire().await,
                AcquireCheck::Proceed { register, stateid } =>
                    break (register, stateid),
            }
        };
        if register {
            self.active.lock().unwrap().push(lo.clone());
        }
        let args = LayoutGetArgs {
            fileid,
            class,
            range: *range,
            mode,
            min_length: self.config.min_layout_length.min(range.length),
            max_size: self.config.max_layout_size,
            stateid,
        };
        let reply = match self.server.layoutget(args).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!(%fileid, ?mode, error = %e,
                    "LAYOUTGET failed");
                if lo.acquire_failed(mode) {
                    self.deregister(&lo);
                }
                // TryLater is transient; don't latch the fail bit for it.
                // A failure latched on the other mode stays latched.
                if e == Error::TryLater {
                    lo.clear_fail_bit(mode);
                }
                return Ok(None);
            }
        };
        let payload = match driver::decode(
            self.driver_for(class),
            reply.body,
            &reply.range,
            &self.devices,
            &*self.server,
        ).await {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(%fileid, error = %e,
                    "discarding undecodable layout");
                if lo.acquire_failed(mode) {
                    self.deregister(&lo);
                }
                return Ok(None);
            }
        };
        let seg = LayoutSegment::new(reply.range, reply.mode, payload);
        match lo.process_reply(seg, reply.stateid, reply.return_on_close,
                               false)
        {
            Some(r) => Ok(Some(r)),
            None => {
                // Forgotten reply.  The segment never entered the cache;
                // the caller sees a miss and the barrier stays remembered
                // so a resend of the same stale grant is forgotten too.
                if lo.is_unused() {
                    self.deregister(&lo);
                }
                Ok(None)
            }
        }
    }

    /// Explicitly return every layout the file holds, committing dirty
    /// state first.  `Ok(false)` means there was nothing to return.
    pub async fn return_layout(&self, fileid: FileId, class: FileClass)
        -> Result<bool>
    {
        let Some(lo) = self.lookup(fileid, class) else {
            return Ok(false);
        };
        let Some(stateid) = lo.stateid() else {
            return Ok(false);
        };
        if !lo.has_segments() {
            return Ok(false);
        }
        lo.block_gets();
        lo.invalidate_by_range(&LayoutRange::all(), IoMode::Any);
        lo.drain().await;
        // LAYOUTCOMMIT must precede LAYOUTRETURN for the same range
        let r = self.commit_then_return(&lo, fileid, class,
                                        LayoutRange::all(), stateid).await;
        lo.unblock_gets();
        if lo.is_unused() {
            self.release_header(&lo);
        }
        r.map(|()| true)
    }

    /// Handle a server-initiated recall of `range`.  Overlapping segments
    /// are invalidated, in-flight I/O drains naturally, and the range is
    /// returned.  `Ok(false)` means no matching layout was held.
    pub async fn handle_recall(
        &self,
        fileid: FileId,
        class: FileClass,
        range: &LayoutRange,
        stateid: Stateid,
    ) -> Result<bool> {
        let Some(lo) = self.lookup(fileid, class) else {
            return Ok(false);
        };
        lo.set_recall_stateid(stateid);
        if !lo.invalidate_by_range(range, IoMode::Any) {
            return Ok(false);
        }
        // Invalidation also clears the fail bits' cause; allow retries
        lo.clear_fail_bits();
        lo.drain().await;
        let r = self.commit_then_return(&lo, fileid, class, *range,
                                        stateid).await;
        if lo.is_unused() {
            self.release_header(&lo);
        }
        r.map(|()| true)
    }

    async fn commit_then_return(
        &self,
        lo: &Arc<LayoutHeader>,
        fileid: FileId,
        class: FileClass,
        range: LayoutRange,
        stateid: Stateid,
    ) -> Result<()> {
        if let Some(cd) = lo.take_commit_data() {
            self.issue_commit(lo, fileid, stateid, cd).await?;
        }
        self.server.layoutreturn(fileid, class, range, stateid).await
    }

    /// Issue any pending LAYOUTCOMMIT for the file
    pub async fn layoutcommit(&self, fileid: FileId, class: FileClass)
        -> Result<()>
    {
        let Some(lo) = self.lookup(fileid, class) else {
            return Ok(());
        };
        let Some(stateid) = lo.stateid() else {
            return Ok(());
        };
        match lo.take_commit_data() {
            Some(cd) => self.issue_commit(&lo, fileid, stateid, cd).await,
            None => Ok(()),
        }
    }

    async fn issue_commit(
        &self,
        lo: &Arc<LayoutHeader>,
        fileid: FileId,
        stateid: Stateid,
        cd: CommitData,
    ) -> Result<()> {
        let args = LayoutCommitArgs {
            fileid,
            range: cd.range,
            last_byte: crate::util::last_byte_offset(cd.range.offset,
                                                     cd.range.length),
            stateid,
            cred: cd.cred.clone(),
            written: lo.take_written_ranges(),
        };
        self.server.layoutcommit(args).await
            .inspect_err(|_| {
                // Leave the dirty state in place for the next attempt
                lo.update_last_write(cd.range.offset, cd.range.length,
                                     &cd.cred);
            })
    }

    /// Destroy the file's cached layouts without returning them, e.g. on
    /// final close of an unmodified file.
    pub async fn destroy_layout(&self, fileid: FileId, class: FileClass) {
        let Some(lo) = self.lookup(fileid, class) else { return };
        lo.invalidate_by_range(&LayoutRange::all(), IoMode::Any);
        lo.drain().await;
        if lo.is_unused() {
            self.release_header(&lo);
        }
    }

    /// Session-wide teardown after lease expiry: every cached layout on
    /// every file is forgotten.  No LAYOUTRETURN is sent; the lease's
    /// death already invalidated the state server-side.
    pub async fn destroy_all_layouts(&self) {
        let headers = std::mem::take(&mut *self.active.lock().unwrap());
        for lo in headers.iter() {
            lo.set_bulk_recall();
            lo.invalidate_by_range(&LayoutRange::all(), IoMode::Any);
        }
        for lo in headers.iter() {
            lo.drain().await;
        }
        self.headers.lock().unwrap()
            .retain(|_, h| !headers.iter().any(|lo| Arc::ptr_eq(h, lo)));
    }

    /// Which iomodes, if any, must be returned when the file closes
    pub fn return_on_close(&self, fileid: FileId, class: FileClass)
        -> Option<IoMode>
    {
        self.lookup(fileid, class).and_then(|lo| lo.roc_filter())
    }
}

// LCOV_EXCL_STOP
