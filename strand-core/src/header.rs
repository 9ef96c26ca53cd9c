// vim: tw=80
//! Per-file layout header: the segment cache and its acquisition, recall,
//! and commit bookkeeping.

use std::{
    cmp::Ordering::Greater,
    ops::Deref,
    sync::{Arc, Mutex, Weak},
};

use tokio::sync::Notify;

use crate::{
    segment::LayoutSegment,
    types::{
        cmp_layout, Credential, FileClass, FileId, IoMode, LayoutRange,
        Stateid,
    },
    util::end_offset,
};

/// Outcome of an acquisition attempt's cache check
#[derive(Debug)]
pub enum AcquireCheck {
    /// A cached segment satisfies the request
    Found(SegmentRef),
    /// A previous acquisition for this mode failed; don't retry until the
    /// failure is explicitly cleared
    Failed,
    /// Acquisition is suspended; wait and recheck
    Blocked,
    /// Go to the server.  `register` is set when the header holds no
    /// segments yet and must join the session-wide list so a recall can
    /// find it before the reply lands.
    Proceed {
        register: bool,
        stateid: Option<Stateid>,
    },
}

/// Write bookkeeping destined for the next LAYOUTCOMMIT
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommitData {
    pub range: LayoutRange,
    pub cred: Credential,
}

#[derive(Debug, Default)]
struct HeaderState {
    /// Valid segments, sorted descending by (offset, length, rw-first)
    segs: Vec<Arc<LayoutSegment>>,
    /// Invalidated segments still referenced by in-flight I/O
    draining: Vec<Arc<LayoutSegment>>,
    stateid: Option<Stateid>,
    barrier: u32,
    /// LAYOUTGETs issued but not yet processed
    outstanding: u32,
    /// Explicit suspensions of acquisition, e.g. for the duration of a
    /// return
    block_lgets: u32,
    bulk_recall: bool,
    fail_read: bool,
    fail_rw: bool,
    /// Modes granted with return-on-close
    roc_read: bool,
    roc_rw: bool,
    /// Dirty half-open byte range awaiting commit
    dirty: Option<(u64, u64)>,
    cred: Option<Credential>,
    /// Newly-initialized ranges harvested from invalidated segments,
    /// awaiting the next commit
    written: Vec<LayoutRange>,
}

impl HeaderState {
    fn fail_bit(&self, mode: IoMode) -> bool {
        match mode {
            IoMode::Rw => self.fail_rw,
            _ => self.fail_read,
        }
    }

    fn set_fail_bit(&mut self, mode: IoMode) {
        match mode {
            IoMode::Rw => self.fail_rw = true,
            _ => self.fail_read = true,
        }
    }

    /// May a new LAYOUTGET be issued (or a reply be accepted) right now?
    ///
    /// With a reply stateid given, the reply is also rejected when its
    /// sequence number is at or behind the recall barrier.
    fn gets_blocked(&self, stateid: Option<&Stateid>) -> bool {
        if let Some(s) = stateid {
            if self.barrier.wrapping_sub(s.seq) as i32 >= 0 {
                return true;
            }
        }
        self.block_lgets > 0 ||
            self.bulk_recall ||
            (self.segs.is_empty() && self.outstanding != 0)
    }

    /// Advance the stateid if `new` is more recent.
    ///
    /// Without a barrier update the barrier is still kept within 2^30 of
    /// the current sequence number, so wraparound never makes a live
    /// stateid look like it is behind the barrier.
    fn set_stateid(&mut self, new: Stateid, update_barrier: bool) {
        let oldseq = self.stateid.map(|s| s.seq).unwrap_or(0);
        if self.stateid.is_none() || new.newer_than(oldseq) {
            self.stateid = Some(new);
            if update_barrier {
                self.barrier = new.seq;
            } else if new.seq.wrapping_sub(self.barrier) > (3 << 29) {
                self.barrier = new.seq.wrapping_sub(1 << 30);
            }
        }
    }

    fn insert(&mut self, seg: Arc<LayoutSegment>) {
        let key = (seg.range, seg.mode);
        let pos = self.segs.iter()
            .position(|e| cmp_layout(&(e.range, e.mode), &key) != Greater)
            .unwrap_or(self.segs.len());
        self.segs.insert(pos, seg);
    }
}

/// Per-file container owning the cached segments plus acquisition, recall,
/// and commit state.  One exists per (file, class) pair; the data and
/// metadata layouts of a file are fully independent.
#[derive(Debug)]
pub struct LayoutHeader {
    pub fileid: FileId,
    pub class: FileClass,
    state: Mutex<HeaderState>,
    /// Signaled whenever acquisition may be able to proceed again
    lseg_waitq: Notify,
    /// Signaled on each final segment release
    drain_waitq: Notify,
    /// Back-reference for minting [`SegmentRef`]s
    me: Weak<LayoutHeader>,
}

impl LayoutHeader {
    pub fn new(fileid: FileId, class: FileClass) -> Arc<Self> {
        Arc::new_cyclic(|me| LayoutHeader {
            fileid,
            class,
            state: Mutex::new(HeaderState::default()),
            lseg_waitq: Notify::new(),
            drain_waitq: Notify::new(),
            me: me.clone(),
        })
    }

    /// Headers only exist behind the `Arc` minted by `new`
    fn strong(&self) -> Arc<LayoutHeader> {
        self.me.upgrade().unwrap()
    }

    /// Look up a cached segment covering the first byte of `range` in a
    /// compatible mode.  The scan stops early once the ordering key falls
    /// below the query.
    pub fn find_lseg(&self, range: &LayoutRange, mode: IoMode)
        -> Option<SegmentRef>
    {
        let st = self.state.lock().unwrap();
        self.find_locked(&st, range, mode)
    }

    fn find_locked(
        &self,
        st: &HeaderState,
        range: &LayoutRange,
        mode: IoMode,
    ) -> Option<SegmentRef> {
        let key = (*range, mode);
        for seg in st.segs.iter() {
            if seg.matches(range, mode) {
                seg.get();
                return Some(SegmentRef {
                    header: self.strong(),
                    seg: seg.clone(),
                });
            }
            if cmp_layout(&key, &(seg.range, seg.mode)) == Greater {
                break;
            }
        }
        None
    }

    /// One atomic cache check for an acquisition attempt.  On `Proceed`
    /// the outstanding counter has been incremented; the caller must
    /// balance it with [`LayoutHeader::process_reply`] or
    /// [`LayoutHeader::acquire_failed`].
    pub fn check_acquire(&self, range: &LayoutRange, mode: IoMode)
        -> AcquireCheck
    {
        let mut st = self.state.lock().unwrap();
        if let Some(r) = self.find_locked(&st, range, mode) {
            return AcquireCheck::Found(r);
        }
        if st.fail_bit(mode) {
            return AcquireCheck::Failed;
        }
        if st.gets_blocked(None) {
            return AcquireCheck::Blocked;
        }
        let register = st.segs.is_empty();
        st.outstanding += 1;
        AcquireCheck::Proceed {
            register,
            stateid: st.stateid,
        }
    }

    /// Suspend until acquisition is no longer blocked.
    pub async fn wait_acquire(&self) {
        loop {
            let notified = self.lseg_waitq.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.state.lock().unwrap().gets_blocked(None) {
                break;
            }
            notified.as_mut().await;
        }
    }

    /// Process a successful LAYOUTGET reply.  Returns `None` when the
    /// reply must be forgotten: a recall for an overlapping range won the
    /// race, or the reply stateid is already behind the recall barrier.
    /// A forgotten reply's segment is never inserted; dropping it releases
    /// its device references.
    pub fn process_reply(
        &self,
        seg: LayoutSegment,
        stateid: Stateid,
        return_on_close: bool,
        recalled: bool,
    ) -> Option<SegmentRef> {
        let seg = Arc::new(seg);
        let mut st = self.state.lock().unwrap();
        st.outstanding -= 1;
        if recalled || st.gets_blocked(Some(&stateid)) {
            tracing::debug!(fileid = %self.fileid, "forgetting layout reply");
            if !st.gets_blocked(None) {
                drop(st);
                self.lseg_waitq.notify_waiters();
            }
            let invalidated = seg.mark_invalid();
            debug_assert!(invalidated);
            let dropped = seg.put();
            debug_assert!(dropped);
            return None;
        }
        match seg.mode {
            IoMode::Rw => st.roc_rw |= return_on_close,
            _ => st.roc_read |= return_on_close,
        }
        let was_empty = st.segs.is_empty();
        seg.get();
        st.insert(seg.clone());
        st.set_stateid(stateid, false);
        let unblocked = !st.gets_blocked(None);
        drop(st);
        if was_empty || unblocked {
            self.lseg_waitq.notify_waiters();
        }
        Some(SegmentRef { header: self.strong(), seg })
    }

    /// Balance the outstanding counter after a failed acquisition and
    /// suppress further attempts for this mode.  Returns true when the
    /// header ended up with no segments at all, in which case the caller
    /// should drop it from the session-wide list.
    pub fn acquire_failed(&self, mode: IoMode) -> bool {
        let mut st = self.state.lock().unwrap();
        st.outstanding -= 1;
        st.set_fail_bit(mode);
        let empty = st.segs.is_empty();
        if empty {
            st.bulk_recall = false;
        }
        let unblocked = !st.gets_blocked(None);
        drop(st);
        if unblocked {
            self.lseg_waitq.notify_waiters();
        }
        empty
    }

    /// Invalidate every valid segment whose range intersects `range` under
    /// the mode filter.  Invalidated segments leave the collection at once;
    /// ones still referenced by in-flight I/O linger in the drain list.
    /// Returns whether anything was invalidated.
    pub fn invalidate_by_range(&self, range: &LayoutRange, filter: IoMode)
        -> bool
    {
        let mut freed = Vec::new();
        let mut any = false;
        {
            let mut st = self.state.lock().unwrap();
            let mut i = 0;
            while i < st.segs.len() {
                let seg = &st.segs[i];
                if filter.filter(seg.mode) &&
                    seg.range.intersects(range)
                {
                    any = true;
                    let seg = st.segs.remove(i);
                    // The payload dies with the segment; keep its
                    // commit-list contribution alive in the header
                    let harvested = seg.payload.take_written_ranges();
                    st.written.extend(harvested);
                    if seg.mark_invalid() {
                        if seg.put() {
                            freed.push(seg);
                        } else {
                            st.draining.push(seg);
                        }
                    }
                } else {
                    i += 1;
                }
            }
            if st.segs.is_empty() && st.draining.is_empty() {
                st.bulk_recall = false;
            }
        }
        // Payload teardown happens here, after the lock is gone
        drop(freed);
        if any {
            self.drain_waitq.notify_waiters();
        }
        any
    }

    /// Wait until no invalidated segment is referenced by in-flight I/O.
    pub async fn drain(&self) {
        loop {
            let notified = self.drain_waitq.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state.lock().unwrap().draining.is_empty() {
                break;
            }
            notified.as_mut().await;
        }
    }

    /// Called on each final segment reference release.
    fn put_lseg(&self, seg: &Arc<LayoutSegment>) {
        if !seg.put() {
            return;
        }
        debug_assert!(!seg.is_valid());
        {
            let mut st = self.state.lock().unwrap();
            st.draining.retain(|d| !Arc::ptr_eq(d, seg));
            if st.segs.is_empty() && st.draining.is_empty() {
                st.bulk_recall = false;
            }
        }
        self.drain_waitq.notify_waiters();
        self.lseg_waitq.notify_waiters();
    }

    /// Record a recall's stateid, advancing the barrier so late replies
    /// with older stateids are rejected.
    pub fn set_recall_stateid(&self, stateid: Stateid) {
        self.state.lock().unwrap().set_stateid(stateid, true);
    }

    /// Enter bulk-recall mode: all acquisition stops until every segment
    /// is gone.
    pub fn set_bulk_recall(&self) {
        self.state.lock().unwrap().bulk_recall = true;
    }

    /// Suspend acquisition, e.g. for the duration of a LAYOUTRETURN.
    pub fn block_gets(&self) {
        self.state.lock().unwrap().block_lgets += 1;
    }

    pub fn unblock_gets(&self) {
        let mut st = self.state.lock().unwrap();
        st.block_lgets -= 1;
        let unblocked = !st.gets_blocked(None);
        drop(st);
        if unblocked {
            self.lseg_waitq.notify_waiters();
        }
    }

    /// Allow acquisition for both modes to be retried after earlier
    /// failures.
    pub fn clear_fail_bits(&self) {
        let mut st = self.state.lock().unwrap();
        st.fail_read = false;
        st.fail_rw = false;
    }

    /// Allow acquisition for one mode to be retried, leaving the other
    /// mode's failure latched.
    pub fn clear_fail_bit(&self, mode: IoMode) {
        let mut st = self.state.lock().unwrap();
        match mode {
            IoMode::Rw => st.fail_rw = false,
            _ => st.fail_read = false,
        }
    }

    pub fn stateid(&self) -> Option<Stateid> {
        self.state.lock().unwrap().stateid
    }

    pub fn has_segments(&self) -> bool {
        !self.state.lock().unwrap().segs.is_empty()
    }

    pub fn is_unused(&self) -> bool {
        let st = self.state.lock().unwrap();
        st.segs.is_empty() && st.draining.is_empty() && st.outstanding == 0
    }

    /// Extend the dirty range after a completed layout write and capture
    /// the credential the commit will be issued under.
    pub fn update_last_write(
        &self,
        offset: u64,
        length: u64,
        cred: &Credential,
    ) {
        let mut st = self.state.lock().unwrap();
        let end = end_offset(offset, length);
        st.dirty = Some(match st.dirty {
            Some((b, e)) => (b.min(offset), e.max(end)),
            None => (offset, end),
        });
        if st.cred.is_none() {
            st.cred = Some(cred.clone());
        }
    }

    /// Drain every newly-initialized range list, both the live segments'
    /// and those harvested from segments invalidated before the commit,
    /// for the next commit to report.
    pub fn take_written_ranges(&self) -> Vec<LayoutRange> {
        let mut st = self.state.lock().unwrap();
        let mut out = std::mem::take(&mut st.written);
        for seg in st.segs.iter().chain(st.draining.iter()) {
            out.extend(seg.payload.take_written_ranges());
        }
        out
    }

    /// Take the pending commit bookkeeping, if any, clearing it.
    pub fn take_commit_data(&self) -> Option<CommitData> {
        let mut st = self.state.lock().unwrap();
        let (begin, end) = st.dirty.take()?;
        let cred = st.cred.take()?;
        Some(CommitData {
            range: LayoutRange::new(begin, end - begin),
            cred,
        })
    }

    /// The modes granted with return-on-close, as an invalidation filter:
    /// `None` when nothing needs returning at close.
    pub fn roc_filter(&self) -> Option<IoMode> {
        let st = self.state.lock().unwrap();
        match (st.roc_read, st.roc_rw) {
            (true, true) => Some(IoMode::Any),
            (true, false) => Some(IoMode::Read),
            (false, true) => Some(IoMode::Rw),
            (false, false) => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn barrier(&self) -> u32 {
        self.state.lock().unwrap().barrier
    }

    #[cfg(test)]
    pub(crate) fn sorted_keys(&self) -> Vec<(LayoutRange, IoMode)> {
        self.state.lock().unwrap().segs.iter()
            .map(|s| (s.range, s.mode))
            .collect()
    }
}

/// A counted reference to a cached segment.  Cloning takes another
/// reference; dropping the last one (after invalidation) tears the segment
/// down and wakes any drain waiter.
#[derive(Debug)]
pub struct SegmentRef {
    header: Arc<LayoutHeader>,
    seg: Arc<LayoutSegment>,
}

impl SegmentRef {
    pub fn header(&self) -> &Arc<LayoutHeader> {
        &self.header
    }

    pub fn segment(&self) -> &Arc<LayoutSegment> {
        &self.seg
    }
}

impl Clone for SegmentRef {
    fn clone(&self) -> Self {
        self.seg.get();
        SegmentRef {
            header: self.header.clone(),
            seg: self.seg.clone(),
        }
    }
}

impl Deref for SegmentRef {
    type Target = LayoutSegment;

    fn deref(&self) -> &LayoutSegment {
        &self.seg
    }
}

impl Drop for SegmentRef {
    fn drop(&mut self) {
        self.header.put_lseg(&self.seg);
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
use pretty_assertions::assert_eq;
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

use crate::segment::t::stub_payload;
use super::*;

fn header() -> Arc<LayoutHeader> {
    LayoutHeader::new(FileId(42), FileClass::Data)
}

fn seg(offset: u64, length: u64, mode: IoMode) -> LayoutSegment {
    LayoutSegment::new(LayoutRange::new(offset, length), mode,
        stub_payload())
}

fn sid(seq: u32) -> Stateid {
    Stateid::new(seq, [7; 12])
}

/// Insert a segment the way a successful acquisition would.  When the
/// cache already satisfies the range, the server is never asked and the
/// cached segment is returned instead.
fn grant(lo: &Arc<LayoutHeader>, offset: u64, length: u64, mode: IoMode,
         seq: u32) -> SegmentRef
{
    match lo.check_acquire(&LayoutRange::new(offset, length), mode) {
        AcquireCheck::Found(r) => r,
        AcquireCheck::Proceed { .. } => {
            lo.process_reply(seg(offset, length, mode), sid(seq), false,
                             false)
                .unwrap()
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn find_prefers_rw_at_equal_range() {
    let lo = header();
    let _ro = grant(&lo, 0, 8192, IoMode::Read, 1);
    let _rw = grant(&lo, 0, 8192, IoMode::Rw, 2);
    let found = lo.find_lseg(&LayoutRange::new(0, 100), IoMode::Read)
        .unwrap();
    assert_eq!(found.mode, IoMode::Rw);
}

#[test]
fn find_first_byte_only() {
    let lo = header();
    let _r = grant(&lo, 4096, 4096, IoMode::Rw, 1);
    // A query starting inside the segment matches even when it extends
    // past the end
    assert!(lo.find_lseg(&LayoutRange::new(8000, 1 << 20), IoMode::Rw)
        .is_some());
    assert!(lo.find_lseg(&LayoutRange::new(0, 8192), IoMode::Rw)
        .is_none());
}

#[test]
fn invalidate_then_lookup() {
    let lo = header();
    let r = grant(&lo, 0, 65536, IoMode::Rw, 1);
    drop(r);
    assert!(lo.invalidate_by_range(&LayoutRange::new(4096, 1), IoMode::Any));
    assert!(lo.find_lseg(&LayoutRange::new(0, 100), IoMode::Any)
        .is_none());
    assert!(lo.find_lseg(&LayoutRange::new(60000, 1), IoMode::Read)
        .is_none());
    // Nothing left to invalidate
    assert!(!lo.invalidate_by_range(&LayoutRange::all(), IoMode::Any));
    // A fresh grant is visible again
    let _r2 = grant(&lo, 0, 65536, IoMode::Rw, 2);
    assert!(lo.find_lseg(&LayoutRange::new(0, 100), IoMode::Any)
        .is_some());
}

#[test]
fn invalidate_respects_mode_filter() {
    let lo = header();
    let _ro = grant(&lo, 0, 8192, IoMode::Read, 1);
    let _rw = grant(&lo, 0, 8192, IoMode::Rw, 2);
    assert!(lo.invalidate_by_range(&LayoutRange::all(), IoMode::Read));
    assert!(lo.find_lseg(&LayoutRange::new(0, 1), IoMode::Rw).is_some());
    assert!(lo.find_lseg(&LayoutRange::new(0, 1), IoMode::Read).is_some());
}

#[test]
fn ordering_invariant_randomized() {
    let mut rng = XorShiftRng::seed_from_u64(0x5eed);
    let lo = header();
    let mut refs = Vec::new();
    let mut seq = 0;
    for _ in 0..100 {
        let offset = u64::from(rng.gen_range(0..64u32)) * 4096;
        let length = u64::from(rng.gen_range(1..32u32)) * 4096;
        let mode = if rng.gen_bool(0.5) {
            IoMode::Rw
        } else {
            IoMode::Read
        };
        seq += 1;
        refs.push(grant(&lo, offset, length, mode, seq));
        let keys = lo.sorted_keys();
        for w in keys.windows(2) {
            assert_ne!(cmp_layout(&w[0], &w[1]), std::cmp::Ordering::Less,
                "collection out of order: {:?} before {:?}", w[0], w[1]);
        }
    }
}

#[tokio::test]
async fn refcount_conservation_concurrent() {
    let lo = header();
    let r = grant(&lo, 0, 1 << 20, IoMode::Rw, 1);
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let r2 = r.clone();
        tasks.push(tokio::spawn(async move {
            let mut rng = XorShiftRng::from_entropy();
            let mut held = vec![r2];
            for _ in 0..1000 {
                if rng.gen_bool(0.5) {
                    let c = held[rng.gen_range(0..held.len())].clone();
                    held.push(c);
                } else if held.len() > 1 {
                    let i = rng.gen_range(0..held.len());
                    drop(held.swap_remove(i));
                }
            }
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }
    // Every task's references are gone; only ours and the collection's
    // remain.
    assert_eq!(r.segment().refcount(), 2);
    lo.invalidate_by_range(&LayoutRange::all(), IoMode::Any);
    assert_eq!(r.segment().refcount(), 1);
    drop(r);
    assert!(lo.is_unused());
}

#[test]
fn stale_reply_is_forgotten() {
    let lo = header();
    let _r = grant(&lo, 0, 4096, IoMode::Rw, 10);
    // A recall advances the barrier past the granted stateid
    lo.set_recall_stateid(sid(11));
    match lo.check_acquire(&LayoutRange::new(8192, 1), IoMode::Rw) {
        AcquireCheck::Proceed { .. } => (),
        other => panic!("unexpected {other:?}"),
    }
    // The late reply carries a stateid at the barrier, so it must be
    // forgotten rather than inserted
    assert!(lo.process_reply(seg(8192, 4096, IoMode::Rw), sid(11),
                             false, false).is_none());
    assert!(lo.find_lseg(&LayoutRange::new(8192, 1), IoMode::Rw)
        .is_none());
}

#[test]
fn recall_race_forgets_reply() {
    let lo = header();
    match lo.check_acquire(&LayoutRange::all(), IoMode::Rw) {
        AcquireCheck::Proceed { register, .. } => assert!(register),
        other => panic!("unexpected {other:?}"),
    }
    assert!(lo.process_reply(seg(0, 4096, IoMode::Rw), sid(1), false,
                             true).is_none());
    assert!(!lo.has_segments());
}

#[test]
fn empty_header_with_outstanding_blocks_gets() {
    let lo = header();
    match lo.check_acquire(&LayoutRange::all(), IoMode::Rw) {
        AcquireCheck::Proceed { .. } => (),
        other => panic!("unexpected {other:?}"),
    }
    // A second attempt while the first is in flight must wait
    match lo.check_acquire(&LayoutRange::new(1 << 30, 1), IoMode::Rw) {
        AcquireCheck::Blocked => (),
        other => panic!("unexpected {other:?}"),
    }
    let _r = lo.process_reply(seg(0, 4096, IoMode::Rw), sid(1), false,
                              false).unwrap();
    match lo.check_acquire(&LayoutRange::new(1 << 30, 1), IoMode::Rw) {
        AcquireCheck::Proceed { register, .. } => assert!(!register),
        other => panic!("unexpected {other:?}"),
    }
    lo.acquire_failed(IoMode::Rw);
}

#[test]
fn fail_bit_suppresses_retry() {
    let lo = header();
    match lo.check_acquire(&LayoutRange::all(), IoMode::Rw) {
        AcquireCheck::Proceed { .. } => (),
        other => panic!("unexpected {other:?}"),
    }
    assert!(lo.acquire_failed(IoMode::Rw));
    match lo.check_acquire(&LayoutRange::all(), IoMode::Rw) {
        AcquireCheck::Failed => (),
        other => panic!("unexpected {other:?}"),
    }
    // The other mode is unaffected
    match lo.check_acquire(&LayoutRange::all(), IoMode::Read) {
        AcquireCheck::Proceed { .. } => (),
        other => panic!("unexpected {other:?}"),
    }
    lo.acquire_failed(IoMode::Read);
    lo.clear_fail_bits();
    match lo.check_acquire(&LayoutRange::all(), IoMode::Rw) {
        AcquireCheck::Proceed { .. } => (),
        other => panic!("unexpected {other:?}"),
    }
    lo.acquire_failed(IoMode::Rw);
}

#[test]
fn stateid_only_advances() {
    let lo = header();
    let _a = grant(&lo, 0, 4096, IoMode::Rw, 5);
    let _b = grant(&lo, 8192, 4096, IoMode::Rw, 3);
    assert_eq!(lo.stateid(), Some(sid(5)));
    let _c = grant(&lo, 16384, 4096, IoMode::Rw, 6);
    assert_eq!(lo.stateid(), Some(sid(6)));
}

#[test]
fn barrier_rebase_near_wraparound() {
    let lo = header();
    lo.set_recall_stateid(sid(0x10));
    assert_eq!(lo.barrier(), 0x10);
    // An accepted stateid more than 3 * 2^29 ahead of the barrier drags
    // the barrier to within 2^30 of it, so later wraparound can't make a
    // live stateid look stale.
    let seq = 0x7000_0000;
    let _r = grant(&lo, 0, 4096, IoMode::Rw, seq);
    assert_eq!(lo.barrier(), seq - (1 << 30));
}

#[tokio::test]
async fn drain_waits_for_inflight_refs() {
    let lo = header();
    let r = grant(&lo, 0, 4096, IoMode::Rw, 1);
    let inflight = r.clone();
    drop(r);
    assert!(lo.invalidate_by_range(&LayoutRange::all(), IoMode::Any));
    let lo2 = lo.clone();
    let waiter = tokio::spawn(async move {
        lo2.drain().await;
    });
    tokio::task::yield_now().await;
    assert!(!waiter.is_finished());
    drop(inflight);
    waiter.await.unwrap();
    assert!(lo.is_unused());
}

#[test]
fn wait_acquire_pends_until_unblocked() {
    use std::{future::Future, pin::pin};

    use futures_test::task::noop_context;

    let lo = header();
    lo.block_gets();
    let mut ctx = noop_context();
    let mut fut = pin!(lo.wait_acquire());
    assert!(fut.as_mut().poll(&mut ctx).is_pending());
    lo.unblock_gets();
    assert!(fut.as_mut().poll(&mut ctx).is_ready());
}

#[test]
fn commit_data_round_trip() {
    let lo = header();
    assert!(lo.take_commit_data().is_none());
    let cred = Credential("writer".to_string());
    lo.update_last_write(8192, 100, &cred);
    lo.update_last_write(0, 50, &cred);
    let cd = lo.take_commit_data().unwrap();
    assert_eq!(cd.range, LayoutRange::new(0, 8292));
    assert_eq!(cd.cred, cred);
    assert!(lo.take_commit_data().is_none());
}

#[test]
fn roc_accumulates_modes() {
    let lo = header();
    assert_eq!(lo.roc_filter(), None);
    match lo.check_acquire(&LayoutRange::all(), IoMode::Read) {
        AcquireCheck::Proceed { .. } => (),
        other => panic!("unexpected {other:?}"),
    }
    let _r = lo.process_reply(seg(0, 4096, IoMode::Read), sid(1), true,
                              false).unwrap();
    assert_eq!(lo.roc_filter(), Some(IoMode::Read));
    let _w = grant(&lo, 0, 4096, IoMode::Rw, 2);
    assert_eq!(lo.roc_filter(), Some(IoMode::Read));
    match lo.check_acquire(&LayoutRange::new(8192, 1), IoMode::Rw) {
        AcquireCheck::Proceed { .. } => (),
        other => panic!("unexpected {other:?}"),
    }
    let _w2 = lo.process_reply(seg(8192, 4096, IoMode::Rw), sid(3), true,
                               false).unwrap();
    assert_eq!(lo.roc_filter(), Some(IoMode::Any));
}
}
// LCOV_EXCL_STOP
