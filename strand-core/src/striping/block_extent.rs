// vim: tw=80
//! Block-extent interval mapping
//!
//! The block driver's layout payload is a set of disjoint extents mapping
//! file byte ranges onto a volume.  Read-write and uninitialized extents
//! share one sorted list; read-only extents and holes share another, so a
//! sector can simultaneously have an uninitialized write mapping and a
//! read-only source to copy from.  Writes into uninitialized extents are
//! tracked at a fixed aligned granularity so a later commit can report
//! exactly which blocks became live.

use std::collections::BTreeMap;

use crate::{
    striping::SubRequest,
    types::{Error, LayoutRange, Result},
    util::end_offset,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExtentState {
    /// Mapped and initialized; readable and writable
    ReadWrite,
    /// Mapped but uninitialized; writable, reads see zeros (or a read-only
    /// source if one covers the range)
    Invalid,
    /// Mapped, initialized, read-only
    ReadOnly,
    /// A hole; reads see zeros
    None,
}

impl ExtentState {
    /// Which of the two lists does an extent of this state live in?
    fn is_write_list(self) -> bool {
        matches!(self, ExtentState::ReadWrite | ExtentState::Invalid)
    }
}

/// One contiguous mapping with uniform state
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Extent {
    pub f_offset: u64,
    pub length: u64,
    /// Byte offset on the volume.  Meaningless for holes.
    pub v_offset: u64,
    pub state: ExtentState,
}

impl Extent {
    fn end(&self) -> u64 {
        end_offset(self.f_offset, self.length)
    }

    fn contains(&self, offset: u64) -> bool {
        self.f_offset <= offset && offset < self.end()
    }

    /// Can `other` be absorbed into `self` without changing any byte's
    /// mapping?  Holds for same-state extents whose volume mappings line up
    /// (holes have no mapping to line up).
    fn consistent(&self, other: &Extent) -> bool {
        self.state == other.state &&
            (self.state == ExtentState::None ||
             other.v_offset.wrapping_sub(self.v_offset) ==
                other.f_offset.wrapping_sub(self.f_offset))
    }

    /// Volume offset backing file offset `offset`
    fn v_of(&self, offset: u64) -> u64 {
        debug_assert!(self.contains(offset));
        self.v_offset + (offset - self.f_offset)
    }
}

/// The two sorted extent lists of one block-driver segment
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ExtentMap {
    /// ReadWrite and Invalid extents, sorted by `f_offset`
    write_list: Vec<Extent>,
    /// ReadOnly and None extents, sorted by `f_offset`
    read_list: Vec<Extent>,
}

impl ExtentMap {
    pub fn new() -> Self {
        ExtentMap::default()
    }

    /// Insert an extent, merging with consistent neighbors and truncating
    /// anything else it overlaps.  Exactly one extent covers any sector of
    /// a list afterwards.
    pub fn add(&mut self, new: Extent) -> Result<()> {
        if new.length == 0 {
            return Err(Error::Invalid);
        }
        let list = if new.state.is_write_list() {
            &mut self.write_list
        } else {
            &mut self.read_list
        };
        Self::add_to(list, new);
        Ok(())
    }

    fn add_to(list: &mut Vec<Extent>, mut new: Extent) {
        // Evict the overlapped portions of inconsistent extents first
        let mut i = 0;
        while i < list.len() {
            let old = list[i];
            if old.f_offset >= new.end() {
                break;
            }
            if old.end() <= new.f_offset || old.consistent(&new) {
                i += 1;
                continue;
            }
            // Overlap with a different mapping: keep only the parts of the
            // old extent outside the new one
            list.remove(i);
            if old.f_offset < new.f_offset {
                let head = Extent {
                    length: new.f_offset - old.f_offset,
                    .. old
                };
                list.insert(i, head);
                i += 1;
            }
            if old.end() > new.end() {
                let tail = Extent {
                    f_offset: new.end(),
                    length: old.end() - new.end(),
                    v_offset: old.v_offset + (new.end() - old.f_offset),
                    state: old.state,
                };
                list.insert(i, tail);
            }
        }
        // Absorb consistent extents that touch or overlap the new one
        let mut i = 0;
        while i < list.len() {
            let old = list[i];
            if old.f_offset > new.end() {
                break;
            }
            if old.end() < new.f_offset || !old.consistent(&new) {
                i += 1;
                continue;
            }
            let start = old.f_offset.min(new.f_offset);
            let end = old.end().max(new.end());
            new = Extent {
                f_offset: start,
                length: end - start,
                v_offset: if new.state == ExtentState::None {
                    0
                } else {
                    new.v_offset - (new.f_offset - start)
                },
                state: new.state,
            };
            list.remove(i);
        }
        let pos = list.iter()
            .position(|e| e.f_offset > new.f_offset)
            .unwrap_or(list.len());
        list.insert(pos, new);
    }

    /// Find the extent covering `offset`.
    ///
    /// Prefers the write list; when the covering write extent is
    /// uninitialized, also returns the read-list extent covering the same
    /// offset, if any, as the copy-on-write read source.
    pub fn find(&self, offset: u64) -> Option<(Extent, Option<Extent>)> {
        let w = self.write_list.iter().find(|e| e.contains(offset));
        match w {
            Some(e) if e.state == ExtentState::Invalid => {
                let cow = self.read_list.iter()
                    .find(|r| r.contains(offset))
                    .copied();
                Some((*e, cow))
            }
            Some(e) => Some((*e, None)),
            None => self.read_list.iter()
                .find(|e| e.contains(offset))
                .map(|e| (*e, None)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.write_list.is_empty() && self.read_list.is_empty()
    }

    /// Translate a read into sub-requests.  Blocks of uninitialized
    /// extents already written through the layout read back from the
    /// volume; the rest falls back to the copy-on-write source, or to a
    /// local zero-fill.
    pub fn place_read(&self, offset: u64, length: u64,
                      tracker: &InitTracker)
        -> Result<Vec<SubRequest>>
    {
        let mut subs = Vec::new();
        let mut cur = offset;
        let mut remaining = length;
        while remaining > 0 {
            let (ext, cow) = self.find(cur).ok_or(Error::Invalid)?;
            let chunk = remaining.min(ext.end() - cur);
            let sub = match ext.state {
                ExtentState::ReadWrite | ExtentState::ReadOnly =>
                    SubRequest::io(0, 0, ext.v_of(cur), chunk),
                ExtentState::Invalid => {
                    // Run of tracker blocks with the same written state
                    let written = tracker.is_written(cur);
                    let step = tracker.step;
                    let mut end = (cur / step + 1) * step;
                    while end < cur + chunk &&
                        tracker.is_written(end) == written
                    {
                        end += step;
                    }
                    let run = end.min(cur + chunk) - cur;
                    if written {
                        SubRequest::io(0, 0, ext.v_of(cur), run)
                    } else {
                        match cow {
                            Some(s) => {
                                let run = run.min(s.end() - cur);
                                SubRequest::io(0, 0, s.v_of(cur), run)
                            }
                            None => SubRequest::zero(run),
                        }
                    }
                }
                ExtentState::None => SubRequest::zero(chunk),
            };
            cur += sub.length;
            remaining -= sub.length;
            subs.push(sub);
        }
        Ok(subs)
    }

    /// Translate a write into sub-requests.  Only writable extents may be
    /// targeted.
    pub fn place_write(&self, offset: u64, length: u64)
        -> Result<Vec<SubRequest>>
    {
        let mut subs = Vec::new();
        let mut cur = offset;
        let mut remaining = length;
        while remaining > 0 {
            let (ext, _) = self.find(cur).ok_or(Error::Invalid)?;
            if !ext.state.is_write_list() {
                return Err(Error::Invalid);
            }
            let chunk = remaining.min(ext.end() - cur);
            subs.push(SubRequest::io(0, 0, ext.v_of(cur), chunk));
            cur += chunk;
            remaining -= chunk;
        }
        Ok(subs)
    }

    /// Does any uninitialized extent intersect `[offset, offset+length)`?
    pub fn writes_need_tracking(&self, offset: u64, length: u64) -> bool {
        let range = LayoutRange::new(offset, length);
        self.write_list.iter().any(|e| {
            e.state == ExtentState::Invalid &&
                range.intersects(&LayoutRange::new(e.f_offset, e.length))
        })
    }
}

/// Records which aligned blocks of uninitialized extents have been written,
/// for the next commit to report.
#[derive(Debug)]
pub struct InitTracker {
    /// Tracking granularity in bytes; a power of two
    step: u64,
    written: BTreeMap<u64, u64>,
}

impl InitTracker {
    pub fn new(step: u64) -> Self {
        debug_assert!(step.is_power_of_two());
        InitTracker { step, written: BTreeMap::new() }
    }

    /// Mark every aligned block touched by `[offset, offset+length)` as
    /// written.
    pub fn mark_written(&mut self, offset: u64, length: u64) {
        debug_assert!(length > 0);
        let first = offset / self.step * self.step;
        let mut cur = first;
        let end = end_offset(offset, length);
        while cur < end {
            self.written.insert(cur, self.step);
            cur += self.step;
        }
    }

    pub fn is_written(&self, offset: u64) -> bool {
        let block = offset / self.step * self.step;
        self.written.contains_key(&block)
    }

    /// Extract the written ranges, merged, clearing the tracker.  These are
    /// the ranges the next commit must report as newly initialized.
    pub fn take_ranges(&mut self) -> Vec<LayoutRange> {
        let mut out: Vec<LayoutRange> = Vec::new();
        for (&off, &len) in self.written.iter() {
            match out.last_mut() {
                Some(last) if last.end() == off => last.length += len,
                _ => out.push(LayoutRange::new(off, len)),
            }
        }
        self.written.clear();
        out
    }
}

// LCOV_EXCL_STOP
