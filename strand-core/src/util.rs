// vim: tw=80
//! Miscellaneous utility functions

use std::hash::BuildHasherDefault;
use metrohash::MetroHash64;

use crate::types::LENGTH_EOF;

/// Transparent storage unit assumed by every layout driver.  Stripe units
/// and block extents must be multiples of this.
pub const BYTES_PER_PAGE: usize = 4096;

/// LBA of a page boundary, from a byte offset
pub fn page_of(offset: u64) -> u64 {
    offset & !(BYTES_PER_PAGE as u64 - 1)
}

pub fn is_page_aligned(v: u64) -> bool {
    v & (BYTES_PER_PAGE as u64 - 1) == 0
}

/// One byte past the end of a range, saturating at infinity.  An infinite
/// length always yields an infinite end, regardless of offset.
pub fn end_offset(offset: u64, length: u64) -> u64 {
    if length == LENGTH_EOF {
        LENGTH_EOF
    } else {
        offset.saturating_add(length)
    }
}

/// Offset of the last byte of a nonempty range, saturating at infinity
pub fn last_byte_offset(offset: u64, length: u64) -> u64 {
    debug_assert!(length > 0);
    if length == LENGTH_EOF {
        LENGTH_EOF
    } else {
        offset.saturating_add(length - 1)
    }
}

/// Divide two unsigned numbers (usually integers), rounding up.
pub fn div_roundup<T>(dividend: T, divisor: T) -> T
    where T: std::ops::Add<Output=T> + Copy + std::ops::Div<Output=T> +
             From<u8> + std::ops::Sub<Output=T>
{
    (dividend + divisor - T::from(1u8)) / divisor
}

/// Create a hashmap with the given capacity using MetroHash64
pub fn new_metro_hashmap<K, V>(capacity: usize)
    -> std::collections::HashMap<K, V, BuildHasherDefault<MetroHash64>>
    where K: std::hash::Hash + Eq
{
    std::collections::HashMap::with_capacity_and_hasher(
        capacity,
        BuildHasherDefault::<MetroHash64>::default()
    )
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
use pretty_assertions::assert_eq;
use super::*;

#[test]
fn end_offset_saturates() {
    assert_eq!(end_offset(0, 100), 100);
    assert_eq!(end_offset(8, LENGTH_EOF), LENGTH_EOF);
    assert_eq!(end_offset(u64::MAX - 1, 100), u64::MAX);
}

#[test]
fn last_byte() {
    assert_eq!(last_byte_offset(4096, 4096), 8191);
    assert_eq!(last_byte_offset(4096, LENGTH_EOF), LENGTH_EOF);
}

#[test]
fn test_div_roundup() {
    assert_eq!(div_roundup(5u64, 2u64), 3u64);
    assert_eq!(div_roundup(4u64, 2u64), 2u64);
}

#[test]
fn pages() {
    assert_eq!(page_of(4097), 4096);
    assert!(is_page_aligned(65536));
    assert!(!is_page_aligned(65537));
}
}
// LCOV_EXCL_STOP
