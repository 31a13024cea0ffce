//! Composite device numbers
//!
//! A device number packs a major and a minor component into one fixed-width
//! value. The major selects a driver family; the minor distinguishes devices
//! within it. Range arithmetic wraps, so a range may legally cross the top of
//! the number space.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of low-order bits carrying the minor component.
pub const MINOR_BITS: u32 = 20;

/// Mask covering the minor component of a raw device number.
pub const MINOR_MASK: u64 = (1 << MINOR_BITS) - 1;

/// A composite device number
///
/// Total order follows the raw encoding: all numbers under one major sort
/// together, ordered by minor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DevNum(u64);

impl DevNum {
    /// Builds a device number from major and minor components
    ///
    /// Minor bits beyond [`MINOR_BITS`] are discarded.
    pub const fn new(major: u64, minor: u64) -> Self {
        Self((major << MINOR_BITS) | (minor & MINOR_MASK))
    }

    /// Reinterprets a raw encoded value as a device number
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw encoded value
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// Returns the major component
    pub const fn major(self) -> u64 {
        self.0 >> MINOR_BITS
    }

    /// Returns the minor component
    pub const fn minor(self) -> u64 {
        self.0 & MINOR_MASK
    }

    /// Advances by `count` numbers, wrapping at the top of the space
    pub const fn wrapping_add(self, count: u64) -> Self {
        Self(self.0.wrapping_add(count))
    }

    /// Offset of `self` from `start`, i.e. `self − start` (wrapping)
    pub const fn offset_from(self, start: DevNum) -> u64 {
        self.0.wrapping_sub(start.0)
    }

    /// Last number covered by a range of `count` starting at `self`
    ///
    /// `count` must be at least 1; a count of 1 covers only `self`.
    pub const fn last_in_range(self, count: u64) -> DevNum {
        Self(self.0.wrapping_add(count).wrapping_sub(1))
    }
}

impl fmt::Display for DevNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major(), self.minor())
    }
}
