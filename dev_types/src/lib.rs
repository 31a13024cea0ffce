//! # Device Types
//!
//! This crate defines the fundamental types of the device-number layer.
//!
//! ## Philosophy
//!
//! - **Explicit over implicit**: device numbers are a dedicated type, not a
//!   bare integer that happens to be split in two.
//! - **Type safety first**: the major/minor projection lives with the type,
//!   so callers cannot shift by the wrong bit count.
//! - **No ambient authority**: a driver stays reachable only while its
//!   lifetime token grants holds.
//!
//! ## Key Types
//!
//! - [`DevNum`]: a composite device number (major + minor)
//! - [`DriverToken`]: a revocable lifetime token for a driver
//! - [`DriverHold`]: an RAII hold on a driver's token

pub mod num;
pub mod token;

pub use num::{DevNum, MINOR_BITS, MINOR_MASK};
pub use token::{DriverHold, DriverToken};
