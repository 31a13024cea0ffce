//! # Concurrency Test Utilities
//!
//! This crate provides shared helpers for the device-number directory's
//! integration tests.
//!
//! ## Test Philosophy
//!
//! - **Safety under teardown**: a lookup that already selected a claim must
//!   finish even if the claim is withdrawn meanwhile.
//! - **Ordering is the contract**: narrowest-claim-wins and the scan's
//!   early exit are observable behavior, pinned by tests.
//! - **No invented schedulers**: scenarios use plain threads and channels.

use dev_types::DevNum;
use device_directory::{DeviceDirectory, ProbeTable, ResolveFn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Bootstrap helper for tests
///
/// Creates a directory over a fresh caller-owned lock, with a base resolve
/// that always declines.
pub fn test_directory() -> (DeviceDirectory<String>, Arc<Mutex<ProbeTable<String>>>) {
    let lock = Arc::new(Mutex::new(ProbeTable::new()));
    let directory = DeviceDirectory::init(Arc::new(|_, _| None), Arc::clone(&lock))
        .expect("initialize directory");
    (directory, lock)
}

/// A resolve callback that always produces `handle`
pub fn resolver(handle: &str) -> ResolveFn<String> {
    let handle = handle.to_string();
    Arc::new(move |_, _| Some(handle.clone()))
}

/// A resolve callback that counts invocations and produces `handle`
pub fn counting_resolver(handle: &str, calls: Arc<AtomicUsize>) -> ResolveFn<String> {
    let handle = handle.to_string();
    Arc::new(move |_, _| {
        calls.fetch_add(1, Ordering::SeqCst);
        Some(handle.clone())
    })
}

/// A resolve callback that counts invocations and always declines
pub fn declining_resolver(calls: Arc<AtomicUsize>) -> ResolveFn<String> {
    Arc::new(move |_, _| {
        calls.fetch_add(1, Ordering::SeqCst);
        None
    })
}

/// A device number under `major` for scenario readability
pub fn dev(major: u64, minor: u64) -> DevNum {
    DevNum::new(major, minor)
}
