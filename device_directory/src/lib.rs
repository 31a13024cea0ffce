//! # Device Directory
//!
//! This crate implements the directory that maps ranges of device numbers to
//! registered drivers. Drivers claim a contiguous range and supply a resolve
//! callback; lookups walk the claims covering a number and ask the most
//! specific willing driver for a live handle.
//!
//! ## Philosophy
//!
//! - **Claims, not tables**: a driver registers a range once; nothing
//!   requires every possible number to be known in advance.
//! - **Callbacks run unlocked**: the directory lock is released before any
//!   driver resolve callback runs. Resolve code may block, allocate, or
//!   call back into the directory.
//! - **Tokens pin drivers**: a driver being torn down concurrently with a
//!   lookup is protected by its lifetime token, not by staying in the
//!   table.
//!
//! Overlapping claims are legal; the narrowest covering claim is consulted
//! first. A sentinel claim covering the whole space backs every bucket, so a
//! lookup always terminates even when no driver answers.

use dev_types::{DevNum, DriverHold, DriverToken};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Number of buckets in the probe table
///
/// Majors hash into buckets by `major mod 255`; distinct majors sharing a
/// bucket merely share a chain.
pub const BUCKET_COUNT: usize = 255;

/// Resolve callback: device number and offset within the claimed range, to
/// an optional live handle. Driver context travels by closure capture.
pub type ResolveFn<H> = Arc<dyn Fn(DevNum, u64) -> Option<H> + Send + Sync>;

/// Guard callback: lets a driver veto a lookup before a handle is resolved.
/// Runs under the directory lock, so it must be quick and must not call
/// back into the directory.
pub type GuardFn = Arc<dyn Fn(DevNum) -> bool + Send + Sync>;

/// Errors surfaced by directory operations
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// Storage for probe entries could not be reserved
    #[error("out of memory while reserving {0} probe entries")]
    OutOfMemory(usize),
    /// A registration must claim at least one device number
    #[error("probe range must cover at least one device number")]
    EmptyRange,
}

/// One registered claim over a range of device numbers
///
/// A registration spanning several majors materializes as one entry per
/// major, every entry stamped with the as-registered, unnarrowed range.
struct ProbeEntry<H> {
    dev: DevNum,
    range: u64,
    owner: DriverToken,
    resolve: ResolveFn<H>,
    guard: Option<GuardFn>,
}

impl<H> ProbeEntry<H> {
    fn covers(&self, dev: DevNum) -> bool {
        self.dev <= dev && dev <= self.dev.last_in_range(self.range)
    }
}

/// The bucket array behind a directory
///
/// Owned by the collaborator that also owns the lock around it; the
/// directory only ever reaches the table through that lock. Within a bucket,
/// entries are kept in non-decreasing range order.
pub struct ProbeTable<H> {
    buckets: Vec<Vec<Arc<ProbeEntry<H>>>>,
}

impl<H> ProbeTable<H> {
    /// Creates an empty table; [`DeviceDirectory::init`] populates it
    pub fn new() -> Self {
        Self {
            buckets: Vec::new(),
        }
    }
}

impl<H> Default for ProbeTable<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// A successful lookup: the handle and the offset of the looked-up number
/// within the winning claim's range
#[derive(Debug)]
pub struct Resolved<H> {
    /// The live handle produced by the driver
    pub handle: H,
    /// `looked-up number - claim start`
    pub index: u64,
}

/// Candidate captured under the lock, consumed after it is released
struct Candidate<H> {
    hold: DriverHold,
    resolve: ResolveFn<H>,
    index: u64,
}

/// The device-number directory
///
/// Cheap to clone; clones share the same table and lock.
pub struct DeviceDirectory<H> {
    table: Arc<Mutex<ProbeTable<H>>>,
    base: Arc<ProbeEntry<H>>,
}

impl<H> Clone for DeviceDirectory<H> {
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
            base: Arc::clone(&self.base),
        }
    }
}

impl<H> DeviceDirectory<H> {
    /// Initializes a directory over a caller-owned probe table lock
    ///
    /// Builds the sentinel claim (`dev = 1`, maximal range, no guard) and
    /// fills all 255 buckets with it, replacing whatever the table held.
    /// The sentinel's token is held by the directory and never revoked, so
    /// every lookup traverses a non-degenerate chain and terminates on the
    /// sentinel when no driver answers.
    ///
    /// On allocation failure nothing is published to the table.
    pub fn init(
        base_resolve: ResolveFn<H>,
        lock: Arc<Mutex<ProbeTable<H>>>,
    ) -> Result<Self, DirectoryError> {
        let base = Arc::new(ProbeEntry {
            dev: DevNum::from_raw(1),
            range: u64::MAX,
            owner: DriverToken::new(),
            resolve: base_resolve,
            guard: None,
        });

        let mut buckets = Vec::new();
        buckets
            .try_reserve_exact(BUCKET_COUNT)
            .map_err(|_| DirectoryError::OutOfMemory(BUCKET_COUNT))?;
        for _ in 0..BUCKET_COUNT {
            let mut chain = Vec::new();
            chain
                .try_reserve(1)
                .map_err(|_| DirectoryError::OutOfMemory(BUCKET_COUNT))?;
            chain.push(Arc::clone(&base));
            buckets.push(chain);
        }

        let mut table = lock.lock().expect("probe table lock");
        table.buckets = buckets;
        drop(table);

        Ok(Self { table: lock, base })
    }

    /// Registers a claim over `range` device numbers starting at `dev`
    ///
    /// One probe entry lands in the bucket of every major the range spans,
    /// capped at 255 majors per call. Each entry carries the as-registered
    /// `dev`/`range` pair, the driver's token, and its callbacks. Entries
    /// are spliced before the first entry whose range is not smaller, which
    /// keeps buckets in non-decreasing range order.
    ///
    /// No driver callback runs during registration. On allocation failure
    /// no entry is committed.
    pub fn register(
        &self,
        dev: DevNum,
        range: u64,
        owner: DriverToken,
        resolve: ResolveFn<H>,
        guard: Option<GuardFn>,
    ) -> Result<(), DirectoryError> {
        if range == 0 {
            return Err(DirectoryError::EmptyRange);
        }
        let n = spanned_majors(dev, range);

        let mut staged = Vec::new();
        staged
            .try_reserve_exact(n)
            .map_err(|_| DirectoryError::OutOfMemory(n))?;
        for _ in 0..n {
            staged.push(Arc::new(ProbeEntry {
                dev,
                range,
                owner: owner.clone(),
                resolve: Arc::clone(&resolve),
                guard: guard.clone(),
            }));
        }

        let mut table = self.table.lock().expect("probe table lock");
        // reserve every target bucket first, so a failure commits nothing
        for i in 0..n {
            let slot = bucket_index(dev.major().wrapping_add(i as u64));
            table.buckets[slot]
                .try_reserve(1)
                .map_err(|_| DirectoryError::OutOfMemory(n))?;
        }
        for (i, entry) in staged.into_iter().enumerate() {
            let slot = bucket_index(dev.major().wrapping_add(i as u64));
            let bucket = &mut table.buckets[slot];
            let at = bucket
                .iter()
                .position(|e| e.range >= range)
                .unwrap_or(bucket.len());
            bucket.insert(at, entry);
        }
        Ok(())
    }

    /// Removes a claim previously registered as exactly `(dev, range)`
    ///
    /// At most one matching entry is unlinked per affected major; majors
    /// with no match are skipped silently. Sub-range removal is not
    /// supported, and the sentinel is never removed. When several identical
    /// claims exist, one call removes one of them per major.
    pub fn unregister(&self, dev: DevNum, range: u64) {
        if range == 0 {
            return;
        }
        let n = spanned_majors(dev, range);
        let mut removed = Vec::with_capacity(n);

        let mut table = self.table.lock().expect("probe table lock");
        for i in 0..n {
            let slot = bucket_index(dev.major().wrapping_add(i as u64));
            let bucket = &mut table.buckets[slot];
            if let Some(at) = bucket.iter().position(|e| {
                !Arc::ptr_eq(e, &self.base) && e.dev == dev && e.range == range
            }) {
                removed.push(bucket.remove(at));
            }
        }
        drop(table);
        // entry storage goes away only after the lock is out of the way
        drop(removed);
    }

    /// Resolves a device number to a live handle
    ///
    /// Walks the number's bucket in range order and stops early once no
    /// remaining entry can beat the best claim seen, so the narrowest
    /// covering claim is consulted first. A candidate's token is acquired
    /// before the directory lock is released; the resolve callback then
    /// runs unlocked, with the hold keeping the driver's captured state
    /// valid even if the entry is unregistered meanwhile.
    ///
    /// A driver that declines is never re-invoked within one call: the best
    /// bound is kept across retries, so a retry can only select a strictly
    /// narrower claim whose token or guard newly permits it. Retries are
    /// also bounded by the chain length, so lookup terminates even if the
    /// ordering invariant has been violated by a bug.
    pub fn lookup(&self, dev: DevNum) -> Option<Resolved<H>> {
        let slot = bucket_index(dev.major());
        let mut best = u64::MAX;
        let mut attempts = 0usize;

        loop {
            let mut chosen: Option<Candidate<H>> = None;
            {
                let table = self.table.lock().expect("probe table lock");
                let bucket = &table.buckets[slot];
                if attempts > bucket.len() {
                    return None;
                }
                attempts += 1;

                for entry in bucket.iter() {
                    if !entry.covers(dev) {
                        continue;
                    }
                    if entry.range.wrapping_sub(1) >= best {
                        // range-ascending order: nothing later can be better
                        break;
                    }
                    let Some(hold) = entry.owner.try_acquire() else {
                        // driver mid-teardown
                        continue;
                    };
                    let resolve = Arc::clone(&entry.resolve);
                    best = entry.range.wrapping_sub(1);
                    let index = dev.offset_from(entry.dev);
                    if let Some(guard) = entry.guard.as_ref() {
                        // the guard runs under the lock; best is not rolled
                        // back when it declines
                        if !guard(dev) {
                            drop(hold);
                            continue;
                        }
                    }
                    chosen = Some(Candidate {
                        hold,
                        resolve,
                        index,
                    });
                    break;
                }
            }

            let Candidate {
                hold,
                resolve,
                index,
            } = chosen?;
            // the hold, not table membership, protects the callback here
            let handle = resolve(dev, index);
            drop(hold);
            if let Some(handle) = handle {
                return Some(Resolved { handle, index });
            }
        }
    }
}

/// Number of distinct majors a range touches, capped at 255
fn spanned_majors(dev: DevNum, range: u64) -> usize {
    let n = dev
        .last_in_range(range)
        .major()
        .wrapping_sub(dev.major())
        .wrapping_add(1);
    if n > BUCKET_COUNT as u64 {
        BUCKET_COUNT
    } else {
        n as usize
    }
}

fn bucket_index(major: u64) -> usize {
    (major % BUCKET_COUNT as u64) as usize
}
