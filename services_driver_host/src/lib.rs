//! # Driver Host
//!
//! This crate hosts drivers above the device-number directory. It owns the
//! probe table lock, attaches and detaches drivers, and resolves opens to
//! live device nodes.
//!
//! ## Philosophy
//!
//! - **The host owns the lock**: the directory only references the probe
//!   table lock the host created.
//! - **Policy before mechanism**: an attach policy decides which drivers may
//!   claim regions; the directory itself never judges.
//! - **Teardown is a protocol**: detaching revokes the driver's token before
//!   its claims leave the table, so in-flight opens finish against state
//!   their holds protect.

use dev_types::{DevNum, DriverToken};
use device_directory::{DeviceDirectory, DirectoryError, GuardFn, ProbeTable, ResolveFn};
use event_log::{DeviceEvent, EventLog};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for a hosted driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DriverId(Uuid);

impl DriverId {
    /// Creates a new random driver ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DriverId {
    fn default() -> Self {
        Self::new()
    }
}

/// A contiguous device-number region claimed by a driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionDescriptor {
    /// First device number of the region
    pub base: DevNum,
    /// Number of device numbers claimed
    pub count: u64,
}

/// Descriptor for a hosted driver and its claims
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverDescriptor {
    pub id: DriverId,
    pub name: String,
    pub regions: Vec<RegionDescriptor>,
}

/// A live handle resolved for an opened device number
///
/// The directory forwards these; it never constructs or destroys them.
#[derive(Debug)]
pub struct DeviceNode {
    /// Driver answering for the number
    pub driver: DriverId,
    /// Driver name, for diagnostics
    pub name: String,
    /// Region the node answers for
    pub region: RegionDescriptor,
}

/// Verdict of an attach policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachDecision {
    Allow,
    Deny { reason: String },
}

/// Decides whether a driver may claim a region
pub trait AttachPolicy: Send + Sync {
    fn evaluate(&self, driver_name: &str, region: &RegionDescriptor) -> AttachDecision;
}

pub struct AllowAllDrivers;

impl AttachPolicy for AllowAllDrivers {
    fn evaluate(&self, _driver_name: &str, _region: &RegionDescriptor) -> AttachDecision {
        AttachDecision::Allow
    }
}

pub struct DenyAllDrivers;

impl AttachPolicy for DenyAllDrivers {
    fn evaluate(&self, _driver_name: &str, _region: &RegionDescriptor) -> AttachDecision {
        AttachDecision::Deny {
            reason: "drivers are denied by policy".to_string(),
        }
    }
}

/// Errors surfaced by host operations
#[derive(Debug, Error)]
pub enum HostError {
    #[error("driver not registered: {0:?}")]
    DriverNotRegistered(DriverId),

    #[error("policy denied driver: {0}")]
    PolicyDenied(String),

    #[error("no driver answers for device number {0}")]
    DeviceNotFound(DevNum),

    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

struct DriverRecord {
    name: String,
    token: DriverToken,
    regions: Vec<RegionDescriptor>,
}

/// Hosts drivers and resolves opens through the device-number directory
pub struct DriverHost {
    directory: DeviceDirectory<Arc<DeviceNode>>,
    drivers: HashMap<DriverId, DriverRecord>,
    policy: Box<dyn AttachPolicy>,
    log: Arc<EventLog>,
}

impl DriverHost {
    /// Creates a host with the given attach policy
    ///
    /// The host creates the probe table lock and hands the directory a
    /// reference to it. The base resolve installed here records a probe
    /// miss and declines, so unclaimed numbers surface as
    /// [`HostError::DeviceNotFound`].
    pub fn new(policy: Box<dyn AttachPolicy>) -> Result<Self, HostError> {
        let lock = Arc::new(Mutex::new(ProbeTable::new()));
        let log = Arc::new(EventLog::new());

        let miss_log = Arc::clone(&log);
        let base_resolve: ResolveFn<Arc<DeviceNode>> = Arc::new(move |dev, _| {
            miss_log.record(DeviceEvent::probe_missed(dev));
            None
        });
        let directory = DeviceDirectory::init(base_resolve, lock)?;

        Ok(Self {
            directory,
            drivers: HashMap::new(),
            policy,
            log,
        })
    }

    /// Attaches a driver claiming `count` numbers starting at `base`
    pub fn attach_driver(
        &mut self,
        name: impl Into<String>,
        base: DevNum,
        count: u64,
    ) -> Result<DriverId, HostError> {
        self.attach(name.into(), base, count, None)
    }

    /// Attaches a driver whose opens are vetted by `guard` first
    ///
    /// The guard runs under the directory lock on every open of the claimed
    /// region; declining falls back to less specific claims, if any.
    pub fn attach_guarded_driver(
        &mut self,
        name: impl Into<String>,
        base: DevNum,
        count: u64,
        guard: GuardFn,
    ) -> Result<DriverId, HostError> {
        self.attach(name.into(), base, count, Some(guard))
    }

    fn attach(
        &mut self,
        name: String,
        base: DevNum,
        count: u64,
        guard: Option<GuardFn>,
    ) -> Result<DriverId, HostError> {
        let region = RegionDescriptor { base, count };
        if let AttachDecision::Deny { reason } = self.policy.evaluate(&name, &region) {
            return Err(HostError::PolicyDenied(reason));
        }

        let id = DriverId::new();
        let token = DriverToken::new();
        self.register_region(id, &name, region, &token, guard)?;
        self.drivers.insert(
            id,
            DriverRecord {
                name,
                token,
                regions: vec![region],
            },
        );
        Ok(id)
    }

    /// Claims an additional region for an already attached driver
    ///
    /// The new region shares the driver's lifetime token, so one detach
    /// quiesces every claim.
    pub fn claim_region(
        &mut self,
        id: DriverId,
        base: DevNum,
        count: u64,
    ) -> Result<(), HostError> {
        let region = RegionDescriptor { base, count };
        let record = self
            .drivers
            .get(&id)
            .ok_or(HostError::DriverNotRegistered(id))?;
        if let AttachDecision::Deny { reason } = self.policy.evaluate(&record.name, &region) {
            return Err(HostError::PolicyDenied(reason));
        }

        let name = record.name.clone();
        let token = record.token.clone();
        self.register_region(id, &name, region, &token, None)?;
        self.drivers
            .get_mut(&id)
            .ok_or(HostError::DriverNotRegistered(id))?
            .regions
            .push(region);
        Ok(())
    }

    fn register_region(
        &self,
        id: DriverId,
        name: &str,
        region: RegionDescriptor,
        token: &DriverToken,
        guard: Option<GuardFn>,
    ) -> Result<(), HostError> {
        let node = Arc::new(DeviceNode {
            driver: id,
            name: name.to_string(),
            region,
        });
        let resolve: ResolveFn<Arc<DeviceNode>> = Arc::new(move |_, _| Some(Arc::clone(&node)));
        self.directory
            .register(region.base, region.count, token.clone(), resolve, guard)?;
        self.log
            .record(DeviceEvent::attached(name, region.base, region.count));
        Ok(())
    }

    /// Detaches a driver and withdraws every region it claimed
    ///
    /// The token is revoked before the claims leave the table: lookups that
    /// already hold it finish their resolve; nothing acquires it afresh.
    pub fn detach_driver(&mut self, id: DriverId) -> Result<(), HostError> {
        let record = self
            .drivers
            .remove(&id)
            .ok_or(HostError::DriverNotRegistered(id))?;

        record.token.revoke();
        for region in &record.regions {
            self.directory.unregister(region.base, region.count);
        }
        self.log.record(DeviceEvent::detached(record.name));
        Ok(())
    }

    /// Opens a device number, resolving it to a live node and the offset of
    /// the number within the winning claim
    pub fn open(&self, dev: DevNum) -> Result<(Arc<DeviceNode>, u64), HostError> {
        let resolved = self
            .directory
            .lookup(dev)
            .ok_or(HostError::DeviceNotFound(dev))?;
        Ok((resolved.handle, resolved.index))
    }

    /// Lists descriptors for all attached drivers
    pub fn descriptors(&self) -> Vec<DriverDescriptor> {
        self.drivers
            .iter()
            .map(|(id, record)| DriverDescriptor {
                id: *id,
                name: record.name.clone(),
                regions: record.regions.clone(),
            })
            .collect()
    }

    /// Snapshot of recorded device-layer events
    pub fn events(&self) -> Vec<DeviceEvent> {
        self.log.events()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_log::EventLevel;

    fn test_host() -> DriverHost {
        DriverHost::new(Box::new(AllowAllDrivers)).expect("create host")
    }

    #[test]
    fn test_attach_and_open() {
        let mut host = test_host();
        let id = host
            .attach_driver("tty", DevNum::new(4, 64), 8)
            .expect("attach");

        let (node, index) = host.open(DevNum::new(4, 69)).expect("open");
        assert_eq!(node.driver, id);
        assert_eq!(node.name, "tty");
        assert_eq!(index, 5);
    }

    #[test]
    fn test_open_unclaimed_number_misses() {
        let host = test_host();
        let dev = DevNum::new(10, 3);

        let err = host.open(dev).expect_err("nothing attached");
        assert!(matches!(err, HostError::DeviceNotFound(d) if d == dev));

        // the sentinel's resolve recorded the miss
        let events = host.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].level, EventLevel::Debug);
    }

    #[test]
    fn test_policy_denies_attach() {
        let mut host = DriverHost::new(Box::new(DenyAllDrivers)).expect("create host");
        let err = host
            .attach_driver("gpu", DevNum::new(200, 0), 1)
            .expect_err("policy denies");
        assert!(matches!(err, HostError::PolicyDenied(_)));
        assert!(host.descriptors().is_empty());
    }

    #[test]
    fn test_detach_withdraws_claims() {
        let mut host = test_host();
        let dev = DevNum::new(4, 64);
        let id = host.attach_driver("tty", dev, 8).expect("attach");

        host.detach_driver(id).expect("detach");
        assert!(matches!(
            host.open(dev),
            Err(HostError::DeviceNotFound(_))
        ));
        assert!(matches!(
            host.detach_driver(id),
            Err(HostError::DriverNotRegistered(_))
        ));
    }

    #[test]
    fn test_guarded_driver_vetoes_odd_minors() {
        let mut host = test_host();
        host.attach_guarded_driver(
            "blk",
            DevNum::new(8, 0),
            16,
            Arc::new(|dev| dev.minor() % 2 == 0),
        )
        .expect("attach");

        assert!(host.open(DevNum::new(8, 4)).is_ok());
        assert!(matches!(
            host.open(DevNum::new(8, 5)),
            Err(HostError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_claim_region_extends_driver() {
        let mut host = test_host();
        let id = host
            .attach_driver("tty", DevNum::new(4, 0), 8)
            .expect("attach");
        host.claim_region(id, DevNum::new(5, 0), 4).expect("claim");

        let (node, _) = host.open(DevNum::new(5, 2)).expect("open second region");
        assert_eq!(node.driver, id);

        let descriptors = host.descriptors();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].regions.len(), 2);

        host.detach_driver(id).expect("detach");
        assert!(host.open(DevNum::new(4, 2)).is_err());
        assert!(host.open(DevNum::new(5, 2)).is_err());
    }

    #[test]
    fn test_attach_records_event() {
        let mut host = test_host();
        host.attach_driver("ser", DevNum::new(4, 64), 4)
            .expect("attach");

        let events = host.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source.as_deref(), Some("ser"));
        assert_eq!(events[0].message, "driver attached");
    }

    #[test]
    fn test_descriptor_contract() {
        let mut host = test_host();
        let id = host
            .attach_driver("tty", DevNum::new(4, 64), 8)
            .expect("attach");

        let descriptor = &host.descriptors()[0];
        let value = serde_json::to_value(descriptor).expect("serialize descriptor");

        // device numbers serialize as their raw encoding
        assert_eq!(value["name"], "tty");
        assert_eq!(value["regions"][0]["base"], DevNum::new(4, 64).as_raw());
        assert_eq!(value["regions"][0]["count"], 8);

        let round_trip: DriverDescriptor =
            serde_json::from_value(value).expect("deserialize descriptor");
        assert_eq!(round_trip.id, id);
        assert_eq!(&round_trip, descriptor);
    }
}
