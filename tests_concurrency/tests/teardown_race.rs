//! Teardown Race Tests
//!
//! Validates the lock-release window of lookup: a claim can be withdrawn
//! between candidate selection and the resolve callback, and the callback
//! still completes against state its driver hold protects.

use dev_types::DriverToken;
use device_directory::ResolveFn;
use event_log::EventLevel;
use services_driver_host::{AllowAllDrivers, DriverHost, HostError};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use tests_concurrency::{dev, resolver, test_directory};

/// Test: unregistering a claim while its resolve is in flight neither blocks
/// the teardown nor the resolve; the lookup still produces the handle
#[test]
fn test_unregister_between_selection_and_resolve() {
    let (directory, _lock) = test_directory();
    let token = DriverToken::new();

    let (entered_tx, entered_rx) = mpsc::channel();
    let (proceed_tx, proceed_rx) = mpsc::channel::<()>();
    let proceed_rx = Mutex::new(proceed_rx);

    let blocking: ResolveFn<String> = Arc::new(move |_, _| {
        entered_tx.send(()).expect("signal entry");
        proceed_rx
            .lock()
            .expect("proceed receiver lock")
            .recv()
            .expect("wait for teardown");
        Some("blk".to_string())
    });

    directory
        .register(dev(8, 0), 8, token.clone(), blocking, None)
        .expect("register");

    let worker = {
        let directory = directory.clone();
        thread::spawn(move || directory.lookup(dev(8, 3)))
    };

    // the resolve is in flight; the directory lock has been released
    entered_rx.recv().expect("resolve entered");
    token.revoke();
    directory.unregister(dev(8, 0), 8);

    // the claim is gone from the table, yet the in-flight resolve completes
    proceed_tx.send(()).expect("release resolve");
    let resolved = worker
        .join()
        .expect("lookup thread")
        .expect("in-flight resolve completes");
    assert_eq!(resolved.handle, "blk");
    assert_eq!(resolved.index, 3);

    // the hold taken before the teardown has been released
    assert_eq!(token.holds(), 0);

    // nothing answers for the range anymore
    assert!(directory.lookup(dev(8, 3)).is_none());
}

/// Test: concurrent registration churn and lookups neither wedge nor panic,
/// and every lookup that succeeds returns a handle some claim produced
#[test]
fn test_lookup_survives_registration_churn() {
    let (directory, _lock) = test_directory();
    let token = DriverToken::new();

    directory
        .register(dev(12, 0), 1 << 16, DriverToken::new(), resolver("wide"), None)
        .expect("register wide");

    let churn = {
        let directory = directory.clone();
        let token = token.clone();
        thread::spawn(move || {
            for _ in 0..500 {
                directory
                    .register(dev(12, 40), 8, token.clone(), resolver("narrow"), None)
                    .expect("register narrow");
                directory.unregister(dev(12, 40), 8);
            }
        })
    };

    let prober = {
        let directory = directory.clone();
        thread::spawn(move || {
            for _ in 0..500 {
                let resolved = directory.lookup(dev(12, 42)).expect("wide claim backs lookup");
                assert!(resolved.handle == "narrow" || resolved.handle == "wide");
            }
        })
    };

    churn.join().expect("churn thread");
    prober.join().expect("prober thread");
    assert_eq!(token.holds(), 0);
}

/// Test: concurrent opens through the host resolve consistently under load,
/// and a detach afterwards withdraws every claim
#[test]
fn test_open_storm_then_detach_through_host() {
    let mut host = DriverHost::new(Box::new(AllowAllDrivers)).expect("create host");
    let id = host
        .attach_driver("flaky", dev(30, 0), 64)
        .expect("attach");

    thread::scope(|scope| {
        for _ in 0..4 {
            let host = &host;
            scope.spawn(move || {
                for minor in 0..200u64 {
                    match host.open(dev(30, minor % 64)) {
                        Ok((node, index)) => {
                            assert_eq!(node.name, "flaky");
                            assert_eq!(index, minor % 64);
                        }
                        Err(HostError::DeviceNotFound(_)) => {}
                        Err(other) => panic!("unexpected open failure: {other}"),
                    }
                }
            });
        }
    });

    host.detach_driver(id).expect("detach");
    assert!(matches!(
        host.open(dev(30, 1)),
        Err(HostError::DeviceNotFound(_))
    ));

    // the teardown left its trace in the event log
    assert!(host
        .events()
        .iter()
        .any(|e| e.level == EventLevel::Info && e.message == "driver detached"));
}
