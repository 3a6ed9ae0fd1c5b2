//! Observer lifecycle scenarios, driven single-threaded by pumping the
//! dispatcher by hand.

use std::sync::{Arc, Mutex};

use dm_core::{
    Dispatcher, DispatcherConfig, FixedCodec, GenericObserver, LockRequest, ModelPoint, Observer, Phase,
    PointRef, Registry, Version,
};
use serde::{Deserialize, Serialize};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn dispatcher() -> Dispatcher {
    Dispatcher::new(DispatcherConfig::default().with_name("test"))
}

type Log<T> = Arc<Mutex<Vec<T>>>;

/// Observer that records every value it is called with.
fn recorder<T: dm_core::PointValue>(dispatcher: &Dispatcher) -> (Observer<T>, Log<Option<T>>) {
    let log: Log<Option<T>> = Arc::default();
    let sink = Arc::clone(&log);
    let observer = Observer::new(dispatcher, move |point: &ModelPoint<T>, _: &Observer<T>| {
        sink.lock().unwrap().push(point.read().value);
    })
    .unwrap();
    (observer, log)
}

#[test]
fn coalesced_writes_deliver_only_the_last_value() {
    init_tracing();
    let registry = Registry::new();
    let dispatcher = dispatcher();
    let point = ModelPoint::<u32>::new(&registry, "counter");
    let (observer, log) = recorder::<u32>(&dispatcher);
    point.attach(&observer, point.version());
    assert_eq!(observer.phase(), Phase::Idle);

    for n in 1..=10 {
        point.write(n, LockRequest::NoRequest);
    }
    assert_eq!(observer.phase(), Phase::Pending);
    assert_eq!(dispatcher.pending_len(), 1);

    assert_eq!(dispatcher.dispatch_all(), 1);
    assert_eq!(*log.lock().unwrap(), vec![Some(10)]);
    assert_eq!(observer.phase(), Phase::Idle);
}

#[test]
fn write_during_callback_triggers_another_notification() {
    init_tracing();
    let registry = Registry::new();
    let dispatcher = dispatcher();
    let point = ModelPoint::<u32>::new(&registry, "p");
    let log: Log<Option<u32>> = Arc::default();
    let sink = Arc::clone(&log);
    let observer = Observer::new(&dispatcher, move |p: &ModelPoint<u32>, _: &Observer<u32>| {
        let value = p.read().value;
        sink.lock().unwrap().push(value);
        // Another writer lands while this callback is still running.
        if value == Some(1) {
            p.write(2, LockRequest::NoRequest);
        }
    })
    .unwrap();
    point.attach(&observer, point.version());

    point.write(1, LockRequest::NoRequest);
    assert!(dispatcher.dispatch_one());
    assert_eq!(observer.phase(), Phase::Pending);
    assert!(dispatcher.dispatch_one());
    assert!(!dispatcher.dispatch_one());
    assert_eq!(*log.lock().unwrap(), vec![Some(1), Some(2)]);
    assert_eq!(observer.phase(), Phase::Idle);
}

#[test]
fn attach_with_unknown_replays_current_state() {
    let registry = Registry::new();
    let dispatcher = dispatcher();
    let point = ModelPoint::<u8>::new(&registry, "never_written");
    let (observer, log) = recorder::<u8>(&dispatcher);

    point.attach(&observer, Version::UNKNOWN);
    assert_eq!(observer.phase(), Phase::Pending);
    assert_eq!(dispatcher.dispatch_all(), 1);
    assert_eq!(*log.lock().unwrap(), vec![None]);
    assert_eq!(observer.last_seen(), point.version());
}

#[test]
fn attach_with_current_version_stays_quiet() {
    let registry = Registry::new();
    let dispatcher = dispatcher();
    let point = ModelPoint::with_value(&registry, "p", 4_u8);
    let (observer, log) = recorder::<u8>(&dispatcher);
    point.attach(&observer, point.version());
    assert_eq!(dispatcher.dispatch_all(), 0);
    assert!(log.lock().unwrap().is_empty());
}

#[test]
fn locked_write_is_a_silent_no_op() {
    let registry = Registry::new();
    let dispatcher = dispatcher();
    let point = ModelPoint::with_value(&registry, "p", 1_u8);
    let (observer, _log) = recorder::<u8>(&dispatcher);
    point.attach(&observer, point.version());

    let version = point.set_lock(LockRequest::Lock);
    assert_eq!(point.write(2, LockRequest::NoRequest), version);
    let snap = point.read();
    assert_eq!(snap.value, Some(1));
    assert!(snap.locked);
    assert_eq!(dispatcher.pending_len(), 0);
}

#[test]
fn self_detach_inside_callback() {
    init_tracing();
    let registry = Registry::new();
    let dispatcher = dispatcher();
    let point = ModelPoint::<u8>::new(&registry, "p");
    let calls = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&calls);
    let observer = Observer::new(&dispatcher, move |p: &ModelPoint<u8>, me: &Observer<u8>| {
        *counter.lock().unwrap() += 1;
        p.detach(me);
        assert_eq!(me.phase(), Phase::DetachPending);
        // A write after detaching must not come back to us.
        p.write(99, LockRequest::NoRequest);
    })
    .unwrap();
    point.attach(&observer, point.version());

    point.write(1, LockRequest::NoRequest);
    assert_eq!(dispatcher.dispatch_all(), 1);
    assert_eq!(observer.phase(), Phase::Detached);
    point.write(2, LockRequest::NoRequest);
    assert_eq!(dispatcher.dispatch_all(), 0);
    assert_eq!(*calls.lock().unwrap(), 1);
}

#[test]
fn detach_while_pending_cancels_delivery() {
    let registry = Registry::new();
    let dispatcher = dispatcher();
    let point = ModelPoint::<u8>::new(&registry, "p");
    let (observer, log) = recorder::<u8>(&dispatcher);
    point.attach(&observer, Version::UNKNOWN);
    assert_eq!(dispatcher.pending_len(), 1);

    point.detach(&observer);
    assert_eq!(observer.phase(), Phase::Detached);
    assert_eq!(dispatcher.pending_len(), 0);
    assert_eq!(dispatcher.dispatch_all(), 0);
    assert!(log.lock().unwrap().is_empty());

    // Idempotent.
    point.detach(&observer);
    observer.detach();
    assert_eq!(observer.phase(), Phase::Detached);
}

#[test]
fn reattach_while_pending_restarts_without_duplicates() {
    let registry = Registry::new();
    let dispatcher = dispatcher();
    let point = ModelPoint::<u8>::new(&registry, "p");
    let (observer, log) = recorder::<u8>(&dispatcher);
    point.attach(&observer, Version::UNKNOWN);
    point.attach(&observer, Version::UNKNOWN);
    assert_eq!(dispatcher.pending_len(), 1);

    // Restart as current: the queued entry goes away.
    point.attach(&observer, point.version());
    assert_eq!(observer.phase(), Phase::Idle);
    assert_eq!(dispatcher.pending_len(), 0);
    assert_eq!(dispatcher.dispatch_all(), 0);
    assert!(log.lock().unwrap().is_empty());
}

#[test]
fn observer_detach_uses_its_binding() {
    let registry = Registry::new();
    let dispatcher = dispatcher();
    let a = ModelPoint::<u8>::new(&registry, "a");
    let b = ModelPoint::<u8>::new(&registry, "b");
    let (observer, _log) = recorder::<u8>(&dispatcher);
    a.attach(&observer, a.version());
    observer.detach();
    assert_eq!(observer.phase(), Phase::Detached);
    // Free to move to another point now.
    b.attach(&observer, b.version());
    assert_eq!(observer.phase(), Phase::Idle);
    a.write(1, LockRequest::NoRequest);
    assert_eq!(dispatcher.pending_len(), 0);
    b.write(1, LockRequest::NoRequest);
    assert_eq!(dispatcher.pending_len(), 1);
}

#[test]
#[should_panic(expected = "attached to another point")]
fn attaching_to_a_second_point_is_fatal() {
    let registry = Registry::new();
    let dispatcher = dispatcher();
    let a = ModelPoint::<u8>::new(&registry, "a");
    let b = ModelPoint::<u8>::new(&registry, "b");
    let (observer, _log) = recorder::<u8>(&dispatcher);
    a.attach(&observer, a.version());
    b.attach(&observer, b.version());
}

#[test]
#[should_panic(expected = "not attached to this point")]
fn detaching_from_the_wrong_point_is_fatal() {
    let registry = Registry::new();
    let dispatcher = dispatcher();
    let a = ModelPoint::<u8>::new(&registry, "a");
    let b = ModelPoint::<u8>::new(&registry, "b");
    let (observer, _log) = recorder::<u8>(&dispatcher);
    a.attach(&observer, a.version());
    b.detach(&observer);
}

#[test]
fn callback_may_retarget_to_another_point() {
    let registry = Registry::new();
    let dispatcher = dispatcher();
    let a = ModelPoint::<u8>::new(&registry, "a");
    let b = ModelPoint::with_value(&registry, "b", 5_u8);
    let log: Log<String> = Arc::default();
    let sink = Arc::clone(&log);
    let next = b.clone();
    let observer = Observer::new(&dispatcher, move |p: &ModelPoint<u8>, me: &Observer<u8>| {
        sink.lock().unwrap().push(p.name());
        if p.name() == "a" {
            next.attach(me, Version::UNKNOWN);
        }
    })
    .unwrap();
    a.attach(&observer, Version::UNKNOWN);
    dispatcher.dispatch_all();
    assert_eq!(*log.lock().unwrap(), ["a", "b"]);
    a.write(1, LockRequest::NoRequest);
    assert_eq!(dispatcher.pending_len(), 0);
}

#[test]
fn read_and_sync_suppresses_redelivery() {
    let registry = Registry::new();
    let dispatcher = dispatcher();
    let point = ModelPoint::<u8>::new(&registry, "p");
    let (observer, log) = recorder::<u8>(&dispatcher);
    point.attach(&observer, point.version());
    point.write(3, LockRequest::NoRequest);
    let snap = point.read_and_sync(&observer);
    assert_eq!(snap.value, Some(3));
    // The queued entry still runs once; afterwards the observer is current.
    dispatcher.dispatch_all();
    assert_eq!(log.lock().unwrap().len(), 1);
    assert_eq!(observer.last_seen(), point.version());
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Metrics {
    num_samples: u32,
    sum_total: u32,
}

impl FixedCodec for Metrics {
    const SIZE: usize = 8;

    fn encode(&self, out: &mut [u8]) {
        self.num_samples.encode(&mut out[..4]);
        self.sum_total.encode(&mut out[4..]);
    }

    fn decode(src: &[u8]) -> Result<Self, dm_core::CodecError> {
        if src.len() != Self::SIZE {
            return Err(dm_core::CodecError::SizeMismatch {
                expected: Self::SIZE,
                actual: src.len(),
            });
        }
        Ok(Self {
            num_samples: u32::decode(&src[..4])?,
            sum_total: u32::decode(&src[4..])?,
        })
    }
}

impl dm_core::PointValue for Metrics {
    fn type_name() -> String {
        "Metrics".to_string()
    }
}

#[test]
fn partial_merge_keeps_other_fields() {
    let registry = Registry::new();
    let point = ModelPoint::with_value(
        &registry,
        "metrics",
        Metrics {
            num_samples: 3,
            sum_total: 9,
        },
    );
    let before = point.version();
    let after = point.merge_json(r#"{"val":{"sumTotal":12}}"#).unwrap();
    assert_eq!(after, before.next());
    assert_eq!(
        point.read().value,
        Some(Metrics {
            num_samples: 3,
            sum_total: 12
        })
    );
}

#[test]
fn name_ordered_traversal() {
    let registry = Registry::new();
    for name in ["b", "a", "c"] {
        let _ = ModelPoint::<u8>::new(&registry, name);
    }
    let names: Vec<String> = registry.points_by_name().iter().map(PointRef::name).collect();
    assert_eq!(names, ["a", "b", "c"]);
}

#[test]
fn generic_observer_sees_text_form() {
    let registry = Registry::new();
    let dispatcher = dispatcher();
    let point = ModelPoint::<bool>::new(&registry, "flag");
    let log: Log<String> = Arc::default();
    let sink = Arc::clone(&log);
    let observer = GenericObserver::new(&dispatcher, move |p: &PointRef, _: &GenericObserver| {
        sink.lock().unwrap().push(p.to_json());
    })
    .unwrap();
    point.as_point_ref().attach(&observer, point.version());
    point.write(true, LockRequest::NoRequest);
    dispatcher.dispatch_all();
    let lines = log.lock().unwrap();
    assert_eq!(lines.len(), 1);
    let value: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
    assert_eq!(value["val"], serde_json::json!(true));
    assert_eq!(value["seqnum"], serde_json::json!(2));
}

#[test]
fn import_notifies_even_when_identical() {
    let registry = Registry::new();
    let dispatcher = dispatcher();
    let point = ModelPoint::with_value(&registry, "p", 7_u8);
    let (observer, log) = recorder::<u8>(&dispatcher);
    point.attach(&observer, point.version());
    let (blob, _) = point.export(false);
    point.import(&blob, false).unwrap();
    dispatcher.dispatch_all();
    assert_eq!(*log.lock().unwrap(), vec![Some(7)]);
}
