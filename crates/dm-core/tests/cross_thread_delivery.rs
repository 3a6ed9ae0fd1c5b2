//! Delivery with the dispatcher drained on a thread of its own while the
//! test thread writes and detaches.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use dm_core::{Dispatcher, DispatcherConfig, LockRequest, ModelPoint, Observer, Phase, Registry, Version};

fn dispatcher() -> Dispatcher {
    Dispatcher::new(DispatcherConfig::default().with_name("worker"))
}

/// Drain `dispatcher` on a new thread until `stop` is set.
fn drain_until(dispatcher: &Dispatcher, stop: &Arc<AtomicBool>) -> thread::JoinHandle<()> {
    let dispatcher = dispatcher.clone();
    let stop = Arc::clone(stop);
    thread::spawn(move || {
        while !stop.load(Ordering::Acquire) {
            if !dispatcher.dispatch_one() {
                dispatcher.signal().wait_timeout(Duration::from_millis(1));
            }
        }
    })
}

#[test]
fn detach_from_other_thread_while_notifying() {
    let registry = Registry::new();
    let dispatcher = dispatcher();
    let point = ModelPoint::<u8>::new(&registry, "p");
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let (started_tx, started_rx) = mpsc::channel();
    let observer = Observer::new(&dispatcher, move |_: &ModelPoint<u8>, _: &Observer<u8>| {
        counter.fetch_add(1, Ordering::SeqCst);
        let _ = started_tx.send(());
        thread::sleep(Duration::from_millis(100));
    })
    .unwrap();
    point.attach(&observer, point.version());
    point.write(1, LockRequest::NoRequest);

    let worker = {
        let dispatcher = dispatcher.clone();
        thread::spawn(move || dispatcher.dispatch_one())
    };
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(observer.phase(), Phase::Notifying);

    point.write(2, LockRequest::NoRequest);
    observer.detach();
    assert_eq!(observer.phase(), Phase::DetachPending);

    assert!(worker.join().unwrap());
    assert_eq!(observer.phase(), Phase::Detached);
    point.write(3, LockRequest::NoRequest);
    assert_eq!(dispatcher.dispatch_all(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn delivered_versions_only_move_forward() {
    let registry = Registry::new();
    let dispatcher = dispatcher();
    let point = ModelPoint::<u32>::new(&registry, "counter");
    let seen: Arc<Mutex<Vec<Version>>> = Arc::default();
    let sink = Arc::clone(&seen);
    let observer = Observer::new(&dispatcher, move |p: &ModelPoint<u32>, me: &Observer<u32>| {
        sink.lock().unwrap().push(p.read_and_sync(me).version);
    })
    .unwrap();
    point.attach(&observer, Version::UNKNOWN);

    let stop = Arc::new(AtomicBool::new(false));
    let worker = drain_until(&dispatcher, &stop);
    let writers: Vec<_> = (0..4)
        .map(|w| {
            let point = point.clone();
            thread::spawn(move || {
                for n in 0..5_000 {
                    point.write(w * 100_000 + n, LockRequest::NoRequest);
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while observer.last_seen() != point.version() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    stop.store(true, Ordering::Release);
    worker.join().unwrap();

    assert_eq!(observer.last_seen(), point.version());
    let seen = seen.lock().unwrap();
    assert!(!seen.is_empty());
    for pair in seen.windows(2) {
        // Compare modulo the u16 wrap.
        let step = pair[1].get().wrapping_sub(pair[0].get());
        assert!(step > 0 && step < u16::MAX / 2, "{:?} then {:?}", pair[0], pair[1]);
    }
}
