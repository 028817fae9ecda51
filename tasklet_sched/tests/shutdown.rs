#![cfg(not(loom))]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tasklet_sched::{default_run_queue, shutdown, OwnedLock, Tasklet, WaitList};

#[test]
fn default_queue_runs_and_shuts_down() {
    // racing creators all end up with the one published queue
    let racers: Vec<_> = (0..8)
        .map(|_| std::thread::spawn(|| default_run_queue().unwrap()))
        .collect();
    let queues: Vec<_> = racers.into_iter().map(|r| r.join().unwrap()).collect();
    for q in &queues[1..] {
        assert!(Arc::ptr_eq(q, &queues[0]));
    }
    drop(queues);

    let lock = Arc::new(OwnedLock::new());
    let wl = WaitList::new(0);
    let calls = Arc::new(AtomicUsize::new(0));

    let t = Tasklet::new(lock.clone());
    {
        let (wl, calls) = (wl.clone(), calls.clone());
        // no preferred queue on this thread, so this lands on the default one
        t.defer(move |t| {
            if wl.down(1, t) {
                calls.fetch_add(1, Ordering::Relaxed);
                t.stop();
            }
        });
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while !wl.nonempty() {
        assert!(Instant::now() < deadline, "tasklet never parked");
        std::thread::sleep(Duration::from_millis(1));
    }
    wl.up(1);
    while calls.load(Ordering::Relaxed) == 0 || t.is_scheduled() {
        assert!(Instant::now() < deadline, "tasklet never resumed");
        std::thread::sleep(Duration::from_millis(1));
    }

    let q = default_run_queue().unwrap();
    assert!(q.is_idle());
    drop(q);

    lock.lock();
    t.fini();
    lock.unlock();

    shutdown().unwrap();
    // nothing left to do the second time around
    shutdown().unwrap();
}
