use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use kyroflux::testing::TestSubscriber;
use kyroflux::{
    BaseSubscriber, Disposable, Flux, FluxError, Hooks, SchedulerConfig, Schedulers,
    SubscriberBuilder, SubscriptionHandle,
};

#[test]
fn demand_is_never_exceeded_across_a_long_chain() {
    let probe = TestSubscriber::with_request(7);
    Flux::range(0, 1_000)
        .map(|n| n * 2)
        .filter(|n| n % 3 != 0)
        .skip(5)
        .distinct()
        .subscribe(probe.clone());

    assert_eq!(probe.values().len(), 7);
    assert!(!probe.is_terminated());
    for _ in 0..10 {
        probe.request(3);
    }
    assert_eq!(probe.values().len(), 37);
    assert!(!probe.is_overflowed());
}

#[test]
fn zero_and_negative_requests_fail_with_illegal_demand() {
    for n in [0, -1] {
        let probe = TestSubscriber::<i64>::with_request(n);
        Flux::range(0, 10).map(|v| v + 1).subscribe(probe.clone());
        assert_eq!(probe.error(), Some(FluxError::IllegalDemand { requested: n }));
        assert!(probe.values().is_empty());
    }
}

#[test]
fn even_filter_meets_exact_demand() {
    let probe = TestSubscriber::with_request(3);
    Flux::just(vec![1, 2, 3, 4, 5, 6])
        .filter(|n| n % 2 == 0)
        .subscribe(probe.clone());
    assert_eq!(probe.values(), vec![2, 4, 6]);
    assert!(probe.is_complete());
}

#[test]
fn take_stops_an_infinite_source() {
    let produced = Arc::new(AtomicUsize::new(0));
    let p = Arc::clone(&produced);
    let values = Flux::generate(|| 0u64..)
        .do_on_next(move |_| {
            p.fetch_add(1, Ordering::SeqCst);
        })
        .take(5)
        .block_collect()
        .unwrap();
    assert_eq!(values, vec![0, 1, 2, 3, 4]);
    assert_eq!(produced.load(Ordering::SeqCst), 5);
}

#[test]
fn nothing_arrives_after_cancel_from_another_thread() {
    let pool = Schedulers::new_parallel(SchedulerConfig {
        name: "cancel-race".to_string(),
        workers: 2,
        queue_capacity: 256,
    });
    let probe = TestSubscriber::new();
    Flux::generate(|| 0u64..)
        .subscribe_on(Arc::clone(&pool))
        .subscribe(probe.clone());

    assert!(probe.await_count(10, Duration::from_secs(5)));
    let canceller = {
        let probe = probe.clone();
        thread::spawn(move || probe.cancel())
    };
    canceller.join().unwrap();

    let at_cancel = probe.values().len();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(probe.values().len(), at_cancel);
    assert!(!probe.is_terminated());
    pool.dispose();
}

#[test]
fn flat_map_with_prefetch_keeps_outstanding_bounded() {
    let requested_inner = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&requested_inner);
    let probe = TestSubscriber::with_request(3);
    Flux::range(0, 4)
        .flat_map(
            move |n| {
                let r = Arc::clone(&r);
                Flux::range(n * 100, 50).do_on_next(move |_| {
                    r.fetch_add(1, Ordering::SeqCst);
                })
            },
            2,
            4,
        )
        .subscribe(probe.clone());

    assert_eq!(probe.values().len(), 3);
    // Two active inners, each at most `prefetch` ahead of what was emitted.
    assert!(requested_inner.load(Ordering::SeqCst) <= 3 + 2 * 4);
}

#[test]
fn lambda_subscriber_with_initial_request() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    let completed = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&completed);
    let disposable = Flux::range(0, 10).subscribe_with(
        SubscriberBuilder::new(move |n| s.lock().unwrap().push(n))
            .on_complete(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .initial_request(4),
    );
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3]);
    assert_eq!(completed.load(Ordering::SeqCst), 0);
    disposable.dispose();
    assert!(disposable.is_disposed());
}

struct OneAtATime {
    seen: Arc<Mutex<Vec<i64>>>,
}

impl Hooks<i64> for OneAtATime {
    fn hook_on_subscribe(&mut self, handle: &SubscriptionHandle) {
        handle.request(1).unwrap();
    }

    fn hook_on_next(&mut self, item: i64, handle: &SubscriptionHandle) {
        self.seen.lock().unwrap().push(item);
        if item == 3 {
            handle.cancel();
        } else {
            handle.request(1).unwrap();
        }
    }
}

#[test]
fn base_subscriber_requests_one_by_one_and_cancels() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let subscriber = BaseSubscriber::new(OneAtATime {
        seen: Arc::clone(&seen),
    });
    let handle = subscriber.handle();
    Flux::range(0, 100).subscribe(subscriber);
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3]);
    assert!(handle.is_cancelled());
    assert!(handle.request(0).is_err());
}
