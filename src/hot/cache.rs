use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tracing::debug;

use crate::context::Context;
use crate::demand::{validate_request, Demand, UNBOUNDED};
use crate::error::FluxError;
use crate::hooks;
use crate::publisher::Publisher;
use crate::subscriber::serialized::SerializedSink;
use crate::subscriber::{BoxSubscriber, Subscriber};
use crate::subscription::{Subscription, SubscriptionRef};
use crate::sync::{lock, Wip};

/// Records upstream once and replays it to every subscriber.
///
/// The first subscriber triggers the single upstream subscription, with its
/// own context. Replay starts once upstream has terminated; each subscriber
/// then receives the recorded items against its own demand, followed by the
/// recorded terminal signal.
pub(crate) struct CachePublisher<T> {
    core: Arc<CacheCore<T>>,
}

impl<T> CachePublisher<T> {
    pub(crate) fn new(source: Arc<dyn Publisher<T>>) -> Self {
        Self {
            core: Arc::new(CacheCore {
                source,
                status: Mutex::new(Status::Idle),
            }),
        }
    }
}

enum Outcome {
    Complete,
    Error(FluxError),
}

struct Recorded<T> {
    items: Vec<T>,
    outcome: Outcome,
}

enum Status<T> {
    Idle,
    Running { waiting: Vec<Arc<ReplaySubscription<T>>> },
    Done(Arc<Recorded<T>>),
}

struct CacheCore<T> {
    source: Arc<dyn Publisher<T>>,
    status: Mutex<Status<T>>,
}

impl<T: Clone + Send + Sync + 'static> CacheCore<T> {
    fn finish(&self, recorded: Recorded<T>) {
        let recorded = Arc::new(recorded);
        let waiting = {
            let mut status = lock(&self.status);
            match std::mem::replace(&mut *status, Status::Done(Arc::clone(&recorded))) {
                Status::Running { waiting } => waiting,
                Status::Idle | Status::Done(_) => Vec::new(),
            }
        };
        debug!(items = recorded.items.len(), replays = waiting.len(), "cache recorded");
        for replay in waiting {
            let _ = replay.recorded.set(Arc::clone(&recorded));
            replay.drain();
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Publisher<T> for CachePublisher<T> {
    fn subscribe_boxed(&self, subscriber: BoxSubscriber<T>, context: Context) {
        let replay = Arc::new(ReplaySubscription {
            sink: SerializedSink::new(subscriber),
            demand: Demand::new(),
            wip: Wip::new(),
            index: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
            recorded: OnceLock::new(),
        });
        replay.sink.on_subscribe(replay.clone());

        let start = {
            let mut status = lock(&self.core.status);
            let start = match &mut *status {
                Status::Idle => true,
                Status::Running { waiting } => {
                    waiting.push(Arc::clone(&replay));
                    false
                }
                Status::Done(recorded) => {
                    let _ = replay.recorded.set(Arc::clone(recorded));
                    false
                }
            };
            if start {
                *status = Status::Running {
                    waiting: vec![Arc::clone(&replay)],
                };
            }
            start
        };
        if start {
            let recorder = Recorder {
                core: Arc::clone(&self.core),
                items: Vec::new(),
                done: false,
            };
            self.core.source.subscribe_boxed(Box::new(recorder), context);
        } else {
            replay.drain();
        }
    }
}

struct ReplaySubscription<T> {
    sink: SerializedSink<T>,
    demand: Demand,
    wip: Wip,
    index: AtomicUsize,
    finished: AtomicBool,
    recorded: OnceLock<Arc<Recorded<T>>>,
}

impl<T: Clone + Send + Sync + 'static> ReplaySubscription<T> {
    fn drain(&self) {
        if !self.wip.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            if let Some(recorded) = self.recorded.get() {
                self.replay(recorded);
            }
            missed = self.wip.leave(missed);
            if missed == 0 {
                break;
            }
        }
    }

    fn replay(&self, recorded: &Recorded<T>) {
        let mut index = self.index.load(Ordering::Acquire);
        while index < recorded.items.len()
            && !self.sink.is_done()
            && self.demand.try_consume()
        {
            self.sink.next(recorded.items[index].clone());
            index += 1;
        }
        self.index.store(index, Ordering::Release);
        if index == recorded.items.len() && !self.finished.swap(true, Ordering::AcqRel) {
            match &recorded.outcome {
                Outcome::Complete => self.sink.complete(),
                Outcome::Error(err) => self.sink.error(err.clone()),
            }
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Subscription for ReplaySubscription<T> {
    fn request(&self, n: i64) {
        match validate_request(n) {
            Ok(n) => {
                self.demand.add(n);
                self.drain();
            }
            Err(err) => {
                if !self.finished.swap(true, Ordering::AcqRel) {
                    self.sink.error(err);
                }
            }
        }
    }

    fn cancel(&self) {
        self.finished.store(true, Ordering::Release);
        self.sink.cancel();
    }
}

struct Recorder<T> {
    core: Arc<CacheCore<T>>,
    items: Vec<T>,
    done: bool,
}

impl<T: Clone + Send + Sync + 'static> Subscriber<T> for Recorder<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        subscription.request(UNBOUNDED);
    }

    fn on_next(&mut self, item: T) {
        if !self.done {
            self.items.push(item);
        }
    }

    fn on_error(&mut self, error: FluxError) {
        if self.done {
            hooks::on_error_dropped(&error);
            return;
        }
        self.done = true;
        self.core.finish(Recorded {
            items: std::mem::take(&mut self.items),
            outcome: Outcome::Error(error),
        });
    }

    fn on_complete(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.core.finish(Recorded {
            items: std::mem::take(&mut self.items),
            outcome: Outcome::Complete,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::error::FluxError;
    use crate::publisher::Flux;
    use crate::testing::TestSubscriber;

    #[test]
    fn test_upstream_runs_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&runs);
        let cached = Flux::defer(move || {
            r.fetch_add(1, Ordering::SeqCst);
            Flux::just(vec!["a", "b"])
        })
        .cache();

        for _ in 0..3 {
            let probe = TestSubscriber::new();
            cached.subscribe(probe.clone());
            assert_eq!(probe.values(), vec!["a", "b"]);
            assert!(probe.is_complete());
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_replay_honours_demand() {
        let cached = Flux::range(0, 5).cache();
        cached.subscribe(TestSubscriber::new());

        let probe = TestSubscriber::with_request(2);
        cached.subscribe(probe.clone());
        assert_eq!(probe.values(), vec![0, 1]);
        assert!(!probe.is_terminated());
        probe.request(3);
        assert_eq!(probe.values(), vec![0, 1, 2, 3, 4]);
        assert!(probe.is_complete());
    }

    #[test]
    fn test_error_is_replayed() {
        let cached = Flux::range(0, 3)
            .try_map(|n| {
                if n < 2 {
                    Ok(n)
                } else {
                    Err(FluxError::upstream("once"))
                }
            })
            .cache();
        for _ in 0..2 {
            let probe = TestSubscriber::new();
            cached.subscribe(probe.clone());
            assert_eq!(probe.values(), vec![0, 1]);
            assert_eq!(probe.error(), Some(FluxError::upstream("once")));
        }
    }

    #[test]
    fn test_empty_upstream_replays_completion() {
        let cached = Flux::<i64>::empty().cache();
        let probe = TestSubscriber::manual();
        cached.subscribe(probe.clone());
        assert!(probe.is_complete());
    }
}
