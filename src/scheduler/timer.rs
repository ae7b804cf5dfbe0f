//! Timer thread for delayed tasks.
//!
//! Deadlines are kept in a min-heap; the thread sleeps on its control channel
//! until either a new deadline arrives or the earliest one is due. Fired
//! entries run on the timer thread and are expected to only hand work off.
//! Entries still pending at shutdown run once with [`Fire::Abandoned`].

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{select, unbounded, Receiver, Sender};
use tracing::trace;

use crate::error::{FluxError, FluxResult};

/// Why a timer entry runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fire {
    Due,
    Abandoned,
}

pub(crate) type TimerTask = Box<dyn FnOnce(Fire) + Send + 'static>;

struct Entry {
    at: Instant,
    seq: u64,
    task: TimerTask,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed: BinaryHeap is a max-heap and the earliest deadline must be on top.
    fn cmp(&self, other: &Self) -> Ordering {
        other.at.cmp(&self.at).then_with(|| other.seq.cmp(&self.seq))
    }
}

pub(crate) struct Timer {
    tx: Sender<(Instant, TimerTask)>,
    join: JoinHandle<()>,
}

impl Timer {
    pub(crate) fn start(name: &str) -> FluxResult<Self> {
        let (tx, rx) = unbounded::<(Instant, TimerTask)>();
        let thread_name = format!("kyroflux-{name}-timer");
        let join = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || timer_loop(&rx))
            .map_err(|err| FluxError::internal(format!("failed to spawn {thread_name}: {err}")))?;
        Ok(Self { tx, join })
    }

    /// Registers `task` to fire at `at`. Returns false if the timer thread is gone.
    pub(crate) fn schedule(&self, at: Instant, task: TimerTask) -> bool {
        self.tx.send((at, task)).is_ok()
    }

    /// Stops the thread; pending entries run as abandoned first.
    pub(crate) fn shutdown(self) {
        drop(self.tx);
        if thread::current().id() != self.join.thread().id() {
            let _ = self.join.join();
        }
    }
}

fn timer_loop(rx: &Receiver<(Instant, TimerTask)>) {
    let mut heap = BinaryHeap::new();
    let mut seq = 0u64;

    loop {
        let next = match heap.peek() {
            None => rx.recv().ok(),
            Some(Entry { at, .. }) => {
                let timeout = at.saturating_duration_since(Instant::now());
                select! {
                    recv(rx) -> msg => match msg {
                        Ok(entry) => Some(entry),
                        Err(_) => break,
                    },
                    default(timeout) => None,
                }
            }
        };

        match next {
            Some((at, task)) => {
                seq += 1;
                heap.push(Entry { at, seq, task });
            }
            None if heap.is_empty() => break,
            None => {}
        }

        let now = Instant::now();
        while heap.peek().is_some_and(|entry| entry.at <= now) {
            if let Some(entry) = heap.pop() {
                (entry.task)(Fire::Due);
            }
        }
    }

    trace!(pending = heap.len(), "timer thread exiting");
    for entry in heap.into_vec() {
        (entry.task)(Fire::Abandoned);
    }
}
