//! The invokable queue: control-plane work dispatched to the audio thread.
//!
//! Any user thread may enqueue a closure; the audio thread drains a bounded
//! number per block before generating audio. The waitable form blocks the
//! caller until the closure has run and hands its return value back, which
//! is how property reads observe the audio-thread-visible state.

use crate::config;
use crate::error::{Result, SonanceError};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

type InvokableFn = Box<dyn FnOnce() + Send>;

pub(crate) struct InvokableQueue {
    tx: Sender<InvokableFn>,
    rx: Receiver<InvokableFn>,
}

impl InvokableQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    /// Enqueue a fire-and-forget invokable. Fails only once the context has
    /// shut down and the queue is closed.
    pub fn enqueue(&self, f: InvokableFn) -> Result<()> {
        self.tx.send(f).map_err(|_| SonanceError::Shutdown)
    }

    /// Run up to `config::MAX_INVOKABLES_PER_BLOCK` queued invokables;
    /// anything beyond that waits for the next block. Returns how many ran.
    pub fn drain_some(&self) -> usize {
        let mut ran = 0;
        while ran < config::MAX_INVOKABLES_PER_BLOCK {
            match self.rx.try_recv() {
                Ok(f) => {
                    f();
                    ran += 1;
                }
                Err(_) => break,
            }
        }
        ran
    }

    /// Run everything queued, without the per-block bound. Shutdown path
    /// only: pending invokables always run so invariants (and waiters) are
    /// preserved.
    pub fn drain_all(&self) -> usize {
        let mut ran = 0;
        while let Ok(f) = self.rx.try_recv() {
            f();
            ran += 1;
        }
        ran
    }

    /// Enqueue `f` as a waitable invokable and block until it has run,
    /// returning its result. `dead` reports whether the consumer thread is
    /// gone: checked before enqueueing (fail fast) and again after. A
    /// waitable that observes death completes with the shutdown error; the
    /// caller still drains the queue so other blocked waiters are released
    /// rather than hanging on a thread that will never run again.
    pub fn call<R, F>(&self, dead: impl Fn() -> bool, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if dead() {
            return Err(SonanceError::Shutdown);
        }
        let (done_tx, done_rx) = bounded(1);
        self.enqueue(Box::new(move || {
            let _ = done_tx.send(f());
        }))?;
        if dead() {
            self.drain_all();
            return Err(SonanceError::Shutdown);
        }
        done_rx.recv().map_err(|_| SonanceError::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn drain_runs_in_fifo_order() {
        let queue = InvokableQueue::new();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = log.clone();
            queue
                .enqueue(Box::new(move || log.lock().unwrap().push(i)))
                .unwrap();
        }
        assert_eq!(queue.drain_some(), 3);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn drain_some_is_bounded() {
        let queue = InvokableQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..(config::MAX_INVOKABLES_PER_BLOCK + 5) {
            let counter = counter.clone();
            queue
                .enqueue(Box::new(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                }))
                .unwrap();
        }
        assert_eq!(queue.drain_some(), config::MAX_INVOKABLES_PER_BLOCK);
        assert_eq!(queue.drain_all(), 5);
        assert_eq!(
            counter.load(Ordering::Relaxed),
            config::MAX_INVOKABLES_PER_BLOCK + 5
        );
    }

    #[test]
    fn call_returns_the_closure_result() {
        let queue = Arc::new(InvokableQueue::new());
        let drainer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                // Poll until the waitable shows up.
                while queue.drain_all() == 0 {
                    std::thread::yield_now();
                }
            })
        };
        let result = queue.call(|| false, || 40 + 2).unwrap();
        assert_eq!(result, 42);
        drainer.join().unwrap();
    }

    #[test]
    fn call_on_a_dead_queue_fails_instead_of_hanging() {
        let queue = InvokableQueue::new();
        let err = queue.call(|| true, || ()).unwrap_err();
        assert!(matches!(err, SonanceError::Shutdown));
    }

    #[test]
    fn call_reports_shutdown_when_consumer_dies_after_enqueue() {
        use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
        let queue = InvokableQueue::new();
        let died = AtomicBool::new(false);
        let ran = Arc::new(AtomicUsize::new(0));
        // Dies "between" the enqueue and the wait: the first check passes,
        // the second sees it dead. The invokable still runs (the caller
        // drains for any other waiters) but this call reports shutdown
        // rather than the computed value.
        let observer = ran.clone();
        let result = queue.call(
            || died.swap(true, Ordering::AcqRel),
            move || {
                observer.fetch_add(1, Ordering::AcqRel);
                7
            },
        );
        assert!(matches!(result, Err(SonanceError::Shutdown)));
        assert_eq!(ran.load(Ordering::Acquire), 1);
    }
}
