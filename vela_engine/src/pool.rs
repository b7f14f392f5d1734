//! Request-processor pool.
//!
//! A fixed set of worker threads drains a mutex-protected FIFO queue.
//! Producers wake a worker only when none is active or the backlog per
//! active worker grows past the threshold; workers that just processed
//! a burst spin-read the queue depth before sleeping, with a limit that
//! doubles while wakeups arrive faster than [`SPIN_TIMEOUT_NS`] and
//! resets once they slow down. Session teardown racing in-flight
//! messages is deferred to whichever worker drains the last one.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use vela::consts::{RP_INIT_QUEUE_CAP, RP_REQ_PER_THREAD, SPIN_MAX, SPIN_MIN, SPIN_TIMEOUT_NS};
use vela::msg::Msg;

use crate::error::{EngineError, EngineResult};
use crate::session::Session;

/// Message sink the pool dispatches into.
pub trait Dispatcher: Send + Sync + 'static {
    /// Handle one message of `session`; always produces exactly one
    /// response through the transport.
    fn dispatch(&self, session: &Arc<Session>, msg: Msg);

    /// Tear down a session whose last in-flight message drained after
    /// a stop request.
    fn session_cleanup(&self, session: &Arc<Session>);
}

/// A queued `(session, message)` pair; both `None` is the shutdown
/// sentinel.
struct QueueItem {
    session: Option<Arc<Session>>,
    msg: Option<Msg>,
}

impl QueueItem {
    const SENTINEL: Self = Self {
        session: None,
        msg: None,
    };
}

struct PoolShared {
    queue: Mutex<VecDeque<QueueItem>>,
    /// Queue depth mirror read by the spin loop without the mutex.
    depth: AtomicUsize,
    cond: Condvar,
    stop: AtomicBool,
    active: AtomicUsize,
    spin_limit: AtomicU32,
    last_wakeup_ns: AtomicU64,
    dispatcher: Arc<dyn Dispatcher>,
    workers_total: usize,
}

static MONO_BASE: LazyLock<Instant> = LazyLock::new(Instant::now);

fn monotonic_ns() -> u64 {
    MONO_BASE.elapsed().as_nanos() as u64
}

/// The worker pool and its queue.
pub struct RequestPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

impl RequestPool {
    /// Spawn `workers` threads draining the queue into `dispatcher`.
    pub fn new(workers: usize, dispatcher: Arc<dyn Dispatcher>) -> Self {
        assert!(workers > 0, "request pool needs at least one worker");
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::with_capacity(RP_INIT_QUEUE_CAP)),
            depth: AtomicUsize::new(0),
            cond: Condvar::new(),
            stop: AtomicBool::new(false),
            // Workers count as active until their first sleep.
            active: AtomicUsize::new(workers),
            spin_limit: AtomicU32::new(0),
            last_wakeup_ns: AtomicU64::new(0),
            dispatcher,
            workers_total: workers,
        });

        let handles = (0..workers)
            .map(|n| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("vela-rp-{n}"))
                    .spawn(move || worker_loop(&shared))
                    .expect("spawning request-pool worker")
            })
            .collect();

        Self {
            shared,
            workers: handles,
        }
    }

    /// Enqueue one message for `session`.
    pub fn process(&self, session: &Arc<Session>, msg: Msg) -> EngineResult<()> {
        if self.shared.stop.load(Ordering::Acquire) {
            return Err(EngineError::PoolStopped);
        }
        session.begin_msg();

        let depth = {
            let mut queue = self.shared.queue.lock();
            queue.push_back(QueueItem {
                session: Some(Arc::clone(session)),
                msg: Some(msg),
            });
            let depth = queue.len();
            self.shared.depth.store(depth, Ordering::Release);
            depth
        };

        self.adapt_spin_limit();
        self.maybe_wake(depth);
        Ok(())
    }

    /// Raise the spin limit while wakeups arrive in quick succession,
    /// reset it once they slow down.
    fn adapt_spin_limit(&self) {
        let now = monotonic_ns();
        let last = self.shared.last_wakeup_ns.load(Ordering::Relaxed);
        let limit = &self.shared.spin_limit;
        if now.saturating_sub(last) < SPIN_TIMEOUT_NS {
            let current = limit.load(Ordering::Relaxed);
            let raised = if current == 0 {
                SPIN_MIN
            } else {
                current.saturating_mul(2).min(SPIN_MAX)
            };
            limit.store(raised, Ordering::Relaxed);
        } else {
            limit.store(0, Ordering::Relaxed);
        }
    }

    fn maybe_wake(&self, depth: usize) {
        let active = self.shared.active.load(Ordering::Acquire);
        let overloaded = active < self.shared.workers_total
            && depth / active.max(1) > RP_REQ_PER_THREAD;
        if active == 0 || overloaded {
            self.shared.cond.notify_one();
            self.shared
                .last_wakeup_ns
                .store(monotonic_ns(), Ordering::Relaxed);
        }
    }

    /// Request deferred teardown of `session`.
    ///
    /// With no message in flight the cleanup runs here and `true` is
    /// returned; otherwise the worker draining the last message runs it
    /// and this returns `false`.
    pub fn session_stop(&self, session: &Arc<Session>) -> bool {
        session.request_stop();
        if session.inflight() == 0 && session.claim_cleanup() {
            self.shared.dispatcher.session_cleanup(session);
            return true;
        }
        false
    }

    /// Stop the workers, join them and drain residual messages.
    pub fn shutdown(mut self) {
        self.shared.stop.store(true, Ordering::Release);
        {
            let mut queue = self.shared.queue.lock();
            for _ in 0..self.shared.workers_total {
                queue.push_back(QueueItem::SENTINEL);
            }
            self.shared.depth.store(queue.len(), Ordering::Release);
        }
        self.shared.cond.notify_all();

        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("request-pool worker panicked");
            }
        }

        // Residual messages are dropped unanswered; their in-flight
        // accounting still resolves deferred teardown.
        let mut queue = self.shared.queue.lock();
        while let Some(item) = queue.pop_front() {
            if let Some(session) = item.session {
                if session.finish_msg() && session.claim_cleanup() {
                    self.shared.dispatcher.session_cleanup(&session);
                }
            }
        }
        self.shared.depth.store(0, Ordering::Release);
        tracing::debug!("request pool stopped");
    }
}

fn worker_loop(shared: &PoolShared) {
    // Whether this thread processed a message since its last wakeup;
    // only then is spinning before sleep worth the cycles.
    let mut processed = false;
    let mut queue = shared.queue.lock();
    loop {
        if let Some(item) = queue.pop_front() {
            shared.depth.store(queue.len(), Ordering::Release);
            drop(queue);

            let (session, msg) = match (item.session, item.msg) {
                (Some(session), Some(msg)) => (session, msg),
                _ => {
                    // Shutdown sentinel.
                    shared.active.fetch_sub(1, Ordering::AcqRel);
                    return;
                }
            };
            shared.dispatcher.dispatch(&session, msg);
            if session.finish_msg() && session.claim_cleanup() {
                shared.dispatcher.session_cleanup(&session);
            }
            processed = true;

            queue = shared.queue.lock();
            continue;
        }

        if shared.stop.load(Ordering::Acquire) {
            shared.active.fetch_sub(1, Ordering::AcqRel);
            return;
        }

        if processed {
            // Burst amortization: watch the depth mirror for a moment
            // before paying the sleep/wake round trip.
            processed = false;
            drop(queue);
            let limit = shared.spin_limit.load(Ordering::Relaxed);
            let mut spins = 0u32;
            while spins < limit && shared.depth.load(Ordering::Acquire) == 0 {
                std::hint::spin_loop();
                spins += 1;
            }
            queue = shared.queue.lock();
            continue;
        }

        shared.active.fetch_sub(1, Ordering::AcqRel);
        shared.cond.wait(&mut queue);
        shared.active.fetch_add(1, Ordering::AcqRel);
        if shared.stop.load(Ordering::Acquire) && queue.is_empty() {
            shared.active.fetch_sub(1, Ordering::AcqRel);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ConnKind, LocalIds, SessionManager};
    use vela::msg::Request;

    struct CountingDispatcher {
        dispatched: AtomicUsize,
        cleaned: AtomicUsize,
    }

    impl Dispatcher for CountingDispatcher {
        fn dispatch(&self, _session: &Arc<Session>, _msg: Msg) {
            self.dispatched.fetch_add(1, Ordering::SeqCst);
        }
        fn session_cleanup(&self, _session: &Arc<Session>) {
            self.cleaned.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_session() -> Arc<Session> {
        let mgr = SessionManager::new(Arc::new(LocalIds::default()));
        let conn = mgr.connection_start(ConnKind::Client, 1).unwrap();
        mgr.session_create(&conn, 0, 0)
    }

    #[test]
    fn messages_drain_and_counters_settle() {
        let dispatcher = Arc::new(CountingDispatcher {
            dispatched: AtomicUsize::new(0),
            cleaned: AtomicUsize::new(0),
        });
        let pool = RequestPool::new(2, Arc::clone(&dispatcher) as Arc<dyn Dispatcher>);
        let session = test_session();

        for _ in 0..8 {
            pool.process(&session, Msg::Request(Request::ListSchemas))
                .unwrap();
        }
        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        while session.inflight() > 0 && Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(session.inflight(), 0);
        assert_eq!(dispatcher.dispatched.load(Ordering::SeqCst), 8);

        pool.shutdown();
    }

    #[test]
    fn stop_without_inflight_cleans_immediately() {
        let dispatcher = Arc::new(CountingDispatcher {
            dispatched: AtomicUsize::new(0),
            cleaned: AtomicUsize::new(0),
        });
        let pool = RequestPool::new(1, Arc::clone(&dispatcher) as Arc<dyn Dispatcher>);
        let session = test_session();

        assert!(pool.session_stop(&session));
        assert_eq!(dispatcher.cleaned.load(Ordering::SeqCst), 1);
        // A second stop is a no-op thanks to the exactly-once claim.
        assert!(!pool.session_stop(&session));
        assert_eq!(dispatcher.cleaned.load(Ordering::SeqCst), 1);

        pool.shutdown();
    }

    #[test]
    fn enqueue_after_shutdown_fails() {
        let dispatcher = Arc::new(CountingDispatcher {
            dispatched: AtomicUsize::new(0),
            cleaned: AtomicUsize::new(0),
        });
        let pool = RequestPool::new(1, Arc::clone(&dispatcher) as Arc<dyn Dispatcher>);
        let session = test_session();
        let shared = Arc::clone(&pool.shared);
        pool.shutdown();

        let pool = RequestPool {
            shared,
            workers: Vec::new(),
        };
        assert!(matches!(
            pool.process(&session, Msg::Request(Request::ListSchemas)),
            Err(EngineError::PoolStopped)
        ));
    }

    #[test]
    fn spin_limit_doubles_and_resets() {
        let dispatcher = Arc::new(CountingDispatcher {
            dispatched: AtomicUsize::new(0),
            cleaned: AtomicUsize::new(0),
        });
        let pool = RequestPool::new(1, dispatcher as Arc<dyn Dispatcher>);

        // Rapid wakeups double the limit up to the cap.
        pool.shared
            .last_wakeup_ns
            .store(monotonic_ns(), Ordering::Relaxed);
        pool.adapt_spin_limit();
        assert_eq!(pool.shared.spin_limit.load(Ordering::Relaxed), SPIN_MIN);
        pool.shared
            .last_wakeup_ns
            .store(monotonic_ns(), Ordering::Relaxed);
        pool.adapt_spin_limit();
        assert_eq!(pool.shared.spin_limit.load(Ordering::Relaxed), SPIN_MIN * 2);
        for _ in 0..32 {
            pool.shared
                .last_wakeup_ns
                .store(monotonic_ns(), Ordering::Relaxed);
            pool.adapt_spin_limit();
        }
        assert_eq!(pool.shared.spin_limit.load(Ordering::Relaxed), SPIN_MAX);

        // An interval above the threshold resets to zero.
        pool.shared
            .last_wakeup_ns
            .store(monotonic_ns(), Ordering::Relaxed);
        std::thread::sleep(std::time::Duration::from_micros(700));
        pool.adapt_spin_limit();
        assert_eq!(pool.shared.spin_limit.load(Ordering::Relaxed), 0);

        pool.shutdown();
    }
}
