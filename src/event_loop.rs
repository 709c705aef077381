use crate::errors::generic_error;
use anyhow::Result;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Bytes an operation resolves with, or the error it failed with. The RPC
/// pipeline never puts anything richer than a small status payload through
/// this — the event loop itself has no opinion about payload shape.
pub type OpResult = Result<Vec<u8>>;

type OpFn = dyn FnOnce(&mut v8::HandleScope, &OperationHandle) + 'static;

/// Wraps a boxed operation closure so it can sit in a queue shared across
/// threads. An operation only ever *runs* on the thread that owns the
/// isolate (inside `EventLoop::serve_one`); other threads construct one and
/// push it onto the queue (or a timer bucket) but never touch the
/// `v8::HandleScope` it closes over. That invariant is what makes this
/// sound despite the closure usually capturing kernel state that isn't
/// itself `Send`.
struct OpEnvelope(Box<OpFn>);

unsafe impl Send for OpEnvelope {}

/// A single unit of work submitted to the event loop: "run this closure
/// against the context, then report a result or an error". Each of the
/// five RPC call phases is one of these, chained by having phase N's
/// closure submit phase N+1 before it returns.
pub struct KernelLoopOperation {
    closure: Mutex<Option<OpEnvelope>>,
    outcome: Mutex<Option<OpResult>>,
    signal: Arc<(Mutex<bool>, Condvar)>,
}

impl KernelLoopOperation {
    fn new(closure: Box<OpFn>) -> Self {
        KernelLoopOperation {
            closure: Mutex::new(Some(OpEnvelope(closure))),
            outcome: Mutex::new(None),
            signal: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    fn take_closure(&self) -> Option<Box<OpFn>> {
        self.closure.lock().unwrap().take().map(|env| env.0)
    }

    fn set_outcome(&self, outcome: OpResult) {
        *self.outcome.lock().unwrap() = Some(outcome);
        let (done, condvar) = &*self.signal;
        *done.lock().unwrap() = true;
        condvar.notify_all();
    }

    /// Blocks the calling thread until this operation has run (or was
    /// cancelled by the loop closing). Used by synchronous entry points on
    /// threads other than the loop's own; a phase closure calling this on
    /// its own queue would deadlock.
    fn wait(&self) -> OpResult {
        let (done, condvar) = &*self.signal;
        let mut guard = done.lock().unwrap();
        while !*guard {
            guard = condvar.wait(guard).unwrap();
        }
        self.outcome
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| Err(generic_error("operation dropped without a result")))
    }
}

/// Passed into an operation's closure so it can report its own outcome
/// without reaching back into the loop's internals.
pub struct OperationHandle {
    op: Arc<KernelLoopOperation>,
}

impl OperationHandle {
    pub fn resolve(&self, bytes: Vec<u8>) {
        self.op.set_outcome(Ok(bytes));
    }

    pub fn reject(&self, err: anyhow::Error) {
        self.op.set_outcome(Err(err));
    }
}

type TimerBucket = BTreeMap<Instant, Vec<Arc<KernelLoopOperation>>>;

/// FIFO cooperative scheduler bound to one JS context. There is exactly one
/// real worker: whatever thread calls `serve_one`, which must be the thread
/// that owns the kernel's isolate. Delayed work (the RPC call timeout, the
/// phase-5 promise-poll backoff) is kept in a timer bucket checked on every
/// tick rather than handed to a real OS thread, so no operation closure is
/// ever required to be `Send` on its own — only the envelope that carries
/// it across the `submit`/`schedule_after` call is.
pub struct EventLoop {
    queue: Arc<Mutex<VecDeque<Arc<KernelLoopOperation>>>>,
    timers: Arc<Mutex<TimerBucket>>,
    wake_rx: mpsc::Receiver<()>,
    wake_tx: mpsc::Sender<()>,
    closed: Arc<AtomicBool>,
}

impl EventLoop {
    pub fn new() -> Self {
        let (wake_tx, wake_rx) = mpsc::channel();
        EventLoop {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            timers: Arc::new(Mutex::new(BTreeMap::new())),
            wake_rx,
            wake_tx,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A cloneable, `Send` handle that lets any thread (a transport, the
    /// watcher thread a `ContextManager` session spawns) submit work back
    /// onto this loop.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            queue: Arc::clone(&self.queue),
            timers: Arc::clone(&self.timers),
            wake: self.wake_tx.clone(),
            closed: Arc::clone(&self.closed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Idempotent. Marks the loop closed, refuses further submissions, and
    /// cancels everything still queued: each pending operation is failed so
    /// a thread blocked in `submit_and_wait` wakes up, and its closure is
    /// dropped so whatever call state it captured is released.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);

        let pending: Vec<Arc<KernelLoopOperation>> = {
            let mut queue = self.queue.lock().unwrap();
            queue.drain(..).collect()
        };
        let timers: Vec<Arc<KernelLoopOperation>> = {
            let mut timers = self.timers.lock().unwrap();
            std::mem::take(&mut *timers).into_values().flatten().collect()
        };
        for op in pending.into_iter().chain(timers) {
            drop(op.take_closure());
            op.set_outcome(Err(generic_error("kernel closed")));
        }

        let _ = self.wake_tx.send(());
    }

    /// Moves every timer whose deadline has passed onto the FIFO queue.
    fn run_expired_timers(&self) {
        let mut due = Vec::new();
        {
            let mut timers = self.timers.lock().unwrap();
            let now = Instant::now();
            let expired: Vec<Instant> = timers.range(..=now).map(|(k, _)| *k).collect();
            for deadline in expired {
                if let Some(ops) = timers.remove(&deadline) {
                    due.extend(ops);
                }
            }
        }
        if !due.is_empty() {
            let mut queue = self.queue.lock().unwrap();
            queue.extend(due);
        }
    }

    /// Runs exactly one queued operation, if any is ready within `timeout`,
    /// then performs a microtask checkpoint so promise continuations the
    /// operation registered drain before the next dequeue. Returns `true`
    /// if an operation ran.
    pub fn serve_one(&mut self, scope: &mut v8::HandleScope, timeout: Duration) -> bool {
        self.run_expired_timers();

        let op = match self.queue.lock().unwrap().pop_front() {
            Some(op) => op,
            None => {
                let _ = self.wake_rx.recv_timeout(timeout);
                self.run_expired_timers();
                match self.queue.lock().unwrap().pop_front() {
                    Some(op) => op,
                    None => return false,
                }
            }
        };

        let closure = match op.take_closure() {
            Some(closure) => closure,
            // Already run (or cancelled) by someone else; nothing to do.
            None => return true,
        };

        let handle = OperationHandle { op: Arc::clone(&op) };
        closure(scope, &handle);
        scope.perform_microtask_checkpoint();
        true
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        EventLoop::new()
    }
}

/// Cloneable submission handle. Cheap to clone and hand to background
/// threads; the `v8` types it lets callers touch only ever get touched back
/// on the loop's owning thread.
#[derive(Clone)]
pub struct LoopHandle {
    queue: Arc<Mutex<VecDeque<Arc<KernelLoopOperation>>>>,
    timers: Arc<Mutex<TimerBucket>>,
    wake: mpsc::Sender<()>,
    closed: Arc<AtomicBool>,
}

impl LoopHandle {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Enqueues a closure to run against the context on the loop's thread.
    /// Returns immediately; fails only when the kernel is already closed.
    pub fn submit(
        &self,
        closure: impl FnOnce(&mut v8::HandleScope, &OperationHandle) + 'static,
    ) -> Result<Arc<KernelLoopOperation>> {
        if self.is_closed() {
            return Err(generic_error("kernel closed"));
        }
        let op = Arc::new(KernelLoopOperation::new(Box::new(closure)));
        self.queue.lock().unwrap().push_back(Arc::clone(&op));
        let _ = self.wake.send(());
        Ok(op)
    }

    /// Submits and blocks the calling thread for the result. Only safe to
    /// call from a thread other than the loop's own — a phase closure
    /// calling this on itself would deadlock waiting on a queue it is
    /// itself stalling.
    pub fn submit_and_wait(
        &self,
        closure: impl FnOnce(&mut v8::HandleScope, &OperationHandle) + 'static,
    ) -> OpResult {
        self.submit(closure)?.wait()
    }

    /// Schedules a closure to run after `delay`, without blocking anything
    /// and without ever handing the closure to a different OS thread — it
    /// sits in a timer bucket the loop itself drains on every tick. This
    /// backs both the phase-5 promise-poll backoff and the RPC call
    /// timeout.
    pub fn schedule_after(
        &self,
        delay: Duration,
        closure: impl FnOnce(&mut v8::HandleScope, &OperationHandle) + 'static,
    ) -> Result<Arc<KernelLoopOperation>> {
        if self.is_closed() {
            return Err(generic_error("kernel closed"));
        }
        let op = Arc::new(KernelLoopOperation::new(Box::new(closure)));
        let deadline = Instant::now() + delay;
        self.timers
            .lock()
            .unwrap()
            .entry(deadline)
            .or_default()
            .push(Arc::clone(&op));
        Ok(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_scope<R>(f: impl FnOnce(&mut v8::HandleScope) -> R) -> R {
        crate::kernel::initialize_v8();
        let mut isolate = v8::Isolate::new(v8::CreateParams::default());
        let mut scope = v8::HandleScope::new(&mut isolate);
        let context = v8::Context::new(&mut scope);
        let mut scope = v8::ContextScope::new(&mut scope, context);
        f(&mut scope)
    }

    #[test]
    fn submitted_operation_runs_and_resolves() {
        with_scope(|scope| {
            let mut event_loop = EventLoop::new();
            let handle = event_loop.handle();
            let op = handle.submit(|_scope, op| op.resolve(b"ok".to_vec())).unwrap();

            let ran = event_loop.serve_one(scope, Duration::from_millis(100));
            assert!(ran);
            assert_eq!(op.wait().unwrap(), b"ok".to_vec());
        });
    }

    #[test]
    fn operations_run_in_submission_order() {
        with_scope(|scope| {
            let mut event_loop = EventLoop::new();
            let handle = event_loop.handle();
            let order = Arc::new(Mutex::new(Vec::new()));

            for i in 0..3 {
                let order = Arc::clone(&order);
                handle
                    .submit(move |_scope, op| {
                        order.lock().unwrap().push(i);
                        op.resolve(Vec::new());
                    })
                    .unwrap();
            }

            for _ in 0..3 {
                event_loop.serve_one(scope, Duration::from_millis(100));
            }

            assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        });
    }

    #[test]
    fn submitting_to_a_closed_loop_fails() {
        let event_loop = EventLoop::new();
        let handle = event_loop.handle();
        event_loop.close();
        assert!(handle.submit(|_scope, op| op.resolve(Vec::new())).is_err());
        assert!(handle
            .schedule_after(Duration::from_millis(1), |_scope, op| op.resolve(Vec::new()))
            .is_err());
    }

    #[test]
    fn closing_cancels_pending_operations() {
        let event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let op = handle.submit(|_scope, op| op.resolve(Vec::new())).unwrap();

        event_loop.close();
        event_loop.close();
        assert!(handle.is_closed());
        assert!(op.wait().is_err());
    }

    #[test]
    fn empty_queue_times_out_without_panicking() {
        with_scope(|scope| {
            let mut event_loop = EventLoop::new();
            let ran = event_loop.serve_one(scope, Duration::from_millis(10));
            assert!(!ran);
        });
    }

    #[test]
    fn scheduled_timer_runs_once_past_its_deadline() {
        with_scope(|scope| {
            let mut event_loop = EventLoop::new();
            let handle = event_loop.handle();
            handle
                .schedule_after(Duration::from_millis(5), |_scope, op| {
                    op.resolve(b"fired".to_vec())
                })
                .unwrap();

            assert!(!event_loop.serve_one(scope, Duration::from_millis(1)));
            std::thread::sleep(Duration::from_millis(10));
            assert!(event_loop.serve_one(scope, Duration::from_millis(10)));
        });
    }
}
