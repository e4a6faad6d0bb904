//! Injected timer and clock service.
//!
//! Both core components take time as a dependency rather than reaching for
//! a process global: `TimeSource` supplies a monotonic millisecond clock,
//! and `TimerService` fires one-shot and periodic events either on its own
//! worker thread (`spawn`) or when an embedding loop calls `run_due`
//! (`new`). Tests substitute `ManualTime` and drive the service directly.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Monotonic millisecond clock.
pub trait TimeSource: Send + Sync {
    /// Milliseconds elapsed since an arbitrary fixed origin.
    fn now_ms(&self) -> u64;
}

/// Wall-driven `TimeSource` backed by `Instant`.
pub struct MonotonicTime {
    origin: Instant,
}

impl MonotonicTime {
    /// Clock whose origin is the moment of construction.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicTime {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicTime {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Hand-driven `TimeSource` for tests and simulations.
pub struct ManualTime {
    now: AtomicU64,
}

impl ManualTime {
    /// Clock starting at zero.
    pub fn new() -> Self {
        Self {
            now: AtomicU64::new(0),
        }
    }

    /// Move the clock forward by `ms`.
    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    /// Jump the clock to an absolute value. Must not move backwards.
    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Default for ManualTime {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for ManualTime {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Something the timer can fire. Handlers must not block.
pub trait TimedEvent: Send + Sync {
    /// Called once the scheduled instant has passed.
    fn time_reached(&self);
}

/// Opaque ticket for a scheduled event, used to cancel it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerHandle(u64);

struct Scheduled {
    event: Arc<dyn TimedEvent>,
    period_ms: Option<u64>,
}

#[derive(Default)]
struct TimerState {
    // Heap entries for cancelled ids linger as tombstones; the events map
    // is the source of truth.
    heap: BinaryHeap<Reverse<(u64, u64)>>,
    events: HashMap<u64, Scheduled>,
}

struct TimerInner {
    time: Arc<dyn TimeSource>,
    state: Mutex<TimerState>,
    wakeup: Condvar,
    shutdown: AtomicBool,
    next_id: AtomicU64,
}

/// One-shot and periodic event scheduling over an injected clock.
pub struct TimerService {
    inner: Arc<TimerInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    /// Manual-mode service: nothing fires until `run_due` is called.
    pub fn new(time: Arc<dyn TimeSource>) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                time,
                state: Mutex::new(TimerState::default()),
                wakeup: Condvar::new(),
                shutdown: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Service with a background worker that fires due events.
    pub fn spawn(time: Arc<dyn TimeSource>) -> Self {
        let service = Self::new(time);
        let inner = Arc::clone(&service.inner);
        let handle = thread::spawn(move || worker_loop(&inner));
        *service.worker.lock() = Some(handle);
        service
    }

    /// Current clock reading.
    pub fn now_ms(&self) -> u64 {
        self.inner.time.now_ms()
    }

    /// Fire `event` once, `delay_ms` from now.
    pub fn schedule(&self, event: Arc<dyn TimedEvent>, delay_ms: u64) -> TimerHandle {
        self.schedule_inner(event, delay_ms, None)
    }

    /// Fire `event` every `period_ms` until cancelled.
    pub fn schedule_every(&self, event: Arc<dyn TimedEvent>, period_ms: u64) -> TimerHandle {
        self.schedule_inner(event, period_ms, Some(period_ms.max(1)))
    }

    fn schedule_inner(
        &self,
        event: Arc<dyn TimedEvent>,
        delay_ms: u64,
        period_ms: Option<u64>,
    ) -> TimerHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let fire_at = self.inner.time.now_ms().saturating_add(delay_ms);
        let mut state = self.inner.state.lock();
        state.heap.push(Reverse((fire_at, id)));
        state.events.insert(id, Scheduled { event, period_ms });
        drop(state);
        self.inner.wakeup.notify_all();
        TimerHandle(id)
    }

    /// Best-effort cancellation. Returns whether the event was still pending.
    pub fn cancel(&self, handle: TimerHandle) -> bool {
        self.inner.state.lock().events.remove(&handle.0).is_some()
    }

    /// Number of events still pending.
    pub fn pending(&self) -> usize {
        self.inner.state.lock().events.len()
    }

    /// Fire everything whose instant has passed, on the calling thread.
    /// Returns the number of events fired.
    pub fn run_due(&self) -> usize {
        let mut fired = 0;
        loop {
            let due = collect_due(&self.inner);
            if due.is_empty() {
                return fired;
            }
            for event in due {
                event.time_reached();
                fired += 1;
            }
        }
    }

    /// Stop the worker thread, if any, and wait for it to exit.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.wakeup.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.wakeup.notify_all();
    }
}

/// Pop every due entry, re-arming periodic ones, and hand back the events
/// so the caller fires them outside the lock.
fn collect_due(inner: &TimerInner) -> Vec<Arc<dyn TimedEvent>> {
    let now = inner.time.now_ms();
    let mut due = Vec::new();
    let mut state = inner.state.lock();
    loop {
        let (fire_at, id) = match state.heap.peek() {
            Some(&Reverse(entry)) => entry,
            None => break,
        };
        if fire_at > now {
            break;
        }
        state.heap.pop();
        let (event, period_ms) = match state.events.get(&id) {
            Some(scheduled) => (Arc::clone(&scheduled.event), scheduled.period_ms),
            None => continue, // cancelled, tombstone
        };
        match period_ms {
            Some(period) => state.heap.push(Reverse((now + period, id))),
            None => {
                state.events.remove(&id);
            }
        }
        due.push(event);
    }
    due
}

fn worker_loop(inner: &Arc<TimerInner>) {
    loop {
        if inner.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let due = collect_due(inner);
        for event in due {
            event.time_reached();
        }
        let mut state = inner.state.lock();
        if inner.shutdown.load(Ordering::SeqCst) {
            return;
        }
        match state.heap.peek() {
            Some(&Reverse((fire_at, _))) => {
                let now = inner.time.now_ms();
                if fire_at > now {
                    inner
                        .wakeup
                        .wait_for(&mut state, Duration::from_millis(fire_at - now));
                }
            }
            None => {
                inner.wakeup.wait(&mut state);
            }
        }
    }
}
