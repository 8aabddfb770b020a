use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use heapless::mpmc::Queue as MpMcQueue;
use tracing::warn;
use crate::core::RX_FIFO_CAPACITY;

/// How a blocking wait ended. Callers always learn whether they were
/// woken, ran out of time, or lost the queue itself, instead of
/// decoding a single return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Woken,
    TimedOut,
    Cancelled,
}

struct WaitState {
    closed: bool,
}

/// Park-and-wake primitive shared between edge context and user context.
/// Producers make their state visible, then notify; the waiter re-checks
/// its readiness predicate under the queue lock, so no wakeup is lost.
pub struct WaitQueue {
    state: Mutex<WaitState>,
    cv: Condvar,
}

impl WaitQueue {
    pub fn new() -> WaitQueue {
        WaitQueue {
            state: Mutex::new(WaitState { closed: false }),
            cv: Condvar::new(),
        }
    }

    pub fn notify_all(&self) {
        let _guard = self.state.lock().unwrap();
        self.cv.notify_all();
    }

    /// Cancel every current and future wait. Used on endpoint tear-down.
    pub fn close(&self) {
        let mut guard = self.state.lock().unwrap();
        guard.closed = true;
        self.cv.notify_all();
    }

    pub fn wait<F>(&self, mut ready: F, timeout: Option<Duration>) -> WaitOutcome
    where
        F: FnMut() -> bool,
    {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.state.lock().unwrap();
        loop {
            if guard.closed {
                return WaitOutcome::Cancelled;
            }
            if ready() {
                return WaitOutcome::Woken;
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitOutcome::TimedOut;
                    }
                    let (g, _) = self.cv.wait_timeout(guard, deadline - now).unwrap();
                    guard = g;
                }
                None => {
                    guard = self.cv.wait(guard).unwrap();
                }
            }
        }
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

struct TimerState {
    deadline: Option<Instant>,
    shutdown: bool,
}

struct TimerInner {
    state: Mutex<TimerState>,
    cv: Condvar,
}

/// One-shot watchdog on its own thread. Arming moves the deadline,
/// disarming clears it; on expiry the callback runs on the timer thread
/// with no timer lock held, so it is free to take the owner's locks.
pub struct StateTimer {
    inner: Arc<TimerInner>,
    thread: Option<JoinHandle<()>>,
}

impl StateTimer {
    pub fn spawn(name: &str, callback: Box<dyn Fn() + Send>) -> StateTimer {
        let inner = Arc::new(TimerInner {
            state: Mutex::new(TimerState {
                deadline: None,
                shutdown: false,
            }),
            cv: Condvar::new(),
        });
        let runner = Arc::clone(&inner);
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || Self::run(runner, callback))
            .expect("watchdog thread");
        StateTimer {
            inner,
            thread: Some(thread),
        }
    }

    fn run(inner: Arc<TimerInner>, callback: Box<dyn Fn() + Send>) {
        let mut guard = inner.state.lock().unwrap();
        loop {
            if guard.shutdown {
                return;
            }
            match guard.deadline {
                None => {
                    guard = inner.cv.wait(guard).unwrap();
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        guard.deadline = None;
                        drop(guard);
                        callback();
                        guard = inner.state.lock().unwrap();
                    } else {
                        let (g, _) = inner.cv.wait_timeout(guard, deadline - now).unwrap();
                        guard = g;
                    }
                }
            }
        }
    }

    pub fn arm(&self, after: Duration) {
        let mut guard = self.inner.state.lock().unwrap();
        guard.deadline = Some(Instant::now() + after);
        self.inner.cv.notify_all();
    }

    pub fn disarm(&self) {
        let mut guard = self.inner.state.lock().unwrap();
        guard.deadline = None;
        self.inner.cv.notify_all();
    }
}

impl Drop for StateTimer {
    fn drop(&mut self) {
        {
            let mut guard = self.inner.state.lock().unwrap();
            guard.shutdown = true;
            self.inner.cv.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            // the owner can be dropped from inside the expiry callback;
            // the loop sees shutdown and exits detached in that case
            if thread.thread().id() == thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                warn!("watchdog thread panicked");
            }
        }
    }
}

/// Bounded byte FIFO between the edge path (producer) and the reader
/// (consumer). Occupancy is tracked next to the lock-free queue so the
/// producer can refuse a payload that does not fit as a whole.
pub struct ByteFifo {
    queue: MpMcQueue<u8, RX_FIFO_CAPACITY>,
    used: AtomicUsize,
}

impl ByteFifo {
    pub fn new() -> ByteFifo {
        ByteFifo {
            queue: MpMcQueue::new(),
            used: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        RX_FIFO_CAPACITY
    }

    pub fn len(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn available(&self) -> usize {
        self.capacity() - self.len()
    }

    pub fn push(&self, byte: u8) -> bool {
        match self.queue.enqueue(byte) {
            Ok(()) => {
                self.used.fetch_add(1, Ordering::SeqCst);
                true
            }
            Err(_) => false,
        }
    }

    pub fn pop(&self) -> Option<u8> {
        let byte = self.queue.dequeue()?;
        self.used.fetch_sub(1, Ordering::SeqCst);
        Some(byte)
    }

    pub fn clear(&self) {
        while self.pop().is_some() {}
    }
}

impl Default for ByteFifo {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn wait_times_out() {
        let wq = WaitQueue::new();
        let start = Instant::now();
        let outcome = wq.wait(|| false, Some(Duration::from_millis(30)));
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn wait_wakes_on_notify() {
        let wq = Arc::new(WaitQueue::new());
        let flag = Arc::new(AtomicBool::new(false));

        let wq2 = Arc::clone(&wq);
        let flag2 = Arc::clone(&flag);
        let waker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            flag2.store(true, Ordering::SeqCst);
            wq2.notify_all();
        });

        let f = Arc::clone(&flag);
        let outcome = wq.wait(|| f.load(Ordering::SeqCst), Some(Duration::from_secs(5)));
        assert_eq!(outcome, WaitOutcome::Woken);
        waker.join().unwrap();
    }

    #[test]
    fn close_cancels_waiters() {
        let wq = Arc::new(WaitQueue::new());
        let wq2 = Arc::clone(&wq);
        let closer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            wq2.close();
        });
        let outcome = wq.wait(|| false, Some(Duration::from_secs(5)));
        assert_eq!(outcome, WaitOutcome::Cancelled);
        closer.join().unwrap();
    }

    #[test]
    fn timer_fires_once_after_arm() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let timer = StateTimer::spawn("test-timer", Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        timer.arm(Duration::from_millis(20));
        thread::sleep(Duration::from_millis(120));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disarm_prevents_firing() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let timer = StateTimer::spawn("test-timer", Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        timer.arm(Duration::from_millis(50));
        timer.disarm();
        thread::sleep(Duration::from_millis(150));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn rearm_pushes_deadline_forward() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let timer = StateTimer::spawn("test-timer", Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        timer.arm(Duration::from_millis(60));
        thread::sleep(Duration::from_millis(30));
        timer.arm(Duration::from_millis(60));
        thread::sleep(Duration::from_millis(40));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fifo_tracks_occupancy() {
        let fifo = ByteFifo::new();
        assert!(fifo.is_empty());
        assert_eq!(fifo.available(), RX_FIFO_CAPACITY);
        for i in 0..100u8 {
            assert!(fifo.push(i));
        }
        assert_eq!(fifo.len(), 100);
        assert_eq!(fifo.available(), RX_FIFO_CAPACITY - 100);
        for i in 0..100u8 {
            assert_eq!(fifo.pop(), Some(i));
        }
        assert_eq!(fifo.pop(), None);
        assert!(fifo.is_empty());
    }

    #[test]
    fn fifo_refuses_past_capacity() {
        let fifo = ByteFifo::new();
        for _ in 0..RX_FIFO_CAPACITY {
            assert!(fifo.push(0xAA));
        }
        assert!(!fifo.push(0xAA));
        assert_eq!(fifo.available(), 0);
        fifo.clear();
        assert!(fifo.is_empty());
        assert!(fifo.push(0x55));
    }
}
