// src/clock.rs
//
// Virtual clock shared by all camera workers. A single ticker thread
// advances the tick at a fixed wall-clock interval; workers consume ticks
// through `wait_for_tick`, which caps any worker at `max_skew` ticks ahead
// of the slowest still-active worker. Workers that stop marking progress
// are evicted from skew accounting so they cannot stall the others.

use anyhow::{Context, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const WAIT_SLICE: Duration = Duration::from_millis(500);

struct ClockState {
    tick: u64,
    running: bool,
    /// Last tick each active worker has marked as consumed.
    seen: HashMap<String, u64>,
    /// Wall-clock time of each worker's last mark (or registration).
    last_seen: HashMap<String, Instant>,
}

pub struct VirtualClock {
    interval: Duration,
    max_skew: u64,
    stall_timeout: Duration,
    state: Mutex<ClockState>,
    cv: Condvar,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl VirtualClock {
    pub fn new(interval: Duration, max_skew: u64, stall_timeout: Duration) -> Self {
        Self {
            interval,
            max_skew,
            stall_timeout,
            state: Mutex::new(ClockState {
                tick: 0,
                running: true,
                seen: HashMap::new(),
                last_seen: HashMap::new(),
            }),
            cv: Condvar::new(),
            ticker: Mutex::new(None),
        }
    }

    /// Add a worker to skew accounting. A freshly registered worker starts
    /// at the current tick so a mid-run restart does not drag the minimum
    /// back to zero.
    pub fn register(&self, worker: &str) {
        let mut st = self.state.lock();
        let tick = st.tick;
        st.seen.insert(worker.to_string(), tick);
        st.last_seen.insert(worker.to_string(), Instant::now());
        self.cv.notify_all();
    }

    /// Begin the ticking loop. Idempotent; a clock without a running
    /// ticker would leave every worker blocked at tick 0, so a spawn
    /// failure is an error, not a warning.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut ticker = self.ticker.lock();
        if ticker.is_some() {
            return Ok(());
        }
        let clock = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("virtual-clock".into())
            .spawn(move || clock.run_ticker())
            .context("failed to spawn clock ticker thread")?;
        *ticker = Some(handle);
        Ok(())
    }

    fn run_ticker(&self) {
        let mut next = Instant::now() + self.interval;
        loop {
            let now = Instant::now();
            if next > now {
                thread::sleep(next - now);
            }
            {
                let mut st = self.state.lock();
                if !st.running {
                    break;
                }
                st.tick += 1;
                self.cv.notify_all();
            }
            next += self.interval;
        }
        debug!("clock ticker stopped");
    }

    /// Block until a tick newer than `last_consumed` is available to this
    /// worker, or the clock is stopped (`None`). The granted tick is
    /// `min(global tick, slowest active worker + max_skew)`; stalled
    /// workers are evicted before the minimum is taken.
    pub fn wait_for_tick(&self, worker: &str, last_consumed: u64) -> Option<u64> {
        let mut st = self.state.lock();
        loop {
            if !st.running {
                return None;
            }
            self.evict_stalled(&mut st);

            let target = st.tick;
            let min_seen = st.seen.values().min().copied().unwrap_or(target);
            let next = target.min(min_seen + self.max_skew);
            if next > last_consumed {
                return Some(next);
            }
            // Bounded wait guards against missed wakeups; the next clock
            // tick or another worker's mark notifies earlier.
            self.cv.wait_for(&mut st, WAIT_SLICE);
        }
    }

    fn evict_stalled(&self, st: &mut ClockState) {
        let now = Instant::now();
        let stale: Vec<String> = st
            .last_seen
            .iter()
            .filter(|(_, ts)| now.duration_since(**ts) > self.stall_timeout)
            .map(|(name, _)| name.clone())
            .collect();
        for name in stale {
            warn!("worker {name} stalled, evicting from skew accounting");
            st.seen.remove(&name);
            st.last_seen.remove(&name);
        }
    }

    /// Record that `worker` has consumed `tick`. Wakes all waiters: a slow
    /// worker catching up can unblock everyone waiting on the minimum. An
    /// evicted worker is not re-registered by marking.
    pub fn mark(&self, worker: &str, tick: u64) {
        let mut st = self.state.lock();
        if let Some(seen) = st.seen.get_mut(worker) {
            *seen = tick;
            st.last_seen.insert(worker.to_string(), Instant::now());
        }
        self.cv.notify_all();
    }

    /// Remove a worker from skew accounting on clean shutdown.
    pub fn retire(&self, worker: &str) {
        let mut st = self.state.lock();
        st.seen.remove(worker);
        st.last_seen.remove(worker);
        self.cv.notify_all();
        debug!("worker {worker} retired from clock");
    }

    /// Halt ticking and wake all waiters with the closed sentinel.
    pub fn stop(&self) {
        {
            let mut st = self.state.lock();
            st.running = false;
            self.cv.notify_all();
        }
        if let Some(handle) = self.ticker.lock().take() {
            let _ = handle.join();
        }
        info!("virtual clock stopped");
    }

    pub fn current_tick(&self) -> u64 {
        self.state.lock().tick
    }

    pub fn active_workers(&self) -> usize {
        self.state.lock().seen.len()
    }
}
