//! Interval-refilled token bucket

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Token bucket refilled with one quantum per elapsed interval.
///
/// The capacity equals one quantum, so over any window of length `w` at most
/// `rate * w + quantum` tokens can be taken.
pub struct TokenBucket {
    /// Tokens added per interval, also the bucket capacity. `None` = unlimited.
    quantum: Option<u64>,
    interval: Duration,
    state: Mutex<BucketState>,
    total_consumed: AtomicU64,
    total_wait_us: AtomicU64,
}

struct BucketState {
    balance: u64,
    next_refill: Instant,
}

impl TokenBucket {
    /// Create a bucket sustaining `rate_per_sec` tokens; 0 disables throttling
    pub fn new(rate_per_sec: u64, interval: Duration) -> Self {
        let quantum = (rate_per_sec > 0).then(|| {
            let per_interval = rate_per_sec as u128 * interval.as_millis() / 1000;
            (per_interval as u64).max(1)
        });

        Self {
            quantum,
            interval,
            state: Mutex::new(BucketState {
                balance: quantum.unwrap_or(0),
                next_refill: Instant::now() + interval,
            }),
            total_consumed: AtomicU64::new(0),
            total_wait_us: AtomicU64::new(0),
        }
    }

    /// A bucket that never blocks
    pub fn unlimited() -> Self {
        Self::new(0, Duration::from_millis(100))
    }

    pub fn is_unlimited(&self) -> bool {
        self.quantum.is_none()
    }

    /// Tokens added per refill, which is also the burst size
    pub fn quantum(&self) -> Option<u64> {
        self.quantum
    }

    /// Take `tokens`, sleeping until enough refills have happened.
    ///
    /// Requests larger than the capacity are served piecewise, so this
    /// always completes. Returns the time spent waiting.
    pub fn consume(&self, tokens: u64) -> Duration {
        self.total_consumed.fetch_add(tokens, Ordering::Relaxed);
        let quantum = match self.quantum {
            Some(q) => q,
            None => return Duration::ZERO,
        };

        let start = Instant::now();
        let mut remaining = tokens;
        while remaining > 0 {
            let wait = {
                let mut state = self.state.lock();
                let now = Instant::now();
                self.refill(&mut state, now, quantum);

                if state.balance > 0 {
                    let take = state.balance.min(remaining);
                    state.balance -= take;
                    remaining -= take;
                    continue;
                }
                state.next_refill.saturating_duration_since(now)
            };
            std::thread::sleep(wait.max(Duration::from_millis(1)));
        }

        let waited = start.elapsed();
        self.total_wait_us
            .fetch_add(waited.as_micros() as u64, Ordering::Relaxed);
        waited
    }

    /// Tokens currently available without waiting
    pub fn available(&self) -> u64 {
        match self.quantum {
            Some(quantum) => {
                let mut state = self.state.lock();
                self.refill(&mut state, Instant::now(), quantum);
                state.balance
            }
            None => u64::MAX,
        }
    }

    pub fn total_consumed(&self) -> u64 {
        self.total_consumed.load(Ordering::Relaxed)
    }

    pub fn total_wait(&self) -> Duration {
        Duration::from_micros(self.total_wait_us.load(Ordering::Relaxed))
    }

    fn refill(&self, state: &mut BucketState, now: Instant, quantum: u64) {
        if now < state.next_refill {
            return;
        }
        let elapsed = now.duration_since(state.next_refill);
        let intervals = 1 + (elapsed.as_nanos() / self.interval.as_nanos().max(1)) as u64;
        state.balance = state
            .balance
            .saturating_add(intervals.saturating_mul(quantum))
            .min(quantum);
        let advance = self.interval.as_nanos().saturating_mul(intervals as u128);
        state.next_refill += Duration::from_nanos(advance.min(u64::MAX as u128) as u64);
    }
}
