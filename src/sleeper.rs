//! Wall-clock waiting strategies.
//!
//! The supervisor and every worker child wait through a [`Sleeper`] so the
//! timing policy can be swapped without touching the supervision logic:
//!
//! - [`RealSleeper`]: sleeps exactly the requested time.
//! - [`FuzzySleeper`]: sleeps a random time within ±`factor` of the request,
//!   which spreads replicas of the same worker apart.
//! - [`EcoSleeper`]: optional fuzz, then sleeps in `pause_every` batches
//!   against absolute deadlines so long waits don't drift.
//!
//! Waits that must stay responsive go through [`Sleeper::sleep_unless`],
//! which sleeps in short slices and checks a stop condition between them.

use std::time::{Duration, Instant};

use rand::Rng;

/// Deadlines closer than this are treated as already reached.
const DEADLINE_SLACK: Duration = Duration::from_millis(10);

/// Abstracts waiting on the wall clock.
pub trait Sleeper: Send + Sync {
    /// Block the calling thread for exactly `duration`.
    fn sleep(&self, duration: Duration);

    /// Current instant on the clock this sleeper waits against.
    fn now(&self) -> Instant {
        Instant::now()
    }

    /// The wait actually performed when `requested` is asked for.
    fn stretch(&self, requested: Duration) -> Duration {
        requested
    }

    /// Wait `requested` (after [`stretch`](Sleeper::stretch)) in slices of at
    /// most `slice`, checking `stop` before every slice and once at the end.
    ///
    /// Returns `true` if `stop` fired.
    fn sleep_unless(&self, requested: Duration, slice: Duration, stop: &dyn Fn() -> bool) -> bool {
        // `None`: the wait outlasts what `Instant` can represent.
        let deadline = self.now().checked_add(self.stretch(requested));
        loop {
            if stop() {
                return true;
            }
            let now = self.now();
            let remaining = match deadline {
                Some(deadline) if now >= deadline => return false,
                Some(deadline) => deadline - now,
                None => Duration::MAX,
            };
            self.sleep(if slice.is_zero() {
                remaining
            } else {
                remaining.min(slice)
            });
        }
    }
}

impl<S: Sleeper + ?Sized> Sleeper for std::sync::Arc<S> {
    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration);
    }

    fn now(&self) -> Instant {
        (**self).now()
    }

    fn stretch(&self, requested: Duration) -> Duration {
        (**self).stretch(requested)
    }
}

/// Sleeps exactly the time it is given.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealSleeper;

impl Sleeper for RealSleeper {
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Sleeps a random amount within `±factor` around the requested time.
///
/// With `factor = 0.5`, a 10s request sleeps somewhere between 5s and 15s.
/// The window is uniform and centred on the request, so on average a worker
/// keeps its configured interval. The offset is not added on top of the
/// random draw, which would stretch every wait by `factor·t` or more.
#[derive(Debug, Clone)]
pub struct FuzzySleeper<S = RealSleeper> {
    factor: f64,
    inner: S,
}

impl FuzzySleeper<RealSleeper> {
    pub fn new(factor: f64) -> Self {
        Self::with_inner(factor, RealSleeper)
    }
}

impl<S: Sleeper> FuzzySleeper<S> {
    /// Fuzz requests, then delegate the actual waiting to `inner`.
    pub fn with_inner(factor: f64, inner: S) -> Self {
        Self {
            factor: factor.clamp(0.0, 1.0),
            inner,
        }
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }
}

impl<S: Sleeper> Sleeper for FuzzySleeper<S> {
    fn sleep(&self, duration: Duration) {
        self.inner.sleep(duration);
    }

    fn now(&self) -> Instant {
        self.inner.now()
    }

    fn stretch(&self, requested: Duration) -> Duration {
        let secs = requested.as_secs_f64();
        random_between(secs * (1.0 - self.factor), secs * (1.0 + self.factor))
    }
}

/// Sleeps in batches of `pause_every` against absolute deadlines.
///
/// When `fuzziness < 1.0` the total is first randomized within
/// `[fuzziness·t, (2 − fuzziness)·t]`. Each batch then waits until its own
/// deadline, so time lost in one batch is recovered in the next; batches whose
/// deadline already passed are skipped.
#[derive(Debug, Clone)]
pub struct EcoSleeper<S = RealSleeper> {
    fuzziness: f64,
    pause_every: Duration,
    inner: S,
}

impl EcoSleeper<RealSleeper> {
    pub fn new(fuzziness: f64, pause_every: Duration) -> Self {
        Self::with_inner(fuzziness, pause_every, RealSleeper)
    }
}

impl Default for EcoSleeper<RealSleeper> {
    fn default() -> Self {
        Self::new(1.0, Duration::from_secs(1))
    }
}

impl<S: Sleeper> EcoSleeper<S> {
    pub fn with_inner(fuzziness: f64, pause_every: Duration, inner: S) -> Self {
        Self {
            fuzziness: fuzziness.clamp(0.0, 1.0),
            pause_every,
            inner,
        }
    }

    /// Next batch of a wait with `left` still to go.
    fn batch(&self, left: Duration) -> Duration {
        if self.pause_every.is_zero() {
            left
        } else {
            left.min(self.pause_every)
        }
    }
}

impl<S: Sleeper> Sleeper for EcoSleeper<S> {
    fn sleep(&self, duration: Duration) {
        let start = self.inner.now();
        let mut covered = Duration::ZERO;
        while covered < duration {
            let batch = self.batch(duration - covered);
            covered += batch;
            // Past the clock's range there is no deadline to catch up with.
            let Some(end) = start.checked_add(covered) else {
                self.inner.sleep(batch);
                continue;
            };
            let now = self.inner.now();
            if end <= now + DEADLINE_SLACK {
                continue;
            }
            self.inner.sleep(end - now);
        }
    }

    fn now(&self) -> Instant {
        self.inner.now()
    }

    fn stretch(&self, requested: Duration) -> Duration {
        if self.fuzziness >= 1.0 {
            return requested;
        }
        let secs = requested.as_secs_f64();
        random_between(self.fuzziness * secs, (2.0 - self.fuzziness) * secs)
    }
}

/// Uniform random duration in `[low, high]` seconds, millisecond resolution.
fn random_between(low: f64, high: f64) -> Duration {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let (low_ms, high_ms) = ((low.max(0.0) * 1000.0) as u64, (high.max(0.0) * 1000.0) as u64);
    if high_ms <= low_ms {
        return Duration::from_millis(low_ms);
    }
    Duration::from_millis(rand::thread_rng().gen_range(low_ms..=high_ms))
}

/// Virtual clock for tests: sleeping advances time instantly and is recorded.
#[cfg(test)]
pub(crate) mod testing {
    use super::Sleeper;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    #[derive(Debug)]
    pub struct ManualClock {
        origin: Instant,
        elapsed: Mutex<Duration>,
        sleeps: Mutex<Vec<Duration>>,
    }

    impl ManualClock {
        pub fn new() -> Self {
            Self {
                origin: Instant::now(),
                elapsed: Mutex::new(Duration::ZERO),
                sleeps: Mutex::new(Vec::new()),
            }
        }

        pub fn elapsed(&self) -> Duration {
            *self.elapsed.lock().unwrap()
        }

        pub fn sleeps(&self) -> Vec<Duration> {
            self.sleeps.lock().unwrap().clone()
        }

        /// Move time forward without recording a sleep.
        pub fn advance(&self, by: Duration) {
            *self.elapsed.lock().unwrap() += by;
        }
    }

    impl Sleeper for ManualClock {
        fn sleep(&self, duration: Duration) {
            self.sleeps.lock().unwrap().push(duration);
            *self.elapsed.lock().unwrap() += duration;
        }

        fn now(&self) -> Instant {
            self.origin + self.elapsed()
        }
    }

}

#[cfg(test)]
mod tests {
    use super::testing::ManualClock;
    use super::*;
    use std::cell::Cell;
    use std::sync::Arc;

    #[test]
    fn test_real_sleeper_waits() {
        let start = Instant::now();
        RealSleeper.sleep(Duration::from_millis(20));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_fuzzy_sleeper_stays_within_factor() {
        let sleeper = FuzzySleeper::new(0.5);
        for _ in 0..200 {
            let d = sleeper.stretch(Duration::from_secs(10));
            assert!(d >= Duration::from_secs(5), "{d:?} too short");
            assert!(d <= Duration::from_secs(15), "{d:?} too long");
        }
    }

    #[test]
    fn test_fuzzy_sleeper_zero_factor_is_exact() {
        let sleeper = FuzzySleeper::new(0.0);
        assert_eq!(
            sleeper.stretch(Duration::from_millis(1500)),
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn test_fuzzy_sleeper_delegates_to_inner() {
        let clock = Arc::new(ManualClock::new());
        let sleeper = FuzzySleeper::with_inner(0.2, clock.clone());
        let stopped = sleeper.sleep_unless(Duration::from_secs(10), Duration::ZERO, &|| false);
        assert!(!stopped);
        let slept = clock.elapsed();
        assert!(slept >= Duration::from_secs(8) && slept <= Duration::from_secs(12));
    }

    #[test]
    fn test_eco_sleeper_batches() {
        let clock = Arc::new(ManualClock::new());
        let sleeper = EcoSleeper::with_inner(1.0, Duration::from_secs(1), clock.clone());
        sleeper.sleep(Duration::from_millis(3500));
        assert_eq!(
            clock.sleeps(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(1),
                Duration::from_secs(1),
                Duration::from_millis(500)
            ]
        );
    }

    #[test]
    fn test_eco_sleeper_skips_elapsed_batches() {
        // A clock that jumps 2.5s on the first sleep, as if the process was
        // descheduled.
        struct Jumpy {
            clock: ManualClock,
            jumped: std::sync::Mutex<bool>,
        }
        impl Sleeper for Jumpy {
            fn sleep(&self, duration: Duration) {
                self.clock.sleep(duration);
                let mut jumped = self.jumped.lock().unwrap();
                if !*jumped {
                    *jumped = true;
                    self.clock.advance(Duration::from_millis(1500));
                }
            }
            fn now(&self) -> Instant {
                self.clock.now()
            }
        }
        let jumpy = Jumpy {
            clock: ManualClock::new(),
            jumped: std::sync::Mutex::new(false),
        };
        let sleeper = EcoSleeper::with_inner(1.0, Duration::from_secs(1), jumpy);
        sleeper.sleep(Duration::from_secs(4));
        // 1s batch, clock now at 2.5s: batch ending at 2s is skipped,
        // the one ending at 3s only waits 0.5s, last one a full second.
        assert_eq!(
            sleeper.inner.clock.sleeps(),
            vec![
                Duration::from_secs(1),
                Duration::from_millis(500),
                Duration::from_secs(1)
            ]
        );
    }

    #[test]
    fn test_eco_sleeper_fuzz_range() {
        let sleeper = EcoSleeper::new(0.8, Duration::from_secs(1));
        for _ in 0..200 {
            let d = sleeper.stretch(Duration::from_secs(10));
            assert!(d >= Duration::from_secs(8) && d <= Duration::from_secs(12));
        }
    }

    #[test]
    fn test_sleep_unless_stops_early() {
        let clock = ManualClock::new();
        let checks = Cell::new(0);
        let stopped = clock.sleep_unless(Duration::from_secs(10), Duration::from_millis(100), &|| {
            checks.set(checks.get() + 1);
            checks.get() > 3
        });
        assert!(stopped);
        assert_eq!(clock.elapsed(), Duration::from_millis(300));
    }

    #[test]
    fn test_sleep_unless_slices() {
        let clock = ManualClock::new();
        let stopped = clock.sleep_unless(Duration::from_millis(250), Duration::from_millis(100), &|| false);
        assert!(!stopped);
        assert_eq!(
            clock.sleeps(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(100),
                Duration::from_millis(50)
            ]
        );
    }

    #[test]
    fn test_unrepresentable_wait_still_stops() {
        let clock = ManualClock::new();
        let checks = std::cell::Cell::new(0);
        let stop = || {
            checks.set(checks.get() + 1);
            checks.get() > 3
        };
        assert!(clock.sleep_unless(Duration::MAX, Duration::from_millis(100), &stop));
        assert_eq!(clock.elapsed(), Duration::from_millis(300));
    }
}
