//! Clock source
//!
//! The console server needs two notions of time: a monotonic instant for
//! flush deadlines and the local wall-clock time for line timestamps.
//! Production code uses [`SystemClock`]; tests drive a [`ManualClock`] so
//! timer behaviour is deterministic and no test ever sleeps.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDateTime};

/// Time source abstraction
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current monotonic instant
    fn now(&self) -> Instant;

    /// Current local wall-clock time, `None` if unavailable
    fn local_time(&self) -> Option<NaiveDateTime>;
}

/// Shared clock handle
pub type SharedClock = Arc<dyn Clock>;

/// Host clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a shared system clock
    pub fn shared() -> SharedClock {
        Arc::new(Self)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn local_time(&self) -> Option<NaiveDateTime> {
        Some(Local::now().naive_local())
    }
}

/// Clock that only moves when told to
///
/// Logical time starts at zero. The wall clock, if set, advances together
/// with logical time; without one the clock reports wall time as
/// unavailable.
#[derive(Debug)]
pub struct ManualClock {
    /// Logical time in nanoseconds since creation
    logical_nanos: AtomicU64,
    /// Real instant at creation, logical instants are offsets from it
    base_instant: Instant,
    /// Wall-clock time at logical zero
    base_wall: Option<NaiveDateTime>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    /// Create a clock without wall time
    pub fn new() -> Self {
        Self {
            logical_nanos: AtomicU64::new(0),
            base_instant: Instant::now(),
            base_wall: None,
        }
    }

    /// Create a clock whose wall time starts at `wall`
    pub fn with_wall_time(wall: NaiveDateTime) -> Self {
        Self {
            base_wall: Some(wall),
            ..Self::new()
        }
    }

    /// Advance logical time
    pub fn advance(&self, duration: Duration) {
        self.logical_nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Logical time elapsed since creation
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.logical_nanos.load(Ordering::SeqCst))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn local_time(&self) -> Option<NaiveDateTime> {
        let elapsed = chrono::Duration::from_std(self.elapsed()).ok()?;
        self.base_wall.map(|wall| wall + elapsed)
    }
}
