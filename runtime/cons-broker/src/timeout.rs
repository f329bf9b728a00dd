//! Timeout Queue
//!
//! One-shot timeouts keyed by a token. Each token has at most one pending
//! deadline: adding a timeout for a token that already has one replaces it.
//! The event loop asks for the next deadline, sleeps until then, and hands
//! the expired tokens back to their owner.

use std::collections::BTreeMap;
use std::time::Instant;

/// Event/timer collaborator
pub trait TimerService<T> {
    /// Arm a one-shot timeout for `token`, replacing any pending one
    fn add_timeout(&mut self, token: T, deadline: Instant);

    /// Cancel the pending timeout of `token`
    ///
    /// # Returns
    /// `true` if a timeout was pending.
    fn remove_timeout(&mut self, token: T) -> bool;
}

/// Deadline-ordered set of pending timeouts
#[derive(Debug)]
pub struct TimeoutQueue<T: Ord + Copy> {
    pending: BTreeMap<T, Instant>,
}

impl<T: Ord + Copy> Default for TimeoutQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Ord + Copy> TimeoutQueue<T> {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
        }
    }

    /// Deadline of `token`, if armed
    pub fn deadline(&self, token: T) -> Option<Instant> {
        self.pending.get(&token).copied()
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    /// Number of armed timeouts
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Check if nothing is armed
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Remove and return every token whose deadline is at or before `now`
    ///
    /// Tokens come back in deadline order.
    pub fn expire(&mut self, now: Instant) -> Vec<T> {
        let mut due: Vec<(Instant, T)> = self
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(&token, &deadline)| (deadline, token))
            .collect();
        due.sort();

        for (_, token) in &due {
            self.pending.remove(token);
        }
        due.into_iter().map(|(_, token)| token).collect()
    }
}

impl<T: Ord + Copy> TimerService<T> for TimeoutQueue<T> {
    fn add_timeout(&mut self, token: T, deadline: Instant) {
        self.pending.insert(token, deadline);
    }

    fn remove_timeout(&mut self, token: T) -> bool {
        self.pending.remove(&token).is_some()
    }
}
