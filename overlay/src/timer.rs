//! One-shot timer queue driven by the event loop
//!
//! Every `arm` hands out a fresh [`TimerToken`]; tokens are never reused, so
//! an owner that re-arms can tell its current timer from a stale one.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::time::{Duration, Instant};

/// Handle to one armed timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerToken(u64);

#[derive(Debug, Default)]
pub struct TimerQueue {
    next_token: u64,
    heap: BinaryHeap<Reverse<(Instant, TimerToken)>>,
    /// Tokens armed and neither fired nor cancelled
    live: HashSet<TimerToken>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer that expires `after` from `now`. `None` if that instant
    /// cannot be represented; nothing is armed then.
    pub fn arm(&mut self, now: Instant, after: Duration) -> Option<TimerToken> {
        now.checked_add(after).map(|at| self.arm_at(at))
    }

    pub fn arm_at(&mut self, deadline: Instant) -> TimerToken {
        self.next_token += 1;
        let token = TimerToken(self.next_token);
        self.heap.push(Reverse((deadline, token)));
        self.live.insert(token);
        token
    }

    /// Returns false if the token already fired or was cancelled
    pub fn cancel(&mut self, token: TimerToken) -> bool {
        self.live.remove(&token)
    }

    pub fn is_armed(&self, token: TimerToken) -> bool {
        self.live.contains(&token)
    }

    /// Pop every live timer with `deadline <= now`, earliest first
    pub fn expired(&mut self, now: Instant) -> Vec<TimerToken> {
        let mut fired = Vec::new();
        while let Some(Reverse((deadline, token))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if self.live.remove(&token) {
                fired.push(token);
            }
        }
        fired
    }

    /// Earliest live deadline
    pub fn next_deadline(&mut self) -> Option<Instant> {
        // Cancelled entries stay in the heap until they surface here
        while let Some(Reverse((deadline, token))) = self.heap.peek().copied() {
            if self.live.contains(&token) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.live.clear();
    }
}
