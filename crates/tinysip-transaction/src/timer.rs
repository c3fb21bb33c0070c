// tinysip - a tiny SIP user agent stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Timer service: RFC 3261 base timer values and a deadline queue.
//!
//! All waits are absolute deadlines on the tokio monotonic clock, so the
//! schedule tolerates scheduling jitter. Entries firing at the same instant
//! pop in insertion order.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use tokio::time::Instant;

/// RFC 3261 base timer values (Table 4).
///
/// T1 is the RTT estimate, T2 caps non-INVITE retransmit intervals, T4 is
/// the maximum time a message stays in the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerSettings {
    pub t1: Duration,
    pub t2: Duration,
    pub t4: Duration,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
        }
    }
}

impl TimerSettings {
    /// The give-up deadline shared by Timers B, F, H and J: 64·T1.
    pub fn give_up(&self) -> Duration {
        self.t1.saturating_mul(64)
    }

    /// Timer D wait for response retransmissions: 32 s on unreliable
    /// transports, zero on reliable ones.
    pub fn timer_d(&self, reliable: bool) -> Duration {
        if reliable {
            Duration::ZERO
        } else {
            Duration::from_secs(32)
        }
    }

    /// Timer I/K network-drain wait: T4 on unreliable transports, zero on
    /// reliable ones.
    pub fn drain(&self, reliable: bool) -> Duration {
        if reliable {
            Duration::ZERO
        } else {
            self.t4
        }
    }

    /// Timer J wait: 64·T1 on unreliable transports, zero on reliable ones.
    pub fn timer_j(&self, reliable: bool) -> Duration {
        if reliable {
            Duration::ZERO
        } else {
            self.give_up()
        }
    }
}

/// Handle returned by [`TimerQueue::schedule`], used to cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

#[derive(Debug, PartialEq, Eq)]
struct Entry {
    deadline: Instant,
    seq: u64,
    id: u64,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// One-shot timer queue with absolute deadlines.
///
/// Cancellation is lazy: cancelled entries stay in the heap until their
/// deadline passes and are skipped when popped.
#[derive(Debug)]
pub struct TimerQueue<T> {
    heap: BinaryHeap<Reverse<Entry>>,
    live: HashMap<u64, T>,
    next_id: u64,
    next_seq: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
            next_id: 0,
            next_seq: 0,
        }
    }

    /// Schedules `task` to fire `delay` from now.
    pub fn schedule(&mut self, delay: Duration, task: T) -> TimerHandle {
        self.schedule_at(Instant::now() + delay, task)
    }

    /// Schedules `task` at an absolute deadline.
    pub fn schedule_at(&mut self, deadline: Instant, task: T) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Entry { deadline, seq, id }));
        self.live.insert(id, task);
        TimerHandle(id)
    }

    /// Cancels a pending timer, returning its task when it had not fired.
    pub fn cancel(&mut self, handle: TimerHandle) -> Option<T> {
        self.live.remove(&handle.0)
    }

    /// Returns the next live deadline, discarding cancelled entries.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if self.live.contains_key(&entry.id) {
                return Some(entry.deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Pops the next timer due at or before `now`, in deadline then
    /// insertion order.
    pub fn pop_due(&mut self, now: Instant) -> Option<(TimerHandle, T)> {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.deadline > now {
                return None;
            }
            let entry_id = entry.id;
            self.heap.pop();
            if let Some(task) = self.live.remove(&entry_id) {
                return Some((TimerHandle(entry_id), task));
            }
        }
        None
    }

    /// Number of timers still pending.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}
