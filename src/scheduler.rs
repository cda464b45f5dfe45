/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Single-threaded timer queue.
//!
//! The scheduler thread owns a priority queue of `(deadline, event)` pairs. When a deadline
//! passes, the event is forwarded into the dispatch loop's input channel; no timer ever mutates
//! consensus state directly, which keeps the single-writer discipline mechanical. Stale events
//! (for rounds the pacemaker has already left) are discarded by the pacemaker on receipt.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::types::basic::Round;

/// Deadline events fed back into the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// The round's allotted time elapsed without a quorum certificate forming.
    RoundTimeout(Round),
}

struct Entry {
    fire_at: Instant,
    seq: u64,
    event: TimerEvent,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the earliest deadline pops first.
        other
            .fire_at
            .cmp(&self.fire_at)
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Cloneable handle for registering deadline events with the scheduler thread.
#[derive(Clone)]
pub struct TimerHandle {
    requests: Sender<(Duration, TimerEvent)>,
}

impl TimerHandle {
    /// Create a handle and the receiving end the scheduler thread drains. Exposed separately so
    /// tests can drive the queue without a thread.
    pub fn new() -> (TimerHandle, Receiver<(Duration, TimerEvent)>) {
        let (requests, request_receiver) = mpsc::channel();
        (TimerHandle { requests }, request_receiver)
    }

    /// Schedule `event` to fire `delay` from now.
    pub fn schedule(&self, delay: Duration, event: TimerEvent) {
        let _ = self.requests.send((delay, event));
    }
}

/// Spawn the scheduler thread. Fired events are forwarded to `event_sink`; the thread exits when
/// the shutdown signal arrives or every handle is dropped.
pub fn start_scheduler(
    request_receiver: Receiver<(Duration, TimerEvent)>,
    event_sink: Sender<TimerEvent>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut queue: BinaryHeap<Entry> = BinaryHeap::new();
        let mut seq: u64 = 0;

        loop {
            if shutdown_signal.try_recv().is_ok() {
                return;
            }

            // Fire everything that is due.
            let now = Instant::now();
            while queue.peek().is_some_and(|entry| entry.fire_at <= now) {
                // Safety: peeked Some above.
                let entry = queue.pop().unwrap();
                if event_sink.send(entry.event).is_err() {
                    return;
                }
            }

            // Sleep until the next deadline or the next registration, whichever comes first.
            let wait = queue
                .peek()
                .map(|entry| entry.fire_at.saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::from_millis(100));
            match request_receiver.recv_timeout(wait) {
                Ok((delay, event)) => {
                    seq += 1;
                    queue.push(Entry {
                        fire_at: Instant::now() + delay,
                        seq,
                        event,
                    });
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let (handle, request_receiver) = TimerHandle::new();
        let (event_sink, fired) = mpsc::channel();
        let (_shutdown, shutdown_receiver) = mpsc::channel();
        let _thread = start_scheduler(request_receiver, event_sink, shutdown_receiver);

        handle.schedule(Duration::from_millis(60), TimerEvent::RoundTimeout(Round::new(2)));
        handle.schedule(Duration::from_millis(10), TimerEvent::RoundTimeout(Round::new(1)));

        assert_eq!(
            fired.recv_timeout(Duration::from_secs(2)).unwrap(),
            TimerEvent::RoundTimeout(Round::new(1))
        );
        assert_eq!(
            fired.recv_timeout(Duration::from_secs(2)).unwrap(),
            TimerEvent::RoundTimeout(Round::new(2))
        );
    }
}
