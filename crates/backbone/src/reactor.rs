//! Single-threaded tick loop with timers and deferred work.
//!
//! Sockets are nonblocking and polled every tick; the reactor decides when
//! the next tick happens and which timer tags fire in it.

use std::cell::Cell;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};

/// Cancels a timer. Idempotent; cancelling a fired one-shot is a no-op.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    id: u64,
    cancelled: Rc<Cell<bool>>,
}

impl TimerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(&self) {
        self.cancelled.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

#[derive(Debug)]
struct Timer<T> {
    due: Instant,
    id: u64,
    period: Option<Duration>,
    tag: T,
    cancelled: Rc<Cell<bool>>,
}

impl<T> PartialEq for Timer<T> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.id == other.id
    }
}

impl<T> Eq for Timer<T> {}

impl<T> PartialOrd for Timer<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Timer<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order for min-heap
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.id.cmp(&self.id))
    }
}

pub struct Reactor<T> {
    timers: BinaryHeap<Timer<T>>,
    deferred: VecDeque<T>,
    running: Arc<AtomicBool>,
    tick_interval: Duration,
    next_id: u64,
}

impl<T: Clone> Reactor<T> {
    pub fn new(tick_interval: Duration) -> Self {
        Self {
            timers: BinaryHeap::new(),
            deferred: VecDeque::new(),
            running: Arc::new(AtomicBool::new(true)),
            tick_interval,
            next_id: 1,
        }
    }

    fn schedule(&mut self, due: Instant, period: Option<Duration>, tag: T) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        let cancelled = Rc::new(Cell::new(false));
        self.timers.push(Timer {
            due,
            id,
            period,
            tag,
            cancelled: Rc::clone(&cancelled),
        });
        TimerHandle { id, cancelled }
    }

    pub fn add_timer(&mut self, now: Instant, delay: Duration, tag: T) -> TimerHandle {
        self.schedule(now + delay, None, tag)
    }

    pub fn add_periodic(&mut self, now: Instant, period: Duration, tag: T) -> TimerHandle {
        self.schedule(now + period, Some(period), tag)
    }

    /// Runs `tag` at the start of the next poll.
    pub fn defer(&mut self, tag: T) {
        self.deferred.push_back(tag);
    }

    /// Deferred tags first, then due timers in deadline order. A periodic
    /// timer fires at most once per poll even if several periods elapsed.
    pub fn poll(&mut self, now: Instant) -> Vec<T> {
        let mut fired: Vec<T> = self.deferred.drain(..).collect();

        while self.timers.peek().is_some_and(|t| t.due <= now) {
            let Some(mut timer) = self.timers.pop() else {
                break;
            };
            if timer.cancelled.get() {
                continue;
            }
            fired.push(timer.tag.clone());
            if let Some(period) = timer.period {
                timer.due = (timer.due + period).max(now + Duration::from_nanos(1));
                self.timers.push(timer);
            }
        }

        fired
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers
            .iter()
            .filter(|t| !t.cancelled.get())
            .map(|t| t.due)
            .min()
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.iter().filter(|t| !t.cancelled.get()).count()
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(AtomicOrdering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, AtomicOrdering::SeqCst);
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    /// Drives `tick` until stopped, sleeping between ticks up to the tick
    /// interval or the next timer, whichever is sooner.
    pub fn run<F>(&mut self, mut tick: F)
    where
        F: FnMut(&mut Self, Instant, Vec<T>),
    {
        while self.is_running() {
            let start = Instant::now();
            let fired = self.poll(start);
            tick(self, start, fired);

            let mut wake = start + self.tick_interval;
            if let Some(deadline) = self.next_deadline() {
                wake = wake.min(deadline);
            }
            let now = Instant::now();
            if wake > now {
                std::thread::sleep(wake - now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let mut reactor = Reactor::new(Duration::from_millis(10));
        let now = Instant::now();
        reactor.add_timer(now, Duration::from_millis(30), "c");
        reactor.add_timer(now, Duration::from_millis(10), "a");
        reactor.add_timer(now, Duration::from_millis(20), "b");

        assert!(reactor.poll(now).is_empty());
        assert_eq!(reactor.poll(now + Duration::from_millis(25)), vec!["a", "b"]);
        assert_eq!(reactor.poll(now + Duration::from_millis(30)), vec!["c"]);
        assert_eq!(reactor.pending_timers(), 0);
    }

    #[test]
    fn test_periodic_and_cancel() {
        let mut reactor = Reactor::new(Duration::from_millis(10));
        let now = Instant::now();
        let handle = reactor.add_periodic(now, Duration::from_millis(10), 1u8);

        assert_eq!(reactor.poll(now + Duration::from_millis(10)), vec![1]);
        assert_eq!(reactor.poll(now + Duration::from_millis(20)), vec![1]);

        handle.cancel();
        handle.cancel();
        assert!(reactor.poll(now + Duration::from_millis(30)).is_empty());
        assert_eq!(reactor.next_deadline(), None);
    }

    #[test]
    fn test_deferred_runs_first() {
        let mut reactor = Reactor::new(Duration::from_millis(10));
        let now = Instant::now();
        reactor.add_timer(now, Duration::ZERO, "timer");
        reactor.defer("deferred");
        assert_eq!(reactor.poll(now), vec!["deferred", "timer"]);
    }

    #[test]
    fn test_run_stops() {
        let mut reactor: Reactor<()> = Reactor::new(Duration::from_millis(1));
        let mut ticks = 0;
        reactor.run(|reactor, _, _| {
            ticks += 1;
            if ticks == 3 {
                reactor.stop();
            }
        });
        assert_eq!(ticks, 3);
    }
}
