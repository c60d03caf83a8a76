use anyhow::Result;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tokio::time::{Duration, Instant};

use super::BotCore;

/// One-shot callback run on the dispatcher task.
///
/// A task that should repeat schedules itself again before returning.
pub type Task<S> = Box<dyn FnOnce(&mut BotCore, &mut S, &mut Scheduler<S>) -> Result<()> + Send>;

struct Entry<S> {
    fire_at: Instant,
    seq: u64,
    name: &'static str,
    task: Task<S>,
}

impl<S> PartialEq for Entry<S> {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl<S> Eq for Entry<S> {}

impl<S> PartialOrd for Entry<S> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<S> Ord for Entry<S> {
    // Reversed so the max-heap pops the earliest entry; ties keep insertion order
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .fire_at
            .cmp(&self.fire_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Cooperative delayed-callback queue, advanced by the dispatcher loop
pub struct Scheduler<S> {
    queue: BinaryHeap<Entry<S>>,
    next_seq: u64,
}

impl<S> Default for Scheduler<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Scheduler<S> {
    pub fn new() -> Self {
        Self {
            queue: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Enqueue `task` to run once `delay` has passed
    pub fn schedule_in<F>(&mut self, delay: Duration, name: &'static str, task: F)
    where
        F: FnOnce(&mut BotCore, &mut S, &mut Scheduler<S>) -> Result<()> + Send + 'static,
    {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Entry {
            fire_at: Instant::now() + delay,
            seq,
            name,
            task: Box::new(task),
        });
    }

    /// Fire time of the earliest pending task
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.peek().map(|entry| entry.fire_at)
    }

    /// Remove and return the earliest task if it is due at `now`
    pub fn pop_due(&mut self, now: Instant) -> Option<(&'static str, Task<S>)> {
        if self.queue.peek()?.fire_at > now {
            return None;
        }
        self.queue.pop().map(|entry| (entry.name, entry.task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(scheduler: &mut Scheduler<Vec<&'static str>>, state: &mut Vec<&'static str>, now: Instant) {
        let mut core = BotCore::for_tests();
        while let Some((_, task)) = scheduler.pop_due(now) {
            task(&mut core, state, scheduler).unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tasks_fire_in_deadline_order() {
        let mut scheduler: Scheduler<Vec<&'static str>> = Scheduler::new();
        let mut log = Vec::new();

        scheduler.schedule_in(Duration::from_secs(5), "late", |_, log, _| {
            log.push("late");
            Ok(())
        });
        scheduler.schedule_in(Duration::from_secs(1), "early", |_, log, _| {
            log.push("early");
            Ok(())
        });
        scheduler.schedule_in(Duration::from_secs(1), "early2", |_, log, _| {
            log.push("early2");
            Ok(())
        });

        let start = Instant::now();
        assert_eq!(scheduler.next_deadline(), Some(start + Duration::from_secs(1)));
        drain(&mut scheduler, &mut log, start);
        assert!(log.is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        drain(&mut scheduler, &mut log, Instant::now());
        assert_eq!(log, vec!["early", "early2"]);

        tokio::time::advance(Duration::from_secs(5)).await;
        drain(&mut scheduler, &mut log, Instant::now());
        assert_eq!(log, vec!["early", "early2", "late"]);
        assert!(scheduler.is_empty());
        assert_eq!(scheduler.next_deadline(), None);
    }

    fn tick(_core: &mut BotCore, log: &mut Vec<&'static str>, scheduler: &mut Scheduler<Vec<&'static str>>) -> Result<()> {
        log.push("tick");
        scheduler.schedule_in(Duration::from_secs(10), "tick", tick);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_self_rescheduling_task() {
        let mut scheduler = Scheduler::new();
        let mut log = Vec::new();
        scheduler.schedule_in(Duration::ZERO, "tick", tick);

        for _ in 0..3 {
            drain(&mut scheduler, &mut log, Instant::now());
            tokio::time::advance(Duration::from_secs(10)).await;
        }

        assert_eq!(log.len(), 3);
        assert_eq!(scheduler.len(), 1);
    }
}
