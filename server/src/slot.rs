//! Worker slot records and the registry the supervisor owns.
//!
//! A slot outlives the OS processes that fill it. All restart bookkeeping is a
//! pure function of the slot, the current instant and the [`RestartPolicy`],
//! so it can be exercised without spawning anything.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerStatus {
    Starting,
    Running,
    Crashed,
    Stopped,
}

/// Bounded, time-windowed restart budget applied to every slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub restart_window: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            restart_window: Duration::from_secs(60),
        }
    }
}

/// Outcome of a process exit for its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDecision {
    /// Respawn the slot; `attempt` is the restart count inside the current window.
    Restart { attempt: u32 },
    /// Budget exhausted. The slot stays crashed.
    GiveUp { restarts: u32 },
}

#[derive(Debug, Clone)]
pub struct WorkerSlot {
    pub id: usize,
    pub port: u16,
    pub status: WorkerStatus,
    pub restart_count: u32,
    pub restart_window_start: Instant,
    /// Incremented on every spawn so events from an earlier process are ignored.
    pub generation: u64,
    pub pid: Option<u32>,
    pub total_restarts: u64,
}

impl WorkerSlot {
    pub fn new(id: usize, port: u16, now: Instant) -> Self {
        Self {
            id,
            port,
            status: WorkerStatus::Starting,
            restart_count: 0,
            restart_window_start: now,
            generation: 0,
            pid: None,
            total_restarts: 0,
        }
    }

    /// Moves the slot into `Starting` for a fresh process and returns its generation.
    pub fn begin_spawn(&mut self) -> u64 {
        self.generation += 1;
        self.status = WorkerStatus::Starting;
        self.pid = None;
        self.generation
    }

    /// Flips `Starting` to `Running` if `generation` still names the live process.
    pub fn mark_running(&mut self, generation: u64) -> bool {
        if self.generation != generation || self.status != WorkerStatus::Starting {
            return false;
        }
        self.status = WorkerStatus::Running;
        true
    }

    /// Records a process exit and decides whether the slot gets another process.
    pub fn on_exit(&mut self, now: Instant, policy: &RestartPolicy) -> ExitDecision {
        self.status = WorkerStatus::Crashed;
        self.pid = None;

        if now.saturating_duration_since(self.restart_window_start) > policy.restart_window {
            self.restart_count = 0;
        }

        if self.restart_count < policy.max_restarts {
            self.restart_count += 1;
            self.total_restarts += 1;
            self.restart_window_start = now;
            ExitDecision::Restart {
                attempt: self.restart_count,
            }
        } else {
            ExitDecision::GiveUp {
                restarts: self.restart_count,
            }
        }
    }

    pub fn stop(&mut self) {
        self.status = WorkerStatus::Stopped;
        self.pid = None;
    }

    pub fn is_stopped(&self) -> bool {
        self.status == WorkerStatus::Stopped
    }
}

/// Read-only slot counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub starting: usize,
    pub running: usize,
    pub crashed: usize,
    pub stopped: usize,
    pub total_restarts: u64,
}

impl WorkerStats {
    pub fn total(&self) -> usize {
        self.starting + self.running + self.crashed + self.stopped
    }
}

#[derive(Debug, Default)]
pub struct WorkerRegistry {
    slots: BTreeMap<usize, WorkerSlot>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, slot: WorkerSlot) {
        self.slots.insert(slot.id, slot);
    }

    pub fn get(&self, id: usize) -> Option<&WorkerSlot> {
        self.slots.get(&id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut WorkerSlot> {
        self.slots.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerSlot> {
        self.slots.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut WorkerSlot> {
        self.slots.values_mut()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn stats(&self) -> WorkerStats {
        let mut stats = WorkerStats::default();
        for slot in self.slots.values() {
            match slot.status {
                WorkerStatus::Starting => stats.starting += 1,
                WorkerStatus::Running => stats.running += 1,
                WorkerStatus::Crashed => stats.crashed += 1,
                WorkerStatus::Stopped => stats.stopped += 1,
            }
            stats.total_restarts += slot.total_restarts;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_restarts: u32, window_secs: u64) -> RestartPolicy {
        RestartPolicy {
            max_restarts,
            restart_window: Duration::from_secs(window_secs),
        }
    }

    #[test]
    fn test_slot_creation() {
        let now = Instant::now();
        let slot = WorkerSlot::new(2, 8080, now);

        assert_eq!(slot.id, 2);
        assert_eq!(slot.port, 8080);
        assert_eq!(slot.status, WorkerStatus::Starting);
        assert_eq!(slot.restart_count, 0);
        assert_eq!(slot.generation, 0);
        assert!(slot.pid.is_none());
    }

    #[test]
    fn test_crash_loop_exhausts_budget() {
        let start = Instant::now();
        let policy = policy(5, 60);
        let mut slot = WorkerSlot::new(0, 8080, start);

        let mut restarts = 0;
        let mut last_count = 0;
        for crash in 0..6u64 {
            slot.begin_spawn();
            let now = start + Duration::from_secs(crash * 2);
            match slot.on_exit(now, &policy) {
                ExitDecision::Restart { attempt } => {
                    assert!(attempt > last_count);
                    last_count = attempt;
                    restarts += 1;
                }
                ExitDecision::GiveUp { restarts } => assert_eq!(restarts, 5),
            }
        }

        assert_eq!(restarts, 5);
        assert_eq!(slot.restart_count, 5);
        assert_eq!(slot.status, WorkerStatus::Crashed);
        assert_eq!(
            slot.on_exit(start + Duration::from_secs(12), &policy),
            ExitDecision::GiveUp { restarts: 5 }
        );
    }

    #[test]
    fn test_window_elapsed_resets_count() {
        let start = Instant::now();
        let policy = policy(5, 60);
        let mut slot = WorkerSlot::new(0, 8080, start);

        assert_eq!(
            slot.on_exit(start + Duration::from_secs(1), &policy),
            ExitDecision::Restart { attempt: 1 }
        );
        assert_eq!(
            slot.on_exit(start + Duration::from_secs(62), &policy),
            ExitDecision::Restart { attempt: 1 }
        );
        assert_eq!(slot.total_restarts, 2);
    }

    #[test]
    fn test_exhausted_slot_recovers_after_window() {
        let start = Instant::now();
        let policy = policy(1, 60);
        let mut slot = WorkerSlot::new(0, 8080, start);

        assert_eq!(
            slot.on_exit(start, &policy),
            ExitDecision::Restart { attempt: 1 }
        );
        assert_eq!(
            slot.on_exit(start + Duration::from_secs(1), &policy),
            ExitDecision::GiveUp { restarts: 1 }
        );
        assert_eq!(
            slot.on_exit(start + Duration::from_secs(120), &policy),
            ExitDecision::Restart { attempt: 1 }
        );
    }

    #[test]
    fn test_zero_budget_never_restarts() {
        let start = Instant::now();
        let mut slot = WorkerSlot::new(0, 8080, start);
        assert_eq!(
            slot.on_exit(start, &policy(0, 60)),
            ExitDecision::GiveUp { restarts: 0 }
        );
    }

    #[test]
    fn test_mark_running_ignores_stale_generation() {
        let mut slot = WorkerSlot::new(0, 8080, Instant::now());
        let first = slot.begin_spawn();
        let second = slot.begin_spawn();

        assert!(!slot.mark_running(first));
        assert_eq!(slot.status, WorkerStatus::Starting);
        assert!(slot.mark_running(second));
        assert_eq!(slot.status, WorkerStatus::Running);
        assert!(!slot.mark_running(second));
    }

    #[test]
    fn test_stopped_slot_is_not_marked_running() {
        let mut slot = WorkerSlot::new(0, 8080, Instant::now());
        let generation = slot.begin_spawn();
        slot.stop();
        assert!(!slot.mark_running(generation));
        assert!(slot.is_stopped());
    }

    #[test]
    fn test_registry_stats() {
        let now = Instant::now();
        let mut registry = WorkerRegistry::new();
        assert!(registry.is_empty());

        for id in 0..4 {
            registry.insert(WorkerSlot::new(id, 9000, now));
        }
        let generation = registry.get_mut(1).unwrap().begin_spawn();
        registry.get_mut(1).unwrap().mark_running(generation);
        registry.get_mut(2).unwrap().on_exit(now, &RestartPolicy::default());
        registry.get_mut(3).unwrap().stop();

        let stats = registry.stats();
        assert_eq!(registry.len(), 4);
        assert_eq!(stats.starting, 1);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.crashed, 1);
        assert_eq!(stats.stopped, 1);
        assert_eq!(stats.total_restarts, 1);
        assert_eq!(stats.total(), 4);
    }
}
