//! Deferred Tasks
//!
//! Keyed one-shot and repeating timers on the tokio runtime. Tile
//! completions and fight rounds are scheduled here so the world can
//! cancel them when the tile, fight or player they belong to goes away.
//!
//! At most one task exists per key. Scheduling a key that is already
//! pending aborts the previous task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::core::{FightId, Position};

/// Identity of a scheduled task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskKey {
    /// `work_complete` for the tile at this position.
    TileWork(Position),
    /// `cooldown_complete` for the tile at this position.
    TileCooldown(Position),
    /// Round timer of a fight.
    FightRound(FightId),
}

struct Entry {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    next_generation: AtomicU64,
    tasks: Mutex<HashMap<TaskKey, Entry>>,
}

impl Inner {
    fn finish(&self, key: TaskKey, generation: u64) {
        let mut tasks = self.tasks.lock();
        if tasks.get(&key).is_some_and(|e| e.generation == generation) {
            tasks.remove(&key);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for (_, entry) in self.tasks.get_mut().drain() {
            entry.handle.abort();
        }
    }
}

/// Keyed task scheduler. Cloning shares the same task table; dropping
/// the last clone aborts every pending task.
///
/// Must be used from within a tokio runtime.
#[derive(Clone, Default)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    fn install<F>(&self, key: TaskKey, spawn: F)
    where
        F: FnOnce(Weak<Inner>, u64) -> JoinHandle<()>,
    {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        // Spawn under the table lock so a zero-delay task cannot finish
        // before its own entry is recorded.
        let mut tasks = self.inner.tasks.lock();
        let handle = spawn(Arc::downgrade(&self.inner), generation);
        if let Some(previous) = tasks.insert(key, Entry { generation, handle }) {
            trace!(?key, "replacing scheduled task");
            previous.handle.abort();
        }
    }

    /// Run `f` once after `delay`.
    pub fn schedule_once<F>(&self, key: TaskKey, delay: Duration, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.install(key, move |inner, generation| {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                f();
                if let Some(inner) = inner.upgrade() {
                    inner.finish(key, generation);
                }
            })
        });
    }

    /// Run `f` every `period` until it returns false or the key is
    /// cancelled. The first run happens one period from now.
    pub fn schedule_repeating<F>(&self, key: TaskKey, period: Duration, mut f: F)
    where
        F: FnMut() -> bool + Send + 'static,
    {
        self.install(key, move |inner, generation| {
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(period).await;
                    if !f() {
                        break;
                    }
                }
                if let Some(inner) = inner.upgrade() {
                    inner.finish(key, generation);
                }
            })
        });
    }

    /// Abort the task for `key`. Returns false if nothing was pending.
    pub fn cancel(&self, key: TaskKey) -> bool {
        match self.inner.tasks.lock().remove(&key) {
            Some(entry) => {
                entry.handle.abort();
                trace!(?key, "cancelled");
                true
            }
            None => false,
        }
    }

    /// Abort every task whose key matches. Returns how many were aborted.
    pub fn cancel_where(&self, mut pred: impl FnMut(&TaskKey) -> bool) -> usize {
        let mut tasks = self.inner.tasks.lock();
        let keys: Vec<TaskKey> = tasks.keys().copied().filter(|k| pred(k)).collect();
        for key in &keys {
            if let Some(entry) = tasks.remove(key) {
                entry.handle.abort();
            }
        }
        keys.len()
    }

    /// Abort everything.
    pub fn cancel_all(&self) -> usize {
        self.cancel_where(|_| true)
    }

    /// Is a task pending for `key`?
    pub fn is_scheduled(&self, key: TaskKey) -> bool {
        self.inner.tasks.lock().contains_key(&key)
    }

    /// Number of pending tasks.
    pub fn len(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    /// No pending tasks.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").field("pending", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let c = Arc::new(AtomicUsize::new(0));
        (c.clone(), c)
    }

    const WORK: TaskKey = TaskKey::TileWork(Position { x: 1, y: 1 });

    #[tokio::test(start_paused = true)]
    async fn test_once_fires_after_delay() {
        let scheduler = Scheduler::new();
        let (hits, seen) = counter();
        scheduler.schedule_once(WORK, Duration::from_secs(5), move || {
            hits.fetch_add(1, Ordering::SeqCst);
        });
        assert!(scheduler.is_scheduled(WORK));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_scheduled(WORK));
        assert!(scheduler.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() {
        let scheduler = Scheduler::new();
        let (hits, seen) = counter();
        scheduler.schedule_once(WORK, Duration::from_secs(1), move || {
            hits.fetch_add(1, Ordering::SeqCst);
        });
        assert!(scheduler.cancel(WORK));
        assert!(!scheduler.cancel(WORK));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces() {
        let scheduler = Scheduler::new();
        let (first, first_seen) = counter();
        let (second, second_seen) = counter();

        scheduler.schedule_once(WORK, Duration::from_secs(1), move || {
            first.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.schedule_once(WORK, Duration::from_secs(2), move || {
            second.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(scheduler.len(), 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(first_seen.load(Ordering::SeqCst), 0);
        assert_eq!(second_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeating_until_false() {
        let scheduler = Scheduler::new();
        let key = TaskKey::FightRound(FightId(3));
        let (rounds, seen) = counter();
        scheduler.schedule_repeating(key, Duration::from_secs(1), move || {
            rounds.fetch_add(1, Ordering::SeqCst) + 1 < 3
        });

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert!(scheduler.is_scheduled(key));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert!(!scheduler.is_scheduled(key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_where() {
        let scheduler = Scheduler::new();
        for i in 0..3 {
            scheduler.schedule_repeating(TaskKey::FightRound(FightId(i)), Duration::from_secs(1), || true);
        }
        scheduler.schedule_once(WORK, Duration::from_secs(1), || {});

        let removed = scheduler.cancel_where(|k| matches!(k, TaskKey::FightRound(_)));
        assert_eq!(removed, 3);
        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.cancel_all(), 1);
        assert!(scheduler.is_empty());
    }
}
