//! Shared resources a writer needs to perform a safe atomic write.
//!
//! Responsibilities:
//! - Bound the number of concurrently open descriptors (global throttle).
//! - Serialize operations per logical path with a fair FIFO ticket queue.
//! - Track temp files that were created but have not yet reached rename,
//!   so they can be unlinked if the owning context goes away.
//!
//! The original engine kept all three as process globals; here they live
//! in one injectable [`DurabilityContext`] so multiple store instances (or
//! unit tests) never share hidden state. Every structure is mutex-guarded
//! because callers run on OS threads.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

use crate::constants::{DESCRIPTOR_CEILING, THROTTLE_TICK};

/// Bounds concurrently open file descriptors across one context.
///
/// Waiters sleep in 25 ms ticks rather than relying purely on wakeups;
/// this mirrors the polling promotion loop of the original scheduler and
/// doubles as protection against missed notifications.
#[derive(Debug)]
pub struct DescriptorThrottle {
    ceiling: usize,
    active: Mutex<usize>,
    freed: Condvar,
}

impl DescriptorThrottle {
    #[must_use]
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling,
            active: Mutex::new(0),
            freed: Condvar::new(),
        }
    }

    /// Block until a descriptor slot frees up.
    pub fn acquire(self: &Arc<Self>) -> DescriptorPermit {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        while *active >= self.ceiling {
            let (guard, _timeout) = self
                .freed
                .wait_timeout(active, THROTTLE_TICK)
                .unwrap_or_else(|e| e.into_inner());
            active = guard;
        }
        *active += 1;
        DescriptorPermit {
            throttle: Arc::clone(self),
        }
    }

    #[cfg(test)]
    pub(crate) fn active_count(&self) -> usize {
        *self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// RAII slot in the descriptor throttle.
#[derive(Debug)]
pub struct DescriptorPermit {
    throttle: Arc<DescriptorThrottle>,
}

impl Drop for DescriptorPermit {
    fn drop(&mut self) {
        let mut active = self
            .throttle
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *active = active.saturating_sub(1);
        self.throttle.freed.notify_all();
    }
}

/// Fair FIFO lock: tickets are served strictly in the order they were
/// taken, so two writes to one path can never interleave or overtake.
#[derive(Debug, Default)]
struct Gate {
    state: Mutex<GateState>,
    advanced: Condvar,
}

#[derive(Debug, Default)]
struct GateState {
    next: u64,
    serving: u64,
}

/// Per-path serialization queue keyed by the logical file path.
#[derive(Debug, Default)]
pub struct PathQueue {
    gates: Mutex<HashMap<PathBuf, Arc<Gate>>>,
}

impl PathQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a ticket for `path` and block until it is at the head of the
    /// queue. Reads and writes share the same queue.
    pub fn acquire(&self, path: &Path) -> PathTicket {
        let gate = {
            let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(gates.entry(path.to_path_buf()).or_default())
        };
        {
            let mut state = gate.state.lock().unwrap_or_else(|e| e.into_inner());
            let ticket = state.next;
            state.next += 1;
            while state.serving != ticket {
                state = gate
                    .advanced
                    .wait(state)
                    .unwrap_or_else(|e| e.into_inner());
            }
        }
        PathTicket { gate }
    }
}

/// Head-of-queue ticket for one path. Dropping it advances the queue.
#[derive(Debug)]
pub struct PathTicket {
    gate: Arc<Gate>,
}

impl Drop for PathTicket {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock().unwrap_or_else(|e| e.into_inner());
        state.serving += 1;
        self.gate.advanced.notify_all();
    }
}

/// Temp files created but not yet renamed into place. Entries are removed
/// at the durability point (step: rename succeeded) or after the failure
/// unlink; anything still registered when the context drops is unlinked as
/// the crash-safety net.
#[derive(Debug, Default)]
struct PendingTempFiles {
    paths: Mutex<HashMap<PathBuf, bool>>,
}

impl PendingTempFiles {
    fn register(&self, path: PathBuf) {
        self.paths
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path, false);
    }

    fn purge(&self, path: &Path) {
        let mut paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(purged) = paths.get_mut(path) {
            *purged = true;
        }
        paths.retain(|_, purged| !*purged);
    }

    fn drain(&self) -> Vec<PathBuf> {
        let mut paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
        paths.drain().map(|(path, _)| path).collect()
    }
}

/// Everything a writer needs to perform a safe atomic write. Cheap to
/// clone (shared internals); one per store instance by default.
#[derive(Debug, Clone)]
pub struct DurabilityContext {
    throttle: Arc<DescriptorThrottle>,
    queue: Arc<PathQueue>,
    pending: Arc<PendingTempFiles>,
}

impl Default for DurabilityContext {
    fn default() -> Self {
        Self::new(DESCRIPTOR_CEILING)
    }
}

impl DurabilityContext {
    #[must_use]
    pub fn new(descriptor_ceiling: usize) -> Self {
        Self {
            throttle: Arc::new(DescriptorThrottle::new(descriptor_ceiling)),
            queue: Arc::new(PathQueue::new()),
            pending: Arc::new(PendingTempFiles::default()),
        }
    }

    pub fn acquire_descriptor(&self) -> DescriptorPermit {
        self.throttle.acquire()
    }

    pub fn acquire_path(&self, path: &Path) -> PathTicket {
        self.queue.acquire(path)
    }

    pub fn register_temp(&self, path: PathBuf) {
        self.pending.register(path);
    }

    pub fn purge_temp(&self, path: &Path) {
        self.pending.purge(path);
    }

    /// Unlink every temp file that never reached its rename. Called from
    /// `Drop`, also usable directly from a shutdown hook.
    pub fn cleanup_pending(&self) {
        for path in self.pending.drain() {
            if let Err(err) = fs_err::remove_file(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %err, "failed to unlink orphaned temp file");
                }
            }
        }
    }
}

impl Drop for DurabilityContext {
    fn drop(&mut self) {
        // Only the last clone sweeps, otherwise a short-lived clone could
        // unlink temp files still owned by in-flight writes.
        if Arc::strong_count(&self.pending) == 1 {
            self.cleanup_pending();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn throttle_bounds_active_permits() {
        let throttle = Arc::new(DescriptorThrottle::new(2));
        let a = throttle.acquire();
        let b = throttle.acquire();
        assert_eq!(throttle.active_count(), 2);

        let cloned = Arc::clone(&throttle);
        let waiter = thread::spawn(move || {
            let _c = cloned.acquire();
            cloned.active_count()
        });
        thread::sleep(Duration::from_millis(50));
        assert_eq!(throttle.active_count(), 2);
        drop(a);
        assert!(waiter.join().unwrap() <= 2);
        drop(b);
        assert_eq!(throttle.active_count(), 0);
    }

    #[test]
    fn path_queue_is_fifo_per_path() {
        let queue = Arc::new(PathQueue::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let path = PathBuf::from("/tmp/queue-test/config.json");

        let head = queue.acquire(&path);
        let mut handles = Vec::new();
        for i in 0..4 {
            // Stagger spawns so ticket order matches spawn order.
            let queue = Arc::clone(&queue);
            let order = Arc::clone(&order);
            let path = path.clone();
            handles.push(thread::spawn(move || {
                let _ticket = queue.acquire(&path);
                order.lock().unwrap().push(i);
            }));
            thread::sleep(Duration::from_millis(30));
        }
        drop(head);
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn different_paths_do_not_serialize() {
        let queue = Arc::new(PathQueue::new());
        let _a = queue.acquire(Path::new("/tmp/a.json"));
        let ran = Arc::new(AtomicUsize::new(0));
        let queue2 = Arc::clone(&queue);
        let ran2 = Arc::clone(&ran);
        let handle = thread::spawn(move || {
            let _b = queue2.acquire(Path::new("/tmp/b.json"));
            ran2.store(1, Ordering::SeqCst);
        });
        handle.join().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn context_drop_unlinks_pending_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let orphan = dir.path().join("config.json.tmp-0000000000abc123");
        std::fs::write(&orphan, b"{}").unwrap();

        let ctx = DurabilityContext::new(4);
        ctx.register_temp(orphan.clone());
        drop(ctx);
        assert!(!orphan.exists());
    }

    #[test]
    fn purged_temp_files_survive_context_drop() {
        let dir = tempfile::tempdir().unwrap();
        let kept = dir.path().join("config.json");
        std::fs::write(&kept, b"{}").unwrap();

        let ctx = DurabilityContext::new(4);
        ctx.register_temp(kept.clone());
        ctx.purge_temp(&kept);
        drop(ctx);
        assert!(kept.exists());
    }
}
