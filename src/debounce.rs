//! Single-slot deferred task: at most one armed task per slot, cancellable
//! as a whole.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;

#[derive(Default)]
struct SlotInner {
    generation: u64,
    armed: bool,
    tasks: Vec<JoinHandle<()>>,
}

/// A slot that holds at most one armed deferred task.
///
/// The scheduled task receives an [`Armed`] token. The slot stays armed, and
/// further schedules are refused, until the token is released or dropped.
/// [`DeferredSlot::cancel`] aborts every task the slot has spawned, armed or
/// not.
#[derive(Default)]
pub struct DeferredSlot {
    inner: Arc<Mutex<SlotInner>>,
}

/// Proof that the holder owns the slot's single armed position.
pub struct Armed {
    inner: Arc<Mutex<SlotInner>>,
    generation: u64,
}

impl Armed {
    /// Frees the slot so the next trigger can arm it again.
    pub fn release(self) {}
}

impl Drop for Armed {
    fn drop(&mut self) {
        let mut inner = lock(&self.inner);
        if inner.generation == self.generation {
            inner.armed = false;
        }
    }
}

fn lock(inner: &Mutex<SlotInner>) -> MutexGuard<'_, SlotInner> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

impl DeferredSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `task` unless the slot is already armed. Returns whether it
    /// was spawned.
    pub fn schedule_if_absent<F, Fut>(&self, task: F) -> bool
    where
        F: FnOnce(Armed) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = {
            let mut inner = lock(&self.inner);
            if inner.armed {
                return false;
            }
            inner.tasks.retain(|task| !task.is_finished());
            inner.generation += 1;
            inner.armed = true;
            inner.generation
        };

        let armed = Armed {
            inner: self.inner.clone(),
            generation,
        };
        let handle = tokio::spawn(task(armed));

        let mut inner = lock(&self.inner);
        if inner.generation == generation {
            inner.tasks.push(handle);
        } else {
            // Cancelled while we were spawning.
            handle.abort();
        }
        true
    }

    /// Aborts every spawned task and disarms the slot.
    pub fn cancel(&self) {
        let tasks = {
            let mut inner = lock(&self.inner);
            inner.generation += 1;
            inner.armed = false;
            std::mem::take(&mut inner.tasks)
        };
        for task in tasks {
            task.abort();
        }
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.inner).armed
    }
}
