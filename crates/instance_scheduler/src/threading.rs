//! Single-flight compute queue.
//!
//! The build engine is not reentrant, so every compute-bound stage runs on a
//! dedicated one-thread rayon pool that owns the engine. Jobs run in
//! submission order; results are collected by id like any other task.
//!
//! # Usage
//!
//! ```ignore
//! let compute = ComputeQueue::new(Box::new(engine))?;
//!
//! // Queue work (non-blocking)
//! let task = compute.submit(move |engine| engine.get_mesh(id, mesh));
//!
//! // Poll each tick
//! if let Some(mesh) = compute.poll::<Result<Mesh, EngineError>>(task) {
//!     // Use result
//! }
//! ```

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::engine::BuildEngine;

/// Unique identifier for a submitted compute job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
  fn next() -> Self {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    Self(COUNTER.fetch_add(1, Ordering::Relaxed))
  }
}

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct TaskState {
  /// Completed results waiting to be polled.
  results: HashMap<TaskId, Box<dyn Any + Send>>,
  /// Jobs queued or running.
  pending: HashSet<TaskId>,
}

#[derive(Default)]
struct Shared {
  state: Mutex<TaskState>,
  changed: Condvar,
}

/// Serialized executor owning the build engine.
pub struct ComputeQueue {
  pool: rayon::ThreadPool,
  engine: Arc<Mutex<Box<dyn BuildEngine>>>,
  shared: Arc<Shared>,
}

impl ComputeQueue {
  /// Start the compute worker.
  pub fn new(engine: Box<dyn BuildEngine>) -> Result<Self, rayon::ThreadPoolBuildError> {
    let pool = rayon::ThreadPoolBuilder::new()
      .num_threads(1)
      .thread_name(|i| format!("instance-compute-{i}"))
      .build()?;

    Ok(Self {
      pool,
      engine: Arc::new(Mutex::new(engine)),
      shared: Arc::new(Shared::default()),
    })
  }

  /// Queue a job whose result is collected with [`poll`](Self::poll) or
  /// [`wait`](Self::wait).
  pub fn submit<F, T>(&self, work: F) -> TaskId
  where
    F: FnOnce(&mut dyn BuildEngine) -> T + Send + 'static,
    T: Send + 'static,
  {
    self.dispatch(move |engine| Some(Box::new(work(engine)) as Box<dyn Any + Send>))
  }

  /// Queue a job nobody waits on. It still counts as pending until done.
  pub fn spawn_detached<F>(&self, work: F) -> TaskId
  where
    F: FnOnce(&mut dyn BuildEngine) + Send + 'static,
  {
    self.dispatch(move |engine| {
      work(engine);
      None
    })
  }

  fn dispatch<F>(&self, work: F) -> TaskId
  where
    F: FnOnce(&mut dyn BuildEngine) -> Option<Box<dyn Any + Send>> + Send + 'static,
  {
    let task_id = TaskId::next();
    lock(&self.shared.state).pending.insert(task_id);

    let engine = Arc::clone(&self.engine);
    let shared = Arc::clone(&self.shared);

    // FIFO on a one-thread pool: jobs never overlap and run in order
    self.pool.spawn_fifo(move || {
      let output = {
        let mut engine = lock(&engine);
        work(&mut **engine)
      };

      let mut state = lock(&shared.state);
      if let Some(output) = output {
        state.results.insert(task_id, output);
      }
      state.pending.remove(&task_id);
      drop(state);
      shared.changed.notify_all();
    });

    task_id
  }

  /// Take a job's result (non-blocking).
  ///
  /// Returns `None` while running, for detached jobs, or when the id was
  /// already consumed.
  pub fn poll<T: 'static>(&self, task_id: TaskId) -> Option<T> {
    let mut state = lock(&self.shared.state);
    take_result(&mut state, task_id)
  }

  /// Block until a job finishes and take its result.
  pub fn wait<T: 'static>(&self, task_id: TaskId) -> Option<T> {
    let mut state = lock(&self.shared.state);
    loop {
      if state.results.contains_key(&task_id) {
        return take_result(&mut state, task_id);
      }
      if !state.pending.contains(&task_id) {
        return None;
      }
      state = self
        .shared
        .changed
        .wait(state)
        .unwrap_or_else(PoisonError::into_inner);
    }
  }

  /// Block until no job is queued or running.
  pub fn wait_idle(&self) {
    let mut state = lock(&self.shared.state);
    while !state.pending.is_empty() {
      state = self
        .shared
        .changed
        .wait(state)
        .unwrap_or_else(PoisonError::into_inner);
    }
  }

  /// Check if a job is still queued or running.
  pub fn is_pending(&self, task_id: TaskId) -> bool {
    lock(&self.shared.state).pending.contains(&task_id)
  }

  /// Number of jobs queued or running.
  pub fn pending_count(&self) -> usize {
    lock(&self.shared.state).pending.len()
  }
}

fn take_result<T: 'static>(state: &mut TaskState, task_id: TaskId) -> Option<T> {
  let output = state.results.remove(&task_id)?;
  output.downcast::<T>().ok().map(|b| *b)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_utils::FakeEngine;
  use crate::types::ObjectId;

  #[test]
  fn test_submit_and_wait() {
    let compute = ComputeQueue::new(Box::new(FakeEngine::new())).unwrap();

    let task = compute.submit(|engine| engine.new_instance(ObjectId(0)));
    let id = compute.wait::<crate::types::ComputeId>(task);

    assert!(id.is_some());
    assert!(!compute.is_pending(task));
    // Consumed
    assert!(compute.poll::<crate::types::ComputeId>(task).is_none());
  }

  #[test]
  fn test_poll_until_complete() {
    let compute = ComputeQueue::new(Box::new(FakeEngine::new())).unwrap();
    let task = compute.submit(|_| 42i32);

    let mut result = None;
    for _ in 0..1000 {
      if let Some(r) = compute.poll::<i32>(task) {
        result = Some(r);
        break;
      }
      std::thread::sleep(std::time::Duration::from_millis(1));
    }

    assert_eq!(result, Some(42));
  }

  #[test]
  fn test_jobs_run_in_order_one_at_a_time() {
    let compute = ComputeQueue::new(Box::new(FakeEngine::new())).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));
    let running = Arc::new(AtomicU64::new(0));

    for i in 0..20 {
      let order = Arc::clone(&order);
      let running = Arc::clone(&running);
      compute.spawn_detached(move |_| {
        assert_eq!(running.fetch_add(1, Ordering::SeqCst), 0);
        std::thread::sleep(std::time::Duration::from_micros(200));
        order.lock().unwrap().push(i);
        running.fetch_sub(1, Ordering::SeqCst);
      });
    }

    compute.wait_idle();
    assert_eq!(compute.pending_count(), 0);
    assert_eq!(*order.lock().unwrap(), (0..20).collect::<Vec<_>>());
  }

  #[test]
  fn test_wrong_type_yields_none() {
    let compute = ComputeQueue::new(Box::new(FakeEngine::new())).unwrap();
    let task = compute.submit(|_| 7u8);
    assert!(compute.wait::<String>(task).is_none());
  }
}
