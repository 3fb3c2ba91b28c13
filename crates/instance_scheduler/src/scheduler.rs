//! The coordinating scheduler.
//!
//! Owns the registry, the pending-work queue, the pipeline slot and the
//! compute worker. All methods run on the coordinating thread; only the
//! resource cache and the streaming reader are shared with workers.
//!
//! # Usage
//!
//! ```ignore
//! let mut scheduler = Scheduler::new(SchedulerConfig::default(), Box::new(engine), Box::new(NoAssets))?;
//! let object = scheduler.register_object(desc);
//! let instance = scheduler.create_instance(object).unwrap();
//!
//! let (ticket, callback) = UpdateTicket::channel();
//! scheduler.request_update(instance, descriptor, UpdateOptions::default().with_callback(callback));
//!
//! // Each frame
//! let remaining = scheduler.tick();
//! if let Some(outcome) = ticket.try_outcome() {
//!     println!("{:?}", outcome.result);
//! }
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use web_time::Instant;

use crate::budget::{TickBudget, TickStats};
use crate::cache::ResourceCache;
use crate::config::SchedulerConfig;
use crate::context::{ScheduleKey, UpdateCallback, UpdateContext, UpdateOutcome};
use crate::descriptor::Descriptor;
use crate::engine::{AssetLoader, BuildEngine, LodRequest};
use crate::error::SchedulerError;
use crate::metrics::SchedulerMetrics;
use crate::pipeline::{StageEnv, UpdatePipeline};
use crate::policy::{self, LodChange};
use crate::queue::PendingQueue;
use crate::registry::{InstanceHandle, InstanceRecord, ObjectDesc, ObjectRecord, Registry};
use crate::streaming::StreamingReader;
use crate::threading::{lock, ComputeQueue};
use crate::types::{AdmissionDecision, InstanceStatus, ObjectId, Priority, UpdateResult};

/// Per-request options for [`Scheduler::request_update`].
#[derive(Default)]
pub struct UpdateOptions {
  /// Run at `High`, skipping redundancy checks and the discard distance.
  pub force: bool,
  /// Receives the outcome exactly once.
  pub callback: Option<UpdateCallback>,
}

impl UpdateOptions {
  pub fn forced() -> Self {
    Self {
      force: true,
      callback: None,
    }
  }

  pub fn with_callback(mut self, callback: UpdateCallback) -> Self {
    self.callback = Some(callback);
    self
  }
}

/// A LOD-only update the scheduler wants to run on its own.
struct LodCandidate {
  instance: InstanceHandle,
  lods: LodRequest,
  key: ScheduleKey,
}

/// Instance update scheduler.
pub struct Scheduler {
  config: SchedulerConfig,
  budget: TickBudget,
  registry: Registry,
  queue: PendingQueue,
  pipeline: UpdatePipeline,
  cache: Arc<Mutex<ResourceCache>>,
  streaming: Arc<StreamingReader>,
  compute: ComputeQueue,
  loader: Box<dyn AssetLoader>,
  metrics: SchedulerMetrics,
  last_tick: TickStats,
}

impl Scheduler {
  /// Validate `config` and start the compute worker owning `engine`.
  pub fn new(
    config: SchedulerConfig,
    engine: Box<dyn BuildEngine>,
    loader: Box<dyn AssetLoader>,
  ) -> Result<Self, SchedulerError> {
    config.validate()?;
    let compute = ComputeQueue::new(engine)?;

    let bytes = config.working_memory_bytes;
    compute.spawn_detached(move |engine| engine.set_working_memory(bytes));

    tracing::debug!(
      cache_size = config.generated_resources_cache_size,
      working_memory = bytes,
      "scheduler created"
    );

    Ok(Self {
      budget: TickBudget::from_config(&config),
      cache: Arc::new(Mutex::new(ResourceCache::new(config.generated_resources_cache_size))),
      config,
      registry: Registry::new(),
      queue: PendingQueue::new(),
      pipeline: UpdatePipeline::new(),
      streaming: Arc::new(StreamingReader::new()),
      compute,
      loader,
      metrics: SchedulerMetrics::new(),
      last_tick: TickStats::default(),
    })
  }

  /// Share an existing streaming reader instead of owning a fresh one.
  pub fn with_streaming(mut self, streaming: Arc<StreamingReader>) -> Self {
    self.streaming = streaming;
    self
  }

  // ===========================================================================
  // Objects and instances
  // ===========================================================================

  /// Register a compiled object.
  ///
  /// Its streaming source, if any, is prepared separately through
  /// [`streaming`](Self::streaming).
  pub fn register_object(&mut self, desc: ObjectDesc) -> ObjectId {
    let id = self.registry.add_object(desc);
    tracing::debug!(object = id.0, "object registered");
    id
  }

  /// Forget an object. Its instances become invalid.
  pub fn unregister_object(&mut self, object: ObjectId) -> bool {
    if self.registry.remove_object(object).is_none() {
      return false;
    }
    for ctx in self.queue.remove_for_object(object) {
      self.finalize(ctx, UpdateResult::Error);
    }
    true
  }

  pub fn object(&self, object: ObjectId) -> Option<&ObjectRecord> {
    self.registry.object(object)
  }

  /// Create an instance of `object`. Returns `None` for unknown objects.
  pub fn create_instance(&mut self, object: ObjectId) -> Option<InstanceHandle> {
    if !self.registry.is_object_alive(object) {
      return None;
    }
    Some(self.registry.insert(InstanceRecord::new(object)))
  }

  /// Destroy an instance, dropping its resources and any queued work.
  ///
  /// An update already in the pipeline degrades to `Error` on its next stage.
  pub fn destroy_instance(&mut self, handle: InstanceHandle) -> bool {
    let Some(record) = self.registry.remove(handle) else {
      return false;
    };

    if let Some(ctx) = self.queue.take_update(handle) {
      self.finalize(ctx, UpdateResult::Error);
    }
    if let Some(id) = record.live_compute_id {
      self.queue.add_release(id);
    }
    let mut cache = lock(&self.cache);
    for image in record.generated.iter().flat_map(|c| c.images.iter()) {
      cache.remove_texture_reference(image.key);
    }
    true
  }

  pub fn instance(&self, handle: InstanceHandle) -> Option<&InstanceRecord> {
    self.registry.get(handle)
  }

  /// Mutable record access, for flags such as `live_update` or `forced_update`.
  pub fn instance_mut(&mut self, handle: InstanceHandle) -> Option<&mut InstanceRecord> {
    self.registry.get_mut(handle)
  }

  /// Update viewer relevance of an instance.
  pub fn set_instance_distance(&mut self, handle: InstanceHandle, distance: f32, near_viewer: bool) -> bool {
    match self.registry.get_mut(handle) {
      Some(record) => {
        record.distance = distance;
        record.near_viewer = near_viewer;
        true
      }
      None => false,
    }
  }

  // ===========================================================================
  // Requests
  // ===========================================================================

  /// Submit an update for `handle` with the parameters in `descriptor`.
  pub fn request_update(
    &mut self,
    handle: InstanceHandle,
    descriptor: Descriptor,
    options: UpdateOptions,
  ) -> AdmissionDecision {
    let UpdateOptions { force, callback } = options;

    let Some(record) = self.registry.get(handle).filter(|_| self.registry.is_alive(handle)) else {
      tracing::debug!(instance = handle.index(), "update for invalid instance");
      self.reject(handle, callback, UpdateResult::Error);
      return AdmissionDecision::NoUpdate;
    };

    if !self.config.enabled {
      self.reject(handle, callback, UpdateResult::Error);
      return AdmissionDecision::NoUpdate;
    }

    let Some(object) = self
      .registry
      .object(record.object)
      .filter(|object| object.compiled && !object.locked)
    else {
      tracing::debug!(instance = handle.index(), "object locked or not compiled");
      self.reject(handle, callback, UpdateResult::Error);
      return AdmissionDecision::NoUpdate;
    };

    let forced = force || record.forced_update;
    if !forced && policy::should_discard(&self.config, record) {
      tracing::debug!(instance = handle.index(), distance = record.distance, "out of range; discarding");
      self.request_discard(handle);
      self.reject(handle, callback, UpdateResult::ErrorDiscarded);
      return AdmissionDecision::Discard;
    }

    let lods = policy::lod_request_for(&self.config, record, object);
    let priority = if forced {
      Priority::High
    } else {
      policy::update_priority(record, LodChange::between(record, &lods))
    };
    let mut ctx = UpdateContext::new(handle, record.object, descriptor, lods, priority).with_callback(callback);
    ctx.distance = record.distance;
    ctx.forced = forced;

    if self.config.optimize_updates && !forced && self.is_redundant(&ctx) {
      self.finalize(ctx, UpdateResult::ErrorOptimized);
      return AdmissionDecision::Update;
    }

    if self.pipeline.mark_superseded(handle) {
      tracing::debug!(instance = handle.index(), "newer request replaces the running update");
    }

    let displaced = self.queue.add_update(ctx);
    if let Some(old) = displaced.replaced {
      self.finalize(old, UpdateResult::ErrorReplaced);
    }
    if displaced.discard_cancelled {
      tracing::debug!(instance = handle.index(), "queued discard cancelled by update");
    }
    tracing::debug!(instance = handle.index(), ?priority, "update queued");
    AdmissionDecision::Update
  }

  /// Check if running, queued or committed work already covers `ctx`.
  ///
  /// Being covered by the committed result re-applies that result.
  fn is_redundant(&mut self, ctx: &UpdateContext) -> bool {
    let handle = ctx.instance;
    let covered_by_current = self
      .pipeline
      .live_hash_for(handle)
      .is_some_and(|current| ctx.hash.is_subset(current));
    let covered_by_queued = self
      .queue
      .update_for(handle)
      .is_some_and(|queued| ctx.hash.is_subset(&queued.hash));

    let idle = !self.queue.has_update(handle) && self.pipeline.current_instance() != Some(handle);
    let covered_by_committed = idle
      && self.registry.get(handle).is_some_and(|record| {
        record.is_generated() && record.committed_hash().is_some_and(|committed| ctx.hash.is_subset(committed))
      });

    if covered_by_committed {
      // Re-apply the committed result before anyone observes the outcome
      if let Some(record) = self.registry.get_mut(handle) {
        record.reapply_count += 1;
      }
    }

    let redundant = covered_by_current || covered_by_queued || covered_by_committed;
    if redundant {
      tracing::debug!(
        instance = handle.index(),
        covered_by_current,
        covered_by_queued,
        covered_by_committed,
        "request optimized away"
      );
    }
    redundant
  }

  /// Queue a discard of `handle`'s generated resources.
  ///
  /// A queued update for the instance is finalized as `ErrorDiscarded`.
  pub fn request_discard(&mut self, handle: InstanceHandle) {
    if self.registry.get(handle).is_none() {
      return;
    }
    if let Some(ctx) = self.queue.add_discard(handle) {
      self.finalize(ctx, UpdateResult::ErrorDiscarded);
    }
  }

  /// True if an update for `handle` is queued or running (and not superseded).
  pub fn is_updating(&self, handle: InstanceHandle) -> bool {
    self.queue.has_update(handle) || self.pipeline.live_hash_for(handle).is_some()
  }

  // ===========================================================================
  // Scheduling
  // ===========================================================================

  /// Run one scheduling pass. Returns the amount of work left.
  pub fn tick(&mut self) -> usize {
    let _span = tracing::debug_span!("scheduler::tick").entered();
    self.metrics.ticks += 1;
    let mut stats = TickStats::default();

    if !self.pipeline.is_busy() {
      self.sweep();
      if let Some(ctx) = self.select_next() {
        self.pipeline.start(ctx);
        stats.update_started = true;
      }
    }

    if self.pipeline.is_busy() {
      let mut env = StageEnv {
        config: &self.config,
        registry: &mut self.registry,
        queue: &mut self.queue,
        cache: self.cache.as_ref(),
        compute: &self.compute,
        loader: self.loader.as_mut(),
        metrics: &mut self.metrics,
      };
      stats.update_finished = self.pipeline.advance(&mut env).is_some();
    }

    self.process_discards(&mut stats);
    self.process_releases(&mut stats);
    self.last_tick = stats;

    self.remaining_work()
  }

  /// Tick until no work is left or `time_limit` elapses (zero = no limit).
  ///
  /// Returns false if the limit elapsed first.
  pub fn block_till_all_requests_finished(&mut self, time_limit: Duration) -> bool {
    let start = Instant::now();
    loop {
      let remaining = self.tick();
      if remaining == 0 {
        return true;
      }
      if !time_limit.is_zero() && start.elapsed() >= time_limit {
        tracing::warn!(remaining, ?time_limit, "drain timed out");
        return false;
      }
      std::thread::yield_now();
    }
  }

  /// Current operation + queued updates, discards and releases + compute jobs.
  pub fn remaining_work(&self) -> usize {
    usize::from(self.pipeline.is_busy()) + self.queue.len() + self.compute.pending_count()
  }

  fn sweep(&mut self) {
    let registry = &self.registry;
    let stats = lock(&self.cache).sweep(|object| registry.is_object_alive(object), self.config.cleanup_cache);
    self.metrics.sweeps += 1;
    if stats.objects_dropped + stats.entries_dropped > 0 {
      tracing::trace!(?stats, "cache swept");
    }
  }

  /// Pick the next update to run.
  fn select_next(&mut self) -> Option<UpdateContext> {
    let registry = &self.registry;
    for ctx in self.queue.remove_dead(|handle| registry.is_alive(handle)) {
      self.finalize(ctx, UpdateResult::Error);
    }

    let best_queued = self.queue.best_update().map(|ctx| ctx.schedule_key());
    let candidate = self
      .best_lod_candidate()
      .filter(|candidate| best_queued.map_or(true, |queued| candidate.key.runs_before(&queued)));

    let Some(candidate) = candidate else {
      let handle = self.queue.best_update()?.instance;
      let lods = self.distance_lods(handle);
      return self.take_merged(handle, lods);
    };

    if let Some(queued) = self.take_merged(candidate.instance, Some(candidate.lods.clone())) {
      return Some(queued);
    }

    let record = self.registry.get(candidate.instance)?;
    let committed = record.committed.as_ref()?;
    tracing::debug!(instance = candidate.instance.index(), lods = ?candidate.lods, "LOD update synthesized");
    let mut ctx = UpdateContext::new(
      candidate.instance,
      record.object,
      committed.descriptor.clone(),
      candidate.lods,
      candidate.key.priority,
    );
    ctx.distance = record.distance;
    Some(ctx)
  }

  /// Take the queued update for `instance`, folding in finer `lods`.
  fn take_merged(&mut self, instance: InstanceHandle, lods: Option<LodRequest>) -> Option<UpdateContext> {
    let mut queued = self.queue.take_update(instance)?;
    if let Some(lods) = lods {
      let merged = merge_lods(&queued.lods, &lods);
      if merged != queued.lods {
        tracing::debug!(instance = instance.index(), lods = ?merged, "LOD change merged into queued update");
        queued.set_lods(merged);
      }
    }
    Some(queued)
  }

  /// LODs the instance's current distance calls for.
  fn distance_lods(&self, handle: InstanceHandle) -> Option<LodRequest> {
    let record = self.registry.get(handle)?;
    let object = self.registry.object(record.object)?;
    Some(policy::lod_request_for(&self.config, record, object))
  }

  /// Generated instances whose LODs no longer match their distance.
  ///
  /// An instance with a queued update only counts when its distance calls for
  /// finer LODs than the queued update carries; it then competes with the
  /// better of the two keys.
  fn best_lod_candidate(&self) -> Option<LodCandidate> {
    let now = Instant::now();
    let current = self.pipeline.current_instance();

    self
      .registry
      .iter()
      .filter(|(handle, record)| {
        record.is_generated()
          && Some(*handle) != current
          && !self.queue.has_discard(*handle)
          && !policy::should_discard(&self.config, record)
      })
      .filter_map(|(handle, record)| {
        let object = self.registry.object(record.object)?;
        if object.locked || !object.compiled {
          return None;
        }
        let committed = record.committed_hash()?;
        let lods = policy::lod_request_for(&self.config, record, object);
        if committed.with_lods(lods.min_lod, &lods.requested_lods).is_subset(committed) {
          return None;
        }
        let queued = self.queue.update_for(handle);
        if queued.is_some_and(|queued| merge_lods(&queued.lods, &lods) == queued.lods) {
          return None;
        }
        let priority = policy::update_priority(record, LodChange::between(record, &lods));
        let mut key = ScheduleKey {
          priority,
          distance: record.distance,
          enqueued_at: now,
        };
        if let Some(queued) = queued.map(UpdateContext::schedule_key) {
          if queued.runs_before(&key) {
            key = queued;
          }
        }
        Some(LodCandidate {
          instance: handle,
          lods,
          key,
        })
      })
      .min_by(|a, b| a.key.run_order(&b.key))
  }

  fn process_discards(&mut self, stats: &mut TickStats) {
    let current = self.pipeline.current_instance();
    while self.budget.can_discard(stats.discards_processed) {
      let Some(handle) = self.queue.pop_discard() else {
        break;
      };
      stats.discards_processed += 1;

      if Some(handle) == current {
        tracing::debug!(instance = handle.index(), "discard skipped; instance is updating");
        stats.discards_skipped += 1;
        continue;
      }

      let Some(record) = self.registry.get_mut(handle) else {
        continue;
      };
      let generated = std::mem::take(&mut record.generated);
      record.committed = None;
      record.status = InstanceStatus::NotGenerated;
      if let Some(id) = record.live_compute_id.take() {
        self.queue.add_release(id);
      }

      let mut cache = lock(&self.cache);
      for image in generated.iter().flat_map(|c| c.images.iter()) {
        cache.remove_texture_reference(image.key);
      }
      tracing::debug!(instance = handle.index(), "instance resources discarded");
    }
  }

  fn process_releases(&mut self, stats: &mut TickStats) {
    while self.budget.can_release(stats.releases_processed) {
      let Some(id) = self.queue.pop_release() else {
        break;
      };
      stats.releases_processed += 1;
      self.compute.spawn_detached(move |engine| engine.release_instance(id));
    }
  }

  // ===========================================================================
  // Structural locks
  // ===========================================================================

  /// Lock `object` for a structural edit.
  ///
  /// Fails while its update is running or its source has reads in flight.
  /// On success the object's queued updates fail, its streaming source is
  /// drained and dropped, and its cache entries are forgotten. The source
  /// must be prepared again after unlocking.
  pub fn lock_object(&mut self, object: ObjectId) -> bool {
    let Some(record) = self.registry.object(object) else {
      return false;
    };
    if self.pipeline.current_object() == Some(object) {
      tracing::debug!(object = object.0, "cannot lock object while it is updating");
      return false;
    }
    let source = record.source;
    if source.is_some_and(|source| self.streaming.are_there_pending_ops(source)) {
      tracing::debug!(object = object.0, "cannot lock object with reads in flight");
      return false;
    }

    if let Some(record) = self.registry.object_mut(object) {
      record.locked = true;
      record.model_generation = record.model_generation.wrapping_add(1);
    }

    if let Some(source) = source {
      if self.streaming.are_there_pending_ops(source) {
        tracing::warn!(object = object.0, "reads started while locking; draining");
      }
      self.streaming.cancel_streaming(source);
    }

    for ctx in self.queue.remove_for_object(object) {
      self.finalize(ctx, UpdateResult::Error);
    }
    lock(&self.cache).clear_object(object);
    tracing::debug!(object = object.0, "object locked");
    true
  }

  pub fn unlock_object(&mut self, object: ObjectId) -> bool {
    match self.registry.object_mut(object) {
      Some(record) => {
        record.locked = false;
        true
      }
      None => false,
    }
  }

  // ===========================================================================
  // Finalization
  // ===========================================================================

  fn finalize(&mut self, ctx: UpdateContext, result: UpdateResult) -> UpdateOutcome {
    let outcome = ctx.finalize(result);
    self.metrics.record_outcome(&outcome);
    outcome
  }

  /// Finalize a request that never became a context.
  fn reject(&mut self, instance: InstanceHandle, callback: Option<UpdateCallback>, result: UpdateResult) {
    let outcome = UpdateOutcome {
      instance,
      result,
      queue_time: Duration::ZERO,
      update_time: Duration::ZERO,
    };
    tracing::debug!(instance = instance.index(), ?result, "request rejected");
    if let Some(callback) = callback {
      callback(&outcome);
    }
    self.metrics.record_outcome(&outcome);
  }

  // ===========================================================================
  // Accessors
  // ===========================================================================

  pub fn config(&self) -> &SchedulerConfig {
    &self.config
  }

  pub fn metrics(&self) -> &SchedulerMetrics {
    &self.metrics
  }

  pub fn streaming(&self) -> &Arc<StreamingReader> {
    &self.streaming
  }

  pub fn cache(&self) -> &Arc<Mutex<ResourceCache>> {
    &self.cache
  }

  pub fn pipeline(&self) -> &UpdatePipeline {
    &self.pipeline
  }

  pub fn last_tick_stats(&self) -> TickStats {
    self.last_tick
  }
}

/// Finest of each pair of LODs.
fn merge_lods(a: &LodRequest, b: &LodRequest) -> LodRequest {
  LodRequest {
    min_lod: a.min_lod.min(b.min_lod),
    requested_lods: a
      .requested_lods
      .iter()
      .zip(b.requested_lods.iter())
      .map(|(x, y)| *x.min(y))
      .collect(),
  }
}

#[cfg(test)]
#[path = "scheduler_test.rs"]
mod scheduler_test;
