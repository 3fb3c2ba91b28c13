//! The unit of work: one update of one instance.
//!
//! An [`UpdateContext`] is owned by the pending queue or by the current
//! operation slot until it is finalized. Finalizing consumes the context, so
//! its result can only ever be delivered once; a context dropped without
//! being finalized delivers `Error`.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{self as channel, Receiver, RecvTimeoutError, TryRecvError};
use web_time::Instant;

use crate::descriptor::{Descriptor, DescriptorHash};
use crate::engine::{BuildLayout, ImageSlot, LodRequest};
use crate::registry::InstanceHandle;
use crate::types::{ComputeId, Image, ImageKey, Mesh, MeshId, ObjectId, Priority, UpdateResult};

/// Delivered to the requester once an update is finalized.
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateOutcome {
  pub instance: InstanceHandle,
  pub result: UpdateResult,
  /// Time between enqueue and the pipeline picking the update up.
  pub queue_time: Duration,
  /// Time spent in the pipeline.
  pub update_time: Duration,
}

/// Completion callback for a single update.
pub type UpdateCallback = Box<dyn FnOnce(&UpdateOutcome) + Send>;

/// Single-consumer handle to an update's outcome.
pub struct UpdateTicket {
  receiver: Receiver<UpdateOutcome>,
}

impl UpdateTicket {
  /// Create a ticket and the callback that completes it.
  pub fn channel() -> (UpdateTicket, UpdateCallback) {
    let (sender, receiver) = channel::bounded(1);
    let callback: UpdateCallback = Box::new(move |outcome| {
      // Ticket dropped = nobody is interested
      let _ = sender.send(outcome.clone());
    });
    (UpdateTicket { receiver }, callback)
  }

  /// Non-blocking check for the outcome.
  pub fn try_outcome(&self) -> Option<UpdateOutcome> {
    match self.receiver.try_recv() {
      Ok(outcome) => Some(outcome),
      Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
    }
  }

  /// Wait up to `timeout` for the outcome.
  pub fn wait(&self, timeout: Duration) -> Option<UpdateOutcome> {
    match self.receiver.recv_timeout(timeout) {
      Ok(outcome) => Some(outcome),
      Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
    }
  }
}

/// Ordering key for scheduling: priority, then distance, then age.
#[derive(Clone, Copy, Debug)]
pub struct ScheduleKey {
  pub priority: Priority,
  pub distance: f32,
  pub enqueued_at: Instant,
}

impl ScheduleKey {
  /// `Less` means `self` should run first.
  pub fn run_order(&self, other: &ScheduleKey) -> Ordering {
    other
      .priority
      .cmp(&self.priority)
      .then_with(|| self.distance.total_cmp(&other.distance))
      .then_with(|| self.enqueued_at.cmp(&other.enqueued_at))
  }

  pub fn runs_before(&self, other: &ScheduleKey) -> bool {
    self.run_order(other) == Ordering::Less
  }
}

/// An image the pipeline asked the engine for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageRequest {
  pub slot: ImageSlot,
  pub mips_to_skip: u32,
}

/// Intermediate data accumulated by the pipeline stages.
#[derive(Default)]
pub struct Staging {
  pub layout: Option<BuildLayout>,
  pub meshes: HashMap<MeshId, Arc<Mesh>>,
  /// Meshes the engine has to build.
  pub requested_meshes: Vec<MeshId>,
  pub images: HashMap<ImageKey, Arc<Image>>,
  /// Images the engine has to build.
  pub requested_images: Vec<ImageRequest>,
  /// Images whose recorded size is missing; replaced by placeholders.
  pub placeholder_images: Vec<ImageKey>,
  /// Newly built images, before size fixing.
  pub built_images: Vec<(ImageRequest, Image)>,
}

/// One update of one instance.
pub struct UpdateContext {
  pub instance: InstanceHandle,
  pub object: ObjectId,
  pub descriptor: Descriptor,
  pub hash: DescriptorHash,
  pub lods: LodRequest,
  pub priority: Priority,
  pub distance: f32,
  pub enqueued_at: Instant,
  pub started_at: Option<Instant>,
  /// Skip redundancy checks.
  pub forced: bool,
  /// Keep the compute instance after the update.
  pub live_mode: bool,
  pub compute_id: Option<ComputeId>,
  /// A newer request for the same instance arrived while this one ran.
  pub superseded: bool,
  /// Satisfied by the committed result; nothing was built.
  pub short_circuited: bool,
  /// Running result, folded by each stage.
  pub result: UpdateResult,
  pub staging: Staging,
  callback: Option<UpdateCallback>,
}

impl UpdateContext {
  pub fn new(
    instance: InstanceHandle,
    object: ObjectId,
    descriptor: Descriptor,
    lods: LodRequest,
    priority: Priority,
  ) -> Self {
    let hash = descriptor.hash_with(lods.min_lod, &lods.requested_lods);
    Self {
      instance,
      object,
      descriptor,
      hash,
      lods,
      priority,
      distance: 0.0,
      enqueued_at: Instant::now(),
      started_at: None,
      forced: false,
      live_mode: false,
      compute_id: None,
      superseded: false,
      short_circuited: false,
      result: UpdateResult::Success,
      staging: Staging::default(),
      callback: None,
    }
  }

  pub fn with_callback(mut self, callback: Option<UpdateCallback>) -> Self {
    self.callback = callback;
    self
  }

  pub fn has_callback(&self) -> bool {
    self.callback.is_some()
  }

  pub fn schedule_key(&self) -> ScheduleKey {
    ScheduleKey {
      priority: self.priority,
      distance: self.distance,
      enqueued_at: self.enqueued_at,
    }
  }

  /// Replace the LODs, keeping the hash consistent.
  pub fn set_lods(&mut self, lods: LodRequest) {
    self.hash = self.hash.with_lods(lods.min_lod, &lods.requested_lods);
    self.lods = lods;
  }

  /// Take over the queue position of a context this one replaces.
  pub fn inherit_position(&mut self, replaced: &UpdateContext) {
    self.priority = self.priority.max(replaced.priority);
    self.enqueued_at = self.enqueued_at.min(replaced.enqueued_at);
  }

  /// Deliver the terminal result. Consumes the context.
  pub fn finalize(mut self, result: UpdateResult) -> UpdateOutcome {
    let now = Instant::now();
    let started = self.started_at.unwrap_or(now);
    let outcome = UpdateOutcome {
      instance: self.instance,
      result,
      queue_time: started.saturating_duration_since(self.enqueued_at),
      update_time: now.saturating_duration_since(started),
    };

    tracing::info!(
      instance = self.instance.index(),
      ?result,
      queue_ms = outcome.queue_time.as_secs_f64() * 1000.0,
      update_ms = outcome.update_time.as_secs_f64() * 1000.0,
      "update finished"
    );

    if let Some(callback) = self.callback.take() {
      callback(&outcome);
    }
    outcome
  }
}

impl Drop for UpdateContext {
  fn drop(&mut self) {
    if let Some(callback) = self.callback.take() {
      tracing::warn!(instance = self.instance.index(), "update dropped without finalize");
      callback(&UpdateOutcome {
        instance: self.instance,
        result: UpdateResult::Error,
        queue_time: Duration::ZERO,
        update_time: Duration::ZERO,
      });
    }
  }
}

impl std::fmt::Debug for UpdateContext {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("UpdateContext")
      .field("instance", &self.instance)
      .field("priority", &self.priority)
      .field("lods", &self.lods)
      .field("result", &self.result)
      .field("superseded", &self.superseded)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
#[path = "context_test.rs"]
mod context_test;
