//! Pending work: per-instance updates, discards and compute handle releases.
//!
//! Owned by the coordinating context; no locking. Holds at most one update
//! and at most one discard per instance handle.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::context::UpdateContext;
use crate::registry::InstanceHandle;
use crate::types::{ComputeId, ObjectId};

/// What adding an update displaced.
#[derive(Debug, Default)]
pub struct Displaced {
  /// Previously queued update for the same instance, to be finalized as replaced.
  pub replaced: Option<UpdateContext>,
  /// A queued discard for the instance was cancelled.
  pub discard_cancelled: bool,
}

/// Queue of pending work.
#[derive(Default)]
pub struct PendingQueue {
  updates: HashMap<InstanceHandle, UpdateContext>,
  discards: VecDeque<InstanceHandle>,
  discard_set: HashSet<InstanceHandle>,
  releases: VecDeque<ComputeId>,
}

impl PendingQueue {
  pub fn new() -> Self {
    Self::default()
  }

  // ---------------------------------------------------------------------------
  // Updates
  // ---------------------------------------------------------------------------

  /// Queue an update, replacing any queued update for the same instance.
  ///
  /// The new update keeps the more urgent priority and the earlier enqueue
  /// time of the two.
  pub fn add_update(&mut self, mut ctx: UpdateContext) -> Displaced {
    let mut displaced = Displaced::default();

    if self.discard_set.remove(&ctx.instance) {
      self.discards.retain(|h| *h != ctx.instance);
      displaced.discard_cancelled = true;
    }

    if let Some(old) = self.updates.remove(&ctx.instance) {
      ctx.inherit_position(&old);
      displaced.replaced = Some(old);
    }

    self.updates.insert(ctx.instance, ctx);
    displaced
  }

  pub fn update_for(&self, instance: InstanceHandle) -> Option<&UpdateContext> {
    self.updates.get(&instance)
  }

  pub fn take_update(&mut self, instance: InstanceHandle) -> Option<UpdateContext> {
    self.updates.remove(&instance)
  }

  pub fn has_update(&self, instance: InstanceHandle) -> bool {
    self.updates.contains_key(&instance)
  }

  /// Highest priority, nearest, oldest queued update.
  pub fn best_update(&self) -> Option<&UpdateContext> {
    self
      .updates
      .values()
      .min_by(|a, b| a.schedule_key().run_order(&b.schedule_key()))
  }

  /// Remove updates whose instance fails `is_alive`.
  pub fn remove_dead(&mut self, is_alive: impl Fn(InstanceHandle) -> bool) -> Vec<UpdateContext> {
    let dead: Vec<InstanceHandle> = self.updates.keys().copied().filter(|h| !is_alive(*h)).collect();
    dead.into_iter().filter_map(|h| self.updates.remove(&h)).collect()
  }

  /// Remove every update targeting instances of `object`.
  pub fn remove_for_object(&mut self, object: ObjectId) -> Vec<UpdateContext> {
    let matching: Vec<InstanceHandle> = self
      .updates
      .values()
      .filter(|ctx| ctx.object == object)
      .map(|ctx| ctx.instance)
      .collect();
    matching.into_iter().filter_map(|h| self.updates.remove(&h)).collect()
  }

  pub fn update_count(&self) -> usize {
    self.updates.len()
  }

  // ---------------------------------------------------------------------------
  // Discards
  // ---------------------------------------------------------------------------

  /// Queue a discard. Returns the queued update it cancels, if any.
  pub fn add_discard(&mut self, instance: InstanceHandle) -> Option<UpdateContext> {
    let cancelled = self.updates.remove(&instance);
    if self.discard_set.insert(instance) {
      self.discards.push_back(instance);
    }
    cancelled
  }

  pub fn pop_discard(&mut self) -> Option<InstanceHandle> {
    let instance = self.discards.pop_front()?;
    self.discard_set.remove(&instance);
    Some(instance)
  }

  pub fn has_discard(&self, instance: InstanceHandle) -> bool {
    self.discard_set.contains(&instance)
  }

  pub fn discard_count(&self) -> usize {
    self.discards.len()
  }

  // ---------------------------------------------------------------------------
  // Releases
  // ---------------------------------------------------------------------------

  pub fn add_release(&mut self, id: ComputeId) {
    self.releases.push_back(id);
  }

  pub fn pop_release(&mut self) -> Option<ComputeId> {
    self.releases.pop_front()
  }

  pub fn release_count(&self) -> usize {
    self.releases.len()
  }

  /// Total queued items of every kind.
  pub fn len(&self) -> usize {
    self.updates.len() + self.discards.len() + self.releases.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[cfg(test)]
#[path = "queue_test.rs"]
mod queue_test;
