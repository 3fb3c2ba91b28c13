//! Priority and LOD relevance policy.

use crate::config::SchedulerConfig;
use crate::engine::LodRequest;
use crate::registry::{InstanceRecord, ObjectRecord};
use crate::types::Priority;

/// How an update changes the LODs of an already generated instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LodChange {
  /// Parameters changed (or nothing generated yet).
  None,
  /// Finer LODs than the committed result.
  Upgrade,
  /// Only coarser LODs than the committed result.
  Downgrade,
}

impl LodChange {
  /// Classify `requested` against the committed LODs of `record`.
  pub fn between(record: &InstanceRecord, requested: &LodRequest) -> LodChange {
    let Some(committed) = record.committed_hash() else {
      return LodChange::None;
    };
    let (wanted, held) = (requested.requested_lods.as_slice(), committed.requested_lods.as_slice());
    if requested.min_lod == committed.min_lod && wanted == held {
      return LodChange::None;
    }
    // Any component asking for finer data than it holds makes this an upgrade
    let coarser = requested.min_lod >= committed.min_lod
      && wanted.len() == held.len()
      && wanted.iter().zip(held).all(|(w, h)| w >= h);
    if coarser {
      LodChange::Downgrade
    } else {
      LodChange::Upgrade
    }
  }
}

/// Priority of an update for `record`. The first matching rule wins.
pub fn update_priority(record: &InstanceRecord, change: LodChange) -> Priority {
  if record.forced_update {
    return Priority::High;
  }
  if !record.is_generated() {
    return Priority::Med;
  }
  match change {
    LodChange::Downgrade => Priority::MedLow,
    LodChange::Upgrade if record.near_viewer => Priority::High,
    LodChange::Upgrade => Priority::Med,
    LodChange::None if record.near_viewer => Priority::High,
    LodChange::None => Priority::Low,
  }
}

/// LOD for a viewer at `distance`: the number of thresholds already passed,
/// clamped to the coarsest LOD the model has.
pub fn lod_for_distance(thresholds: &[f32], distance: f32, lod_count: u8) -> u8 {
  let passed = thresholds.iter().take_while(|&&t| distance >= t).count();
  passed.min(lod_count.saturating_sub(1) as usize) as u8
}

/// LODs an instance should have at its current distance.
pub fn lod_request_for(
  config: &SchedulerConfig,
  record: &InstanceRecord,
  object: &ObjectRecord,
) -> LodRequest {
  let lod = lod_for_distance(&config.lod_distances, record.distance, object.lod_count);
  LodRequest::uniform(lod, object.component_count)
}

/// True if an instance this far away should be discarded instead of updated.
pub fn should_discard(config: &SchedulerConfig, record: &InstanceRecord) -> bool {
  !record.forced_update && record.distance > config.discard_distance
}
