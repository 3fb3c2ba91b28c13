//! Objects and instances known to the scheduler.
//!
//! Instances live in a generation-checked arena: an [`InstanceHandle`] stays
//! valid only while the slot it points at still holds the same generation,
//! so a recycled slot never aliases a destroyed instance.

use std::collections::HashMap;

use crate::descriptor::{Descriptor, DescriptorHash};
use crate::streaming::SourceId;
use crate::types::{ComputeId, GeneratedComponent, InstanceStatus, ObjectId};

// =============================================================================
// InstanceHandle - generation checked
// =============================================================================

/// Non-owning, generation-checked reference to an instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceHandle {
  index: u32,
  generation: u32,
}

impl InstanceHandle {
  /// Slot index.
  pub fn index(&self) -> u32 {
    self.index
  }

  /// Slot generation this handle was issued for.
  pub fn generation(&self) -> u32 {
    self.generation
  }
}

// =============================================================================
// Records
// =============================================================================

/// Result committed by the last applied update.
#[derive(Clone, Debug, PartialEq)]
pub struct CommittedState {
  pub descriptor: Descriptor,
  pub hash: DescriptorHash,
}

/// Scheduler-side state of a single instance.
#[derive(Clone, Debug)]
pub struct InstanceRecord {
  pub object: ObjectId,
  pub status: InstanceStatus,
  pub committed: Option<CommittedState>,
  /// Distance to the nearest viewer.
  pub distance: f32,
  pub near_viewer: bool,
  /// Every update of this instance runs at `High` and skips redundancy checks.
  pub forced_update: bool,
  /// Wants its compute instance kept alive between updates.
  pub live_update: bool,
  /// Compute instance kept alive by live updates.
  pub live_compute_id: Option<ComputeId>,
  /// Resources per component from the last applied update.
  pub generated: Vec<GeneratedComponent>,
  /// Times a redundant request re-applied the committed result.
  pub reapply_count: u32,
}

impl InstanceRecord {
  pub fn new(object: ObjectId) -> Self {
    Self {
      object,
      status: InstanceStatus::NotGenerated,
      committed: None,
      distance: 0.0,
      near_viewer: false,
      forced_update: false,
      live_update: false,
      live_compute_id: None,
      generated: Vec::new(),
      reapply_count: 0,
    }
  }

  /// Committed hash, if any update has been applied.
  pub fn committed_hash(&self) -> Option<&DescriptorHash> {
    self.committed.as_ref().map(|c| &c.hash)
  }

  /// True once an update has been applied.
  pub fn is_generated(&self) -> bool {
    self.status == InstanceStatus::Generated && self.committed.is_some()
  }
}

/// Description used to register a compiled object.
#[derive(Clone, Debug)]
pub struct ObjectDesc {
  pub name: String,
  /// Components per instance.
  pub component_count: usize,
  /// LODs the model can build.
  pub lod_count: u8,
  /// Streaming source for the model's data, if any.
  pub source: Option<SourceId>,
}

/// Scheduler-side state of a compiled object.
#[derive(Clone, Debug)]
pub struct ObjectRecord {
  pub name: String,
  pub component_count: usize,
  pub lod_count: u8,
  pub source: Option<SourceId>,
  /// False until the model is usable.
  pub compiled: bool,
  /// Set while a structural edit is in progress.
  pub locked: bool,
  /// Bumped whenever the model is invalidated.
  pub model_generation: u32,
}

// =============================================================================
// Registry
// =============================================================================

struct Slot {
  generation: u32,
  record: Option<InstanceRecord>,
}

/// Owner of all object and instance records.
#[derive(Default)]
pub struct Registry {
  objects: HashMap<ObjectId, ObjectRecord>,
  next_object: u32,
  slots: Vec<Slot>,
  free: Vec<u32>,
}

impl Registry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a compiled object.
  pub fn add_object(&mut self, desc: ObjectDesc) -> ObjectId {
    let id = ObjectId(self.next_object);
    self.next_object += 1;
    self.objects.insert(
      id,
      ObjectRecord {
        name: desc.name,
        component_count: desc.component_count,
        lod_count: desc.lod_count.max(1),
        source: desc.source,
        compiled: true,
        locked: false,
        model_generation: 0,
      },
    );
    id
  }

  /// Remove an object. Its instances become invalid on their next lookup.
  pub fn remove_object(&mut self, id: ObjectId) -> Option<ObjectRecord> {
    self.objects.remove(&id)
  }

  pub fn object(&self, id: ObjectId) -> Option<&ObjectRecord> {
    self.objects.get(&id)
  }

  pub fn object_mut(&mut self, id: ObjectId) -> Option<&mut ObjectRecord> {
    self.objects.get_mut(&id)
  }

  pub fn is_object_alive(&self, id: ObjectId) -> bool {
    self.objects.contains_key(&id)
  }

  /// Insert an instance record, reusing a free slot when possible.
  pub fn insert(&mut self, record: InstanceRecord) -> InstanceHandle {
    if let Some(index) = self.free.pop() {
      let slot = &mut self.slots[index as usize];
      slot.record = Some(record);
      InstanceHandle {
        index,
        generation: slot.generation,
      }
    } else {
      let index = self.slots.len() as u32;
      self.slots.push(Slot {
        generation: 0,
        record: Some(record),
      });
      InstanceHandle {
        index,
        generation: 0,
      }
    }
  }

  /// Remove an instance, invalidating every outstanding handle to it.
  pub fn remove(&mut self, handle: InstanceHandle) -> Option<InstanceRecord> {
    let slot = self.slots.get_mut(handle.index as usize)?;
    if slot.generation != handle.generation {
      return None;
    }
    let record = slot.record.take()?;
    slot.generation = slot.generation.wrapping_add(1);
    self.free.push(handle.index);
    Some(record)
  }

  pub fn get(&self, handle: InstanceHandle) -> Option<&InstanceRecord> {
    let slot = self.slots.get(handle.index as usize)?;
    if slot.generation != handle.generation {
      return None;
    }
    slot.record.as_ref()
  }

  pub fn get_mut(&mut self, handle: InstanceHandle) -> Option<&mut InstanceRecord> {
    let slot = self.slots.get_mut(handle.index as usize)?;
    if slot.generation != handle.generation {
      return None;
    }
    slot.record.as_mut()
  }

  /// An instance is alive while its slot matches and its object exists.
  pub fn is_alive(&self, handle: InstanceHandle) -> bool {
    self
      .get(handle)
      .is_some_and(|record| self.objects.contains_key(&record.object))
  }

  /// Live instances with their handles.
  pub fn iter(&self) -> impl Iterator<Item = (InstanceHandle, &InstanceRecord)> {
    self.slots.iter().enumerate().filter_map(|(index, slot)| {
      slot.record.as_ref().map(|record| {
        (
          InstanceHandle {
            index: index as u32,
            generation: slot.generation,
          },
          record,
        )
      })
    })
  }

  /// Number of live instances.
  pub fn instance_count(&self) -> usize {
    self.slots.iter().filter(|s| s.record.is_some()).count()
  }
}
