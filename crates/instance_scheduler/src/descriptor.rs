//! Parameter snapshots and their comparison fingerprint.
//!
//! A [`Descriptor`] is the captured set of parameter values that drives a
//! build. A [`DescriptorHash`] combines the parameter fingerprint with the
//! LODs being requested, which is what redundancy checks compare.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use smallvec::SmallVec;

/// Per-component requested LODs.
pub type LodVec = SmallVec<[u8; 4]>;

/// A single parameter value.
#[derive(Clone, Debug, PartialEq)]
pub enum ParamValue {
  Bool(bool),
  Int(i32),
  Float(f32),
  Text(String),
  Color([f32; 4]),
}

impl Hash for ParamValue {
  fn hash<H: Hasher>(&self, state: &mut H) {
    std::mem::discriminant(self).hash(state);
    match self {
      ParamValue::Bool(v) => v.hash(state),
      ParamValue::Int(v) => v.hash(state),
      ParamValue::Float(v) => v.to_bits().hash(state),
      ParamValue::Text(v) => v.hash(state),
      ParamValue::Color(c) => c.iter().for_each(|v| v.to_bits().hash(state)),
    }
  }
}

/// Captured parameter snapshot.
///
/// Stored sorted by name so that insertion order never changes the hash.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Descriptor {
  params: BTreeMap<String, ParamValue>,
}

impl Descriptor {
  pub fn new() -> Self {
    Self::default()
  }

  /// Builder-style parameter setter.
  pub fn with(mut self, name: impl Into<String>, value: ParamValue) -> Self {
    self.set(name, value);
    self
  }

  pub fn set(&mut self, name: impl Into<String>, value: ParamValue) {
    self.params.insert(name.into(), value);
  }

  pub fn get(&self, name: &str) -> Option<&ParamValue> {
    self.params.get(name)
  }

  pub fn len(&self) -> usize {
    self.params.len()
  }

  pub fn is_empty(&self) -> bool {
    self.params.is_empty()
  }

  /// Fingerprint of the parameter values alone.
  pub fn parameter_hash(&self) -> u64 {
    let mut hasher = DefaultHasher::new();
    for (name, value) in &self.params {
      name.hash(&mut hasher);
      value.hash(&mut hasher);
    }
    hasher.finish()
  }

  /// Full hash for a build of this snapshot at the given LODs.
  pub fn hash_with(&self, min_lod: u8, requested_lods: &[u8]) -> DescriptorHash {
    DescriptorHash {
      parameters: self.parameter_hash(),
      min_lod,
      requested_lods: LodVec::from_slice(requested_lods),
    }
  }
}

/// Comparison fingerprint of a descriptor plus the LODs it was built at.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorHash {
  pub parameters: u64,
  /// Finest LOD kept resident.
  pub min_lod: u8,
  /// Finest LOD requested per component.
  pub requested_lods: LodVec,
}

impl DescriptorHash {
  /// True if everything `self` would produce is already produced by `other`.
  ///
  /// Parameters must match exactly. LODs are ordinals where 0 is the finest,
  /// so `self` is covered when it asks for equal or coarser LODs everywhere.
  pub fn is_subset(&self, other: &DescriptorHash) -> bool {
    self.parameters == other.parameters
      && self.min_lod >= other.min_lod
      && self.requested_lods.len() == other.requested_lods.len()
      && self
        .requested_lods
        .iter()
        .zip(other.requested_lods.iter())
        .all(|(mine, theirs)| mine >= theirs)
  }

  /// Same parameters, different LODs.
  pub fn with_lods(&self, min_lod: u8, requested_lods: &[u8]) -> DescriptorHash {
    DescriptorHash {
      parameters: self.parameters,
      min_lod,
      requested_lods: LodVec::from_slice(requested_lods),
    }
  }
}

#[cfg(test)]
#[path = "descriptor_test.rs"]
mod descriptor_test;
