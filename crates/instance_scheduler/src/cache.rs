//! Resource cache for generated meshes and images.
//!
//! Deduplicates generation across instances and across updates of one
//! instance. Entries are weak: the cache never keeps a resource alive on its
//! own except through
//!
//! - the protected set, holding strong references for the current update;
//! - a bounded ring of recently generated resources.
//!
//! Image texture references are counted per key so that discards and
//! re-applies can tell when an image is no longer used by any instance.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use crate::types::{Image, ImageKey, Mesh, MeshId, ObjectId};

#[derive(Default)]
struct ObjectCache {
  meshes: HashMap<MeshId, Weak<Mesh>>,
  images: HashMap<ImageKey, Weak<Image>>,
}

enum Retained {
  Mesh(#[allow(dead_code)] Arc<Mesh>),
  Image(#[allow(dead_code)] Arc<Image>),
}

/// Outcome of a [`ResourceCache::sweep`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
  /// Per-object caches dropped because the object is gone.
  pub objects_dropped: usize,
  /// Stale entries dropped.
  pub entries_dropped: usize,
}

/// Mesh and image cache, shared behind a single lock.
pub struct ResourceCache {
  objects: HashMap<ObjectId, ObjectCache>,
  texture_refs: HashMap<ImageKey, u32>,
  protected: HashMap<ImageKey, Arc<Image>>,
  recent: VecDeque<Retained>,
  capacity: usize,
}

impl ResourceCache {
  /// Cache keeping up to `capacity` recent resources alive.
  pub fn new(capacity: usize) -> Self {
    Self {
      objects: HashMap::new(),
      texture_refs: HashMap::new(),
      protected: HashMap::new(),
      recent: VecDeque::with_capacity(capacity),
      capacity: capacity.max(1),
    }
  }

  // ---------------------------------------------------------------------------
  // Lookup / store
  // ---------------------------------------------------------------------------

  pub fn cached_mesh(&self, object: ObjectId, id: MeshId) -> Option<Arc<Mesh>> {
    self.objects.get(&object)?.meshes.get(&id)?.upgrade()
  }

  pub fn cache_mesh(&mut self, object: ObjectId, mesh: &Arc<Mesh>) {
    self
      .objects
      .entry(object)
      .or_default()
      .meshes
      .insert(mesh.id, Arc::downgrade(mesh));
    self.retain(Retained::Mesh(Arc::clone(mesh)));
  }

  pub fn cached_image(&self, object: ObjectId, key: ImageKey) -> Option<Arc<Image>> {
    if let Some(image) = self.protected.get(&key) {
      return Some(Arc::clone(image));
    }
    self.objects.get(&object)?.images.get(&key)?.upgrade()
  }

  pub fn cache_image(&mut self, object: ObjectId, image: &Arc<Image>) {
    self
      .objects
      .entry(object)
      .or_default()
      .images
      .insert(image.key, Arc::downgrade(image));
    self.retain(Retained::Image(Arc::clone(image)));
  }

  fn retain(&mut self, resource: Retained) {
    if self.recent.len() >= self.capacity {
      self.recent.pop_front();
    }
    self.recent.push_back(resource);
  }

  /// Number of cached entries (live or stale) across all objects.
  pub fn entry_count(&self) -> usize {
    self
      .objects
      .values()
      .map(|c| c.meshes.len() + c.images.len())
      .sum()
  }

  // ---------------------------------------------------------------------------
  // Texture references
  // ---------------------------------------------------------------------------

  pub fn add_texture_reference(&mut self, key: ImageKey) {
    *self.texture_refs.entry(key).or_insert(0) += 1;
  }

  /// Drop one reference. Returns true when the image became unreferenced.
  ///
  /// Removing from a missing or zero count is a defect: it is logged, the
  /// entry is cleared and `false` is returned.
  pub fn remove_texture_reference(&mut self, key: ImageKey) -> bool {
    match self.texture_refs.get_mut(&key) {
      Some(count) if *count > 0 => {
        *count -= 1;
        if *count == 0 {
          self.texture_refs.remove(&key);
          true
        } else {
          false
        }
      }
      _ => {
        tracing::error!(?key, "texture reference removed below zero");
        self.texture_refs.remove(&key);
        false
      }
    }
  }

  pub fn texture_reference_count(&self, key: ImageKey) -> u32 {
    self.texture_refs.get(&key).copied().unwrap_or(0)
  }

  // ---------------------------------------------------------------------------
  // Protection
  // ---------------------------------------------------------------------------

  /// Protect every live, referenced image cached for `object`.
  ///
  /// Returns the number of images protected.
  pub fn protect_referenced(&mut self, object: ObjectId) -> usize {
    let Some(cache) = self.objects.get(&object) else {
      return 0;
    };
    let mut protected = 0;
    for (key, weak) in &cache.images {
      if !self.texture_refs.contains_key(key) {
        continue;
      }
      if let Some(image) = weak.upgrade() {
        self.protected.insert(*key, image);
        protected += 1;
      }
    }
    protected
  }

  pub fn protected_count(&self) -> usize {
    self.protected.len()
  }

  pub fn unprotect_all(&mut self) {
    self.protected.clear();
  }

  // ---------------------------------------------------------------------------
  // Cleanup
  // ---------------------------------------------------------------------------

  /// Drop caches of dead objects and, when `cleanup` is set, stale entries.
  ///
  /// Protected or referenced images are never dropped.
  pub fn sweep(&mut self, is_object_alive: impl Fn(ObjectId) -> bool, cleanup: bool) -> SweepStats {
    let mut stats = SweepStats::default();

    let before = self.objects.len();
    self.objects.retain(|object, _| is_object_alive(*object));
    stats.objects_dropped = before - self.objects.len();

    if cleanup {
      let texture_refs = &self.texture_refs;
      let protected = &self.protected;
      for cache in self.objects.values_mut() {
        let before = cache.meshes.len() + cache.images.len();
        cache.meshes.retain(|_, weak| weak.strong_count() > 0);
        cache.images.retain(|key, weak| {
          weak.strong_count() > 0 || texture_refs.contains_key(key) || protected.contains_key(key)
        });
        stats.entries_dropped += before - cache.meshes.len() - cache.images.len();
      }
      self
        .objects
        .retain(|_, cache| !cache.meshes.is_empty() || !cache.images.is_empty());
    }

    stats
  }

  /// Forget everything cached for `object`.
  pub fn clear_object(&mut self, object: ObjectId) {
    self.objects.remove(&object);
  }
}

impl Default for ResourceCache {
  fn default() -> Self {
    Self::new(512)
  }
}

#[cfg(test)]
#[path = "cache_test.rs"]
mod cache_test;
