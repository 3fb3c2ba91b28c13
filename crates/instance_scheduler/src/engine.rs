//! Contracts for the external collaborators the pipeline drives.
//!
//! The build engine synthesizes meshes and images from a compiled model. It is
//! not reentrant: the scheduler only ever calls it from the single compute
//! worker, so implementations take `&mut self` and need no locking.

use crate::descriptor::{Descriptor, LodVec};
use crate::error::EngineError;
use crate::types::{ComputeId, Image, ImageDesc, ImageKey, Mesh, MeshId, ObjectId};

/// LODs an update should produce.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LodRequest {
  /// Finest LOD kept resident.
  pub min_lod: u8,
  /// Finest LOD requested per component.
  pub requested_lods: LodVec,
}

impl LodRequest {
  pub fn uniform(lod: u8, components: usize) -> Self {
    Self {
      min_lod: lod,
      requested_lods: std::iter::repeat(lod).take(components).collect(),
    }
  }
}

/// An image referenced by the build, with its recorded size if known.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageSlot {
  pub key: ImageKey,
  /// `None` when the model holds no usable size/format for the image.
  pub desc: Option<ImageDesc>,
}

/// What the engine will produce for one component.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ComponentLayout {
  /// One mesh per LOD, finest first.
  pub meshes: Vec<MeshId>,
  pub images: Vec<ImageSlot>,
}

/// Everything an update will produce, known after `begin_update`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BuildLayout {
  pub components: Vec<ComponentLayout>,
  /// External platform assets the generated resources reference.
  pub referenced_assets: Vec<String>,
}

impl BuildLayout {
  /// Every mesh id in the layout, in component order.
  pub fn mesh_ids(&self) -> impl Iterator<Item = MeshId> + '_ {
    self.components.iter().flat_map(|c| c.meshes.iter().copied())
  }

  /// Every image slot in the layout, in component order.
  pub fn image_slots(&self) -> impl Iterator<Item = &ImageSlot> + '_ {
    self.components.iter().flat_map(|c| c.images.iter())
  }
}

/// The non-reentrant compute engine.
pub trait BuildEngine: Send {
  /// Create a compute-side instance of `object`.
  fn new_instance(&mut self, object: ObjectId) -> ComputeId;

  /// Start an update and report what it will produce.
  fn begin_update(
    &mut self,
    id: ComputeId,
    descriptor: &Descriptor,
    lods: &LodRequest,
  ) -> Result<BuildLayout, EngineError>;

  fn get_mesh(&mut self, id: ComputeId, mesh: MeshId) -> Result<Mesh, EngineError>;

  /// Build an image, skipping its first `mips_to_skip` levels.
  fn get_image(
    &mut self,
    id: ComputeId,
    image: ImageKey,
    mips_to_skip: u32,
  ) -> Result<Image, EngineError>;

  fn end_update(&mut self, id: ComputeId);

  fn release_instance(&mut self, id: ComputeId);

  /// Working memory budget in bytes.
  fn set_working_memory(&mut self, _bytes: usize) {}

  /// Free cached intermediate data.
  fn clear_working_memory(&mut self) {}
}

/// Materializes external platform assets referenced by a build.
pub trait AssetLoader: Send {
  fn load(&mut self, paths: &[String]) -> Box<dyn AssetLoad>;
}

/// An in-flight asset batch.
pub trait AssetLoad: Send {
  fn is_complete(&self) -> bool;
  /// Abandon the load. Safe to call after completion.
  fn cancel(&mut self);
}

/// Loader for builds that never reference external assets.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoAssets;

struct Loaded;

impl AssetLoad for Loaded {
  fn is_complete(&self) -> bool {
    true
  }

  fn cancel(&mut self) {}
}

impl AssetLoader for NoAssets {
  fn load(&mut self, _paths: &[String]) -> Box<dyn AssetLoad> {
    Box::new(Loaded)
  }
}
