//! Core value types shared by the scheduler, pipeline and cache.

use std::sync::Arc;

/// Scheduling priority of an update.
///
/// Ordered `Low < MedLow < Med < High`; the scheduler always picks the
/// highest priority first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
  #[default]
  Low,
  MedLow,
  Med,
  High,
}

/// Terminal outcome of an update.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UpdateResult {
  /// Applied.
  Success,
  /// Applied, but with recoverable sub-resource problems (placeholders).
  Warning,
  /// Generic failure: missing target, locked object, disabled subsystem.
  Error,
  /// Superseded by a newer request for the same instance.
  ErrorReplaced,
  /// Instance fell out of relevance before the build completed.
  ErrorDiscarded,
  /// Work was provably unnecessary.
  ErrorOptimized,
  /// Platform cannot use 16 bit bone indices.
  Error16BitBoneIndex,
}

impl UpdateResult {
  /// All result kinds, in declaration order.
  pub const ALL: [UpdateResult; 7] = [
    UpdateResult::Success,
    UpdateResult::Warning,
    UpdateResult::Error,
    UpdateResult::ErrorReplaced,
    UpdateResult::ErrorDiscarded,
    UpdateResult::ErrorOptimized,
    UpdateResult::Error16BitBoneIndex,
  ];

  /// True for results that are applied to the instance.
  #[inline]
  pub fn is_valid(self) -> bool {
    matches!(self, UpdateResult::Success | UpdateResult::Warning)
  }

  /// True for results that put the instance in an error state.
  #[inline]
  pub fn is_error(self) -> bool {
    matches!(self, UpdateResult::Error | UpdateResult::Error16BitBoneIndex)
  }

  /// Fold a sub-result into a running result.
  ///
  /// Once an update has failed it stays failed; a warning only downgrades
  /// a success.
  pub fn degrade(self, other: UpdateResult) -> UpdateResult {
    match (self, other) {
      (current, _) if !current.is_valid() => current,
      (_, UpdateResult::Success) => self,
      (UpdateResult::Success, UpdateResult::Warning) => UpdateResult::Warning,
      (_, UpdateResult::Warning) => self,
      (_, failure) => failure,
    }
  }

  /// Index into per-result counters.
  pub(crate) fn index(self) -> usize {
    self as usize
  }
}

/// Admission decision for a submitted request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdmissionDecision {
  /// Nothing was queued.
  NoUpdate,
  /// An update was queued (or folded into an equivalent one).
  Update,
  /// The instance is no longer relevant; its resources will be released.
  Discard,
}

/// Generation state of an instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InstanceStatus {
  #[default]
  NotGenerated,
  Generated,
  Error,
}

/// Identifier of a compiled customizable object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u32);

/// Build engine side instance identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ComputeId(pub u32);

/// Identifier of a generated mesh. Equal ids mean identical meshes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshId(pub u64);

/// Identifier of a generated image. Equal keys mean identical images.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageKey(pub u64);

/// Pixel layout of generated images.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ImageFormat {
  #[default]
  Rgba8,
  R8,
}

impl ImageFormat {
  /// Bytes per texel.
  #[inline]
  pub fn bytes_per_pixel(self) -> usize {
    match self {
      ImageFormat::Rgba8 => 4,
      ImageFormat::R8 => 1,
    }
  }
}

/// Expected size and format of an image, as recorded by the build layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageDesc {
  pub width: u32,
  pub height: u32,
  pub mip_count: u32,
  pub format: ImageFormat,
}

impl ImageDesc {
  /// Longest mip chain the size allows, down to a 1x1 level.
  pub fn max_mip_count(&self) -> u32 {
    u32::BITS - self.width.max(self.height).leading_zeros()
  }

  /// Non-empty size with a mip chain the size can actually hold.
  pub fn is_well_formed(&self) -> bool {
    self.width > 0 && self.height > 0 && (1..=self.max_mip_count()).contains(&self.mip_count)
  }

  /// Size after dropping the first `mips` levels.
  pub fn reduced(&self, mips: u32) -> ImageDesc {
    let mips = mips.min(self.mip_count.saturating_sub(1));
    ImageDesc {
      width: mip_extent(self.width, mips),
      height: mip_extent(self.height, mips),
      mip_count: self.mip_count - mips,
      format: self.format,
    }
  }
}

/// A generated mesh.
#[derive(Clone, Debug, PartialEq)]
pub struct Mesh {
  pub id: MeshId,
  pub vertex_count: u32,
  pub data: Vec<u8>,
}

/// A generated image with its full mip chain.
#[derive(Clone, PartialEq)]
pub struct Image {
  pub key: ImageKey,
  pub width: u32,
  pub height: u32,
  pub format: ImageFormat,
  /// Mip levels, largest first.
  pub mips: Vec<Vec<u8>>,
}

impl Image {
  /// All-black image matching `desc`, with a complete mip chain.
  pub fn black(key: ImageKey, desc: &ImageDesc) -> Self {
    let mips = (0..desc.mip_count.max(1))
      .map(|level| black_level(desc.width, desc.height, level, desc.format))
      .collect();
    Self {
      key,
      width: desc.width,
      height: desc.height,
      format: desc.format,
      mips,
    }
  }

  /// Number of mip levels present.
  #[inline]
  pub fn mip_count(&self) -> u32 {
    self.mips.len() as u32
  }
}

impl std::fmt::Debug for Image {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Image")
      .field("key", &self.key)
      .field("width", &self.width)
      .field("height", &self.height)
      .field("format", &self.format)
      .field("mips", &self.mips.len())
      .finish()
  }
}

/// Zeroed texel data for one mip level.
pub(crate) fn black_level(width: u32, height: u32, level: u32, format: ImageFormat) -> Vec<u8> {
  let w = mip_extent(width, level) as usize;
  let h = mip_extent(height, level) as usize;
  vec![0; w * h * format.bytes_per_pixel()]
}

/// Edge length of mip `level`, clamped to 1 past the end of the chain.
#[inline]
pub(crate) fn mip_extent(size: u32, level: u32) -> u32 {
  size.checked_shr(level).unwrap_or(0).max(1)
}

/// Resources produced for one component of an instance.
#[derive(Clone, Debug, Default)]
pub struct GeneratedComponent {
  /// Meshes per generated LOD, finest first.
  pub meshes: Vec<Arc<Mesh>>,
  /// Images used by the component's surfaces.
  pub images: Vec<Arc<Image>>,
}

#[cfg(test)]
#[path = "types_test.rs"]
mod types_test;
