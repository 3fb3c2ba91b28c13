//! Test utilities for scheduler and pipeline tests.
//!
//! Provides a scripted build engine that records every call, a controllable
//! asset loader and fixture helpers.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::Receiver;

use crate::config::SchedulerConfig;
use crate::descriptor::{Descriptor, ParamValue};
use crate::engine::{AssetLoad, AssetLoader, BuildEngine, BuildLayout, ComponentLayout, ImageSlot, LodRequest};
use crate::error::EngineError;
use crate::registry::ObjectDesc;
use crate::scheduler::Scheduler;
use crate::types::{ComputeId, Image, ImageDesc, ImageFormat, ImageKey, Mesh, MeshId, ObjectId};

// =============================================================================
// Fake build engine
// =============================================================================

/// Every call the fake engine received.
#[derive(Debug, Default)]
pub struct EngineLog {
  pub new_instances: Vec<ComputeId>,
  pub begins: Vec<(ComputeId, LodRequest)>,
  pub meshes_built: Vec<MeshId>,
  pub images_built: Vec<(ImageKey, u32)>,
  pub end_updates: Vec<ComputeId>,
  pub releases: Vec<ComputeId>,
  pub clears: usize,
  pub working_memory: Option<usize>,
}

/// Scripted build engine.
///
/// Mesh ids and image keys are derived from the descriptor's parameter hash,
/// so equal parameters produce equal resources across instances.
pub struct FakeEngine {
  pub log: Arc<Mutex<EngineLog>>,
  pub components: usize,
  pub images_per_component: usize,
  pub lod_count: u8,
  pub image_desc: ImageDesc,
  /// Returned by every `begin_update`.
  pub fail_begin: Option<EngineError>,
  /// Returned by every `get_image`.
  pub fail_image: Option<EngineError>,
  /// Build images at twice the expected size.
  pub wrong_size: bool,
  /// Build images with only their first mip.
  pub short_mips: bool,
  /// Report images without a recorded size.
  pub missing_desc: bool,
  pub referenced_assets: Vec<String>,
  /// `begin_update` blocks until a message (or disconnect) arrives.
  pub gate: Option<Receiver<()>>,
  next_id: u32,
  params: HashMap<ComputeId, u64>,
}

impl FakeEngine {
  pub fn new() -> Self {
    Self {
      log: Arc::new(Mutex::new(EngineLog::default())),
      components: 1,
      images_per_component: 1,
      lod_count: 2,
      image_desc: ImageDesc {
        width: 16,
        height: 16,
        mip_count: 5,
        format: ImageFormat::Rgba8,
      },
      fail_begin: None,
      fail_image: None,
      wrong_size: false,
      short_mips: false,
      missing_desc: false,
      referenced_assets: Vec::new(),
      gate: None,
      next_id: 1,
      params: HashMap::new(),
    }
  }

  /// Shared handle to the call log, usable after the engine moved into a scheduler.
  pub fn log(&self) -> Arc<Mutex<EngineLog>> {
    Arc::clone(&self.log)
  }

  fn derive(params: u64, a: usize, b: usize, salt: u8) -> u64 {
    let mut hasher = DefaultHasher::new();
    (params, a, b, salt).hash(&mut hasher);
    hasher.finish()
  }
}

impl Default for FakeEngine {
  fn default() -> Self {
    Self::new()
  }
}

impl BuildEngine for FakeEngine {
  fn new_instance(&mut self, _object: ObjectId) -> ComputeId {
    let id = ComputeId(self.next_id);
    self.next_id += 1;
    self.log.lock().unwrap().new_instances.push(id);
    id
  }

  fn begin_update(
    &mut self,
    id: ComputeId,
    descriptor: &Descriptor,
    lods: &LodRequest,
  ) -> Result<BuildLayout, EngineError> {
    if let Some(gate) = &self.gate {
      let _ = gate.recv_timeout(Duration::from_secs(5));
    }
    self.log.lock().unwrap().begins.push((id, lods.clone()));
    if let Some(err) = &self.fail_begin {
      return Err(err.clone());
    }

    let params = descriptor.parameter_hash();
    self.params.insert(id, params);

    let components = (0..self.components)
      .map(|c| {
        let first = lods.requested_lods.get(c).copied().unwrap_or(lods.min_lod);
        ComponentLayout {
          meshes: (first..self.lod_count.max(first + 1))
            .map(|lod| MeshId(Self::derive(params, c, lod as usize, 0)))
            .collect(),
          images: (0..self.images_per_component)
            .map(|i| ImageSlot {
              key: ImageKey(Self::derive(params, c, i, 1)),
              desc: (!self.missing_desc).then_some(self.image_desc),
            })
            .collect(),
        }
      })
      .collect();

    Ok(BuildLayout {
      components,
      referenced_assets: self.referenced_assets.clone(),
    })
  }

  fn get_mesh(&mut self, id: ComputeId, mesh: MeshId) -> Result<Mesh, EngineError> {
    if !self.params.contains_key(&id) {
      return Err(EngineError::UnknownInstance(id.0));
    }
    self.log.lock().unwrap().meshes_built.push(mesh);
    Ok(Mesh {
      id: mesh,
      vertex_count: 3,
      data: vec![0; 36],
    })
  }

  fn get_image(&mut self, id: ComputeId, image: ImageKey, mips_to_skip: u32) -> Result<Image, EngineError> {
    if !self.params.contains_key(&id) {
      return Err(EngineError::UnknownInstance(id.0));
    }
    if let Some(err) = &self.fail_image {
      return Err(err.clone());
    }
    self.log.lock().unwrap().images_built.push((image, mips_to_skip));

    let mut desc = self.image_desc.reduced(mips_to_skip);
    if self.wrong_size {
      desc.width *= 2;
      desc.height *= 2;
    }
    let mut built = Image::black(image, &desc);
    if self.short_mips {
      built.mips.truncate(1);
    }
    Ok(built)
  }

  fn end_update(&mut self, id: ComputeId) {
    self.log.lock().unwrap().end_updates.push(id);
  }

  fn release_instance(&mut self, id: ComputeId) {
    self.params.remove(&id);
    self.log.lock().unwrap().releases.push(id);
  }

  fn set_working_memory(&mut self, bytes: usize) {
    self.log.lock().unwrap().working_memory = Some(bytes);
  }

  fn clear_working_memory(&mut self) {
    self.log.lock().unwrap().clears += 1;
  }
}

// =============================================================================
// Fake asset loader
// =============================================================================

/// Asset loader whose loads complete when the test says so.
#[derive(Clone, Default)]
pub struct FakeLoader {
  pub complete: Arc<AtomicBool>,
  pub loads: Arc<AtomicUsize>,
  pub cancels: Arc<AtomicUsize>,
}

impl FakeLoader {
  /// Loader whose loads are already complete.
  pub fn immediate() -> Self {
    let loader = Self::default();
    loader.complete.store(true, Ordering::SeqCst);
    loader
  }
}

struct FakeLoad {
  complete: Arc<AtomicBool>,
  cancels: Arc<AtomicUsize>,
}

impl AssetLoad for FakeLoad {
  fn is_complete(&self) -> bool {
    self.complete.load(Ordering::SeqCst)
  }

  fn cancel(&mut self) {
    self.cancels.fetch_add(1, Ordering::SeqCst);
  }
}

impl AssetLoader for FakeLoader {
  fn load(&mut self, _paths: &[String]) -> Box<dyn AssetLoad> {
    self.loads.fetch_add(1, Ordering::SeqCst);
    Box::new(FakeLoad {
      complete: Arc::clone(&self.complete),
      cancels: Arc::clone(&self.cancels),
    })
  }
}

// =============================================================================
// Fixtures
// =============================================================================

pub fn object_desc(components: usize, lod_count: u8) -> ObjectDesc {
  ObjectDesc {
    name: "character".into(),
    component_count: components,
    lod_count,
    source: None,
  }
}

pub fn descriptor(color: f32) -> Descriptor {
  Descriptor::new()
    .with("color", ParamValue::Color([color, 0.0, 0.0, 1.0]))
    .with("height", ParamValue::Float(1.8))
}

/// Scheduler over `engine` with an immediate asset loader and one object.
pub fn scheduler_with(config: SchedulerConfig, engine: FakeEngine) -> (Scheduler, ObjectId) {
  let components = engine.components;
  let lod_count = engine.lod_count;
  let mut scheduler =
    Scheduler::new(config, Box::new(engine), Box::new(FakeLoader::immediate())).unwrap();
  let object = scheduler.register_object(object_desc(components, lod_count));
  (scheduler, object)
}

/// Tick until idle, panicking if work is left after five seconds.
pub fn drain(scheduler: &mut Scheduler) {
  assert!(
    scheduler.block_till_all_requests_finished(Duration::from_secs(5)),
    "scheduler did not drain"
  );
}
