//! Synthetic build engine backed by streamed model data.
//!
//! Every `begin_update` streams one block per component from the model's
//! source and folds it into the ids of the resources it reports, so a build
//! depends on both the parameters and the streamed data.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use instance_scheduler::{
	BlockKey, BlockLocation, BuildEngine, BuildLayout, ComponentLayout, ComputeId, Descriptor,
	EngineError, Image, ImageDesc, ImageFormat, ImageKey, ImageSlot, LodRequest, MemoryStore, Mesh,
	MeshId, ObjectId, SourceId, StreamingReader,
};

use crate::scenario::ModelConfig;

/// Block store holding `components` deterministic blocks of `block_size` bytes.
pub fn model_store(model: &ModelConfig) -> MemoryStore {
	let mut store = MemoryStore::new();
	let data: Vec<u8> = (0..model.components * model.block_size)
		.map(|i| (i.wrapping_mul(31) ^ (i >> 8)) as u8)
		.collect();
	store.add_file(0, data);
	for component in 0..model.components {
		store.add_block(
			BlockKey(component as u32),
			BlockLocation {
				file: 0,
				offset: (component * model.block_size) as u64,
				size: model.block_size,
			},
		);
	}
	store
}

/// Build engine that streams its inputs through a [`StreamingReader`].
pub struct StreamedEngine {
	reader: Arc<StreamingReader>,
	source: SourceId,
	components: usize,
	lod_count: u8,
	block_size: usize,
	image: ImageDesc,
	next_id: u32,
	/// Seed per live compute instance.
	builds: HashMap<ComputeId, u64>,
	working_memory: usize,
}

impl StreamedEngine {
	pub fn new(reader: Arc<StreamingReader>, source: SourceId, model: &ModelConfig) -> Self {
		Self {
			reader,
			source,
			components: model.components,
			lod_count: model.lod_count,
			block_size: model.block_size,
			image: ImageDesc {
				width: model.image_size,
				height: model.image_size,
				mip_count: model.image_size.trailing_zeros() + 1,
				format: ImageFormat::Rgba8,
			},
			next_id: 0,
			builds: HashMap::new(),
			working_memory: 0,
		}
	}

	fn stream_block(&self, component: usize) -> Result<Vec<u8>, EngineError> {
		let id = self
			.reader
			.begin_read(self.source, BlockKey(component as u32), self.block_size, None)
			.map_err(|e| EngineError::Failed(e.to_string()))?;
		self.reader
			.end_read(id)
			.map_err(|e| EngineError::Failed(e.to_string()))
	}

	fn seed_of(&self, id: ComputeId) -> Result<u64, EngineError> {
		self.builds
			.get(&id)
			.copied()
			.ok_or(EngineError::UnknownInstance(id.0))
	}
}

fn derive(seed: u64, component: usize, index: usize, salt: u8) -> u64 {
	let mut hasher = DefaultHasher::new();
	(seed, component, index, salt).hash(&mut hasher);
	hasher.finish()
}

impl BuildEngine for StreamedEngine {
	fn new_instance(&mut self, _object: ObjectId) -> ComputeId {
		self.next_id += 1;
		ComputeId(self.next_id)
	}

	fn begin_update(
		&mut self,
		id: ComputeId,
		descriptor: &Descriptor,
		lods: &LodRequest,
	) -> Result<BuildLayout, EngineError> {
		let params = descriptor.parameter_hash();
		let mut components = Vec::with_capacity(self.components);
		for component in 0..self.components {
			let block = self.stream_block(component)?;
			let mut hasher = DefaultHasher::new();
			(params, &block).hash(&mut hasher);
			let seed = hasher.finish();

			let first = lods.requested_lods.get(component).copied().unwrap_or(lods.min_lod);
			components.push(ComponentLayout {
				meshes: (first..self.lod_count.max(first + 1))
					.map(|lod| MeshId(derive(seed, component, lod as usize, 0)))
					.collect(),
				images: vec![ImageSlot {
					key: ImageKey(derive(seed, component, 0, 1)),
					desc: Some(self.image),
				}],
			});
		}
		self.builds.insert(id, params);

		tracing::trace!(?id, components = components.len(), "build layout ready");
		Ok(BuildLayout {
			components,
			referenced_assets: Vec::new(),
		})
	}

	fn get_mesh(&mut self, id: ComputeId, mesh: MeshId) -> Result<Mesh, EngineError> {
		let seed = self.seed_of(id)?;
		let vertex_count = 3 + (seed ^ mesh.0) as u32 % 64;
		Ok(Mesh {
			id: mesh,
			vertex_count,
			data: vec![0; vertex_count as usize * 12],
		})
	}

	fn get_image(&mut self, id: ComputeId, image: ImageKey, mips_to_skip: u32) -> Result<Image, EngineError> {
		self.seed_of(id)?;
		Ok(Image::black(image, &self.image.reduced(mips_to_skip)))
	}

	fn end_update(&mut self, _id: ComputeId) {}

	fn release_instance(&mut self, id: ComputeId) {
		self.builds.remove(&id);
	}

	fn set_working_memory(&mut self, bytes: usize) {
		self.working_memory = bytes;
		tracing::debug!(bytes, "engine working memory set");
	}

	fn clear_working_memory(&mut self) {
		tracing::trace!(budget = self.working_memory, "engine working memory cleared");
	}
}
