//! Stage bodies. Each returns the next stage or asks to wait on compute.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use web_time::Instant;

use super::images::{self, ImageFix, PLACEHOLDER_DESC};
use super::{CurrentOperation, StageEnv, Step, UpdateStage};
use crate::context::{ImageRequest, Staging, UpdateContext, UpdateOutcome};
use crate::engine::BuildLayout;
use crate::error::EngineError;
use crate::registry::CommittedState;
use crate::threading::{lock, ComputeQueue, TaskId};
use crate::types::{
	ComputeId, GeneratedComponent, Image, ImageKey, InstanceStatus, Mesh, UpdateResult,
};

type BeginOutput = (ComputeId, Result<BuildLayout, EngineError>);
type MeshOutput = Result<Vec<Mesh>, EngineError>;
type ImageOutput = Vec<(ImageRequest, Result<Image, EngineError>)>;

enum Polled<T> {
	Ready(T),
	Pending,
	Lost,
}

fn poll_task<T: 'static>(compute: &ComputeQueue, task: TaskId) -> Polled<T> {
	match compute.poll::<T>(task) {
		Some(output) => Polled::Ready(output),
		None if compute.is_pending(task) => Polled::Pending,
		None => Polled::Lost,
	}
}

fn result_for(err: &EngineError) -> UpdateResult {
	match err {
		EngineError::Unsupported16BitBoneIndex => UpdateResult::Error16BitBoneIndex,
		_ => UpdateResult::Error,
	}
}

/// Coerce the result if the update was superseded or its target died.
fn cancelled(ctx: &mut UpdateContext, env: &StageEnv<'_>) -> bool {
	if ctx.superseded {
		ctx.result = ctx.result.degrade(UpdateResult::ErrorReplaced);
		true
	} else if !env.registry.is_alive(ctx.instance) {
		ctx.result = ctx.result.degrade(UpdateResult::Error);
		true
	} else {
		false
	}
}

// =============================================================================
// Start
// =============================================================================

pub(super) fn start(op: &mut CurrentOperation, env: &mut StageEnv<'_>) -> Step {
	let ctx = &mut op.ctx;
	ctx.started_at = Some(Instant::now());

	if ctx.superseded {
		ctx.result = UpdateResult::ErrorReplaced;
		return Step::Next(UpdateStage::Callbacks);
	}

	let Some(record) = env.registry.get(ctx.instance).filter(|_| env.registry.is_alive(ctx.instance)) else {
		tracing::debug!(instance = ctx.instance.index(), "update target is gone");
		ctx.result = UpdateResult::Error;
		return Step::Next(UpdateStage::Callbacks);
	};

	let usable = env
		.registry
		.object(record.object)
		.is_some_and(|object| object.compiled && !object.locked);
	if !usable {
		tracing::debug!(instance = ctx.instance.index(), "object locked or not compiled");
		ctx.result = UpdateResult::Error;
		return Step::Next(UpdateStage::Callbacks);
	}

	let satisfied = !ctx.forced
		&& record.is_generated()
		&& record.committed_hash().is_some_and(|committed| ctx.hash.is_subset(committed));
	if satisfied {
		ctx.short_circuited = true;
		ctx.result = UpdateResult::Success;
		return Step::Next(UpdateStage::Callbacks);
	}

	ctx.live_mode = env.config.live_update_enabled && record.live_update;
	let reuse = if ctx.live_mode { record.live_compute_id } else { None };

	if !ctx.live_mode {
		if let Some(old) = env.registry.get_mut(ctx.instance).and_then(|r| r.live_compute_id.take()) {
			tracing::debug!(instance = ctx.instance.index(), ?old, "live mode dropped");
			env.queue.add_release(old);
		}
	}

	if !env.config.only_generate_requested_lods {
		let mut lods = ctx.lods.clone();
		lods.requested_lods.iter_mut().for_each(|lod| *lod = 0);
		ctx.set_lods(lods);
	}

	let object = ctx.object;
	let descriptor = ctx.descriptor.clone();
	let lods = ctx.lods.clone();
	let task = env.compute.submit(move |engine| -> BeginOutput {
		let id = reuse.unwrap_or_else(|| engine.new_instance(object));
		(id, engine.begin_update(id, &descriptor, &lods))
	});
	Step::Next(UpdateStage::AwaitBegin(task))
}

pub(super) fn await_begin(op: &mut CurrentOperation, env: &mut StageEnv<'_>, task: TaskId) -> Step {
	let (id, layout) = match poll_task::<BeginOutput>(env.compute, task) {
		Polled::Ready(output) => output,
		Polled::Pending => return Step::Wait,
		Polled::Lost => {
			op.ctx.result = UpdateResult::Error;
			return Step::Next(UpdateStage::Callbacks);
		}
	};

	let ctx = &mut op.ctx;
	ctx.compute_id = Some(id);
	match layout {
		Ok(layout) => ctx.staging.layout = Some(layout),
		Err(err) => {
			tracing::warn!(instance = ctx.instance.index(), %err, "begin_update failed");
			ctx.result = ctx.result.degrade(result_for(&err));
			return Step::Next(UpdateStage::ConvertResources);
		}
	}

	if cancelled(ctx, env) {
		return Step::Next(UpdateStage::ConvertResources);
	}
	Step::Next(UpdateStage::LockMeshCache)
}

// =============================================================================
// Meshes
// =============================================================================

pub(super) fn lock_mesh_cache(op: &mut CurrentOperation, env: &mut StageEnv<'_>) -> Step {
	let ctx = &mut op.ctx;
	let object = ctx.object;
	let use_cache = env.config.mesh_cache_enabled && !ctx.live_mode;
	let Staging {
		layout,
		meshes,
		requested_meshes,
		..
	} = &mut ctx.staging;
	let Some(layout) = layout.as_ref() else {
		ctx.result = UpdateResult::Error;
		return Step::Next(UpdateStage::ConvertResources);
	};

	{
		let cache = use_cache.then(|| lock(env.cache));
		let mut seen = HashSet::new();
		for mesh_id in layout.mesh_ids() {
			if !seen.insert(mesh_id) {
				continue;
			}
			match cache.as_ref().and_then(|c| c.cached_mesh(object, mesh_id)) {
				Some(mesh) => {
					meshes.insert(mesh_id, mesh);
				}
				None => requested_meshes.push(mesh_id),
			}
		}
	}

	tracing::debug!(cached = meshes.len(), requested = requested_meshes.len(), "mesh cache resolved");
	if requested_meshes.is_empty() {
		return Step::Next(UpdateStage::LockCache);
	}

	let Some(id) = ctx.compute_id else {
		ctx.result = UpdateResult::Error;
		return Step::Next(UpdateStage::Callbacks);
	};
	let ids = requested_meshes.clone();
	let task = env.compute.submit(move |engine| -> MeshOutput {
		ids.into_iter().map(|mesh| engine.get_mesh(id, mesh)).collect()
	});
	Step::Next(UpdateStage::AwaitMeshes(task))
}

pub(super) fn await_meshes(op: &mut CurrentOperation, env: &mut StageEnv<'_>, task: TaskId) -> Step {
	let ctx = &mut op.ctx;
	match poll_task::<MeshOutput>(env.compute, task) {
		Polled::Pending => return Step::Wait,
		Polled::Lost => ctx.result = UpdateResult::Error,
		Polled::Ready(Ok(built)) => {
			for mesh in built {
				ctx.staging.meshes.insert(mesh.id, Arc::new(mesh));
			}
		}
		Polled::Ready(Err(err)) => {
			tracing::warn!(instance = ctx.instance.index(), %err, "mesh build failed");
			ctx.result = ctx.result.degrade(result_for(&err));
		}
	}

	if !ctx.result.is_valid() || cancelled(ctx, env) {
		return Step::Next(UpdateStage::ConvertResources);
	}
	Step::Next(UpdateStage::LockCache)
}

// =============================================================================
// Images + assets
// =============================================================================

pub(super) fn lock_cache(op: &mut CurrentOperation, env: &mut StageEnv<'_>) -> Step {
	let ctx = &mut op.ctx;
	let object = ctx.object;

	// Images this instance already holds from its last update
	let own: HashMap<ImageKey, Arc<Image>> = env
		.registry
		.get(ctx.instance)
		.map(|record| {
			record
				.generated
				.iter()
				.flat_map(|c| c.images.iter())
				.map(|image| (image.key, Arc::clone(image)))
				.collect()
		})
		.unwrap_or_default();

	let Staging {
		layout,
		images,
		requested_images,
		placeholder_images,
		..
	} = &mut ctx.staging;
	let Some(layout) = layout.as_ref() else {
		ctx.result = UpdateResult::Error;
		return Step::Next(UpdateStage::ConvertResources);
	};

	{
		let mut cache = lock(env.cache);
		if cache.protected_count() != 0 {
			tracing::error!(count = cache.protected_count(), "protected image set not empty at lock");
			cache.unprotect_all();
		}
		let reuse = env.config.reuse_images_between_instances;
		if reuse {
			cache.protect_referenced(object);
		}
		op.protected = true;

		let mut seen = HashSet::new();
		for slot in layout.image_slots() {
			if !seen.insert(slot.key) {
				continue;
			}
			// Unreferenced images still alive in the recent ring count as hits too
			let shared = || reuse.then(|| cache.cached_image(object, slot.key)).flatten();
			if let Some(image) = own.get(&slot.key).cloned().or_else(shared) {
				images.insert(slot.key, image);
				continue;
			}
			match slot.desc {
				Some(desc) if desc.is_well_formed() => requested_images.push(ImageRequest {
					slot: *slot,
					mips_to_skip: images::mips_to_skip(&desc, env.config.max_texture_size),
				}),
				desc => {
					tracing::warn!(key = slot.key.0, ?desc, "image size is missing or malformed; using a placeholder");
					placeholder_images.push(slot.key);
				}
			}
		}
	}

	tracing::debug!(reused = images.len(), requested = requested_images.len(), "image cache resolved");

	if !layout.referenced_assets.is_empty() {
		op.asset_load = Some(env.loader.load(&layout.referenced_assets));
	}

	if requested_images.is_empty() {
		return Step::Next(UpdateStage::AwaitImagesAndAssets(None));
	}
	let Some(id) = ctx.compute_id else {
		ctx.result = UpdateResult::Error;
		return Step::Next(UpdateStage::ConvertResources);
	};
	let requests = requested_images.clone();
	let task = env.compute.submit(move |engine| -> ImageOutput {
		requests
			.into_iter()
			.map(|request| {
				let image = engine.get_image(id, request.slot.key, request.mips_to_skip);
				(request, image)
			})
			.collect()
	});
	Step::Next(UpdateStage::AwaitImagesAndAssets(Some(task)))
}

pub(super) fn await_images_and_assets(
	op: &mut CurrentOperation,
	env: &mut StageEnv<'_>,
	task: Option<TaskId>,
) -> Step {
	if let Some(task) = task {
		let ctx = &mut op.ctx;
		match poll_task::<ImageOutput>(env.compute, task) {
			Polled::Pending => return Step::Wait,
			Polled::Lost => {
				ctx.result = UpdateResult::Error;
				return Step::Next(UpdateStage::ConvertResources);
			}
			Polled::Ready(output) => {
				for (request, image) in output {
					match image {
						Ok(image) => ctx.staging.built_images.push((request, image)),
						Err(EngineError::Unsupported16BitBoneIndex) => {
							ctx.result = ctx.result.degrade(UpdateResult::Error16BitBoneIndex);
						}
						Err(err) => {
							// One bad image never fails the update
							tracing::warn!(key = request.slot.key.0, %err, "image build failed");
							let expected = images::expected_desc(&request);
							let placeholder = images::placeholder(request.slot.key, &expected);
							ctx.staging.images.insert(request.slot.key, Arc::new(placeholder));
							ctx.result = ctx.result.degrade(UpdateResult::Warning);
						}
					}
				}
			}
		}
		// Images collected; keep waiting on assets only
		return Step::Next(UpdateStage::AwaitImagesAndAssets(None));
	}

	if op.asset_load.as_ref().is_some_and(|load| !load.is_complete()) {
		if !cancelled(&mut op.ctx, env) {
			return Step::Wait;
		}
		return Step::Next(UpdateStage::ConvertResources);
	}
	op.asset_load = None;

	cancelled(&mut op.ctx, env);
	Step::Next(UpdateStage::ConvertResources)
}

// =============================================================================
// Convert + release
// =============================================================================

pub(super) fn convert_resources(op: &mut CurrentOperation, env: &mut StageEnv<'_>) -> Step {
	if let Some(mut load) = op.asset_load.take() {
		load.cancel();
	}

	let ctx = &mut op.ctx;
	if ctx.result.is_valid() {
		let object = ctx.object;
		let staging = &mut ctx.staging;
		let fixed = images::fix_images(std::mem::take(&mut staging.built_images));

		let mut cache = lock(env.cache);
		for (image, fix) in fixed {
			if fix != ImageFix::None {
				ctx.result = ctx.result.degrade(UpdateResult::Warning);
			}
			let image = Arc::new(image);
			if fix != ImageFix::Placeholder {
				cache.cache_image(object, &image);
			}
			staging.images.insert(image.key, image);
		}

		for key in std::mem::take(&mut staging.placeholder_images) {
			staging
				.images
				.insert(key, Arc::new(images::placeholder(key, &PLACEHOLDER_DESC)));
			ctx.result = ctx.result.degrade(UpdateResult::Warning);
		}

		for mesh_id in &staging.requested_meshes {
			if let Some(mesh) = staging.meshes.get(mesh_id) {
				cache.cache_mesh(object, mesh);
			}
		}
	}

	submit_release(op, env);
	Step::Next(UpdateStage::Callbacks)
}

/// End the engine-side update. Runs at most once per operation.
fn submit_release(op: &mut CurrentOperation, env: &mut StageEnv<'_>) {
	if op.release_submitted {
		return;
	}
	op.release_submitted = true;

	let Some(id) = op.ctx.compute_id else {
		return;
	};
	let keep_instance = op.ctx.live_mode;
	let clear_memory = env.config.clear_working_memory_on_update_end;
	env.compute.spawn_detached(move |engine| {
		engine.end_update(id);
		if !keep_instance {
			engine.release_instance(id);
		}
		if clear_memory {
			engine.clear_working_memory();
		}
	});
}

// =============================================================================
// Callbacks
// =============================================================================

pub(super) fn callbacks(op: CurrentOperation, env: &mut StageEnv<'_>) -> UpdateOutcome {
	let CurrentOperation {
		mut ctx, protected, ..
	} = op;

	if protected {
		lock(env.cache).unprotect_all();
	}

	let mut result = ctx.result;
	if ctx.superseded {
		result = result.degrade(UpdateResult::ErrorReplaced);
	}
	if !env.registry.is_alive(ctx.instance) {
		result = result.degrade(UpdateResult::Error);
	}

	let applied = apply(&mut ctx, result, env);

	// A live compute instance nobody will reuse must still be released
	if ctx.live_mode && !applied {
		if let Some(id) = ctx.compute_id {
			let kept = env
				.registry
				.get(ctx.instance)
				.is_some_and(|record| record.live_compute_id == Some(id));
			if !kept {
				env.queue.add_release(id);
			}
		}
	}

	let outcome = ctx.finalize(result);
	env.metrics.record_outcome(&outcome);
	outcome
}

/// Commit a valid result to the instance. Returns true if resources were applied.
fn apply(ctx: &mut UpdateContext, result: UpdateResult, env: &mut StageEnv<'_>) -> bool {
	let Some(record) = env.registry.get_mut(ctx.instance) else {
		return false;
	};

	if result.is_error() {
		record.status = InstanceStatus::Error;
		return false;
	}
	if !result.is_valid() {
		return false;
	}

	record.status = InstanceStatus::Generated;
	if ctx.short_circuited {
		return false;
	}

	let components = build_components(&ctx.staging);
	{
		let mut cache = lock(env.cache);
		// Add before remove so shared images never touch zero
		for image in components.iter().flat_map(|c| c.images.iter()) {
			cache.add_texture_reference(image.key);
		}
		for image in record.generated.iter().flat_map(|c| c.images.iter()) {
			cache.remove_texture_reference(image.key);
		}
	}

	record.generated = components;
	record.committed = Some(CommittedState {
		descriptor: ctx.descriptor.clone(),
		hash: ctx.hash.clone(),
	});
	record.live_compute_id = if ctx.live_mode { ctx.compute_id } else { None };
	true
}

fn build_components(staging: &Staging) -> Vec<GeneratedComponent> {
	let Some(layout) = staging.layout.as_ref() else {
		return Vec::new();
	};
	layout
		.components
		.iter()
		.map(|component| GeneratedComponent {
			meshes: component
				.meshes
				.iter()
				.filter_map(|id| staging.meshes.get(id).cloned())
				.collect(),
			images: component
				.images
				.iter()
				.filter_map(|slot| staging.images.get(&slot.key).cloned())
				.collect(),
		})
		.collect()
}
