//! Update pipeline: one state machine per update.
//!
//! Coordinator stages run inline when [`UpdatePipeline::advance`] is called.
//! Compute stages are submitted to the single-flight [`ComputeQueue`] and
//! polled on later ticks.
//!
//! ```text
//! Coordinator                         Compute (single worker)
//! ┌──────────────┐
//! │ Start        │ validate, subset check, live mode
//! └──────┬───────┘
//!        │ submit ───────────────────► new_instance + begin_update
//!        ▼                                        │
//! ┌──────────────┐                                │
//! │ AwaitBegin   │◄───────────────────────────────┘ BuildLayout
//! └──────┬───────┘
//!        ▼
//! ┌──────────────┐
//! │ LockMeshCache│ resolve cached meshes
//! └──────┬───────┘
//!        │ submit ───────────────────► get_mesh × N
//!        ▼                                        │
//! ┌──────────────┐                                │
//! │ AwaitMeshes  │◄───────────────────────────────┘
//! └──────┬───────┘
//!        ▼
//! ┌──────────────┐
//! │ LockCache    │ protect reused images, start asset loads
//! └──────┬───────┘
//!        │ submit ───────────────────► get_image × N
//!        ▼                                        │
//! ┌──────────────────────┐                        │
//! │ AwaitImagesAndAssets │◄───────────────────────┘
//! └──────┬───────────────┘
//!        ▼
//! ┌──────────────────┐
//! │ ConvertResources │ fix images (rayon), fill cache
//! └──────┬───────────┘
//!        │ submit ───────────────────► end_update + release_instance
//!        ▼
//! ┌──────────────┐
//! │ Callbacks    │ unprotect, apply, clear slot, finalize
//! └──────────────┘
//! ```
//!
//! Failures and cancellations skip ahead to `ConvertResources` once a compute
//! instance exists, so the release job runs exactly once for every update
//! that reached the engine.

pub mod images;
mod stages;

use std::sync::Mutex;

use crate::cache::ResourceCache;
use crate::config::SchedulerConfig;
use crate::context::{UpdateContext, UpdateOutcome};
use crate::descriptor::DescriptorHash;
use crate::engine::{AssetLoad, AssetLoader};
use crate::metrics::SchedulerMetrics;
use crate::queue::PendingQueue;
use crate::registry::{InstanceHandle, Registry};
use crate::threading::{ComputeQueue, TaskId};
use crate::types::ObjectId;

/// Pipeline state of the current update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateStage {
	Start,
	AwaitBegin(TaskId),
	LockMeshCache,
	AwaitMeshes(TaskId),
	LockCache,
	/// Image job (if any images were requested) plus the asset load.
	AwaitImagesAndAssets(Option<TaskId>),
	ConvertResources,
	Callbacks,
}

/// Everything a stage may touch, borrowed from the scheduler for one advance.
pub(crate) struct StageEnv<'a> {
	pub config: &'a SchedulerConfig,
	pub registry: &'a mut Registry,
	pub queue: &'a mut PendingQueue,
	pub cache: &'a Mutex<ResourceCache>,
	pub compute: &'a ComputeQueue,
	pub loader: &'a mut dyn AssetLoader,
	pub metrics: &'a mut SchedulerMetrics,
}

/// The update occupying the current-operation slot.
pub(crate) struct CurrentOperation {
	ctx: UpdateContext,
	stage: UpdateStage,
	asset_load: Option<Box<dyn AssetLoad>>,
	release_submitted: bool,
	protected: bool,
}

enum Step {
	Next(UpdateStage),
	Wait,
	Finish,
}

/// Drives at most one update at a time.
#[derive(Default)]
pub struct UpdatePipeline {
	current: Option<CurrentOperation>,
}

impl UpdatePipeline {
	pub fn new() -> Self {
		Self::default()
	}

	/// Check if an update occupies the slot.
	pub fn is_busy(&self) -> bool {
		self.current.is_some()
	}

	pub fn stage(&self) -> Option<UpdateStage> {
		self.current.as_ref().map(|op| op.stage)
	}

	/// Instance targeted by the current update, superseded or not.
	pub fn current_instance(&self) -> Option<InstanceHandle> {
		self.current.as_ref().map(|op| op.ctx.instance)
	}

	/// Object of the current update.
	pub fn current_object(&self) -> Option<ObjectId> {
		self.current.as_ref().map(|op| op.ctx.object)
	}

	/// Hash of the current update, if it is still the live request for its instance.
	pub fn live_hash_for(&self, instance: InstanceHandle) -> Option<&DescriptorHash> {
		self.current
			.as_ref()
			.filter(|op| op.ctx.instance == instance && !op.ctx.superseded)
			.map(|op| &op.ctx.hash)
	}

	/// Flag the current update as superseded if it targets `instance`.
	pub fn mark_superseded(&mut self, instance: InstanceHandle) -> bool {
		match self.current.as_mut() {
			Some(op) if op.ctx.instance == instance && !op.ctx.superseded => {
				tracing::debug!(instance = instance.index(), "current update superseded");
				op.ctx.superseded = true;
				true
			}
			_ => false,
		}
	}

	/// Occupy the slot with `ctx`. The slot must be free.
	pub(crate) fn start(&mut self, ctx: UpdateContext) {
		debug_assert!(self.current.is_none(), "pipeline already busy");
		tracing::debug!(instance = ctx.instance.index(), priority = ?ctx.priority, "update started");
		self.current = Some(CurrentOperation {
			ctx,
			stage: UpdateStage::Start,
			asset_load: None,
			release_submitted: false,
			protected: false,
		});
	}

	/// Run stages until one has to wait on compute or the update finishes.
	///
	/// Returns the outcome when the update was finalized.
	#[tracing::instrument(level = "trace", skip_all, name = "pipeline::advance")]
	pub(crate) fn advance(&mut self, env: &mut StageEnv<'_>) -> Option<UpdateOutcome> {
		loop {
			let op = self.current.as_mut()?;
			let stage = op.stage;
			let _span = tracing::debug_span!("pipeline::stage", ?stage).entered();

			let step = match stage {
				UpdateStage::Start => stages::start(op, env),
				UpdateStage::AwaitBegin(task) => stages::await_begin(op, env, task),
				UpdateStage::LockMeshCache => stages::lock_mesh_cache(op, env),
				UpdateStage::AwaitMeshes(task) => stages::await_meshes(op, env, task),
				UpdateStage::LockCache => stages::lock_cache(op, env),
				UpdateStage::AwaitImagesAndAssets(task) => stages::await_images_and_assets(op, env, task),
				UpdateStage::ConvertResources => stages::convert_resources(op, env),
				UpdateStage::Callbacks => Step::Finish,
			};

			match step {
				Step::Next(next) => op.stage = next,
				Step::Wait => return None,
				Step::Finish => {
					// The slot is free before any caller code runs
					let op = self.current.take()?;
					return Some(stages::callbacks(op, env));
				}
			}
		}
	}
}
