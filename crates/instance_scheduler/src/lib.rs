//! instance_scheduler - Engine independent update scheduling for customizable instances
//!
//! This crate decides when the derived assets (meshes and images) of a
//! parameterized instance have to be regenerated, queues that work by
//! priority and drives it through a staged pipeline against a single-flight
//! build engine. Previously generated resources are reused through a
//! reference-counted cache, and source data is streamed asynchronously.
//!
//! # Features
//!
//! - **Admission**: redundant requests fold into running, queued or
//!   committed work using descriptor hash subsets
//! - **Priority Scheduling**: one update at a time, highest priority and
//!   nearest instance first, with LOD updates synthesized from viewer distance
//! - **Update Pipeline**: explicit state machine; compute stages run on a
//!   dedicated worker that owns the build engine
//! - **Resource Cache**: weak per-object mesh and image caches, image
//!   protection during updates and texture reference counting
//! - **Streaming Reader**: pollable block reads from memory, files or a
//!   content-addressed store
//!
//! # Example
//!
//! ```ignore
//! use instance_scheduler::{Descriptor, ParamValue, Scheduler, SchedulerConfig, UpdateOptions, UpdateTicket};
//!
//! let mut scheduler = Scheduler::new(SchedulerConfig::default(), Box::new(engine), Box::new(NoAssets))?;
//! let object = scheduler.register_object(desc);
//! let instance = scheduler.create_instance(object).unwrap();
//!
//! let (ticket, callback) = UpdateTicket::channel();
//! let params = Descriptor::new().with("height", ParamValue::Float(1.8));
//! scheduler.request_update(instance, params, UpdateOptions::default().with_callback(callback));
//!
//! while scheduler.tick() > 0 {}
//! println!("{:?}", ticket.try_outcome());
//! ```

pub mod budget;
pub mod cache;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod types;

// Re-export commonly used items
pub use budget::{TickBudget, TickStats};
pub use cache::{ResourceCache, SweepStats};
pub use config::SchedulerConfig;
pub use context::{UpdateCallback, UpdateContext, UpdateOutcome, UpdateTicket};
pub use descriptor::{Descriptor, DescriptorHash, LodVec, ParamValue};
pub use engine::{AssetLoad, AssetLoader, BuildEngine, BuildLayout, ComponentLayout, ImageSlot, LodRequest, NoAssets};
pub use error::{ConfigError, EngineError, SchedulerError, StreamError};
pub use types::{
  AdmissionDecision, ComputeId, GeneratedComponent, Image, ImageDesc, ImageFormat, ImageKey, InstanceStatus, Mesh,
  MeshId, ObjectId, Priority, UpdateResult,
};

// Objects, instances and their generation-checked handles
pub mod registry;
pub use registry::{InstanceHandle, InstanceRecord, ObjectDesc, ObjectRecord};

// Pending work and priority policy
pub mod policy;
pub mod queue;
pub use queue::PendingQueue;

// Single-flight compute worker
pub mod threading;
pub use threading::{ComputeQueue, TaskId};

// Staged update pipeline
pub mod pipeline;
pub use pipeline::{UpdatePipeline, UpdateStage};

// Async block streaming
pub mod streaming;
pub use streaming::{
  BackingStore, BlockKey, BlockLocation, ContentStore, FileStore, MemoryStore, OperationId, SourceId, StreamingReader,
};

pub mod scheduler;
pub use scheduler::{Scheduler, UpdateOptions};

#[cfg(test)]
pub(crate) mod test_utils;
