//! Error types.
//!
//! None of these cross the scheduler boundary during an update: every stage
//! failure is folded into an [`UpdateResult`](crate::UpdateResult). They are
//! returned by construction, configuration and the streaming reader.

use std::path::PathBuf;

use thiserror::Error;

use crate::streaming::{BlockKey, OperationId, SourceId};

/// Failures reported by a [`BuildEngine`](crate::BuildEngine).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
  /// The compute instance is unknown to the engine.
  #[error("unknown compute instance {0}")]
  UnknownInstance(u32),

  /// The model produced no data for the requested resource.
  #[error("resource {0:#x} is not produced by this model")]
  MissingResource(u64),

  /// The platform cannot use 16 bit bone indices for this mesh.
  #[error("mesh requires 16 bit bone indices")]
  Unsupported16BitBoneIndex,

  /// Any other engine failure.
  #[error("build failed: {0}")]
  Failed(String),
}

/// Failures reported by the [`StreamingReader`](crate::StreamingReader).
#[derive(Error, Debug)]
pub enum StreamError {
  /// The source was never prepared, has been cancelled, or holds no data.
  #[error("source {0:?} is not prepared for streaming")]
  NotPrepared(SourceId),

  /// The source does not contain the requested block.
  #[error("block {key:?} not found in source {source_id:?}")]
  BlockNotFound {
    /// Source that was queried.
    source_id: SourceId,
    /// Missing block.
    key: BlockKey,
  },

  /// No outstanding operation with this id.
  #[error("unknown streaming operation {0:?}")]
  UnknownOperation(OperationId),

  /// The backing store failed to read.
  #[error("read failed: {0}")]
  Io(#[from] std::io::Error),
}

/// Failures loading or validating a [`SchedulerConfig`](crate::SchedulerConfig).
#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("failed to read config file {path}: {source}")]
  Read {
    path: PathBuf,
    source: std::io::Error,
  },

  #[error("failed to parse config: {0}")]
  Parse(#[from] toml::de::Error),

  #[error("invalid config: {0}")]
  Invalid(String),
}

/// Failures constructing a [`Scheduler`](crate::Scheduler).
#[derive(Error, Debug)]
pub enum SchedulerError {
  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error("failed to start compute worker: {0}")]
  ComputeWorker(#[from] rayon::ThreadPoolBuildError),
}
