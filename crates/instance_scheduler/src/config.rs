//! Scheduler configuration.
//!
//! Passed at construction; every runtime tuning knob lives here. Loadable
//! from TOML with missing fields falling back to [`SchedulerConfig::default`].

use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

/// Runtime tuning for a [`Scheduler`](crate::Scheduler).
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
  /// Master switch. When off, every request fails with `Error`.
  pub enabled: bool,
  /// Working memory budget handed to the build engine, in bytes.
  pub working_memory_bytes: usize,
  /// Number of recently generated resources kept alive by the cache.
  pub generated_resources_cache_size: usize,
  /// Discards processed per tick (0 = unlimited).
  pub max_discards_per_tick: usize,
  /// Compute handle releases processed per tick (0 = unlimited).
  pub max_releases_per_tick: usize,
  /// Keep the compute instance alive between updates of flagged instances.
  pub live_update_enabled: bool,
  /// Reuse cached images across different instances.
  pub reuse_images_between_instances: bool,
  /// Skip building meshes that are already cached.
  pub mesh_cache_enabled: bool,
  /// Fold redundant requests into `ErrorOptimized`.
  pub optimize_updates: bool,
  /// Drop stale cache entries during sweeps.
  pub cleanup_cache: bool,
  /// Only build the LODs each component requests instead of the full range.
  pub only_generate_requested_lods: bool,
  /// Ask the engine to free working memory after every update.
  pub clear_working_memory_on_update_end: bool,
  /// Largest texture edge to generate (0 = unlimited). Must be a power of two.
  pub max_texture_size: u32,
  /// Distance thresholds between consecutive LODs.
  pub lod_distances: Vec<f32>,
  /// Instances further than this are discarded instead of updated.
  pub discard_distance: f32,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      working_memory_bytes: 50 * 1024 * 1024,
      generated_resources_cache_size: 512,
      max_discards_per_tick: 30,
      max_releases_per_tick: 30,
      live_update_enabled: true,
      reuse_images_between_instances: true,
      mesh_cache_enabled: true,
      optimize_updates: true,
      cleanup_cache: true,
      only_generate_requested_lods: true,
      clear_working_memory_on_update_end: false,
      max_texture_size: 0,
      lod_distances: vec![10.0, 25.0, 50.0],
      discard_distance: 200.0,
    }
  }
}

impl SchedulerConfig {
  /// Parse and validate a TOML document.
  pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
    let config: SchedulerConfig = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
  }

  /// Load configuration from a TOML file.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_toml_str(&content)
  }

  /// Reject settings the scheduler cannot honor.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.generated_resources_cache_size == 0 {
      return Err(ConfigError::Invalid(
        "generated_resources_cache_size must be at least 1".into(),
      ));
    }
    if self.max_texture_size != 0 && !self.max_texture_size.is_power_of_two() {
      return Err(ConfigError::Invalid(format!(
        "max_texture_size must be a power of 2, got {}",
        self.max_texture_size
      )));
    }
    if self.lod_distances.windows(2).any(|w| w[0] > w[1]) {
      return Err(ConfigError::Invalid("lod_distances must be ascending".into()));
    }
    if !(self.discard_distance > 0.0) {
      return Err(ConfigError::Invalid("discard_distance must be positive".into()));
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_is_valid() {
    assert!(SchedulerConfig::default().validate().is_ok());
  }

  #[test]
  fn test_partial_toml_uses_defaults() {
    let config = SchedulerConfig::from_toml_str(
      r#"
        max_discards_per_tick = 4
        live_update_enabled = false
      "#,
    )
    .unwrap();

    assert_eq!(config.max_discards_per_tick, 4);
    assert!(!config.live_update_enabled);
    assert_eq!(config.max_releases_per_tick, 30);
    assert!(config.mesh_cache_enabled);
  }

  #[test]
  fn test_rejects_non_power_of_two_texture_size() {
    let err = SchedulerConfig::from_toml_str("max_texture_size = 300").unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));

    assert!(SchedulerConfig::from_toml_str("max_texture_size = 512").is_ok());
  }

  #[test]
  fn test_rejects_empty_cache() {
    let err = SchedulerConfig::from_toml_str("generated_resources_cache_size = 0").unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));
  }

  #[test]
  fn test_rejects_malformed_toml() {
    let err = SchedulerConfig::from_toml_str("enabled = \"yes\"").unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
  }

  #[test]
  fn test_load_missing_file() {
    let err = SchedulerConfig::load(Path::new("/nonexistent/scheduler.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Read { .. }));
  }
}
