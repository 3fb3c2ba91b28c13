//! Scenario parsing for the update simulator.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use instance_scheduler::{Descriptor, ParamValue};
use serde::Deserialize;

/// Root of a scenario file.
#[derive(Debug, Deserialize)]
pub struct Scenario {
	/// The model every instance is created from.
	pub model: ModelConfig,
	/// Request passes to run.
	#[serde(default = "default_rounds")]
	pub rounds: u32,
	/// Distance added to every instance between rounds.
	#[serde(default)]
	pub drift: f32,
	/// Instance definitions.
	pub instances: Vec<InstanceConfig>,
}

/// Shape of the synthetic model.
#[derive(Debug, Deserialize)]
pub struct ModelConfig {
	pub name: String,
	/// Components per instance.
	pub components: usize,
	/// LODs the model can build.
	#[serde(default = "default_lod_count")]
	pub lod_count: u8,
	/// Edge length of every generated image.
	#[serde(default = "default_image_size")]
	pub image_size: u32,
	/// Bytes streamed per component on every build.
	#[serde(default = "default_block_size")]
	pub block_size: usize,
}

/// A single instance and the parameters it is requested with.
#[derive(Debug, Deserialize)]
pub struct InstanceConfig {
	/// Starting distance to the viewer.
	pub distance: f32,
	#[serde(default)]
	pub near_viewer: bool,
	/// Keep the compute instance alive between updates.
	#[serde(default)]
	pub live: bool,
	/// Request with `force`.
	#[serde(default)]
	pub forced: bool,
	#[serde(default)]
	pub params: BTreeMap<String, ScenarioParam>,
	/// Float parameters that change every round.
	#[serde(default)]
	pub animate: Vec<String>,
}

/// A parameter value as written in TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ScenarioParam {
	Bool(bool),
	Int(i64),
	Float(f64),
	Text(String),
	Color([f32; 4]),
}

fn default_rounds() -> u32 {
	1
}

fn default_lod_count() -> u8 {
	3
}

fn default_image_size() -> u32 {
	64
}

fn default_block_size() -> usize {
	1024
}

impl Scenario {
	/// Load a scenario from a TOML file.
	pub fn load(path: &Path) -> Result<Self> {
		let content = std::fs::read_to_string(path)
			.with_context(|| format!("Failed to read scenario file: {}", path.display()))?;
		Self::parse(&content)
	}

	/// Parse and validate a scenario document.
	pub fn parse(content: &str) -> Result<Self> {
		let scenario: Scenario =
			toml::from_str(content).with_context(|| "Failed to parse scenario TOML")?;

		if scenario.instances.is_empty() {
			anyhow::bail!("Scenario must have at least one instance");
		}
		if scenario.model.components == 0 {
			anyhow::bail!("Model must have at least one component");
		}
		if scenario.model.lod_count == 0 {
			anyhow::bail!("Model must have at least one LOD");
		}
		if scenario.model.image_size == 0 || !scenario.model.image_size.is_power_of_two() {
			anyhow::bail!(
				"image_size must be a power of 2, got {}",
				scenario.model.image_size
			);
		}
		if scenario.model.block_size == 0 {
			anyhow::bail!("block_size must be positive");
		}
		for (index, instance) in scenario.instances.iter().enumerate() {
			if let Some(name) = instance
				.animate
				.iter()
				.find(|name| !matches!(instance.params.get(*name), Some(ScenarioParam::Float(_))))
			{
				anyhow::bail!("Instance {index} animates '{name}', which is not a float parameter");
			}
		}

		Ok(scenario)
	}
}

impl InstanceConfig {
	/// Parameter snapshot for `round`.
	pub fn descriptor(&self, round: u32) -> Result<Descriptor> {
		let mut descriptor = Descriptor::new();
		for (name, param) in &self.params {
			let value = match param {
				ScenarioParam::Bool(v) => ParamValue::Bool(*v),
				ScenarioParam::Int(v) => ParamValue::Int(
					i32::try_from(*v).with_context(|| format!("Parameter '{name}' out of range"))?,
				),
				ScenarioParam::Float(v) if self.animate.contains(name) => {
					ParamValue::Float(*v as f32 + round as f32 * 0.1)
				}
				ScenarioParam::Float(v) => ParamValue::Float(*v as f32),
				ScenarioParam::Text(v) => ParamValue::Text(v.clone()),
				ScenarioParam::Color(c) => ParamValue::Color(*c),
			};
			descriptor.set(name.clone(), value);
		}
		Ok(descriptor)
	}
}
