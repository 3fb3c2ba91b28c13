//! Instance update simulator.
//!
//! Runs a TOML scenario through the scheduler against a synthetic build
//! engine that streams its model data, and logs the outcome of every update.
//!
//! Each round moves every instance by the scenario's drift and requests an
//! update with its parameters, then drains the scheduler. Unchanged requests
//! fold into committed results; instances that drift out of range are
//! discarded.

mod engine;
mod scenario;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use instance_scheduler::{
	InstanceHandle, NoAssets, ObjectDesc, Scheduler, SchedulerConfig, SourceId, StreamingReader,
	UpdateOptions, UpdateResult, UpdateTicket,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use engine::{model_store, StreamedEngine};
use scenario::Scenario;

/// Simulator for the instance update scheduler.
#[derive(Parser, Debug)]
#[command(name = "simulate_updates")]
#[command(about = "Runs a scenario of instance updates through the scheduler")]
struct Args {
	/// Path to scenario TOML file.
	#[arg(short, long)]
	scenario: PathBuf,

	/// Scheduler configuration TOML (default: built-in defaults).
	#[arg(short, long)]
	config: Option<PathBuf>,

	/// Seconds to wait for each round to drain (0 = unlimited).
	#[arg(short, long, default_value_t = 30)]
	time_limit: u64,

	/// Lock and unlock the model between rounds.
	#[arg(long)]
	relock: bool,
}

const SOURCE: SourceId = SourceId(1);

fn main() -> Result<()> {
	let args = Args::parse();

	tracing_subscriber::registry()
		.with(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| "info".into()),
		)
		.with(tracing_subscriber::fmt::layer())
		.init();

	let scenario = Scenario::load(&args.scenario)?;
	let config = match &args.config {
		Some(path) => SchedulerConfig::load(path)
			.with_context(|| format!("Loading scheduler config: {}", path.display()))?,
		None => SchedulerConfig::default(),
	};

	tracing::info!(
		model = %scenario.model.name,
		instances = scenario.instances.len(),
		rounds = scenario.rounds,
		"scenario loaded"
	);

	let reader = Arc::new(StreamingReader::new());
	let store = Arc::new(model_store(&scenario.model));
	reader
		.prepare_streaming(SOURCE, store.clone())
		.context("Preparing model data for streaming")?;

	let engine = StreamedEngine::new(Arc::clone(&reader), SOURCE, &scenario.model);
	let mut scheduler = Scheduler::new(config, Box::new(engine), Box::new(NoAssets))
		.context("Creating scheduler")?
		.with_streaming(reader);

	let object = scheduler.register_object(ObjectDesc {
		name: scenario.model.name.clone(),
		component_count: scenario.model.components,
		lod_count: scenario.model.lod_count,
		source: Some(SOURCE),
	});

	let mut instances: Vec<InstanceHandle> = Vec::with_capacity(scenario.instances.len());
	for config in &scenario.instances {
		let handle = scheduler
			.create_instance(object)
			.context("Model rejected instance creation")?;
		if let Some(record) = scheduler.instance_mut(handle) {
			record.live_update = config.live;
		}
		instances.push(handle);
	}

	let time_limit = Duration::from_secs(args.time_limit);
	for round in 0..scenario.rounds {
		if args.relock && round > 0 {
			if !scheduler.lock_object(object) {
				anyhow::bail!("Model could not be locked in round {round}");
			}
			scheduler.unlock_object(object);
			scheduler
				.streaming()
				.prepare_streaming(SOURCE, store.clone())
				.context("Re-preparing model data after unlock")?;
		}

		let mut tickets = Vec::with_capacity(instances.len());
		for (index, (handle, config)) in instances.iter().zip(&scenario.instances).enumerate() {
			let distance = config.distance + scenario.drift * round as f32;
			scheduler.set_instance_distance(*handle, distance, config.near_viewer);

			let (ticket, callback) = UpdateTicket::channel();
			let options = UpdateOptions {
				force: config.forced,
				callback: Some(callback),
			};
			let decision = scheduler.request_update(*handle, config.descriptor(round)?, options);
			tracing::debug!(round, index, ?decision, "update requested");
			tickets.push((index, ticket));
		}

		if !scheduler.block_till_all_requests_finished(time_limit) {
			anyhow::bail!(
				"Round {round} did not finish within {}s ({} work items left)",
				args.time_limit,
				scheduler.remaining_work()
			);
		}

		for (index, ticket) in tickets {
			match ticket.try_outcome() {
				Some(outcome) => tracing::info!(
					round,
					index,
					result = ?outcome.result,
					queue_us = outcome.queue_time.as_micros() as u64,
					update_us = outcome.update_time.as_micros() as u64,
					"update finished"
				),
				None => tracing::warn!(round, index, "update never finalized"),
			}
		}
	}

	for handle in instances {
		scheduler.destroy_instance(handle);
	}
	scheduler.block_till_all_requests_finished(time_limit);
	let drained = scheduler.streaming().end_streaming();

	let metrics = scheduler.metrics();
	for result in UpdateResult::ALL {
		let count = metrics.count(result);
		if count > 0 {
			tracing::info!(?result, count, "updates by result");
		}
	}
	tracing::info!(
		total = metrics.total_finalized(),
		avg_queue_us = metrics.avg_queue_time_us(),
		avg_update_us = metrics.avg_update_time_us(),
		p95_update_us = metrics.p95_update_time().map_or(0, |d| d.as_micros() as u64),
		ticks = metrics.ticks,
		drained,
		"simulation finished"
	);

	Ok(())
}
