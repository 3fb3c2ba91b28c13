//! Per-tick limits for discard and handle-release processing.
//!
//! Bounds the work done in a single scheduling pass regardless of how much
//! is queued; excess items stay queued for the next tick.

use crate::config::SchedulerConfig;

/// Per-tick processing limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TickBudget {
	/// Maximum discards per tick (0 = unlimited).
	pub max_discards: usize,
	/// Maximum compute handle releases per tick (0 = unlimited).
	pub max_releases: usize,
}

impl TickBudget {
	/// Default budget with reasonable limits.
	pub const DEFAULT: Self = Self {
		max_discards: 30,
		max_releases: 30,
	};

	/// Unlimited budget for tests and flushes.
	pub const UNLIMITED: Self = Self {
		max_discards: 0,
		max_releases: 0,
	};

	/// Budget taken from the scheduler configuration.
	pub fn from_config(config: &SchedulerConfig) -> Self {
		Self {
			max_discards: config.max_discards_per_tick,
			max_releases: config.max_releases_per_tick,
		}
	}

	/// Check if more discards can be processed.
	#[inline]
	pub fn can_discard(&self, performed: usize) -> bool {
		self.max_discards == 0 || performed < self.max_discards
	}

	/// Check if more releases can be processed.
	#[inline]
	pub fn can_release(&self, performed: usize) -> bool {
		self.max_releases == 0 || performed < self.max_releases
	}
}

impl Default for TickBudget {
	fn default() -> Self {
		Self::DEFAULT
	}
}

/// What a single tick did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickStats {
	/// Discards taken off the queue (including skipped ones).
	pub discards_processed: usize,
	/// Discards skipped because the instance was mid-update.
	pub discards_skipped: usize,
	/// Compute handles released.
	pub releases_processed: usize,
	/// Whether an update was started this tick.
	pub update_started: bool,
	/// Whether an update finished this tick.
	pub update_finished: bool,
}

impl TickStats {
	/// Total queue items consumed this tick.
	#[inline]
	pub fn total_processed(&self) -> usize {
		self.discards_processed + self.releases_processed
	}
}
