// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 StrataDB

use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Server-wide options. Field names track the configuration keys they come
/// from (`RangeServer.Port`, `Range.SplitSize`, `AccessGroup.MaxFiles`, ...).
#[derive(Clone, Debug)]
pub struct ServerOptions {
	/// RangeServer.Port
	pub port: u16,
	/// RangeServer.Workers: application-queue worker count.
	pub workers: usize,
	/// Reactor thread count.
	pub reactors: usize,
	/// Range.SplitSize: user-range split trigger, bytes.
	pub range_split_size: u64,
	/// Range.MetadataSplitSize: split trigger for metadata ranges.
	pub range_metadata_split_size: u64,
	/// Range.MaximumSize: hard cap after which writes stall.
	pub range_maximum_size: u64,
	/// AccessGroup.MaxFiles: cell-store count triggering a merging compaction.
	pub access_group_max_files: usize,
	/// AccessGroup.MergeFiles: stores merged per pass.
	pub access_group_merge_files: usize,
	/// AccessGroup.MaxMemory: per-access-group cache budget, bytes.
	pub access_group_max_memory: u64,
	/// MaintenanceThreads
	pub maintenance_threads: usize,
	/// Maintenance timer interval.
	pub maintenance_interval: Duration,
	/// MemoryLimit: overall budget; over it the application queue pauses.
	pub memory_limit: u64,
	/// ClockSkew.Max, microseconds.
	pub max_clock_skew_us: i64,
	/// Scanner.Ttl: server-side scanner idle timeout.
	pub scanner_ttl: Duration,
	/// CommitLog.RollLimit: fragment size cap, bytes.
	pub log_roll_limit: u64,
	/// CommitLog.PruneThreshold.Min: keep at least this much log, bytes.
	pub log_prune_threshold_min: u64,
	/// CommitLog.PruneThreshold.Max: prune above this much log, bytes.
	pub log_prune_threshold_max: u64,
	/// BlockCache.MinMemory
	pub block_cache_min_memory: u64,
	/// BlockCache.MaxMemory
	pub block_cache_max_memory: u64,
	/// QueryCache.MaxMemory: 0 disables the point-query cache.
	pub query_cache_max_memory: u64,
	/// Target uncompressed size of a cell-store data block, bytes.
	pub cell_store_block_size: u32,
	/// Byte budget of one scan block response.
	pub scan_block_size: u32,
}

impl Default for ServerOptions {
	fn default() -> Self {
		let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2);
		Self {
			port: 38060,
			workers: cores * 2,
			reactors: cores.min(4),
			range_split_size: 256 * MIB,
			range_metadata_split_size: 64 * MIB,
			range_maximum_size: 3 * 1024 * MIB,
			access_group_max_files: 10,
			access_group_merge_files: 4,
			access_group_max_memory: 100 * MIB,
			maintenance_threads: 2,
			maintenance_interval: Duration::from_secs(30),
			memory_limit: 2 * 1024 * MIB,
			max_clock_skew_us: 3_000_000,
			scanner_ttl: Duration::from_secs(120),
			log_roll_limit: 100 * MIB,
			log_prune_threshold_min: 200 * MIB,
			log_prune_threshold_max: 1024 * MIB,
			block_cache_min_memory: 32 * MIB,
			block_cache_max_memory: 256 * MIB,
			query_cache_max_memory: 64 * MIB,
			cell_store_block_size: 64 * 1024,
			scan_block_size: 512 * 1024,
		}
	}
}

impl ServerOptions {
	/// Shrunk thresholds that make splits and compactions reachable in
	/// tests without writing hundreds of megabytes.
	pub fn small_for_tests() -> Self {
		Self {
			range_split_size: 64 * 1024,
			range_metadata_split_size: 32 * 1024,
			range_maximum_size: 1024 * 1024,
			access_group_max_memory: 32 * 1024,
			log_roll_limit: 16 * 1024,
			log_prune_threshold_min: 32 * 1024,
			log_prune_threshold_max: 128 * 1024,
			cell_store_block_size: 1024,
			scan_block_size: 4 * 1024,
			// Tests drive maintenance passes explicitly.
			maintenance_interval: Duration::from_secs(3600),
			scanner_ttl: Duration::from_secs(5),
			..Self::default()
		}
	}
}
