// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 StrataDB

//! One access group of one range: a live cell cache, at most one frozen
//! cache mid-compaction, and an ordered list of cell stores, newest
//! first. Reads merge across all of them; compactions replace parts of
//! the list behind a brief pointer swap the range serializes with its
//! update lock.

use std::sync::{
	Arc,
	atomic::{AtomicU64, Ordering},
};

use parking_lot::RwLock;
use strata_fs::Filesystem;
use tracing::{info, warn};

use strata_core::{CellKey, Result};
use strata_store::{
	BlockCache, CellCache, CellScanner, CellStore, CellStoreWriter, FilteredScanner, MergeScanner,
	ScanFilter,
};

#[derive(Debug, Clone)]
pub struct AccessGroupConfig {
	pub block_size: u32,
	pub max_files: usize,
	pub merge_files: usize,
	pub max_memory: u64,
}

struct Stores {
	live: Arc<CellCache>,
	frozen: Option<Arc<CellCache>>,
	/// Newest first.
	stores: Vec<CellStore>,
}

pub struct AccessGroup {
	name: String,
	/// Directory holding this group's cell stores for this range.
	dir: String,
	fs: Arc<dyn Filesystem>,
	block_cache: Arc<BlockCache>,
	/// Server-wide cell-store file id allocator (block-cache keys).
	file_ids: Arc<AtomicU64>,
	next_store_seq: AtomicU64,
	config: AccessGroupConfig,
	inner: RwLock<Stores>,
}

impl AccessGroup {
	/// Opens the group, adopting any cell stores already in its
	/// directory (newest sequence first). A file that fails to open is
	/// discarded: it is a torn leftover of a crashed compaction whose
	/// data is still in the commit log or the pre-compaction stores.
	pub fn open(
		name: impl Into<String>,
		dir: impl Into<String>,
		fs: Arc<dyn Filesystem>,
		block_cache: Arc<BlockCache>,
		file_ids: Arc<AtomicU64>,
		config: AccessGroupConfig,
	) -> Result<Self> {
		let name = name.into();
		let dir = dir.into();
		fs.mkdirs(&dir)?;

		let mut seqs: Vec<u64> = fs
			.readdir(&dir)?
			.iter()
			.filter_map(|n| n.strip_prefix("cs").and_then(|s| s.parse().ok()))
			.collect();
		seqs.sort_unstable();
		let next_seq = seqs.last().map(|s| s + 1).unwrap_or(0);

		let mut stores = Vec::new();
		for seq in seqs.iter().rev() {
			let path = format!("{dir}/cs{seq}");
			let file_id = file_ids.fetch_add(1, Ordering::Relaxed);
			match CellStore::open(&fs, &path, file_id, block_cache.clone()) {
				Ok(store) => stores.push(store),
				Err(e) => {
					warn!(path, error = %e, "discarding unreadable cell store");
					let _ = fs.remove(&path);
				}
			}
		}

		Ok(Self {
			name,
			dir,
			fs,
			block_cache,
			file_ids,
			next_store_seq: AtomicU64::new(next_seq),
			config,
			inner: RwLock::new(Stores { live: CellCache::new(), frozen: None, stores }),
		})
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn dir(&self) -> &str {
		&self.dir
	}

	pub fn add(&self, key: CellKey, value: Arc<[u8]>) {
		self.inner.read().live.insert(key, value);
	}

	/// Scanners over `(start_row, end_row]`, newest source first, for
	/// composition into a merge scanner.
	pub fn scanners(&self, start_row: &[u8], end_row: &[u8]) -> Vec<Box<dyn CellScanner>> {
		let inner = self.inner.read();
		let mut scanners: Vec<Box<dyn CellScanner>> =
			vec![Box::new(inner.live.scanner(start_row, end_row))];
		if let Some(frozen) = &inner.frozen {
			scanners.push(Box::new(frozen.scanner(start_row, end_row)));
		}
		for store in &inner.stores {
			scanners.push(Box::new(store.scanner(start_row, end_row)));
		}
		scanners
	}

	pub fn memory_used(&self) -> u64 {
		let inner = self.inner.read();
		inner.live.memory_used() + inner.frozen.as_ref().map_or(0, |f| f.memory_used())
	}

	pub fn disk_used(&self) -> u64 {
		self.inner.read().stores.iter().map(|s| s.disk_size()).sum()
	}

	pub fn store_count(&self) -> usize {
		self.inner.read().stores.len()
	}

	pub fn cached_items(&self) -> u64 {
		let inner = self.inner.read();
		(inner.live.len() + inner.frozen.as_ref().map_or(0, |f| f.len())) as u64
	}

	/// Smallest revision still held only in memory; log prune must stay
	/// below it.
	pub fn earliest_cached_revision(&self) -> i64 {
		let inner = self.inner.read();
		let live = inner.live.earliest_revision();
		let frozen = inner.frozen.as_ref().map_or(i64::MAX, |f| f.earliest_revision());
		live.min(frozen)
	}

	pub fn needs_minor_compaction(&self) -> bool {
		let inner = self.inner.read();
		inner.live.memory_used() > self.config.max_memory
	}

	pub fn needs_merging_compaction(&self) -> bool {
		self.inner.read().stores.len() > self.config.max_files
	}

	/// Drops live-cache rows past `row` after a shrink; the split-off
	/// child owns them now (durably, via the transfer log). Returns
	/// bytes freed. A frozen snapshot is left alone: its store write is
	/// already in flight and scans clamp to the range interval anyway.
	pub fn truncate_live_above(&self, row: &[u8]) -> u64 {
		self.inner.read().live.remove_rows_above(row)
	}

	/// Row candidate near the middle of the group's biggest store.
	pub fn split_row_candidate(&self) -> Option<Vec<u8>> {
		let inner = self.inner.read();
		inner
			.stores
			.iter()
			.max_by_key(|s| s.disk_size())
			.and_then(|s| s.split_row_candidate())
	}

	/// Installs an empty cache for live writes, freezing the current one
	/// read-only. Caller must hold the range quiescent for the swap. A
	/// snapshot left behind by a failed compaction is kept; the live
	/// cache then stays in place until that snapshot is persisted.
	pub fn freeze(&self) {
		let mut inner = self.inner.write();
		if inner.frozen.is_some() {
			return;
		}
		let frozen = std::mem::replace(&mut inner.live, CellCache::new());
		inner.frozen = Some(frozen);
	}

	fn new_store_path(&self) -> (String, u64) {
		let seq = self.next_store_seq.fetch_add(1, Ordering::Relaxed);
		(format!("{}/cs{}", self.dir, seq), seq)
	}

	fn write_store(&self, mut scanner: impl CellScanner) -> Result<Option<CellStore>> {
		let (path, _) = self.new_store_path();
		let mut writer = CellStoreWriter::create(&self.fs, &path, self.config.block_size)?;
		let mut wrote = false;
		while let Some(entry) = scanner.next_cell() {
			writer.add(&entry.key, &entry.value)?;
			wrote = true;
		}
		if !wrote {
			// Nothing survived (e.g. an all-tombstone major pass).
			let _ = writer.finish();
			let _ = self.fs.remove(&path);
			return Ok(None);
		}
		writer.finish()?;
		let file_id = self.file_ids.fetch_add(1, Ordering::Relaxed);
		let store = CellStore::open(&self.fs, &path, file_id, self.block_cache.clone())?;
		Ok(Some(store))
	}

	/// Minor compaction, phase 2: write the frozen cache out to a new
	/// store. Runs without any range lock held.
	pub fn write_frozen_store(&self) -> Result<Option<CellStore>> {
		let frozen = match &self.inner.read().frozen {
			Some(frozen) => frozen.clone(),
			None => return Ok(None),
		};
		if frozen.is_empty() {
			return Ok(None);
		}
		// Tombstones must survive a minor compaction: older values may
		// still sit in other stores.
		self.write_store(FilteredScanner::new(
			Box::new(frozen.scanner(b"", b"")),
			ScanFilter { return_deletes: true, ..Default::default() },
		))
	}

	/// Minor compaction, phase 3: install the successor store and drop
	/// the frozen cache. Caller holds the range quiescent.
	pub fn install_frozen_store(&self, store: Option<CellStore>) -> u64 {
		let mut inner = self.inner.write();
		let freed = inner.frozen.as_ref().map_or(0, |f| f.memory_used());
		if let Some(store) = store {
			info!(group = %self.name, path = %store.path(), entries = store.total_entries(), "minor compaction installed");
			inner.stores.insert(0, store);
		}
		inner.frozen = None;
		freed
	}

	/// Merging compaction: fold the `merge_files` oldest stores into
	/// one. The swap happens under the write lock; pre-swap scanners
	/// keep their handles to the retired files.
	pub fn merging_compaction(&self) -> Result<()> {
		let victims: Vec<CellStore> = {
			let inner = self.inner.read();
			let k = self.config.merge_files.min(inner.stores.len());
			if k < 2 {
				return Ok(());
			}
			inner.stores[inner.stores.len() - k..].to_vec()
		};

		let scanners: Vec<Box<dyn CellScanner>> =
			victims.iter().map(|s| Box::new(s.scanner(b"", b"")) as Box<dyn CellScanner>).collect();
		let merged = self.write_store(FilteredScanner::new(
			Box::new(MergeScanner::new(scanners)),
			ScanFilter { return_deletes: true, ..Default::default() },
		))?;

		let mut inner = self.inner.write();
		let keep = inner.stores.len() - victims.len();
		let retired: Vec<CellStore> = inner.stores.split_off(keep);
		if let Some(merged) = merged {
			inner.stores.push(merged);
		}
		drop(inner);
		self.retire(&retired);
		info!(group = %self.name, merged = victims.len(), "merging compaction complete");
		Ok(())
	}

	/// Major compaction phase 2: merge the frozen cache and every store
	/// into a single store, dropping shadowed cells and tombstones.
	/// Returns the replacement store; the caller installs it at a
	/// quiescent point via `install_major`.
	pub fn write_major_store(&self) -> Result<(Vec<CellStore>, Option<CellStore>)> {
		let (sources, old_stores) = {
			let inner = self.inner.read();
			let mut sources: Vec<Box<dyn CellScanner>> = Vec::new();
			if let Some(frozen) = &inner.frozen {
				sources.push(Box::new(frozen.scanner(b"", b"")));
			}
			for store in &inner.stores {
				sources.push(Box::new(store.scanner(b"", b"")));
			}
			(sources, inner.stores.clone())
		};
		// Everything below the live cache participates, so delete
		// markers have nothing left to shadow and can be dropped.
		let merged = self.write_store(FilteredScanner::new(
			Box::new(MergeScanner::new(sources)),
			ScanFilter::default(),
		))?;
		Ok((old_stores, merged))
	}

	pub fn install_major(&self, retired: Vec<CellStore>, replacement: Option<CellStore>) {
		let mut inner = self.inner.write();
		inner.stores.clear();
		if let Some(store) = replacement {
			info!(group = %self.name, path = %store.path(), "major compaction installed");
			inner.stores.push(store);
		}
		inner.frozen = None;
		drop(inner);
		self.retire(&retired);
	}

	/// Deletes retired store files. Open handles (scanners mid-flight)
	/// keep the descriptor usable until they drop.
	fn retire(&self, stores: &[CellStore]) {
		for store in stores {
			self.block_cache.retire_file(store.file_id());
			if let Err(e) = self.fs.remove(store.path()) {
				warn!(path = %store.path(), error = %e, "failed to delete retired store");
			}
		}
	}

	pub fn latest_stored_revision(&self) -> i64 {
		self.inner
			.read()
			.stores
			.iter()
			.map(|s| s.latest_revision())
			.max()
			.unwrap_or(i64::MIN)
	}
}
