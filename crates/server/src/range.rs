// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 StrataDB

//! A range: the unit of assignment. Owns one access group stack per
//! schema group, a split state machine, and the locks serializing
//! updates against maintenance.

use std::sync::{
	Arc,
	atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering},
};

use parking_lot::{Condvar, Mutex, MutexGuard};
use strata_fs::Filesystem;
use tracing::info;

use strata_core::{
	CellKey, Error, RangeSpec, RangeState, Result, TableIdentifier,
	key::flag,
};
use strata_store::{BlockCache, CellScanner};
use strata_wal::CommitLog;
use xxhash_rust::xxh3::xxh3_64;

use crate::{
	access_group::{AccessGroup, AccessGroupConfig},
	schema::Schema,
};

#[derive(Debug, Clone)]
pub struct RangeConfig {
	pub split_size: u64,
	pub maximum_size: u64,
	pub access_group: AccessGroupConfig,
}

/// Snapshot handed to the update path: whether a split is pending, where
/// it cuts, and the transfer log to route split-off writes into.
#[derive(Clone)]
pub struct SplitInfo {
	pub split_row: Option<Vec<u8>>,
	pub split_log: Option<Arc<CommitLog>>,
	pub latest_revision: i64,
}

impl SplitInfo {
	pub fn split_off(&self, row: &[u8]) -> bool {
		match &self.split_row {
			Some(split_row) => row > split_row.as_slice(),
			None => false,
		}
	}
}

struct StateInner {
	spec: RangeSpec,
	state: RangeState,
	split_log: Option<Arc<CommitLog>>,
	error: u32,
}

/// Blocks updates at a quiescent point so maintenance can swap pointers.
#[derive(Default)]
struct Quiesce {
	inner: Mutex<QuiesceState>,
	cond: Condvar,
}

#[derive(Default)]
struct QuiesceState {
	active: usize,
	blocked: bool,
}

impl Quiesce {
	fn enter(&self) {
		let mut state = self.inner.lock();
		while state.blocked {
			self.cond.wait(&mut state);
		}
		state.active += 1;
	}

	fn exit(&self) {
		let mut state = self.inner.lock();
		state.active -= 1;
		if state.active == 0 {
			self.cond.notify_all();
		}
	}

	fn pause<T>(&self, f: impl FnOnce() -> T) -> T {
		let mut state = self.inner.lock();
		while state.blocked {
			self.cond.wait(&mut state);
		}
		state.blocked = true;
		while state.active > 0 {
			self.cond.wait(&mut state);
		}
		drop(state);
		let result = f();
		let mut state = self.inner.lock();
		state.blocked = false;
		self.cond.notify_all();
		result
	}
}

pub struct Range {
	table: TableIdentifier,
	access_groups: Vec<Arc<AccessGroup>>,
	state: Mutex<StateInner>,
	/// Serializes cache application within one range.
	update_lock: Mutex<()>,
	/// Serializes maintenance tasks on this range.
	maintenance_lock: Mutex<()>,
	quiesce: Quiesce,
	latest_revision: AtomicI64,
	bytes_written: AtomicU64,
	bytes_read: AtomicU64,
	cells_written: AtomicU64,
	scanner_count: AtomicU32,
}

/// Directory-safe digest of a row, used when building range directory
/// tokens and transfer log names: end rows are arbitrary bytes.
pub fn range_dir_token(end_row: &[u8]) -> String {
	format!("{:016x}", xxh3_64(end_row))
}

impl Range {
	pub fn load(
		table: TableIdentifier,
		spec: RangeSpec,
		state: RangeState,
		schema: &Schema,
		fs: Arc<dyn Filesystem>,
		block_cache: Arc<BlockCache>,
		file_ids: Arc<AtomicU64>,
		config: &RangeConfig,
		dir_token: &str,
		split_log: Option<Arc<CommitLog>>,
	) -> Result<Arc<Self>> {
		let mut access_groups = Vec::with_capacity(schema.access_groups.len());
		for group in &schema.access_groups {
			let dir = format!("tables/{}/{}/{}", table.id, group.name, dir_token);
			access_groups.push(Arc::new(AccessGroup::open(
				group.name.clone(),
				dir,
				fs.clone(),
				block_cache.clone(),
				file_ids.clone(),
				config.access_group.clone(),
			)?));
		}
		Ok(Arc::new(Self {
			table,
			access_groups,
			state: Mutex::new(StateInner { spec, state, split_log, error: 0 }),
			update_lock: Mutex::new(()),
			maintenance_lock: Mutex::new(()),
			quiesce: Quiesce::default(),
			latest_revision: AtomicI64::new(0),
			bytes_written: AtomicU64::new(0),
			bytes_read: AtomicU64::new(0),
			cells_written: AtomicU64::new(0),
			scanner_count: AtomicU32::new(0),
		}))
	}

	pub fn table(&self) -> &TableIdentifier {
		&self.table
	}

	pub fn spec(&self) -> RangeSpec {
		self.state.lock().spec.clone()
	}

	pub fn name(&self) -> String {
		let state = self.state.lock();
		format!("{}{}", self.table.name, state.spec)
	}

	pub fn is_root(&self) -> bool {
		self.state.lock().spec.is_root(&self.table)
	}

	pub fn contains(&self, row: &[u8]) -> bool {
		self.state.lock().spec.contains(row)
	}

	pub fn matches(&self, spec: &RangeSpec) -> bool {
		self.state.lock().spec == *spec
	}

	pub fn range_state(&self) -> RangeState {
		self.state.lock().state.clone()
	}

	pub fn get_error(&self) -> u32 {
		self.state.lock().error
	}

	pub fn set_error(&self, code: u32) {
		self.state.lock().error = code;
	}

	/// Enters the update barrier; every `update` batch holds it while
	/// routing and applying so maintenance can wait for a quiescent
	/// point.
	pub fn update_enter(&self) {
		self.quiesce.enter();
	}

	pub fn update_exit(&self) {
		self.quiesce.exit();
	}

	/// Runs `f` with updates drained and blocked: the swap window for
	/// cache freezes and shrinks.
	pub fn with_updates_paused<T>(&self, f: impl FnOnce() -> T) -> T {
		self.quiesce.pause(f)
	}

	pub fn split_info(&self) -> SplitInfo {
		let state = self.state.lock();
		let split_row = match &state.state {
			RangeState::SplitLogInstalled { split_row, .. } => Some(split_row.clone()),
			_ => None,
		};
		SplitInfo {
			split_row,
			split_log: state.split_log.clone(),
			latest_revision: self.latest_revision.load(Ordering::SeqCst),
		}
	}

	pub fn latest_revision(&self) -> i64 {
		self.latest_revision.load(Ordering::SeqCst)
	}

	/// Revision ceiling for a scanner opened now.
	pub fn scan_revision(&self) -> i64 {
		self.latest_revision.load(Ordering::SeqCst)
	}

	pub fn lock_updates(&self) -> MutexGuard<'_, ()> {
		self.update_lock.lock()
	}

	pub fn lock_maintenance(&self) -> MutexGuard<'_, ()> {
		self.maintenance_lock.lock()
	}

	/// Applies one cell to the in-memory caches. Caller holds the
	/// update lock and has already logged the cell.
	pub fn add(&self, key: CellKey, value: Arc<[u8]>, schema: &Schema) -> Result<()> {
		let revision = key.revision();
		if key.flag() == flag::DELETE_ROW {
			// Row tombstones shadow every family, so each group gets
			// the marker.
			for group in &self.access_groups {
				group.add(key.clone(), value.clone());
			}
		} else {
			let family = key.family();
			let group_idx = schema
				.group_of_family(family)
				.ok_or_else(|| Error::BadKey(format!("unknown column family {family}")))?;
			// A schema update can name groups this range has not
			// materialized yet; those require a range reload.
			let group = self.access_groups.get(group_idx).ok_or_else(|| {
				Error::BadKey(format!("column family {family} not materialized in this range"))
			})?;
			group.add(key, value);
		}
		self.latest_revision.fetch_max(revision, Ordering::SeqCst);
		self.cells_written.fetch_add(1, Ordering::Relaxed);
		Ok(())
	}

	pub fn access_groups(&self) -> &[Arc<AccessGroup>] {
		&self.access_groups
	}

	/// Scanners over the intersection of this range and
	/// `(start_row, end_row]`, across every access group.
	pub fn scanners(&self, start_row: &[u8], end_row: &[u8]) -> Vec<Box<dyn CellScanner>> {
		let spec = self.spec();
		let lo =
			if start_row > spec.start_row.as_slice() { start_row } else { spec.start_row.as_slice() };
		let hi = if !end_row.is_empty() && end_row < spec.end_row.as_slice() {
			end_row
		} else {
			spec.end_row.as_slice()
		};
		let mut scanners = Vec::new();
		for group in &self.access_groups {
			scanners.extend(group.scanners(lo, hi));
		}
		scanners
	}

	pub fn add_bytes_written(&self, bytes: u64) {
		self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
	}

	pub fn add_bytes_read(&self, bytes: u64) {
		self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
	}

	pub fn stats(&self) -> RangeStats {
		let (spec, state) = {
			let inner = self.state.lock();
			(inner.spec.clone(), inner.state.clone())
		};
		RangeStats {
			table_id: self.table.id,
			spec,
			state,
			bytes_written: self.bytes_written.load(Ordering::Relaxed),
			bytes_read: self.bytes_read.load(Ordering::Relaxed),
			cells_written: self.cells_written.load(Ordering::Relaxed),
			memory_used: self.access_groups.iter().map(|g| g.memory_used()).sum(),
			disk_used: self.access_groups.iter().map(|g| g.disk_used()).sum(),
			store_count: self.access_groups.iter().map(|g| g.store_count()).sum(),
			outstanding_scanners: self.scanner_count.load(Ordering::Relaxed),
		}
	}

	pub fn total_size(&self) -> u64 {
		self.access_groups.iter().map(|g| g.memory_used() + g.disk_used()).sum()
	}

	pub fn memory_used(&self) -> u64 {
		self.access_groups.iter().map(|g| g.memory_used()).sum()
	}

	/// Smallest revision not yet persisted in a cell store; the prune
	/// floor for the commit log.
	pub fn earliest_cached_revision(&self) -> i64 {
		self.access_groups.iter().map(|g| g.earliest_cached_revision()).min().unwrap_or(i64::MAX)
	}

	pub fn increment_scanner_count(&self) {
		self.scanner_count.fetch_add(1, Ordering::Relaxed);
	}

	pub fn decrement_scanner_count(&self) {
		self.scanner_count.fetch_sub(1, Ordering::Relaxed);
	}

	// --- split state transitions; callers persist the matching
	// range-transaction-log entry before each one.

	pub fn install_split_log(&self, split_row: Vec<u8>, log: Arc<CommitLog>, transfer_dir: String) {
		let mut state = self.state.lock();
		info!(range = %format!("{}{}", self.table.name, state.spec), split_row = %String::from_utf8_lossy(&split_row), "split log installed");
		state.split_log = Some(log);
		state.state = RangeState::SplitLogInstalled { split_row, transfer_log: transfer_dir };
	}

	/// Shrinks the end row to the split row and evicts the split-off
	/// tail from the live caches. Caller pauses updates. Returns the
	/// old interval and the cache bytes freed.
	pub fn shrink_to(&self, split_row: &[u8]) -> (RangeSpec, u64) {
		let mut state = self.state.lock();
		let old = state.spec.clone();
		state.spec = RangeSpec::new(old.start_row.clone(), split_row.to_vec());
		if let RangeState::SplitLogInstalled { split_row, transfer_log } = state.state.clone() {
			state.state = RangeState::SplitShrunk { split_row, transfer_log };
		}
		info!(range = %format!("{}{}", self.table.name, state.spec), "range shrunk");
		drop(state);
		let freed =
			self.access_groups.iter().map(|g| g.truncate_live_above(split_row)).sum();
		(old, freed)
	}

	pub fn finish_split(&self) {
		let mut state = self.state.lock();
		state.split_log = None;
		state.state = RangeState::Steady;
	}
}

#[derive(Debug, Clone)]
pub struct RangeStats {
	pub table_id: u32,
	pub spec: RangeSpec,
	pub state: RangeState,
	pub bytes_written: u64,
	pub bytes_read: u64,
	pub cells_written: u64,
	pub memory_used: u64,
	pub disk_used: u64,
	pub store_count: usize,
	pub outstanding_scanners: u32,
}
