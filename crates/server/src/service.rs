// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 StrataDB

//! The range server service. Owns the live range map, the three global
//! commit logs, the range transaction log, the scanner registry, the
//! query cache and the maintenance machinery, and implements every
//! request the protocol names.

use std::{
	collections::{HashSet, VecDeque},
	sync::{
		Arc, Weak,
		atomic::{AtomicBool, AtomicU64, Ordering},
	},
	thread::JoinHandle,
};

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use strata_comm::ApplicationQueue;
use strata_fs::Filesystem;
use tracing::{debug, error, info, instrument, warn};

use strata_core::{
	CellKey, Error, RangeSpec, RangeState, Result, ScanSpec, ServerOptions, TableIdentifier, code,
	key::{Key, WireKeyRef, encode_wire_full, flag},
	util::{
		encoding::{decode_bytes, decode_i64, decode_u32, encode_bytes, encode_i64, encode_u8, encode_u32, encode_vu32},
		time::{RevisionClock, now_micros},
	},
};
use strata_store::BlockCache;
use strata_wal::{CommitLog, CommitLogReader, RangeStateInfo, RangeTxnLog, TxnEntry};

use crate::{
	access_group::AccessGroupConfig,
	maintenance::MaintenanceQueue,
	memory_tracker::MemoryTracker,
	protocol::{ScanResult, SendBack, UPDATE_FLAG_NO_LOG_SYNC, replay_group},
	query_cache::QueryCache,
	range::{Range, RangeConfig, range_dir_token},
	scan::{RangeScanner, ScanContext, ScannerRegistry, fill_scan_block},
	schema::Schema,
	table_info::{TableInfo, TableInfoMap},
};

/// Opens once recovery of its group completes; requests arriving earlier
/// block here.
struct Latch {
	open: Mutex<bool>,
	cond: Condvar,
}

impl Latch {
	fn new() -> Self {
		Self { open: Mutex::new(false), cond: Condvar::new() }
	}

	fn open(&self) {
		let mut open = self.open.lock();
		*open = true;
		self.cond.notify_all();
	}

	fn wait(&self) {
		let mut open = self.open.lock();
		while !*open {
			self.cond.wait(&mut open);
		}
	}
}

/// Bounded cache of recently dropped table ids, closing the race between
/// `drop_table` and an in-flight `load_range`.
struct DroppedIds {
	set: HashSet<u32>,
	order: VecDeque<u32>,
	capacity: usize,
}

impl DroppedIds {
	fn new(capacity: usize) -> Self {
		Self { set: HashSet::new(), order: VecDeque::new(), capacity }
	}

	fn insert(&mut self, id: u32) {
		if self.set.insert(id) {
			self.order.push_back(id);
			if self.order.len() > self.capacity {
				if let Some(evicted) = self.order.pop_front() {
					self.set.remove(&evicted);
				}
			}
		}
	}

	fn contains(&self, id: u32) -> bool {
		self.set.contains(&id)
	}
}

struct ReplayState {
	group: u16,
	log: Option<Arc<CommitLog>>,
}

pub struct RangeServer {
	opts: ServerOptions,
	fs: Arc<dyn Filesystem>,
	live_map: TableInfoMap,
	replay_map: TableInfoMap,
	root_log: RwLock<Option<Arc<CommitLog>>>,
	metadata_log: RwLock<Option<Arc<CommitLog>>>,
	user_log: RwLock<Option<Arc<CommitLog>>>,
	txn_log: RangeTxnLog,
	scanners: ScannerRegistry,
	query_cache: Option<QueryCache>,
	block_cache: Arc<BlockCache>,
	memory: MemoryTracker,
	maintenance: Arc<MaintenanceQueue>,
	app_queue: RwLock<Option<Arc<ApplicationQueue>>>,
	clock: RevisionClock,
	/// Two-phase update pipeline: A covers routing and validation, B
	/// covers log append and cache application; A releases once B is
	/// held so the next batch validates while this one commits.
	update_mutex_a: Mutex<()>,
	update_mutex_b: Mutex<()>,
	root_latch: Latch,
	metadata_latch: Latch,
	all_latch: Latch,
	dropped_tables: Mutex<DroppedIds>,
	replay: Mutex<ReplayState>,
	file_ids: Arc<AtomicU64>,
	transfer_seq: AtomicU64,
	down: AtomicBool,
	maint_stop: Arc<(Mutex<bool>, Condvar)>,
	maint_thread: Mutex<Option<JoinHandle<()>>>,
}

impl RangeServer {
	pub fn start(fs: Arc<dyn Filesystem>, opts: ServerOptions) -> Result<Arc<Self>> {
		fs.mkdirs("log")?;
		let block_cache =
			Arc::new(BlockCache::new(opts.block_cache_min_memory, opts.block_cache_max_memory));
		let memory = MemoryTracker::new(opts.memory_limit, block_cache.clone());
		let query_cache =
			(opts.query_cache_max_memory > 0).then(|| QueryCache::new(opts.query_cache_max_memory));
		let (txn_log, states) =
			RangeTxnLog::open(fs.clone(), "log/range_txn", opts.log_roll_limit)?;
		let maintenance = MaintenanceQueue::start(opts.maintenance_threads);

		let server = Arc::new(Self {
			scanners: ScannerRegistry::new(opts.scanner_ttl),
			opts,
			fs,
			live_map: TableInfoMap::default(),
			replay_map: TableInfoMap::default(),
			root_log: RwLock::new(None),
			metadata_log: RwLock::new(None),
			user_log: RwLock::new(None),
			txn_log,
			query_cache,
			block_cache,
			memory,
			maintenance,
			app_queue: RwLock::new(None),
			clock: RevisionClock::new(),
			update_mutex_a: Mutex::new(()),
			update_mutex_b: Mutex::new(()),
			root_latch: Latch::new(),
			metadata_latch: Latch::new(),
			all_latch: Latch::new(),
			dropped_tables: Mutex::new(DroppedIds::new(50)),
			replay: Mutex::new(ReplayState { group: replay_group::USER, log: None }),
			file_ids: Arc::new(AtomicU64::new(1)),
			transfer_seq: AtomicU64::new(0),
			down: AtomicBool::new(false),
			maint_stop: Arc::new((Mutex::new(false), Condvar::new())),
			maint_thread: Mutex::new(None),
		});

		server.local_recover(states)?;
		server.spawn_maintenance_timer();
		Ok(server)
	}

	/// Wires the application queue in so memory pressure can pause it.
	pub fn set_app_queue(&self, queue: Arc<ApplicationQueue>) {
		*self.app_queue.write() = Some(queue);
	}

	pub fn options(&self) -> &ServerOptions {
		&self.opts
	}

	fn range_config(&self) -> RangeConfig {
		RangeConfig {
			split_size: self.opts.range_split_size,
			maximum_size: self.opts.range_maximum_size,
			access_group: AccessGroupConfig {
				block_size: self.opts.cell_store_block_size,
				max_files: self.opts.access_group_max_files,
				merge_files: self.opts.access_group_merge_files.min(self.opts.access_group_max_files),
				max_memory: self.opts.access_group_max_memory,
			},
		}
	}

	// ------------------------------------------------------------------
	// startup recovery

	fn local_recover(self: &Arc<Self>, states: Vec<RangeStateInfo>) -> Result<()> {
		let split_pending: Vec<(u32, RangeSpec)> = states
			.iter()
			.filter(|s| s.state.split_pending())
			.map(|s| (s.table.id, s.range.clone()))
			.collect();

		// Root, then metadata, then user: each group's ranges load into
		// the replay map, their commit log replays into it, and the map
		// merges into the live map before the matching latch opens.
		let is_root = |s: &RangeStateInfo| s.table.id == 0 && s.range.is_root(&s.table);
		self.recover_group(
			"log/root",
			&self.root_log,
			states.iter().filter(|s| is_root(s)),
		)?;
		self.root_latch.open();

		self.recover_group(
			"log/metadata",
			&self.metadata_log,
			states.iter().filter(|s| s.table.id == 0 && !is_root(s)),
		)?;
		self.metadata_latch.open();

		self.recover_group(
			"log/user",
			&self.user_log,
			states.iter().filter(|s| s.table.id != 0),
		)?;
		// The user log always exists so updates have a destination.
		if self.user_log.read().is_none() {
			*self.user_log.write() = Some(Arc::new(CommitLog::open(
				self.fs.clone(),
				"log/user",
				self.opts.log_roll_limit,
				None,
			)?));
		}
		self.all_latch.open();

		// Resume interrupted splits now that everything is live. The
		// shrink may have changed the end row; resolve by containment.
		for (table_id, spec) in split_pending {
			let range = self.live_map.get(table_id).and_then(|t| {
				t.get_range(&spec).or_else(|| t.find_containing_range(&spec.end_row))
			});
			if let Some(range) = range {
				if range.range_state().split_pending() {
					info!(range = %range.name(), "resuming interrupted split");
					self.schedule_split(range);
				}
			}
		}
		self.maintenance.wait_for_empty();
		info!("local recovery complete");
		Ok(())
	}

	fn recover_group<'a>(
		self: &Arc<Self>,
		log_dir: &str,
		slot: &RwLock<Option<Arc<CommitLog>>>,
		states: impl Iterator<Item = &'a RangeStateInfo>,
	) -> Result<()> {
		self.replay_map.clear();
		let mut loaded = 0usize;
		for info in states {
			if let Err(e) = self.replay_load_state(info) {
				error!(range = %info.range, error = %e, "failed to reload range state");
				return Err(e);
			}
			loaded += 1;
		}

		let mut reader = CommitLogReader::open(self.fs.clone(), log_dir)?;
		if loaded > 0 && !reader.is_empty() {
			let replayed = self.replay_log(&mut reader, &self.replay_map)?;
			info!(log_dir, blocks = replayed, "replayed commit log");
		}
		self.clock.advance_to(reader.latest_revision());

		if loaded > 0 || !reader.is_empty() {
			*slot.write() = Some(Arc::new(CommitLog::open(
				self.fs.clone(),
				log_dir,
				self.opts.log_roll_limit,
				Some(&reader),
			)?));
		}

		// Replay any split transfer logs still routing for these ranges
		// so split-off writes that never reached the group log return.
		for table in self.replay_map.get_all() {
			for range in table.range_vec() {
				self.reinstall_split_log(&table, &range)?;
			}
		}

		self.live_map.merge(&self.replay_map);
		Ok(())
	}

	/// For a range recovered (or reassigned) mid-split: replays the
	/// transfer log back into the range (split-off writes were durable
	/// only there) and reopens it for further routing.
	fn reinstall_split_log(&self, table_info: &Arc<TableInfo>, range: &Arc<Range>) -> Result<()> {
		let RangeState::SplitLogInstalled { transfer_log, split_row } = range.range_state() else {
			return Ok(());
		};
		let mut reader = CommitLogReader::open(self.fs.clone(), transfer_log.as_str())?;
		self.replay_into_range(&mut reader, table_info, range)?;
		self.clock.advance_to(reader.latest_revision());
		let log = Arc::new(CommitLog::open(
			self.fs.clone(),
			transfer_log.as_str(),
			self.opts.log_roll_limit,
			Some(&reader),
		)?);
		range.install_split_log(split_row, log, transfer_log);
		Ok(())
	}

	fn replay_load_state(&self, info: &RangeStateInfo) -> Result<()> {
		let schema = Arc::new(Schema::parse(&info.schema_json)?);
		let table_info = self.replay_map.get_or_insert(&info.table, schema.clone());
		if table_info.has_range(&info.range) {
			return Err(Error::RangeAlreadyLoaded(format!("{}", info.range)));
		}
		let range = Range::load(
			info.table.clone(),
			info.range.clone(),
			info.state.clone(),
			&schema,
			self.fs.clone(),
			self.block_cache.clone(),
			self.file_ids.clone(),
			&self.range_config(),
			&info.dir_token,
			None,
		)?;
		table_info.add_range(range);
		Ok(())
	}

	/// A fresh, collision-free store-directory token for a newly loaded
	/// range; persisted in the range transaction log so recovery finds
	/// the same directory.
	fn new_dir_token(&self, spec: &RangeSpec) -> String {
		format!("{}-{}", range_dir_token(&spec.end_row), now_micros())
	}

	/// Feeds every block of `reader` through the replay path, routing
	/// cells into `map`'s ranges. Cells whose range is gone are skipped
	/// with a warning.
	fn replay_log(&self, reader: &mut CommitLogReader, map: &TableInfoMap) -> Result<usize> {
		let mut blocks = 0usize;
		while let Some(block) = reader.next()? {
			let mut input = block.payload.as_slice();
			let table = TableIdentifier::decode(&mut input)?;
			let Some(table_info) = map.get(table.id) else {
				debug!(table = %table, "skipping replayed block for unknown table");
				continue;
			};
			self.apply_replay_cells(&mut input, &table_info)?;
			blocks += 1;
		}
		Ok(blocks)
	}

	fn replay_into_range(
		&self,
		reader: &mut CommitLogReader,
		table_info: &Arc<TableInfo>,
		range: &Arc<Range>,
	) -> Result<()> {
		let schema = table_info.schema();
		while let Some(block) = reader.next()? {
			let mut input = block.payload.as_slice();
			let _table = TableIdentifier::decode(&mut input)?;
			let _lock = range.lock_updates();
			while !input.is_empty() {
				let (key, value) = decode_logged_cell(&mut input)?;
				if !range.contains(key.row()) {
					continue;
				}
				let bytes = (key.len() + value.len()) as u64;
				range.add(key, value, &schema)?;
				self.memory.add(bytes);
			}
		}
		Ok(())
	}

	fn apply_replay_cells(&self, input: &mut &[u8], table_info: &Arc<TableInfo>) -> Result<()> {
		let schema = table_info.schema();
		while !input.is_empty() {
			let (key, value) = decode_logged_cell(input)?;
			let Some(range) = table_info.find_containing_range(key.row()) else {
				warn!(
					table = table_info.name(),
					row = %String::from_utf8_lossy(key.row()),
					"no range for replayed cell, skipping"
				);
				continue;
			};
			let _lock = range.lock_updates();
			let bytes = (key.len() + value.len()) as u64;
			range.add(key, value, &schema)?;
			self.memory.add(bytes);
		}
		Ok(())
	}

	// ------------------------------------------------------------------
	// latches

	fn wait_for_recovery(&self, table: &TableIdentifier, spec: Option<&RangeSpec>) {
		if table.id == 0 {
			match spec {
				Some(spec) if spec.is_root(table) => self.root_latch.wait(),
				_ => self.metadata_latch.wait(),
			}
		} else {
			self.all_latch.wait();
		}
	}

	fn check_running(&self) -> Result<()> {
		if self.down.load(Ordering::Acquire) {
			return Err(Error::ShuttingDown);
		}
		Ok(())
	}

	// ------------------------------------------------------------------
	// commit logs

	fn class_log(&self, is_root: bool, table_id: u32) -> Result<Arc<CommitLog>> {
		let slot = if is_root {
			&self.root_log
		} else if table_id == 0 {
			&self.metadata_log
		} else {
			&self.user_log
		};
		if let Some(log) = slot.read().clone() {
			return Ok(log);
		}
		let dir = if is_root {
			"log/root"
		} else if table_id == 0 {
			"log/metadata"
		} else {
			"log/user"
		};
		let mut guard = slot.write();
		if let Some(log) = guard.clone() {
			return Ok(log);
		}
		let log =
			Arc::new(CommitLog::open(self.fs.clone(), dir, self.opts.log_roll_limit, None)?);
		*guard = Some(log.clone());
		Ok(log)
	}

	// ------------------------------------------------------------------
	// load_range

	#[instrument(level = "debug", skip(self, schema_json, state))]
	pub fn load_range(
		self: &Arc<Self>,
		table: &TableIdentifier,
		spec: &RangeSpec,
		transfer_log: Option<&str>,
		schema_json: &str,
		state: RangeState,
	) -> Result<()> {
		self.check_running()?;
		if self.dropped_tables.lock().contains(table.id) {
			return Err(Error::TableDropped(table.name.clone()));
		}
		if spec.start_row >= spec.end_row {
			return Err(Error::MalformedRequest(format!("bad range interval {spec}")));
		}
		let schema = Arc::new(Schema::parse(schema_json)?);
		if schema.generation != table.generation {
			return Err(Error::GenerationMismatch {
				table: table.name.clone(),
				ours: schema.generation,
				supplied: table.generation,
			});
		}
		let is_root = spec.is_root(table);
		info!(table = %table, range = %spec, "loading range");

		let table_info = self.live_map.get_or_insert(table, schema.clone());
		if table_info.generation() < schema.generation {
			table_info.update_schema(schema.clone());
		}
		if table_info.has_range(spec) {
			return Err(Error::RangeAlreadyLoaded(format!("{table}{spec}")));
		}

		// The class log must exist before the range can take writes.
		let class_log = self.class_log(is_root, table.id)?;

		let dir_token = self.new_dir_token(spec);
		let range = Range::load(
			table.clone(),
			spec.clone(),
			state.clone(),
			&schema,
			self.fs.clone(),
			self.block_cache.clone(),
			self.file_ids.clone(),
			&self.range_config(),
			&dir_token,
			None,
		)?;

		// Adopt the transfer log a split left for us: replay it into
		// the fresh range, then link it into the class log so replay
		// after a crash still finds those cells.
		if let Some(dir) = transfer_log.filter(|d| !d.is_empty()) {
			let mut reader = CommitLogReader::open(self.fs.clone(), dir)?;
			if !reader.is_empty() {
				self.replay_into_range(&mut reader, &table_info, &range)?;
				self.clock.advance_to(reader.latest_revision());
				class_log.link_reader(&reader)?;
			}
		}

		if self.dropped_tables.lock().contains(table.id) {
			return Err(Error::TableDropped(table.name.clone()));
		}
		if table_info.has_range(spec) {
			return Err(Error::RangeAlreadyLoaded(format!("{table}{spec}")));
		}

		self.txn_log.append(&TxnEntry::RangeLoaded {
			table: table.clone(),
			schema_json: schema.to_json(),
			range: spec.clone(),
			state: state.clone(),
			dir_token,
		})?;
		table_info.add_range(range.clone());

		if state.split_pending() {
			info!(range = %range.name(), "loaded mid-split, resuming");
			self.reinstall_split_log(&table_info, &range)?;
			self.schedule_split(range);
		}
		info!(table = %table, range = %spec, "range loaded");
		Ok(())
	}

	// ------------------------------------------------------------------
	// update

	#[instrument(level = "debug", skip(self, table, cells), fields(table = %table.name))]
	pub fn update(
		self: &Arc<Self>,
		table: &TableIdentifier,
		count: u32,
		cells: &[u8],
		flags: u32,
	) -> Result<Vec<SendBack>> {
		self.check_running()?;
		if table.id == 0 {
			self.root_latch.wait();
		} else {
			self.all_latch.wait();
		}
		let sync = flags & UPDATE_FLAG_NO_LOG_SYNC == 0;

		let table_info =
			self.live_map.get(table.id).ok_or(Error::TableNotFound(table.id))?;
		table_info.verify_generation(table.generation)?;
		let schema = table_info.schema();

		let mut a_lock: Option<MutexGuard<'_, ()>> = None;
		let mut b_lock: Option<MutexGuard<'_, ()>> = None;
		let mut entered: Vec<Arc<Range>> = Vec::new();
		let mut wait_ranges: Vec<Arc<Range>> = Vec::new();
		let mut waited_metadata = table.id != 0;

		let result = (|| -> Result<Vec<SendBack>> {
			a_lock = Some(self.update_mutex_a.lock());

			struct Batch {
				range: Arc<Range>,
				cells: Vec<(CellKey, Arc<[u8]>)>,
				split_payload: Vec<u8>,
				split_log: Option<Arc<CommitLog>>,
				max_split_revision: i64,
			}

			let mut batches: Vec<Batch> = Vec::new();
			let mut send_backs: Vec<SendBack> = Vec::new();
			let mut open_segment: Option<(u32, u32, usize)> = None; // (error, count, offset)
			let mut root_payload: Vec<u8> = Vec::new();
			let mut go_payload: Vec<u8> = Vec::new();
			let mut max_revision = i64::MIN;
			let mut total_added = 0u32;
			let mut split_added = 0u32;

			let close_segment =
				|open: &mut Option<(u32, u32, usize)>, send_backs: &mut Vec<SendBack>, end: usize| {
					if let Some((error, count, offset)) = open.take() {
						send_backs.push(SendBack {
							error,
							count,
							offset: offset as u32,
							len: (end - offset) as u32,
						});
					}
				};
			let mark_bad = |open: &mut Option<(u32, u32, usize)>,
			                send_backs: &mut Vec<SendBack>,
			                error: u32,
			                offset: usize| {
				match open {
					Some((e, count, _)) if *e == error => *count += 1,
					_ => {
						close_segment(open, send_backs, offset);
						*open = Some((error, 1, offset));
					}
				}
			};

			let mut input = cells;
			while !input.is_empty() {
				let offset = cells.len() - input.len();
				let wire = match WireKeyRef::decode(&mut input) {
					Ok(wire) => wire,
					Err(e) => {
						// The stream cannot be resynced past a bad key;
						// everything remaining is rejected.
						warn!(error = %e, "malformed key in update buffer");
						close_segment(&mut open_segment, &mut send_backs, offset);
						send_backs.push(SendBack {
							error: code::BAD_KEY,
							count: count.saturating_sub(total_added),
							offset: offset as u32,
							len: (cells.len() - offset) as u32,
						});
						break;
					}
				};
				let value = match decode_bytes(&mut input) {
					Ok(value) => value,
					Err(e) => {
						warn!(error = %e, "truncated value in update buffer");
						close_segment(&mut open_segment, &mut send_backs, offset);
						send_backs.push(SendBack {
							error: code::REQUEST_TRUNCATED,
							count: count.saturating_sub(total_added),
							offset: offset as u32,
							len: (cells.len() - offset) as u32,
						});
						break;
					}
				};

				let Some(range) = table_info.find_containing_range(wire.row) else {
					mark_bad(&mut open_segment, &mut send_backs, code::OUT_OF_RANGE, offset);
					continue;
				};
				if !waited_metadata && !range.is_root() {
					self.metadata_latch.wait();
					waited_metadata = true;
				}
				let range_error = range.get_error();
				if range_error != 0 {
					mark_bad(&mut open_segment, &mut send_backs, range_error, offset);
					continue;
				}

				close_segment(&mut open_segment, &mut send_backs, offset);

				if !entered.iter().any(|r| Arc::ptr_eq(r, &range)) {
					range.update_enter();
					entered.push(range.clone());
					if range.total_size() > self.opts.range_maximum_size {
						wait_ranges.push(range.clone());
					}
				}

				// The range may have shrunk between lookup and barrier
				// entry; the row then belongs to the split-off child.
				if !range.contains(wire.row) {
					mark_bad(&mut open_segment, &mut send_backs, code::OUT_OF_RANGE, offset);
					continue;
				}

				let split = range.split_info();
				let latest = split.latest_revision;

				// Clock-skew gate for server-assigned revisions.
				if wire.revision.is_none() && latest > 0 {
					let now = now_micros();
					if now < latest && latest - now > self.opts.max_clock_skew_us {
						return Err(Error::ClockSkew {
							skew_us: latest - now,
							max_us: self.opts.max_clock_skew_us,
							range: range.name(),
						});
					}
				}

				let (key, revision, explicit) = self.transform_key(&wire)?;
				if explicit && revision < latest {
					return Err(Error::RevisionOrder {
						supplied: revision,
						latest,
						range: range.name(),
					});
				}
				max_revision = max_revision.max(revision);

				let batch = match batches.iter_mut().find(|b| Arc::ptr_eq(&b.range, &range)) {
					Some(batch) => batch,
					None => {
						batches.push(Batch {
							range: range.clone(),
							cells: Vec::new(),
							split_payload: Vec::new(),
							split_log: split.split_log.clone(),
							max_split_revision: i64::MIN,
						});
						batches.last_mut().expect("just pushed")
					}
				};

				let value: Arc<[u8]> = Arc::from(value.to_vec().into_boxed_slice());
				if split.split_off(key.row()) {
					// Split-off rows go to the transfer log so the
					// child inherits them; they still apply to this
					// range's cache until the shrink.
					if batch.split_payload.is_empty() {
						table.encode(&mut batch.split_payload);
					}
					encode_wire_full(&mut batch.split_payload, &key);
					encode_bytes(&mut batch.split_payload, &value);
					batch.max_split_revision = batch.max_split_revision.max(revision);
					split_added += 1;
				} else {
					let payload = if range.is_root() { &mut root_payload } else { &mut go_payload };
					if payload.is_empty() {
						table.encode(payload);
					}
					encode_wire_full(payload, &key);
					encode_bytes(payload, &value);
				}
				batch.cells.push((key, value));
				total_added += 1;
			}
			close_segment(&mut open_segment, &mut send_backs, cells.len());

			debug!(total_added, split_added, table = %table.name, "routed update batch");

			// Split-off cells become durable in the transfer log before
			// the main commit.
			for batch in &batches {
				if !batch.split_payload.is_empty() {
					let log = batch
						.split_log
						.as_ref()
						.ok_or_else(|| Error::Internal("split routing without log".into()))?;
					log.write(&batch.split_payload, batch.max_split_revision, true)?;
				}
			}

			b_lock = Some(self.update_mutex_b.lock());
			a_lock = None;

			if !root_payload.is_empty() {
				let log = self.class_log(true, 0)?;
				log.write(&root_payload, max_revision, true)?;
			}
			if !go_payload.is_empty() {
				let is_metadata = table.id == 0;
				let log = self.class_log(false, table.id)?;
				// Metadata commits ignore NO_LOG_SYNC: recovery order
				// depends on them being durable.
				log.write(&go_payload, max_revision, sync || is_metadata)?;
			}

			for batch in batches {
				let _lock = batch.range.lock_updates();
				let mut bytes = 0u64;
				let mut last_row: Vec<u8> = Vec::new();
				for (key, value) in batch.cells {
					bytes += (key.len() + value.len()) as u64;
					if let Some(cache) = &self.query_cache {
						if key.row() != last_row.as_slice() {
							last_row = key.row().to_vec();
							cache.invalidate_row(table.id, &last_row);
						}
					}
					batch.range.add(key, value, &schema)?;
				}
				batch.range.add_bytes_written(bytes);
				self.memory.add(bytes);
			}

			Ok(send_backs)
		})();

		drop(b_lock);
		drop(a_lock);
		for range in &entered {
			range.update_exit();
		}

		// Ranges past the hard size cap stall the writer until
		// maintenance catches up.
		for range in wait_ranges {
			warn!(range = %range.name(), "range over maximum size, stalling writer");
			self.schedule_range_maintenance(&range);
			self.maintenance.wait_for_empty();
		}
		// Only compactions are triggered inline; splits are the
		// scheduler's call, so a batch mid-flight never races a shrink
		// it caused itself.
		for range in &entered {
			self.maybe_schedule_compaction(range);
		}

		result
	}

	fn transform_key(&self, wire: &WireKeyRef<'_>) -> Result<(CellKey, i64, bool)> {
		let (timestamp, revision, explicit) = match (wire.timestamp, wire.revision) {
			(None, None) => {
				let revision = self.clock.next();
				(revision, revision, false)
			}
			(Some(timestamp), None) => (timestamp, self.clock.next(), false),
			(Some(timestamp), Some(revision)) => (timestamp, revision, true),
			(None, Some(_)) => {
				return Err(Error::BadKey("revision supplied without timestamp".into()));
			}
		};
		if explicit {
			self.clock.advance_to(revision);
		}
		// Row tombstones are normalized so they sort at the head of
		// their row.
		let (family, qualifier) = if wire.flag == flag::DELETE_ROW {
			(0, Vec::new())
		} else {
			(wire.family, wire.qualifier.to_vec())
		};
		let key = CellKey::encode(&Key {
			row: wire.row.to_vec(),
			family,
			qualifier,
			flag: wire.flag,
			timestamp,
			revision,
		})?;
		Ok((key, revision, explicit))
	}

	// ------------------------------------------------------------------
	// scans

	#[instrument(level = "debug", skip(self, scan_spec))]
	pub fn create_scanner(
		&self,
		table: &TableIdentifier,
		spec: &RangeSpec,
		scan_spec: ScanSpec,
	) -> Result<ScanResult> {
		self.check_running()?;
		self.wait_for_recovery(table, Some(spec));

		let table_info =
			self.live_map.get(table.id).ok_or(Error::TableNotFound(table.id))?;
		table_info.verify_generation(table.generation)?;

		let Some(range) = table_info.get_range(spec) else {
			// The interval no longer matches a loaded range (it split,
			// shrank or moved); the client must refresh its locator.
			return Err(Error::OutOfRange);
		};

		// Point queries may be answered straight from the query cache.
		let digest = scan_spec.cache_digest();
		let point_row = scan_spec.is_point_query().then(|| scan_spec.row_intervals[0].start.clone());
		if table.id != 0 {
			if let (Some(cache), Some(_)) = (&self.query_cache, &point_row) {
				if let Some(block) = cache.lookup(table.id, digest) {
					debug!(table = %table.name, "query cache hit");
					return Ok(ScanResult {
						eos: true,
						scanner_id: 0,
						block: block.to_vec(),
					});
				}
			}
		}

		let context = ScanContext::new(scan_spec, table_info.schema(), range.scan_revision())?;
		let mut scanner = RangeScanner::new(range, context);
		let (block, eos, cell_count) =
			fill_scan_block(&mut scanner, self.opts.scan_block_size as usize);

		let scanner_id = if eos {
			if let (Some(cache), Some(row)) = (&self.query_cache, point_row) {
				if table.id != 0 {
					cache.insert(
						table.id,
						digest,
						row,
						Arc::from(block.clone().into_boxed_slice()),
					);
				}
			}
			0
		} else {
			self.scanners.put(scanner)
		};
		debug!(cell_count, eos, scanner_id, "scanner created");
		Ok(ScanResult { eos, scanner_id, block })
	}

	pub fn fetch_scanblock(&self, scanner_id: u32) -> Result<ScanResult> {
		self.check_running()?;
		let mut scanner = self.scanners.take(scanner_id)?;
		let (block, eos, _) = fill_scan_block(&mut scanner, self.opts.scan_block_size as usize);
		if !eos {
			self.scanners.restore(scanner_id, scanner);
		}
		Ok(ScanResult { eos, scanner_id, block })
	}

	pub fn destroy_scanner(&self, scanner_id: u32) -> Result<()> {
		self.scanners.remove(scanner_id);
		Ok(())
	}

	// ------------------------------------------------------------------
	// table / range lifecycle

	pub fn drop_range(&self, table: &TableIdentifier, spec: &RangeSpec) -> Result<()> {
		self.check_running()?;
		let table_info =
			self.live_map.get(table.id).ok_or(Error::TableNotFound(table.id))?;
		let range = table_info
			.remove_range(spec)
			.ok_or_else(|| Error::RangeNotFound(format!("{table}{spec}")))?;
		let _maintenance = range.lock_maintenance();
		self.memory.subtract(range.memory_used());
		self.txn_log.append(&TxnEntry::RangeDropped { table_id: table.id, range: spec.clone() })?;
		for group in range.access_groups() {
			if let Err(e) = self.fs.rmdir(group.dir()) {
				warn!(dir = group.dir(), error = %e, "failed to remove store directory");
			}
		}
		info!(range = %range.name(), "range dropped");
		Ok(())
	}

	pub fn drop_table(&self, table: &TableIdentifier) -> Result<()> {
		self.check_running()?;
		self.all_latch.wait();
		self.dropped_tables.lock().insert(table.id);
		if let Some(table_info) = self.live_map.remove(table.id) {
			for range in table_info.range_vec() {
				// A running maintenance task finishes against its own
				// handles before the range goes away.
				let _maintenance = range.lock_maintenance();
				self.memory.subtract(range.memory_used());
				for group in range.access_groups() {
					if let Err(e) = self.fs.rmdir(group.dir()) {
						warn!(dir = group.dir(), error = %e, "failed to remove store directory");
					}
				}
			}
		} else {
			warn!(table = %table, "drop_table: table not found");
		}
		self.txn_log.append(&TxnEntry::TableDropped { table_id: table.id })?;
		info!(table = %table, "table dropped");
		Ok(())
	}

	pub fn update_schema(&self, table: &TableIdentifier, schema_json: &str) -> Result<()> {
		self.check_running()?;
		let schema = Arc::new(Schema::parse(schema_json)?);
		let table_info =
			self.live_map.get(table.id).ok_or(Error::TableNotFound(table.id))?;
		if schema.generation <= table_info.generation() {
			return Err(Error::GenerationMismatch {
				table: table.name.clone(),
				ours: table_info.generation(),
				supplied: schema.generation,
			});
		}
		table_info.update_schema(schema.clone());
		self.txn_log.append(&TxnEntry::SchemaUpdated {
			table_id: table.id,
			generation: schema.generation,
			schema_json: schema.to_json(),
		})?;
		info!(table = %table.name, generation = schema.generation, "schema updated");
		Ok(())
	}

	pub fn compact(self: &Arc<Self>, table: &TableIdentifier, spec: &RangeSpec, major: bool) -> Result<()> {
		self.check_running()?;
		self.wait_for_recovery(table, Some(spec));
		let table_info =
			self.live_map.get(table.id).ok_or(Error::TableNotFound(table.id))?;
		let range = table_info
			.get_range(spec)
			.ok_or_else(|| Error::RangeNotFound(format!("{table}{spec}")))?;
		let key = (table.id, spec.end_row.clone());
		let server = self.clone();
		let accepted = self.maintenance.schedule(key, if major { 2 } else { 1 }, move || {
			if let Err(e) = server.run_compaction(&range, major) {
				error!(error = %e, "compaction failed");
			}
		});
		debug!(major, accepted, "compaction scheduled");
		Ok(())
	}

	pub fn commit_log_sync(&self) -> Result<()> {
		self.check_running()?;
		self.all_latch.wait();
		if let Some(log) = self.user_log.read().clone() {
			log.sync()?;
		}
		Ok(())
	}

	pub fn get_statistics(&self) -> Result<Vec<u8>> {
		let mut ranges = Vec::new();
		for table in self.live_map.get_all() {
			for range in table.range_vec() {
				ranges.push(range.stats());
			}
		}
		let mut buf = Vec::new();
		encode_vu32(&mut buf, ranges.len() as u32);
		for stats in ranges {
			encode_u32(&mut buf, stats.table_id);
			encode_bytes(&mut buf, &stats.spec.start_row);
			encode_bytes(&mut buf, &stats.spec.end_row);
			encode_u8(&mut buf, match stats.state {
				RangeState::Steady => 0,
				RangeState::SplitLogInstalled { .. } => 1,
				RangeState::SplitShrunk { .. } => 2,
			});
			encode_i64(&mut buf, stats.bytes_written as i64);
			encode_i64(&mut buf, stats.bytes_read as i64);
			encode_i64(&mut buf, stats.cells_written as i64);
			encode_i64(&mut buf, stats.memory_used as i64);
			encode_i64(&mut buf, stats.disk_used as i64);
			encode_u32(&mut buf, stats.store_count as u32);
			encode_u32(&mut buf, stats.outstanding_scanners);
		}
		Ok(buf)
	}

	// ------------------------------------------------------------------
	// master-driven replay (failover)

	pub fn replay_begin(&self, group: u16) -> Result<()> {
		self.check_running()?;
		info!(group, "replay begin");
		let mut replay = self.replay.lock();
		replay.group = group;
		self.replay_map.clear();
		// Each attempt gets a fresh directory; a committed attempt's
		// fragments stay reachable through the class log's link block.
		let dir = format!("log/replay/{}", self.transfer_seq.fetch_add(1, Ordering::Relaxed));
		replay.log = Some(Arc::new(CommitLog::open(
			self.fs.clone(),
			dir,
			self.opts.log_roll_limit,
			None,
		)?));
		Ok(())
	}

	pub fn replay_load_range(
		&self,
		table: &TableIdentifier,
		spec: &RangeSpec,
		schema_json: &str,
		state: RangeState,
	) -> Result<()> {
		self.check_running()?;
		let schema = Arc::new(Schema::parse(schema_json)?);
		let table_info = self.replay_map.get_or_insert(table, schema.clone());
		if table_info.has_range(spec)
			|| self.live_map.get(table.id).is_some_and(|t| t.has_range(spec))
		{
			return Err(Error::RangeAlreadyLoaded(format!("{table}{spec}")));
		}
		let dir_token = self.new_dir_token(spec);
		let range = Range::load(
			table.clone(),
			spec.clone(),
			state.clone(),
			&schema,
			self.fs.clone(),
			self.block_cache.clone(),
			self.file_ids.clone(),
			&self.range_config(),
			&dir_token,
			None,
		)?;
		table_info.add_range(range);
		self.txn_log.append(&TxnEntry::RangeLoaded {
			table: table.clone(),
			schema_json: schema.to_json(),
			range: spec.clone(),
			state,
			dir_token,
		})?;
		info!(table = %table, range = %spec, "replay loaded range");
		Ok(())
	}

	/// Applies a stream of `[len][revision][table][cells]` segments, the
	/// form recovering masters feed from a failed server's logs. Each
	/// segment is also written to the local replay log so a crash during
	/// failover does not lose it.
	pub fn replay_update(&self, payload: &[u8]) -> Result<()> {
		self.check_running()?;
		let replay_log = self.replay.lock().log.clone();
		let mut input = payload;
		while !input.is_empty() {
			let segment_len = decode_u32(&mut input)? as usize;
			let revision = decode_i64(&mut input)?;
			if input.len() < segment_len {
				return Err(Error::Truncated("replay segment".into()));
			}
			let (segment, rest) = input.split_at(segment_len);
			input = rest;

			if let Some(log) = &replay_log {
				log.write(segment, revision, false)?;
			}
			self.clock.advance_to(revision);

			let mut cursor = segment;
			let table = TableIdentifier::decode(&mut cursor)?;
			let table_info = self
				.replay_map
				.get(table.id)
				.ok_or_else(|| Error::RangeNotFound(format!("replay table {table}")))?;
			self.apply_replay_cells(&mut cursor, &table_info)?;
		}
		Ok(())
	}

	pub fn replay_commit(&self) -> Result<()> {
		self.check_running()?;
		let (group, log) = {
			let mut replay = self.replay.lock();
			(replay.group, replay.log.take())
		};
		if let Some(log) = log {
			let class_log = match group {
				replay_group::ROOT => self.class_log(true, 0)?,
				replay_group::METADATA => self.class_log(false, 0)?,
				_ => self.class_log(false, 1)?,
			};
			class_log.link_log(&log)?;
		}
		self.live_map.merge(&self.replay_map);
		info!(group, "replay committed");
		Ok(())
	}

	// ------------------------------------------------------------------
	// maintenance

	fn spawn_maintenance_timer(self: &Arc<Self>) {
		let weak: Weak<Self> = Arc::downgrade(self);
		let stop = self.maint_stop.clone();
		let interval = self.opts.maintenance_interval;
		let handle = std::thread::Builder::new()
			.name("maintenance-timer".into())
			.spawn(move || {
				let (lock, cond) = &*stop;
				loop {
					{
						let mut stopped = lock.lock();
						if *stopped {
							return;
						}
						cond.wait_for(&mut stopped, interval);
						if *stopped {
							return;
						}
					}
					let Some(server) = weak.upgrade() else { return };
					server.do_maintenance();
				}
			})
			.expect("spawn maintenance timer");
		*self.maint_thread.lock() = Some(handle);
	}

	/// One scheduler pass: expire scanners, react to memory pressure,
	/// enqueue compactions and splits, prune the logs.
	pub fn do_maintenance(self: &Arc<Self>) {
		let purged = self.scanners.purge_expired();
		if purged > 0 {
			debug!(purged, "expired idle scanners");
		}

		if self.memory.over_limit() {
			if let Some(queue) = self.app_queue.read().clone() {
				warn!(balance = self.memory.balance(), "over memory limit, pausing application queue");
				queue.pause();
			}
		} else if let Some(queue) = self.app_queue.read().clone() {
			queue.resume();
		}

		// Per-class floors: a log may only lose fragments whose
		// revisions are all persisted in that class's cell stores.
		let mut earliest_root = i64::MAX;
		let mut earliest_metadata = i64::MAX;
		let mut earliest_user = i64::MAX;
		for table in self.live_map.get_all() {
			for range in table.range_vec() {
				let earliest = if range.is_root() {
					&mut earliest_root
				} else if range.table().id == 0 {
					&mut earliest_metadata
				} else {
					&mut earliest_user
				};
				*earliest = (*earliest).min(range.earliest_cached_revision());
				self.maybe_schedule_maintenance(&range);
			}
		}

		// All three class logs prune alike: fragments below the class
		// floor can go, within the retention floor. Past the retention
		// ceiling the floor no longer protects them.
		for (slot, earliest_cached) in [
			(&self.root_log, earliest_root),
			(&self.metadata_log, earliest_metadata),
			(&self.user_log, earliest_user),
		] {
			if earliest_cached <= 0 {
				continue;
			}
			let Some(log) = slot.read().clone() else { continue };
			let min_retained = if log.stats().total_size > self.opts.log_prune_threshold_max {
				0
			} else {
				self.opts.log_prune_threshold_min
			};
			match log.purge(earliest_cached, min_retained) {
				Ok(0) => {}
				Ok(deleted) => info!(deleted, dir = log.dir(), "pruned commit log"),
				Err(e) => warn!(dir = log.dir(), error = %e, "log prune failed"),
			}
		}
	}

	/// Blocks until every queued maintenance task has finished.
	pub fn quiesce_maintenance(&self) {
		self.maintenance.wait_for_empty();
	}

	fn split_threshold(&self, range: &Arc<Range>) -> u64 {
		if range.table().id == 0 {
			self.opts.range_metadata_split_size
		} else {
			self.opts.range_split_size
		}
	}

	fn maybe_schedule_maintenance(self: &Arc<Self>, range: &Arc<Range>) {
		if range.range_state().split_pending()
			|| range.total_size() > self.split_threshold(range)
		{
			self.schedule_split(range.clone());
			return;
		}
		self.maybe_schedule_compaction(range);
	}

	fn maybe_schedule_compaction(self: &Arc<Self>, range: &Arc<Range>) {
		let needs_minor = range.access_groups().iter().any(|g| g.needs_minor_compaction());
		let needs_merge = range.access_groups().iter().any(|g| g.needs_merging_compaction());
		if needs_minor || (self.memory.over_limit() && range.memory_used() > 0) {
			self.schedule_compaction(range.clone(), false);
		} else if needs_merge {
			let key = (range.table().id, range.spec().end_row);
			let range = range.clone();
			self.maintenance.schedule(key, 1, move || {
				let _guard = range.lock_maintenance();
				for group in range.access_groups() {
					if group.needs_merging_compaction() {
						if let Err(e) = group.merging_compaction() {
							error!(group = group.name(), error = %e, "merging compaction failed");
						}
					}
				}
			});
		}
	}

	fn schedule_range_maintenance(self: &Arc<Self>, range: &Arc<Range>) {
		if range.total_size() > self.split_threshold(range) {
			self.schedule_split(range.clone());
		} else {
			self.schedule_compaction(range.clone(), false);
		}
	}

	fn schedule_compaction(self: &Arc<Self>, range: Arc<Range>, major: bool) {
		let key = (range.table().id, range.spec().end_row);
		let server = self.clone();
		self.maintenance.schedule(key, if major { 2 } else { 1 }, move || {
			if let Err(e) = server.run_compaction(&range, major) {
				error!(range = %range.name(), error = %e, "compaction failed");
			}
		});
	}

	/// Minor or major compaction: freeze at a quiescent point, build
	/// stores with no range lock held, swap at a second quiescent point.
	/// Readers keep the pre-compaction view until the swap.
	fn run_compaction(&self, range: &Arc<Range>, major: bool) -> Result<()> {
		let _guard = range.lock_maintenance();
		range.with_updates_paused(|| {
			for group in range.access_groups() {
				group.freeze();
			}
		});

		if major {
			let mut staged = Vec::new();
			for group in range.access_groups() {
				staged.push(group.write_major_store()?);
			}
			let mut freed = 0u64;
			range.with_updates_paused(|| {
				for (group, (retired, replacement)) in
					range.access_groups().iter().zip(staged.into_iter())
				{
					freed += group.install_frozen_store(None);
					group.install_major(retired, replacement);
				}
			});
			self.memory.subtract(freed);
			info!(range = %range.name(), "major compaction complete");
		} else {
			let mut staged = Vec::new();
			for group in range.access_groups() {
				staged.push(group.write_frozen_store()?);
			}
			let mut freed = 0u64;
			range.with_updates_paused(|| {
				for (group, store) in range.access_groups().iter().zip(staged.into_iter()) {
					freed += group.install_frozen_store(store);
				}
			});
			self.memory.subtract(freed);
			info!(range = %range.name(), "minor compaction complete");
		}
		Ok(())
	}

	// ------------------------------------------------------------------
	// split

	fn schedule_split(self: &Arc<Self>, range: Arc<Range>) {
		let key = (range.table().id, range.spec().end_row);
		let server = self.clone();
		self.maintenance.schedule(key, 3, move || {
			if let Err(e) = server.run_split(&range) {
				error!(range = %range.name(), error = %e, "split failed");
			}
		});
	}

	/// Drives the split state machine from whatever state the range is
	/// in; every transition is durable in the range transaction log
	/// before it is applied, so a crash resumes exactly here.
	fn run_split(self: &Arc<Self>, range: &Arc<Range>) -> Result<()> {
		let _guard = range.lock_maintenance();
		loop {
			match range.range_state() {
				RangeState::Steady => {
					let spec = range.spec();
					let Some(split_row) = self.choose_split_row(range, &spec) else {
						debug!(range = %range.name(), "no usable split row");
						return Ok(());
					};
					let dir = format!(
						"log/transfer/{}-{}-{}",
						range.table().id,
						range_dir_token(&spec.end_row),
						self.transfer_seq.fetch_add(1, Ordering::Relaxed)
					);
					let log = Arc::new(CommitLog::open(
						self.fs.clone(),
						dir.clone(),
						self.opts.log_roll_limit,
						None,
					)?);
					self.txn_log.append(&TxnEntry::RangeStateSet {
						table_id: range.table().id,
						range: spec.clone(),
						state: RangeState::SplitLogInstalled {
							split_row: split_row.clone(),
							transfer_log: dir.clone(),
						},
					})?;
					range.install_split_log(split_row, log, dir);
				}
				RangeState::SplitLogInstalled { split_row, transfer_log } => {
					self.shrink_for_split(range, &split_row, &transfer_log)?;
				}
				RangeState::SplitShrunk { split_row, transfer_log } => {
					self.finalize_split(range, &split_row, &transfer_log)?;
					return Ok(());
				}
			}
		}
	}

	fn choose_split_row(&self, range: &Arc<Range>, spec: &RangeSpec) -> Option<Vec<u8>> {
		let mut candidate =
			range.access_groups().iter().filter_map(|g| g.split_row_candidate()).next();
		if candidate.is_none() {
			// No store index to consult; sample the middle of the
			// merged cache contents.
			let mut scanners = strata_store::MergeScanner::new(
				range.scanners(&spec.start_row, &spec.end_row),
			);
			let mut rows = Vec::new();
			let mut last: Vec<u8> = Vec::new();
			use strata_store::CellScanner;
			while let Some(entry) = scanners.next_cell() {
				if entry.key.row() != last.as_slice() {
					last = entry.key.row().to_vec();
					rows.push(last.clone());
				}
			}
			if rows.len() >= 2 {
				candidate = Some(rows[rows.len() / 2].clone());
			}
		}
		let row = candidate?;
		// The split row must cut the interval strictly.
		if row.as_slice() > spec.start_row.as_slice() && spec.contains(&row) && row != spec.end_row {
			Some(row)
		} else {
			None
		}
	}

	/// Moves the split-off half's existing cells into the transfer log,
	/// records the shrink durably, and shrinks the live interval.
	fn shrink_for_split(
		self: &Arc<Self>,
		range: &Arc<Range>,
		split_row: &[u8],
		transfer_log: &str,
	) -> Result<()> {
		let old_spec = range.spec();
		let split_log = range
			.split_info()
			.split_log
			.ok_or_else(|| Error::Internal("split state without transfer log".into()))?;
		let table = range.table().clone();

		range.with_updates_paused(|| -> Result<()> {
			// Everything above the split row, tombstones included,
			// goes to the child via the transfer log.
			use strata_store::CellScanner;
			let mut scanner = strata_store::FilteredScanner::new(
				Box::new(strata_store::MergeScanner::new(
					range.scanners(split_row, &old_spec.end_row),
				)),
				strata_store::ScanFilter { return_deletes: true, ..Default::default() },
			);
			let mut payload = Vec::new();
			let mut max_revision = i64::MIN;
			while let Some(entry) = scanner.next_cell() {
				if payload.is_empty() {
					table.encode(&mut payload);
				}
				encode_wire_full(&mut payload, &entry.key);
				encode_bytes(&mut payload, &entry.value);
				max_revision = max_revision.max(entry.key.revision());
			}
			if !payload.is_empty() {
				split_log.write(&payload, max_revision, true)?;
			}

			self.txn_log.append(&TxnEntry::RangeShrunk {
				table_id: table.id,
				old_range: old_spec.clone(),
				new_range: RangeSpec::new(old_spec.start_row.clone(), split_row.to_vec()),
				state: RangeState::SplitShrunk {
					split_row: split_row.to_vec(),
					transfer_log: transfer_log.to_string(),
				},
			})?;
			let (_, freed) = range.shrink_to(split_row);
			self.memory.subtract(freed);
			Ok(())
		})
	}

	/// Links the transfer log into the class commit log and returns the
	/// range to steady state. The child `(split_row, old_end]` is the
	/// master's to assign, with the transfer log directory as its
	/// inheritance.
	fn finalize_split(
		self: &Arc<Self>,
		range: &Arc<Range>,
		split_row: &[u8],
		transfer_log: &str,
	) -> Result<()> {
		let class_log = self.class_log(range.is_root(), range.table().id)?;
		if let Some(split_log) = range.split_info().split_log {
			class_log.link_log(&split_log)?;
		} else {
			let mut reader = CommitLogReader::open(self.fs.clone(), transfer_log)?;
			while reader.next()?.is_some() {}
			class_log.link_reader(&reader)?;
		}
		let new_spec = range.spec();
		self.txn_log.append(&TxnEntry::RangeStateSet {
			table_id: range.table().id,
			range: new_spec.clone(),
			state: RangeState::Steady,
		})?;
		range.finish_split();
		info!(
			range = %range.name(),
			split_row = %String::from_utf8_lossy(split_row),
			transfer_log,
			"split complete; child awaits assignment"
		);
		Ok(())
	}

	// ------------------------------------------------------------------
	// shutdown

	pub fn close(&self) -> Result<()> {
		if self.down.swap(true, Ordering::AcqRel) {
			return Ok(());
		}
		info!("range server closing");
		{
			let (lock, cond) = &*self.maint_stop;
			*lock.lock() = true;
			cond.notify_all();
		}
		if let Some(handle) = self.maint_thread.lock().take() {
			let _ = handle.join();
		}
		self.maintenance.shutdown();

		// Drain in-flight updates.
		let _a = self.update_mutex_a.lock();
		let _b = self.update_mutex_b.lock();

		for slot in [&self.root_log, &self.metadata_log, &self.user_log] {
			if let Some(log) = slot.read().clone() {
				log.close()?;
			}
		}
		self.txn_log.close()?;
		info!("range server closed");
		Ok(())
	}

	pub fn is_down(&self) -> bool {
		self.down.load(Ordering::Acquire)
	}
}

impl Drop for RangeServer {
	fn drop(&mut self) {
		let (lock, cond) = &*self.maint_stop;
		*lock.lock() = true;
		cond.notify_all();
		if let Some(handle) = self.maint_thread.lock().take() {
			let _ = handle.join();
		}
		self.maintenance.shutdown();
	}
}

fn decode_logged_cell(input: &mut &[u8]) -> Result<(CellKey, Arc<[u8]>)> {
	let wire = WireKeyRef::decode(input)?;
	let (Some(timestamp), Some(revision)) = (wire.timestamp, wire.revision) else {
		return Err(Error::BadKey("logged cell missing timestamp or revision".into()));
	};
	let key = CellKey::encode(&Key {
		row: wire.row.to_vec(),
		family: wire.family,
		qualifier: wire.qualifier.to_vec(),
		flag: wire.flag,
		timestamp,
		revision,
	})?;
	let value = decode_bytes(input)?;
	Ok((key, Arc::from(value.to_vec().into_boxed_slice())))
}
