// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 StrataDB

//! Range transaction log: the local authority for range lifecycle. Every
//! load, split transition and drop is recorded here synchronously, so a
//! restarting server can rebuild its range map before replaying commit
//! logs.

use std::{
	collections::HashMap,
	sync::{
		Arc,
		atomic::{AtomicI64, Ordering},
	},
};

use serde::{Deserialize, Serialize};
use strata_fs::Filesystem;
use tracing::warn;

use strata_core::{Error, RangeSpec, RangeState, Result, TableIdentifier};

use crate::{reader::CommitLogReader, writer::CommitLog};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TxnEntry {
	RangeLoaded {
		table: TableIdentifier,
		schema_json: String,
		range: RangeSpec,
		state: RangeState,
		/// Directory token for the range's cell stores; unique per load
		/// so a reloaded or split range never adopts a predecessor's
		/// files.
		dir_token: String,
	},
	/// Split-state transition that leaves the row interval unchanged.
	RangeStateSet {
		table_id: u32,
		range: RangeSpec,
		state: RangeState,
	},
	/// The parent range shrank to `new_range` as part of a split.
	RangeShrunk {
		table_id: u32,
		old_range: RangeSpec,
		new_range: RangeSpec,
		state: RangeState,
	},
	RangeDropped {
		table_id: u32,
		range: RangeSpec,
	},
	TableDropped {
		table_id: u32,
	},
	SchemaUpdated {
		table_id: u32,
		generation: u32,
		schema_json: String,
	},
}

/// Folded per-range state after reading the whole log.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeStateInfo {
	pub table: TableIdentifier,
	pub schema_json: String,
	pub range: RangeSpec,
	pub state: RangeState,
	pub dir_token: String,
}

/// Appends lifecycle entries durably; reads fold the entry sequence into
/// the latest per-range state.
pub struct RangeTxnLog {
	log: CommitLog,
	seq: AtomicI64,
}

impl RangeTxnLog {
	/// Reads any existing entries, folds them, and reopens the log for
	/// appending. Returns the surviving range states.
	pub fn open(
		fs: Arc<dyn Filesystem>,
		dir: impl Into<String>,
		roll_limit: u64,
	) -> Result<(Self, Vec<RangeStateInfo>)> {
		let dir = dir.into();
		let mut reader = CommitLogReader::open(fs.clone(), dir.clone())?;
		let mut map: HashMap<(u32, Vec<u8>), RangeStateInfo> = HashMap::new();
		while let Some(block) = reader.next()? {
			let entry: TxnEntry = bincode::deserialize(&block.payload)
				.map_err(|e| Error::MalformedRequest(format!("range txn entry: {e}")))?;
			Self::fold(&mut map, entry);
		}
		let seq = reader.latest_revision() + 1;
		let log = CommitLog::open(fs, dir, roll_limit, Some(&reader))?;
		let states = map.into_values().collect();
		Ok((Self { log, seq: AtomicI64::new(seq) }, states))
	}

	fn fold(map: &mut HashMap<(u32, Vec<u8>), RangeStateInfo>, entry: TxnEntry) {
		match entry {
			TxnEntry::RangeLoaded { table, schema_json, range, state, dir_token } => {
				let key = (table.id, range.end_row.clone());
				map.insert(key, RangeStateInfo { table, schema_json, range, state, dir_token });
			}
			TxnEntry::RangeStateSet { table_id, range, state } => {
				match map.get_mut(&(table_id, range.end_row.clone())) {
					Some(info) => info.state = state,
					None => warn!(table_id, %range, "state entry for unknown range"),
				}
			}
			TxnEntry::RangeShrunk { table_id, old_range, new_range, state } => {
				match map.remove(&(table_id, old_range.end_row.clone())) {
					Some(mut info) => {
						info.range = new_range.clone();
						info.state = state;
						map.insert((table_id, new_range.end_row), info);
					}
					None => warn!(table_id, %old_range, "shrink entry for unknown range"),
				}
			}
			TxnEntry::RangeDropped { table_id, range } => {
				map.remove(&(table_id, range.end_row));
			}
			TxnEntry::TableDropped { table_id } => {
				map.retain(|(tid, _), _| *tid != table_id);
			}
			TxnEntry::SchemaUpdated { table_id, generation, schema_json } => {
				for info in map.values_mut() {
					if info.table.id == table_id {
						info.table.generation = generation;
						info.schema_json = schema_json.clone();
					}
				}
			}
		}
	}

	/// Appends one entry with a synchronous write; returning `Ok` means
	/// the transition is durable.
	pub fn append(&self, entry: &TxnEntry) -> Result<()> {
		let payload = bincode::serialize(entry)
			.map_err(|e| Error::Internal(format!("serialize range txn entry: {e}")))?;
		let seq = self.seq.fetch_add(1, Ordering::SeqCst);
		self.log.write(&payload, seq, true)
	}

	pub fn close(&self) -> Result<()> {
		self.log.close()
	}
}
