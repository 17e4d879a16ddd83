// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 StrataDB

use std::{
	ops::Bound,
	sync::{
		Arc,
		atomic::{AtomicU64, Ordering},
	},
};

use crossbeam_skiplist::SkipMap;

use strata_core::CellKey;

use crate::scanner::{CellEntry, CellScanner};

/// Rough per-entry bookkeeping overhead added to the accounted memory.
const ENTRY_OVERHEAD: u64 = 64;

/// In-memory ordered map over serialized cell keys: the hot write set of
/// one access group. Inserts are concurrent; iteration yields table
/// order. A cache is frozen by swapping a fresh one in at the access
/// group and keeping this one read-only until its successor cell store
/// exists.
#[derive(Debug)]
pub struct CellCache {
	map: SkipMap<CellKey, Arc<[u8]>>,
	memory: AtomicU64,
	/// Smallest revision inserted; bounds what log prune may discard.
	earliest_revision: AtomicU64,
}

impl CellCache {
	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			map: SkipMap::new(),
			memory: AtomicU64::new(0),
			earliest_revision: AtomicU64::new(i64::MAX as u64),
		})
	}

	pub fn insert(&self, key: CellKey, value: Arc<[u8]>) {
		let bytes = key.len() as u64 + value.len() as u64 + ENTRY_OVERHEAD;
		let revision = key.revision();
		self.map.insert(key, value);
		self.memory.fetch_add(bytes, Ordering::Relaxed);
		self.earliest_revision.fetch_min(revision as u64, Ordering::Relaxed);
	}

	pub fn len(&self) -> usize {
		self.map.len()
	}

	pub fn is_empty(&self) -> bool {
		self.map.is_empty()
	}

	pub fn memory_used(&self) -> u64 {
		self.memory.load(Ordering::Relaxed)
	}

	pub fn earliest_revision(&self) -> i64 {
		let raw = self.earliest_revision.load(Ordering::Relaxed) as i64;
		if raw == i64::MAX { i64::MAX } else { raw }
	}

	/// Removes every entry whose row sorts after `row`, returning the
	/// bytes freed. Used when a range shrinks and the tail now belongs
	/// to the split-off child.
	pub fn remove_rows_above(&self, row: &[u8]) -> u64 {
		let mut seek = row.to_vec();
		seek.push(0x01);
		let bound = CellKey::raw_for_seek(seek);
		let mut freed = 0u64;
		while let Some(entry) = self.map.lower_bound(Bound::Included(&bound)) {
			freed += entry.key().len() as u64 + entry.value().len() as u64 + ENTRY_OVERHEAD;
			entry.remove();
		}
		self.memory.fetch_sub(freed, Ordering::Relaxed);
		freed
	}

	/// Scanner over `(start_row, end_row]`; an empty `end_row` means
	/// unbounded.
	pub fn scanner(self: &Arc<Self>, start_row: &[u8], end_row: &[u8]) -> CellCacheScanner {
		CellCacheScanner {
			cache: self.clone(),
			position: if start_row.is_empty() {
				Position::Start
			} else {
				// Seek strictly past every key of start_row itself:
				// row NUL is the smallest prefix of that row's keys,
				// so the successor of `start_row 0xff...` suffices;
				// we use the row bytes with a trailing 0x01 which
				// sorts after `row NUL ...` for any components.
				Position::AfterRow(start_row.to_vec())
			},
			end_row: if end_row.is_empty() { None } else { Some(end_row.to_vec()) },
		}
	}
}

enum Position {
	Start,
	/// Resume strictly after every key whose row equals the held row.
	AfterRow(Vec<u8>),
	After(CellKey),
	Done,
}

pub struct CellCacheScanner {
	cache: Arc<CellCache>,
	position: Position,
	end_row: Option<Vec<u8>>,
}

impl CellScanner for CellCacheScanner {
	fn next_cell(&mut self) -> Option<CellEntry> {
		let entry = match &self.position {
			Position::Start => self.cache.map.front(),
			Position::AfterRow(row) => {
				// `row 0x01` sorts after `row NUL <anything>` and
				// before the next distinct row.
				let mut seek = row.clone();
				seek.push(0x01);
				let seek = CellKey::raw_for_seek(seek);
				self.cache.map.lower_bound(Bound::Included(&seek))
			}
			Position::After(key) => self.cache.map.lower_bound(Bound::Excluded(key)),
			Position::Done => None,
		}?;

		let key = entry.key().clone();
		if let Some(end_row) = &self.end_row {
			if key.row() > end_row.as_slice() {
				self.position = Position::Done;
				return None;
			}
		}
		let value = entry.value().clone();
		self.position = Position::After(key.clone());
		Some(CellEntry { key, value })
	}
}
