// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 StrataDB

//! The scanner stack. Every source of cells (cache, frozen cache, cell
//! store) pulls `(key, value)` pairs in table order through one trait; a
//! merge scanner composes sources through a heap, and a filtering
//! scanner applies the MVCC revision ceiling, delete-marker shadowing,
//! version limits and time bounds.

use std::{
	cmp::{Ordering, Reverse},
	collections::BinaryHeap,
	sync::Arc,
};

use strata_core::{CellKey, key::flag};

#[derive(Debug, Clone)]
pub struct CellEntry {
	pub key: CellKey,
	pub value: Arc<[u8]>,
}

/// Pull the next cell in table order; `None` reports end of scan.
pub trait CellScanner: Send {
	fn next_cell(&mut self) -> Option<CellEntry>;
}

struct HeapItem {
	entry: CellEntry,
	source: usize,
}

impl PartialEq for HeapItem {
	fn eq(&self, other: &Self) -> bool {
		self.entry.key == other.entry.key && self.source == other.source
	}
}
impl Eq for HeapItem {}
impl PartialOrd for HeapItem {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}
impl Ord for HeapItem {
	fn cmp(&self, other: &Self) -> Ordering {
		// Key order first; newer sources (lower index) win ties so a
		// cache entry shadows an identical stored key.
		self.entry.key.cmp(&other.entry.key).then(self.source.cmp(&other.source))
	}
}

/// Merges sub-scanners, each already sorted, into one sorted stream.
/// Exact duplicate keys (same cell at the same revision reachable through
/// both a cache and a store) collapse to the newest source's entry.
pub struct MergeScanner {
	scanners: Vec<Box<dyn CellScanner>>,
	heap: BinaryHeap<Reverse<HeapItem>>,
	last_key: Option<CellKey>,
}

impl MergeScanner {
	/// `scanners` ordered newest source first.
	pub fn new(scanners: Vec<Box<dyn CellScanner>>) -> Self {
		let mut merge = Self { scanners, heap: BinaryHeap::new(), last_key: None };
		for source in 0..merge.scanners.len() {
			merge.refill(source);
		}
		merge
	}

	fn refill(&mut self, source: usize) {
		if let Some(entry) = self.scanners[source].next_cell() {
			self.heap.push(Reverse(HeapItem { entry, source }));
		}
	}
}

impl CellScanner for MergeScanner {
	fn next_cell(&mut self) -> Option<CellEntry> {
		loop {
			let Reverse(item) = self.heap.pop()?;
			self.refill(item.source);
			if self.last_key.as_ref() == Some(&item.entry.key) {
				continue; // duplicate of the entry just emitted
			}
			self.last_key = Some(item.entry.key.clone());
			return Some(item.entry);
		}
	}
}

/// MVCC and tombstone semantics applied over a merged stream.
#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
	/// Cells with revision above this are invisible (scanner snapshot).
	/// 0 disables the ceiling.
	pub revision_ceiling: i64,
	/// Half-open `[start, end)` timestamp bounds on returned inserts.
	pub time_interval: Option<(i64, i64)>,
	/// Newest versions kept per cell; 0 keeps all.
	pub max_versions: u32,
	/// Pass delete markers through instead of consuming them (used when
	/// compactions below the top level must preserve tombstones).
	pub return_deletes: bool,
}

pub struct FilteredScanner {
	inner: Box<dyn CellScanner>,
	filter: ScanFilter,
	row: Vec<u8>,
	row_delete_ts: Option<i64>,
	family: u8,
	family_delete_ts: Option<i64>,
	column: Vec<u8>,
	cell_delete_ts: Option<i64>,
	versions: u32,
}

impl FilteredScanner {
	pub fn new(inner: Box<dyn CellScanner>, filter: ScanFilter) -> Self {
		Self {
			inner,
			filter,
			row: Vec::new(),
			row_delete_ts: None,
			family: 0,
			family_delete_ts: None,
			column: Vec::new(),
			cell_delete_ts: None,
			versions: 0,
		}
	}

	fn shadowed(&self, timestamp: i64) -> bool {
		[self.row_delete_ts, self.family_delete_ts, self.cell_delete_ts]
			.into_iter()
			.flatten()
			.any(|marker_ts| timestamp <= marker_ts)
	}
}

impl CellScanner for FilteredScanner {
	fn next_cell(&mut self) -> Option<CellEntry> {
		loop {
			let entry = self.inner.next_cell()?;
			let key = &entry.key;
			if self.filter.revision_ceiling != 0 && key.revision() > self.filter.revision_ceiling {
				continue;
			}

			if key.row() != self.row.as_slice() {
				self.row = key.row().to_vec();
				self.row_delete_ts = None;
				self.family = key.family();
				self.family_delete_ts = None;
				self.column = key.column_prefix().to_vec();
				self.cell_delete_ts = None;
				self.versions = 0;
			} else if key.family() != self.family {
				self.family = key.family();
				self.family_delete_ts = None;
				self.column = key.column_prefix().to_vec();
				self.cell_delete_ts = None;
				self.versions = 0;
			} else if key.column_prefix() != self.column.as_slice() {
				self.column = key.column_prefix().to_vec();
				self.cell_delete_ts = None;
				self.versions = 0;
			}

			let timestamp = key.timestamp();
			match key.flag() {
				flag::DELETE_ROW => {
					self.row_delete_ts = Some(self.row_delete_ts.unwrap_or(i64::MIN).max(timestamp));
					if self.filter.return_deletes {
						return Some(entry);
					}
				}
				flag::DELETE_COLUMN_FAMILY => {
					self.family_delete_ts =
						Some(self.family_delete_ts.unwrap_or(i64::MIN).max(timestamp));
					if self.filter.return_deletes {
						return Some(entry);
					}
				}
				flag::DELETE_CELL => {
					self.cell_delete_ts =
						Some(self.cell_delete_ts.unwrap_or(i64::MIN).max(timestamp));
					if self.filter.return_deletes {
						return Some(entry);
					}
				}
				_ => {
					if self.shadowed(timestamp) {
						continue;
					}
					if self.filter.max_versions > 0 && self.versions >= self.filter.max_versions {
						continue;
					}
					if let Some((start, end)) = self.filter.time_interval {
						if timestamp < start || timestamp >= end {
							continue;
						}
					}
					self.versions += 1;
					return Some(entry);
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use strata_core::key::Key;

	use crate::cell_cache::CellCache;

	use super::*;

	fn insert(cache: &Arc<CellCache>, row: &str, family: u8, qualifier: &str, ts: i64, value: &str) {
		let key = CellKey::encode(&Key {
			row: row.as_bytes().to_vec(),
			family,
			qualifier: qualifier.as_bytes().to_vec(),
			flag: flag::INSERT,
			timestamp: ts,
			revision: ts,
		})
		.unwrap();
		cache.insert(key, Arc::from(value.as_bytes().to_vec().into_boxed_slice()));
	}

	fn delete(cache: &Arc<CellCache>, row: &str, family: u8, qualifier: &str, ts: i64, delete_flag: u8) {
		let key = CellKey::encode(&Key {
			row: row.as_bytes().to_vec(),
			family: if delete_flag == flag::DELETE_ROW { 0 } else { family },
			qualifier: if delete_flag == flag::DELETE_CELL {
				qualifier.as_bytes().to_vec()
			} else {
				Vec::new()
			},
			flag: delete_flag,
			timestamp: ts,
			revision: ts,
		})
		.unwrap();
		cache.insert(key, Arc::from(Vec::new().into_boxed_slice()));
	}

	fn collect(scanner: impl CellScanner) -> Vec<(String, i64, String)> {
		let mut scanner = scanner;
		let mut out = Vec::new();
		while let Some(entry) = scanner.next_cell() {
			out.push((
				String::from_utf8_lossy(entry.key.row()).into_owned(),
				entry.key.timestamp(),
				String::from_utf8_lossy(&entry.value).into_owned(),
			));
		}
		out
	}

	fn filtered(cache: &Arc<CellCache>, filter: ScanFilter) -> FilteredScanner {
		FilteredScanner::new(Box::new(cache.scanner(b"", b"")), filter)
	}

	#[test]
	fn merge_keeps_global_order() {
		let newer = CellCache::new();
		let older = CellCache::new();
		insert(&newer, "b", 1, "q", 10, "b-new");
		insert(&older, "a", 1, "q", 5, "a-old");
		insert(&older, "c", 1, "q", 5, "c-old");

		let merge = MergeScanner::new(vec![
			Box::new(newer.scanner(b"", b"")),
			Box::new(older.scanner(b"", b"")),
		]);
		let rows: Vec<String> = collect(merge).into_iter().map(|(row, _, _)| row).collect();
		assert_eq!(rows, vec!["a", "b", "c"]);
	}

	#[test]
	fn merge_collapses_exact_duplicates() {
		let a = CellCache::new();
		let b = CellCache::new();
		insert(&a, "dup", 1, "q", 9, "from-a");
		insert(&b, "dup", 1, "q", 9, "from-b");

		let merge =
			MergeScanner::new(vec![Box::new(a.scanner(b"", b"")), Box::new(b.scanner(b"", b""))]);
		let cells = collect(merge);
		assert_eq!(cells.len(), 1);
		assert_eq!(cells[0].2, "from-a");
	}

	#[test]
	fn delete_cell_shadows_older_inserts_only() {
		let cache = CellCache::new();
		insert(&cache, "r", 1, "q", 10, "old");
		insert(&cache, "r", 1, "q", 30, "new");
		delete(&cache, "r", 1, "q", 20, flag::DELETE_CELL);

		let cells = collect(filtered(&cache, ScanFilter::default()));
		assert_eq!(cells.len(), 1);
		assert_eq!(cells[0].1, 30);
	}

	#[test]
	fn delete_row_shadows_every_family() {
		let cache = CellCache::new();
		insert(&cache, "r", 1, "q", 10, "a");
		insert(&cache, "r", 2, "z", 15, "b");
		insert(&cache, "r", 2, "z", 25, "survives");
		delete(&cache, "r", 0, "", 20, flag::DELETE_ROW);

		let cells = collect(filtered(&cache, ScanFilter::default()));
		assert_eq!(cells.len(), 1);
		assert_eq!(cells[0].1, 25);
	}

	#[test]
	fn delete_family_shadows_only_that_family() {
		let cache = CellCache::new();
		insert(&cache, "r", 1, "q", 10, "doomed");
		insert(&cache, "r", 2, "q", 10, "kept");
		delete(&cache, "r", 1, "", 50, flag::DELETE_COLUMN_FAMILY);

		let cells = collect(filtered(&cache, ScanFilter::default()));
		assert_eq!(cells.len(), 1);
		assert_eq!(cells[0].2, "kept");
	}

	#[test]
	fn revision_ceiling_hides_later_writes() {
		let cache = CellCache::new();
		insert(&cache, "r", 1, "q", 10, "visible");
		insert(&cache, "r", 1, "q", 99, "future");

		let cells =
			collect(filtered(&cache, ScanFilter { revision_ceiling: 50, ..Default::default() }));
		assert_eq!(cells.len(), 1);
		assert_eq!(cells[0].2, "visible");
	}

	#[test]
	fn max_versions_keeps_newest() {
		let cache = CellCache::new();
		for ts in [10, 20, 30, 40] {
			insert(&cache, "r", 1, "q", ts, &format!("v{ts}"));
		}
		let cells = collect(filtered(&cache, ScanFilter { max_versions: 2, ..Default::default() }));
		let timestamps: Vec<i64> = cells.iter().map(|(_, ts, _)| *ts).collect();
		assert_eq!(timestamps, vec![40, 30]);
	}

	#[test]
	fn time_interval_bounds_are_half_open() {
		let cache = CellCache::new();
		for ts in [10, 20, 30] {
			insert(&cache, "r", 1, "q", ts, &format!("v{ts}"));
		}
		let cells = collect(filtered(
			&cache,
			ScanFilter { time_interval: Some((10, 30)), ..Default::default() },
		));
		let timestamps: Vec<i64> = cells.iter().map(|(_, ts, _)| *ts).collect();
		assert_eq!(timestamps, vec![20, 10]);
	}

	#[test]
	fn return_deletes_passes_markers_through() {
		let cache = CellCache::new();
		insert(&cache, "r", 1, "q", 10, "old");
		delete(&cache, "r", 1, "q", 20, flag::DELETE_CELL);

		let cells = collect(filtered(&cache, ScanFilter { return_deletes: true, ..Default::default() }));
		// Marker plus nothing else: the insert is still shadowed.
		assert_eq!(cells.len(), 1);
		assert_eq!(cells[0].1, 20);
	}
}
