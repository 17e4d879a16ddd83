// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 StrataDB

//! Server-side scanners: the scan context compiled from a scan spec, the
//! per-range cursor producing matching cells, the scan-block packer, and
//! the TTL-bounded registry clients resume scans through.

use std::{
	collections::HashMap,
	sync::{
		Arc,
		atomic::{AtomicU32, Ordering},
	},
	time::{Duration, Instant},
};

use parking_lot::Mutex;
use regex::bytes::Regex;
use tracing::debug;

use strata_core::{
	Error, Result, ScanSpec,
	key::encode_wire_full,
	util::encoding::encode_bytes,
};
use strata_store::{CellEntry, CellScanner, FilteredScanner, MergeScanner, ScanFilter};

use crate::{range::Range, schema::Schema};

/// Predicates compiled once per scanner.
pub struct ScanContext {
	pub spec: ScanSpec,
	pub schema: Arc<Schema>,
	pub scan_revision: i64,
	row_regex: Option<Regex>,
	value_regex: Option<Regex>,
}

impl ScanContext {
	pub fn new(spec: ScanSpec, schema: Arc<Schema>, scan_revision: i64) -> Result<Self> {
		if spec.row_intervals.len() > 1 {
			return Err(Error::BadScanSpec("can only scan one row interval".into()));
		}
		if spec.cell_intervals.len() > 1 {
			return Err(Error::BadScanSpec("can only scan one cell interval".into()));
		}
		if !spec.row_intervals.is_empty() && !spec.cell_intervals.is_empty() {
			return Err(Error::BadScanSpec("both row and cell intervals defined".into()));
		}
		for family in &spec.columns {
			if schema.family(*family).is_none() {
				return Err(Error::BadScanSpec(format!("unknown column family {family}")));
			}
		}
		let row_regex = spec
			.row_regex
			.as_deref()
			.map(Regex::new)
			.transpose()
			.map_err(|e| Error::BadScanSpec(format!("row regex: {e}")))?;
		let value_regex = spec
			.value_regex
			.as_deref()
			.map(Regex::new)
			.transpose()
			.map_err(|e| Error::BadScanSpec(format!("value regex: {e}")))?;
		Ok(Self { spec, schema, scan_revision, row_regex, value_regex })
	}

	/// The row interval the scan touches, `(start, end]`-shaped against
	/// range bounds: `(start_exclusive, end_inclusive)`.
	fn seek_bounds(&self) -> (Vec<u8>, Vec<u8>) {
		if let Some(ri) = self.spec.row_intervals.first() {
			// Underlying scanners treat the start bound as exclusive.
			// For an inclusive start we seek from the start row minus
			// its last byte (a strict predecessor prefix); rows landing
			// between it and the start row are dropped by the per-cell
			// check below.
			let start = if ri.start.is_empty() {
				Vec::new()
			} else if ri.start_inclusive {
				ri.start[..ri.start.len() - 1].to_vec()
			} else {
				ri.start.clone()
			};
			// An exclusive end is trimmed by the per-cell check.
			return (start, ri.end.clone());
		}
		if let Some(ci) = self.spec.cell_intervals.first() {
			return (Vec::new(), ci.end_row.clone());
		}
		(Vec::new(), Vec::new())
	}

	fn matches(&self, entry: &CellEntry) -> bool {
		let row = entry.key.row();
		if let Some(ri) = self.spec.row_intervals.first() {
			if !ri.contains(row) {
				return false;
			}
		}
		if let Some(ci) = self.spec.cell_intervals.first() {
			let key = entry.key.decode().expect("stored keys are valid");
			if !ci.contains(&key.row, key.family, &key.qualifier) {
				return false;
			}
		}
		if !self.spec.columns.is_empty() && !self.spec.columns.contains(&entry.key.family()) {
			return false;
		}
		if let Some(regex) = &self.row_regex {
			if !regex.is_match(row) {
				return false;
			}
		}
		if let Some(regex) = &self.value_regex {
			if !regex.is_match(&entry.value) {
				return false;
			}
		}
		true
	}

	/// True when no later row can match, allowing early termination.
	fn past_end(&self, row: &[u8]) -> bool {
		if let Some(ri) = self.spec.row_intervals.first() {
			return ri.ends_before(row);
		}
		if let Some(ci) = self.spec.cell_intervals.first() {
			if !ci.end_row.is_empty() {
				return row > ci.end_row.as_slice();
			}
		}
		false
	}
}

/// Server-held cursor over one range.
pub struct RangeScanner {
	range: Arc<Range>,
	context: ScanContext,
	inner: FilteredScanner,
	rows_returned: u32,
	cells_returned: u32,
	last_row: Vec<u8>,
	done: bool,
}

impl RangeScanner {
	pub fn new(range: Arc<Range>, context: ScanContext) -> Self {
		let (start, end) = context.seek_bounds();
		// A per-family version limit composes with the scan spec's only
		// when the scan targets a single family; mixed-family scans
		// rely on the scan spec's limit alone.
		let family_max_versions = match context.spec.columns.as_slice() {
			[family] => context.schema.family(*family).map(|f| f.max_versions).unwrap_or(0),
			_ => 0,
		};
		let max_versions = match (context.spec.max_versions, family_max_versions) {
			(0, fam) => fam,
			(spec, 0) => spec,
			(spec, fam) => spec.min(fam),
		};
		let merge = MergeScanner::new(range.scanners(&start, &end));
		let inner = FilteredScanner::new(
			Box::new(merge),
			ScanFilter {
				revision_ceiling: context.scan_revision,
				time_interval: context.spec.time_interval.map(|ti| (ti.start, ti.end)),
				max_versions,
				return_deletes: context.spec.return_deletes,
			},
		);
		range.increment_scanner_count();
		Self {
			range,
			context,
			inner,
			rows_returned: 0,
			cells_returned: 0,
			last_row: Vec::new(),
			done: false,
		}
	}

	fn next_match(&mut self) -> Option<CellEntry> {
		if self.done {
			return None;
		}
		loop {
			let Some(entry) = self.inner.next_cell() else {
				self.done = true;
				return None;
			};
			let row = entry.key.row();
			if self.context.past_end(row) {
				self.done = true;
				return None;
			}
			let new_row = row != self.last_row.as_slice();
			if new_row {
				if self.context.spec.row_limit > 0 && self.rows_returned >= self.context.spec.row_limit
				{
					self.done = true;
					return None;
				}
			}
			if !self.context.matches(&entry) {
				continue;
			}
			if new_row {
				self.rows_returned += 1;
				self.last_row = row.to_vec();
			}
			if self.context.spec.cell_limit > 0 && self.cells_returned >= self.context.spec.cell_limit
			{
				self.done = true;
				return None;
			}
			self.cells_returned += 1;
			return Some(entry);
		}
	}
}

impl Drop for RangeScanner {
	fn drop(&mut self) {
		self.range.decrement_scanner_count();
	}
}

/// Packs cells into an encoded scan block until the byte budget or end
/// of scan. Returns `(block, reached_end, cell_count)`.
pub fn fill_scan_block(scanner: &mut RangeScanner, byte_budget: usize) -> (Vec<u8>, bool, usize) {
	let mut block = Vec::new();
	let mut count = 0;
	while block.len() < byte_budget {
		let Some(entry) = scanner.next_match() else {
			scanner.range.add_bytes_read(block.len() as u64);
			return (block, true, count);
		};
		encode_wire_full(&mut block, &entry.key);
		encode_bytes(&mut block, &entry.value);
		count += 1;
	}
	scanner.range.add_bytes_read(block.len() as u64);
	(block, false, count)
}

struct RegistryEntry {
	scanner: RangeScanner,
	last_used: Instant,
}

/// Integer-id registry of open scanners; idle scanners expire after the
/// TTL, refreshed by every fetch.
pub struct ScannerRegistry {
	map: Mutex<HashMap<u32, RegistryEntry>>,
	next_id: AtomicU32,
	ttl: Duration,
}

impl ScannerRegistry {
	pub fn new(ttl: Duration) -> Self {
		Self { map: Mutex::new(HashMap::new()), next_id: AtomicU32::new(1), ttl }
	}

	pub fn put(&self, scanner: RangeScanner) -> u32 {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		self.map.lock().insert(id, RegistryEntry { scanner, last_used: Instant::now() });
		id
	}

	/// Takes the scanner out for a fetch; `restore` puts it back.
	pub fn take(&self, id: u32) -> Result<RangeScanner> {
		self.map
			.lock()
			.remove(&id)
			.map(|entry| entry.scanner)
			.ok_or(Error::InvalidScannerId(id))
	}

	pub fn restore(&self, id: u32, scanner: RangeScanner) {
		self.map.lock().insert(id, RegistryEntry { scanner, last_used: Instant::now() });
	}

	pub fn remove(&self, id: u32) -> bool {
		self.map.lock().remove(&id).is_some()
	}

	pub fn purge_expired(&self) -> usize {
		let now = Instant::now();
		let mut map = self.map.lock();
		let before = map.len();
		map.retain(|id, entry| {
			let keep = now.duration_since(entry.last_used) < self.ttl;
			if !keep {
				debug!(scanner_id = id, "expiring idle scanner");
			}
			keep
		});
		before - map.len()
	}

	pub fn len(&self) -> usize {
		self.map.lock().len()
	}
}
