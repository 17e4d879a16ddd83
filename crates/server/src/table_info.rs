// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 StrataDB

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;

use strata_core::{Error, RangeSpec, Result, TableIdentifier};

use crate::{range::Range, schema::Schema};

/// One table's schema and loaded ranges.
pub struct TableInfo {
	id: u32,
	name: String,
	schema: RwLock<Arc<Schema>>,
	ranges: RwLock<Vec<Arc<Range>>>,
}

impl TableInfo {
	pub fn new(table: &TableIdentifier, schema: Arc<Schema>) -> Arc<Self> {
		Arc::new(Self {
			id: table.id,
			name: table.name.clone(),
			schema: RwLock::new(schema),
			ranges: RwLock::new(Vec::new()),
		})
	}

	pub fn id(&self) -> u32 {
		self.id
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn schema(&self) -> Arc<Schema> {
		self.schema.read().clone()
	}

	pub fn generation(&self) -> u32 {
		self.schema.read().generation
	}

	pub fn update_schema(&self, schema: Arc<Schema>) {
		*self.schema.write() = schema;
	}

	/// Fails when the client's generation is newer than ours (we missed
	/// a schema update) or older than ours (the client is stale).
	pub fn verify_generation(&self, supplied: u32) -> Result<()> {
		let ours = self.generation();
		if ours != supplied {
			return Err(Error::GenerationMismatch { table: self.name.clone(), ours, supplied });
		}
		Ok(())
	}

	pub fn add_range(&self, range: Arc<Range>) {
		self.ranges.write().push(range);
	}

	pub fn has_range(&self, spec: &RangeSpec) -> bool {
		self.ranges.read().iter().any(|r| r.matches(spec))
	}

	pub fn get_range(&self, spec: &RangeSpec) -> Option<Arc<Range>> {
		self.ranges.read().iter().find(|r| r.matches(spec)).cloned()
	}

	pub fn remove_range(&self, spec: &RangeSpec) -> Option<Arc<Range>> {
		let mut ranges = self.ranges.write();
		let idx = ranges.iter().position(|r| r.matches(spec))?;
		Some(ranges.swap_remove(idx))
	}

	pub fn find_containing_range(&self, row: &[u8]) -> Option<Arc<Range>> {
		self.ranges.read().iter().find(|r| r.contains(row)).cloned()
	}

	pub fn range_vec(&self) -> Vec<Arc<Range>> {
		self.ranges.read().clone()
	}

	fn drain_ranges(&self) -> Vec<Arc<Range>> {
		std::mem::take(&mut *self.ranges.write())
	}
}

/// `table_id → TableInfo`, used for both the live map and the recovery
/// replay map.
#[derive(Default)]
pub struct TableInfoMap {
	map: RwLock<HashMap<u32, Arc<TableInfo>>>,
}

impl TableInfoMap {
	pub fn get(&self, table_id: u32) -> Option<Arc<TableInfo>> {
		self.map.read().get(&table_id).cloned()
	}

	pub fn get_or_insert(&self, table: &TableIdentifier, schema: Arc<Schema>) -> Arc<TableInfo> {
		if let Some(info) = self.get(table.id) {
			return info;
		}
		let mut map = self.map.write();
		map.entry(table.id).or_insert_with(|| TableInfo::new(table, schema)).clone()
	}

	pub fn remove(&self, table_id: u32) -> Option<Arc<TableInfo>> {
		self.map.write().remove(&table_id)
	}

	pub fn get_all(&self) -> Vec<Arc<TableInfo>> {
		self.map.read().values().cloned().collect()
	}

	pub fn clear(&self) {
		self.map.write().clear();
	}

	pub fn is_empty(&self) -> bool {
		self.map.read().is_empty()
	}

	/// Moves every range of `other` into this map, creating table
	/// entries as needed. Used to promote the replay map to live.
	pub fn merge(&self, other: &TableInfoMap) {
		let sources: Vec<Arc<TableInfo>> = other.map.write().drain().map(|(_, v)| v).collect();
		for source in sources {
			let ranges = source.drain_ranges();
			let mut map = self.map.write();
			let target = map.entry(source.id).or_insert_with(|| {
				TableInfo::new(
					&TableIdentifier::new(source.id, source.name.clone(), source.generation()),
					source.schema(),
				)
			});
			for range in ranges {
				target.add_range(range);
			}
		}
	}
}
