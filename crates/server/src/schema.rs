// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 StrataDB

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use strata_core::{Error, Result};

/// One column family. Ids are the single byte carried in every cell key;
/// id 0 is reserved for row-delete markers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnFamilySpec {
	pub id: u8,
	pub name: String,
	/// 0 means unlimited.
	#[serde(default)]
	pub max_versions: u32,
	#[serde(default)]
	pub ttl_secs: u64,
}

/// Column families stored together on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGroupSpec {
	pub name: String,
	pub column_families: Vec<ColumnFamilySpec>,
}

/// A table schema, carried as a JSON document. `generation` increases
/// with every schema change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
	pub generation: u32,
	pub access_groups: Vec<AccessGroupSpec>,
}

impl Schema {
	pub fn parse(json: &str) -> Result<Self> {
		let schema: Schema =
			serde_json::from_str(json).map_err(|e| Error::SchemaParseError(e.to_string()))?;
		schema.validate()?;
		Ok(schema)
	}

	fn validate(&self) -> Result<()> {
		if self.access_groups.is_empty() {
			return Err(Error::SchemaParseError("schema has no access groups".into()));
		}
		let mut family_ids = HashSet::new();
		let mut group_names = HashSet::new();
		for group in &self.access_groups {
			if !group_names.insert(group.name.as_str()) {
				return Err(Error::SchemaParseError(format!(
					"duplicate access group '{}'",
					group.name
				)));
			}
			if group.column_families.is_empty() {
				return Err(Error::SchemaParseError(format!(
					"access group '{}' has no column families",
					group.name
				)));
			}
			for family in &group.column_families {
				if family.id == 0 {
					return Err(Error::SchemaParseError(format!(
						"column family '{}' uses reserved id 0",
						family.name
					)));
				}
				if !family_ids.insert(family.id) {
					return Err(Error::SchemaParseError(format!(
						"duplicate column family id {}",
						family.id
					)));
				}
			}
		}
		Ok(())
	}

	pub fn to_json(&self) -> String {
		serde_json::to_string(self).expect("schema serializes")
	}

	pub fn family(&self, id: u8) -> Option<&ColumnFamilySpec> {
		self.access_groups
			.iter()
			.flat_map(|g| g.column_families.iter())
			.find(|f| f.id == id)
	}

	/// Index of the access group holding family `id`.
	pub fn group_of_family(&self, id: u8) -> Option<usize> {
		self.access_groups
			.iter()
			.position(|g| g.column_families.iter().any(|f| f.id == id))
	}

	/// A one-group, one-family schema, the common case in tests and
	/// bootstrap metadata tables.
	pub fn single_family(generation: u32, group: &str, family: &str) -> Self {
		Self {
			generation,
			access_groups: vec![AccessGroupSpec {
				name: group.into(),
				column_families: vec![ColumnFamilySpec {
					id: 1,
					name: family.into(),
					max_versions: 0,
					ttl_secs: 0,
				}],
			}],
		}
	}
}
