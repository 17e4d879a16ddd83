// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 StrataDB

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
	Result,
	key::{END_ROOT_ROW, END_ROW_MARKER},
	util::encoding::{decode_bytes, decode_str, decode_u32, encode_bytes, encode_str, encode_u32},
};

/// Identifies a table. `generation` increases with every schema change;
/// requests carrying a stale generation fail with `GENERATION_MISMATCH`.
/// Table id 0 is the metadata table.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableIdentifier {
	pub id: u32,
	pub name: String,
	pub generation: u32,
}

impl TableIdentifier {
	pub fn new(id: u32, name: impl Into<String>, generation: u32) -> Self {
		Self { id, name: name.into(), generation }
	}

	pub fn is_metadata(&self) -> bool {
		self.id == 0
	}

	pub fn encode(&self, buf: &mut Vec<u8>) {
		encode_u32(buf, self.id);
		encode_str(buf, &self.name);
		encode_u32(buf, self.generation);
	}

	pub fn decode(input: &mut &[u8]) -> Result<Self> {
		Ok(Self { id: decode_u32(input)?, name: decode_str(input)?, generation: decode_u32(input)? })
	}
}

impl fmt::Display for TableIdentifier {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}(id={} gen={})", self.name, self.id, self.generation)
	}
}

/// A row interval `(start_row, end_row]` of one table. An empty start row
/// means the beginning of the table; `END_ROW_MARKER` means the end.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RangeSpec {
	pub start_row: Vec<u8>,
	pub end_row: Vec<u8>,
}

impl RangeSpec {
	pub fn new(start_row: impl Into<Vec<u8>>, end_row: impl Into<Vec<u8>>) -> Self {
		Self { start_row: start_row.into(), end_row: end_row.into() }
	}

	/// The whole-table range.
	pub fn full() -> Self {
		Self::new(Vec::new(), END_ROW_MARKER.to_vec())
	}

	pub fn is_root(&self, table: &TableIdentifier) -> bool {
		table.id == 0 && self.end_row == END_ROOT_ROW
	}

	/// Start row is exclusive, end row inclusive.
	pub fn contains(&self, row: &[u8]) -> bool {
		row > self.start_row.as_slice()
			&& (self.end_row == END_ROW_MARKER || row <= self.end_row.as_slice())
	}

	pub fn encode(&self, buf: &mut Vec<u8>) {
		encode_bytes(buf, &self.start_row);
		encode_bytes(buf, &self.end_row);
	}

	pub fn decode(input: &mut &[u8]) -> Result<Self> {
		Ok(Self { start_row: decode_bytes(input)?.to_vec(), end_row: decode_bytes(input)?.to_vec() })
	}
}

impl fmt::Display for RangeSpec {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"[{}..{}]",
			String::from_utf8_lossy(&self.start_row),
			String::from_utf8_lossy(&self.end_row)
		)
	}
}

/// Durable split progress of a range, recorded in the range transaction
/// log so a restart resumes an interrupted split where it left off.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RangeState {
	#[default]
	Steady,
	/// A transfer log exists; updates for the split-off half are routed
	/// into it in addition to the live cache.
	SplitLogInstalled { split_row: Vec<u8>, transfer_log: String },
	/// The parent's end row has been shrunk to `split_row`; the child
	/// `(split_row, old_end]` is the master's to assign.
	SplitShrunk { split_row: Vec<u8>, transfer_log: String },
}

impl RangeState {
	pub fn split_pending(&self) -> bool {
		!matches!(self, RangeState::Steady)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn contains_is_start_exclusive_end_inclusive() {
		let range = RangeSpec::new(b"g".to_vec(), b"m".to_vec());
		assert!(!range.contains(b"g"));
		assert!(range.contains(b"ga"));
		assert!(range.contains(b"m"));
		assert!(!range.contains(b"ma"));
	}

	#[test]
	fn full_range_contains_everything_nonempty() {
		let range = RangeSpec::full();
		assert!(range.contains(b"a"));
		assert!(range.contains(&[0xff, 0xff, 0xff]));
	}

	#[test]
	fn root_detection() {
		let metadata = TableIdentifier::new(0, "METADATA", 1);
		assert!(RangeSpec::new(Vec::new(), END_ROOT_ROW.to_vec()).is_root(&metadata));
		assert!(!RangeSpec::full().is_root(&metadata));
	}

	#[test]
	fn identifier_round_trip() {
		let table = TableIdentifier::new(7, "users", 3);
		let mut buf = Vec::new();
		table.encode(&mut buf);
		let mut input = buf.as_slice();
		assert_eq!(TableIdentifier::decode(&mut input).unwrap(), table);
	}
}
