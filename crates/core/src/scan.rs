// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 StrataDB

use serde::{Deserialize, Serialize};

use crate::{
	Result,
	util::encoding::{
		decode_bytes, decode_i64, decode_u8, decode_u32, decode_vu32, encode_bytes, encode_i64,
		encode_u8, encode_u32, encode_vu32,
	},
};

/// A row interval with per-end inclusivity. Empty bounds are open.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowInterval {
	pub start: Vec<u8>,
	pub start_inclusive: bool,
	pub end: Vec<u8>,
	pub end_inclusive: bool,
}

impl RowInterval {
	pub fn single_row(row: impl Into<Vec<u8>>) -> Self {
		let row = row.into();
		Self { start: row.clone(), start_inclusive: true, end: row, end_inclusive: true }
	}

	pub fn contains(&self, row: &[u8]) -> bool {
		if !self.start.is_empty() {
			if self.start_inclusive {
				if row < self.start.as_slice() {
					return false;
				}
			} else if row <= self.start.as_slice() {
				return false;
			}
		}
		if !self.end.is_empty() {
			if self.end_inclusive {
				if row > self.end.as_slice() {
					return false;
				}
			} else if row >= self.end.as_slice() {
				return false;
			}
		}
		true
	}

	/// Whether every row past `row` also falls past the interval, which
	/// lets a scan stop early.
	pub fn ends_before(&self, row: &[u8]) -> bool {
		if self.end.is_empty() {
			return false;
		}
		if self.end_inclusive { row > self.end.as_slice() } else { row >= self.end.as_slice() }
	}
}

/// A cell interval bounded by `(row, family, qualifier)` coordinates.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellInterval {
	pub start_row: Vec<u8>,
	pub start_family: u8,
	pub start_qualifier: Vec<u8>,
	pub start_inclusive: bool,
	pub end_row: Vec<u8>,
	pub end_family: u8,
	pub end_qualifier: Vec<u8>,
	pub end_inclusive: bool,
}

impl CellInterval {
	fn coord<'a>(row: &'a [u8], family: u8, qualifier: &'a [u8]) -> (&'a [u8], u8, &'a [u8]) {
		(row, family, qualifier)
	}

	pub fn contains(&self, row: &[u8], family: u8, qualifier: &[u8]) -> bool {
		let cell = Self::coord(row, family, qualifier);
		if !self.start_row.is_empty() {
			let start = Self::coord(&self.start_row, self.start_family, &self.start_qualifier);
			if self.start_inclusive {
				if cell < start {
					return false;
				}
			} else if cell <= start {
				return false;
			}
		}
		if !self.end_row.is_empty() {
			let end = Self::coord(&self.end_row, self.end_family, &self.end_qualifier);
			if self.end_inclusive {
				if cell > end {
					return false;
				}
			} else if cell >= end {
				return false;
			}
		}
		true
	}
}

/// Half-open time bounds `[start, end)` in microseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeInterval {
	pub start: i64,
	pub end: i64,
}

impl TimeInterval {
	pub fn contains(&self, timestamp: i64) -> bool {
		timestamp >= self.start && timestamp < self.end
	}
}

/// Scan predicates, carried on the wire by `create_scanner`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSpec {
	pub row_intervals: Vec<RowInterval>,
	pub cell_intervals: Vec<CellInterval>,
	/// Column family ids to return; empty means all.
	pub columns: Vec<u8>,
	pub time_interval: Option<TimeInterval>,
	/// Newest versions to keep per cell; 0 means unlimited.
	pub max_versions: u32,
	pub row_limit: u32,
	pub cell_limit: u32,
	pub row_regex: Option<String>,
	pub value_regex: Option<String>,
	pub return_deletes: bool,
}

impl ScanSpec {
	pub fn single_row(row: impl Into<Vec<u8>>) -> Self {
		Self { row_intervals: vec![RowInterval::single_row(row)], ..Default::default() }
	}

	/// Point queries (one fully-bounded single-row interval and no
	/// other predicates that depend on server state) are eligible for
	/// the query cache.
	pub fn is_point_query(&self) -> bool {
		self.cell_intervals.is_empty()
			&& self.row_regex.is_none()
			&& self.value_regex.is_none()
			&& !self.return_deletes
			&& self.row_intervals.len() == 1
			&& {
				let ri = &self.row_intervals[0];
				!ri.start.is_empty() && ri.start == ri.end && ri.start_inclusive && ri.end_inclusive
			}
	}

	/// Stable 64-bit digest of the encoded spec, used as the query-cache
	/// key together with the table id.
	pub fn cache_digest(&self) -> u64 {
		let mut buf = Vec::new();
		self.encode(&mut buf);
		xxhash_rust::xxh3::xxh3_64(&buf)
	}

	pub fn encode(&self, buf: &mut Vec<u8>) {
		encode_vu32(buf, self.row_intervals.len() as u32);
		for ri in &self.row_intervals {
			encode_bytes(buf, &ri.start);
			encode_u8(buf, ri.start_inclusive as u8);
			encode_bytes(buf, &ri.end);
			encode_u8(buf, ri.end_inclusive as u8);
		}
		encode_vu32(buf, self.cell_intervals.len() as u32);
		for ci in &self.cell_intervals {
			encode_bytes(buf, &ci.start_row);
			encode_u8(buf, ci.start_family);
			encode_bytes(buf, &ci.start_qualifier);
			encode_u8(buf, ci.start_inclusive as u8);
			encode_bytes(buf, &ci.end_row);
			encode_u8(buf, ci.end_family);
			encode_bytes(buf, &ci.end_qualifier);
			encode_u8(buf, ci.end_inclusive as u8);
		}
		encode_bytes(buf, &self.columns);
		match self.time_interval {
			Some(ti) => {
				encode_u8(buf, 1);
				encode_i64(buf, ti.start);
				encode_i64(buf, ti.end);
			}
			None => encode_u8(buf, 0),
		}
		encode_u32(buf, self.max_versions);
		encode_u32(buf, self.row_limit);
		encode_u32(buf, self.cell_limit);
		encode_bytes(buf, self.row_regex.as_deref().unwrap_or("").as_bytes());
		encode_bytes(buf, self.value_regex.as_deref().unwrap_or("").as_bytes());
		encode_u8(buf, self.return_deletes as u8);
	}

	pub fn decode(input: &mut &[u8]) -> Result<Self> {
		let mut spec = ScanSpec::default();
		for _ in 0..decode_vu32(input)? {
			spec.row_intervals.push(RowInterval {
				start: decode_bytes(input)?.to_vec(),
				start_inclusive: decode_u8(input)? != 0,
				end: decode_bytes(input)?.to_vec(),
				end_inclusive: decode_u8(input)? != 0,
			});
		}
		for _ in 0..decode_vu32(input)? {
			spec.cell_intervals.push(CellInterval {
				start_row: decode_bytes(input)?.to_vec(),
				start_family: decode_u8(input)?,
				start_qualifier: decode_bytes(input)?.to_vec(),
				start_inclusive: decode_u8(input)? != 0,
				end_row: decode_bytes(input)?.to_vec(),
				end_family: decode_u8(input)?,
				end_qualifier: decode_bytes(input)?.to_vec(),
				end_inclusive: decode_u8(input)? != 0,
			});
		}
		spec.columns = decode_bytes(input)?.to_vec();
		if decode_u8(input)? != 0 {
			spec.time_interval =
				Some(TimeInterval { start: decode_i64(input)?, end: decode_i64(input)? });
		}
		spec.max_versions = decode_u32(input)?;
		spec.row_limit = decode_u32(input)?;
		spec.cell_limit = decode_u32(input)?;
		let row_regex = decode_bytes(input)?;
		if !row_regex.is_empty() {
			spec.row_regex = Some(String::from_utf8_lossy(row_regex).into_owned());
		}
		let value_regex = decode_bytes(input)?;
		if !value_regex.is_empty() {
			spec.value_regex = Some(String::from_utf8_lossy(value_regex).into_owned());
		}
		spec.return_deletes = decode_u8(input)? != 0;
		Ok(spec)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn row_interval_bounds() {
		let ri = RowInterval {
			start: b"b".to_vec(),
			start_inclusive: false,
			end: b"d".to_vec(),
			end_inclusive: true,
		};
		assert!(!ri.contains(b"b"));
		assert!(ri.contains(b"c"));
		assert!(ri.contains(b"d"));
		assert!(!ri.contains(b"da"));
		assert!(ri.ends_before(b"da"));
		assert!(!ri.ends_before(b"d"));
	}

	#[test]
	fn point_query_shape() {
		assert!(ScanSpec::single_row(b"alice".to_vec()).is_point_query());
		let mut spec = ScanSpec::single_row(b"alice".to_vec());
		spec.row_regex = Some("a.*".into());
		assert!(!spec.is_point_query());
		assert!(!ScanSpec::default().is_point_query());
	}

	#[test]
	fn spec_round_trip() {
		let spec = ScanSpec {
			row_intervals: vec![RowInterval {
				start: b"a".to_vec(),
				start_inclusive: true,
				end: b"z".to_vec(),
				end_inclusive: false,
			}],
			cell_intervals: vec![CellInterval {
				start_row: b"a".to_vec(),
				start_family: 1,
				start_qualifier: b"x".to_vec(),
				start_inclusive: true,
				end_row: b"b".to_vec(),
				end_family: 2,
				end_qualifier: b"y".to_vec(),
				end_inclusive: true,
			}],
			columns: vec![1, 2],
			time_interval: Some(TimeInterval { start: 5, end: 50 }),
			max_versions: 2,
			row_limit: 10,
			cell_limit: 100,
			row_regex: Some("ab.*".into()),
			value_regex: None,
			return_deletes: false,
		};
		let mut buf = Vec::new();
		spec.encode(&mut buf);
		let mut input = buf.as_slice();
		assert_eq!(ScanSpec::decode(&mut input).unwrap(), spec);
		assert!(input.is_empty());
	}

	#[test]
	fn cache_digest_distinguishes_specs() {
		let a = ScanSpec::single_row(b"alice".to_vec());
		let b = ScanSpec::single_row(b"bob".to_vec());
		assert_ne!(a.cache_digest(), b.cache_digest());
		assert_eq!(a.cache_digest(), ScanSpec::single_row(b"alice".to_vec()).cache_digest());
	}
}
