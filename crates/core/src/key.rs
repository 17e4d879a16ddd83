// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 StrataDB

//! Composite cell keys and their serialized forms.
//!
//! A cell key is `(row, family, qualifier, flag, timestamp, revision)`. Row
//! and qualifier are NUL-terminated byte strings, so neither may contain a
//! NUL. Timestamp and revision are stored bit-inverted big-endian: plain
//! lexicographic comparison of the serialized bytes then orders rows
//! ascending, columns ascending, and versions newest-first, with delete
//! markers ahead of inserts under the same column.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
	Error, Result,
	util::encoding::{decode_vu32, encode_vu32, encoded_length_vu32},
};

/// Greatest possible row; the end row of a table's last range.
pub const END_ROW_MARKER: &[u8] = &[0xff, 0xff];

/// End row of the root metadata range (`"0:" + END_ROW_MARKER`).
pub const END_ROOT_ROW: &[u8] = &[b'0', b':', 0xff, 0xff];

pub mod flag {
	pub const DELETE_ROW: u8 = 0;
	pub const DELETE_COLUMN_FAMILY: u8 = 1;
	pub const DELETE_CELL: u8 = 2;
	pub const INSERT: u8 = 255;
}

/// Control bits in the first byte of a wire key. `AUTO_TIMESTAMP` (no bits
/// set) asks the server to assign both timestamp and revision;
/// `HAVE_TIMESTAMP` alone asks for a server-assigned revision.
pub mod control {
	pub const AUTO_TIMESTAMP: u8 = 0x00;
	pub const HAVE_TIMESTAMP: u8 = 0x01;
	pub const HAVE_REVISION: u8 = 0x02;
	pub const REV_IS_TS: u8 = 0x04;
	pub const TS_AND_REV: u8 = HAVE_TIMESTAMP | HAVE_REVISION;
}

/// Fixed tail of a fully-qualified serialized key: flag, ~timestamp, ~revision.
const KEY_TAIL_LEN: usize = 1 + 8 + 8;

/// Encodes a timestamp or revision bit-inverted big-endian so that byte
/// order is descending numeric order.
pub fn encode_ts64(buf: &mut Vec<u8>, v: i64) {
	buf.extend_from_slice(&(!(v as u64)).to_be_bytes());
}

pub fn decode_ts64(input: &mut &[u8]) -> Result<i64> {
	if input.len() < 8 {
		return Err(Error::Truncated("timestamp".into()));
	}
	let (head, rest) = input.split_at(8);
	*input = rest;
	Ok(!u64::from_be_bytes(head.try_into().unwrap()) as i64)
}

/// Decoded key components.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
	pub row: Vec<u8>,
	pub family: u8,
	pub qualifier: Vec<u8>,
	pub flag: u8,
	pub timestamp: i64,
	pub revision: i64,
}

impl Key {
	pub fn insert(
		row: impl Into<Vec<u8>>,
		family: u8,
		qualifier: impl Into<Vec<u8>>,
		timestamp: i64,
		revision: i64,
	) -> Self {
		Self {
			row: row.into(),
			family,
			qualifier: qualifier.into(),
			flag: flag::INSERT,
			timestamp,
			revision,
		}
	}

	pub fn is_delete(&self) -> bool {
		self.flag != flag::INSERT
	}
}

impl fmt::Display for Key {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"row='{}' family={} qualifier='{}' flag={} ts={} rev={}",
			String::from_utf8_lossy(&self.row),
			self.family,
			String::from_utf8_lossy(&self.qualifier),
			self.flag,
			self.timestamp,
			self.revision
		)
	}
}

fn check_component(name: &str, bytes: &[u8]) -> Result<()> {
	if bytes.contains(&0) {
		return Err(Error::BadKey(format!("{name} contains a NUL byte")));
	}
	Ok(())
}

/// A fully-qualified key in its serialized, order-preserving form:
/// `row NUL family qualifier NUL flag ~timestamp ~revision`. This is the
/// key stored in cell caches and cell stores; comparing the raw bytes
/// yields the table order.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellKey(Vec<u8>);

impl CellKey {
	pub fn encode(key: &Key) -> Result<Self> {
		if key.row.is_empty() {
			return Err(Error::BadKey("empty row".into()));
		}
		check_component("row", &key.row)?;
		check_component("qualifier", &key.qualifier)?;
		let mut buf = Vec::with_capacity(key.row.len() + key.qualifier.len() + 3 + KEY_TAIL_LEN);
		buf.extend_from_slice(&key.row);
		buf.push(0);
		buf.push(key.family);
		buf.extend_from_slice(&key.qualifier);
		buf.push(0);
		buf.push(key.flag);
		encode_ts64(&mut buf, key.timestamp);
		encode_ts64(&mut buf, key.revision);
		Ok(Self(buf))
	}

	/// Wraps serialized bytes, validating the layout.
	pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
		let key = Self(bytes);
		key.decode()?;
		Ok(key)
	}

	/// Wraps raw bytes for use as a comparison bound only. The bytes
	/// need not form a complete key and must never be decoded.
	pub fn raw_for_seek(bytes: Vec<u8>) -> Self {
		Self(bytes)
	}

	pub fn decode(&self) -> Result<Key> {
		let bytes = &self.0;
		let row_end =
			bytes.iter().position(|&b| b == 0).ok_or_else(|| Error::BadKey("missing row terminator".into()))?;
		if row_end == 0 {
			return Err(Error::BadKey("empty row".into()));
		}
		let rest = &bytes[row_end + 1..];
		if rest.is_empty() {
			return Err(Error::BadKey("missing column family".into()));
		}
		let family = rest[0];
		let rest = &rest[1..];
		let qual_end = rest
			.iter()
			.position(|&b| b == 0)
			.ok_or_else(|| Error::BadKey("missing qualifier terminator".into()))?;
		let tail = &rest[qual_end + 1..];
		if tail.len() != KEY_TAIL_LEN {
			return Err(Error::BadKey(format!("bad key tail length {}", tail.len())));
		}
		let mut cursor = tail;
		let flag = cursor[0];
		cursor = &cursor[1..];
		let timestamp = decode_ts64(&mut cursor)?;
		let revision = decode_ts64(&mut cursor)?;
		Ok(Key {
			row: bytes[..row_end].to_vec(),
			family,
			qualifier: rest[..qual_end].to_vec(),
			flag,
			timestamp,
			revision,
		})
	}

	pub fn row(&self) -> &[u8] {
		let end = self.0.iter().position(|&b| b == 0).unwrap_or(self.0.len());
		&self.0[..end]
	}

	pub fn family(&self) -> u8 {
		let row_end = self.0.iter().position(|&b| b == 0).unwrap_or(0);
		self.0[row_end + 1]
	}

	pub fn flag(&self) -> u8 {
		self.0[self.0.len() - KEY_TAIL_LEN]
	}

	pub fn timestamp(&self) -> i64 {
		let mut tail = &self.0[self.0.len() - 16..];
		decode_ts64(&mut tail).expect("validated key")
	}

	pub fn revision(&self) -> i64 {
		let mut tail = &self.0[self.0.len() - 8..];
		decode_ts64(&mut tail).expect("validated key")
	}

	/// The `row NUL family qualifier NUL` prefix identifying the column,
	/// used for version counting and delete-shadowing.
	pub fn column_prefix(&self) -> &[u8] {
		&self.0[..self.0.len() - KEY_TAIL_LEN]
	}

	pub fn as_bytes(&self) -> &[u8] {
		&self.0
	}

	pub fn into_bytes(self) -> Vec<u8> {
		self.0
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

impl fmt::Debug for CellKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.decode() {
			Ok(key) => write!(f, "CellKey({key})"),
			Err(_) => write!(f, "CellKey(invalid {:02x?})", self.0),
		}
	}
}

/// A key as it appears on the wire and in commit-log payloads: a varint
/// total length, a control byte, then the components, with timestamp and
/// revision present only when the matching control bits are set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireKeyRef<'a> {
	pub control: u8,
	pub row: &'a [u8],
	pub family: u8,
	pub qualifier: &'a [u8],
	pub flag: u8,
	pub timestamp: Option<i64>,
	pub revision: Option<i64>,
}

impl<'a> WireKeyRef<'a> {
	pub fn decode(input: &mut &'a [u8]) -> Result<Self> {
		let len = decode_vu32(input)? as usize;
		if input.len() < len {
			return Err(Error::Truncated("wire key".into()));
		}
		let (body, rest) = input.split_at(len);
		*input = rest;

		let mut cursor = body;
		if cursor.is_empty() {
			return Err(Error::BadKey("empty wire key".into()));
		}
		let control = cursor[0];
		cursor = &cursor[1..];
		let row_end = cursor
			.iter()
			.position(|&b| b == 0)
			.ok_or_else(|| Error::BadKey("missing row terminator".into()))?;
		if row_end == 0 {
			return Err(Error::BadKey("empty row".into()));
		}
		let row = &cursor[..row_end];
		cursor = &cursor[row_end + 1..];
		if cursor.is_empty() {
			return Err(Error::BadKey("missing column family".into()));
		}
		let family = cursor[0];
		cursor = &cursor[1..];
		let qual_end = cursor
			.iter()
			.position(|&b| b == 0)
			.ok_or_else(|| Error::BadKey("missing qualifier terminator".into()))?;
		let qualifier = &cursor[..qual_end];
		cursor = &cursor[qual_end + 1..];
		if cursor.is_empty() {
			return Err(Error::BadKey("missing flag".into()));
		}
		let flag = cursor[0];
		cursor = &cursor[1..];

		let timestamp = if control & control::HAVE_TIMESTAMP != 0 {
			Some(decode_ts64(&mut cursor)?)
		} else {
			None
		};
		let revision = if control & control::HAVE_REVISION != 0 {
			Some(decode_ts64(&mut cursor)?)
		} else {
			None
		};
		if !cursor.is_empty() {
			return Err(Error::BadKey("trailing bytes in wire key".into()));
		}
		Ok(Self { control, row, family, qualifier, flag, timestamp, revision })
	}

	pub fn row_utf8(&self) -> String {
		String::from_utf8_lossy(self.row).into_owned()
	}
}

/// Encodes a fully-qualified wire key (control `TS_AND_REV`, timestamp and
/// revision always present) from its serialized cell form.
pub fn encode_wire_full(buf: &mut Vec<u8>, key: &CellKey) {
	let body_len = 1 + key.len();
	encode_vu32(buf, body_len as u32);
	buf.push(control::TS_AND_REV);
	buf.extend_from_slice(key.as_bytes());
}

/// Encodes a client-side wire key, including only the parts the control
/// bits call for.
pub fn encode_wire_key(
	buf: &mut Vec<u8>,
	control_byte: u8,
	row: &[u8],
	family: u8,
	qualifier: &[u8],
	flag: u8,
	timestamp: i64,
	revision: i64,
) {
	let mut len = 1 + row.len() + 1 + 1 + qualifier.len() + 1 + 1;
	if control_byte & control::HAVE_TIMESTAMP != 0 {
		len += 8;
	}
	if control_byte & control::HAVE_REVISION != 0 {
		len += 8;
	}
	buf.reserve(len + encoded_length_vu32(len as u32));
	encode_vu32(buf, len as u32);
	buf.push(control_byte);
	buf.extend_from_slice(row);
	buf.push(0);
	buf.push(family);
	buf.extend_from_slice(qualifier);
	buf.push(0);
	buf.push(flag);
	if control_byte & control::HAVE_TIMESTAMP != 0 {
		encode_ts64(buf, timestamp);
	}
	if control_byte & control::HAVE_REVISION != 0 {
		encode_ts64(buf, revision);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn key(row: &str, family: u8, qualifier: &str, ts: i64, rev: i64) -> CellKey {
		CellKey::encode(&Key::insert(row.as_bytes().to_vec(), family, qualifier.as_bytes().to_vec(), ts, rev))
			.unwrap()
	}

	#[test]
	fn round_trip_is_identity() {
		let original = Key {
			row: b"alice".to_vec(),
			family: 3,
			qualifier: b"age".to_vec(),
			flag: flag::INSERT,
			timestamp: 1_234_567,
			revision: 1_234_568,
		};
		let serialized = CellKey::encode(&original).unwrap();
		assert_eq!(serialized.decode().unwrap(), original);
		assert_eq!(serialized.row(), b"alice");
		assert_eq!(serialized.family(), 3);
		assert_eq!(serialized.flag(), flag::INSERT);
		assert_eq!(serialized.timestamp(), 1_234_567);
		assert_eq!(serialized.revision(), 1_234_568);
	}

	#[test]
	fn rows_order_ascending() {
		assert!(key("a", 1, "q", 10, 10) < key("b", 1, "q", 10, 10));
		assert!(key("a", 1, "q", 10, 10) < key("aa", 1, "q", 10, 10));
	}

	#[test]
	fn columns_order_ascending_within_row() {
		assert!(key("a", 1, "q", 10, 10) < key("a", 2, "q", 10, 10));
		assert!(key("a", 1, "a", 10, 10) < key("a", 1, "b", 10, 10));
	}

	#[test]
	fn timestamps_order_descending_within_cell() {
		assert!(key("a", 1, "q", 20, 20) < key("a", 1, "q", 10, 10));
	}

	#[test]
	fn delete_markers_sort_ahead_of_inserts() {
		let insert = key("a", 1, "q", 10, 10);
		let delete = CellKey::encode(&Key {
			row: b"a".to_vec(),
			family: 1,
			qualifier: b"q".to_vec(),
			flag: flag::DELETE_CELL,
			timestamp: 10,
			revision: 10,
		})
		.unwrap();
		assert!(delete < insert);
	}

	#[test]
	fn end_row_marker_is_greatest() {
		assert!(key("zzzzzzzz", 1, "q", 1, 1).row() < END_ROW_MARKER);
	}

	#[test]
	fn nul_in_row_rejected() {
		let bad = Key::insert(vec![b'a', 0, b'b'], 1, vec![], 1, 1);
		assert!(matches!(CellKey::encode(&bad), Err(Error::BadKey(_))));
	}

	#[test]
	fn wire_key_auto_timestamp_round_trip() {
		let mut buf = Vec::new();
		encode_wire_key(&mut buf, control::AUTO_TIMESTAMP, b"row1", 2, b"col", flag::INSERT, 0, 0);
		let mut input = buf.as_slice();
		let wire = WireKeyRef::decode(&mut input).unwrap();
		assert!(input.is_empty());
		assert_eq!(wire.control, control::AUTO_TIMESTAMP);
		assert_eq!(wire.row, b"row1");
		assert_eq!(wire.family, 2);
		assert_eq!(wire.qualifier, b"col");
		assert_eq!(wire.timestamp, None);
		assert_eq!(wire.revision, None);
	}

	#[test]
	fn wire_key_full_round_trip() {
		let cell = key("bob", 7, "name", 55, 56);
		let mut buf = Vec::new();
		encode_wire_full(&mut buf, &cell);
		let mut input = buf.as_slice();
		let wire = WireKeyRef::decode(&mut input).unwrap();
		assert_eq!(wire.timestamp, Some(55));
		assert_eq!(wire.revision, Some(56));
		assert_eq!(wire.row, b"bob");
	}
}
