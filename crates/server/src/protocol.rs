// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 StrataDB

//! Request and response payload codecs for every range-server method.
//! Every response payload begins with a `u32` error code; `0` is
//! success, anything else is followed by a message string.

use strata_core::{
	Error, RangeSpec, RangeState, Result, ScanSpec, TableIdentifier,
	util::encoding::{
		decode_bytes, decode_str, decode_u8, decode_u16, decode_u32, decode_vu32, encode_bytes,
		encode_str, encode_u8, encode_u16, encode_u32, encode_vu32,
	},
};

/// Method selectors carried in the frame header's `command` field.
pub mod cmd {
	pub const LOAD_RANGE: u16 = 1;
	pub const UPDATE: u16 = 2;
	pub const CREATE_SCANNER: u16 = 3;
	pub const FETCH_SCANBLOCK: u16 = 4;
	pub const DESTROY_SCANNER: u16 = 5;
	pub const DROP_RANGE: u16 = 6;
	pub const DROP_TABLE: u16 = 7;
	pub const UPDATE_SCHEMA: u16 = 8;
	pub const COMPACT: u16 = 9;
	pub const REPLAY_BEGIN: u16 = 10;
	pub const REPLAY_LOAD_RANGE: u16 = 11;
	pub const REPLAY_UPDATE: u16 = 12;
	pub const REPLAY_COMMIT: u16 = 13;
	pub const COMMIT_LOG_SYNC: u16 = 14;
	pub const GET_STATISTICS: u16 = 15;
	pub const CLOSE: u16 = 16;
}

/// Recovery groups, replayed in this order.
pub mod replay_group {
	pub const ROOT: u16 = 0;
	pub const METADATA: u16 = 1;
	pub const USER: u16 = 2;
}

pub const UPDATE_FLAG_NO_LOG_SYNC: u32 = 0x0001;

/// Per-segment result of an `update`, pointing back into the submitted
/// buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendBack {
	pub error: u32,
	pub count: u32,
	pub offset: u32,
	pub len: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
	/// True when the scan is complete and no scanner was retained.
	pub eos: bool,
	pub scanner_id: u32,
	pub block: Vec<u8>,
}

fn encode_range_state(buf: &mut Vec<u8>, state: &RangeState) {
	match state {
		RangeState::Steady => encode_u8(buf, 0),
		RangeState::SplitLogInstalled { split_row, transfer_log } => {
			encode_u8(buf, 1);
			encode_bytes(buf, split_row);
			encode_str(buf, transfer_log);
		}
		RangeState::SplitShrunk { split_row, transfer_log } => {
			encode_u8(buf, 2);
			encode_bytes(buf, split_row);
			encode_str(buf, transfer_log);
		}
	}
}

fn decode_range_state(input: &mut &[u8]) -> Result<RangeState> {
	match decode_u8(input)? {
		0 => Ok(RangeState::Steady),
		1 => Ok(RangeState::SplitLogInstalled {
			split_row: decode_bytes(input)?.to_vec(),
			transfer_log: decode_str(input)?,
		}),
		2 => Ok(RangeState::SplitShrunk {
			split_row: decode_bytes(input)?.to_vec(),
			transfer_log: decode_str(input)?,
		}),
		other => Err(Error::MalformedRequest(format!("unknown range state {other}"))),
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadRangeRequest {
	pub table: TableIdentifier,
	pub range: RangeSpec,
	pub transfer_log: Option<String>,
	pub schema_json: String,
	pub state: RangeState,
}

impl LoadRangeRequest {
	pub fn encode(&self) -> Vec<u8> {
		let mut buf = Vec::new();
		self.table.encode(&mut buf);
		self.range.encode(&mut buf);
		encode_str(&mut buf, self.transfer_log.as_deref().unwrap_or(""));
		encode_str(&mut buf, &self.schema_json);
		encode_range_state(&mut buf, &self.state);
		buf
	}

	pub fn decode(input: &mut &[u8]) -> Result<Self> {
		let table = TableIdentifier::decode(input)?;
		let range = RangeSpec::decode(input)?;
		let transfer_log = decode_str(input)?;
		Ok(Self {
			table,
			range,
			transfer_log: if transfer_log.is_empty() { None } else { Some(transfer_log) },
			schema_json: decode_str(input)?,
			state: decode_range_state(input)?,
		})
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRequest {
	pub table: TableIdentifier,
	pub count: u32,
	pub flags: u32,
	/// Serialized key/value stream: repeated wire key then
	/// length-prefixed value.
	pub cells: Vec<u8>,
}

impl UpdateRequest {
	pub fn encode(&self) -> Vec<u8> {
		let mut buf = Vec::new();
		self.table.encode(&mut buf);
		encode_u32(&mut buf, self.count);
		encode_u32(&mut buf, self.flags);
		encode_bytes(&mut buf, &self.cells);
		buf
	}

	pub fn decode(input: &mut &[u8]) -> Result<Self> {
		Ok(Self {
			table: TableIdentifier::decode(input)?,
			count: decode_u32(input)?,
			flags: decode_u32(input)?,
			cells: decode_bytes(input)?.to_vec(),
		})
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateScannerRequest {
	pub table: TableIdentifier,
	pub range: RangeSpec,
	pub spec: ScanSpec,
}

impl CreateScannerRequest {
	pub fn encode(&self) -> Vec<u8> {
		let mut buf = Vec::new();
		self.table.encode(&mut buf);
		self.range.encode(&mut buf);
		self.spec.encode(&mut buf);
		buf
	}

	pub fn decode(input: &mut &[u8]) -> Result<Self> {
		Ok(Self {
			table: TableIdentifier::decode(input)?,
			range: RangeSpec::decode(input)?,
			spec: ScanSpec::decode(input)?,
		})
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompactRequest {
	pub table: TableIdentifier,
	pub range: RangeSpec,
	/// 0 = minor, 1 = major.
	pub compaction_type: u8,
}

impl CompactRequest {
	pub fn encode(&self) -> Vec<u8> {
		let mut buf = Vec::new();
		self.table.encode(&mut buf);
		self.range.encode(&mut buf);
		encode_u8(&mut buf, self.compaction_type);
		buf
	}

	pub fn decode(input: &mut &[u8]) -> Result<Self> {
		Ok(Self {
			table: TableIdentifier::decode(input)?,
			range: RangeSpec::decode(input)?,
			compaction_type: decode_u8(input)?,
		})
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplayLoadRangeRequest {
	pub table: TableIdentifier,
	pub range: RangeSpec,
	pub schema_json: String,
	pub state: RangeState,
}

impl ReplayLoadRangeRequest {
	pub fn encode(&self) -> Vec<u8> {
		let mut buf = Vec::new();
		self.table.encode(&mut buf);
		self.range.encode(&mut buf);
		encode_str(&mut buf, &self.schema_json);
		encode_range_state(&mut buf, &self.state);
		buf
	}

	pub fn decode(input: &mut &[u8]) -> Result<Self> {
		Ok(Self {
			table: TableIdentifier::decode(input)?,
			range: RangeSpec::decode(input)?,
			schema_json: decode_str(input)?,
			state: decode_range_state(input)?,
		})
	}
}

pub fn encode_scanner_id(scanner_id: u32) -> Vec<u8> {
	let mut buf = Vec::new();
	encode_u32(&mut buf, scanner_id);
	buf
}

pub fn decode_scanner_id(input: &mut &[u8]) -> Result<u32> {
	decode_u32(input)
}

pub fn encode_drop_range(table: &TableIdentifier, range: &RangeSpec) -> Vec<u8> {
	let mut buf = Vec::new();
	table.encode(&mut buf);
	range.encode(&mut buf);
	buf
}

pub fn decode_drop_range(input: &mut &[u8]) -> Result<(TableIdentifier, RangeSpec)> {
	Ok((TableIdentifier::decode(input)?, RangeSpec::decode(input)?))
}

pub fn encode_update_schema(table: &TableIdentifier, schema_json: &str) -> Vec<u8> {
	let mut buf = Vec::new();
	table.encode(&mut buf);
	encode_str(&mut buf, schema_json);
	buf
}

pub fn decode_update_schema(input: &mut &[u8]) -> Result<(TableIdentifier, String)> {
	Ok((TableIdentifier::decode(input)?, decode_str(input)?))
}

pub fn encode_replay_begin(group: u16) -> Vec<u8> {
	let mut buf = Vec::new();
	encode_u16(&mut buf, group);
	buf
}

pub fn decode_replay_begin(input: &mut &[u8]) -> Result<u16> {
	decode_u16(input)
}

// --- response envelope ---

pub fn encode_ok_response(payload: &[u8]) -> Vec<u8> {
	let mut buf = Vec::with_capacity(4 + payload.len());
	encode_u32(&mut buf, strata_core::code::OK);
	buf.extend_from_slice(payload);
	buf
}

pub fn encode_error_response(error: &Error) -> Vec<u8> {
	let mut buf = Vec::new();
	encode_u32(&mut buf, error.code());
	encode_str(&mut buf, &error.to_string());
	buf
}

/// Client side: strips the error envelope, turning a non-zero code into
/// `Error::Remote`.
pub fn decode_response(payload: &[u8]) -> Result<&[u8]> {
	let mut input = payload;
	let code = decode_u32(&mut input)?;
	if code == strata_core::code::OK {
		return Ok(input);
	}
	let message = decode_str(&mut input).unwrap_or_default();
	Err(Error::remote(code, message))
}

pub fn encode_send_backs(send_backs: &[SendBack]) -> Vec<u8> {
	let mut buf = Vec::new();
	encode_vu32(&mut buf, send_backs.len() as u32);
	for sb in send_backs {
		encode_u32(&mut buf, sb.error);
		encode_u32(&mut buf, sb.count);
		encode_u32(&mut buf, sb.offset);
		encode_u32(&mut buf, sb.len);
	}
	buf
}

pub fn decode_send_backs(input: &mut &[u8]) -> Result<Vec<SendBack>> {
	let count = decode_vu32(input)?;
	let mut send_backs = Vec::with_capacity(count as usize);
	for _ in 0..count {
		send_backs.push(SendBack {
			error: decode_u32(input)?,
			count: decode_u32(input)?,
			offset: decode_u32(input)?,
			len: decode_u32(input)?,
		});
	}
	Ok(send_backs)
}

pub fn encode_scan_result(result: &ScanResult) -> Vec<u8> {
	let mut buf = Vec::new();
	encode_u8(&mut buf, result.eos as u8);
	encode_u32(&mut buf, result.scanner_id);
	encode_bytes(&mut buf, &result.block);
	buf
}

pub fn decode_scan_result(input: &mut &[u8]) -> Result<ScanResult> {
	Ok(ScanResult {
		eos: decode_u8(input)? != 0,
		scanner_id: decode_u32(input)?,
		block: decode_bytes(input)?.to_vec(),
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn load_range_request_round_trip() {
		let request = LoadRangeRequest {
			table: TableIdentifier::new(4, "users", 2),
			range: RangeSpec::new(b"a".to_vec(), b"m".to_vec()),
			transfer_log: Some("log/transfer/4-x".into()),
			schema_json: r#"{"generation":2,"access_groups":[]}"#.into(),
			state: RangeState::SplitLogInstalled {
				split_row: b"g".to_vec(),
				transfer_log: "log/transfer/4-x".into(),
			},
		};
		let encoded = request.encode();
		let mut input = encoded.as_slice();
		assert_eq!(LoadRangeRequest::decode(&mut input).unwrap(), request);
		assert!(input.is_empty());
	}

	#[test]
	fn response_envelope_round_trip() {
		let ok = encode_ok_response(b"payload");
		assert_eq!(decode_response(&ok).unwrap(), b"payload");

		let err = encode_error_response(&Error::OutOfRange);
		match decode_response(&err) {
			Err(Error::Remote { code, .. }) => {
				assert_eq!(code, strata_core::code::OUT_OF_RANGE)
			}
			other => panic!("expected remote error, got {other:?}"),
		}
	}

	#[test]
	fn send_backs_round_trip() {
		let send_backs = vec![
			SendBack { error: strata_core::code::OUT_OF_RANGE, count: 2, offset: 0, len: 64 },
			SendBack { error: strata_core::code::OK, count: 1, offset: 64, len: 32 },
		];
		let encoded = encode_send_backs(&send_backs);
		let mut input = encoded.as_slice();
		assert_eq!(decode_send_backs(&mut input).unwrap(), send_backs);
	}
}
