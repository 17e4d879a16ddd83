// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 StrataDB

//! Helpers shared by the range-server integration tests.

use std::{path::Path, sync::Arc};

use strata_core::{
	RangeSpec, RangeState, Result, ScanSpec, ServerOptions, TableIdentifier,
	key::{WireKeyRef, control, encode_wire_key, flag},
	util::encoding::{decode_bytes, encode_bytes},
};
use strata_fs::{Filesystem, LocalFs};
use strata_server::{RangeServer, ScanResult, Schema, SendBack};

pub const USERS_TABLE: u32 = 7;

pub fn users_table() -> TableIdentifier {
	TableIdentifier::new(USERS_TABLE, "users", 1)
}

pub fn users_schema() -> Schema {
	Schema::single_family(1, "default", "info")
}

pub fn start_server(root: &Path, opts: ServerOptions) -> Result<Arc<RangeServer>> {
	let fs: Arc<dyn Filesystem> = Arc::new(LocalFs::new(root));
	RangeServer::start(fs, opts)
}

pub fn load_users_range(server: &Arc<RangeServer>, spec: &RangeSpec) -> Result<()> {
	server.load_range(&users_table(), spec, None, &users_schema().to_json(), RangeState::Steady)
}

/// One serialized key/value pair with a server-assigned timestamp.
pub fn cell_auto(row: &str, qualifier: &str, value: &str) -> Vec<u8> {
	let mut buf = Vec::new();
	encode_wire_key(&mut buf, control::AUTO_TIMESTAMP, row.as_bytes(), 1, qualifier.as_bytes(), flag::INSERT, 0, 0);
	encode_bytes(&mut buf, value.as_bytes());
	buf
}

/// One pair with an explicit timestamp and revision.
pub fn cell_explicit(row: &str, qualifier: &str, ts: i64, revision: i64, value: &str) -> Vec<u8> {
	let mut buf = Vec::new();
	encode_wire_key(
		&mut buf,
		control::TS_AND_REV,
		row.as_bytes(),
		1,
		qualifier.as_bytes(),
		flag::INSERT,
		ts,
		revision,
	);
	encode_bytes(&mut buf, value.as_bytes());
	buf
}

pub fn delete_row_cell(row: &str, ts: i64, revision: i64) -> Vec<u8> {
	let mut buf = Vec::new();
	encode_wire_key(&mut buf, control::TS_AND_REV, row.as_bytes(), 0, b"", flag::DELETE_ROW, ts, revision);
	encode_bytes(&mut buf, b"");
	buf
}

pub fn batch(cells: &[Vec<u8>]) -> (u32, Vec<u8>) {
	let mut payload = Vec::new();
	for cell in cells {
		payload.extend_from_slice(cell);
	}
	(cells.len() as u32, payload)
}

pub fn update_ok(server: &Arc<RangeServer>, cells: &[Vec<u8>]) -> Result<Vec<SendBack>> {
	let (count, payload) = batch(cells);
	server.update(&users_table(), count, &payload, 0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedCell {
	pub row: Vec<u8>,
	pub qualifier: Vec<u8>,
	pub timestamp: i64,
	pub revision: i64,
	pub value: Vec<u8>,
}

pub fn decode_scan_block(block: &[u8]) -> Result<Vec<ScannedCell>> {
	let mut input = block;
	let mut cells = Vec::new();
	while !input.is_empty() {
		let wire = WireKeyRef::decode(&mut input)?;
		let value = decode_bytes(&mut input)?.to_vec();
		cells.push(ScannedCell {
			row: wire.row.to_vec(),
			qualifier: wire.qualifier.to_vec(),
			timestamp: wire.timestamp.unwrap_or_default(),
			revision: wire.revision.unwrap_or_default(),
			value,
		});
	}
	Ok(cells)
}

/// Runs a scan to completion, following `fetch_scanblock` pagination.
pub fn scan_all(
	server: &Arc<RangeServer>,
	spec: &RangeSpec,
	scan_spec: ScanSpec,
) -> Result<Vec<ScannedCell>> {
	let mut result: ScanResult = server.create_scanner(&users_table(), spec, scan_spec)?;
	let mut cells = decode_scan_block(&result.block)?;
	while !result.eos {
		result = server.fetch_scanblock(result.scanner_id)?;
		cells.extend(decode_scan_block(&result.block)?);
	}
	Ok(cells)
}

pub fn scan_row(server: &Arc<RangeServer>, spec: &RangeSpec, row: &str) -> Result<Vec<ScannedCell>> {
	scan_all(server, spec, ScanSpec::single_row(row.as_bytes().to_vec()))
}
