// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 StrataDB

//! Immutable sorted cell-store files.
//!
//! Layout: compressed data blocks of `(key, value)` pairs, a compressed
//! block index of `(last_key, offset, length)` entries, then a fixed-size
//! trailer. The trailer reserves bloom-filter coordinates; a zero filter
//! offset means no filter is present.

use std::sync::Arc;

use parking_lot::Mutex;
use strata_fs::{Filesystem, FsFile, FsReader};
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

use strata_core::{
	CellKey, Error, Result,
	key::{WireKeyRef, encode_wire_full},
	util::encoding::{
		decode_bytes, decode_i64, decode_u8, decode_u16, decode_u32, decode_u64, encode_bytes,
		encode_i64, encode_u8, encode_u16, encode_u32, encode_u64,
	},
};

use crate::block_cache::BlockCache;

const BLOCK_MAGIC: [u8; 8] = *b"STRCST01";
const BLOCK_HEADER_LEN: usize = 21;
const TRAILER_MAGIC: [u8; 8] = *b"STRCSTRL";
pub const TRAILER_LEN: usize = 59;
const TRAILER_VERSION: u16 = 1;

const COMPRESSION_NONE: u8 = 0;
const COMPRESSION_ZSTD: u8 = 1;

fn checksum32(data: &[u8]) -> u32 {
	xxh3_64(data) as u32
}

/// Fixed footer; its `version` field governs the layout of everything
/// else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trailer {
	pub version: u16,
	pub compression: u8,
	pub block_size: u32,
	pub index_offset: u64,
	pub index_len: u32,
	pub index_entries: u32,
	/// 0 means the store carries no bloom filter.
	pub filter_offset: u64,
	pub filter_len: u32,
	pub total_entries: u64,
	pub latest_revision: i64,
}

impl Trailer {
	fn encode(&self) -> Vec<u8> {
		let mut buf = Vec::with_capacity(TRAILER_LEN);
		encode_u16(&mut buf, self.version);
		encode_u8(&mut buf, self.compression);
		encode_u32(&mut buf, self.block_size);
		encode_u64(&mut buf, self.index_offset);
		encode_u32(&mut buf, self.index_len);
		encode_u32(&mut buf, self.index_entries);
		encode_u64(&mut buf, self.filter_offset);
		encode_u32(&mut buf, self.filter_len);
		encode_u64(&mut buf, self.total_entries);
		encode_i64(&mut buf, self.latest_revision);
		buf.extend_from_slice(&TRAILER_MAGIC);
		debug_assert_eq!(buf.len(), TRAILER_LEN);
		buf
	}

	fn decode(bytes: &[u8]) -> Result<Self> {
		if bytes.len() != TRAILER_LEN || bytes[TRAILER_LEN - 8..] != TRAILER_MAGIC {
			return Err(Error::MalformedRequest("bad cell store trailer".into()));
		}
		let mut input = &bytes[..TRAILER_LEN - 8];
		let trailer = Self {
			version: decode_u16(&mut input)?,
			compression: decode_u8(&mut input)?,
			block_size: decode_u32(&mut input)?,
			index_offset: decode_u64(&mut input)?,
			index_len: decode_u32(&mut input)?,
			index_entries: decode_u32(&mut input)?,
			filter_offset: decode_u64(&mut input)?,
			filter_len: decode_u32(&mut input)?,
			total_entries: decode_u64(&mut input)?,
			latest_revision: decode_i64(&mut input)?,
		};
		if trailer.version != TRAILER_VERSION {
			return Err(Error::MalformedRequest(format!(
				"unsupported cell store version {}",
				trailer.version
			)));
		}
		Ok(trailer)
	}
}

fn frame_block(payload: &[u8]) -> Result<(Vec<u8>, u8)> {
	let compressed =
		zstd::bulk::compress(payload, 0).map_err(|e| Error::Internal(format!("zstd: {e}")))?;
	let (compression, body) = if compressed.len() < payload.len() {
		(COMPRESSION_ZSTD, compressed)
	} else {
		(COMPRESSION_NONE, payload.to_vec())
	};
	let mut framed = Vec::with_capacity(BLOCK_HEADER_LEN + body.len());
	framed.extend_from_slice(&BLOCK_MAGIC);
	encode_u32(&mut framed, checksum32(&body));
	encode_u8(&mut framed, compression);
	encode_u32(&mut framed, payload.len() as u32);
	encode_u32(&mut framed, body.len() as u32);
	framed.extend_from_slice(&body);
	Ok((framed, compression))
}

fn unframe_block(bytes: &[u8], context: &str) -> Result<Vec<u8>> {
	if bytes.len() < BLOCK_HEADER_LEN || bytes[..8] != BLOCK_MAGIC {
		return Err(Error::MalformedRequest(format!("bad {context} block header")));
	}
	let mut input = &bytes[8..BLOCK_HEADER_LEN];
	let stored = decode_u32(&mut input)?;
	let compression = decode_u8(&mut input)?;
	let uncompressed_len = decode_u32(&mut input)? as usize;
	let compressed_len = decode_u32(&mut input)? as usize;
	let body = bytes
		.get(BLOCK_HEADER_LEN..BLOCK_HEADER_LEN + compressed_len)
		.ok_or_else(|| Error::Truncated(format!("{context} block body")))?;
	let computed = checksum32(body);
	if computed != stored {
		return Err(Error::ChecksumMismatch {
			context: format!("{context} block"),
			computed,
			stored,
		});
	}
	match compression {
		COMPRESSION_NONE => Ok(body.to_vec()),
		COMPRESSION_ZSTD => zstd::bulk::decompress(body, uncompressed_len)
			.map_err(|e| Error::Internal(format!("zstd: {e}"))),
		other => Err(Error::MalformedRequest(format!("unknown compression {other}"))),
	}
}

#[derive(Debug, Clone)]
struct IndexEntry {
	last_key: CellKey,
	offset: u64,
	length: u32,
}

/// Streams sorted `(key, value)` pairs into a new cell-store file.
pub struct CellStoreWriter {
	file: Box<dyn FsFile>,
	path: String,
	block_size: u32,
	buf: Vec<u8>,
	index: Vec<IndexEntry>,
	last_key: Option<CellKey>,
	total_entries: u64,
	latest_revision: i64,
}

impl CellStoreWriter {
	pub fn create(fs: &Arc<dyn Filesystem>, path: impl Into<String>, block_size: u32) -> Result<Self> {
		let path = path.into();
		let file = fs.create(&path)?;
		Ok(Self {
			file,
			path,
			block_size,
			buf: Vec::new(),
			index: Vec::new(),
			last_key: None,
			total_entries: 0,
			latest_revision: i64::MIN,
		})
	}

	/// Keys must arrive in ascending serialized order.
	pub fn add(&mut self, key: &CellKey, value: &[u8]) -> Result<()> {
		if let Some(last) = &self.last_key {
			if key <= last {
				return Err(Error::Internal(format!(
					"cell store keys out of order: {key:?} after {last:?}"
				)));
			}
		}
		encode_wire_full(&mut self.buf, key);
		encode_bytes(&mut self.buf, value);
		self.last_key = Some(key.clone());
		self.total_entries += 1;
		self.latest_revision = self.latest_revision.max(key.revision());
		if self.buf.len() >= self.block_size as usize {
			self.flush_block()?;
		}
		Ok(())
	}

	fn flush_block(&mut self) -> Result<()> {
		if self.buf.is_empty() {
			return Ok(());
		}
		let (framed, _) = frame_block(&self.buf)?;
		let offset = self.file.append(&framed)?;
		self.index.push(IndexEntry {
			last_key: self.last_key.clone().expect("non-empty block has a last key"),
			offset,
			length: framed.len() as u32,
		});
		self.buf.clear();
		Ok(())
	}

	/// Writes the index and trailer and syncs the file. Returns the
	/// total file size.
	pub fn finish(mut self) -> Result<u64> {
		self.flush_block()?;

		let mut index_payload = Vec::new();
		for entry in &self.index {
			encode_bytes(&mut index_payload, entry.last_key.as_bytes());
			encode_u64(&mut index_payload, entry.offset);
			encode_u32(&mut index_payload, entry.length);
		}
		let (framed_index, _) = frame_block(&index_payload)?;
		let index_offset = self.file.append(&framed_index)?;

		let trailer = Trailer {
			version: TRAILER_VERSION,
			compression: COMPRESSION_ZSTD,
			block_size: self.block_size,
			index_offset,
			index_len: framed_index.len() as u32,
			index_entries: self.index.len() as u32,
			filter_offset: 0,
			filter_len: 0,
			total_entries: self.total_entries,
			latest_revision: self.latest_revision,
		};
		self.file.append(&trailer.encode())?;
		self.file.sync()?;
		debug!(path = %self.path, entries = self.total_entries, blocks = self.index.len(), "cell store written");
		Ok(self.file.len())
	}
}

struct Inner {
	file_id: u64,
	path: String,
	reader: Mutex<Box<dyn FsReader>>,
	index: Vec<IndexEntry>,
	trailer: Trailer,
	disk_size: u64,
	block_cache: Arc<BlockCache>,
}

/// Read handle to one immutable cell-store file. Clones share the
/// descriptor; the file outlives compaction for as long as any clone
/// (e.g. a live scanner) remains.
#[derive(Clone)]
pub struct CellStore {
	inner: Arc<Inner>,
}

impl CellStore {
	pub fn open(
		fs: &Arc<dyn Filesystem>,
		path: impl Into<String>,
		file_id: u64,
		block_cache: Arc<BlockCache>,
	) -> Result<Self> {
		let path = path.into();
		let mut reader = fs.open(&path)?;
		let disk_size = reader.len();
		if disk_size < TRAILER_LEN as u64 {
			return Err(Error::MalformedRequest(format!("cell store too small: {path}")));
		}
		let trailer_bytes = reader.read_at(disk_size - TRAILER_LEN as u64, TRAILER_LEN)?;
		let trailer = Trailer::decode(&trailer_bytes)?;

		let framed_index = reader.read_at(trailer.index_offset, trailer.index_len as usize)?;
		let index_payload = unframe_block(&framed_index, "cell store index")?;
		let mut cursor = index_payload.as_slice();
		let mut index = Vec::with_capacity(trailer.index_entries as usize);
		for _ in 0..trailer.index_entries {
			let key_bytes = decode_bytes(&mut cursor)?.to_vec();
			index.push(IndexEntry {
				last_key: CellKey::from_bytes(key_bytes)?,
				offset: decode_u64(&mut cursor)?,
				length: decode_u32(&mut cursor)?,
			});
		}

		Ok(Self {
			inner: Arc::new(Inner {
				file_id,
				path,
				reader: Mutex::new(reader),
				index,
				trailer,
				disk_size,
				block_cache,
			}),
		})
	}

	pub fn path(&self) -> &str {
		&self.inner.path
	}

	pub fn file_id(&self) -> u64 {
		self.inner.file_id
	}

	pub fn total_entries(&self) -> u64 {
		self.inner.trailer.total_entries
	}

	pub fn latest_revision(&self) -> i64 {
		self.inner.trailer.latest_revision
	}

	pub fn disk_size(&self) -> u64 {
		self.inner.disk_size
	}

	/// Row of the middle index entry, a cheap split-point candidate.
	pub fn split_row_candidate(&self) -> Option<Vec<u8>> {
		if self.inner.index.len() < 2 {
			return None;
		}
		let middle = &self.inner.index[self.inner.index.len() / 2];
		Some(middle.last_key.row().to_vec())
	}

	fn read_block(&self, block_idx: usize) -> Result<Arc<[u8]>> {
		let entry = &self.inner.index[block_idx];
		if let Some(block) = self.inner.block_cache.get(self.inner.file_id, entry.offset) {
			return Ok(block);
		}
		let framed = {
			let mut reader = self.inner.reader.lock();
			reader.read_at(entry.offset, entry.length as usize)?
		};
		let payload = unframe_block(&framed, "cell store data")?;
		let block: Arc<[u8]> = Arc::from(payload.into_boxed_slice());
		self.inner.block_cache.insert(self.inner.file_id, entry.offset, block.clone());
		Ok(block)
	}

	/// First block that could contain keys of `row` or later.
	fn seek_block(&self, row: &[u8]) -> usize {
		self.inner.index.partition_point(|entry| entry.last_key.row() < row)
	}

	/// Scanner over `(start_row, end_row]`; empty bounds are open.
	pub fn scanner(&self, start_row: &[u8], end_row: &[u8]) -> CellStoreScanner {
		let block_idx = if start_row.is_empty() { 0 } else { self.seek_block(start_row) };
		CellStoreScanner {
			store: self.clone(),
			block_idx,
			block: None,
			offset: 0,
			skip_through_row: if start_row.is_empty() { None } else { Some(start_row.to_vec()) },
			end_row: if end_row.is_empty() { None } else { Some(end_row.to_vec()) },
			failed: false,
		}
	}
}

pub struct CellStoreScanner {
	store: CellStore,
	block_idx: usize,
	block: Option<Arc<[u8]>>,
	offset: usize,
	/// Rows up to and including this one are skipped (range starts are
	/// exclusive).
	skip_through_row: Option<Vec<u8>>,
	end_row: Option<Vec<u8>>,
	failed: bool,
}

impl crate::scanner::CellScanner for CellStoreScanner {
	fn next_cell(&mut self) -> Option<crate::scanner::CellEntry> {
		if self.failed {
			return None;
		}
		loop {
			if self.block.is_none() {
				if self.block_idx >= self.store.inner.index.len() {
					return None;
				}
				match self.store.read_block(self.block_idx) {
					Ok(block) => {
						self.block = Some(block);
						self.offset = 0;
					}
					Err(e) => {
						tracing::error!(path = %self.store.inner.path, error = %e, "cell store read failed");
						self.failed = true;
						return None;
					}
				}
			}

			let block = self.block.as_ref().expect("block loaded");
			if self.offset >= block.len() {
				self.block = None;
				self.block_idx += 1;
				continue;
			}

			let mut cursor = &block[self.offset..];
			let parsed = (|| -> strata_core::Result<(CellKey, Vec<u8>)> {
				let wire = WireKeyRef::decode(&mut cursor)?;
				let value = decode_bytes(&mut cursor)?.to_vec();
				Ok((CellKey::from_bytes(rebuild_cell_key(&wire)?)?, value))
			})();
			let (key, value) = match parsed {
				Ok(pair) => pair,
				Err(e) => {
					tracing::error!(path = %self.store.inner.path, error = %e, "corrupt cell store entry");
					self.failed = true;
					return None;
				}
			};
			self.offset = block.len() - cursor.len();

			if let Some(skip) = &self.skip_through_row {
				if key.row() <= skip.as_slice() {
					continue;
				}
			}
			if let Some(end) = &self.end_row {
				if key.row() > end.as_slice() {
					self.block = None;
					self.block_idx = self.store.inner.index.len();
					return None;
				}
			}
			return Some(crate::scanner::CellEntry {
				key,
				value: Arc::from(value.into_boxed_slice()),
			});
		}
	}
}

fn rebuild_cell_key(wire: &WireKeyRef<'_>) -> Result<Vec<u8>> {
	let timestamp = wire
		.timestamp
		.ok_or_else(|| Error::BadKey("stored key missing timestamp".into()))?;
	let revision = wire
		.revision
		.ok_or_else(|| Error::BadKey("stored key missing revision".into()))?;
	let mut bytes = Vec::with_capacity(wire.row.len() + wire.qualifier.len() + 20);
	bytes.extend_from_slice(wire.row);
	bytes.push(0);
	bytes.push(wire.family);
	bytes.extend_from_slice(wire.qualifier);
	bytes.push(0);
	bytes.push(wire.flag);
	strata_core::key::encode_ts64(&mut bytes, timestamp);
	strata_core::key::encode_ts64(&mut bytes, revision);
	Ok(bytes)
}

#[cfg(test)]
mod tests {
	use strata_core::key::{Key, flag};
	use strata_fs::LocalFs;
	use strata_testing::tempdir::temp_dir;

	use crate::scanner::CellScanner;

	use super::*;

	fn cell_key(row: &str, ts: i64) -> CellKey {
		CellKey::encode(&Key {
			row: row.as_bytes().to_vec(),
			family: 1,
			qualifier: b"q".to_vec(),
			flag: flag::INSERT,
			timestamp: ts,
			revision: ts,
		})
		.unwrap()
	}

	fn write_store(fs: &Arc<dyn Filesystem>, path: &str, rows: u32) -> Result<()> {
		let mut writer = CellStoreWriter::create(fs, path, 256)?;
		for i in 0..rows {
			let key = cell_key(&format!("row-{i:05}"), 100 + i as i64);
			writer.add(&key, format!("value-{i}").as_bytes())?;
		}
		writer.finish()?;
		Ok(())
	}

	#[test]
	fn write_read_round_trip() {
		temp_dir(|root| {
			let fs: Arc<dyn Filesystem> = Arc::new(LocalFs::new(root));
			write_store(&fs, "ag/cs0", 500)?;

			let cache = Arc::new(BlockCache::new(0, 1 << 20));
			let store = CellStore::open(&fs, "ag/cs0", 1, cache)?;
			assert_eq!(store.total_entries(), 500);
			assert_eq!(store.latest_revision(), 599);

			let mut scanner = store.scanner(b"", b"");
			let mut count = 0u32;
			let mut prev: Option<CellKey> = None;
			while let Some(entry) = scanner.next_cell() {
				if let Some(prev) = &prev {
					assert!(entry.key > *prev, "keys must come back in order");
				}
				assert_eq!(
					entry.value.as_ref(),
					format!("value-{count}").as_bytes(),
					"value for {:?}",
					entry.key
				);
				prev = Some(entry.key);
				count += 1;
			}
			assert_eq!(count, 500);
			Ok(())
		})
		.unwrap()
	}

	#[test]
	fn scanner_seeks_within_bounds() {
		temp_dir(|root| {
			let fs: Arc<dyn Filesystem> = Arc::new(LocalFs::new(root));
			write_store(&fs, "ag/cs0", 100)?;
			let cache = Arc::new(BlockCache::new(0, 1 << 20));
			let store = CellStore::open(&fs, "ag/cs0", 1, cache)?;

			let mut scanner = store.scanner(b"row-00010", b"row-00013");
			let mut rows = Vec::new();
			while let Some(entry) = scanner.next_cell() {
				rows.push(String::from_utf8_lossy(entry.key.row()).into_owned());
			}
			assert_eq!(rows, vec!["row-00011", "row-00012", "row-00013"]);
			Ok(())
		})
		.unwrap()
	}

	#[test]
	fn blocks_come_from_cache_on_rescan() {
		temp_dir(|root| {
			let fs: Arc<dyn Filesystem> = Arc::new(LocalFs::new(root));
			write_store(&fs, "ag/cs0", 200)?;
			let cache = Arc::new(BlockCache::new(0, 1 << 20));
			let store = CellStore::open(&fs, "ag/cs0", 1, cache.clone())?;

			let mut scanner = store.scanner(b"", b"");
			while scanner.next_cell().is_some() {}
			let cached = cache.memory_used();
			assert!(cached > 0);

			let mut scanner = store.scanner(b"", b"");
			while scanner.next_cell().is_some() {}
			assert_eq!(cache.memory_used(), cached);
			Ok(())
		})
		.unwrap()
	}

	#[test]
	fn split_row_candidate_is_interior() {
		temp_dir(|root| {
			let fs: Arc<dyn Filesystem> = Arc::new(LocalFs::new(root));
			write_store(&fs, "ag/cs0", 400)?;
			let cache = Arc::new(BlockCache::new(0, 1 << 20));
			let store = CellStore::open(&fs, "ag/cs0", 1, cache)?;
			let row = store.split_row_candidate().expect("multi-block store");
			assert!(row.as_slice() > b"row-00000".as_slice());
			assert!(row.as_slice() < b"row-00399".as_slice());
			Ok(())
		})
		.unwrap()
	}

	#[test]
	fn out_of_order_add_rejected() {
		temp_dir(|root| {
			let fs: Arc<dyn Filesystem> = Arc::new(LocalFs::new(root));
			let mut writer = CellStoreWriter::create(&fs, "ag/cs0", 256)?;
			writer.add(&cell_key("b", 1), b"v")?;
			assert!(writer.add(&cell_key("a", 1), b"v").is_err());
			Ok(())
		})
		.unwrap()
	}
}
