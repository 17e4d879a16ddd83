// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 StrataDB

use strata_core::{
	Error, Result,
	util::{
		checksum::additive16,
		encoding::{decode_i64, decode_u8, decode_u16, decode_u32, encode_i64, encode_u16, encode_u32},
	},
};

pub const BLOCK_MAGIC: [u8; 8] = *b"STRCLOG1";
pub const HEADER_LEN: usize = 28;

pub const BLOCK_TYPE_DATA: u8 = 0;
/// A link block's payload names a foreign log directory whose fragments
/// are part of this log's record stream from this point on.
pub const BLOCK_TYPE_LINK: u8 = 1;

pub const COMPRESSION_NONE: u8 = 0;
pub const COMPRESSION_ZSTD: u8 = 1;

/// Header of one commit-log block:
/// `magic | checksum u16 | type u8 | compression u8 | uncompressed u32 |
/// compressed u32 | revision i64`. The checksum is the 16-bit additive
/// sum over the header (checksum field zeroed) plus the stored payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
	pub checksum: u16,
	pub block_type: u8,
	pub compression: u8,
	pub uncompressed_len: u32,
	pub compressed_len: u32,
	pub revision: i64,
}

impl BlockHeader {
	pub fn encode(&self) -> Vec<u8> {
		let mut buf = Vec::with_capacity(HEADER_LEN);
		buf.extend_from_slice(&BLOCK_MAGIC);
		encode_u16(&mut buf, self.checksum);
		buf.push(self.block_type);
		buf.push(self.compression);
		encode_u32(&mut buf, self.uncompressed_len);
		encode_u32(&mut buf, self.compressed_len);
		encode_i64(&mut buf, self.revision);
		buf
	}

	pub fn decode(input: &mut &[u8]) -> Result<Self> {
		if input.len() < HEADER_LEN {
			return Err(Error::Truncated("commit log block header".into()));
		}
		if input[..8] != BLOCK_MAGIC {
			return Err(Error::MalformedRequest("bad commit log block magic".into()));
		}
		*input = &input[8..];
		Ok(Self {
			checksum: decode_u16(input)?,
			block_type: decode_u8(input)?,
			compression: decode_u8(input)?,
			uncompressed_len: decode_u32(input)?,
			compressed_len: decode_u32(input)?,
			revision: decode_i64(input)?,
		})
	}

	fn sum(&self, payload: &[u8]) -> u16 {
		let mut zeroed = *self;
		zeroed.checksum = 0;
		additive16(&[&zeroed.encode(), payload])
	}
}

fn frame(block_type: u8, payload: &[u8], revision: i64) -> Result<Vec<u8>> {
	let compressed = zstd::bulk::compress(payload, 0)
		.map_err(|e| Error::Internal(format!("zstd compress: {e}")))?;
	let (compression, body) = if compressed.len() < payload.len() {
		(COMPRESSION_ZSTD, compressed)
	} else {
		(COMPRESSION_NONE, payload.to_vec())
	};
	let mut header = BlockHeader {
		checksum: 0,
		block_type,
		compression,
		uncompressed_len: payload.len() as u32,
		compressed_len: body.len() as u32,
		revision,
	};
	header.checksum = header.sum(&body);
	let mut out = header.encode();
	out.extend_from_slice(&body);
	Ok(out)
}

/// Compresses `payload` and frames it as a data block. Falls back to
/// storing raw bytes when compression does not shrink the payload.
pub fn encode_block(payload: &[u8], revision: i64) -> Result<Vec<u8>> {
	frame(BLOCK_TYPE_DATA, payload, revision)
}

/// Frames a link to a foreign log directory.
pub fn encode_link_block(dir: &str, latest_revision: i64) -> Result<Vec<u8>> {
	frame(BLOCK_TYPE_LINK, dir.as_bytes(), latest_revision)
}

/// Verifies the checksum and decompresses the block body.
pub fn decode_block(header: &BlockHeader, body: &[u8]) -> Result<Vec<u8>> {
	let computed = header.sum(body);
	if computed != header.checksum {
		return Err(Error::ChecksumMismatch {
			context: "commit log block".into(),
			computed: computed as u32,
			stored: header.checksum as u32,
		});
	}
	match header.compression {
		COMPRESSION_NONE => Ok(body.to_vec()),
		COMPRESSION_ZSTD => zstd::bulk::decompress(body, header.uncompressed_len as usize)
			.map_err(|e| Error::Internal(format!("zstd decompress: {e}"))),
		other => Err(Error::MalformedRequest(format!("unknown compression type {other}"))),
	}
}
