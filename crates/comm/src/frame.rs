// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 StrataDB

use strata_core::{
	Error, Result,
	util::{
		checksum::xxh32,
		encoding::{decode_u8, decode_u16, decode_u32, encode_u16, encode_u32},
	},
};

pub const PROTOCOL_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 30;

pub const FLAG_REQUEST: u16 = 0x0001;
pub const FLAG_RESPONSE: u16 = 0x0002;
pub const FLAG_URGENT: u16 = 0x0004;

/// Fixed wire header preceding every message payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
	pub flags: u16,
	/// Message id, unique per connection direction.
	pub id: u32,
	/// Thread-group id; 0 means no serialization.
	pub gid: u32,
	/// Header plus payload, bytes.
	pub total_len: u32,
	pub timeout_ms: u32,
	/// 0 when unused.
	pub payload_checksum: u32,
	pub command: u16,
}

impl Header {
	pub fn payload_len(&self) -> usize {
		(self.total_len as usize).saturating_sub(HEADER_LEN)
	}

	pub fn is_request(&self) -> bool {
		self.flags & FLAG_REQUEST != 0
	}

	pub fn is_response(&self) -> bool {
		self.flags & FLAG_RESPONSE != 0
	}

	pub fn is_urgent(&self) -> bool {
		self.flags & FLAG_URGENT != 0
	}

	fn encode_with_checksum(&self, checksum: u32) -> [u8; HEADER_LEN] {
		let mut buf = Vec::with_capacity(HEADER_LEN);
		buf.push(PROTOCOL_VERSION);
		buf.push(HEADER_LEN as u8);
		encode_u16(&mut buf, self.flags);
		encode_u32(&mut buf, checksum);
		encode_u32(&mut buf, self.id);
		encode_u32(&mut buf, self.gid);
		encode_u32(&mut buf, self.total_len);
		encode_u32(&mut buf, self.timeout_ms);
		encode_u32(&mut buf, self.payload_checksum);
		encode_u16(&mut buf, self.command);
		buf.try_into().expect("header is exactly HEADER_LEN bytes")
	}

	pub fn encode(&self) -> [u8; HEADER_LEN] {
		let unsummed = self.encode_with_checksum(0);
		self.encode_with_checksum(xxh32(&unsummed))
	}

	pub fn decode(bytes: &[u8; HEADER_LEN]) -> Result<Self> {
		let mut input = bytes.as_slice();
		let version = decode_u8(&mut input)?;
		if version != PROTOCOL_VERSION {
			return Err(Error::BadHeader(format!("unsupported protocol version {version}")));
		}
		let header_len = decode_u8(&mut input)?;
		if header_len as usize != HEADER_LEN {
			return Err(Error::BadHeader(format!("unsupported header length {header_len}")));
		}
		let flags = decode_u16(&mut input)?;
		let stored_checksum = decode_u32(&mut input)?;
		let mut zeroed = *bytes;
		zeroed[4..8].fill(0);
		let computed = xxh32(&zeroed);
		if computed != stored_checksum {
			return Err(Error::ChecksumMismatch {
				context: "message header".into(),
				computed,
				stored: stored_checksum,
			});
		}
		let header = Self {
			flags,
			id: decode_u32(&mut input)?,
			gid: decode_u32(&mut input)?,
			total_len: decode_u32(&mut input)?,
			timeout_ms: decode_u32(&mut input)?,
			payload_checksum: decode_u32(&mut input)?,
			command: decode_u16(&mut input)?,
		};
		if (header.total_len as usize) < HEADER_LEN {
			return Err(Error::BadHeader(format!("total_len {} below header size", header.total_len)));
		}
		Ok(header)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn header() -> Header {
		Header {
			flags: FLAG_REQUEST | FLAG_URGENT,
			id: 7,
			gid: 42,
			total_len: 100,
			timeout_ms: 5000,
			payload_checksum: 0,
			command: 3,
		}
	}

	#[test]
	fn round_trip() {
		let encoded = header().encode();
		let decoded = Header::decode(&encoded).unwrap();
		assert_eq!(decoded, header());
		assert!(decoded.is_request());
		assert!(decoded.is_urgent());
		assert!(!decoded.is_response());
		assert_eq!(decoded.payload_len(), 70);
	}

	#[test]
	fn corrupted_header_rejected() {
		let mut encoded = header().encode();
		encoded[12] ^= 0x01; // flip a bit in the id
		assert!(matches!(
			Header::decode(&encoded),
			Err(Error::ChecksumMismatch { .. })
		));
	}

	#[test]
	fn wrong_version_rejected() {
		let mut encoded = header().encode();
		encoded[0] = 9;
		assert!(matches!(Header::decode(&encoded), Err(Error::BadHeader(_))));
	}
}
