// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 StrataDB

use thiserror::Error;

/// Stable numeric codes carried on the wire. The taxonomy mirrors the error
/// families a client has to react to differently: protocol errors keep the
/// connection, transient errors are retried, validation errors are surfaced
/// per row, fatal errors terminate the process.
pub mod code {
	pub const OK: u32 = 0;

	// protocol
	pub const BAD_HEADER: u32 = 1;
	pub const BAD_COMMAND: u32 = 2;
	pub const MALFORMED_REQUEST: u32 = 3;
	pub const REQUEST_TRUNCATED: u32 = 4;
	pub const CHECKSUM_MISMATCH: u32 = 5;
	pub const BAD_KEY: u32 = 6;

	// comm
	pub const COMM_BROKEN_CONNECTION: u32 = 16;
	pub const COMM_CONNECT_ERROR: u32 = 17;
	pub const COMM_POLL_ERROR: u32 = 18;
	pub const REQUEST_TIMEOUT: u32 = 19;
	pub const QUEUE_FULL: u32 = 20;

	// I/O
	pub const IO_ERROR: u32 = 32;
	pub const FS_FILE_NOT_FOUND: u32 = 33;

	// range server
	pub const GENERATION_MISMATCH: u32 = 48;
	pub const OUT_OF_RANGE: u32 = 49;
	pub const RANGE_NOT_FOUND: u32 = 50;
	pub const RANGE_ALREADY_LOADED: u32 = 51;
	pub const TABLE_NOT_FOUND: u32 = 52;
	pub const TABLE_DROPPED: u32 = 53;
	pub const SCHEMA_PARSE_ERROR: u32 = 54;
	pub const REVISION_ORDER_ERROR: u32 = 55;
	pub const CLOCK_SKEW: u32 = 56;
	pub const INVALID_SCANNER_ID: u32 = 57;
	pub const BAD_SCAN_SPEC: u32 = 58;
	pub const LOW_MEMORY: u32 = 59;
	pub const SERVER_SHUTTING_DOWN: u32 = 60;

	pub const INTERNAL: u32 = 255;
}

#[derive(Debug, Error)]
pub enum Error {
	#[error("bad message header: {0}")]
	BadHeader(String),
	#[error("unknown command {0}")]
	BadCommand(u16),
	#[error("malformed request: {0}")]
	MalformedRequest(String),
	#[error("truncated input: {0}")]
	Truncated(String),
	#[error("checksum mismatch in {context}: computed {computed:#x}, stored {stored:#x}")]
	ChecksumMismatch { context: String, computed: u32, stored: u32 },
	#[error("bad key: {0}")]
	BadKey(String),

	#[error("broken connection")]
	BrokenConnection,
	#[error("connect error: {0}")]
	ConnectError(String),
	#[error("poll error: {0}")]
	PollError(String),
	#[error("request timed out")]
	RequestTimeout,
	#[error("application queue full")]
	QueueFull,

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
	#[error("file not found: {0}")]
	FileNotFound(String),

	#[error("schema generation mismatch for table '{table}': ours is {ours}, supplied is {supplied}")]
	GenerationMismatch { table: String, ours: u32, supplied: u32 },
	#[error("row outside of assigned ranges")]
	OutOfRange,
	#[error("range not found: {0}")]
	RangeNotFound(String),
	#[error("range already loaded: {0}")]
	RangeAlreadyLoaded(String),
	#[error("table not found: id={0}")]
	TableNotFound(u32),
	#[error("table has been dropped: {0}")]
	TableDropped(String),
	#[error("schema parse error: {0}")]
	SchemaParseError(String),
	#[error("supplied revision {supplied} is less than most recently seen revision {latest} for range {range}")]
	RevisionOrder { supplied: i64, latest: i64, range: String },
	#[error("clock skew of {skew_us} microseconds exceeds maximum {max_us} for range {range}")]
	ClockSkew { skew_us: i64, max_us: i64, range: String },
	#[error("invalid scanner id {0}")]
	InvalidScannerId(u32),
	#[error("bad scan spec: {0}")]
	BadScanSpec(String),
	#[error("over memory limit")]
	LowMemory,
	#[error("server shutting down")]
	ShuttingDown,

	/// Error that originated on a remote peer, reconstructed from a
	/// response frame.
	#[error("remote error {code}: {message}")]
	Remote { code: u32, message: String },

	#[error("{0}")]
	Internal(String),
}

impl Error {
	pub fn code(&self) -> u32 {
		match self {
			Error::BadHeader(_) => code::BAD_HEADER,
			Error::BadCommand(_) => code::BAD_COMMAND,
			Error::MalformedRequest(_) => code::MALFORMED_REQUEST,
			Error::Truncated(_) => code::REQUEST_TRUNCATED,
			Error::ChecksumMismatch { .. } => code::CHECKSUM_MISMATCH,
			Error::BadKey(_) => code::BAD_KEY,
			Error::BrokenConnection => code::COMM_BROKEN_CONNECTION,
			Error::ConnectError(_) => code::COMM_CONNECT_ERROR,
			Error::PollError(_) => code::COMM_POLL_ERROR,
			Error::RequestTimeout => code::REQUEST_TIMEOUT,
			Error::QueueFull => code::QUEUE_FULL,
			Error::Io(_) => code::IO_ERROR,
			Error::FileNotFound(_) => code::FS_FILE_NOT_FOUND,
			Error::GenerationMismatch { .. } => code::GENERATION_MISMATCH,
			Error::OutOfRange => code::OUT_OF_RANGE,
			Error::RangeNotFound(_) => code::RANGE_NOT_FOUND,
			Error::RangeAlreadyLoaded(_) => code::RANGE_ALREADY_LOADED,
			Error::TableNotFound(_) => code::TABLE_NOT_FOUND,
			Error::TableDropped(_) => code::TABLE_DROPPED,
			Error::SchemaParseError(_) => code::SCHEMA_PARSE_ERROR,
			Error::RevisionOrder { .. } => code::REVISION_ORDER_ERROR,
			Error::ClockSkew { .. } => code::CLOCK_SKEW,
			Error::InvalidScannerId(_) => code::INVALID_SCANNER_ID,
			Error::BadScanSpec(_) => code::BAD_SCAN_SPEC,
			Error::LowMemory => code::LOW_MEMORY,
			Error::ShuttingDown => code::SERVER_SHUTTING_DOWN,
			Error::Remote { code, .. } => *code,
			Error::Internal(_) => code::INTERNAL,
		}
	}

	pub fn remote(code: u32, message: impl Into<String>) -> Self {
		Error::Remote { code, message: message.into() }
	}
}
