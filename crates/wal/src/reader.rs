// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 StrataDB

use std::sync::Arc;

use strata_fs::{Filesystem, FsReader};
use tracing::warn;

use strata_core::{Error, Result};

use crate::{
	block::{self, BLOCK_TYPE_LINK, BlockHeader, HEADER_LEN},
	fragment_name, parse_fragment_name,
	writer::FragmentInfo,
};

/// One decoded commit-log block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogBlock {
	pub revision: i64,
	pub payload: Vec<u8>,
}

/// Sequential reader over a commit-log directory, yielding blocks in
/// fragment order and following link blocks into foreign directories.
/// Recovery tolerates a torn tail: a checksum failure or short block in
/// the *last* fragment ends the iteration with a warning; anywhere else
/// it is an error.
pub struct CommitLogReader {
	fs: Arc<dyn Filesystem>,
	dir: String,
	own: Vec<FragmentInfo>,
	linked: Vec<FragmentInfo>,
	current: usize,
	offset: u64,
	reader: Option<Box<dyn FsReader>>,
	/// Active link target being drained.
	sub: Option<Box<CommitLogReader>>,
	latest_revision: i64,
	done: bool,
}

impl CommitLogReader {
	/// A missing directory reads as an empty log.
	pub fn open(fs: Arc<dyn Filesystem>, dir: impl Into<String>) -> Result<Self> {
		let dir = dir.into();
		let mut own = Vec::new();
		if fs.exists(&dir)? {
			for name in fs.readdir(&dir)? {
				if let Some(id) = parse_fragment_name(&name) {
					let size = fs.length(&format!("{dir}/{name}"))?;
					if size > 0 {
						own.push(FragmentInfo {
							dir: dir.clone(),
							id,
							size,
							latest_revision: i64::MIN,
						});
					}
				}
			}
		}
		own.sort_by_key(|f| f.id);
		Ok(Self {
			fs,
			dir,
			own,
			linked: Vec::new(),
			current: 0,
			offset: 0,
			reader: None,
			sub: None,
			latest_revision: 0,
			done: false,
		})
	}

	pub fn is_empty(&self) -> bool {
		self.own.is_empty()
	}

	pub fn log_dir(&self) -> &str {
		&self.dir
	}

	/// Fragment metadata, own fragments first, then any reached through
	/// links; `latest_revision` fields are populated once the log has
	/// been read through.
	pub fn fragments(&self) -> Vec<FragmentInfo> {
		let mut all = self.own.clone();
		all.extend(self.linked.iter().cloned());
		all
	}

	pub fn latest_revision(&self) -> i64 {
		self.latest_revision
	}

	fn is_last_fragment(&self) -> bool {
		self.current + 1 >= self.own.len()
	}

	fn truncated(&mut self, what: &str) -> Result<Option<LogBlock>> {
		if self.is_last_fragment() {
			warn!(
				dir = %self.dir,
				fragment = self.own[self.current].id,
				offset = self.offset,
				"torn {what} at log tail, stopping replay here"
			);
			self.done = true;
			return Ok(None);
		}
		Err(Error::Truncated(format!(
			"{} in fragment {} of {}",
			what,
			self.own[self.current].id,
			self.dir
		)))
	}

	pub fn next(&mut self) -> Result<Option<LogBlock>> {
		if self.done {
			return Ok(None);
		}
		loop {
			// Drain an active link target first; its blocks belong at
			// this position in the stream.
			if let Some(sub) = self.sub.as_mut() {
				if let Some(block) = sub.next()? {
					self.latest_revision = self.latest_revision.max(block.revision);
					return Ok(Some(block));
				}
				let sub = self.sub.take().expect("sub reader present");
				self.latest_revision = self.latest_revision.max(sub.latest_revision());
				self.linked.extend(sub.fragments());
			}

			if self.current >= self.own.len() {
				self.done = true;
				return Ok(None);
			}
			if self.reader.is_none() {
				let fragment = &self.own[self.current];
				let path = format!("{}/{}", fragment.dir, fragment_name(fragment.id));
				self.reader = Some(self.fs.open(&path)?);
				self.offset = 0;
			}
			let size = self.own[self.current].size;
			if self.offset >= size {
				self.reader = None;
				self.current += 1;
				continue;
			}

			let reader = self.reader.as_mut().expect("fragment reader open");
			let header_bytes = reader.read_at(self.offset, HEADER_LEN)?;
			if header_bytes.len() < HEADER_LEN {
				return self.truncated("block header");
			}
			let mut cursor = header_bytes.as_slice();
			let header = match BlockHeader::decode(&mut cursor) {
				Ok(header) => header,
				Err(_) => return self.truncated("block header"),
			};
			let body =
				reader.read_at(self.offset + HEADER_LEN as u64, header.compressed_len as usize)?;
			if body.len() < header.compressed_len as usize {
				return self.truncated("block body");
			}
			let payload = match block::decode_block(&header, &body) {
				Ok(payload) => payload,
				Err(Error::ChecksumMismatch { .. }) => return self.truncated("block checksum"),
				Err(e) => return Err(e),
			};

			self.offset += (HEADER_LEN + body.len()) as u64;
			let fragment = &mut self.own[self.current];
			fragment.latest_revision = fragment.latest_revision.max(header.revision);

			if header.block_type == BLOCK_TYPE_LINK {
				let target = String::from_utf8_lossy(&payload).into_owned();
				self.sub = Some(Box::new(CommitLogReader::open(self.fs.clone(), target)?));
				continue;
			}

			self.latest_revision = self.latest_revision.max(header.revision);
			return Ok(Some(LogBlock { revision: header.revision, payload }));
		}
	}
}

#[cfg(test)]
mod tests {
	use strata_fs::LocalFs;
	use strata_testing::tempdir::temp_dir;

	use super::*;
	use crate::writer::CommitLog;

	fn read_all(reader: &mut CommitLogReader) -> Result<Vec<LogBlock>> {
		let mut blocks = Vec::new();
		while let Some(block) = reader.next()? {
			blocks.push(block);
		}
		Ok(blocks)
	}

	#[test]
	fn write_then_replay() {
		temp_dir(|root| {
			let fs: Arc<dyn Filesystem> = Arc::new(LocalFs::new(root));
			let log = CommitLog::open(fs.clone(), "log/user", 1 << 20, None)?;
			log.write(b"batch-1", 100, false)?;
			log.write(b"batch-2", 101, false)?;
			log.write(b"batch-3", 102, true)?;

			let mut reader = CommitLogReader::open(fs, "log/user")?;
			let blocks = read_all(&mut reader)?;
			assert_eq!(blocks.len(), 3);
			assert_eq!(blocks[0].payload, b"batch-1");
			assert_eq!(blocks[2].revision, 102);
			assert_eq!(reader.latest_revision(), 102);
			Ok(())
		})
		.unwrap()
	}

	#[test]
	fn rolls_into_numbered_fragments() {
		temp_dir(|root| {
			let fs: Arc<dyn Filesystem> = Arc::new(LocalFs::new(root));
			let log = CommitLog::open(fs.clone(), "log/user", 64, None)?;
			for revision in 0..10 {
				log.write(&[revision as u8; 100], revision, true)?;
			}
			assert!(log.stats().fragments > 1);

			let mut reader = CommitLogReader::open(fs, "log/user")?;
			let blocks = read_all(&mut reader)?;
			assert_eq!(blocks.len(), 10);
			assert_eq!(blocks[9].revision, 9);
			Ok(())
		})
		.unwrap()
	}

	#[test]
	fn torn_tail_is_elided() {
		temp_dir(|root| {
			let fs: Arc<dyn Filesystem> = Arc::new(LocalFs::new(root));
			let log = CommitLog::open(fs.clone(), "log/user", 1 << 20, None)?;
			log.write(b"intact", 5, true)?;
			log.close()?;

			// Simulate a crash mid-append of the next block.
			let mut file = fs.open_append("log/user/000000000")?;
			file.append(&crate::block::encode_block(b"torn", 6)?[..10])?;
			drop(file);

			let mut reader = CommitLogReader::open(fs, "log/user")?;
			let blocks = read_all(&mut reader)?;
			assert_eq!(blocks.len(), 1);
			assert_eq!(blocks[0].payload, b"intact");
			Ok(())
		})
		.unwrap()
	}

	#[test]
	fn corrupt_block_in_earlier_fragment_is_fatal() {
		temp_dir(|root| {
			let fs: Arc<dyn Filesystem> = Arc::new(LocalFs::new(root));
			let log = CommitLog::open(fs.clone(), "log/user", 32, None)?;
			log.write(&[1u8; 64], 1, true)?; // fragment 0, sealed by roll
			log.write(&[2u8; 64], 2, true)?; // fragment 1, sealed by roll
			log.write(b"tail", 3, true)?; // fragment 2
			log.close()?;

			// Flip a payload byte in the first fragment.
			let mut reader = fs.open("log/user/000000000")?;
			let mut bytes = reader.read_at(0, reader.len() as usize)?;
			let last = bytes.len() - 1;
			bytes[last] ^= 0xff;
			drop(reader);
			fs.remove("log/user/000000000")?;
			let mut file = fs.create("log/user/000000000")?;
			file.append(&bytes)?;
			drop(file);

			let mut reader = CommitLogReader::open(fs, "log/user")?;
			assert!(read_all(&mut reader).is_err());
			Ok(())
		})
		.unwrap()
	}

	#[test]
	fn purge_deletes_fragments_below_threshold() {
		temp_dir(|root| {
			let fs: Arc<dyn Filesystem> = Arc::new(LocalFs::new(root));
			let log = CommitLog::open(fs.clone(), "log/user", 32, None)?;
			for revision in 0..8 {
				log.write(&[0xabu8; 64], revision, true)?;
			}
			let before = log.stats();
			let deleted = log.purge(6, 0)?;
			assert!(deleted > 0);
			let after = log.stats();
			assert!(after.total_size < before.total_size);

			// Replay still yields everything at or above the threshold.
			let mut reader = CommitLogReader::open(fs, "log/user")?;
			let blocks = read_all(&mut reader)?;
			assert!(blocks.iter().all(|b| b.revision >= 6));
			assert!(blocks.iter().any(|b| b.revision == 7));
			Ok(())
		})
		.unwrap()
	}

	#[test]
	fn close_seals_the_tail_exactly_once() {
		temp_dir(|root| {
			let fs: Arc<dyn Filesystem> = Arc::new(LocalFs::new(root));
			let log = CommitLog::open(fs.clone(), "log/transfer", 1 << 20, None)?;
			log.write(b"one", 1, true)?;
			log.close()?;

			let stats = log.stats();
			assert_eq!(stats.fragments, 1);
			let snapshot = log.fragments_snapshot();
			assert_eq!(snapshot.len(), 1);
			assert_eq!(stats.total_size, snapshot[0].size);

			// Linking the closed log adopts its fragment exactly once,
			// so pruning deletes it once and accounts it once.
			let user = CommitLog::open(fs.clone(), "log/user", 1 << 20, None)?;
			user.link_log(&log)?;
			let adopted: Vec<FragmentInfo> = user
				.fragments_snapshot()
				.into_iter()
				.filter(|f| f.dir == "log/transfer")
				.collect();
			assert_eq!(adopted.len(), 1);
			assert_eq!(user.purge(100, 0)?, 1);
			assert!(!fs.exists("log/transfer/000000000")?);
			assert_eq!(user.purge(100, 0)?, 0, "nothing left to prune twice");
			Ok(())
		})
		.unwrap()
	}

	#[test]
	fn linked_log_replays_through_the_link_block() {
		temp_dir(|root| {
			let fs: Arc<dyn Filesystem> = Arc::new(LocalFs::new(root));
			let transfer = CommitLog::open(fs.clone(), "log/transfer", 1 << 20, None)?;
			transfer.write(b"split-off", 50, true)?;

			let user = CommitLog::open(fs.clone(), "log/user", 1 << 20, None)?;
			user.write(b"steady", 49, true)?;
			user.link_log(&transfer)?;
			user.write(b"after-link", 51, true)?;
			user.close()?;

			// A fresh reader of the user directory alone must see the
			// linked records: that is what restart recovery does.
			let mut reader = CommitLogReader::open(fs.clone(), "log/user")?;
			let payloads: Vec<Vec<u8>> =
				read_all(&mut reader)?.into_iter().map(|b| b.payload).collect();
			assert_eq!(payloads, vec![b"steady".to_vec(), b"split-off".to_vec(), b"after-link".to_vec()]);
			assert_eq!(reader.latest_revision(), 51);

			// Linked fragments surface for pruning through the user log.
			let reopened = CommitLog::open(fs.clone(), "log/user", 1 << 20, Some(&reader))?;
			let deleted = reopened.purge(100, 0)?;
			assert!(deleted >= 1);
			assert!(!fs.exists("log/transfer/000000000")?);
			Ok(())
		})
		.unwrap()
	}
}
