// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 StrataDB

use std::sync::Arc;

use parking_lot::Mutex;
use strata_fs::{Filesystem, FsFile};
use tracing::{debug, info, warn};

use strata_core::{Error, Result};

use crate::{block, fragment_name, parse_fragment_name, reader::CommitLogReader};

/// One sealed fragment, either our own or adopted from a linked log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentInfo {
	pub dir: String,
	pub id: u64,
	pub size: u64,
	/// Highest revision of any block in the fragment; `i64::MIN` when
	/// unknown (an unread pre-existing fragment), which exempts the
	/// fragment from pruning.
	pub latest_revision: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitLogStats {
	pub fragments: usize,
	pub total_size: u64,
	pub latest_revision: i64,
}

struct Inner {
	active: Option<Box<dyn FsFile>>,
	active_id: u64,
	active_size: u64,
	active_latest_revision: i64,
	needs_sync: bool,
	sealed: Vec<FragmentInfo>,
	latest_revision: i64,
	closed: bool,
}

/// Append-only rolling commit log over a filesystem directory.
///
/// A successful `write` with `sync=true` is the durability point: after a
/// crash, replay yields every pair with revision up to the written one.
pub struct CommitLog {
	fs: Arc<dyn Filesystem>,
	dir: String,
	roll_limit: u64,
	inner: Mutex<Inner>,
}

impl CommitLog {
	/// Opens the log directory for appending, starting a fragment after
	/// any that already exist. `prior` (the reader used for replay)
	/// supplies sizes and revisions of the existing fragments so pruning
	/// can reason about them.
	pub fn open(
		fs: Arc<dyn Filesystem>,
		dir: impl Into<String>,
		roll_limit: u64,
		prior: Option<&CommitLogReader>,
	) -> Result<Self> {
		let dir = dir.into();
		fs.mkdirs(&dir)?;

		let mut sealed: Vec<FragmentInfo> = match prior {
			Some(reader) => reader.fragments(),
			None => {
				let mut fragments = Vec::new();
				for name in fs.readdir(&dir)? {
					if let Some(id) = parse_fragment_name(&name) {
						fragments.push(FragmentInfo {
							dir: dir.clone(),
							id,
							size: fs.length(&format!("{dir}/{name}"))?,
							latest_revision: i64::MIN,
						});
					}
				}
				fragments
			}
		};
		sealed.retain(|f| f.size > 0);

		let next_id = sealed.iter().filter(|f| f.dir == dir).map(|f| f.id + 1).max().unwrap_or(0);
		let latest_revision =
			sealed.iter().map(|f| f.latest_revision).max().unwrap_or(i64::MIN).max(0);
		let active = fs.create(&format!("{}/{}", dir, fragment_name(next_id)))?;

		debug!(dir, fragment = next_id, "commit log opened");
		Ok(Self {
			fs,
			dir,
			roll_limit,
			inner: Mutex::new(Inner {
				active: Some(active),
				active_id: next_id,
				active_size: 0,
				active_latest_revision: i64::MIN,
				needs_sync: false,
				sealed,
				latest_revision,
				closed: false,
			}),
		})
	}

	pub fn dir(&self) -> &str {
		&self.dir
	}

	/// Appends one block. With `sync=false` the write may sit in OS
	/// buffers until a later synced write or an explicit `sync`; the
	/// caller must treat the batch as unacknowledged until then.
	pub fn write(&self, payload: &[u8], revision: i64, sync: bool) -> Result<()> {
		let framed = block::encode_block(payload, revision)?;
		self.append_framed(framed, revision, sync)
	}

	fn append_framed(&self, framed: Vec<u8>, revision: i64, sync: bool) -> Result<()> {
		let mut inner = self.inner.lock();
		if inner.closed {
			return Err(Error::ShuttingDown);
		}
		let active = inner.active.as_mut().expect("open log has an active fragment");
		active.append(&framed)?;
		if sync {
			active.sync()?;
			inner.needs_sync = false;
		} else {
			inner.needs_sync = true;
		}
		inner.active_size += framed.len() as u64;
		inner.active_latest_revision = inner.active_latest_revision.max(revision);
		inner.latest_revision = inner.latest_revision.max(revision);

		if inner.active_size >= self.roll_limit {
			self.roll(&mut inner)?;
		}
		Ok(())
	}

	/// Forces everything buffered to durable storage.
	pub fn sync(&self) -> Result<()> {
		let mut inner = self.inner.lock();
		if inner.needs_sync {
			if let Some(active) = inner.active.as_mut() {
				active.sync()?;
			}
			inner.needs_sync = false;
		}
		Ok(())
	}

	fn roll(&self, inner: &mut Inner) -> Result<()> {
		if let Some(mut active) = inner.active.take() {
			active.sync()?;
			inner.needs_sync = false;
		}
		let sealed = FragmentInfo {
			dir: self.dir.clone(),
			id: inner.active_id,
			size: inner.active_size,
			latest_revision: inner.active_latest_revision,
		};
		info!(dir = %self.dir, fragment = sealed.id, size = sealed.size, "commit log fragment sealed");
		inner.sealed.push(sealed);
		inner.active_id += 1;
		inner.active = Some(self.fs.create(&format!("{}/{}", self.dir, fragment_name(inner.active_id)))?);
		inner.active_size = 0;
		inner.active_latest_revision = i64::MIN;
		Ok(())
	}

	fn adopt(&self, dir: &str, fragments: Vec<FragmentInfo>) -> Result<()> {
		let latest =
			fragments.iter().map(|f| f.latest_revision).max().unwrap_or(i64::MIN).max(0);
		// The durable link record: replay of this log follows it into
		// the foreign directory, so the linked records survive restart.
		let framed = block::encode_link_block(dir, latest)?;
		self.append_framed(framed, latest, true)?;
		let mut inner = self.inner.lock();
		for fragment in fragments {
			if fragment.size > 0 {
				inner.latest_revision = inner.latest_revision.max(fragment.latest_revision);
				inner.sealed.push(fragment);
			}
		}
		debug!(dir = %self.dir, linked = dir, "linked foreign log");
		Ok(())
	}

	/// Adopts the fragments behind `reader` (a foreign log that has been
	/// fully read, e.g. a range transfer log) by reference, recording a
	/// durable link block.
	pub fn link_reader(&self, reader: &CommitLogReader) -> Result<()> {
		self.adopt(reader.log_dir(), reader.fragments())
	}

	/// Closes `other` (sealing its buffered tail so no record is lost)
	/// and adopts its fragments by reference.
	pub fn link_log(&self, other: &CommitLog) -> Result<()> {
		other.close()?;
		self.adopt(&other.dir, other.fragments_snapshot())
	}

	/// Deletes sealed fragments whose highest revision lies strictly
	/// below `threshold_revision`, keeping at least `min_retained` bytes
	/// of log overall. Returns the number of fragments deleted.
	pub fn purge(&self, threshold_revision: i64, min_retained: u64) -> Result<usize> {
		let mut inner = self.inner.lock();
		let mut total: u64 =
			inner.sealed.iter().map(|f| f.size).sum::<u64>() + inner.active_size;
		let mut deleted = 0;
		let mut keep = Vec::with_capacity(inner.sealed.len());
		for fragment in std::mem::take(&mut inner.sealed) {
			let prunable = fragment.latest_revision != i64::MIN
				&& fragment.latest_revision < threshold_revision
				&& total - fragment.size >= min_retained;
			if prunable {
				let path = format!("{}/{}", fragment.dir, fragment_name(fragment.id));
				match self.fs.remove(&path) {
					Ok(()) => {
						total -= fragment.size;
						deleted += 1;
						debug!(path, latest_revision = fragment.latest_revision, "pruned fragment");
					}
					Err(e) => {
						warn!(path, error = %e, "failed to prune fragment");
						keep.push(fragment);
					}
				}
			} else {
				keep.push(fragment);
			}
		}
		inner.sealed = keep;
		Ok(deleted)
	}

	pub fn latest_revision(&self) -> i64 {
		self.inner.lock().latest_revision
	}

	pub fn stats(&self) -> CommitLogStats {
		let inner = self.inner.lock();
		CommitLogStats {
			fragments: inner.sealed.len() + usize::from(inner.active.is_some()),
			total_size: inner.sealed.iter().map(|f| f.size).sum::<u64>() + inner.active_size,
			latest_revision: inner.latest_revision,
		}
	}

	pub fn fragments_snapshot(&self) -> Vec<FragmentInfo> {
		let inner = self.inner.lock();
		let mut fragments = inner.sealed.clone();
		if inner.active_size > 0 {
			fragments.push(FragmentInfo {
				dir: self.dir.clone(),
				id: inner.active_id,
				size: inner.active_size,
				latest_revision: inner.active_latest_revision,
			});
		}
		fragments
	}

	/// Seals the active fragment. Further writes fail.
	pub fn close(&self) -> Result<()> {
		let mut inner = self.inner.lock();
		if inner.closed {
			return Ok(());
		}
		if let Some(mut active) = inner.active.take() {
			active.sync()?;
		}
		if inner.active_size > 0 {
			let sealed = FragmentInfo {
				dir: self.dir.clone(),
				id: inner.active_id,
				size: inner.active_size,
				latest_revision: inner.active_latest_revision,
			};
			inner.sealed.push(sealed);
		}
		// The fragment lives in `sealed` now; clearing the active
		// accounting keeps snapshots and stats from emitting it twice.
		inner.active_size = 0;
		inner.active_latest_revision = i64::MIN;
		inner.needs_sync = false;
		inner.closed = true;
		Ok(())
	}
}
