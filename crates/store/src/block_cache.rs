// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 StrataDB

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

/// Global LRU cache of decompressed cell-store blocks, keyed by
/// `(file_id, block_offset)`. Blocks are handed out as `Arc<[u8]>`, so a
/// scanner holding one keeps it alive across eviction. Size-bounded
/// between a floor (below which nothing is evicted) and a ceiling.
pub struct BlockCache {
	inner: Mutex<Inner>,
	min_memory: u64,
	max_memory: u64,
}

struct Inner {
	map: HashMap<(u64, u64), CachedBlock>,
	lru: BTreeMap<u64, (u64, u64)>,
	tick: u64,
	memory: u64,
}

struct CachedBlock {
	block: std::sync::Arc<[u8]>,
	tick: u64,
}

impl BlockCache {
	pub fn new(min_memory: u64, max_memory: u64) -> Self {
		Self {
			inner: Mutex::new(Inner {
				map: HashMap::new(),
				lru: BTreeMap::new(),
				tick: 0,
				memory: 0,
			}),
			min_memory,
			max_memory: max_memory.max(min_memory),
		}
	}

	pub fn get(&self, file_id: u64, offset: u64) -> Option<std::sync::Arc<[u8]>> {
		let mut inner = self.inner.lock();
		inner.tick += 1;
		let tick = inner.tick;
		let entry = inner.map.get_mut(&(file_id, offset))?;
		let old_tick = entry.tick;
		entry.tick = tick;
		let block = entry.block.clone();
		inner.lru.remove(&old_tick);
		inner.lru.insert(tick, (file_id, offset));
		Some(block)
	}

	pub fn insert(&self, file_id: u64, offset: u64, block: std::sync::Arc<[u8]>) {
		let mut inner = self.inner.lock();
		inner.tick += 1;
		let tick = inner.tick;
		let size = block.len() as u64;
		if let Some(old) = inner.map.insert((file_id, offset), CachedBlock { block, tick }) {
			inner.lru.remove(&old.tick);
			inner.memory -= old.block.len() as u64;
		}
		inner.lru.insert(tick, (file_id, offset));
		inner.memory += size;
		self.evict(&mut inner);
	}

	/// Drops every block of one file, e.g. after a compaction deletes it.
	pub fn retire_file(&self, file_id: u64) {
		let mut inner = self.inner.lock();
		let doomed: Vec<(u64, u64)> =
			inner.map.keys().filter(|(f, _)| *f == file_id).copied().collect();
		for key in doomed {
			if let Some(old) = inner.map.remove(&key) {
				inner.lru.remove(&old.tick);
				inner.memory -= old.block.len() as u64;
			}
		}
	}

	fn evict(&self, inner: &mut Inner) {
		while inner.memory > self.max_memory && inner.memory > self.min_memory {
			let Some((&tick, &key)) = inner.lru.iter().next() else { break };
			inner.lru.remove(&tick);
			if let Some(old) = inner.map.remove(&key) {
				inner.memory -= old.block.len() as u64;
			}
		}
	}

	pub fn memory_used(&self) -> u64 {
		self.inner.lock().memory
	}
}
