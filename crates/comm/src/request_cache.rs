// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 StrataDB

use std::{
	collections::{HashMap, VecDeque},
	sync::Arc,
	time::Instant,
};

use crate::{comm::ConnId, event::DispatchHandler};

pub struct CachedRequest {
	pub conn: ConnId,
	pub deadline: Instant,
	/// `None` once purged; the node is reclaimed when the expiry sweep
	/// reaches it.
	pub handler: Option<Arc<dyn DispatchHandler>>,
}

/// Outstanding client requests owned by one reactor: an id-indexed map
/// plus an insertion-ordered expiry queue. Insertion order equals expiry
/// order as long as callers use uniform timeouts per connection; entries
/// that expire out of order are simply swept a little late, bounded by the
/// reactor's poll interval.
#[derive(Default)]
pub struct RequestCache {
	by_id: HashMap<u32, CachedRequest>,
	expiry: VecDeque<(Instant, u32)>,
}

impl RequestCache {
	pub fn insert(
		&mut self,
		id: u32,
		conn: ConnId,
		handler: Arc<dyn DispatchHandler>,
		deadline: Instant,
	) {
		self.by_id.insert(id, CachedRequest { conn, deadline, handler: Some(handler) });
		self.expiry.push_back((deadline, id));
	}

	/// Removes and returns the entry a response should be routed to.
	pub fn remove(&mut self, id: u32) -> Option<CachedRequest> {
		self.by_id.remove(&id)
	}

	/// Pops the next entry whose deadline has passed, skipping tombstones.
	pub fn next_expired(&mut self, now: Instant) -> Option<(u32, CachedRequest)> {
		while let Some(&(deadline, id)) = self.expiry.front() {
			if deadline > now {
				// Entries behind the head may still be expired if the
				// caller mixed timeouts; they surface on a later sweep.
				return None;
			}
			self.expiry.pop_front();
			match self.by_id.get(&id) {
				Some(entry) if entry.deadline <= now => {
					let entry = self.by_id.remove(&id).expect("entry present");
					if entry.handler.is_some() {
						return Some((id, entry));
					}
				}
				_ => {}
			}
		}
		None
	}

	/// Earliest deadline, for sizing the poll timeout.
	pub fn next_deadline(&self) -> Option<Instant> {
		self.expiry.front().map(|&(deadline, _)| deadline)
	}

	/// Marks every entry belonging to `conn` dead and returns the ids so
	/// the caller can fabricate broken-connection failures.
	pub fn purge_connection(&mut self, conn: ConnId) -> Vec<(u32, Arc<dyn DispatchHandler>)> {
		let mut purged = Vec::new();
		for (&id, entry) in self.by_id.iter_mut() {
			if entry.conn == conn {
				if let Some(handler) = entry.handler.take() {
					purged.push((id, handler));
				}
			}
		}
		purged
	}

	pub fn len(&self) -> usize {
		self.by_id.len()
	}

	pub fn is_empty(&self) -> bool {
		self.by_id.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use crate::event::{DispatchHandler, Event};

	use super::*;

	struct Sink;
	impl DispatchHandler for Sink {
		fn handle(&self, _event: Event) {}
	}

	fn handler() -> Arc<dyn DispatchHandler> {
		Arc::new(Sink)
	}

	#[test]
	fn expiry_in_insertion_order() {
		let mut cache = RequestCache::default();
		let now = Instant::now();
		cache.insert(1, ConnId(10), handler(), now + Duration::from_millis(5));
		cache.insert(2, ConnId(10), handler(), now + Duration::from_millis(10));

		assert!(cache.next_expired(now).is_none());
		let later = now + Duration::from_millis(7);
		assert_eq!(cache.next_expired(later).map(|(id, _)| id), Some(1));
		assert!(cache.next_expired(later).is_none());
		assert_eq!(cache.len(), 1);
	}

	#[test]
	fn removed_entries_do_not_expire() {
		let mut cache = RequestCache::default();
		let now = Instant::now();
		cache.insert(1, ConnId(10), handler(), now);
		assert!(cache.remove(1).is_some());
		assert!(cache.next_expired(now + Duration::from_secs(1)).is_none());
	}

	#[test]
	fn purge_tombstones_connection_entries() {
		let mut cache = RequestCache::default();
		let now = Instant::now();
		cache.insert(1, ConnId(10), handler(), now + Duration::from_millis(1));
		cache.insert(2, ConnId(11), handler(), now + Duration::from_millis(1));

		let purged = cache.purge_connection(ConnId(10));
		assert_eq!(purged.len(), 1);
		assert_eq!(purged[0].0, 1);

		// Only the other connection's entry fires.
		let fired = cache.next_expired(now + Duration::from_secs(1));
		assert_eq!(fired.map(|(id, _)| id), Some(2));
		assert!(cache.next_expired(now + Duration::from_secs(1)).is_none());
	}
}
