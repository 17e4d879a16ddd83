// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 StrataDB

use std::{
	sync::atomic::{AtomicI64, Ordering},
	time::{SystemTime, UNIX_EPOCH},
};

/// Wall-clock time in microseconds since the epoch.
pub fn now_micros() -> i64 {
	SystemTime::now().duration_since(UNIX_EPOCH).expect("clock before epoch").as_micros() as i64
}

/// Monotonic revision source. Revisions are microsecond wall-clock readings
/// bumped past the last value handed out, so they stay unique and
/// non-decreasing across all ranges of one server even when the clock
/// stalls or steps backwards.
#[derive(Debug, Default)]
pub struct RevisionClock {
	last: AtomicI64,
}

impl RevisionClock {
	pub fn new() -> Self {
		Self { last: AtomicI64::new(0) }
	}

	/// Restore the floor after log replay so fresh revisions stay above
	/// everything already durable.
	pub fn advance_to(&self, revision: i64) {
		self.last.fetch_max(revision, Ordering::SeqCst);
	}

	pub fn next(&self) -> i64 {
		let now = now_micros();
		let mut last = self.last.load(Ordering::SeqCst);
		loop {
			let next = if now > last { now } else { last + 1 };
			match self.last.compare_exchange_weak(last, next, Ordering::SeqCst, Ordering::SeqCst) {
				Ok(_) => return next,
				Err(observed) => last = observed,
			}
		}
	}

	pub fn latest(&self) -> i64 {
		self.last.load(Ordering::SeqCst)
	}
}
