// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 StrataDB

use std::{
	cmp::Ordering as CmpOrdering,
	collections::{BinaryHeap, HashSet},
	sync::Arc,
	thread::{self, JoinHandle},
};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

/// Identifies the range a task concerns, so a range never has two
/// queued tasks at once.
pub type TaskKey = (u32, Vec<u8>);

type TaskFn = Box<dyn FnOnce() + Send>;

struct QueuedTask {
	priority: i32,
	seq: u64,
	key: TaskKey,
	task: TaskFn,
}

impl PartialEq for QueuedTask {
	fn eq(&self, other: &Self) -> bool {
		self.priority == other.priority && self.seq == other.seq
	}
}
impl Eq for QueuedTask {}
impl PartialOrd for QueuedTask {
	fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
		Some(self.cmp(other))
	}
}
impl Ord for QueuedTask {
	fn cmp(&self, other: &Self) -> CmpOrdering {
		// Higher priority first, then FIFO.
		self.priority.cmp(&other.priority).then(other.seq.cmp(&self.seq))
	}
}

struct Inner {
	heap: BinaryHeap<QueuedTask>,
	scheduled: HashSet<TaskKey>,
	running: usize,
	seq: u64,
	shutdown: bool,
}

/// Prioritized queue of compaction and split tasks executed by a small
/// worker pool. Tasks run under their range's maintenance lock (taken by
/// the task body), never under its update lock.
pub struct MaintenanceQueue {
	inner: Mutex<Inner>,
	cond: Condvar,
	idle: Condvar,
	workers: Mutex<Vec<JoinHandle<()>>>,
}

impl MaintenanceQueue {
	pub fn start(threads: usize) -> Arc<Self> {
		let queue = Arc::new(Self {
			inner: Mutex::new(Inner {
				heap: BinaryHeap::new(),
				scheduled: HashSet::new(),
				running: 0,
				seq: 0,
				shutdown: false,
			}),
			cond: Condvar::new(),
			idle: Condvar::new(),
			workers: Mutex::new(Vec::new()),
		});
		let mut workers = queue.workers.lock();
		for i in 0..threads.max(1) {
			let queue = queue.clone();
			workers.push(
				thread::Builder::new()
					.name(format!("maintenance-{i}"))
					.spawn(move || queue.worker_loop())
					.expect("spawn maintenance worker"),
			);
		}
		drop(workers);
		queue
	}

	/// Enqueues unless the range already has a task queued or running.
	/// Returns whether the task was accepted.
	pub fn schedule(&self, key: TaskKey, priority: i32, task: impl FnOnce() + Send + 'static) -> bool {
		let mut inner = self.inner.lock();
		if inner.shutdown || !inner.scheduled.insert(key.clone()) {
			return false;
		}
		inner.seq += 1;
		let seq = inner.seq;
		inner.heap.push(QueuedTask { priority, seq, key, task: Box::new(task) });
		self.cond.notify_one();
		true
	}

	pub fn is_scheduled(&self, key: &TaskKey) -> bool {
		self.inner.lock().scheduled.contains(key)
	}

	/// Blocks until every queued task has finished. Used while resuming
	/// interrupted splits during recovery.
	pub fn wait_for_empty(&self) {
		let mut inner = self.inner.lock();
		while !inner.heap.is_empty() || inner.running > 0 {
			self.idle.wait(&mut inner);
		}
	}

	pub fn shutdown(&self) {
		{
			let mut inner = self.inner.lock();
			inner.shutdown = true;
			inner.heap.clear();
		}
		self.cond.notify_all();
		let mut workers = self.workers.lock();
		for worker in workers.drain(..) {
			let _ = worker.join();
		}
	}

	fn worker_loop(self: &Arc<Self>) {
		loop {
			let queued = {
				let mut inner = self.inner.lock();
				loop {
					if inner.shutdown {
						return;
					}
					if let Some(task) = inner.heap.pop() {
						inner.running += 1;
						break task;
					}
					self.cond.wait(&mut inner);
				}
			};

			let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(queued.task));
			if result.is_err() {
				warn!(table = queued.key.0, "maintenance task panicked");
			}

			let mut inner = self.inner.lock();
			inner.scheduled.remove(&queued.key);
			inner.running -= 1;
			if inner.heap.is_empty() && inner.running == 0 {
				self.idle.notify_all();
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::{
		sync::atomic::{AtomicUsize, Ordering},
		time::Duration,
	};

	use super::*;

	#[test]
	fn runs_scheduled_tasks() {
		let queue = MaintenanceQueue::start(2);
		let ran = Arc::new(AtomicUsize::new(0));
		for i in 0..8u32 {
			let ran = ran.clone();
			assert!(queue.schedule((i, vec![]), 0, move || {
				ran.fetch_add(1, Ordering::SeqCst);
			}));
		}
		queue.wait_for_empty();
		assert_eq!(ran.load(Ordering::SeqCst), 8);
		queue.shutdown();
	}

	#[test]
	fn deduplicates_by_range_key() {
		let queue = MaintenanceQueue::start(1);
		let ran = Arc::new(AtomicUsize::new(0));
		// Park the worker so both schedules race the same queue state.
		let gate = Arc::new((Mutex::new(false), Condvar::new()));
		{
			let gate = gate.clone();
			queue.schedule((9, b"gate".to_vec()), 10, move || {
				let (lock, cond) = &*gate;
				let mut open = lock.lock();
				while !*open {
					cond.wait(&mut open);
				}
			});
		}
		{
			let ran = ran.clone();
			assert!(queue.schedule((1, b"m".to_vec()), 0, move || {
				ran.fetch_add(1, Ordering::SeqCst);
			}));
		}
		{
			let ran = ran.clone();
			assert!(!queue.schedule((1, b"m".to_vec()), 0, move || {
				ran.fetch_add(1, Ordering::SeqCst);
			}));
		}
		let (lock, cond) = &*gate;
		*lock.lock() = true;
		cond.notify_all();
		queue.wait_for_empty();
		assert_eq!(ran.load(Ordering::SeqCst), 1);
		queue.shutdown();
	}

	#[test]
	fn higher_priority_runs_first() {
		let queue = MaintenanceQueue::start(1);
		let order = Arc::new(Mutex::new(Vec::new()));
		let gate = Arc::new((Mutex::new(false), Condvar::new()));
		{
			let gate = gate.clone();
			queue.schedule((0, vec![]), 100, move || {
				let (lock, cond) = &*gate;
				let mut open = lock.lock();
				while !*open {
					cond.wait(&mut open);
				}
			});
		}
		// Queued while the worker is parked; the high-priority one must
		// pop first.
		for (key, priority) in [(1u32, 1), (2, 5), (3, 3)] {
			let order = order.clone();
			queue.schedule((key, vec![]), priority, move || {
				order.lock().push(priority);
			});
		}
		std::thread::sleep(Duration::from_millis(20));
		let (lock, cond) = &*gate;
		*lock.lock() = true;
		cond.notify_all();
		queue.wait_for_empty();
		assert_eq!(*order.lock(), vec![5, 3, 1]);
		queue.shutdown();
	}
}
