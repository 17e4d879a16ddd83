// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 StrataDB

use std::{
	collections::{HashMap, VecDeque},
	sync::Arc,
	thread::{self, JoinHandle},
	time::Instant,
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use strata_core::{Error, Result};

/// A unit of application work popped off the queue by a worker thread.
pub trait ApplicationHandler: Send {
	fn run(self: Box<Self>);
	/// Non-zero group ids are serialized: at most one handler of a group
	/// runs at a time.
	fn group_id(&self) -> u32 {
		0
	}
	/// Urgent handlers keep running while the queue is paused for memory
	/// pressure.
	fn is_urgent(&self) -> bool {
		false
	}
	/// Handlers past their deadline are dropped instead of executed.
	fn deadline(&self) -> Option<Instant> {
		None
	}
}

#[derive(Debug, Clone)]
pub struct ApplicationQueueConfig {
	pub workers: usize,
	pub capacity: usize,
}

impl Default for ApplicationQueueConfig {
	fn default() -> Self {
		Self { workers: 2, capacity: 4096 }
	}
}

struct GroupState {
	queue: VecDeque<Box<dyn ApplicationHandler>>,
	/// True while a handler of this group sits in the ready queue or is
	/// executing.
	active: bool,
}

struct State {
	ready: VecDeque<Box<dyn ApplicationHandler>>,
	groups: HashMap<u32, GroupState>,
	size: usize,
	paused: bool,
	shutdown: bool,
}

struct Inner {
	state: Mutex<State>,
	cond: Condvar,
	capacity: usize,
}

/// Bounded FIFO of application handlers with per-thread-group
/// serialization, executed by a fixed worker pool.
pub struct ApplicationQueue {
	inner: Arc<Inner>,
	workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ApplicationQueue {
	pub fn start(config: ApplicationQueueConfig) -> Arc<Self> {
		let inner = Arc::new(Inner {
			state: Mutex::new(State {
				ready: VecDeque::new(),
				groups: HashMap::new(),
				size: 0,
				paused: false,
				shutdown: false,
			}),
			cond: Condvar::new(),
			capacity: config.capacity,
		});
		let queue = Arc::new(Self { inner: inner.clone(), workers: Mutex::new(Vec::new()) });
		let mut workers = queue.workers.lock();
		for i in 0..config.workers.max(1) {
			let inner = inner.clone();
			workers.push(
				thread::Builder::new()
					.name(format!("app-queue-{i}"))
					.spawn(move || worker_loop(inner))
					.expect("spawn application queue worker"),
			);
		}
		drop(workers);
		queue
	}

	pub fn add(&self, handler: Box<dyn ApplicationHandler>) -> Result<()> {
		let mut state = self.inner.state.lock();
		if state.shutdown {
			return Err(Error::ShuttingDown);
		}
		if state.size >= self.inner.capacity {
			return Err(Error::QueueFull);
		}
		state.size += 1;
		let gid = handler.group_id();
		if gid == 0 {
			state.ready.push_back(handler);
		} else {
			let group = state
				.groups
				.entry(gid)
				.or_insert_with(|| GroupState { queue: VecDeque::new(), active: false });
			if group.active {
				group.queue.push_back(handler);
			} else {
				group.active = true;
				state.ready.push_back(handler);
			}
		}
		self.inner.cond.notify_one();
		Ok(())
	}

	/// Stops starting non-urgent handlers until `resume`.
	pub fn pause(&self) {
		self.inner.state.lock().paused = true;
	}

	pub fn resume(&self) {
		let mut state = self.inner.state.lock();
		if state.paused {
			state.paused = false;
			self.inner.cond.notify_all();
		}
	}

	pub fn backlog(&self) -> usize {
		self.inner.state.lock().size
	}

	/// Stops the workers; queued handlers that have not started are
	/// dropped.
	pub fn shutdown(&self) {
		{
			let mut state = self.inner.state.lock();
			state.shutdown = true;
		}
		self.inner.cond.notify_all();
		let mut workers = self.workers.lock();
		for worker in workers.drain(..) {
			let _ = worker.join();
		}
	}
}

fn pop_ready(state: &mut State) -> Option<Box<dyn ApplicationHandler>> {
	if !state.paused {
		return state.ready.pop_front();
	}
	let pos = state.ready.iter().position(|h| h.is_urgent())?;
	state.ready.remove(pos)
}

fn worker_loop(inner: Arc<Inner>) {
	loop {
		let handler = {
			let mut state = inner.state.lock();
			loop {
				if state.shutdown {
					return;
				}
				if let Some(handler) = pop_ready(&mut state) {
					break handler;
				}
				inner.cond.wait(&mut state);
			}
		};

		let gid = handler.group_id();
		match handler.deadline() {
			Some(deadline) if Instant::now() > deadline => {
				warn!(gid, "dropping expired request without executing");
			}
			_ => handler.run(),
		}

		let mut state = inner.state.lock();
		state.size -= 1;
		if gid != 0 {
			let splice = match state.groups.get_mut(&gid) {
				Some(group) => match group.queue.pop_front() {
					Some(next) => Some(next),
					None => {
						group.active = false;
						None
					}
				},
				None => None,
			};
			if let Some(next) = splice {
				state.ready.push_back(next);
				inner.cond.notify_one();
			} else if state.groups.get(&gid).is_some_and(|g| !g.active && g.queue.is_empty()) {
				state.groups.remove(&gid);
			}
		}
		if state.size == 0 {
			debug!("application queue drained");
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

	struct Task<F: FnOnce() + Send> {
		f: F,
		gid: u32,
		urgent: bool,
		deadline: Option<Instant>,
	}

	impl<F: FnOnce() + Send> ApplicationHandler for Task<F> {
		fn run(self: Box<Self>) {
			(self.f)()
		}
		fn group_id(&self) -> u32 {
			self.gid
		}
		fn is_urgent(&self) -> bool {
			self.urgent
		}
		fn deadline(&self) -> Option<Instant> {
			self.deadline
		}
	}

	fn task(gid: u32, f: impl FnOnce() + Send + 'static) -> Box<dyn ApplicationHandler> {
		Box::new(Task { f, gid, urgent: false, deadline: None })
	}

	#[test]
	fn at_most_one_concurrent_handler_per_group() {
		let queue = ApplicationQueue::start(ApplicationQueueConfig { workers: 4, capacity: 1024 });
		let in_group = Arc::new(AtomicUsize::new(0));
		let max_in_group = Arc::new(AtomicUsize::new(0));
		let done = Arc::new(AtomicUsize::new(0));
		let total = 64;

		for _ in 0..total {
			let in_group = in_group.clone();
			let max_in_group = max_in_group.clone();
			let done = done.clone();
			queue
				.add(task(7, move || {
					let now = in_group.fetch_add(1, Ordering::SeqCst) + 1;
					max_in_group.fetch_max(now, Ordering::SeqCst);
					thread::sleep(Duration::from_millis(1));
					in_group.fetch_sub(1, Ordering::SeqCst);
					done.fetch_add(1, Ordering::SeqCst);
				}))
				.unwrap();
		}

		let deadline = Instant::now() + Duration::from_secs(10);
		while done.load(Ordering::SeqCst) < total {
			assert!(Instant::now() < deadline, "queue stalled");
			thread::sleep(Duration::from_millis(5));
		}
		assert_eq!(max_in_group.load(Ordering::SeqCst), 1);
		queue.shutdown();
	}

	#[test]
	fn groups_run_in_parallel_with_each_other() {
		let queue = ApplicationQueue::start(ApplicationQueueConfig { workers: 4, capacity: 1024 });
		let running = Arc::new(AtomicUsize::new(0));
		let peak = Arc::new(AtomicUsize::new(0));
		let done = Arc::new(AtomicUsize::new(0));

		for gid in 1..=4u32 {
			let running = running.clone();
			let peak = peak.clone();
			let done = done.clone();
			queue
				.add(task(gid, move || {
					let now = running.fetch_add(1, Ordering::SeqCst) + 1;
					peak.fetch_max(now, Ordering::SeqCst);
					thread::sleep(Duration::from_millis(20));
					running.fetch_sub(1, Ordering::SeqCst);
					done.fetch_add(1, Ordering::SeqCst);
				}))
				.unwrap();
		}

		let deadline = Instant::now() + Duration::from_secs(10);
		while done.load(Ordering::SeqCst) < 4 {
			assert!(Instant::now() < deadline, "queue stalled");
			thread::sleep(Duration::from_millis(5));
		}
		assert!(peak.load(Ordering::SeqCst) > 1, "distinct groups should overlap");
		queue.shutdown();
	}

	#[test]
	fn paused_queue_still_runs_urgent_handlers() {
		let queue = ApplicationQueue::start(ApplicationQueueConfig { workers: 2, capacity: 1024 });
		queue.pause();

		let ran_normal = Arc::new(AtomicUsize::new(0));
		let ran_urgent = Arc::new(AtomicUsize::new(0));
		{
			let ran_normal = ran_normal.clone();
			queue.add(task(0, move || {
				ran_normal.fetch_add(1, Ordering::SeqCst);
			}))
			.unwrap();
		}
		{
			let ran_urgent = ran_urgent.clone();
			queue.add(Box::new(Task {
				f: move || {
					ran_urgent.fetch_add(1, Ordering::SeqCst);
				},
				gid: 0,
				urgent: true,
				deadline: None,
			}))
			.unwrap();
		}

		let deadline = Instant::now() + Duration::from_secs(5);
		while ran_urgent.load(Ordering::SeqCst) == 0 {
			assert!(Instant::now() < deadline, "urgent handler did not bypass pause");
			thread::sleep(Duration::from_millis(2));
		}
		assert_eq!(ran_normal.load(Ordering::SeqCst), 0);

		queue.resume();
		let deadline = Instant::now() + Duration::from_secs(5);
		while ran_normal.load(Ordering::SeqCst) == 0 {
			assert!(Instant::now() < deadline, "resume did not release handlers");
			thread::sleep(Duration::from_millis(2));
		}
		queue.shutdown();
	}

	#[test]
	fn expired_handlers_are_dropped() {
		let queue = ApplicationQueue::start(ApplicationQueueConfig { workers: 1, capacity: 16 });
		let ran = Arc::new(AtomicUsize::new(0));
		let observed = ran.clone();
		queue.add(Box::new(Task {
			f: move || {
				observed.fetch_add(1, Ordering::SeqCst);
			},
			gid: 0,
			urgent: false,
			deadline: Some(Instant::now() - Duration::from_millis(1)),
		}))
		.unwrap();

		thread::sleep(Duration::from_millis(50));
		assert_eq!(ran.load(Ordering::SeqCst), 0);
		queue.shutdown();
	}

	#[test]
	fn capacity_is_enforced() {
		let queue = ApplicationQueue::start(ApplicationQueueConfig { workers: 1, capacity: 2 });
		queue.pause();
		queue.add(task(0, || {})).unwrap();
		queue.add(task(0, || {})).unwrap();
		assert!(matches!(queue.add(task(0, || {})), Err(Error::QueueFull)));
		queue.shutdown();
	}
}
