// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 StrataDB

use std::time::Duration;

use mio::{Events, Poll, Token, Waker, event::Source, Interest};

use strata_core::{Error, Result};

/// Readiness delivery mode. The platform facility (epoll, kqueue, event
/// ports) sits behind `mio`; handlers always drain sockets until
/// `WouldBlock`, which is required under `Edge` and harmless under
/// `Level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerMode {
	#[default]
	Edge,
	Level,
}

pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);

/// One readiness facility, owned by exactly one reactor thread.
pub(crate) struct Poller {
	poll: Poll,
	#[allow(dead_code)]
	mode: TriggerMode,
}

impl Poller {
	pub fn new(mode: TriggerMode) -> Result<(Self, Waker)> {
		let poll = Poll::new().map_err(|e| Error::PollError(e.to_string()))?;
		let waker = Waker::new(poll.registry(), WAKER_TOKEN)
			.map_err(|e| Error::PollError(e.to_string()))?;
		Ok((Self { poll, mode }, waker))
	}

	pub fn register(&self, source: &mut impl Source, token: Token, interest: Interest) -> Result<()> {
		self.poll
			.registry()
			.register(source, token, interest)
			.map_err(|e| Error::PollError(e.to_string()))
	}

	pub fn reregister(&self, source: &mut impl Source, token: Token, interest: Interest) -> Result<()> {
		self.poll
			.registry()
			.reregister(source, token, interest)
			.map_err(|e| Error::PollError(e.to_string()))
	}

	pub fn deregister(&self, source: &mut impl Source) -> Result<()> {
		self.poll.registry().deregister(source).map_err(|e| Error::PollError(e.to_string()))
	}

	pub fn poll(&mut self, events: &mut Events, timeout: Duration) -> Result<()> {
		match self.poll.poll(events, Some(timeout)) {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::Interrupted => Ok(()),
			Err(e) => Err(Error::PollError(e.to_string())),
		}
	}
}
