// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 StrataDB

use std::net::SocketAddr;

use crate::{comm::ConnId, frame::Header};

/// Events delivered to dispatch handlers.
#[derive(Debug)]
pub enum Event {
	ConnectionEstablished {
		conn: ConnId,
		addr: SocketAddr,
	},
	/// Emitted exactly once per connection teardown.
	Disconnect {
		conn: ConnId,
		addr: SocketAddr,
		error: u32,
	},
	Message {
		conn: ConnId,
		from: SocketAddr,
		header: Header,
		payload: Vec<u8>,
	},
	/// An outstanding request failed without a response: timed out, or
	/// its connection broke.
	RequestFailed {
		conn: ConnId,
		id: u32,
		error: u32,
	},
}

/// Receives connection events. One dispatch handler may serve many
/// connections; the event carries the connection identity.
pub trait DispatchHandler: Send + Sync {
	fn handle(&self, event: Event);
}

/// Receives reactor timer expirations.
pub trait TimerHandler: Send + Sync {
	fn on_timer(&self);
}
