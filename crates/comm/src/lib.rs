// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 StrataDB

//! Event-driven messaging layer: a pool of reactor threads drives
//! non-blocking sockets and timers; framed messages are delivered to
//! dispatch handlers; request/response pairing and timeouts run through a
//! per-reactor request cache; application work is serialized per thread
//! group by the application queue.

pub use app_queue::{ApplicationHandler, ApplicationQueue, ApplicationQueueConfig};
pub use comm::{Comm, CommConfig, ConnId, RequestSpec};
pub use event::{DispatchHandler, Event, TimerHandler};
pub use frame::{FLAG_REQUEST, FLAG_RESPONSE, FLAG_URGENT, HEADER_LEN, Header, PROTOCOL_VERSION};
pub use poller::TriggerMode;

mod app_queue;
mod comm;
mod event;
mod frame;
mod poller;
mod reactor;
mod request_cache;
