// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 StrataDB

//! Wires the comm layer to the service: every received request becomes
//! an application-queue handler carrying the frame's thread-group id and
//! deadline, and its result is sent back as a response frame.

use std::{
	sync::Arc,
	time::{Duration, Instant},
};

use strata_comm::{ApplicationHandler, ApplicationQueue, Comm, ConnId, DispatchHandler, Event, Header};
use tracing::{debug, error, warn};

use strata_core::{Error, Result};

use crate::{
	protocol::{
		self, CompactRequest, CreateScannerRequest, LoadRangeRequest, ReplayLoadRangeRequest,
		UpdateRequest, cmd,
	},
	service::RangeServer,
};

/// Dispatch handler registered with the comm listener; turns request
/// frames into queued application handlers.
pub struct ServerDispatch {
	server: Arc<RangeServer>,
	comm: Arc<Comm>,
	queue: Arc<ApplicationQueue>,
}

impl ServerDispatch {
	pub fn new(server: Arc<RangeServer>, comm: Arc<Comm>, queue: Arc<ApplicationQueue>) -> Arc<Self> {
		server.set_app_queue(queue.clone());
		Arc::new(Self { server, comm, queue })
	}
}

impl DispatchHandler for ServerDispatch {
	fn handle(&self, event: Event) {
		match event {
			Event::Message { conn, header, payload, .. } if header.is_request() => {
				let handler = Box::new(RequestHandler {
					server: self.server.clone(),
					comm: self.comm.clone(),
					conn,
					header,
					payload,
					arrived: Instant::now(),
				});
				if let Err(e) = self.queue.add(handler) {
					warn!(error = %e, command = header.command, "rejecting request");
					let response = protocol::encode_error_response(&e);
					let _ = self.comm.send_response(conn, &header, response);
				}
			}
			Event::Message { header, .. } => {
				debug!(command = header.command, "ignoring non-request message");
			}
			Event::ConnectionEstablished { conn, addr } => {
				debug!(?conn, %addr, "client connected");
			}
			Event::Disconnect { conn, addr, error } => {
				debug!(?conn, %addr, error, "client disconnected");
			}
			Event::RequestFailed { .. } => {}
		}
	}
}

struct RequestHandler {
	server: Arc<RangeServer>,
	comm: Arc<Comm>,
	conn: ConnId,
	header: Header,
	payload: Vec<u8>,
	arrived: Instant,
}

impl RequestHandler {
	fn execute(&self) -> Result<Vec<u8>> {
		let mut input = self.payload.as_slice();
		match self.header.command {
			cmd::LOAD_RANGE => {
				let req = LoadRangeRequest::decode(&mut input)?;
				self.server.load_range(
					&req.table,
					&req.range,
					req.transfer_log.as_deref(),
					&req.schema_json,
					req.state,
				)?;
				Ok(Vec::new())
			}
			cmd::UPDATE => {
				let req = UpdateRequest::decode(&mut input)?;
				let send_backs =
					self.server.update(&req.table, req.count, &req.cells, req.flags)?;
				Ok(protocol::encode_send_backs(&send_backs))
			}
			cmd::CREATE_SCANNER => {
				let req = CreateScannerRequest::decode(&mut input)?;
				let result = self.server.create_scanner(&req.table, &req.range, req.spec)?;
				Ok(protocol::encode_scan_result(&result))
			}
			cmd::FETCH_SCANBLOCK => {
				let scanner_id = protocol::decode_scanner_id(&mut input)?;
				let result = self.server.fetch_scanblock(scanner_id)?;
				Ok(protocol::encode_scan_result(&result))
			}
			cmd::DESTROY_SCANNER => {
				let scanner_id = protocol::decode_scanner_id(&mut input)?;
				self.server.destroy_scanner(scanner_id)?;
				Ok(Vec::new())
			}
			cmd::DROP_RANGE => {
				let (table, range) = protocol::decode_drop_range(&mut input)?;
				self.server.drop_range(&table, &range)?;
				Ok(Vec::new())
			}
			cmd::DROP_TABLE => {
				let table = strata_core::TableIdentifier::decode(&mut input)?;
				self.server.drop_table(&table)?;
				Ok(Vec::new())
			}
			cmd::UPDATE_SCHEMA => {
				let (table, schema_json) = protocol::decode_update_schema(&mut input)?;
				self.server.update_schema(&table, &schema_json)?;
				Ok(Vec::new())
			}
			cmd::COMPACT => {
				let req = CompactRequest::decode(&mut input)?;
				self.server.compact(&req.table, &req.range, req.compaction_type == 1)?;
				Ok(Vec::new())
			}
			cmd::REPLAY_BEGIN => {
				let group = protocol::decode_replay_begin(&mut input)?;
				self.server.replay_begin(group)?;
				Ok(Vec::new())
			}
			cmd::REPLAY_LOAD_RANGE => {
				let req = ReplayLoadRangeRequest::decode(&mut input)?;
				self.server.replay_load_range(&req.table, &req.range, &req.schema_json, req.state)?;
				Ok(Vec::new())
			}
			cmd::REPLAY_UPDATE => {
				self.server.replay_update(&self.payload)?;
				Ok(Vec::new())
			}
			cmd::REPLAY_COMMIT => {
				self.server.replay_commit()?;
				Ok(Vec::new())
			}
			cmd::COMMIT_LOG_SYNC => {
				self.server.commit_log_sync()?;
				Ok(Vec::new())
			}
			cmd::GET_STATISTICS => self.server.get_statistics(),
			cmd::CLOSE => {
				self.server.close()?;
				Ok(Vec::new())
			}
			other => Err(Error::BadCommand(other)),
		}
	}
}

impl ApplicationHandler for RequestHandler {
	fn run(self: Box<Self>) {
		let response = match self.execute() {
			Ok(payload) => protocol::encode_ok_response(&payload),
			Err(e) => {
				// In-range failures produce a structured error reply;
				// they never take the connection down.
				debug!(command = self.header.command, error = %e, "request failed");
				protocol::encode_error_response(&e)
			}
		};
		if let Err(e) = self.comm.send_response(self.conn, &self.header, response) {
			error!(error = %e, "failed to send response");
		}
	}

	fn group_id(&self) -> u32 {
		self.header.gid
	}

	fn is_urgent(&self) -> bool {
		self.header.is_urgent()
	}

	fn deadline(&self) -> Option<Instant> {
		if self.header.timeout_ms == 0 {
			return None;
		}
		Some(self.arrived + Duration::from_millis(self.header.timeout_ms as u64))
	}
}
