// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 StrataDB

use std::{
	net::SocketAddr,
	sync::{
		Arc,
		atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
	},
	thread::JoinHandle,
	time::{Duration, Instant},
};

use mio::net::{TcpListener, TcpStream, UdpSocket};
use parking_lot::Mutex;
use tracing::info;

use strata_core::{Error, Result, util::checksum::xxh32};

use crate::{
	event::{DispatchHandler, TimerHandler},
	frame::{FLAG_REQUEST, FLAG_RESPONSE, FLAG_URGENT, HEADER_LEN, Header},
	poller::TriggerMode,
	reactor::{Cmd, PendingRequest, ReactorHandle, prepare_reactor, spawn_reactor},
};

/// Connection identity: reactor index in the low byte, allocation
/// sequence above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub u64);

impl ConnId {
	pub(crate) fn new(reactor: usize, seq: u64) -> Self {
		Self((seq << 8) | reactor as u64)
	}

	pub(crate) fn reactor(self) -> usize {
		(self.0 & 0xff) as usize
	}
}

#[derive(Debug, Clone)]
pub struct CommConfig {
	pub reactors: usize,
	pub trigger: TriggerMode,
	pub send_buffer_size: usize,
	pub recv_buffer_size: usize,
}

impl Default for CommConfig {
	fn default() -> Self {
		Self {
			reactors: 2,
			trigger: TriggerMode::default(),
			send_buffer_size: 4 * 32768,
			recv_buffer_size: 4 * 32768,
		}
	}
}

pub(crate) struct CommShared {
	pub handles: Vec<ReactorHandle>,
	next_conn: AtomicU64,
	next_reactor: AtomicUsize,
	next_msg_id: AtomicU32,
	send_buffer_size: usize,
	recv_buffer_size: usize,
}

impl CommShared {
	pub fn alloc_conn(&self, reactor: usize) -> ConnId {
		ConnId::new(reactor, self.next_conn.fetch_add(1, Ordering::Relaxed) + 1)
	}

	pub fn pick_reactor(&self) -> usize {
		self.next_reactor.fetch_add(1, Ordering::Relaxed) % self.handles.len()
	}

	pub fn next_msg_id(&self) -> u32 {
		// Skip 0 so "no id" stays representable.
		loop {
			let id = self.next_msg_id.fetch_add(1, Ordering::Relaxed);
			if id != 0 {
				return id;
			}
		}
	}

	pub fn configure_stream(&self, stream: &TcpStream) -> Result<()> {
		let sock = socket2::SockRef::from(stream);
		sock.set_nodelay(true)?;
		sock.set_send_buffer_size(self.send_buffer_size)?;
		sock.set_recv_buffer_size(self.recv_buffer_size)?;
		Ok(())
	}
}

/// Parameters of one outgoing request.
#[derive(Debug, Clone)]
pub struct RequestSpec {
	pub command: u16,
	pub gid: u32,
	pub urgent: bool,
	pub timeout: Duration,
	pub payload: Vec<u8>,
}

/// Messaging facade: owns the reactor pool and hands out connection ids.
pub struct Comm {
	shared: Arc<CommShared>,
	threads: Mutex<Vec<JoinHandle<()>>>,
	down: AtomicBool,
}

impl Comm {
	pub fn new(config: CommConfig) -> Result<Arc<Self>> {
		let count = config.reactors.max(1);
		let mut handles = Vec::with_capacity(count);
		let mut seeds = Vec::with_capacity(count);
		for idx in 0..count {
			let (handle, seed) = prepare_reactor(idx, config.trigger)?;
			handles.push(handle);
			seeds.push(seed);
		}
		let shared = Arc::new(CommShared {
			handles,
			next_conn: AtomicU64::new(0),
			next_reactor: AtomicUsize::new(0),
			next_msg_id: AtomicU32::new(1),
			send_buffer_size: config.send_buffer_size,
			recv_buffer_size: config.recv_buffer_size,
		});
		let threads = seeds.into_iter().map(|seed| spawn_reactor(seed, shared.clone())).collect();
		info!(reactors = count, "comm layer started");
		Ok(Arc::new(Self { shared, threads: Mutex::new(threads), down: AtomicBool::new(false) }))
	}

	/// Binds a listener; accepted connections are configured, assigned
	/// round-robin across reactors, and announced to `dispatch` with
	/// `ConnectionEstablished`. Returns the actual bound address.
	pub fn listen(
		&self,
		addr: SocketAddr,
		dispatch: Arc<dyn DispatchHandler>,
	) -> Result<(ConnId, SocketAddr)> {
		let listener = TcpListener::bind(addr)?;
		let local = listener.local_addr()?;
		let reactor = self.shared.pick_reactor();
		let conn = self.shared.alloc_conn(reactor);
		self.shared.handles[reactor].send(Cmd::RegisterListener { conn, listener, dispatch })?;
		info!(addr = %local, "listening");
		Ok((conn, local))
	}

	/// Starts a non-blocking connect. `ConnectionEstablished` or
	/// `Disconnect` arrives on `dispatch` when the connect resolves.
	pub fn connect(&self, addr: SocketAddr, dispatch: Arc<dyn DispatchHandler>) -> Result<ConnId> {
		let stream = TcpStream::connect(addr).map_err(|e| Error::ConnectError(e.to_string()))?;
		let _ = self.shared.configure_stream(&stream);
		let reactor = self.shared.pick_reactor();
		let conn = self.shared.alloc_conn(reactor);
		self.shared.handles[reactor].send(Cmd::RegisterStream {
			conn,
			stream,
			addr,
			dispatch,
			connected: false,
		})?;
		Ok(conn)
	}

	fn frame(header: Header, payload: &[u8]) -> Vec<u8> {
		let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
		bytes.extend_from_slice(&header.encode());
		bytes.extend_from_slice(payload);
		bytes
	}

	/// Sends a request and registers `response_handler` for the
	/// response, a timeout, or a broken-connection failure. Returns the
	/// message id.
	pub fn send_request(
		&self,
		conn: ConnId,
		spec: RequestSpec,
		response_handler: Arc<dyn DispatchHandler>,
	) -> Result<u32> {
		let id = self.shared.next_msg_id();
		let mut flags = FLAG_REQUEST;
		if spec.urgent {
			flags |= FLAG_URGENT;
		}
		let header = Header {
			flags,
			id,
			gid: spec.gid,
			total_len: (HEADER_LEN + spec.payload.len()) as u32,
			timeout_ms: spec.timeout.as_millis() as u32,
			payload_checksum: if spec.payload.is_empty() { 0 } else { xxh32(&spec.payload) },
			command: spec.command,
		};
		let request = PendingRequest {
			id,
			deadline: Instant::now() + spec.timeout,
			handler: response_handler,
		};
		self.reactor_for(conn)?.send(Cmd::Send {
			conn,
			frame: Self::frame(header, &spec.payload),
			request: Some(request),
		})?;
		Ok(id)
	}

	/// Sends the response to a received request, echoing its id, group
	/// and command.
	pub fn send_response(&self, conn: ConnId, request: &Header, payload: Vec<u8>) -> Result<()> {
		let header = Header {
			flags: FLAG_RESPONSE | (request.flags & FLAG_URGENT),
			id: request.id,
			gid: request.gid,
			total_len: (HEADER_LEN + payload.len()) as u32,
			timeout_ms: 0,
			payload_checksum: if payload.is_empty() { 0 } else { xxh32(&payload) },
			command: request.command,
		};
		self.reactor_for(conn)?.send(Cmd::Send {
			conn,
			frame: Self::frame(header, &payload),
			request: None,
		})
	}

	/// Binds a datagram socket. Each received datagram must hold one
	/// complete frame.
	pub fn open_datagram(
		&self,
		bind: SocketAddr,
		dispatch: Arc<dyn DispatchHandler>,
	) -> Result<(ConnId, SocketAddr)> {
		let socket = UdpSocket::bind(bind)?;
		let local = socket.local_addr()?;
		let reactor = self.shared.pick_reactor();
		let conn = self.shared.alloc_conn(reactor);
		self.shared.handles[reactor].send(Cmd::RegisterDatagram { conn, socket, dispatch })?;
		Ok((conn, local))
	}

	pub fn send_datagram(
		&self,
		conn: ConnId,
		dest: SocketAddr,
		command: u16,
		payload: Vec<u8>,
	) -> Result<()> {
		let header = Header {
			flags: 0,
			id: self.shared.next_msg_id(),
			gid: 0,
			total_len: (HEADER_LEN + payload.len()) as u32,
			timeout_ms: 0,
			payload_checksum: if payload.is_empty() { 0 } else { xxh32(&payload) },
			command,
		};
		self.reactor_for(conn)?.send(Cmd::SendDatagram {
			conn,
			dest,
			frame: Self::frame(header, &payload),
		})
	}

	/// Fires `handler` on a reactor thread after `delay`.
	pub fn set_timer(&self, delay: Duration, handler: Arc<dyn TimerHandler>) -> Result<()> {
		let reactor = self.shared.pick_reactor();
		self.shared.handles[reactor].send(Cmd::AddTimer { at: Instant::now() + delay, handler })
	}

	pub fn close_connection(&self, conn: ConnId) -> Result<()> {
		self.reactor_for(conn)?.send(Cmd::Close { conn })
	}

	fn reactor_for(&self, conn: ConnId) -> Result<&ReactorHandle> {
		if self.down.load(Ordering::Acquire) {
			return Err(Error::ShuttingDown);
		}
		self.shared
			.handles
			.get(conn.reactor())
			.ok_or_else(|| Error::Internal(format!("unknown reactor for {conn:?}")))
	}

	pub fn shutdown(&self) {
		if self.down.swap(true, Ordering::AcqRel) {
			return;
		}
		for handle in &self.shared.handles {
			let _ = handle.send(Cmd::Shutdown);
		}
		for thread in self.threads.lock().drain(..) {
			let _ = thread.join();
		}
	}
}

impl Drop for Comm {
	fn drop(&mut self) {
		self.shutdown();
	}
}
