// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 StrataDB

//! Reactor threads. Each owns a poller, a slab of connection handlers, a
//! timer heap and a request cache; sockets are never shared between
//! reactors. Other threads talk to a reactor through its command channel
//! plus waker.

use std::{
	cmp::Ordering as CmpOrdering,
	collections::{BinaryHeap, HashMap, VecDeque},
	io::{self, Read, Write},
	net::SocketAddr,
	sync::Arc,
	thread::JoinHandle,
	time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use mio::{
	Events, Interest, Token, Waker,
	net::{TcpListener, TcpStream, UdpSocket},
};
use tracing::{debug, error, warn};

use strata_core::{Result, code};

use crate::{
	comm::{CommShared, ConnId},
	event::{DispatchHandler, Event, TimerHandler},
	frame::{HEADER_LEN, Header},
	poller::{Poller, WAKER_TOKEN},
	request_cache::RequestCache,
};

/// Poll wait cap so the loop re-checks timers and request deadlines even
/// when no descriptor fires.
const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

pub(crate) struct PendingRequest {
	pub id: u32,
	pub deadline: Instant,
	pub handler: Arc<dyn DispatchHandler>,
}

pub(crate) enum Cmd {
	RegisterStream {
		conn: ConnId,
		stream: TcpStream,
		addr: SocketAddr,
		dispatch: Arc<dyn DispatchHandler>,
		connected: bool,
	},
	RegisterListener {
		conn: ConnId,
		listener: TcpListener,
		dispatch: Arc<dyn DispatchHandler>,
	},
	RegisterDatagram {
		conn: ConnId,
		socket: UdpSocket,
		dispatch: Arc<dyn DispatchHandler>,
	},
	Send {
		conn: ConnId,
		frame: Vec<u8>,
		request: Option<PendingRequest>,
	},
	SendDatagram {
		conn: ConnId,
		dest: SocketAddr,
		frame: Vec<u8>,
	},
	Close {
		conn: ConnId,
	},
	AddTimer {
		at: Instant,
		handler: Arc<dyn TimerHandler>,
	},
	Shutdown,
}

pub(crate) struct ReactorHandle {
	sender: Sender<Cmd>,
	waker: Arc<Waker>,
}

impl ReactorHandle {
	pub fn send(&self, cmd: Cmd) -> Result<()> {
		self.sender.send(cmd).map_err(|_| strata_core::Error::ShuttingDown)?;
		self.waker.wake().map_err(|e| strata_core::Error::PollError(e.to_string()))?;
		Ok(())
	}
}

struct TimerEntry {
	at: Instant,
	handler: Arc<dyn TimerHandler>,
}

impl PartialEq for TimerEntry {
	fn eq(&self, other: &Self) -> bool {
		self.at == other.at
	}
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
	fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
		Some(self.cmp(other))
	}
}
impl Ord for TimerEntry {
	// Reversed so the BinaryHeap pops the earliest expiry first.
	fn cmp(&self, other: &Self) -> CmpOrdering {
		other.at.cmp(&self.at)
	}
}

enum Action {
	Keep,
	Remove(u32),
}

struct SendBuf {
	bytes: Vec<u8>,
	offset: usize,
}

struct StreamConn {
	conn: ConnId,
	token: Token,
	stream: TcpStream,
	addr: SocketAddr,
	dispatch: Arc<dyn DispatchHandler>,
	connected: bool,
	header_buf: [u8; HEADER_LEN],
	header_fill: usize,
	header: Option<Header>,
	payload: Vec<u8>,
	payload_fill: usize,
	send_queue: VecDeque<SendBuf>,
	interest: Interest,
}

impl StreamConn {
	fn reset_read_state(&mut self) {
		self.header_fill = 0;
		self.header = None;
		self.payload = Vec::new();
		self.payload_fill = 0;
	}

	fn deliver_frame(&mut self, cache: &mut RequestCache) {
		let header = self.header.take().expect("complete frame has a header");
		let payload = std::mem::take(&mut self.payload);
		self.reset_read_state();

		if header.payload_checksum != 0 {
			let computed = strata_core::util::checksum::xxh32(&payload);
			if computed != header.payload_checksum {
				warn!(conn = ?self.conn, id = header.id, "payload checksum mismatch, dropping frame");
				return;
			}
		}

		let event = Event::Message { conn: self.conn, from: self.addr, header, payload };
		if header.is_response() && !header.is_request() {
			match cache.remove(header.id) {
				Some(entry) => {
					if let Some(handler) = entry.handler {
						handler.handle(event);
					}
				}
				None => {
					warn!(
						conn = ?self.conn,
						id = header.id,
						total_len = header.total_len,
						"received response for non-pending request"
					);
				}
			}
		} else {
			self.dispatch.handle(event);
		}
	}

	/// Reads until `WouldBlock`, delivering every complete frame.
	fn on_readable(&mut self, cache: &mut RequestCache) -> Action {
		loop {
			if self.header_fill < HEADER_LEN {
				match self.stream.read(&mut self.header_buf[self.header_fill..]) {
					Ok(0) => return Action::Remove(code::OK), // eof
					Ok(n) => {
						self.header_fill += n;
						if self.header_fill < HEADER_LEN {
							continue;
						}
						match Header::decode(&self.header_buf) {
							Ok(header) => {
								self.payload = vec![0u8; header.payload_len()];
								self.payload_fill = 0;
								self.header = Some(header);
							}
							Err(e) => {
								error!(conn = ?self.conn, addr = %self.addr, error = %e, "bad frame header");
								return Action::Remove(code::BAD_HEADER);
							}
						}
					}
					Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Action::Keep,
					Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
					Err(ref e) if e.kind() == io::ErrorKind::ConnectionRefused => {
						return Action::Remove(code::COMM_CONNECT_ERROR);
					}
					Err(_) => return Action::Remove(code::COMM_BROKEN_CONNECTION),
				}
			}
			if self.header.is_some() {
				if self.payload_fill < self.payload.len() {
					match self.stream.read(&mut self.payload[self.payload_fill..]) {
						Ok(0) => return Action::Remove(code::OK),
						Ok(n) => self.payload_fill += n,
						Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Action::Keep,
						Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
						Err(_) => return Action::Remove(code::COMM_BROKEN_CONNECTION),
					}
				}
				if self.payload_fill == self.payload.len() {
					self.deliver_frame(cache);
				}
			}
		}
	}

	/// Drains the send queue; returns whether write interest is still
	/// needed.
	fn flush(&mut self) -> std::result::Result<bool, ()> {
		while let Some(front) = self.send_queue.front_mut() {
			match self.stream.write(&front.bytes[front.offset..]) {
				Ok(n) => {
					front.offset += n;
					if front.offset == front.bytes.len() {
						self.send_queue.pop_front();
					}
				}
				Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
				Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
				Err(_) => return Err(()),
			}
		}
		Ok(false)
	}

	fn on_writable(&mut self, poller: &Poller) -> Action {
		if !self.connected {
			// Non-blocking connect resolution: write readiness fires
			// first, SO_ERROR tells us which way it went.
			match self.stream.take_error() {
				Ok(Some(e)) => {
					debug!(addr = %self.addr, error = %e, "connect failed");
					return Action::Remove(code::COMM_CONNECT_ERROR);
				}
				Err(e) => {
					debug!(addr = %self.addr, error = %e, "connect failed");
					return Action::Remove(code::COMM_CONNECT_ERROR);
				}
				Ok(None) => {
					self.connected = true;
					self.dispatch
						.handle(Event::ConnectionEstablished { conn: self.conn, addr: self.addr });
				}
			}
		}
		match self.flush() {
			Ok(still_pending) => {
				let wanted = if still_pending {
					Interest::READABLE | Interest::WRITABLE
				} else {
					Interest::READABLE
				};
				if wanted != self.interest {
					self.interest = wanted;
					if let Err(e) = poller.reregister(&mut self.stream, self.token, wanted) {
						error!(conn = ?self.conn, error = %e, "reregister failed");
						return Action::Remove(code::COMM_POLL_ERROR);
					}
				}
				Action::Keep
			}
			Err(()) => Action::Remove(code::COMM_BROKEN_CONNECTION),
		}
	}

	/// Queues a frame and attempts an immediate flush, registering write
	/// interest when the socket backs up.
	fn enqueue(&mut self, bytes: Vec<u8>, poller: &Poller) -> Action {
		self.send_queue.push_back(SendBuf { bytes, offset: 0 });
		if !self.connected {
			return Action::Keep; // flushed on connect completion
		}
		self.on_writable(poller)
	}
}

struct ListenerConn {
	conn: ConnId,
	listener: TcpListener,
	dispatch: Arc<dyn DispatchHandler>,
}

struct DatagramConn {
	conn: ConnId,
	token: Token,
	socket: UdpSocket,
	dispatch: Arc<dyn DispatchHandler>,
	send_queue: VecDeque<(SocketAddr, Vec<u8>)>,
	interest: Interest,
}

impl DatagramConn {
	fn on_readable(&mut self) {
		let mut buf = [0u8; 65536];
		loop {
			match self.socket.recv_from(&mut buf) {
				Ok((len, from)) => {
					if len < HEADER_LEN {
						warn!(from = %from, len, "runt datagram");
						continue;
					}
					let mut header_bytes = [0u8; HEADER_LEN];
					header_bytes.copy_from_slice(&buf[..HEADER_LEN]);
					match Header::decode(&header_bytes) {
						Ok(header) => {
							let want = header.payload_len().min(len - HEADER_LEN);
							let payload = buf[HEADER_LEN..HEADER_LEN + want].to_vec();
							self.dispatch.handle(Event::Message {
								conn: self.conn,
								from,
								header,
								payload,
							});
						}
						Err(e) => warn!(from = %from, error = %e, "bad datagram header"),
					}
				}
				Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
				Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
				Err(e) => {
					warn!(conn = ?self.conn, error = %e, "datagram recv error");
					return;
				}
			}
		}
	}

	fn flush(&mut self, poller: &Poller) {
		while let Some((dest, bytes)) = self.send_queue.front() {
			match self.socket.send_to(bytes, *dest) {
				Ok(_) => {
					self.send_queue.pop_front();
				}
				Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
				Err(e) => {
					warn!(dest = %dest, error = %e, "datagram send error, dropping");
					self.send_queue.pop_front();
				}
			}
		}
		let wanted = if self.send_queue.is_empty() {
			Interest::READABLE
		} else {
			Interest::READABLE | Interest::WRITABLE
		};
		if wanted != self.interest {
			self.interest = wanted;
			if let Err(e) = poller.reregister(&mut self.socket, self.token, wanted) {
				error!(conn = ?self.conn, error = %e, "datagram reregister failed");
			}
		}
	}
}

enum Slot {
	Stream(StreamConn),
	Listener(ListenerConn),
	Datagram(DatagramConn),
}

pub(crate) struct ReactorSeed {
	idx: usize,
	poller: Poller,
	receiver: Receiver<Cmd>,
}

/// Creates the command channel and poller for one reactor without
/// starting its thread, so every handle can exist before any thread runs.
pub(crate) fn prepare_reactor(idx: usize, mode: crate::poller::TriggerMode) -> Result<(ReactorHandle, ReactorSeed)> {
	let (poller, waker) = Poller::new(mode)?;
	let (sender, receiver) = crossbeam_channel::unbounded();
	Ok((ReactorHandle { sender, waker: Arc::new(waker) }, ReactorSeed { idx, poller, receiver }))
}

pub(crate) fn spawn_reactor(seed: ReactorSeed, shared: Arc<CommShared>) -> JoinHandle<()> {
	std::thread::Builder::new()
		.name(format!("reactor-{}", seed.idx))
		.spawn(move || {
			ReactorThread {
				idx: seed.idx,
				poller: seed.poller,
				receiver: seed.receiver,
				shared,
				slots: slab::Slab::new(),
				conns: HashMap::new(),
				request_cache: RequestCache::default(),
				timers: BinaryHeap::new(),
			}
			.run()
		})
		.expect("spawn reactor thread")
}

struct ReactorThread {
	idx: usize,
	poller: Poller,
	receiver: Receiver<Cmd>,
	shared: Arc<CommShared>,
	slots: slab::Slab<Slot>,
	conns: HashMap<ConnId, usize>,
	request_cache: RequestCache,
	timers: BinaryHeap<TimerEntry>,
}

impl ReactorThread {
	fn run(mut self) {
		let mut events = Events::with_capacity(256);
		loop {
			let timeout = self.compute_timeout();
			if let Err(e) = self.poller.poll(&mut events, timeout) {
				error!(reactor = self.idx, error = %e, "poll failed");
				return;
			}

			loop {
				match self.receiver.try_recv() {
					Ok(Cmd::Shutdown) => {
						debug!(reactor = self.idx, "reactor shutting down");
						return;
					}
					Ok(cmd) => self.handle_cmd(cmd),
					Err(TryRecvError::Empty) => break,
					Err(TryRecvError::Disconnected) => return,
				}
			}

			for event in events.iter() {
				let token = event.token();
				if token == WAKER_TOKEN {
					continue;
				}
				// Half-closed peers surface as closed-readiness; route
				// them through the normal read/write paths so EOF and
				// write errors are observed there.
				let readable = event.is_readable() || event.is_read_closed();
				let writable = event.is_writable() || event.is_write_closed();
				self.handle_io(token, readable, writable);
			}

			self.fire_timers();
			self.expire_requests();
		}
	}

	fn compute_timeout(&self) -> Duration {
		let now = Instant::now();
		let mut deadline = now + DEFAULT_INTERVAL;
		if let Some(timer) = self.timers.peek() {
			deadline = deadline.min(timer.at);
		}
		if let Some(request) = self.request_cache.next_deadline() {
			deadline = deadline.min(request);
		}
		deadline.saturating_duration_since(now)
	}

	fn handle_cmd(&mut self, cmd: Cmd) {
		match cmd {
			Cmd::RegisterStream { conn, mut stream, addr, dispatch, connected } => {
				let interest = if connected {
					Interest::READABLE
				} else {
					Interest::READABLE | Interest::WRITABLE
				};
				let entry = self.slots.vacant_entry();
				let token = Token(entry.key());
				if let Err(e) = self.poller.register(&mut stream, token, interest) {
					error!(reactor = self.idx, addr = %addr, error = %e, "register failed");
					dispatch.handle(Event::Disconnect { conn, addr, error: code::COMM_POLL_ERROR });
					return;
				}
				entry.insert(Slot::Stream(StreamConn {
					conn,
					token,
					stream,
					addr,
					dispatch: dispatch.clone(),
					connected,
					header_buf: [0u8; HEADER_LEN],
					header_fill: 0,
					header: None,
					payload: Vec::new(),
					payload_fill: 0,
					send_queue: VecDeque::new(),
					interest,
				}));
				self.conns.insert(conn, token.0);
				if connected {
					dispatch.handle(Event::ConnectionEstablished { conn, addr });
				}
			}
			Cmd::RegisterListener { conn, mut listener, dispatch } => {
				let entry = self.slots.vacant_entry();
				let token = Token(entry.key());
				if let Err(e) = self.poller.register(&mut listener, token, Interest::READABLE) {
					error!(reactor = self.idx, error = %e, "listener register failed");
					return;
				}
				entry.insert(Slot::Listener(ListenerConn { conn, listener, dispatch }));
				self.conns.insert(conn, token.0);
			}
			Cmd::RegisterDatagram { conn, mut socket, dispatch } => {
				let entry = self.slots.vacant_entry();
				let token = Token(entry.key());
				if let Err(e) = self.poller.register(&mut socket, token, Interest::READABLE) {
					error!(reactor = self.idx, error = %e, "datagram register failed");
					return;
				}
				entry.insert(Slot::Datagram(DatagramConn {
					conn,
					token,
					socket,
					dispatch,
					send_queue: VecDeque::new(),
					interest: Interest::READABLE,
				}));
				self.conns.insert(conn, token.0);
			}
			Cmd::Send { conn, frame, request } => {
				let Some(&slot) = self.conns.get(&conn) else {
					if let Some(request) = request {
						request.handler.handle(Event::RequestFailed {
							conn,
							id: request.id,
							error: code::COMM_BROKEN_CONNECTION,
						});
					}
					return;
				};
				if let Some(request) = request {
					self.request_cache.insert(request.id, conn, request.handler, request.deadline);
				}
				let action = match self.slots.get_mut(slot) {
					Some(Slot::Stream(stream)) => stream.enqueue(frame, &self.poller),
					_ => Action::Keep,
				};
				if let Action::Remove(code) = action {
					self.remove(slot, code);
				}
			}
			Cmd::SendDatagram { conn, dest, frame } => {
				let Some(&slot) = self.conns.get(&conn) else { return };
				if let Some(Slot::Datagram(datagram)) = self.slots.get_mut(slot) {
					datagram.send_queue.push_back((dest, frame));
					datagram.flush(&self.poller);
				}
			}
			Cmd::Close { conn } => {
				if let Some(&slot) = self.conns.get(&conn) {
					self.remove(slot, code::OK);
				}
			}
			Cmd::AddTimer { at, handler } => {
				self.timers.push(TimerEntry { at, handler });
			}
			Cmd::Shutdown => unreachable!("handled in run loop"),
		}
	}

	fn handle_io(&mut self, token: Token, readable: bool, writable: bool) {
		let Some(slot) = self.slots.get_mut(token.0) else { return };
		match slot {
			Slot::Stream(conn) => {
				let mut action = Action::Keep;
				if writable {
					action = conn.on_writable(&self.poller);
				}
				if matches!(action, Action::Keep) && readable {
					action = conn.on_readable(&mut self.request_cache);
				}
				if let Action::Remove(code) = action {
					self.remove(token.0, code);
				}
			}
			Slot::Listener(listener) => {
				let dispatch = listener.dispatch.clone();
				let mut accepted = Vec::new();
				loop {
					match listener.listener.accept() {
						Ok((stream, addr)) => accepted.push((stream, addr)),
						Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
						Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
						Err(e) => {
							warn!(error = %e, "accept failed");
							break;
						}
					}
				}
				for (stream, addr) in accepted {
					self.register_accepted(stream, addr, dispatch.clone());
				}
			}
			Slot::Datagram(datagram) => {
				if readable {
					datagram.on_readable();
				}
				if writable {
					datagram.flush(&self.poller);
				}
			}
		}
	}

	/// Configures an accepted socket and hands it to the next reactor in
	/// round-robin order (possibly this one).
	fn register_accepted(&mut self, stream: TcpStream, addr: SocketAddr, dispatch: Arc<dyn DispatchHandler>) {
		if let Err(e) = self.shared.configure_stream(&stream) {
			warn!(addr = %addr, error = %e, "socket option setup failed");
		}
		let target = self.shared.pick_reactor();
		let conn = self.shared.alloc_conn(target);
		let cmd = Cmd::RegisterStream { conn, stream, addr, dispatch, connected: true };
		if target == self.idx {
			self.handle_cmd(cmd);
		} else if let Err(e) = self.shared.handles[target].send(cmd) {
			error!(target, error = %e, "handing off accepted connection failed");
		}
	}

	fn remove(&mut self, slot: usize, error: u32) {
		let Some(removed) = self.slots.try_remove(slot) else { return };
		match removed {
			Slot::Stream(mut conn) => {
				let _ = self.poller.deregister(&mut conn.stream);
				self.conns.remove(&conn.conn);
				conn.dispatch.handle(Event::Disconnect { conn: conn.conn, addr: conn.addr, error });
				for (id, handler) in self.request_cache.purge_connection(conn.conn) {
					handler.handle(Event::RequestFailed {
						conn: conn.conn,
						id,
						error: code::COMM_BROKEN_CONNECTION,
					});
				}
			}
			Slot::Listener(mut listener) => {
				let _ = self.poller.deregister(&mut listener.listener);
				self.conns.remove(&listener.conn);
			}
			Slot::Datagram(mut datagram) => {
				let _ = self.poller.deregister(&mut datagram.socket);
				self.conns.remove(&datagram.conn);
			}
		}
	}

	fn fire_timers(&mut self) {
		let now = Instant::now();
		while self.timers.peek().is_some_and(|t| t.at <= now) {
			let timer = self.timers.pop().expect("peeked entry");
			timer.handler.on_timer();
		}
	}

	fn expire_requests(&mut self) {
		let now = Instant::now();
		while let Some((id, entry)) = self.request_cache.next_expired(now) {
			debug!(reactor = self.idx, id, "request timed out");
			if let Some(handler) = entry.handler {
				handler.handle(Event::RequestFailed {
					conn: entry.conn,
					id,
					error: code::REQUEST_TIMEOUT,
				});
			}
		}
	}
}
