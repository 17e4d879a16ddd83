// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 StrataDB

//! End-to-end loopback tests exercising the reactor pool with real
//! sockets: framing, request/response pairing, timeouts, disconnects and
//! datagrams.

use std::{
	net::SocketAddr,
	sync::{Arc, OnceLock},
	time::Duration,
};

use crossbeam_channel::{Receiver, Sender, unbounded};
use strata_comm::{Comm, CommConfig, DispatchHandler, Event, RequestSpec};
use strata_core::code;

fn any_addr() -> SocketAddr {
	"127.0.0.1:0".parse().unwrap()
}

/// Server side: echoes request payloads back with a prefix.
struct EchoServer {
	comm: OnceLock<Arc<Comm>>,
}

impl DispatchHandler for EchoServer {
	fn handle(&self, event: Event) {
		if let Event::Message { conn, header, payload, .. } = event {
			if header.is_request() {
				let mut reply = b"echo:".to_vec();
				reply.extend_from_slice(&payload);
				let comm = self.comm.get().expect("comm wired up");
				comm.send_response(conn, &header, reply).expect("send response");
			}
		}
	}
}

/// Client side: forwards every event into a channel the test thread
/// drains.
struct Forwarder {
	tx: Sender<Event>,
}

impl DispatchHandler for Forwarder {
	fn handle(&self, event: Event) {
		let _ = self.tx.send(event);
	}
}

fn recv_timeout(rx: &Receiver<Event>) -> Event {
	rx.recv_timeout(Duration::from_secs(10)).expect("event within timeout")
}

fn start_echo_server(comm: &Arc<Comm>) -> SocketAddr {
	let server = Arc::new(EchoServer { comm: OnceLock::new() });
	let _ = server.comm.set(comm.clone());
	let (_, addr) = comm.listen(any_addr(), server).expect("listen");
	addr
}

#[test]
fn request_response_round_trip() {
	let comm = Comm::new(CommConfig::default()).unwrap();
	let addr = start_echo_server(&comm);

	let (tx, rx) = unbounded();
	let client = Arc::new(Forwarder { tx });
	let conn = comm.connect(addr, client.clone()).unwrap();

	match recv_timeout(&rx) {
		Event::ConnectionEstablished { conn: c, .. } => assert_eq!(c, conn),
		other => panic!("expected ConnectionEstablished, got {other:?}"),
	}

	let id = comm
		.send_request(
			conn,
			RequestSpec {
				command: 7,
				gid: 0,
				urgent: false,
				timeout: Duration::from_secs(5),
				payload: b"ping".to_vec(),
			},
			client.clone(),
		)
		.unwrap();

	match recv_timeout(&rx) {
		Event::Message { header, payload, .. } => {
			assert_eq!(header.id, id);
			assert_eq!(header.command, 7);
			assert!(header.is_response());
			assert_eq!(payload, b"echo:ping");
		}
		other => panic!("expected response, got {other:?}"),
	}
	comm.shutdown();
}

#[test]
fn many_requests_multiplex_on_one_connection() {
	let comm = Comm::new(CommConfig { reactors: 3, ..CommConfig::default() }).unwrap();
	let addr = start_echo_server(&comm);

	let (tx, rx) = unbounded();
	let client = Arc::new(Forwarder { tx });
	let conn = comm.connect(addr, client.clone()).unwrap();
	recv_timeout(&rx); // established

	let mut expected = std::collections::HashMap::new();
	for i in 0..50u32 {
		let payload = format!("req-{i}").into_bytes();
		let id = comm
			.send_request(
				conn,
				RequestSpec {
					command: 1,
					gid: 0,
					urgent: false,
					timeout: Duration::from_secs(5),
					payload: payload.clone(),
				},
				client.clone(),
			)
			.unwrap();
		let mut want = b"echo:".to_vec();
		want.extend_from_slice(&payload);
		expected.insert(id, want);
	}

	for _ in 0..50 {
		match recv_timeout(&rx) {
			Event::Message { header, payload, .. } => {
				let want = expected.remove(&header.id).expect("unexpected id");
				assert_eq!(payload, want);
			}
			other => panic!("expected response, got {other:?}"),
		}
	}
	assert!(expected.is_empty());
	comm.shutdown();
}

/// Server that swallows requests, for timeout tests.
struct BlackHole;
impl DispatchHandler for BlackHole {
	fn handle(&self, _event: Event) {}
}

#[test]
fn unanswered_request_times_out() {
	let comm = Comm::new(CommConfig::default()).unwrap();
	let (_, addr) = comm.listen(any_addr(), Arc::new(BlackHole)).unwrap();

	let (tx, rx) = unbounded();
	let client = Arc::new(Forwarder { tx });
	let conn = comm.connect(addr, client.clone()).unwrap();
	recv_timeout(&rx); // established

	let id = comm
		.send_request(
			conn,
			RequestSpec {
				command: 2,
				gid: 0,
				urgent: false,
				timeout: Duration::from_millis(100),
				payload: b"void".to_vec(),
			},
			client.clone(),
		)
		.unwrap();

	match recv_timeout(&rx) {
		Event::RequestFailed { id: failed, error, .. } => {
			assert_eq!(failed, id);
			assert_eq!(error, code::REQUEST_TIMEOUT);
		}
		other => panic!("expected RequestFailed, got {other:?}"),
	}
	comm.shutdown();
}

#[test]
fn disconnect_is_delivered_once_and_cancels_requests() {
	let comm = Comm::new(CommConfig::default()).unwrap();
	let (_, addr) = comm.listen(any_addr(), Arc::new(BlackHole)).unwrap();

	let (tx, rx) = unbounded();
	let client = Arc::new(Forwarder { tx });
	let conn = comm.connect(addr, client.clone()).unwrap();
	recv_timeout(&rx); // established

	comm.send_request(
		conn,
		RequestSpec {
			command: 3,
			gid: 0,
			urgent: false,
			timeout: Duration::from_secs(30),
			payload: b"pending".to_vec(),
		},
		client.clone(),
	)
	.unwrap();

	comm.close_connection(conn).unwrap();

	let mut saw_disconnect = 0;
	let mut saw_failed = 0;
	for _ in 0..2 {
		match recv_timeout(&rx) {
			Event::Disconnect { conn: c, .. } => {
				assert_eq!(c, conn);
				saw_disconnect += 1;
			}
			Event::RequestFailed { error, .. } => {
				assert_eq!(error, code::COMM_BROKEN_CONNECTION);
				saw_failed += 1;
			}
			other => panic!("unexpected event {other:?}"),
		}
	}
	assert_eq!(saw_disconnect, 1);
	assert_eq!(saw_failed, 1);
	comm.shutdown();
}

#[test]
fn datagram_round_trip() {
	let comm = Comm::new(CommConfig::default()).unwrap();

	let (tx_a, rx_a) = unbounded();
	let (tx_b, rx_b) = unbounded();
	let (conn_a, addr_a) = comm.open_datagram(any_addr(), Arc::new(Forwarder { tx: tx_a })).unwrap();
	let (conn_b, addr_b) = comm.open_datagram(any_addr(), Arc::new(Forwarder { tx: tx_b })).unwrap();

	comm.send_datagram(conn_a, addr_b, 9, b"over udp".to_vec()).unwrap();

	match recv_timeout(&rx_b) {
		Event::Message { header, payload, from, .. } => {
			assert_eq!(header.command, 9);
			assert_eq!(payload, b"over udp");
			assert_eq!(from.port(), addr_a.port());
		}
		other => panic!("expected datagram message, got {other:?}"),
	}

	comm.send_datagram(conn_b, addr_a, 10, b"reply".to_vec()).unwrap();
	match recv_timeout(&rx_a) {
		Event::Message { header, payload, .. } => {
			assert_eq!(header.command, 10);
			assert_eq!(payload, b"reply");
		}
		other => panic!("expected datagram message, got {other:?}"),
	}
	comm.shutdown();
}

#[test]
fn connect_to_closed_port_reports_failure() {
	let comm = Comm::new(CommConfig::default()).unwrap();

	// Bind-then-drop to get a port nothing listens on.
	let port = {
		let sock = std::net::TcpListener::bind(any_addr()).unwrap();
		sock.local_addr().unwrap().port()
	};
	let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();

	let (tx, rx) = unbounded();
	let client = Arc::new(Forwarder { tx });
	if comm.connect(addr, client).is_err() {
		return; // synchronous refusal is acceptable too
	}

	match recv_timeout(&rx) {
		Event::Disconnect { error, .. } => {
			assert!(error == code::COMM_CONNECT_ERROR || error == code::COMM_BROKEN_CONNECTION);
		}
		other => panic!("expected Disconnect, got {other:?}"),
	}
	comm.shutdown();
}
