// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 StrataDB

//! End-to-end scenarios against the service surface: basic reads and
//! writes, range boundaries, revision ordering, splits under load, crash
//! recovery, scanner snapshots and master-driven replay.

mod common;

use std::sync::Arc;

use common::*;
use strata_core::{
	Error, RangeSpec, RangeState, ScanSpec, ServerOptions, TableIdentifier, code,
	key::END_ROW_MARKER,
	util::encoding::{encode_i64, encode_u32},
};
use strata_server::{Schema, protocol::replay_group};
use strata_testing::tempdir::temp_dir;

fn users_range() -> RangeSpec {
	RangeSpec::new(Vec::new(), b"m".to_vec())
}

#[test]
fn s1_basic_put_get() {
	temp_dir(|root| {
		let server = start_server(root, ServerOptions::small_for_tests())?;
		load_users_range(&server, &users_range())?;

		let send_backs = update_ok(&server, &[cell_auto("alice", "age", "30")])?;
		assert!(send_backs.is_empty(), "clean batch reports no errors: {send_backs:?}");

		let cells = scan_row(&server, &users_range(), "alice")?;
		assert_eq!(cells.len(), 1);
		assert_eq!(cells[0].row, b"alice");
		assert_eq!(cells[0].qualifier, b"age");
		assert_eq!(cells[0].value, b"30");
		assert!(cells[0].timestamp > 0, "server assigned a timestamp");
		server.close()?;
		Ok(())
	})
	.unwrap()
}

#[test]
fn s2_out_of_range_rows_are_sent_back() {
	temp_dir(|root| {
		let server = start_server(root, ServerOptions::small_for_tests())?;
		load_users_range(&server, &users_range())?;

		let cell = cell_auto("zeta", "age", "9");
		let len = cell.len();
		let send_backs = update_ok(&server, &[cell])?;
		assert_eq!(send_backs.len(), 1);
		assert_eq!(send_backs[0].error, code::OUT_OF_RANGE);
		assert_eq!(send_backs[0].count, 1);
		assert_eq!(send_backs[0].offset, 0);
		assert_eq!(send_backs[0].len as usize, len);

		// The in-range part of a mixed batch still lands.
		let send_backs =
			update_ok(&server, &[cell_auto("alice", "a", "1"), cell_auto("zeta", "b", "2")])?;
		assert_eq!(send_backs.len(), 1);
		assert_eq!(send_backs[0].error, code::OUT_OF_RANGE);
		assert_eq!(scan_row(&server, &users_range(), "alice")?.len(), 1);
		Ok(())
	})
	.unwrap()
}

#[test]
fn s3_revision_order_is_enforced() {
	temp_dir(|root| {
		let server = start_server(root, ServerOptions::small_for_tests())?;
		load_users_range(&server, &users_range())?;

		update_ok(&server, &[cell_explicit("alice", "age", 100, 100, "first")])?;
		let second = update_ok(&server, &[cell_explicit("alice", "age", 50, 50, "stale")]);
		assert!(
			matches!(second, Err(Error::RevisionOrder { supplied: 50, .. })),
			"got {second:?}"
		);

		// The first batch is durable and visible.
		let cells = scan_row(&server, &users_range(), "alice")?;
		assert_eq!(cells.len(), 1);
		assert_eq!(cells[0].value, b"first");
		Ok(())
	})
	.unwrap()
}

#[test]
fn s4_split_under_load() {
	temp_dir(|root| {
		let server = start_server(root, ServerOptions::small_for_tests())?;
		load_users_range(&server, &users_range())?;

		// Push the range over the split trigger.
		let filler = "x".repeat(512);
		for i in 0..256 {
			update_ok(&server, &[cell_auto(&format!("c-{i:04}"), "data", &filler)])?;
		}
		// Drain write-triggered compactions first so the scheduler pass
		// finds the queue free and can place the split task.
		server.quiesce_maintenance();
		server.do_maintenance();
		server.quiesce_maintenance();

		// The parent shrank to (start, split_row]: rows at the low end
		// still resolve, rows in the split-off half no longer do.
		let send_backs = update_ok(&server, &[cell_auto("c-0000", "data", "post")])?;
		assert!(send_backs.is_empty(), "low half still writable: {send_backs:?}");
		let send_backs = update_ok(&server, &[cell_auto("k-9999", "data", "post")])?;
		assert_eq!(send_backs.len(), 1, "high half now out of range");
		assert_eq!(send_backs[0].error, code::OUT_OF_RANGE);

		// Scans against the pre-split interval tell the client to
		// refresh its range locator.
		let scan = server.create_scanner(
			&users_table(),
			&users_range(),
			ScanSpec::single_row(b"c-0100".to_vec()),
		);
		assert!(matches!(scan, Err(Error::OutOfRange)), "got {scan:?}");

		// Parent's new end row is the split row; recover it from the
		// statistics payload instead of poking internals.
		let stats = server.get_statistics()?;
		let split_row = {
			let mut cursor = stats.as_slice();
			let count = strata_core::util::encoding::decode_vu32(&mut cursor)?;
			assert_eq!(count, 1);
			let _table_id = strata_core::util::encoding::decode_u32(&mut cursor)?;
			let _start = strata_core::util::encoding::decode_bytes(&mut cursor)?.to_vec();
			strata_core::util::encoding::decode_bytes(&mut cursor)?.to_vec()
		};
		assert!(split_row.as_slice() > b"c-0000".as_slice());
		assert!(split_row.as_slice() < b"c-0255".as_slice());

		// The child inherits the split-off half through the transfer
		// log, exactly as a master-driven reassignment would load it.
		let fs = strata_fs::LocalFs::new(root);
		use strata_fs::Filesystem;
		let transfer_dirs = fs.readdir("log/transfer")?;
		assert_eq!(transfer_dirs.len(), 1, "one split leaves one transfer log");
		let transfer_dir = format!("log/transfer/{}", transfer_dirs[0]);

		let child_spec = RangeSpec::new(split_row.clone(), b"m".to_vec());
		server.load_range(
			&users_table(),
			&child_spec,
			Some(&transfer_dir),
			&users_schema().to_json(),
			RangeState::Steady,
		)?;

		// A row from the split-off half is now served by the child.
		let cells = scan_all(&server, &child_spec, ScanSpec::single_row(b"c-0255".to_vec()))?;
		assert_eq!(cells.len(), 1);
		assert_eq!(cells[0].value.len(), filler.len());
		Ok(())
	})
	.unwrap()
}

#[test]
fn s5_crash_recovery_replays_synced_batches() {
	temp_dir(|root| {
		{
			let server = start_server(root, ServerOptions::small_for_tests())?;
			load_users_range(&server, &users_range())?;
			update_ok(&server, &[cell_auto("carol", "age", "44"), cell_auto("dave", "age", "51")])?;
			// No close(): the process dies with the cell cache lost and
			// only the commit log surviving.
			drop(server);
		}

		let server = start_server(root, ServerOptions::small_for_tests())?;
		let cells = scan_row(&server, &users_range(), "carol")?;
		assert_eq!(cells.len(), 1);
		assert_eq!(cells[0].value, b"44");
		let cells = scan_row(&server, &users_range(), "dave")?;
		assert_eq!(cells.len(), 1);
		assert_eq!(cells[0].value, b"51");
		Ok(())
	})
	.unwrap()
}

#[test]
fn s6_scanners_see_a_revision_snapshot() {
	temp_dir(|root| {
		let server = start_server(root, ServerOptions::small_for_tests())?;
		load_users_range(&server, &users_range())?;

		let filler = "v".repeat(400);
		for i in 0..40 {
			update_ok(&server, &[cell_auto(&format!("c-{i:03}"), "q", &filler)])?;
		}

		// Scan block budget (4 KiB) forces pagination, so the scanner
		// outlives the concurrent update below.
		let first = server.create_scanner(&users_table(), &users_range(), ScanSpec::default())?;
		assert!(!first.eos, "scan must paginate for this test to bite");

		// Sorts after every existing row but inside the range, so the
		// open scanner would reach it if it were visible.
		update_ok(&server, &[cell_auto("k-999", "q", "late write")])?;

		let mut cells = decode_scan_block(&first.block)?;
		let mut result = first;
		while !result.eos {
			result = server.fetch_scanblock(result.scanner_id)?;
			cells.extend(decode_scan_block(&result.block)?);
		}
		assert_eq!(cells.len(), 40, "scanner A must not see the late write");
		assert!(cells.iter().all(|c| c.row != b"k-999"));

		// A scanner opened after the write observes it.
		let cells = scan_all(&server, &users_range(), ScanSpec::default())?;
		assert_eq!(cells.len(), 41);
		Ok(())
	})
	.unwrap()
}

#[test]
fn committed_batches_have_disjoint_ascending_revisions() {
	temp_dir(|root| {
		let server = start_server(root, ServerOptions::small_for_tests())?;
		load_users_range(&server, &users_range())?;

		let submitted_at = strata_core::util::time::now_micros();
		update_ok(&server, &[cell_auto("a1", "q", "1"), cell_auto("a2", "q", "2")])?;
		let batch1: Vec<i64> = scan_all(&server, &users_range(), ScanSpec::default())?
			.iter()
			.map(|c| c.revision)
			.collect();
		assert!(
			batch1.iter().all(|&r| r >= submitted_at),
			"assigned revisions track the wall clock in microseconds"
		);

		update_ok(&server, &[cell_auto("b1", "q", "3"), cell_auto("b2", "q", "4")])?;
		let all = scan_all(&server, &users_range(), ScanSpec::default())?;
		let batch2: Vec<i64> = all
			.iter()
			.filter(|c| c.row.starts_with(b"b"))
			.map(|c| c.revision)
			.collect();

		let max1 = batch1.iter().max().unwrap();
		let min2 = batch2.iter().min().unwrap();
		assert!(max1 < min2, "batch 1 ({max1}) must commit below batch 2 ({min2})");
		Ok(())
	})
	.unwrap()
}

#[test]
fn minor_compaction_preserves_the_observable_cell_set() {
	temp_dir(|root| {
		let server = start_server(root, ServerOptions::small_for_tests())?;
		load_users_range(&server, &users_range())?;

		for i in 0..50 {
			update_ok(&server, &[cell_auto(&format!("k-{i:03}"), "q", &format!("v{i}"))])?;
		}
		update_ok(&server, &[delete_row_cell("k-010", i64::MAX / 2, i64::MAX / 2)])?;

		let before = scan_all(&server, &users_range(), ScanSpec::default())?;
		assert_eq!(before.len(), 49, "deleted row is shadowed pre-compaction");

		server.compact(&users_table(), &users_range(), false)?;
		server.quiesce_maintenance();

		let after = scan_all(&server, &users_range(), ScanSpec::default())?;
		assert_eq!(before, after, "minor compaction must not change the cell set");

		// And again through a major compaction, which may drop the
		// tombstone itself but never a live cell.
		server.compact(&users_table(), &users_range(), true)?;
		server.quiesce_maintenance();
		let after_major = scan_all(&server, &users_range(), ScanSpec::default())?;
		assert_eq!(before, after_major);
		Ok(())
	})
	.unwrap()
}

#[test]
fn stale_generation_is_rejected() {
	temp_dir(|root| {
		let server = start_server(root, ServerOptions::small_for_tests())?;
		load_users_range(&server, &users_range())?;

		let mut stale = users_table();
		stale.generation = 9;
		let (count, payload) = batch(&[cell_auto("alice", "q", "1")]);
		let result = server.update(&stale, count, &payload, 0);
		assert!(matches!(result, Err(Error::GenerationMismatch { .. })), "got {result:?}");
		Ok(())
	})
	.unwrap()
}

#[test]
fn update_schema_bumps_generation() {
	temp_dir(|root| {
		let server = start_server(root, ServerOptions::small_for_tests())?;
		load_users_range(&server, &users_range())?;

		let mut next = users_schema();
		next.generation = 2;
		server.update_schema(&users_table(), &next.to_json())?;

		// The old generation no longer passes.
		let (count, payload) = batch(&[cell_auto("alice", "q", "1")]);
		assert!(matches!(
			server.update(&users_table(), count, &payload, 0),
			Err(Error::GenerationMismatch { .. })
		));

		let mut current = users_table();
		current.generation = 2;
		assert!(server.update(&current, count, &payload, 0)?.is_empty());

		// Re-submitting the same generation is a mismatch.
		assert!(matches!(
			server.update_schema(&users_table(), &next.to_json()),
			Err(Error::GenerationMismatch { .. })
		));
		Ok(())
	})
	.unwrap()
}

#[test]
fn dropped_tables_reject_loads_and_updates() {
	temp_dir(|root| {
		let server = start_server(root, ServerOptions::small_for_tests())?;
		load_users_range(&server, &users_range())?;
		update_ok(&server, &[cell_auto("alice", "q", "1")])?;

		server.drop_table(&users_table())?;

		let (count, payload) = batch(&[cell_auto("alice", "q", "2")]);
		assert!(matches!(
			server.update(&users_table(), count, &payload, 0),
			Err(Error::TableNotFound(_))
		));
		assert!(matches!(
			load_users_range(&server, &users_range()),
			Err(Error::TableDropped(_))
		));

		// The drop survives restart via the range transaction log.
		drop(server);
		let server = start_server(root, ServerOptions::small_for_tests())?;
		assert!(matches!(
			server.create_scanner(&users_table(), &users_range(), ScanSpec::default()),
			Err(Error::TableNotFound(_))
		));
		Ok(())
	})
	.unwrap()
}

#[test]
fn drop_range_unloads_exactly_that_range() {
	temp_dir(|root| {
		let server = start_server(root, ServerOptions::small_for_tests())?;
		let low = RangeSpec::new(Vec::new(), b"g".to_vec());
		let high = RangeSpec::new(b"g".to_vec(), END_ROW_MARKER.to_vec());
		load_users_range(&server, &low)?;
		load_users_range(&server, &high)?;

		update_ok(&server, &[cell_auto("aaa", "q", "1"), cell_auto("zzz", "q", "2")])?;

		server.drop_range(&users_table(), &low)?;
		assert!(matches!(
			server.drop_range(&users_table(), &low),
			Err(Error::RangeNotFound(_))
		));

		// Low rows are out of range now, high rows still served.
		let send_backs = update_ok(&server, &[cell_auto("abc", "q", "3")])?;
		assert_eq!(send_backs[0].error, code::OUT_OF_RANGE);
		assert_eq!(scan_row(&server, &high, "zzz")?.len(), 1);
		Ok(())
	})
	.unwrap()
}

#[test]
fn point_queries_reflect_later_writes() {
	temp_dir(|root| {
		// Query cache enabled by default options; the second identical
		// scan is served from it, and the write in between must
		// invalidate it.
		let server = start_server(root, ServerOptions::small_for_tests())?;
		load_users_range(&server, &users_range())?;

		update_ok(&server, &[cell_explicit("alice", "q", 10, 10, "v1")])?;
		assert_eq!(scan_row(&server, &users_range(), "alice")?[0].value, b"v1");
		// Hit the cache once.
		assert_eq!(scan_row(&server, &users_range(), "alice")?[0].value, b"v1");

		update_ok(&server, &[cell_explicit("alice", "q", 20, 20, "v2")])?;
		let cells = scan_row(&server, &users_range(), "alice")?;
		assert_eq!(cells[0].value, b"v2", "stale cache entry must be invalidated");
		Ok(())
	})
	.unwrap()
}

#[test]
fn replay_flow_promotes_ranges_to_live() {
	temp_dir(|root| {
		let server = start_server(root, ServerOptions::small_for_tests())?;

		server.replay_begin(replay_group::USER)?;
		server.replay_load_range(
			&users_table(),
			&users_range(),
			&users_schema().to_json(),
			RangeState::Steady,
		)?;

		// One replay segment: [len][revision][table][cells].
		let mut cells = Vec::new();
		users_table().encode(&mut cells);
		cells.extend_from_slice(&cell_explicit("eve", "q", 33, 33, "recovered"));
		let mut payload = Vec::new();
		encode_u32(&mut payload, cells.len() as u32);
		encode_i64(&mut payload, 33);
		payload.extend_from_slice(&cells);
		server.replay_update(&payload)?;
		server.replay_commit()?;

		let cells = scan_row(&server, &users_range(), "eve")?;
		assert_eq!(cells.len(), 1);
		assert_eq!(cells[0].value, b"recovered");
		Ok(())
	})
	.unwrap()
}

#[test]
fn deletes_shadow_and_survive_recovery() {
	temp_dir(|root| {
		{
			let server = start_server(root, ServerOptions::small_for_tests())?;
			load_users_range(&server, &users_range())?;
			update_ok(&server, &[cell_explicit("gone", "q", 10, 10, "old")])?;
			update_ok(&server, &[delete_row_cell("gone", 20, 20)])?;
			assert!(scan_row(&server, &users_range(), "gone")?.is_empty());
			drop(server);
		}
		let server = start_server(root, ServerOptions::small_for_tests())?;
		assert!(
			scan_row(&server, &users_range(), "gone")?.is_empty(),
			"tombstone must replay along with the insert"
		);
		Ok(())
	})
	.unwrap()
}

#[test]
fn split_survives_restart_mid_state() {
	temp_dir(|root| {
		// Drive a split, then restart and verify the shrunken interval
		// and steady state persisted through the range transaction log.
		{
			let server = start_server(root, ServerOptions::small_for_tests())?;
			load_users_range(&server, &users_range())?;
			let filler = "s".repeat(512);
			for i in 0..200 {
				update_ok(&server, &[cell_auto(&format!("c-{i:04}"), "q", &filler)])?;
			}
			server.quiesce_maintenance();
			server.do_maintenance();
			server.quiesce_maintenance();
			drop(server);
		}
		let server = start_server(root, ServerOptions::small_for_tests())?;
		// Low rows are in, the split-off half is out.
		let ok = update_ok(&server, &[cell_auto("c-0000", "q", "after")])?;
		assert!(ok.is_empty());
		let out = update_ok(&server, &[cell_auto("k-9999", "q", "after")])?;
		assert_eq!(out[0].error, code::OUT_OF_RANGE);
		Ok(())
	})
	.unwrap()
}

#[test]
fn bad_table_generation_on_load_is_rejected() {
	temp_dir(|root| {
		let server = start_server(root, ServerOptions::small_for_tests())?;
		let mut table = users_table();
		table.generation = 3; // schema says 1
		let result = server.load_range(
			&table,
			&users_range(),
			None,
			&users_schema().to_json(),
			RangeState::Steady,
		);
		assert!(matches!(result, Err(Error::GenerationMismatch { .. })));
		Ok(())
	})
	.unwrap()
}

#[test]
fn loading_the_same_range_twice_fails() {
	temp_dir(|root| {
		let server = start_server(root, ServerOptions::small_for_tests())?;
		load_users_range(&server, &users_range())?;
		assert!(matches!(
			load_users_range(&server, &users_range()),
			Err(Error::RangeAlreadyLoaded(_))
		));
		Ok(())
	})
	.unwrap()
}

#[test]
fn schema_with_multiple_access_groups_routes_families() {
	temp_dir(|root| {
		let schema = Schema::parse(
			r#"{"generation": 1, "access_groups": [
				{"name": "hot", "column_families": [{"id": 1, "name": "info"}]},
				{"name": "cold", "column_families": [{"id": 2, "name": "archive"}]}
			]}"#,
		)?;
		let server = start_server(root, ServerOptions::small_for_tests())?;
		let table = TableIdentifier::new(9, "mixed", 1);
		server.load_range(
			&table,
			&RangeSpec::full(),
			None,
			&schema.to_json(),
			RangeState::Steady,
		)?;

		let mut hot = Vec::new();
		strata_core::key::encode_wire_key(
			&mut hot,
			strata_core::key::control::AUTO_TIMESTAMP,
			b"r1",
			1,
			b"a",
			strata_core::key::flag::INSERT,
			0,
			0,
		);
		strata_core::util::encoding::encode_bytes(&mut hot, b"hot-value");
		let mut cold = Vec::new();
		strata_core::key::encode_wire_key(
			&mut cold,
			strata_core::key::control::AUTO_TIMESTAMP,
			b"r1",
			2,
			b"b",
			strata_core::key::flag::INSERT,
			0,
			0,
		);
		strata_core::util::encoding::encode_bytes(&mut cold, b"cold-value");
		let mut payload = hot;
		payload.extend_from_slice(&cold);
		assert!(server.update(&table, 2, &payload, 0)?.is_empty());

		let result =
			server.create_scanner(&table, &RangeSpec::full(), ScanSpec::single_row(b"r1".to_vec()))?;
		let cells = decode_scan_block(&result.block)?;
		assert_eq!(cells.len(), 2, "both access groups contribute to the row");
		Ok(())
	})
	.unwrap()
}
