// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 StrataDB

use std::{
	fs,
	path::{Path, PathBuf},
	sync::atomic::{AtomicU64, Ordering},
	time::{SystemTime, UNIX_EPOCH},
};

use strata_core::Result;

static COUNTER: AtomicU64 = AtomicU64::new(0);

fn unique_dir() -> PathBuf {
	let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().subsec_nanos();
	let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
	std::env::temp_dir().join(format!("stratadb-test-{}-{}-{}", std::process::id(), nanos, seq))
}

/// Runs `f` with a fresh directory, removing it afterwards regardless of
/// the outcome.
pub fn temp_dir<T>(f: impl FnOnce(&Path) -> Result<T>) -> Result<T> {
	let dir = unique_dir();
	fs::create_dir_all(&dir)?;
	let result = f(&dir);
	let _ = fs::remove_dir_all(&dir);
	result
}
