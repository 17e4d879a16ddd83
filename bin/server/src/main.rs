// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 StrataDB

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use strata_comm::{ApplicationQueue, ApplicationQueueConfig, Comm, CommConfig};
use strata_core::ServerOptions;
use strata_fs::{Filesystem, LocalFs};
use strata_server::{RangeServer, ServerDispatch};

#[derive(Parser)]
#[command(name = "stratadb-server")]
#[command(about = "StrataDB range server", long_about = None)]
#[command(version)]
struct Args {
	/// TCP listen port
	#[arg(short = 'p', long, env = "STRATADB_PORT", default_value = "38060")]
	port: u16,

	/// Data directory holding logs and cell stores
	#[arg(short = 'd', long, env = "STRATADB_DATA_DIR", default_value = "./stratadb-data")]
	data_dir: PathBuf,

	/// Application-queue worker count (default: 2x cores)
	#[arg(long)]
	workers: Option<usize>,

	/// Reactor thread count (default: cores, capped at 4)
	#[arg(long)]
	reactors: Option<usize>,

	/// Maintenance pool size
	#[arg(long, default_value = "2")]
	maintenance_threads: usize,

	/// User-range split trigger, bytes
	#[arg(long)]
	range_split_size: Option<u64>,

	/// Hard per-range size cap, bytes
	#[arg(long)]
	range_maximum_size: Option<u64>,

	/// Overall memory budget, bytes
	#[arg(long)]
	memory_limit: Option<u64>,

	/// Maximum accepted clock skew, microseconds
	#[arg(long)]
	max_clock_skew_us: Option<i64>,

	/// Server-side scanner idle timeout, milliseconds
	#[arg(long)]
	scanner_ttl_ms: Option<u64>,

	/// Commit-log fragment size cap, bytes
	#[arg(long)]
	log_roll_limit: Option<u64>,

	/// Block-cache ceiling, bytes
	#[arg(long)]
	block_cache_max_memory: Option<u64>,

	/// Point-query cache budget, bytes; 0 disables it
	#[arg(long)]
	query_cache_max_memory: Option<u64>,
}

impl Args {
	fn to_options(&self) -> ServerOptions {
		let mut opts = ServerOptions { port: self.port, ..ServerOptions::default() };
		if let Some(workers) = self.workers {
			opts.workers = workers;
		}
		if let Some(reactors) = self.reactors {
			opts.reactors = reactors;
		}
		opts.maintenance_threads = self.maintenance_threads;
		if let Some(v) = self.range_split_size {
			opts.range_split_size = v;
		}
		if let Some(v) = self.range_maximum_size {
			opts.range_maximum_size = v;
		}
		if let Some(v) = self.memory_limit {
			opts.memory_limit = v;
		}
		if let Some(v) = self.max_clock_skew_us {
			opts.max_clock_skew_us = v;
		}
		if let Some(v) = self.scanner_ttl_ms {
			opts.scanner_ttl = Duration::from_millis(v);
		}
		if let Some(v) = self.log_roll_limit {
			opts.log_roll_limit = v;
		}
		if let Some(v) = self.block_cache_max_memory {
			opts.block_cache_max_memory = v;
		}
		if let Some(v) = self.query_cache_max_memory {
			opts.query_cache_max_memory = v;
		}
		opts
	}
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
		.init();

	let args = Args::parse();
	let opts = args.to_options();

	let fs: Arc<dyn Filesystem> = Arc::new(LocalFs::new(&args.data_dir));
	let server = RangeServer::start(fs, opts.clone())?;

	let comm = Comm::new(CommConfig { reactors: opts.reactors, ..CommConfig::default() })?;
	let queue = ApplicationQueue::start(ApplicationQueueConfig {
		workers: opts.workers,
		..ApplicationQueueConfig::default()
	});
	let dispatch = ServerDispatch::new(server.clone(), comm.clone(), queue.clone());

	let addr: SocketAddr = format!("0.0.0.0:{}", opts.port).parse()?;
	let (_, bound) = comm.listen(addr, dispatch)?;
	info!(addr = %bound, data_dir = %args.data_dir.display(), "range server ready");

	// Park until the server is asked to close (over the wire) or the
	// process is interrupted.
	while !server.is_down() {
		std::thread::sleep(Duration::from_millis(250));
	}

	queue.shutdown();
	comm.shutdown();
	info!("shutdown complete");
	Ok(())
}
