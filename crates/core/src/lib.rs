// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 StrataDB

pub use config::ServerOptions;
pub use error::{Error, code};
pub use ident::{RangeSpec, RangeState, TableIdentifier};
pub use key::{CellKey, Key};
pub use scan::{CellInterval, RowInterval, ScanSpec, TimeInterval};

pub mod config;
mod error;
mod ident;
pub mod key;
mod scan;
pub mod util;

pub type Result<T> = std::result::Result<T, Error>;
