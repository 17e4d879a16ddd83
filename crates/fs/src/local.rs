// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 StrataDB

use std::{
	fs::{self, File, OpenOptions},
	io::{Read, Seek, SeekFrom, Write},
	path::{Path, PathBuf},
};

use strata_core::{Error, Result};

use crate::{Filesystem, FsFile, FsReader};

/// Local-disk filesystem rooted at a base directory.
#[derive(Debug, Clone)]
pub struct LocalFs {
	root: PathBuf,
}

impl LocalFs {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self { root: root.into() }
	}

	fn resolve(&self, path: &str) -> PathBuf {
		self.root.join(path.trim_start_matches('/'))
	}

	fn not_found(path: &Path) -> Error {
		Error::FileNotFound(path.display().to_string())
	}
}

struct LocalFile {
	file: File,
	len: u64,
}

impl FsFile for LocalFile {
	fn append(&mut self, data: &[u8]) -> Result<u64> {
		let offset = self.len;
		self.file.write_all(data)?;
		self.len += data.len() as u64;
		Ok(offset)
	}

	fn sync(&mut self) -> Result<()> {
		self.file.sync_data()?;
		Ok(())
	}

	fn len(&self) -> u64 {
		self.len
	}
}

struct LocalReader {
	file: File,
	len: u64,
}

impl FsReader for LocalReader {
	fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
		self.file.seek(SeekFrom::Start(offset))?;
		let mut buf = vec![0u8; len];
		let mut filled = 0;
		while filled < len {
			let n = self.file.read(&mut buf[filled..])?;
			if n == 0 {
				break;
			}
			filled += n;
		}
		buf.truncate(filled);
		Ok(buf)
	}

	fn len(&self) -> u64 {
		self.len
	}
}

impl Filesystem for LocalFs {
	fn mkdirs(&self, path: &str) -> Result<()> {
		fs::create_dir_all(self.resolve(path))?;
		Ok(())
	}

	fn exists(&self, path: &str) -> Result<bool> {
		Ok(self.resolve(path).exists())
	}

	fn length(&self, path: &str) -> Result<u64> {
		let target = self.resolve(path);
		let meta = fs::metadata(&target).map_err(|_| Self::not_found(&target))?;
		Ok(meta.len())
	}

	fn readdir(&self, path: &str) -> Result<Vec<String>> {
		let target = self.resolve(path);
		let mut names = Vec::new();
		for entry in fs::read_dir(&target).map_err(|_| Self::not_found(&target))? {
			names.push(entry?.file_name().to_string_lossy().into_owned());
		}
		names.sort();
		Ok(names)
	}

	fn remove(&self, path: &str) -> Result<()> {
		fs::remove_file(self.resolve(path))?;
		Ok(())
	}

	fn rmdir(&self, path: &str) -> Result<()> {
		let target = self.resolve(path);
		if target.exists() {
			fs::remove_dir_all(target)?;
		}
		Ok(())
	}

	fn rename(&self, from: &str, to: &str) -> Result<()> {
		fs::rename(self.resolve(from), self.resolve(to))?;
		Ok(())
	}

	fn create(&self, path: &str) -> Result<Box<dyn FsFile>> {
		let target = self.resolve(path);
		if let Some(parent) = target.parent() {
			fs::create_dir_all(parent)?;
		}
		let file = OpenOptions::new().create(true).write(true).truncate(true).open(target)?;
		Ok(Box::new(LocalFile { file, len: 0 }))
	}

	fn open_append(&self, path: &str) -> Result<Box<dyn FsFile>> {
		let target = self.resolve(path);
		let file = OpenOptions::new().append(true).open(&target).map_err(|_| Self::not_found(&target))?;
		let len = file.metadata()?.len();
		Ok(Box::new(LocalFile { file, len }))
	}

	fn open(&self, path: &str) -> Result<Box<dyn FsReader>> {
		let target = self.resolve(path);
		let file = File::open(&target).map_err(|_| Self::not_found(&target))?;
		let len = file.metadata()?.len();
		Ok(Box::new(LocalReader { file, len }))
	}
}
