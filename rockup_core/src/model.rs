// rockup_core is the core incremental backup/restore engine of Rockup.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! The data model shared by every component: [`Source`], [`FileEntry`] and
//! [`Stream`], plus the base-36 identifier scheme used for sources, volumes
//! and manifests.
//!
//! Cyclic references (`Project` <-> `Source` <-> `FileEntry` <-> `Stream` <->
//! `Volume`) are broken the way spec.md's design notes ask: every reference
//! across that boundary is a plain `String` id, resolved back through a
//! [`crate::project::Project`]'s registries at use sites, never a pointer.

use crate::identity::Identify;
use crate::Error;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Renders `n` as a lowercase base-36 string with no leading zeroes (`"0"` for zero).
pub fn to_base36(mut n: u64) -> String {
    if n == 0 {
        return "0".to_string();
    }

    let mut digits = Vec::new();
    while n > 0 {
        digits.push(BASE36[(n % 36) as usize]);
        n /= 36;
    }
    digits.reverse();

    String::from_utf8(digits).expect("BASE36 alphabet is plain ASCII")
}

/// FNV-1a, 32-bit. Chosen over [`std::collections::hash_map::DefaultHasher`]
/// because spec.md requires a `Source` id that is stable across runs and
/// Rust toolchain versions; `DefaultHasher`'s algorithm is unspecified.
fn fnv1a32(bytes: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c9dc5;
    const PRIME: u32 = 0x0100_0193;

    bytes
        .iter()
        .fold(OFFSET_BASIS, |hash, &b| (hash ^ b as u32).wrapping_mul(PRIME))
}

/// The stable id of a [`Source`] rooted at `root`: a 32-bit hash of the
/// absolute root path, rendered in base 36 so the same root reuses the same
/// id across snapshots.
pub fn source_id(root: &Path) -> String {
    to_base36(fnv1a32(root.to_string_lossy().as_bytes()) as u64)
}

/// Truncates a timestamp to whole-second granularity, tolerating filesystems
/// with coarser mtime resolution than the engine's own comparisons.
pub fn truncate_to_secs(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(t.timestamp(), 0).unwrap_or(t)
}

/// The compressor a [`Stream`] was written through, if any.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Compressor {
    Gzip,
}

/// A named slice of volume storage carrying one [`FileEntry`]'s bytes.
///
/// Mirrors spec.md's §3 `Stream` entity: a copy stream is addressed by name
/// inside its volume's directory, a cat stream by its byte range inside the
/// shared `.cat` file. Both carry the SHA-1 of the *uncompressed* bytes and
/// an optional compressor.
#[derive(Clone, Debug, PartialEq)]
pub enum Stream {
    Copy {
        volume: String,
        name: String,
        sha1: String,
        compressor: Option<Compressor>,
    },
    Cat {
        volume: String,
        offset: u64,
        size: u64,
        sha1: String,
        compressor: Option<Compressor>,
    },
}

impl Stream {
    pub fn volume(&self) -> &str {
        match self {
            Self::Copy { volume, .. } | Self::Cat { volume, .. } => volume,
        }
    }

    pub fn sha1(&self) -> &str {
        match self {
            Self::Copy { sha1, .. } | Self::Cat { sha1, .. } => sha1,
        }
    }

    pub fn compressor(&self) -> Option<Compressor> {
        match self {
            Self::Copy { compressor, .. } | Self::Cat { compressor, .. } => *compressor,
        }
    }
}

/// One file tracked inside a [`Source`], identified by its relative path.
///
/// Two `FileEntry`s with equal `path` are the same entity across snapshots;
/// the SHA-1 and [`Stream`] reference survive as long as the on-disk file's
/// mtime (truncated to whole seconds) does not advance, per spec.md §4.A.
#[derive(Clone, Debug, PartialEq)]
pub struct FileEntry {
    pub path: String,
    pub mtime: DateTime<Utc>,
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub sha1: Option<String>,
    pub stream: Option<Stream>,
    /// Scan-local marker, never serialized: true while the file is known to
    /// still exist on disk during an in-progress [`crate::scanner::update`].
    pub(crate) live: bool,
}

impl FileEntry {
    pub fn new(path: String, mtime: DateTime<Utc>, size: u64, mode: u32, uid: u32, gid: u32) -> Self {
        Self {
            path,
            mtime: truncate_to_secs(mtime),
            size,
            mode,
            uid,
            gid,
            sha1: None,
            stream: None,
            live: true,
        }
    }

    /// Attaches `stream` to this file. Fatal programming error if one is
    /// already attached — a `File` has at most one `Stream` (spec.md §3).
    pub fn attach_stream(&mut self, sha1: String, stream: Stream) -> Result<(), Error> {
        if self.stream.is_some() {
            return Err(Error::StreamAlreadyAttached(self.path.clone()));
        }

        self.sha1 = Some(sha1);
        self.stream = Some(stream);
        Ok(())
    }

    pub fn needs_backup(&self) -> bool {
        self.stream.is_none() && self.size > 0
    }
}

impl Identify for FileEntry {
    fn key(&self) -> &str {
        &self.path
    }
}

/// A scanned source root and the [`FileEntry`] table reconstructed/maintained
/// for it across snapshots.
#[derive(Debug)]
pub struct Source {
    pub id: String,
    pub root: PathBuf,
    pub files: crate::identity::Identity<FileEntry>,
}

impl Source {
    pub fn new(root: PathBuf) -> Self {
        let id = source_id(&root);
        Self {
            id,
            root,
            files: crate::identity::Identity::new(),
        }
    }
}

impl Identify for Source {
    fn key(&self) -> &str {
        &self.id
    }
}
