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

use std::io;

use thiserror::Error;

/// A `rockup_core` error. Every fallible engine operation returns this type,
/// grouped by the kinds spec'd for the backup/restore engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Restoring into a destination that already has content in it.
    #[error("Restore destination \"{0}\" is not empty")]
    DestinationNotEmpty(String),
    /// No manifest exists in the repository yet but one was required.
    #[error("Repository \"{0}\" has no manifests")]
    EmptyRepository(String),
    /// The repository root does not exist or is not a directory.
    #[error("Repository directory \"{0}\" does not exist")]
    NoSuchRepository(String),
    /// A volume-type or compression policy string did not match a known variant.
    #[error("Invalid policy value \"{0}\"")]
    InvalidPolicy(String),

    /// A stream file the engine is about to create already exists.
    #[error("Stream target \"{0}\" already exists")]
    StreamExists(String),
    /// A volume's on-disk artifact already exists when the volume is new.
    #[error("Volume artifact \"{0}\" already exists")]
    VolumeExists(String),
    /// `store!` was called on a manifest that is not new (would overwrite history).
    #[error("Manifest \"{0}\" already exists and cannot be overwritten")]
    ManifestExists(String),

    /// The manifest's `version` field is not the one this engine understands.
    #[error("Unsupported manifest format version {0}")]
    UnsupportedVersion(u32),
    /// The manifest is missing a session identifier or it parsed empty.
    #[error("Manifest is missing a session identifier")]
    MissingSession,

    /// SHA-1 of reconstructed bytes did not match the recorded checksum.
    #[error("Integrity check failed for \"{path}\": expected {expected}, got {actual}")]
    IntegrityMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    /// Attempted to attach a second stream to a `File` that already has one.
    #[error("File \"{0}\" already has a stream attached")]
    StreamAlreadyAttached(String),
    /// Attempted to mutate a `Volume` that was loaded read-only from a manifest.
    #[error("Volume \"{0}\" was loaded read-only and cannot be written to")]
    ReadOnlyVolume(String),

    /// A `std::io::Error` I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// A `serde_json::Error` (de)serialization error occurred.
    #[error("JSON (de)serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// A `uuid::Error` parsing error occurred.
    #[error("UUID parsing error: {0}")]
    Uuid(#[from] uuid::Error),
    /// A `walkdir::Error` directory-traversal error occurred.
    #[error("Directory traversal error: {0}")]
    WalkDir(#[from] walkdir::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
