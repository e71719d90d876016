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

//! Component D: the gzip-compressed JSON manifest persisted at the end of
//! every backup session and consulted at the start of the next one.

use crate::identity::Identify;
use crate::model::{to_base36, Compressor, Stream};
use crate::Error;

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The only manifest format version this engine understands.
pub const FORMAT_VERSION: u32 = 0;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind")]
enum StreamRecord {
    Copy {
        volume: String,
        name: String,
        sha1: String,
        compressed: bool,
    },
    Cat {
        volume: String,
        offset: u64,
        size: u64,
        sha1: String,
        compressed: bool,
    },
}

impl From<&Stream> for StreamRecord {
    fn from(s: &Stream) -> Self {
        match s {
            Stream::Copy {
                volume,
                name,
                sha1,
                compressor,
            } => StreamRecord::Copy {
                volume: volume.clone(),
                name: name.clone(),
                sha1: sha1.clone(),
                compressed: compressor.is_some(),
            },
            Stream::Cat {
                volume,
                offset,
                size,
                sha1,
                compressor,
            } => StreamRecord::Cat {
                volume: volume.clone(),
                offset: *offset,
                size: *size,
                sha1: sha1.clone(),
                compressed: compressor.is_some(),
            },
        }
    }
}

impl From<StreamRecord> for Stream {
    fn from(r: StreamRecord) -> Self {
        let compressor = |compressed: bool| compressed.then_some(Compressor::Gzip);

        match r {
            StreamRecord::Copy {
                volume,
                name,
                sha1,
                compressed,
            } => Stream::Copy {
                volume,
                name,
                sha1,
                compressor: compressor(compressed),
            },
            StreamRecord::Cat {
                volume,
                offset,
                size,
                sha1,
                compressed,
            } => Stream::Cat {
                volume,
                offset,
                size,
                sha1,
                compressor: compressor(compressed),
            },
        }
    }
}

fn is_zero(size: &u64) -> bool {
    *size == 0
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
struct FileRecord {
    mtime: DateTime<Utc>,
    mode: u32,
    uid: u32,
    gid: u32,
    #[serde(default, skip_serializing_if = "is_zero")]
    size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<StreamRecord>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
struct SourceRecord {
    root: String,
    files: BTreeMap<String, FileRecord>,
}

/// The on-disk JSON shape of a manifest, in the field order spec.md §6
/// declares them.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
struct ManifestDocument {
    version: u32,
    session: Uuid,
    mtime: DateTime<Utc>,
    sources: BTreeMap<String, SourceRecord>,
}

/// A loaded or in-progress snapshot of every [`crate::model::Source`] backed
/// up in one session.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub id: String,
    pub new: bool,
    document: ManifestDocument,
}

impl Manifest {
    /// Begins a brand-new manifest for the session identified by `session`.
    pub fn new(session: Uuid) -> Self {
        let epoch_seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        let centiseconds = (epoch_seconds * 100.0).floor() as u64;

        Self {
            id: to_base36(centiseconds),
            new: true,
            document: ManifestDocument {
                version: FORMAT_VERSION,
                session,
                mtime: Utc::now(),
                sources: BTreeMap::new(),
            },
        }
    }

    pub fn session(&self) -> Uuid {
        self.document.session
    }

    /// Records one source's file table into this manifest, replacing
    /// whatever was recorded for that source id previously.
    pub fn record_source(&mut self, source: &crate::model::Source) {
        let files = source
            .files
            .iter()
            .map(|f| {
                (
                    f.path.clone(),
                    FileRecord {
                        mtime: f.mtime,
                        mode: f.mode,
                        uid: f.uid,
                        gid: f.gid,
                        size: f.size,
                        sha1: f.sha1.clone(),
                        stream: f.stream.as_ref().map(StreamRecord::from),
                    },
                )
            })
            .collect();

        self.document.sources.insert(
            source.id.clone(),
            SourceRecord {
                root: source.root.to_string_lossy().into_owned(),
                files,
            },
        );
    }

    /// Reconstructs every [`crate::model::Source`] this manifest recorded,
    /// in the form [`crate::engine::restore`] needs to recreate them on disk.
    pub fn sources(&self) -> Vec<crate::model::Source> {
        self.document
            .sources
            .iter()
            .map(|(id, record)| {
                let mut files = crate::identity::Identity::new();

                for (path, file_record) in &record.files {
                    let mut entry = crate::model::FileEntry::new(
                        path.clone(),
                        file_record.mtime,
                        file_record.size,
                        file_record.mode,
                        file_record.uid,
                        file_record.gid,
                    );
                    entry.sha1 = file_record.sha1.clone();
                    entry.stream = file_record.stream.clone().map(Stream::from);
                    files.replace(entry);
                }

                crate::model::Source {
                    id: id.clone(),
                    root: Path::new(&record.root).to_path_buf(),
                    files,
                }
            })
            .collect()
    }

    pub(crate) fn path(repo_root: &Path, id: &str) -> std::path::PathBuf {
        repo_root.join(format!("{id}.json.gz"))
    }

    /// Finds the manifest with the numerically greatest base-36 id in
    /// `repo_root`, per spec.md's "most recent manifest is the base for an
    /// incremental backup" rule.
    pub fn latest_id(repo_root: &Path) -> Result<Option<String>, Error> {
        let mut ids: Vec<String> = Vec::new();

        if repo_root.is_dir() {
            for entry in fs::read_dir(repo_root)? {
                let entry = entry?;
                let name = entry.file_name();
                let name = name.to_string_lossy();

                if let Some(id) = name.strip_suffix(".json.gz") {
                    ids.push(id.to_string());
                }
            }
        }

        ids.sort_by_key(|id| u64::from_str_radix(id, 36).unwrap_or(0));
        Ok(ids.into_iter().next_back())
    }

    /// Loads and parses the manifest `id` from `repo_root`. This is
    /// `upload!` in spec.md §4.D terms: the returned manifest is marked
    /// `new = false`.
    pub fn load(repo_root: &Path, id: &str) -> Result<Self, Error> {
        let file = File::open(Self::path(repo_root, id))?;
        let decoder = GzDecoder::new(file);
        let document: ManifestDocument = serde_json::from_reader(decoder)?;

        if document.version != FORMAT_VERSION {
            return Err(Error::UnsupportedVersion(document.version));
        }
        if document.session.is_nil() {
            return Err(Error::MissingSession);
        }

        Ok(Self {
            id: id.to_string(),
            new: false,
            document,
        })
    }

    /// Writes this manifest to `repo_root` as gzip-compressed pretty JSON.
    /// Refuses to overwrite an existing manifest, honors dry-run by writing
    /// to [`io::sink`] instead of disk.
    pub fn store(&mut self, repo_root: &Path, dry_run: bool) -> Result<(), Error> {
        if dry_run {
            self.new = false;
            return Ok(());
        }

        let path = Self::path(repo_root, &self.id);
        if path.exists() {
            return Err(Error::ManifestExists(self.id.clone()));
        }

        fs::create_dir_all(repo_root)?;

        let file = File::create(&path)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        serde_json::to_writer_pretty(&mut encoder, &self.document)?;
        encoder.finish()?;

        self.new = false;
        Ok(())
    }

    /// Deletes this manifest's on-disk artifact if it was newly written this
    /// session. Logs (never propagates) its own failure, per spec.md §4.E
    /// step 8's rollback contract.
    pub fn rollback(&self, repo_root: &Path, dry_run: bool) {
        if !self.new || dry_run {
            return;
        }

        let path = Self::path(repo_root, &self.id);
        if path.exists() {
            if let Err(e) = fs::remove_file(&path) {
                eprintln!("Warning: rollback failed to remove manifest {}: {e}", self.id);
            }
        }
    }
}

impl Identify for Manifest {
    fn key(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::model::{FileEntry, Source};

    use tempfile::tempdir;

    fn sample_source() -> Source {
        let mut source = Source::new(Path::new("/data/photos").to_path_buf());
        let mut file = FileEntry::new("a.txt".into(), Utc::now(), 5, 0o644, 1000, 1000);
        file.attach_stream(
            "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d".into(),
            Stream::Copy {
                volume: "v1".into(),
                name: "src/a.txt".into(),
                sha1: "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d".into(),
                compressor: None,
            },
        )
        .unwrap();
        source.files.replace(file);
        source
    }

    #[test]
    fn load_rejects_a_manifest_with_a_nil_session() {
        let dir = tempdir().unwrap();
        let mut manifest = Manifest::new(Uuid::nil());
        manifest.record_source(&sample_source());
        manifest.store(dir.path(), false).unwrap();

        assert!(matches!(
            Manifest::load(dir.path(), &manifest.id),
            Err(Error::MissingSession)
        ));
    }

    #[test]
    fn zero_byte_file_omits_size_sha1_and_stream() {
        let dir = tempdir().unwrap();
        let mut source = Source::new(Path::new("/data/photos").to_path_buf());
        source
            .files
            .replace(FileEntry::new("empty.bin".into(), Utc::now(), 0, 0o644, 0, 0));

        let mut manifest = Manifest::new(Uuid::new_v4());
        manifest.record_source(&source);
        manifest.store(dir.path(), false).unwrap();

        let loaded = Manifest::load(dir.path(), &manifest.id).unwrap();
        let sources = loaded.sources();
        let file = sources[0].files.get("empty.bin").unwrap();
        assert_eq!(file.size, 0);
        assert!(file.sha1.is_none());
        assert!(file.stream.is_none());
    }

    #[test]
    fn store_then_load_round_trips_sources() {
        let dir = tempdir().unwrap();
        let source = sample_source();

        let mut manifest = Manifest::new(Uuid::new_v4());
        manifest.record_source(&source);
        manifest.store(dir.path(), false).unwrap();
        assert!(!manifest.new);

        let loaded = Manifest::load(dir.path(), &manifest.id).unwrap();
        let sources = loaded.sources();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].files.get("a.txt").unwrap().sha1.as_deref(), Some("aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"));
    }

    #[test]
    fn store_refuses_to_overwrite_existing_manifest() {
        let dir = tempdir().unwrap();
        let mut manifest = Manifest::new(Uuid::new_v4());
        manifest.record_source(&sample_source());
        manifest.store(dir.path(), false).unwrap();

        let mut again = Manifest {
            id: manifest.id.clone(),
            new: true,
            document: manifest.document.clone(),
        };
        assert!(again.store(dir.path(), false).is_err());
    }

    #[test]
    fn dry_run_store_writes_nothing_to_disk() {
        let dir = tempdir().unwrap();
        let mut manifest = Manifest::new(Uuid::new_v4());
        manifest.record_source(&sample_source());
        manifest.store(dir.path(), true).unwrap();

        assert!(fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn latest_id_picks_the_numerically_greatest_manifest() {
        let dir = tempdir().unwrap();
        for id in ["5", "z", "10"] {
            File::create(dir.path().join(format!("{id}.json.gz"))).unwrap();
        }

        // Base-36 values: "5" = 5, "z" = 35, "10" = 36 — "10" is numerically
        // greatest even though "z" sorts later lexicographically.
        assert_eq!(Manifest::latest_id(dir.path()).unwrap(), Some("10".to_string()));
    }

    #[test]
    fn rollback_removes_new_manifest_only() {
        let dir = tempdir().unwrap();
        let mut manifest = Manifest::new(Uuid::new_v4());
        manifest.record_source(&sample_source());
        manifest.store(dir.path(), false).unwrap();

        let stale = Manifest {
            id: manifest.id.clone(),
            new: true,
            document: manifest.document.clone(),
        };
        stale.rollback(dir.path(), false);

        assert!(!Manifest::path(dir.path(), &manifest.id).exists());
    }
}
