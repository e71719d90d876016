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

//! Component C: the copy and cat volume writer/reader.

use crate::config::CompressionPolicy;
use crate::identity::Identify;
use crate::model::{to_base36, Compressor, Stream};
use crate::stream::{CountingWriter, StreamReader, StreamWriter};
use crate::Error;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

/// Extensions already compressed well enough that gzip can't shrink them
/// further; `ratio` treats these (and anything under a `.git/objects/`
/// directory) as incompressible.
const PACKED_EXTENSIONS: &[&str] = &[
    // audio/video
    "mp3", "mp4", "mkv", "avi", "mov", "flac", "ogg", "webm", "m4a", "aac",
    // image
    "jpg", "jpeg", "png", "gif", "webp", "heic", "avif",
    // archive
    "zip", "gz", "bz2", "xz", "7z", "rar", "zst", "tgz",
    // office (zip-based containers)
    "docx", "xlsx", "pptx", "odt", "ods", "odp",
];

/// The expected post-compression/original-size ratio for a path, per
/// spec.md §4.C: 1.05 (slightly larger) for paths that already look packed,
/// 0.5 otherwise.
pub fn ratio(path: &str) -> f64 {
    let lower = path.to_lowercase();

    let is_packed_ext = Path::new(&lower)
        .extension()
        .map(|ext| PACKED_EXTENSIONS.contains(&ext.to_string_lossy().as_ref()))
        .unwrap_or(false);

    let is_git_object = lower.contains(".git/objects/");

    if is_packed_ext || is_git_object {
        1.05
    } else {
        0.5
    }
}

/// `size * ratio(path)`, the estimated compressed size used both by the
/// `compressible?` heuristic and by the backup planner's cat/copy split.
pub fn compressed_size_estimate(size: u64, path: &str) -> f64 {
    size as f64 * ratio(path)
}

/// The `compressible?` heuristic: true iff gzip is expected to shrink
/// `path`'s `size` bytes past its own minimum overhead (18 bytes of gzip
/// framing plus the stream name and a NUL).
pub fn compressible(size: u64, path: &str) -> bool {
    let name_len = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().len())
        .unwrap_or(0);

    compressed_size_estimate(size, path) + 18.0 + (name_len + 1) as f64 < size as f64
}

/// Resolves a [`CompressionPolicy`] against one candidate file into a
/// concrete per-stream compressor choice.
pub fn choose_compressor(policy: CompressionPolicy, size: u64, path: &str) -> Option<Compressor> {
    match policy {
        CompressionPolicy::Enforce => Some(Compressor::Gzip),
        CompressionPolicy::Disable => None,
        CompressionPolicy::Auto => {
            if compressible(size, path) {
                Some(Compressor::Gzip)
            } else {
                None
            }
        }
    }
}

fn random_token(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let n: u8 = rng.gen_range(0..36);
            to_base36(n as u64).chars().next().unwrap()
        })
        .collect()
}

/// A base-36, time-derived volume identifier. Cat callers append `.cat`.
fn new_volume_token() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;

    format!("{}{}", to_base36(millis), random_token(4))
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VolumeKind {
    Copy,
    Cat,
}

/// Which on-disk artifact a [`Stream`] was assigned within a [`Volume`], as
/// returned by [`Volume::open_writer`] before the bytes are actually copied.
pub enum StreamTarget {
    Copy { name: String },
    Cat,
}

/// The outcome of fully writing one stream's bytes: its checksum, the number
/// of bytes that actually reached disk, and (for cat volumes) the offset it
/// started at.
pub struct FinishedWrite {
    pub sha1: String,
    pub size: u64,
    pub offset: u64,
}

/// A persistent container of file bytes for one backup session: either a
/// directory of per-file "copy" streams or a single concatenated "cat" file.
#[derive(Debug)]
pub struct Volume {
    pub id: String,
    pub kind: VolumeKind,
    pub new: bool,
    pub modified: bool,
    streams: Vec<Stream>,
    cat_file: Option<File>,
    next_offset: u64,
}

impl Volume {
    pub fn new_copy() -> Self {
        Self {
            id: new_volume_token(),
            kind: VolumeKind::Copy,
            new: true,
            modified: false,
            streams: Vec::new(),
            cat_file: None,
            next_offset: 0,
        }
    }

    pub fn new_cat() -> Self {
        Self {
            id: format!("{}.cat", new_volume_token()),
            kind: VolumeKind::Cat,
            new: true,
            modified: false,
            streams: Vec::new(),
            cat_file: None,
            next_offset: 0,
        }
    }

    /// Reconstructs a read-only [`Volume`] handle for one already referenced
    /// by a loaded manifest. Per spec.md §4.D, `upload!` always marks loaded
    /// volumes `new = false`.
    pub fn loaded(id: String, kind: VolumeKind) -> Self {
        Self {
            id,
            kind,
            new: false,
            modified: false,
            streams: Vec::new(),
            cat_file: None,
            next_offset: 0,
        }
    }

    pub fn streams(&self) -> &[Stream] {
        &self.streams
    }

    fn path(&self, repo_root: &Path) -> PathBuf {
        repo_root.join(&self.id)
    }

    fn copy_target_name(&self, source_id: &str, rel_path: &str, obfuscate: bool) -> String {
        if !obfuscate {
            return format!("{source_id}/{rel_path}");
        }

        loop {
            let token = random_token(10);
            let candidate = format!("{}/{}", &token[..2], &token[2..]);

            let taken = self.streams.iter().any(
                |s| matches!(s, Stream::Copy { name, .. } if name == &candidate),
            );

            if !taken {
                return candidate;
            }
        }
    }

    fn disk_path(volume_dir: &Path, name: &str, compressor: Option<Compressor>) -> PathBuf {
        let mut path = volume_dir.join(name);

        if compressor == Some(Compressor::Gzip) {
            let mut os = path.into_os_string();
            os.push(".gz");
            path = os.into();
        }

        path
    }

    /// Opens a writer for one file's bytes. For a copy volume this creates a
    /// brand-new stream file (erroring if it already exists); for a cat
    /// volume this appends to the (lazily opened) shared file.
    ///
    /// `dry_run` routes the bytes to [`io::sink`] instead of touching disk,
    /// while still computing the checksum the caller would have gotten —
    /// this is how the engine honors spec.md §7's dry-run contract for
    /// every filesystem mutation, not just `store!`/`rollback!`.
    pub fn open_writer<'v>(
        &'v mut self,
        repo_root: &Path,
        source_id: &str,
        rel_path: &str,
        compressor: Option<Compressor>,
        obfuscate: bool,
        dry_run: bool,
    ) -> Result<(VolumeWriter<'v>, StreamTarget), Error> {
        if !self.new {
            return Err(Error::ReadOnlyVolume(self.id.clone()));
        }

        // A brand-new volume's on-disk artifact must not already exist; if
        // it does, the id was reused (or the repository is in a state this
        // session didn't produce) and writing into it would silently merge
        // with whatever is already there.
        if !dry_run && self.streams.is_empty() && self.path(repo_root).exists() {
            return Err(Error::VolumeExists(self.path(repo_root).display().to_string()));
        }

        self.modified = true;

        match self.kind {
            VolumeKind::Copy => {
                let name = self.copy_target_name(source_id, rel_path, obfuscate);

                let sink: Box<dyn Write + 'v> = if dry_run {
                    Box::new(io::sink())
                } else {
                    let path = Self::disk_path(&self.path(repo_root), &name, compressor);

                    if path.exists() {
                        return Err(Error::StreamExists(path.display().to_string()));
                    }
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)?;
                    }

                    Box::new(File::create(&path)?)
                };

                let writer = VolumeWriter {
                    inner: StreamWriter::new(CountingWriter::new(sink), compressor),
                    offset: 0,
                };

                Ok((writer, StreamTarget::Copy { name }))
            }
            VolumeKind::Cat => {
                let offset = self.next_offset;

                let sink: Box<dyn Write + 'v> = if dry_run {
                    Box::new(io::sink())
                } else {
                    if self.cat_file.is_none() {
                        self.cat_file = Some(
                            OpenOptions::new()
                                .create(true)
                                .append(true)
                                .open(self.path(repo_root))?,
                        );
                    }

                    Box::new(self.cat_file.as_mut().expect("just opened above"))
                };

                let writer = VolumeWriter {
                    inner: StreamWriter::new(CountingWriter::new(sink), compressor),
                    offset,
                };

                Ok((writer, StreamTarget::Cat))
            }
        }
    }

    /// Folds a completed write back into the volume's stream list, advancing
    /// the cat offset bookkeeping, and returns the [`Stream`] the engine
    /// should attach to the backed-up `File`.
    pub fn commit_stream(
        &mut self,
        target: StreamTarget,
        compressor: Option<Compressor>,
        finished: FinishedWrite,
    ) -> Stream {
        let stream = match target {
            StreamTarget::Copy { name } => Stream::Copy {
                volume: self.id.clone(),
                name,
                sha1: finished.sha1,
                compressor,
            },
            StreamTarget::Cat => {
                self.next_offset += finished.size;

                Stream::Cat {
                    volume: self.id.clone(),
                    offset: finished.offset,
                    size: finished.size,
                    sha1: finished.sha1,
                    compressor,
                }
            }
        };

        self.streams.push(stream.clone());
        stream
    }

    /// Opens a reader for an already-written [`Stream`]. Always uses its own
    /// file handle, independent of any in-progress writer.
    pub fn open_reader(&self, repo_root: &Path, stream: &Stream) -> Result<VolumeReader, Error> {
        match stream {
            Stream::Copy {
                name, compressor, ..
            } => {
                let path = Self::disk_path(&self.path(repo_root), name, *compressor);
                let file: Box<dyn Read> = Box::new(File::open(path)?);

                Ok(VolumeReader {
                    inner: StreamReader::new(file, *compressor),
                })
            }
            Stream::Cat {
                offset,
                size,
                compressor,
                ..
            } => {
                let mut file = File::open(self.path(repo_root))?;
                file.seek(SeekFrom::Start(*offset))?;

                let limited: Box<dyn Read> = Box::new(file.take(*size));

                Ok(VolumeReader {
                    inner: StreamReader::new(limited, *compressor),
                })
            }
        }
    }

    /// No-op unless modified (spec.md §4.C); closes the shared cat file
    /// handle so later opens see a fully flushed file. Honors dry-run by
    /// doing nothing at all.
    pub fn store(&mut self, dry_run: bool) -> io::Result<()> {
        if !self.modified || dry_run {
            return Ok(());
        }

        if let Some(file) = self.cat_file.take() {
            file.sync_all()?;
        }

        self.new = false;
        Ok(())
    }

    /// Deletes the on-disk artifact iff the volume was modified this
    /// session. Safe to call after a partial write; logs (but does not
    /// propagate) its own failure so the original error is what surfaces.
    pub fn rollback(&mut self, repo_root: &Path, dry_run: bool) {
        if !self.modified || dry_run {
            return;
        }

        self.cat_file.take();

        let path = self.path(repo_root);
        let result = match self.kind {
            VolumeKind::Copy => fs::remove_dir_all(&path),
            VolumeKind::Cat => fs::remove_file(&path),
        };

        if let Err(e) = result {
            eprintln!("Warning: rollback failed to remove volume {}: {e}", self.id);
        }
    }
}

impl Identify for Volume {
    fn key(&self) -> &str {
        &self.id
    }
}

/// A byte sink for one [`Stream`], composing `{hash -> optional gzip ->
/// counting sink}`. Borrows its volume's shared cat file when writing to a
/// cat volume; owns a brand-new file when writing to a copy volume.
pub struct VolumeWriter<'v> {
    inner: StreamWriter<CountingWriter<Box<dyn Write + 'v>>>,
    offset: u64,
}

impl Write for VolumeWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl VolumeWriter<'_> {
    pub fn finish(self) -> io::Result<FinishedWrite> {
        let offset = self.offset;
        let (sha1, counting) = self.inner.finish()?;

        Ok(FinishedWrite {
            sha1,
            size: counting.count(),
            offset,
        })
    }
}

/// A byte source for one [`Stream`], composing `{raw source -> optional
/// gzip -> hash}`.
pub struct VolumeReader {
    inner: StreamReader<Box<dyn Read>>,
}

impl Read for VolumeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl VolumeReader {
    pub fn digest(&self) -> String {
        self.inner.digest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Read as _;

    use tempfile::tempdir;

    #[test]
    fn ratio_treats_known_packed_extensions_as_incompressible() {
        assert_eq!(ratio("movie.mp4"), 1.05);
        assert_eq!(ratio("archive/.git/objects/ab/cdef"), 1.05);
        assert_eq!(ratio("notes.txt"), 0.5);
    }

    #[test]
    fn compressible_rejects_tiny_files() {
        assert!(!compressible(10, "tiny.txt"));
    }

    #[test]
    fn compressible_accepts_large_plain_text() {
        assert!(compressible(1_000_000, "log.txt"));
    }

    #[test]
    fn copy_volume_roundtrip() {
        let dir = tempdir().unwrap();
        let mut volume = Volume::new_copy();

        let (mut writer, target) = volume
            .open_writer(dir.path(), "src1", "a.txt", None, false, false)
            .unwrap();
        writer.write_all(b"hello").unwrap();
        let finished = writer.finish().unwrap();
        let stream = volume.commit_stream(target, None, finished);

        assert_eq!(stream.sha1().len(), 40);

        let mut reader = volume.open_reader(dir.path(), &stream).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello");
        assert_eq!(reader.digest(), stream.sha1());
    }

    #[test]
    fn copy_volume_errors_on_existing_stream_file() {
        let dir = tempdir().unwrap();
        let mut volume = Volume::new_copy();

        let (mut writer, target) = volume
            .open_writer(dir.path(), "src1", "a.txt", None, false, false)
            .unwrap();
        writer.write_all(b"hello").unwrap();
        let finished = writer.finish().unwrap();
        volume.commit_stream(target, None, finished);

        assert!(volume
            .open_writer(dir.path(), "src1", "a.txt", None, false, false)
            .is_err());
    }

    #[test]
    fn cat_volume_tracks_non_overlapping_offsets() {
        let dir = tempdir().unwrap();
        let mut volume = Volume::new_cat();

        let mut streams = Vec::new();
        for payload in ["one", "two", "three"] {
            let (mut writer, target) = volume
                .open_writer(dir.path(), "src1", payload, None, false, false)
                .unwrap();
            writer.write_all(payload.as_bytes()).unwrap();
            let finished = writer.finish().unwrap();
            streams.push(volume.commit_stream(target, None, finished));
        }

        let mut last_end = 0u64;
        for stream in &streams {
            if let Stream::Cat { offset, size, .. } = stream {
                assert!(*offset >= last_end);
                last_end = offset + size;
            } else {
                panic!("expected cat stream");
            }
        }

        for stream in &streams {
            let mut reader = volume.open_reader(dir.path(), stream).unwrap();
            let mut out = String::new();
            reader.read_to_string(&mut out).unwrap();
            assert_eq!(reader.digest(), stream.sha1());
        }
    }

    #[test]
    fn dry_run_writer_touches_no_disk() {
        let dir = tempdir().unwrap();
        let mut volume = Volume::new_copy();

        let (mut writer, target) = volume
            .open_writer(dir.path(), "src1", "a.txt", None, false, true)
            .unwrap();
        writer.write_all(b"hello").unwrap();
        let finished = writer.finish().unwrap();
        volume.commit_stream(target, None, finished);

        assert!(!dir.path().join(volume.id).exists());
    }

    #[test]
    fn rollback_removes_modified_copy_volume_directory() {
        let dir = tempdir().unwrap();
        let mut volume = Volume::new_copy();

        let (mut writer, target) = volume
            .open_writer(dir.path(), "src1", "a.txt", None, false, false)
            .unwrap();
        writer.write_all(b"hello").unwrap();
        let finished = writer.finish().unwrap();
        volume.commit_stream(target, None, finished);

        let volume_dir = dir.path().join(&volume.id);
        assert!(volume_dir.exists());

        volume.rollback(dir.path(), false);
        assert!(!volume_dir.exists());
    }

    #[test]
    fn open_writer_rejects_a_loaded_read_only_volume() {
        let dir = tempdir().unwrap();
        let mut volume = Volume::loaded("v1".into(), VolumeKind::Copy);

        let result = volume.open_writer(dir.path(), "src1", "a.txt", None, false, false);
        assert!(matches!(result, Err(Error::ReadOnlyVolume(_))));
    }

    #[test]
    fn open_writer_rejects_a_new_volume_whose_artifact_already_exists() {
        let dir = tempdir().unwrap();
        let mut volume = Volume::new_cat();
        fs::write(dir.path().join(&volume.id), b"stale leftovers").unwrap();

        let result = volume.open_writer(dir.path(), "src1", "a.txt", None, false, false);
        assert!(matches!(result, Err(Error::VolumeExists(_))));
    }
}
