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

//! Component A: walks a source root and reconciles it against the `File`
//! table remembered from the previous snapshot.

use crate::model::{truncate_to_secs, FileEntry, Source};

use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use chrono::{DateTime, Utc};
use walkdir::WalkDir;

/// Raw per-file stat gathered during a scan, before it is folded into a
/// [`FileEntry`].
#[derive(Clone, Copy, Debug)]
pub struct RawStat {
    pub mtime: DateTime<Utc>,
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

impl RawStat {
    fn from_metadata(meta: &Metadata) -> Self {
        let mtime = meta
            .modified()
            .ok()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(Utc::now);

        Self {
            mtime: truncate_to_secs(mtime),
            size: meta.len(),
            mode: meta.mode() & 0o7777,
            uid: meta.uid(),
            gid: meta.gid(),
        }
    }
}

/// Visits every regular file reachable from `root`, invoking `callback` with
/// its path relative to `root` and a [`RawStat`].
///
/// Descent order follows `walkdir`'s directory order, which is deterministic
/// per scan. Symlinks are followed only if they resolve to regular files;
/// broken links and anything else `walkdir` can't stat are logged and
/// skipped rather than aborting the walk (spec.md §4.A).
pub fn scan<F: FnMut(String, RawStat)>(root: &Path, mut callback: F) {
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                eprintln!("Warning: skipping unreadable path during scan: {e}");
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let relative = match entry.path().strip_prefix(root) {
            Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
            Err(_) => continue,
        };

        let metadata = match entry.metadata() {
            Ok(meta) => meta,
            Err(e) => {
                eprintln!("Warning: skipping {}: {e}", entry.path().display());
                continue;
            }
        };

        callback(relative, RawStat::from_metadata(&metadata));
    }
}

/// Runs the incremental diff algorithm of spec.md §4.A against `source`:
/// marks every known file not-live, rescans the root, creates/refreshes/
/// keeps entries as appropriate, then drops whatever is left not-live.
///
/// Returns whether anything changed (new, modified or deleted files).
pub fn update(source: &mut Source) -> bool {
    for file in source.files.iter_mut() {
        file.live = false;
    }

    let mut modified = false;
    let root = source.root.clone();

    // Collect before mutating `source.files` — the callback would otherwise
    // borrow `source` while the outer loop also wants to borrow it.
    let mut seen = Vec::new();
    scan(&root, |path, stat| seen.push((path, stat)));

    for (path, stat) in seen {
        match source.files.get_mut(&path) {
            None => {
                let mut entry =
                    FileEntry::new(path, stat.mtime, stat.size, stat.mode, stat.uid, stat.gid);
                entry.live = true;
                source.files.replace(entry);
                modified = true;
            }
            Some(existing) => {
                if stat.mtime > existing.mtime {
                    let mut entry = FileEntry::new(
                        path, stat.mtime, stat.size, stat.mode, stat.uid, stat.gid,
                    );
                    entry.live = true;
                    source.files.replace(entry);
                    modified = true;
                } else {
                    existing.live = true;

                    if existing.mode != stat.mode
                        || existing.uid != stat.uid
                        || existing.gid != stat.gid
                    {
                        existing.mode = stat.mode;
                        existing.uid = stat.uid;
                        existing.gid = stat.gid;
                        modified = true;
                    }
                }
            }
        }
    }

    let gone: Vec<String> = source
        .files
        .iter()
        .filter(|f| !f.live)
        .map(|f| f.path.clone())
        .collect();

    for path in gone {
        source.files.remove(&path);
        modified = true;
    }

    modified
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs::{self, File};
    use std::time::{Duration, SystemTime};

    use tempfile::tempdir;

    #[test]
    fn update_discovers_new_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();

        let mut source = Source::new(dir.path().to_path_buf());
        let modified = update(&mut source);

        assert!(modified);
        assert_eq!(source.files.len(), 1);
        assert!(source.files.get("a.txt").is_some());
    }

    #[test]
    fn update_is_idempotent_with_no_filesystem_change() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();

        let mut source = Source::new(dir.path().to_path_buf());
        assert!(update(&mut source));
        assert!(!update(&mut source));
    }

    #[test]
    fn update_detects_deleted_files() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, b"hello").unwrap();

        let mut source = Source::new(dir.path().to_path_buf());
        update(&mut source);

        fs::remove_file(&file).unwrap();
        let modified = update(&mut source);

        assert!(modified);
        assert!(source.files.is_empty());
    }

    #[test]
    fn update_detects_mtime_bump_as_modification() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, b"hello").unwrap();

        let mut source = Source::new(dir.path().to_path_buf());
        update(&mut source);

        let newer = SystemTime::now() + Duration::from_secs(120);
        File::options()
            .write(true)
            .open(&file)
            .unwrap()
            .set_modified(newer)
            .unwrap();

        assert!(update(&mut source));
    }
}
