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

//! Component E: the backup and restore orchestrator. Ties the scanner,
//! volumes and manifest together into the two operations the `rockup`
//! binary exposes.

use crate::config::VolumePolicy;
use crate::manifest::Manifest;
use crate::model::{FileEntry, Source};
use crate::project::Project;
use crate::scanner;
use crate::volume::{self, Volume, VolumeKind};
use crate::Error;

use std::fs::{self, File};
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use uuid::Uuid;

/// A candidate's estimated compressed size must stay under this to keep
/// accumulating into the cat bucket (spec.md §4.E step 4).
const CAT_FILE_SIZE_CAP: f64 = 1024.0 * 1024.0;

/// The cat bucket's running total of estimated compressed size must stay
/// under this (spec.md §4.E step 4) — a session opens at most one cat
/// volume, so once this is crossed the remaining candidates, sorted
/// ascending by size, can only grow the bucket further and are routed to
/// the copy volume instead.
const CAT_VOLUME_SIZE_CAP: f64 = 1024.0 * 1024.0 * 1024.0;

struct Candidate {
    source_index: usize,
    path: String,
    size: u64,
}

/// Implements spec.md §4.E step 4 verbatim: sort candidates ascending by
/// `compressed_size = size * ratio(path)`, accumulate into the cat bucket
/// while the running total stays under 1 GiB and the current candidate's
/// estimate stays under 1 MiB; the first candidate to fail either condition,
/// and everything after it in sorted order, goes to the copy bucket. A
/// cat bucket left with exactly one file is demoted to copy entirely,
/// since a lone stream gains nothing from cat's coalescing.
fn plan_buckets(sources: &[Source], policy: VolumePolicy) -> (Vec<Candidate>, Vec<Candidate>) {
    let mut candidates: Vec<Candidate> = Vec::new();

    for (source_index, source) in sources.iter().enumerate() {
        for file in source.files.iter() {
            if !file.needs_backup() {
                continue;
            }

            candidates.push(Candidate {
                source_index,
                path: file.path.clone(),
                size: file.size,
            });
        }
    }

    match policy {
        VolumePolicy::Cat => (candidates, Vec::new()),
        VolumePolicy::Copy => (Vec::new(), candidates),
        VolumePolicy::Auto => {
            candidates.sort_by(|a, b| {
                let ea = volume::compressed_size_estimate(a.size, &a.path);
                let eb = volume::compressed_size_estimate(b.size, &b.path);
                ea.partial_cmp(&eb).unwrap_or(std::cmp::Ordering::Equal)
            });

            let mut cat_bucket = Vec::new();
            let mut copy_bucket = Vec::new();
            let mut cumulative = 0.0;
            let mut spilled = false;

            for candidate in candidates {
                let estimate = volume::compressed_size_estimate(candidate.size, &candidate.path);

                if !spilled && cumulative + estimate < CAT_VOLUME_SIZE_CAP && estimate < CAT_FILE_SIZE_CAP {
                    cumulative += estimate;
                    cat_bucket.push(candidate);
                } else {
                    spilled = true;
                    copy_bucket.push(candidate);
                }
            }

            if cat_bucket.len() == 1 {
                copy_bucket.push(cat_bucket.pop().expect("just checked len == 1"));
            }

            (cat_bucket, copy_bucket)
        }
    }
}

fn backup_one(
    project: &mut Project,
    source_index: usize,
    path: &str,
    sources: &mut [Source],
    volume_id: &str,
) -> Result<(), Error> {
    let source = &sources[source_index];
    let full_path = source.root.join(path);
    let compressor = volume::choose_compressor(
        project.config.compression_policy,
        sources[source_index]
            .files
            .get(path)
            .map(|f| f.size)
            .unwrap_or(0),
        path,
    );

    let volume = project
        .volumes
        .get_mut(volume_id)
        .expect("volume was created before planning its streams");

    let mut input = File::open(&full_path)?;

    let (mut writer, target) = volume.open_writer(
        &project.root,
        &source.id,
        path,
        compressor,
        project.config.obfuscate,
        project.config.dry_run,
    )?;

    io_copy(&mut input, &mut writer)?;
    let finished = writer.finish()?;
    let stream = volume.commit_stream(target, compressor, finished);

    let sha1 = stream.sha1().to_string();
    let entry = sources[source_index]
        .files
        .get_mut(path)
        .expect("candidate path came from this source's file table");
    entry.attach_stream(sha1, stream)?;

    Ok(())
}

fn io_copy<R: Read, W: Write>(reader: &mut R, writer: &mut W) -> Result<u64, Error> {
    std::io::copy(reader, writer).map_err(Error::from)
}

fn rollback_all(project: &mut Project, manifest: Option<&Manifest>) {
    for volume in project.volumes.iter_mut() {
        volume.rollback(&project.root, project.config.dry_run);
    }
    if let Some(manifest) = manifest {
        manifest.rollback(&project.root, project.config.dry_run);
    }
}

/// Scans `source_roots`, backs up every file that needs it against the
/// repository's most recent manifest (unless `full` forces a clean slate),
/// and returns the id of the manifest written for this session.
pub fn backup(project: &mut Project, source_roots: &[PathBuf], full: bool) -> Result<String, Error> {
    let base_sources = if full {
        Vec::new()
    } else {
        match Manifest::latest_id(&project.root)? {
            Some(id) => Manifest::load(&project.root, &id)?.sources(),
            None => Vec::new(),
        }
    };

    let mut sources: Vec<Source> = source_roots
        .iter()
        .map(|root| {
            let id = crate::model::source_id(root);
            base_sources
                .iter()
                .find(|s| s.id == id)
                .cloned_into_fresh(root.clone())
                .unwrap_or_else(|| Source::new(root.clone()))
        })
        .collect();

    for source in sources.iter_mut() {
        scanner::update(source);
    }

    let (cat_bucket, copy_bucket) = plan_buckets(&sources, project.config.volume_policy);

    let cat_volume_id = if !cat_bucket.is_empty() {
        let volume = Volume::new_cat();
        let id = volume.id.clone();
        project.volumes.insert_or_get(volume);
        Some(id)
    } else {
        None
    };

    let copy_volume_id = if !copy_bucket.is_empty() {
        let volume = Volume::new_copy();
        let id = volume.id.clone();
        project.volumes.insert_or_get(volume);
        Some(id)
    } else {
        None
    };

    let manifest_id = {
        let manifest = Manifest::new(Uuid::new_v4());
        let id = manifest.id.clone();
        project.manifests.insert_or_get(manifest);
        id
    };

    let result = (|| -> Result<String, Error> {
        if let Some(volume_id) = &cat_volume_id {
            for candidate in &cat_bucket {
                backup_one(project, candidate.source_index, &candidate.path, &mut sources, volume_id)?;
            }
        }

        if let Some(volume_id) = &copy_volume_id {
            for candidate in &copy_bucket {
                backup_one(project, candidate.source_index, &candidate.path, &mut sources, volume_id)?;
            }
        }

        let manifest = project
            .manifests
            .get_mut(&manifest_id)
            .expect("just inserted above");
        for source in &sources {
            manifest.record_source(source);
        }

        for volume in project.volumes.iter_mut() {
            volume.store(project.config.dry_run)?;
        }

        project
            .manifests
            .get_mut(&manifest_id)
            .expect("just inserted above")
            .store(&project.root, project.config.dry_run)?;

        Ok(manifest_id.clone())
    })();

    if result.is_err() {
        let manifest_ref = project.manifests.get(&manifest_id).cloned();
        rollback_all(project, manifest_ref.as_ref());
    }

    for source in sources {
        project.sources.replace(source);
    }

    result
}

/// Recreates every file recorded by the manifest `manifest_id` (or the
/// repository's most recent one) under `destination`, verifying each
/// reconstructed file's SHA-1 against the manifest's recorded checksum.
pub fn restore(
    project: &mut Project,
    manifest_id: Option<&str>,
    destination: &Path,
) -> Result<(), Error> {
    if !project.root.is_dir() {
        return Err(Error::NoSuchRepository(project.root.display().to_string()));
    }

    if destination.exists() {
        let non_empty = fs::read_dir(destination)?.next().is_some();
        if non_empty {
            return Err(Error::DestinationNotEmpty(destination.display().to_string()));
        }
    }

    let id = match manifest_id {
        Some(id) => id.to_string(),
        None => Manifest::latest_id(&project.root)?
            .ok_or_else(|| Error::EmptyRepository(project.root.display().to_string()))?,
    };

    let manifest = Manifest::load(&project.root, &id)?;
    let sources = manifest.sources();
    project.manifests.insert_or_get(manifest);

    for source in &sources {
        let source_dir = destination.join(&source.id);

        for file in source.files.iter() {
            let target = source_dir.join(&file.path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }

            match &file.stream {
                None => {
                    File::create(&target)?;
                }
                Some(stream) => {
                    restore_one(project, stream, file, &target)?;
                }
            }

            apply_metadata(&target, file);
        }
    }

    Ok(())
}

fn restore_one(
    project: &mut Project,
    stream: &crate::model::Stream,
    file: &FileEntry,
    target: &Path,
) -> Result<(), Error> {
    let kind = match stream {
        crate::model::Stream::Copy { .. } => VolumeKind::Copy,
        crate::model::Stream::Cat { .. } => VolumeKind::Cat,
    };

    let volume_id = stream.volume().to_string();
    let volume = project
        .volumes
        .insert_or_get(Volume::loaded(volume_id, kind));

    let mut reader = volume.open_reader(&project.root, stream)?;
    let mut out = File::create(target)?;
    std::io::copy(&mut reader, &mut out)?;

    let actual = reader.digest();
    let expected = file.sha1.clone().unwrap_or_default();
    if actual != expected {
        drop(out);
        let _ = fs::remove_file(target);
        return Err(Error::IntegrityMismatch {
            path: file.path.clone(),
            expected,
            actual,
        });
    }

    Ok(())
}

fn apply_metadata(target: &Path, file: &FileEntry) {
    if let Err(e) = fs::set_permissions(target, fs::Permissions::from_mode(file.mode)) {
        eprintln!("Warning: failed to restore mode for {}: {e}", target.display());
    }

    if let Err(e) = std::os::unix::fs::chown(target, Some(file.uid), Some(file.gid)) {
        eprintln!("Warning: failed to restore ownership for {}: {e}", target.display());
    }
}

/// Helper used only by [`backup`]'s base-source lookup: clones a recorded
/// [`Source`] but rebinds its root to the path passed on the command line
/// this session, since the manifest's recorded root is informational only.
trait ClonedIntoFresh {
    fn cloned_into_fresh(self, root: PathBuf) -> Option<Source>;
}

impl ClonedIntoFresh for Option<&Source> {
    fn cloned_into_fresh(self, root: PathBuf) -> Option<Source> {
        self.map(|s| Source {
            id: s.id.clone(),
            root,
            files: {
                let mut files = crate::identity::Identity::new();
                for f in s.files.iter() {
                    files.replace(f.clone());
                }
                files
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::ProjectConfig;

    use tempfile::tempdir;

    fn open_project(repo_root: &Path, config: ProjectConfig) -> Project {
        Project::open(repo_root.to_path_buf(), config).unwrap()
    }

    fn source_with_files(root: PathBuf, files: &[(&str, u64)]) -> Source {
        let mut source = Source::new(root);
        for (path, size) in files {
            let mut entry =
                FileEntry::new((*path).to_string(), chrono::Utc::now(), *size, 0o644, 0, 0);
            entry.live = true;
            source.files.replace(entry);
        }
        source
    }

    #[test]
    fn plan_buckets_promotes_a_lone_cat_candidate_to_copy() {
        let source = source_with_files(PathBuf::from("/src"), &[("only.txt", 100)]);
        let (cat, copy) = plan_buckets(&[source], VolumePolicy::Auto);

        assert!(cat.is_empty());
        assert_eq!(copy.len(), 1);
        assert_eq!(copy[0].path, "only.txt");
    }

    #[test]
    fn plan_buckets_routes_large_files_to_copy_and_small_ones_to_cat() {
        let source = source_with_files(
            PathBuf::from("/src"),
            &[("small_a.txt", 10), ("small_b.txt", 20), ("huge.bin", 2 * 1024 * 1024)],
        );
        let (cat, copy) = plan_buckets(&[source], VolumePolicy::Auto);

        assert_eq!(cat.len(), 2);
        assert_eq!(copy.len(), 1);
        assert_eq!(copy[0].path, "huge.bin");
    }

    #[test]
    fn plan_buckets_honors_forced_policies() {
        let source = source_with_files(PathBuf::from("/src"), &[("a.txt", 10), ("b.txt", 20)]);

        let (cat, copy) = plan_buckets(&[source_with_files(PathBuf::from("/src"), &[("a.txt", 10), ("b.txt", 20)])], VolumePolicy::Copy);
        assert!(cat.is_empty());
        assert_eq!(copy.len(), 2);

        let (cat, copy) = plan_buckets(&[source], VolumePolicy::Cat);
        assert_eq!(cat.len(), 2);
        assert!(copy.is_empty());
    }

    #[test]
    fn backup_then_restore_round_trips_file_contents() {
        let repo = tempdir().unwrap();
        let src = tempdir().unwrap();
        fs::write(src.path().join("hello.txt"), b"hello").unwrap();

        let mut project = open_project(repo.path(), ProjectConfig::default());
        let manifest_id = backup(&mut project, &[src.path().to_path_buf()], true).unwrap();
        assert!(!manifest_id.is_empty());

        let dest = tempdir().unwrap();
        fs::remove_dir(dest.path()).unwrap();

        let mut restore_project = open_project(repo.path(), ProjectConfig::default());
        restore(&mut restore_project, None, dest.path()).unwrap();

        let source_id = crate::model::source_id(src.path());
        let restored = dest.path().join(source_id).join("hello.txt");
        assert_eq!(fs::read(restored).unwrap(), b"hello");
    }

    #[test]
    fn backup_is_a_no_op_on_unchanged_source() {
        let repo = tempdir().unwrap();
        let src = tempdir().unwrap();
        fs::write(src.path().join("a.txt"), b"hello").unwrap();

        let mut project = open_project(repo.path(), ProjectConfig::default());
        backup(&mut project, &[src.path().to_path_buf()], true).unwrap();

        let mut project2 = open_project(repo.path(), ProjectConfig::default());
        let second_id = backup(&mut project2, &[src.path().to_path_buf()], false).unwrap();

        let manifest = Manifest::load(repo.path(), &second_id).unwrap();
        let sources = manifest.sources();
        assert_eq!(sources[0].files.len(), 1);
    }

    #[test]
    fn restore_rejects_a_repository_directory_that_does_not_exist() {
        let repo_parent = tempdir().unwrap();
        let repo_path = repo_parent.path().join("never-backed-up");
        let dest = tempdir().unwrap();
        fs::remove_dir(dest.path()).unwrap();

        let mut project = open_project(&repo_path, ProjectConfig::default());
        let result = restore(&mut project, None, dest.path());

        assert!(matches!(result, Err(Error::NoSuchRepository(_))));
    }

    #[test]
    fn restore_rejects_non_empty_destination() {
        let repo = tempdir().unwrap();
        let src = tempdir().unwrap();
        fs::write(src.path().join("a.txt"), b"hello").unwrap();

        let mut project = open_project(repo.path(), ProjectConfig::default());
        backup(&mut project, &[src.path().to_path_buf()], true).unwrap();

        let dest = tempdir().unwrap();
        fs::write(dest.path().join("occupied"), b"x").unwrap();

        let mut restore_project = open_project(repo.path(), ProjectConfig::default());
        assert!(restore(&mut restore_project, None, dest.path()).is_err());
    }

    #[test]
    fn dry_run_backup_leaves_repository_empty() {
        let repo = tempdir().unwrap();
        let src = tempdir().unwrap();
        fs::write(src.path().join("a.txt"), b"hello").unwrap();

        let mut config = ProjectConfig::default();
        config.dry_run = true;

        let mut project = open_project(repo.path(), config);
        backup(&mut project, &[src.path().to_path_buf()], true).unwrap();

        assert!(fs::read_dir(repo.path()).unwrap().next().is_none());
    }
}
