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

use crate::Error;

/// Which kind of [`crate::volume::Volume`] newly backed-up files are routed into.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum VolumePolicy {
    /// Let the planner decide per spec.md's size/compressibility heuristic.
    #[default]
    Auto,
    /// Force every candidate file into the single copy volume.
    Copy,
    /// Force every candidate file into the single cat volume.
    Cat,
}

impl TryFrom<&str> for VolumePolicy {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "auto" => Ok(Self::Auto),
            "copy" => Ok(Self::Copy),
            "cat" => Ok(Self::Cat),
            _ => Err(Error::InvalidPolicy(value.to_string())),
        }
    }
}

/// Whether a [`crate::volume::Volume`] gzip-compresses the streams it writes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CompressionPolicy {
    /// Compress only where `compressible?` predicts a net size reduction.
    #[default]
    Auto,
    /// Always compress.
    Enforce,
    /// Never compress.
    Disable,
}

impl TryFrom<&str> for CompressionPolicy {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "auto" => Ok(Self::Auto),
            "enforce" => Ok(Self::Enforce),
            "disable" => Ok(Self::Disable),
            _ => Err(Error::InvalidPolicy(value.to_string())),
        }
    }
}

/// Session-wide configuration carried by a [`crate::project::Project`].
#[derive(Clone, Debug)]
pub struct ProjectConfig {
    /// Routes candidates to a copy or cat volume, or lets the planner decide.
    pub volume_policy: VolumePolicy,
    /// Governs whether streams are gzip-compressed.
    pub compression_policy: CompressionPolicy,
    /// Replace copy-volume stream paths with random tokens instead of
    /// `<source-id>/<relative-path>`.
    pub obfuscate: bool,
    /// Suppress every filesystem mutation performed by `store!`/`rollback!`.
    pub dry_run: bool,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            volume_policy: VolumePolicy::default(),
            compression_policy: CompressionPolicy::default(),
            obfuscate: false,
            dry_run: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_policy_parses_known_values() {
        assert_eq!(VolumePolicy::try_from("auto").unwrap(), VolumePolicy::Auto);
        assert_eq!(VolumePolicy::try_from("copy").unwrap(), VolumePolicy::Copy);
        assert_eq!(VolumePolicy::try_from("cat").unwrap(), VolumePolicy::Cat);
        assert!(VolumePolicy::try_from("bogus").is_err());
    }

    #[test]
    fn compression_policy_parses_known_values() {
        assert_eq!(
            CompressionPolicy::try_from("enforce").unwrap(),
            CompressionPolicy::Enforce
        );
        assert!(CompressionPolicy::try_from("bogus").is_err());
    }
}
