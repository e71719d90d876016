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

//! Component B: the repository root plus the identity registries every
//! other component resolves string ids through.

use crate::config::ProjectConfig;
use crate::manifest::Manifest;
use crate::model::Source;
use crate::volume::Volume;
use crate::Error;

use std::path::PathBuf;

use crate::identity::Identity;

/// One backup repository: a filesystem root holding volumes and manifests,
/// plus the in-memory registries spec.md's component B calls for.
///
/// `sources` is rebuilt fresh every session from the sources named on the
/// command line; `volumes`/`manifests` accumulate whichever ones the running
/// session actually touches (loaded or newly created), never the full
/// repository history.
pub struct Project {
    pub root: PathBuf,
    pub config: ProjectConfig,
    pub sources: Identity<Source>,
    pub volumes: Identity<Volume>,
    pub manifests: Identity<Manifest>,
}

impl Project {
    pub fn open(root: PathBuf, config: ProjectConfig) -> Result<Self, Error> {
        Ok(Self {
            root,
            config,
            sources: Identity::new(),
            volumes: Identity::new(),
            manifests: Identity::new(),
        })
    }
}
