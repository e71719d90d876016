// rockup is the command line interface of the Rockup backup engine.
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

mod error;
use error::*;

use rockup_core::config::ProjectConfig;
use rockup_core::engine;
use rockup_core::project::Project;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up one or more source directories into a repository.
    Backup {
        /// Ignore the repository's most recent manifest and back up every file.
        #[arg(short = 'B', long)]
        full: bool,
        /// Do not write or delete anything, just report what would happen.
        #[arg(long)]
        dry_run: bool,
        /// The repository directory to write volumes and the manifest into.
        backup_dir: PathBuf,
        /// The source directories to scan and back up.
        source_dirs: Vec<PathBuf>,
    },
    /// Restore the repository's most recent (or a named) manifest.
    Restore {
        /// Where to recreate the backed-up sources. Must not already contain files.
        #[arg(short = 'r', long)]
        destination: PathBuf,
        /// The manifest id to restore. Defaults to the most recent one.
        #[arg(long)]
        manifest: Option<String>,
        /// Do not write anything, just report what would happen.
        #[arg(long)]
        dry_run: bool,
        /// The repository directory to read volumes and the manifest from.
        backup_dir: PathBuf,
    },
}

fn logic() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Backup {
            full,
            dry_run,
            backup_dir,
            source_dirs,
        } => {
            if source_dirs.is_empty() {
                return Err(Error::NoSources);
            }

            let config = ProjectConfig {
                dry_run,
                ..ProjectConfig::default()
            };
            let mut project = Project::open(backup_dir, config)?;

            let manifest_id = engine::backup(&mut project, &source_dirs, full)?;
            println!("Wrote manifest {manifest_id}");
        }
        Commands::Restore {
            destination,
            manifest,
            dry_run,
            backup_dir,
        } => {
            let config = ProjectConfig {
                dry_run,
                ..ProjectConfig::default()
            };
            let mut project = Project::open(backup_dir, config)?;

            engine::restore(&mut project, manifest.as_deref(), &destination)?;
            println!("Restored to {}", destination.display());
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    match logic() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
