//! `archsync add`, `archsync add-local-files` and `archsync correct-path`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use walkdir::WalkDir;

use archsync_core::{NewFile, Registration};

use super::{absolute, Workspace};

/// Register a local file for syncing.
#[derive(Args, Debug)]
pub struct AddArgs {
    /// File on this host; hashed immediately.
    pub local: PathBuf,

    /// Destination relative to the archive's remote base directory.
    pub remote: PathBuf,

    /// Archive the file belongs to.
    #[arg(long, short = 'a')]
    pub archive: String,

    /// Copy and verify, but never delete the local file.
    #[arg(long)]
    pub no_delete: bool,
}

impl AddArgs {
    pub fn run(self, workspace: &Workspace) -> Result<()> {
        let config = workspace.config()?;
        let registry = workspace.registry(&config)?;
        let local = self
            .local
            .canonicalize()
            .with_context(|| format!("cannot resolve path '{}'", self.local.display()))?;

        let new = NewFile::new(&local, &self.remote, self.archive.as_str())
            .deletable(!self.no_delete);
        let registration = registry
            .add_file(new)
            .with_context(|| format!("failed to register '{}'", local.display()))?;

        match registration {
            Registration::Added(file) => {
                println!(
                    "✓ Registered '{}' in archive '{}' (timecode {})",
                    file.local_path.display(),
                    file.archive_name,
                    file.timecode
                );
                println!("  Remote: {}", file.remote_path.display());
            }
            Registration::AlreadyRegistered(file) => {
                let progress = if file.copied {
                    "copied".to_string()
                } else {
                    format!("{} failed attempts", file.failed_copy_attempts)
                };
                println!(
                    "· '{}' is already registered ({progress})",
                    file.local_path.display(),
                );
            }
        }
        Ok(())
    }
}

/// Point an existing registration at a moved or renamed local file.
#[derive(Args, Debug)]
pub struct CorrectPathArgs {
    /// Path the file was registered under.
    pub old: PathBuf,

    /// Where the same content lives now.
    pub new: PathBuf,
}

impl CorrectPathArgs {
    pub fn run(self, workspace: &Workspace) -> Result<()> {
        let config = workspace.config()?;
        let registry = workspace.registry(&config)?;
        let old = absolute(&self.old)?;
        let new = self
            .new
            .canonicalize()
            .with_context(|| format!("cannot resolve path '{}'", self.new.display()))?;

        let file = registry
            .correct_local_path(&old, &new)
            .with_context(|| format!("failed to move registration '{}'", old.display()))?;
        println!(
            "✓ '{}' now tracks '{}'",
            file.archive_name,
            file.local_path.display()
        );
        Ok(())
    }
}

/// Register every unknown file under a directory.
#[derive(Args, Debug)]
pub struct AddLocalFilesArgs {
    /// Directory to walk; each file's path below it becomes its remote path.
    pub root: PathBuf,

    /// Archive the files belong to.
    #[arg(long, short = 'a')]
    pub archive: String,

    /// Copy and verify, but never delete the local files.
    #[arg(long)]
    pub no_delete: bool,
}

impl AddLocalFilesArgs {
    pub fn run(self, workspace: &Workspace) -> Result<()> {
        let config = workspace.config()?;
        let registry = workspace.registry(&config)?;
        let root = self
            .root
            .canonicalize()
            .with_context(|| format!("cannot resolve path '{}'", self.root.display()))?;

        let mut files: Vec<PathBuf> = WalkDir::new(&root)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    eprintln!("  !  skipping unreadable entry: {e}");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .collect();
        files.sort();

        let (mut added, mut known) = (0usize, 0usize);
        for local in files {
            if registry
                .get_file(&local)
                .with_context(|| format!("failed to look up '{}'", local.display()))?
                .is_some()
            {
                known += 1;
                continue;
            }
            let remote = local
                .strip_prefix(&root)
                .with_context(|| format!("'{}' is outside the root", local.display()))?;
            let new =
                NewFile::new(&local, remote, self.archive.as_str()).deletable(!self.no_delete);
            registry
                .add_file(new)
                .with_context(|| format!("failed to register '{}'", local.display()))?;
            added += 1;
        }

        println!(
            "✓ Registered {added} new files in archive '{}' ({known} already known)",
            self.archive
        );
        Ok(())
    }
}
