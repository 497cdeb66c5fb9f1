use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::Result;

/// Name of the uploaded archive inside a job root.
pub const ARCHIVE_NAME: &str = "code.zip";
/// Directory the sources live in once unpacked.
pub const CODE_DIR: &str = "code";

pub(crate) const INFO_FILE: &str = "info.json";
pub(crate) const INFO_TMP_FILE: &str = "info.json.tmp";
pub(crate) const LOG_FILE: &str = "log.txt";

/// Handle to the files a job was submitted with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileTree {
    /// A zip archive; the pipeline starts with an unpack stage.
    Archive(PathBuf),
    /// An already-unpacked source directory.
    Directory(PathBuf),
    Empty,
}

impl FileTree {
    pub fn is_archive(&self) -> bool {
        matches!(self, FileTree::Archive(_))
    }

    fn import_into(&self, job_root: &Path) -> Result<()> {
        match self {
            FileTree::Archive(src) => {
                fs::copy(src, job_root.join(ARCHIVE_NAME))?;
            }
            FileTree::Directory(src) => copy_tree(src, &job_root.join(CODE_DIR))?,
            FileTree::Empty => fs::create_dir_all(job_root.join(CODE_DIR))?,
        }
        Ok(())
    }
}

/// A directory in the store's staging area that belongs to no job: either
/// a submission still being imported or a deleted job awaiting removal.
///
/// Creating and discarding one walks whole trees, so both happen off the
/// scheduler task. Adopting it as a job is a single `rename`.
#[derive(Debug)]
pub struct StagedDir {
    path: PathBuf,
}

impl StagedDir {
    /// Copy `files` into a fresh directory under `staging_root`. Nothing is
    /// left behind when the copy fails.
    pub fn import(staging_root: &Path, files: &FileTree) -> Result<Self> {
        let staged = Self::reserve(staging_root)?;
        fs::create_dir(&staged.path)?;
        if let Err(e) = files.import_into(&staged.path) {
            let _ = fs::remove_dir_all(&staged.path);
            return Err(e);
        }
        Ok(staged)
    }

    /// A fresh, not yet existing path under `staging_root`.
    pub(crate) fn reserve(staging_root: &Path) -> Result<Self> {
        Ok(Self {
            path: staging_root.join(Uuid::new_v4().simple().to_string()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the directory and everything under it.
    pub fn discard(self) -> Result<()> {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn copy_tree(src: &Path, dest: &Path) -> io::Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry?;
        let Ok(rel) = entry.path().strip_prefix(src) else {
            continue;
        };
        let target = dest.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Files under a job root, relative to it, `/`-separated and sorted.
/// Symlinks are listed but never followed, so nothing outside the root is
/// reachable through the listing.
pub fn list_files(job_root: &Path) -> Result<Vec<String>> {
    let mut paths = Vec::new();
    for entry in WalkDir::new(job_root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_dir() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(job_root) else {
            continue;
        };
        if entry.depth() == 1 && is_store_metadata(rel) {
            continue;
        }
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        paths.push(parts.join("/"));
    }
    Ok(paths)
}

fn is_store_metadata(rel: &Path) -> bool {
    [INFO_FILE, INFO_TMP_FILE, LOG_FILE]
        .iter()
        .any(|name| rel == Path::new(name))
}
