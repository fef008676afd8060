//! Series of file names inside a directory.
//!
//! The task loader scans `TASKDIR` (and the include loader `INCLUDEDIR`) for
//! files with a given suffix. The result is an owned list of names plus the
//! base directory, ordered lexicographically so that boots are reproducible
//! regardless of readdir order.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// An owned series of file names found in one directory.
#[derive(Debug, Clone)]
pub struct FileSeries {
    base_dir: PathBuf,
    names: Vec<String>,
}

impl FileSeries {
    /// Scan `path` for regular files whose name ends in `suffix`.
    ///
    /// Symbolic links to regular files are only included when `follow_links`
    /// is set. Entries are sorted by byte-wise comparison of their names,
    /// matching `scandir(3)` with `alphasort`.
    pub fn from_dir(path: &Path, suffix: &str, follow_links: bool) -> Result<Self> {
        let rd = std::fs::read_dir(path)
            .map_err(|e| Error::io(format!("scanning directory {}", path.display()), e))?;

        let mut names = Vec::new();
        for entry in rd {
            let entry =
                entry.map_err(|e| Error::io(format!("reading entry in {}", path.display()), e))?;
            let name = match entry.file_name().into_string() {
                Ok(n) => n,
                // Non-UTF-8 names cannot be task names; skip them.
                Err(_) => continue,
            };
            if !name.ends_with(suffix) {
                continue;
            }
            let meta = entry
                .path()
                .symlink_metadata()
                .map_err(|e| Error::io(format!("stat {}", entry.path().display()), e))?;
            if meta.file_type().is_symlink() {
                if !follow_links {
                    continue;
                }
                // Follow the link; only keep it if the target is a regular file.
                match std::fs::metadata(entry.path()) {
                    Ok(target) if target.is_file() => {}
                    _ => continue,
                }
            } else if !meta.is_file() {
                continue;
            }
            names.push(name);
        }
        names.sort_unstable();

        Ok(Self {
            base_dir: path.to_path_buf(),
            names,
        })
    }

    /// Build a series from a pre-existing list of names.
    pub fn from_names(base_dir: &Path, names: Vec<String>) -> Self {
        Self {
            base_dir: base_dir.to_path_buf(),
            names,
        }
    }

    /// Grow or shrink the series to `num_elements` names.
    ///
    /// Growth appends empty names; shrinking truncates. Resizing to zero is
    /// rejected so that an emptied series cannot be confused with an
    /// uninitialized one.
    pub fn resize(&mut self, num_elements: usize) -> Result<()> {
        if num_elements == 0 {
            return Err(Error::InvalidInput(
                "cannot resize a file series to zero elements".into(),
            ));
        }
        self.names.resize(num_elements, String::new());
        Ok(())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Full paths of all files in the series, in series order.
    pub fn paths(&self) -> impl Iterator<Item = PathBuf> + '_ {
        self.names.iter().map(|n| self.base_dir.join(n))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
