//! Polling watcher for the raw spectrum drop directory
//!
//! Each poll rescans the directory and hands out at most one file that is
//! new and has finished arriving. A file counts as finished once its size
//! has held steady for `settle_polls` consecutive polls. Every path is handed
//! out once per watcher lifetime, whatever happens to it afterwards.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Size tracking for a file that has appeared but not yet been handed out.
#[derive(Debug, Clone, Copy)]
struct Pending {
    size: u64,
    stable_polls: u32,
}

#[derive(Debug)]
pub struct RawSpectrumWatcher {
    dir: PathBuf,
    settle_polls: u32,
    pending: BTreeMap<PathBuf, Pending>,
    handed_out: HashSet<PathBuf>,
    primed: bool,
    process_existing: bool,
}

impl RawSpectrumWatcher {
    pub fn new(dir: impl Into<PathBuf>, settle_polls: u32, process_existing: bool) -> Self {
        Self {
            dir: dir.into(),
            settle_polls,
            pending: BTreeMap::new(),
            handed_out: HashSet::new(),
            primed: false,
            process_existing,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of paths handed out so far.
    pub fn handed_out(&self) -> usize {
        self.handed_out.len()
    }

    /// Rescan and return the next settled, never-seen file, if any.
    ///
    /// A missing directory is treated as empty.
    pub fn poll_next(&mut self) -> io::Result<Option<PathBuf>> {
        let current = match scan_files(&self.dir) {
            Ok(files) => files,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e),
        };

        if !self.primed {
            self.primed = true;
            if !self.process_existing {
                info!(
                    dir = %self.dir.display(),
                    existing = current.len(),
                    "Raw spectrum baseline taken; existing files will not be reformatted"
                );
                self.handed_out
                    .extend(current.into_iter().map(|(path, _)| path));
                return Ok(None);
            }
        }

        let live: HashSet<&PathBuf> = current.iter().map(|(p, _)| p).collect();
        self.pending.retain(|path, _| live.contains(path));

        for (path, size) in &current {
            if self.handed_out.contains(path) {
                continue;
            }
            match self.pending.get_mut(path) {
                Some(p) if p.size == *size => p.stable_polls += 1,
                Some(p) => {
                    p.size = *size;
                    p.stable_polls = 0;
                }
                None => {
                    debug!(path = %path.display(), size, "New raw spectrum detected");
                    self.pending.insert(
                        path.clone(),
                        Pending {
                            size: *size,
                            stable_polls: 0,
                        },
                    );
                }
            }
        }

        let ready = self
            .pending
            .iter()
            .find(|(_, p)| p.stable_polls >= self.settle_polls && p.size > 0)
            .map(|(path, _)| path.clone());

        if let Some(path) = &ready {
            self.pending.remove(path);
            self.handed_out.insert(path.clone());
        }
        Ok(ready)
    }
}

/// Regular, non-hidden files directly inside `dir`, with their sizes.
fn scan_files(dir: &Path) -> io::Result<Vec<(PathBuf, u64)>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(true, |n| n.starts_with('.'));
        if hidden || path.extension().is_some_and(|e| e == "partial") {
            continue;
        }
        files.push((path, meta.len()));
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn existing_files_are_baselined() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("old.txt"), "data").unwrap();
        let mut watcher = RawSpectrumWatcher::new(dir.path(), 0, false);

        assert_eq!(watcher.poll_next().unwrap(), None);
        assert_eq!(watcher.poll_next().unwrap(), None);

        fs::write(dir.path().join("new.txt"), "data").unwrap();
        assert_eq!(
            watcher.poll_next().unwrap(),
            Some(dir.path().join("new.txt"))
        );
    }

    #[test]
    fn waits_for_size_to_settle() {
        let dir = TempDir::new().unwrap();
        let mut watcher = RawSpectrumWatcher::new(dir.path(), 1, false);
        watcher.poll_next().unwrap();

        let path = dir.path().join("scan.txt");
        fs::write(&path, "part").unwrap();
        assert_eq!(watcher.poll_next().unwrap(), None);

        fs::write(&path, "partial plus more").unwrap();
        assert_eq!(watcher.poll_next().unwrap(), None);

        assert_eq!(watcher.poll_next().unwrap(), Some(path));
    }

    #[test]
    fn one_file_per_poll_and_never_twice() {
        let dir = TempDir::new().unwrap();
        let mut watcher = RawSpectrumWatcher::new(dir.path(), 0, true);
        fs::write(dir.path().join("a.txt"), "1").unwrap();
        fs::write(dir.path().join("b.txt"), "2").unwrap();

        let first = watcher.poll_next().unwrap().unwrap();
        let second = watcher.poll_next().unwrap().unwrap();
        assert_ne!(first, second);
        assert_eq!(watcher.poll_next().unwrap(), None);

        // Touching a handed-out file does not bring it back.
        fs::write(&first, "changed").unwrap();
        assert_eq!(watcher.poll_next().unwrap(), None);
        assert_eq!(watcher.handed_out(), 2);
    }

    #[test]
    fn skips_directories_hidden_and_staging_files() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("Output")).unwrap();
        fs::write(dir.path().join(".lock"), "x").unwrap();
        fs::write(dir.path().join("scan.partial"), "x").unwrap();
        let mut watcher = RawSpectrumWatcher::new(dir.path(), 0, true);
        assert_eq!(watcher.poll_next().unwrap(), None);
    }

    #[test]
    fn missing_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        let mut watcher = RawSpectrumWatcher::new(dir.path().join("absent"), 0, true);
        assert_eq!(watcher.poll_next().unwrap(), None);
    }
}
