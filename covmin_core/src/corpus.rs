use serde::{Deserialize, Serialize};
use std::ffi::{OsStr, OsString};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use thiserror::Error;

/// Errors raised while reading or mutating the on-disk corpus.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// The corpus path exists but points at something other than a directory.
    #[error("Corpus path {0:?} exists but is not a directory")]
    NotADirectory(PathBuf),

    /// A file expected in the corpus (or in a scratch area) is missing.
    #[error("Corpus file {0:?} not found")]
    FileNotFound(PathBuf),

    /// An I/O operation on `path` failed.
    #[error("Corpus I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CorpusError + '_ {
    move |source| CorpusError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Number of files and total bytes held by a corpus directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorpusSize {
    pub files: usize,
    pub bytes: u64,
}

impl CorpusSize {
    /// Signed `(files, bytes)` difference against an earlier measurement.
    pub fn delta(&self, previous: &CorpusSize) -> (i64, i64) {
        (
            self.files as i64 - previous.files as i64,
            self.bytes as i64 - previous.bytes as i64,
        )
    }
}

/// One regular file in the corpus directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusEntry {
    pub name: OsString,
    pub size: u64,
}

/// A flat directory of opaque input files.
///
/// All mutations used by the reduction phases go through this type. Scratch
/// areas are created next to the corpus directory so that moving a file in or
/// out, and swapping a whole scratch directory in, are plain renames on the
/// same file system.
#[derive(Debug, Clone)]
pub struct CorpusStore {
    dir: PathBuf,
}

impl CorpusStore {
    const SCRATCH_PREFIX: &'static str = ".covmin-scratch-";
    const RETIRED_PREFIX: &'static str = ".covmin-retired-";

    /// Opens the corpus at `dir`, creating the directory if it does not exist.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, CorpusError> {
        let dir = dir.as_ref();
        if !dir.exists() {
            fs::create_dir_all(dir).map_err(io_error(dir))?;
        } else if !dir.is_dir() {
            return Err(CorpusError::NotADirectory(dir.to_path_buf()));
        }
        let dir = dir.canonicalize().map_err(io_error(dir))?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn file_path(&self, name: &OsStr) -> PathBuf {
        self.dir.join(name)
    }

    /// Regular files in the order the file system lists them.
    pub fn entries(&self) -> Result<Vec<CorpusEntry>, CorpusError> {
        list_entries(&self.dir)
    }

    /// Regular files sorted by ascending size. Equal sizes keep listing order.
    pub fn entries_by_size(&self) -> Result<Vec<CorpusEntry>, CorpusError> {
        let mut entries = self.entries()?;
        entries.sort_by_key(|entry| entry.size);
        Ok(entries)
    }

    pub fn size(&self) -> Result<CorpusSize, CorpusError> {
        let entries = self.entries()?;
        Ok(CorpusSize {
            files: entries.len(),
            bytes: entries.iter().map(|entry| entry.size).sum(),
        })
    }

    pub fn is_empty(&self) -> Result<bool, CorpusError> {
        Ok(self.entries()?.is_empty())
    }

    pub fn read(&self, name: &OsStr) -> Result<Vec<u8>, CorpusError> {
        let path = self.file_path(name);
        if !path.is_file() {
            return Err(CorpusError::FileNotFound(path));
        }
        fs::read(&path).map_err(io_error(&path))
    }

    /// Replaces the content of `name` in place and flushes it to disk.
    pub fn rewrite(&self, name: &OsStr, content: &[u8]) -> Result<(), CorpusError> {
        let path = self.file_path(name);
        let mut file = File::create(&path).map_err(io_error(&path))?;
        file.write_all(content).map_err(io_error(&path))?;
        file.sync_all().map_err(io_error(&path))
    }

    /// Creates an empty holding area on the same file system as the corpus.
    pub fn scratch(&self) -> Result<Scratch, CorpusError> {
        let parent = self.parent_dir();
        let dir = tempfile::Builder::new()
            .prefix(Self::SCRATCH_PREFIX)
            .tempdir_in(&parent)
            .map_err(io_error(&parent))?;
        Ok(Scratch { dir })
    }

    /// Copies `name` into `scratch`, leaving the corpus untouched.
    pub fn copy_to_scratch(&self, name: &OsStr, scratch: &Scratch) -> Result<(), CorpusError> {
        let from = self.file_path(name);
        if !from.is_file() {
            return Err(CorpusError::FileNotFound(from));
        }
        let to = scratch.path().join(name);
        fs::copy(&from, &to).map_err(io_error(&from))?;
        Ok(())
    }

    /// Moves `name` out of the corpus into `scratch` for a trial.
    ///
    /// The returned [`StagedFile`] must be settled with `commit` (the file stays
    /// removed) or `rollback` (the file goes back). Dropping it unsettled rolls back.
    pub fn stage<'s>(
        &self,
        name: &OsStr,
        scratch: &'s Scratch,
    ) -> Result<StagedFile<'s>, CorpusError> {
        let corpus_path = self.file_path(name);
        if !corpus_path.is_file() {
            return Err(CorpusError::FileNotFound(corpus_path));
        }
        let held_path = scratch.path().join(name);
        fs::rename(&corpus_path, &held_path).map_err(io_error(&corpus_path))?;
        Ok(StagedFile {
            corpus_path,
            held_path,
            settled: false,
            _scratch: scratch,
        })
    }

    /// Swaps the content of `scratch` in as the new corpus.
    ///
    /// The old directory is renamed aside first and only removed once the new
    /// one is in place, so a failure midway leaves one complete corpus behind.
    pub fn replace_with(&self, scratch: Scratch) -> Result<(), CorpusError> {
        let parent = self.parent_dir();
        let retired_root = tempfile::Builder::new()
            .prefix(Self::RETIRED_PREFIX)
            .tempdir_in(&parent)
            .map_err(io_error(&parent))?;
        let retired = retired_root.path().join("corpus");

        fs::rename(&self.dir, &retired).map_err(io_error(&self.dir))?;
        let incoming = scratch.dir.keep();
        if let Err(source) = fs::rename(&incoming, &self.dir) {
            // Put the previous corpus back before reporting.
            if let Err(restore) = fs::rename(&retired, &self.dir) {
                log::error!(
                    "Failed to restore corpus {:?} from {:?}: {}",
                    self.dir,
                    retired,
                    restore
                );
            }
            return Err(CorpusError::Io {
                path: incoming,
                source,
            });
        }
        sync_dir(&parent);
        drop(retired_root);
        Ok(())
    }

    /// Flushes directory metadata (renames, deletions) to disk.
    pub fn sync(&self) {
        sync_dir(&self.dir);
    }

    /// Removes every file from the corpus.
    pub fn clear(&self) -> Result<(), CorpusError> {
        fs::remove_dir_all(&self.dir).map_err(io_error(&self.dir))?;
        fs::create_dir_all(&self.dir).map_err(io_error(&self.dir))
    }

    /// Copies seed inputs into the corpus, naming each by the MD5 digest of its
    /// content so identical seeds collapse into one file.
    ///
    /// `source` may be a single file or a directory (not traversed recursively).
    /// Returns the number of files that were new to the corpus.
    pub fn import(&self, source: &Path) -> Result<usize, CorpusError> {
        let sources = if source.is_dir() {
            list_entries(source)?
                .into_iter()
                .map(|entry| source.join(entry.name))
                .collect()
        } else if source.is_file() {
            vec![source.to_path_buf()]
        } else {
            return Err(CorpusError::FileNotFound(source.to_path_buf()));
        };

        let mut imported = 0;
        for path in sources {
            let content = fs::read(&path).map_err(io_error(&path))?;
            let name = format!("{:x}", md5::compute(&content));
            let target = self.dir.join(&name);
            if target.exists() {
                log::debug!("Skipping {:?}: already in corpus as {}", path, name);
                continue;
            }
            fs::write(&target, &content).map_err(io_error(&target))?;
            imported += 1;
        }
        Ok(imported)
    }

    fn parent_dir(&self) -> PathBuf {
        self.dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Temporary holding area for files under trial. Removed with its content on drop.
#[derive(Debug)]
pub struct Scratch {
    dir: TempDir,
}

impl Scratch {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn contains(&self, name: &OsStr) -> bool {
        self.path().join(name).is_file()
    }

    /// Deletes a file previously copied into the scratch area.
    pub fn remove(&self, name: &OsStr) -> Result<(), CorpusError> {
        let path = self.path().join(name);
        fs::remove_file(&path).map_err(io_error(&path))
    }

    /// Deletes a non-input artifact (e.g. a profile left by a tool) if present.
    pub fn discard_artifact(&self, name: &str) -> Result<(), CorpusError> {
        let path = self.path().join(name);
        if path.exists() {
            fs::remove_file(&path).map_err(io_error(&path))?;
        }
        Ok(())
    }

    pub fn entries(&self) -> Result<Vec<CorpusEntry>, CorpusError> {
        list_entries(self.path())
    }
}

/// A corpus file moved into a scratch area, awaiting a keep/drop decision.
#[derive(Debug)]
#[must_use = "a staged file must be committed or rolled back"]
pub struct StagedFile<'s> {
    corpus_path: PathBuf,
    held_path: PathBuf,
    settled: bool,
    _scratch: &'s Scratch,
}

impl StagedFile<'_> {
    /// Drops the file for good.
    pub fn commit(mut self) -> Result<(), CorpusError> {
        self.settled = true;
        fs::remove_file(&self.held_path).map_err(io_error(&self.held_path))
    }

    /// Moves the file back into the corpus.
    pub fn rollback(mut self) -> Result<(), CorpusError> {
        self.settled = true;
        fs::rename(&self.held_path, &self.corpus_path).map_err(io_error(&self.held_path))
    }
}

impl Drop for StagedFile<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Err(e) = fs::rename(&self.held_path, &self.corpus_path) {
            log::error!(
                "Failed to return staged file {:?} to {:?}: {}",
                self.held_path,
                self.corpus_path,
                e
            );
        }
    }
}

fn list_entries(dir: &Path) -> Result<Vec<CorpusEntry>, CorpusError> {
    let mut entries = Vec::new();
    for entry_result in fs::read_dir(dir).map_err(io_error(dir))? {
        let entry = entry_result.map_err(io_error(dir))?;
        let metadata = entry.metadata().map_err(io_error(&entry.path()))?;
        if metadata.is_file() {
            entries.push(CorpusEntry {
                name: entry.file_name(),
                size: metadata.len(),
            });
        }
    }
    Ok(entries)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = File::open(dir).and_then(|handle| handle.sync_all()) {
        log::warn!("Could not sync directory {:?}: {}", dir, e);
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn corpus_with(files: &[(&str, &[u8])]) -> (TempDir, CorpusStore) {
        let root = tempdir().unwrap();
        let store = CorpusStore::open(root.path().join("corpus")).unwrap();
        for (name, content) in files {
            fs::write(store.path().join(name), content).unwrap();
        }
        (root, store)
    }

    fn names(entries: &[CorpusEntry]) -> Vec<String> {
        entries
            .iter()
            .map(|entry| entry.name.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn open_creates_missing_directory() {
        let root = tempdir().unwrap();
        let path = root.path().join("nested").join("corpus");
        let store = CorpusStore::open(&path).unwrap();
        assert!(path.is_dir());
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn open_rejects_regular_file() {
        let root = tempdir().unwrap();
        let path = root.path().join("not_a_dir");
        fs::write(&path, b"x").unwrap();
        match CorpusStore::open(&path) {
            Err(CorpusError::NotADirectory(p)) => assert_eq!(p, path),
            other => panic!("Expected NotADirectory, got {other:?}"),
        }
    }

    #[test]
    fn size_counts_files_and_bytes_ignoring_subdirectories() {
        let (_root, store) = corpus_with(&[("a", b"0123456789"), ("b", b"abc")]);
        fs::create_dir(store.path().join("subdir")).unwrap();
        assert_eq!(
            store.size().unwrap(),
            CorpusSize {
                files: 2,
                bytes: 13
            }
        );
    }

    #[test]
    fn entries_by_size_puts_smallest_first() {
        let (_root, store) =
            corpus_with(&[("big", b"0123456789"), ("small", b"ab"), ("mid", b"abcde")]);
        assert_eq!(
            names(&store.entries_by_size().unwrap()),
            ["small", "mid", "big"]
        );
    }

    #[test]
    fn staged_file_rollback_restores_it() {
        let (_root, store) = corpus_with(&[("a", b"alpha")]);
        let scratch = store.scratch().unwrap();
        let staged = store.stage(OsStr::new("a"), &scratch).unwrap();
        assert!(store.is_empty().unwrap());
        assert!(scratch.contains(OsStr::new("a")));

        staged.rollback().unwrap();
        assert_eq!(store.read(OsStr::new("a")).unwrap(), b"alpha");
        assert!(!scratch.contains(OsStr::new("a")));
    }

    #[test]
    fn staged_file_commit_removes_it_everywhere() {
        let (_root, store) = corpus_with(&[("a", b"alpha"), ("b", b"beta")]);
        let scratch = store.scratch().unwrap();
        store.stage(OsStr::new("a"), &scratch).unwrap().commit().unwrap();
        assert_eq!(names(&store.entries().unwrap()), ["b"]);
        assert!(scratch.entries().unwrap().is_empty());
    }

    #[test]
    fn dropping_an_unsettled_stage_puts_the_file_back() {
        let (_root, store) = corpus_with(&[("a", b"alpha")]);
        let scratch = store.scratch().unwrap();
        {
            let _staged = store.stage(OsStr::new("a"), &scratch).unwrap();
        }
        assert_eq!(store.read(OsStr::new("a")).unwrap(), b"alpha");
    }

    #[test]
    fn stage_of_missing_file_fails() {
        let (_root, store) = corpus_with(&[]);
        let scratch = store.scratch().unwrap();
        assert!(matches!(
            store.stage(OsStr::new("ghost"), &scratch),
            Err(CorpusError::FileNotFound(_))
        ));
    }

    #[test]
    fn replace_with_swaps_in_scratch_content() {
        let (root, store) = corpus_with(&[("a", b"alpha"), ("b", b"beta")]);
        let scratch = store.scratch().unwrap();
        store.copy_to_scratch(OsStr::new("b"), &scratch).unwrap();
        store.replace_with(scratch).unwrap();

        assert_eq!(names(&store.entries().unwrap()), ["b"]);
        assert_eq!(store.read(OsStr::new("b")).unwrap(), b"beta");
        let leftovers: Vec<_> = fs::read_dir(root.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, [OsString::from("corpus")], "no scratch or retired dirs may remain");
    }

    #[test]
    fn dropped_scratch_leaves_corpus_untouched() {
        let (root, store) = corpus_with(&[("a", b"alpha")]);
        {
            let scratch = store.scratch().unwrap();
            store.copy_to_scratch(OsStr::new("a"), &scratch).unwrap();
            scratch.remove(OsStr::new("a")).unwrap();
        }
        assert_eq!(names(&store.entries().unwrap()), ["a"]);
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 1);
    }

    #[test]
    fn rewrite_truncates_in_place() {
        let (_root, store) = corpus_with(&[("a", b"abcdef")]);
        store.rewrite(OsStr::new("a"), b"abc").unwrap();
        assert_eq!(store.read(OsStr::new("a")).unwrap(), b"abc");
    }

    #[test]
    fn clear_empties_but_keeps_directory() {
        let (_root, store) = corpus_with(&[("a", b"alpha"), ("b", b"beta")]);
        store.clear().unwrap();
        assert!(store.path().is_dir());
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn import_names_by_digest_and_skips_duplicates() {
        let (root, store) = corpus_with(&[]);
        let seeds = root.path().join("seeds");
        fs::create_dir(&seeds).unwrap();
        fs::write(seeds.join("one"), b"same").unwrap();
        fs::write(seeds.join("two"), b"same").unwrap();
        fs::write(seeds.join("three"), b"different").unwrap();

        assert_eq!(store.import(&seeds).unwrap(), 2);
        let expected = format!("{:x}", md5::compute(b"same"));
        assert_eq!(store.read(OsStr::new(&expected)).unwrap(), b"same");
        assert_eq!(store.import(&seeds.join("three")).unwrap(), 0);
        assert_eq!(store.size().unwrap().files, 2);
    }

    #[test]
    fn size_delta_is_signed() {
        let now = CorpusSize { files: 2, bytes: 10 };
        let before = CorpusSize { files: 5, bytes: 4 };
        assert_eq!(now.delta(&before), (-3, 6));
    }
}
