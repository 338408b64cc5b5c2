//! Time-bounded disk cache for downloaded and extracted artifacts.
//!
//! Entries are plain files named by their cache id. Staleness is judged
//! by file modification time; purging only happens when asked for.

use std::io;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

pub struct DiskCache {
    root: PathBuf,
    maximum_age: Duration,
}

impl DiskCache {
    /// Open (and create) a cache directory. With `purge` set, stale
    /// entries are removed right away.
    pub fn open(root: impl Into<PathBuf>, maximum_age: Duration, purge: bool) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let cache = Self { root, maximum_age };
        if purge {
            cache.purge(None)?;
        }
        Ok(cache)
    }

    /// Path an entry with this id lives at (whether or not it exists).
    pub fn entry(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entry(id).is_file()
    }

    pub fn list(&self) -> io::Result<Vec<String>> {
        let mut ids: Vec<String> = std::fs::read_dir(&self.root)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Remove entries older than `maximum_age` (or the cache default).
    pub fn purge(&self, maximum_age: Option<Duration>) -> io::Result<()> {
        let maximum_age = maximum_age.unwrap_or(self.maximum_age);
        let now = SystemTime::now();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age >= maximum_age {
                tracing::debug!(path = %path.display(), "purging stale cache entry");
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    /// Remove a single entry. Unknown ids are ignored.
    pub fn delete(&self, id: &str) -> io::Result<()> {
        let path = self.entry(id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub fn clear(&self) -> io::Result<()> {
        for id in self.list()? {
            self.delete(&id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::FileTimes;

    fn backdate(path: &std::path::Path, age: Duration) {
        let stamp = SystemTime::now() - age;
        let file = std::fs::File::options()
            .write(true)
            .open(path)
            .expect("open for utime");
        file.set_times(FileTimes::new().set_accessed(stamp).set_modified(stamp))
            .expect("set mtime");
    }

    #[test]
    fn cache_lifecycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("test_cache");
        let cache = DiskCache::open(&root, Duration::from_secs(60), false).expect("open");

        assert!(root.is_dir(), "cache creates its directory");
        assert!(cache.list().expect("list").is_empty());

        std::fs::write(cache.entry("foo"), "foo").expect("write foo");
        std::fs::write(cache.entry("bar"), "bar").expect("write bar");
        assert!(cache.contains("foo"));
        assert!(!cache.contains("baz"));
        assert_eq!(cache.list().expect("list"), vec!["bar", "foo"]);

        // Make "foo" stale; "bar" stays fresh.
        backdate(&cache.entry("foo"), Duration::from_secs(120));

        cache.purge(Some(Duration::from_secs(600))).expect("purge");
        assert!(cache.contains("foo"), "purge only affects stale files");

        cache.purge(None).expect("purge with default age");
        assert!(!cache.contains("foo"));
        assert!(cache.contains("bar"), "purge does not overly purge");

        cache.delete("nosuch").expect("deleting unknown ids is fine");
        cache.clear().expect("clear");
        assert!(cache.list().expect("list").is_empty());
    }
}
