//! Index over the available sources databases: the lists bundled with
//! the harness plus any CSV files in the workdir's `sources` directory.
//! Workdir files shadow bundled lists with the same handle.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::sources::{Sources, SourcesError, parse_csv_header, parse_header_line};
use crate::workdir::Workdir;

const BUNDLED: &[(&str, &str)] = &[
    ("top", include_str!("../sources/top.csv")),
    ("smoke", include_str!("../sources/smoke.csv")),
    ("revoked", include_str!("../sources/revoked.csv")),
];

enum Origin {
    Bundled(&'static str),
    File(PathBuf),
}

pub struct SourcesDB {
    index: BTreeMap<String, Origin>,
    pub default: String,
}

impl SourcesDB {
    pub fn open(workdir: &Workdir) -> Result<Self, SourcesError> {
        let mut index = BTreeMap::new();
        let mut default = None;

        for (fallback, content) in BUNDLED {
            let first_line = content.lines().next().unwrap_or_default();
            let (handle, is_default) = parse_header_line(first_line, (*fallback).to_string());
            if is_default {
                default = Some(handle.clone());
            }
            index.insert(handle, Origin::Bundled(content));
        }

        let override_dir = workdir.sources_dir();
        if override_dir.is_dir() {
            let mut files: Vec<PathBuf> = std::fs::read_dir(&override_dir)
                .map_err(|source| SourcesError::Io {
                    path: override_dir.clone(),
                    source,
                })?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.extension().is_some_and(|ext| ext == "csv"))
                .collect();
            files.sort();

            for path in files {
                let (handle, is_default) = parse_csv_header(&path)?;
                tracing::debug!(handle, path = %path.display(), "indexing sources database");
                if is_default {
                    default = Some(handle.clone());
                }
                index.insert(handle, Origin::File(path));
            }
        }

        let default = default
            .or_else(|| index.keys().next().cloned())
            .unwrap_or_default();
        Ok(Self { index, default })
    }

    /// Sorted list of known database handles.
    pub fn list(&self) -> Vec<String> {
        self.index.keys().cloned().collect()
    }

    pub fn exists(&self, handle: &str) -> bool {
        self.index.contains_key(handle)
    }

    /// Read the database behind a handle. An unknown handle yields an
    /// empty list, matching how missing databases are treated upstream.
    pub fn read(&self, handle: &str) -> Result<Sources, SourcesError> {
        match self.index.get(handle) {
            Some(Origin::Bundled(content)) => {
                let mut sources = Sources::load_str(content, handle)?;
                sources.is_default = handle == self.default;
                Ok(sources)
            }
            Some(Origin::File(path)) => {
                let mut sources = Sources::load(path)?;
                sources.is_default = handle == self.default;
                Ok(sources)
            }
            None => {
                tracing::error!(handle, "unknown sources database handle, continuing with empty set");
                Ok(Sources::new(handle, false))
            }
        }
    }

    /// Write a database into the workdir's `sources` directory, where it
    /// shadows any bundled list with the same handle.
    pub fn write(&self, workdir: &Workdir, sources: &Sources) -> Result<PathBuf, SourcesError> {
        let dir = workdir.sources_dir();
        std::fs::create_dir_all(&dir).map_err(|source| SourcesError::Io {
            path: dir.clone(),
            source,
        })?;
        sources.write(&dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::Host;

    #[test]
    fn bundled_lists_are_indexed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let workdir = Workdir::new(dir.path());
        let db = SourcesDB::open(&workdir).expect("open");

        assert_eq!(db.list(), vec!["revoked", "smoke", "top"]);
        assert_eq!(db.default, "top");
        assert!(db.read("top").expect("read").len() > 0);
        assert!(db.read("revoked").expect("read").len() > 0);
    }

    #[test]
    fn workdir_files_shadow_bundled_lists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let workdir = Workdir::new(dir.path());

        let mut shadow = Sources::new("top", true);
        shadow.push(Host::new(1, "only.example"));
        SourcesDB::open(&workdir)
            .expect("open")
            .write(&workdir, &shadow)
            .expect("write");

        let db = SourcesDB::open(&workdir).expect("reopen");
        assert_eq!(db.list(), vec!["revoked", "smoke", "top"]);
        let top = db.read("top").expect("read");
        assert_eq!(top.len(), 1);
        assert_eq!(top.rows()[0].hostname, "only.example");
        assert!(top.is_default);
    }

    #[test]
    fn unknown_handle_reads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = SourcesDB::open(&Workdir::new(dir.path())).expect("open");
        let sources = db.read("nosuch").expect("read");
        assert!(sources.is_empty());
    }
}
