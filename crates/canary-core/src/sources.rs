//! Ranked host lists and the CSV database format they are stored in.
//!
//! A sources file is a regular CSV with `rank` and `hostname` columns.
//! Its first line may be a `#`-prefixed control line carrying
//! colon-separated keywords (`handle:NAME`, optional `default`) that
//! override how the file is indexed.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fs::File;
use std::io::{BufRead, BufReader, Write as _};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum SourcesError {
    #[error("sources file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("sources file {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("can't write sources to `{0}`: no such directory")]
    BadLocation(PathBuf),
}

/// One row of a sources database. Rank is the position in the source
/// list; the engine carries it through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Host {
    pub rank: u64,
    pub hostname: String,
}

impl Host {
    pub fn new(rank: u64, hostname: impl Into<String>) -> Self {
        Self {
            rank,
            hostname: hostname.into(),
        }
    }
}

/// A set of hosts, unique by hostname. The rank of the first insertion
/// wins on duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostSet {
    ranks: BTreeMap<String, u64>,
}

impl HostSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, host: Host) -> bool {
        match self.ranks.entry(host.hostname) {
            Entry::Vacant(slot) => {
                slot.insert(host.rank);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    pub fn contains(&self, hostname: &str) -> bool {
        self.ranks.contains_key(hostname)
    }

    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Host> + '_ {
        self.ranks
            .iter()
            .map(|(hostname, rank)| Host::new(*rank, hostname.clone()))
    }

    /// Hosts in `self` that are not in `other`, compared by hostname.
    pub fn difference(&self, other: &HostSet) -> HostSet {
        HostSet {
            ranks: self
                .ranks
                .iter()
                .filter(|(hostname, _)| !other.contains(hostname))
                .map(|(hostname, rank)| (hostname.clone(), *rank))
                .collect(),
        }
    }

    pub fn union_with(&mut self, other: &HostSet) {
        for host in other.iter() {
            self.insert(host);
        }
    }

    /// Hosts ordered by rank, hostname as tie breaker.
    pub fn by_rank(&self) -> Vec<Host> {
        let mut hosts: Vec<Host> = self.iter().collect();
        hosts.sort_by(|a, b| a.rank.cmp(&b.rank).then_with(|| a.hostname.cmp(&b.hostname)));
        hosts
    }
}

impl FromIterator<Host> for HostSet {
    fn from_iter<I: IntoIterator<Item = Host>>(iter: I) -> Self {
        let mut set = HostSet::new();
        for host in iter {
            set.insert(host);
        }
        set
    }
}

/// Control-line metadata parsed from the first line of a sources file.
pub(crate) fn parse_csv_header(path: &Path) -> Result<(String, bool), SourcesError> {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let file = File::open(path).map_err(|source| SourcesError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut line = String::new();
    BufReader::new(file)
        .read_line(&mut line)
        .map_err(|source| SourcesError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(parse_header_line(&line, stem))
}

pub(crate) fn parse_header_line(line: &str, fallback_handle: String) -> (String, bool) {
    let mut handle = fallback_handle;
    let mut is_default = false;
    if let Some(keywords) = line.trim().strip_prefix('#') {
        let keywords: Vec<&str> = keywords.split(':').collect();
        if keywords.contains(&"handle") {
            if let Some(last) = keywords.last() {
                handle = (*last).to_string();
            }
        }
        if keywords.contains(&"default") {
            is_default = true;
        }
    }
    (handle, is_default)
}

/// An ordered host list with database metadata.
#[derive(Debug, Clone)]
pub struct Sources {
    pub handle: String,
    pub is_default: bool,
    rows: Vec<Host>,
}

impl Sources {
    pub fn new(handle: impl Into<String>, is_default: bool) -> Self {
        Self {
            handle: handle.into(),
            is_default,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Host] {
        &self.rows
    }

    pub fn push(&mut self, host: Host) {
        self.rows.push(host);
    }

    pub fn sort(&mut self) {
        self.rows.sort_by_key(|row| row.rank);
    }

    pub fn trim(&mut self, limit: usize) {
        self.rows.truncate(limit);
    }

    /// Replace the rows with the contents of a host set, in rank order.
    pub fn from_set(&mut self, set: &HostSet) {
        self.rows = set.by_rank();
    }

    pub fn as_set(&self) -> HostSet {
        self.rows.iter().cloned().collect()
    }

    /// A chunk of rows as a host set. `end` is clamped to the row count.
    pub fn as_set_range(&self, start: usize, end: usize) -> HostSet {
        let end = end.min(self.rows.len());
        if start >= end {
            return HostSet::new();
        }
        self.rows[start..end].iter().cloned().collect()
    }

    /// Load a sources CSV, honoring its control line.
    pub fn load(path: &Path) -> Result<Self, SourcesError> {
        let (handle, is_default) = parse_csv_header(path)?;
        tracing::debug!(handle, path = %path.display(), "reading sources");

        let mut reader = csv::ReaderBuilder::new()
            .comment(Some(b'#'))
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(|source| SourcesError::Csv {
                path: path.to_path_buf(),
                source,
            })?;

        let mut rows = Vec::new();
        for row in reader.deserialize::<Host>() {
            rows.push(row.map_err(|source| SourcesError::Csv {
                path: path.to_path_buf(),
                source,
            })?);
        }
        Ok(Self {
            handle,
            is_default,
            rows,
        })
    }

    /// Load a sources CSV from an in-memory string, as used for the
    /// bundled databases shipped with the harness.
    pub fn load_str(content: &str, fallback_handle: &str) -> Result<Self, SourcesError> {
        let first_line = content.lines().next().unwrap_or_default();
        let (handle, is_default) = parse_header_line(first_line, fallback_handle.to_string());

        let mut reader = csv::ReaderBuilder::new()
            .comment(Some(b'#'))
            .trim(csv::Trim::All)
            .from_reader(content.as_bytes());

        let mut rows = Vec::new();
        for row in reader.deserialize::<Host>() {
            rows.push(row.map_err(|source| SourcesError::Csv {
                path: PathBuf::from(format!("<bundled:{fallback_handle}>")),
                source,
            })?);
        }
        Ok(Self {
            handle,
            is_default,
            rows,
        })
    }

    /// Load a raw, headerless `rank,hostname` list such as the published
    /// top-sites databases consumed by the srcupdate mode.
    pub fn load_raw(path: &Path, handle: impl Into<String>) -> Result<Self, SourcesError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(|source| SourcesError::Csv {
                path: path.to_path_buf(),
                source,
            })?;

        let mut rows = Vec::new();
        for row in reader.deserialize::<(u64, String)>() {
            let (rank, hostname) = row.map_err(|source| SourcesError::Csv {
                path: path.to_path_buf(),
                source,
            })?;
            rows.push(Host::new(rank, hostname));
        }
        Ok(Self {
            handle: handle.into(),
            is_default: false,
            rows,
        })
    }

    /// Write the list as CSV. A directory location gets `<handle>.csv`
    /// appended; otherwise the location is used as the file name and its
    /// parent must exist.
    pub fn write(&self, location: &Path) -> Result<PathBuf, SourcesError> {
        let file_name = if location.is_dir() {
            location.join(format!("{}.csv", self.handle))
        } else if location.parent().is_some_and(Path::is_dir) {
            location.to_path_buf()
        } else {
            return Err(SourcesError::BadLocation(location.to_path_buf()));
        };
        tracing::debug!(handle = self.handle, path = %file_name.display(), "writing sources");

        let mut file = File::create(&file_name).map_err(|source| SourcesError::Io {
            path: file_name.clone(),
            source,
        })?;
        let mut keywords: Vec<&str> = Vec::new();
        if self.is_default {
            keywords.push("default");
        }
        keywords.push("handle");
        keywords.push(&self.handle);
        writeln!(file, "#{}", keywords.join(":")).map_err(|source| SourcesError::Io {
            path: file_name.clone(),
            source,
        })?;

        let mut writer = csv::Writer::from_writer(file);
        for row in &self.rows {
            writer.serialize(row).map_err(|source| SourcesError::Csv {
                path: file_name.clone(),
                source,
            })?;
        }
        writer.flush().map_err(|source| SourcesError::Io {
            path: file_name.clone(),
            source,
        })?;
        Ok(file_name)
    }

    /// Iterate the rows in bounded chunks. The effective chunk size is
    /// `max(chunk_size, min_chunk_size)`; the final chunk may be smaller.
    pub fn iter_chunks(&self, chunk_size: usize, min_chunk_size: usize) -> ChunkIter<'_> {
        ChunkIter {
            rows: &self.rows,
            pos: 0,
            chunk_size: chunk_size.max(min_chunk_size).max(1),
        }
    }
}

/// Chunked cursor over a [`Sources`] row list. Chunks are disjoint and
/// cover the rows exactly once; the size can be overridden per call.
pub struct ChunkIter<'a> {
    rows: &'a [Host],
    pos: usize,
    chunk_size: usize,
}

impl ChunkIter<'_> {
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn next_chunk(&mut self) -> Option<HostSet> {
        self.next_chunk_sized(self.chunk_size)
    }

    pub fn next_chunk_sized(&mut self, size: usize) -> Option<HostSet> {
        if self.pos >= self.rows.len() {
            return None;
        }
        let end = (self.pos + size.max(1)).min(self.rows.len());
        let chunk = self.rows[self.pos..end].iter().cloned().collect();
        self.pos = end;
        Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Sources {
        let mut src = Sources::new("foo", false);
        src.push(Host::new(1, "mozilla.org"));
        src.push(Host::new(2, "mozilla.com"));
        src.push(Host::new(3, "addons.mozilla.org"));
        src.push(Host::new(4, "irc.mozilla.org"));
        src.push(Host::new(5, "firefox.com"));
        src
    }

    #[test]
    fn set_uniqueness_and_difference() {
        let mut set = HostSet::new();
        assert!(set.insert(Host::new(1, "a.example")));
        assert!(!set.insert(Host::new(9, "a.example")));
        set.insert(Host::new(2, "b.example"));

        let mut other = HostSet::new();
        other.insert(Host::new(2, "b.example"));

        let diff = set.difference(&other);
        assert_eq!(diff.len(), 1);
        assert!(diff.contains("a.example"));
        // rank of the first insertion is preserved
        assert_eq!(diff.by_rank()[0].rank, 1);
    }

    #[test]
    fn sorting_and_trimming() {
        let mut src = Sources::new("foo", false);
        src.push(Host::new(3, "c.example"));
        src.push(Host::new(1, "a.example"));
        src.push(Host::new(2, "b.example"));
        src.sort();
        assert_eq!(
            src.rows().iter().map(|r| r.rank).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        src.trim(2);
        assert_eq!(src.len(), 2);
    }

    #[test]
    fn chunking_covers_rows_exactly_once() {
        let src = sample();
        let mut chunks = src.iter_chunks(2, 1);
        let mut read = HostSet::new();
        let mut lengths = Vec::new();
        while let Some(chunk) = chunks.next_chunk() {
            lengths.push(chunk.len());
            read.union_with(&chunk);
        }
        assert_eq!(lengths, vec![2, 2, 1]);
        assert_eq!(read, src.as_set());
        assert!(chunks.next_chunk().is_none());
        assert!(chunks.next_chunk().is_none());
    }

    #[test]
    fn chunking_respects_minimum_and_overrides() {
        let src = sample();
        let mut chunks = src.iter_chunks(2, 100);
        assert_eq!(chunks.chunk_size(), 100);
        let chunk = chunks.next_chunk().expect("one chunk");
        assert_eq!(chunk.len(), 5, "chunks are not larger than remaining data");

        let mut chunks = src.iter_chunks(10, 1);
        assert_eq!(chunks.next_chunk_sized(1).map(|c| c.len()), Some(1));
        assert_eq!(chunks.next_chunk_sized(2).map(|c| c.len()), Some(2));
        assert_eq!(chunks.next_chunk_sized(3).map(|c| c.len()), Some(2));
        assert!(chunks.next_chunk().is_none());
    }

    #[test]
    fn csv_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut src = sample();
        src.is_default = true;
        let path = src.write(dir.path()).expect("write");
        assert_eq!(path.file_name().and_then(|n| n.to_str()), Some("foo.csv"));

        let read = Sources::load(&path).expect("load");
        assert_eq!(read.handle, "foo");
        assert!(read.is_default);
        assert_eq!(read.rows(), src.rows());
    }

    #[test]
    fn header_keywords() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("list.csv");
        std::fs::write(&path, "#default:handle:top\nrank,hostname\n1,mozilla.org\n").expect("write");
        let src = Sources::load(&path).expect("load");
        assert_eq!(src.handle, "top");
        assert!(src.is_default);
        assert_eq!(src.len(), 1);

        let bare = dir.path().join("bare.csv");
        std::fs::write(&bare, "rank,hostname\n1,mozilla.org\n").expect("write");
        let src = Sources::load(&bare).expect("load");
        assert_eq!(src.handle, "bare");
        assert!(!src.is_default);
    }
}
