//! Tag index mapping user-chosen tags to run-log handles, persisted as
//! `tags.json` in the workdir root.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::PathBuf;

use crate::workdir::Workdir;

#[derive(Debug, thiserror::Error)]
pub enum TagsError {
    #[error("tags file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("tags file {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid tag `{0}`")]
    InvalidTag(String),
}

pub struct TagsDB {
    path: PathBuf,
    tags: BTreeMap<String, BTreeSet<String>>,
}

impl TagsDB {
    pub fn open(workdir: &Workdir) -> Result<Self, TagsError> {
        let path = workdir.tags_file();
        let tags = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|source| TagsError::Json {
                path: path.clone(),
                source,
            })?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(TagsError::Io { path, source }),
        };
        Ok(Self { path, tags })
    }

    fn save(&self) -> Result<(), TagsError> {
        // Drop tags without any handle left before persisting.
        let for_disk: BTreeMap<&String, &BTreeSet<String>> = self
            .tags
            .iter()
            .filter(|(_, handles)| !handles.is_empty())
            .collect();
        let json =
            serde_json::to_string_pretty(&for_disk).map_err(|source| TagsError::Json {
                path: self.path.clone(),
                source,
            })?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|source| TagsError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|source| TagsError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }

    /// A usable tag is alphanumeric, not purely numeric, has no
    /// whitespace and is not the reserved word `all`.
    pub fn is_valid_tag(tag: &str) -> bool {
        !tag.is_empty()
            && tag != "all"
            && tag.chars().all(|c| c.is_ascii_alphanumeric())
            && !tag.chars().all(|c| c.is_ascii_digit())
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.tags.get(tag).is_some_and(|handles| !handles.is_empty())
    }

    pub fn exists(&self, tag: &str, handle: &str) -> bool {
        self.tags.get(tag).is_some_and(|handles| handles.contains(handle))
    }

    /// All tags that have at least one associated handle, sorted.
    pub fn list_tags(&self) -> Vec<String> {
        self.tags
            .iter()
            .filter(|(_, handles)| !handles.is_empty())
            .map(|(tag, _)| tag.clone())
            .collect()
    }

    /// Handles associated with a tag, sorted. Unknown tags yield an
    /// empty list.
    pub fn list(&self, tag: &str) -> Vec<String> {
        self.tags
            .get(tag)
            .map(|handles| handles.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn handle_to_tags(&self, handle: &str) -> Vec<String> {
        self.tags
            .iter()
            .filter(|(_, handles)| handles.contains(handle))
            .map(|(tag, _)| tag.clone())
            .collect()
    }

    pub fn add(&mut self, tag: &str, handle: &str) -> Result<(), TagsError> {
        if !Self::is_valid_tag(tag) {
            return Err(TagsError::InvalidTag(tag.to_string()));
        }
        self.tags
            .entry(tag.to_string())
            .or_default()
            .insert(handle.to_string());
        self.save()
    }

    pub fn remove(&mut self, tag: &str, handle: &str) -> Result<(), TagsError> {
        let Some(handles) = self.tags.get_mut(tag) else {
            tracing::warn!(tag, "tag does not exist");
            return Ok(());
        };
        if !handles.remove(handle) {
            tracing::warn!(tag, handle, "handle is not associated with tag");
            return Ok(());
        }
        if handles.is_empty() {
            self.tags.remove(tag);
        }
        self.save()
    }

    /// Delete a tag together with all of its handle associations.
    pub fn drop(&mut self, tag: &str) -> Result<(), TagsError> {
        if self.tags.remove(tag).is_none() {
            tracing::debug!(tag, "not dropping non-existent tag");
            return Ok(());
        }
        self.save()
    }

    /// Remove all associations pointing at handles that no longer exist.
    pub fn remove_dangling(&mut self, existing: &[String]) -> Result<(), TagsError> {
        let mut changed = false;
        for handles in self.tags.values_mut() {
            let before = handles.len();
            handles.retain(|handle| existing.contains(handle));
            changed |= handles.len() != before;
        }
        self.tags.retain(|_, handles| !handles.is_empty());
        if changed {
            self.save()?;
        }
        Ok(())
    }
}

/// Tags derived from a run log's state instead of being stored:
/// completeness, format compatibility and the run mode.
pub fn standard_tags(log: &mut crate::runlog::RunLog) -> Vec<String> {
    let mut tags = Vec::new();
    if log.has_finished() {
        tags.push("complete".to_string());
    } else {
        tags.push("incomplete".to_string());
    }
    if !log.is_compatible() {
        tags.push("incompatible".to_string());
    }
    if let Some(mode) = log.get_meta().get("mode").and_then(serde_json::Value::as_str) {
        tags.push(mode.to_string());
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runlog::RunLogDB;
    use serde_json::{Map, json};

    fn fresh_db(dir: &std::path::Path) -> TagsDB {
        TagsDB::open(&Workdir::new(dir)).expect("open tags db")
    }

    #[test]
    fn add_remove_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut db = fresh_db(dir.path());

        db.add("foo", "A").expect("add A");
        db.add("foo", "B").expect("add B");
        db.remove("foo", "B").expect("remove B");
        assert_eq!(db.list("foo"), vec!["A"]);

        db.drop("foo").expect("drop");
        assert!(!db.contains("foo"));

        // Reopen: the dropped tag must be gone from disk too.
        let db = fresh_db(dir.path());
        assert!(!db.contains("foo"));
    }

    #[test]
    fn persistence_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut db = fresh_db(dir.path());
        db.add("nightly", "2026-01-01Z00-00-00").expect("add");
        db.add("keep", "2026-01-01Z00-00-00").expect("add");

        let db = fresh_db(dir.path());
        assert_eq!(db.list_tags(), vec!["keep", "nightly"]);
        assert_eq!(
            db.handle_to_tags("2026-01-01Z00-00-00"),
            vec!["keep", "nightly"]
        );
    }

    #[test]
    fn tag_validity() {
        assert!(TagsDB::is_valid_tag("nightly66"));
        assert!(!TagsDB::is_valid_tag("20191231"));
        assert!(!TagsDB::is_valid_tag("has space"));
        assert!(!TagsDB::is_valid_tag("all"));
        assert!(!TagsDB::is_valid_tag(""));
        assert!(!TagsDB::is_valid_tag("dash-ed"));
    }

    #[test]
    fn dangling_refs_are_dropped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut db = fresh_db(dir.path());
        db.add("foo", "A").expect("add");
        db.add("foo", "B").expect("add");
        db.remove_dangling(&["A".to_string()]).expect("cleanup");
        assert_eq!(db.list("foo"), vec!["A"]);
    }

    #[test]
    fn standard_tags_follow_log_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let workdir = Workdir::new(dir.path());
        let run_log_db = RunLogDB::open(&workdir).expect("open run log db");

        let mut log = run_log_db.new_log().expect("new log");
        let handle = log.handle().to_string();
        let mut meta = Map::new();
        meta.insert("mode".into(), json!("scan"));
        log.start(meta).expect("start");
        log.stop(Map::new()).expect("stop");

        let mut read = run_log_db.read_log(&handle).expect("read");
        assert_eq!(standard_tags(&mut read), vec!["complete", "scan"]);

        let mut downgrade = Map::new();
        downgrade.insert("format_revision".into(), json!(1));
        downgrade.insert("run_completed".into(), json!(false));
        read.update_meta(downgrade).expect("update meta");
        let mut reopened = run_log_db.read_log(&handle).expect("reopen");
        assert_eq!(
            standard_tags(&mut reopened),
            vec!["incomplete", "incompatible", "scan"]
        );
    }

    #[test]
    fn invalid_tags_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut db = fresh_db(dir.path());
        assert!(matches!(
            db.add("not a tag", "A"),
            Err(TagsError::InvalidTag(_))
        ));
    }
}
