//! Append-only, compressed per-run logs.
//!
//! Every run writes a directory `log/<YYYY>/<MM>/<handle>` where the
//! handle is the UTC start time formatted `%Y-%m-%dZ%H-%M-%S`. The
//! directory holds an uncompressed JSON `meta` sidecar, a bz2-compressed
//! newline-delimited JSON `log` part, and any number of extra parts such
//! as profile snapshots.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write as _};
use std::path::{Path, PathBuf};

use bzip2::Compression;
use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use chrono::Utc;
use serde_json::{Map, Value, json};

use crate::workdir::Workdir;

pub const FORMAT_REVISION: u64 = 2;

/// Maps a result line before it is written; returning `None` drops the
/// line. Modes use this to divert certificate chains into the CertDB.
pub type LogFilter = Box<dyn FnMut(Value) -> Option<Value> + Send>;

#[derive(Debug, thiserror::Error)]
pub enum RunLogError {
    #[error("run log `{handle}`: {source}")]
    Io {
        handle: String,
        #[source]
        source: io::Error,
    },
    #[error("JSON error in run log `{handle}` line {line}: {source}")]
    Json {
        handle: String,
        line: u64,
        #[source]
        source: serde_json::Error,
    },
    #[error("run log `{handle}` is not in a state that allows `{op}`")]
    InvalidState { handle: String, op: &'static str },
    #[error("malformed run log handle `{0}`")]
    BadHandle(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Fresh,
    Running,
    Stopped,
}

/// Directory of all run logs below the workdir.
pub struct RunLogDB {
    log_dir: PathBuf,
}

impl RunLogDB {
    pub fn open(workdir: &Workdir) -> io::Result<Self> {
        let log_dir = workdir.log_dir();
        std::fs::create_dir_all(&log_dir)?;
        Ok(Self { log_dir })
    }

    /// `2026-07-31Z16-20-00` lives in `log/2026/07/2026-07-31Z16-20-00`.
    pub fn handle_to_dir(&self, handle: &str) -> Result<PathBuf, RunLogError> {
        let mut parts = handle.split('-');
        let year = parts.next().unwrap_or_default();
        let month = parts.next().unwrap_or_default();
        if year.len() != 4 || month.len() != 2 || !handle.contains('Z') {
            return Err(RunLogError::BadHandle(handle.to_string()));
        }
        Ok(self.log_dir.join(year).join(month).join(handle))
    }

    pub fn exists(&self, handle: &str) -> bool {
        self.handle_to_dir(handle).map(|dir| dir.is_dir()).unwrap_or(false)
    }

    /// Sorted handles of all logs on disk.
    pub fn list(&self) -> Vec<String> {
        let mut handles = Vec::new();
        let years = match std::fs::read_dir(&self.log_dir) {
            Ok(years) => years,
            Err(_) => return handles,
        };
        for year in years.filter_map(|e| e.ok()).map(|e| e.path()).filter(|p| p.is_dir()) {
            let Ok(months) = std::fs::read_dir(&year) else {
                continue;
            };
            for month in months.filter_map(|e| e.ok()).map(|e| e.path()).filter(|p| p.is_dir()) {
                let Ok(runs) = std::fs::read_dir(&month) else {
                    continue;
                };
                for run in runs.filter_map(|e| e.ok()).map(|e| e.path()).filter(|p| p.is_dir()) {
                    if let Some(name) = run.file_name().and_then(|n| n.to_str()) {
                        handles.push(name.to_string());
                    }
                }
            }
        }
        handles.sort();
        handles
    }

    /// Purge a log and all of its parts. There is no undo.
    pub fn delete(&self, handle: &str) -> Result<(), RunLogError> {
        let dir = self.handle_to_dir(handle)?;
        tracing::debug!(handle, "purging run log");
        std::fs::remove_dir_all(&dir).map_err(|source| RunLogError::Io {
            handle: handle.to_string(),
            source,
        })
    }

    /// A fresh write-mode log stamped with the current UTC time.
    pub fn new_log(&self) -> Result<RunLog, RunLogError> {
        let handle = Utc::now().format("%Y-%m-%dZ%H-%M-%S").to_string();
        let dir = self.handle_to_dir(&handle)?;
        Ok(RunLog::new(handle, dir))
    }

    /// A read-mode view of an existing log.
    pub fn read_log(&self, handle: &str) -> Result<RunLog, RunLogError> {
        let dir = self.handle_to_dir(handle)?;
        let mut log = RunLog::new(handle.to_string(), dir);
        log.state = State::Stopped;
        Ok(log)
    }
}

/// A single run's log with its `fresh → running → stopped` lifecycle.
/// Appending is only valid while running, reading only when not.
pub struct RunLog {
    handle: String,
    dir: PathBuf,
    state: State,
    meta: Option<Map<String, Value>>,
    log_lines: u64,
    writer: Option<BzEncoder<File>>,
    filter: Option<LogFilter>,
}

impl RunLog {
    fn new(handle: String, dir: PathBuf) -> Self {
        Self {
            handle,
            dir,
            state: State::Fresh,
            meta: None,
            log_lines: 0,
            writer: None,
            filter: None,
        }
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_running(&self) -> bool {
        self.state == State::Running
    }

    /// Absolute path for an additional part inside the log directory.
    pub fn part_path(&self, part: &str) -> PathBuf {
        self.dir.join(part)
    }

    fn io_err(&self, source: io::Error) -> RunLogError {
        RunLogError::Io {
            handle: self.handle.clone(),
            source,
        }
    }

    /// Begin logging. Writes the initial metadata sidecar and switches
    /// the log to running.
    pub fn start(&mut self, meta: Map<String, Value>) -> Result<(), RunLogError> {
        self.start_with_filter(meta, None)
    }

    pub fn start_with_filter(
        &mut self,
        mut meta: Map<String, Value>,
        filter: Option<LogFilter>,
    ) -> Result<(), RunLogError> {
        if self.state != State::Fresh {
            return Err(RunLogError::InvalidState {
                handle: self.handle.clone(),
                op: "start",
            });
        }
        std::fs::create_dir_all(&self.dir).map_err(|e| self.io_err(e))?;

        meta.insert("format_revision".into(), json!(FORMAT_REVISION));
        meta.insert("run_completed".into(), json!(false));
        meta.insert("log_lines".into(), json!(0));
        self.write_meta_file(&meta)?;
        self.meta = Some(meta);

        let file = File::create(self.part_path("log.bz2")).map_err(|e| self.io_err(e))?;
        self.writer = Some(BzEncoder::new(file, Compression::default()));
        self.filter = filter;
        self.log_lines = 0;
        self.state = State::Running;
        Ok(())
    }

    /// Append one result line. Lines the filter maps to `None` are
    /// dropped without counting.
    pub fn log(&mut self, line: Value) -> Result<(), RunLogError> {
        if self.state != State::Running {
            return Err(RunLogError::InvalidState {
                handle: self.handle.clone(),
                op: "log",
            });
        }
        let line = match self.filter.as_mut() {
            Some(filter) => match filter(line) {
                Some(line) => line,
                None => return Ok(()),
            },
            None => line,
        };
        let Some(writer) = self.writer.as_mut() else {
            return Err(RunLogError::InvalidState {
                handle: self.handle.clone(),
                op: "log",
            });
        };
        let mut buf = serde_json::to_vec(&line).map_err(|source| RunLogError::Json {
            handle: self.handle.clone(),
            line: self.log_lines + 1,
            source,
        })?;
        buf.push(b'\n');
        let handle = self.handle.clone();
        writer.write_all(&buf).map_err(|source| RunLogError::Io {
            handle,
            source,
        })?;
        self.log_lines += 1;
        if let Some(meta) = self.meta.as_mut() {
            meta.insert("log_lines".into(), json!(self.log_lines));
        }
        Ok(())
    }

    /// Merge the extra metadata, mark the run completed, flush all parts
    /// and switch to stopped. Stop-metadata wins over start-metadata.
    pub fn stop(&mut self, extra: Map<String, Value>) -> Result<(), RunLogError> {
        if self.state != State::Running {
            return Err(RunLogError::InvalidState {
                handle: self.handle.clone(),
                op: "stop",
            });
        }
        let mut meta = self.meta.take().unwrap_or_default();
        for (key, value) in extra {
            meta.insert(key, value);
        }
        meta.insert("run_completed".into(), json!(true));
        meta.insert("log_lines".into(), json!(self.log_lines));
        self.write_meta_file(&meta)?;
        self.meta = Some(meta);

        if let Some(writer) = self.writer.take() {
            writer.finish().map_err(|e| self.io_err(e))?;
        }
        self.filter = None;
        self.state = State::Stopped;
        Ok(())
    }

    /// Stop if still running. Safe to call on any state.
    pub fn close(&mut self) -> Result<(), RunLogError> {
        if self.state == State::Running {
            self.stop(Map::new())?;
        }
        Ok(())
    }

    /// Commit partial progress on an interrupted run: flush all parts
    /// but leave `run_completed` false so the log reads as incomplete.
    pub fn abort(&mut self, extra: Map<String, Value>) -> Result<(), RunLogError> {
        if self.state != State::Running {
            return Ok(());
        }
        let mut meta = self.meta.take().unwrap_or_default();
        for (key, value) in extra {
            meta.insert(key, value);
        }
        meta.insert("run_completed".into(), json!(false));
        meta.insert("log_lines".into(), json!(self.log_lines));
        self.write_meta_file(&meta)?;
        self.meta = Some(meta);

        if let Some(writer) = self.writer.take() {
            writer.finish().map_err(|e| self.io_err(e))?;
        }
        self.filter = None;
        self.state = State::Stopped;
        Ok(())
    }

    fn write_meta_file(&self, meta: &Map<String, Value>) -> Result<(), RunLogError> {
        // Sorted keys keep the sidecar diff-friendly.
        let sorted: std::collections::BTreeMap<&String, &Value> = meta.iter().collect();
        let json = serde_json::to_string_pretty(&sorted).map_err(|source| RunLogError::Json {
            handle: self.handle.clone(),
            line: 0,
            source,
        })?;
        std::fs::write(self.part_path("meta"), json).map_err(|e| self.io_err(e))
    }

    /// The log's metadata. While running this is the in-memory state;
    /// otherwise the sidecar is read (once) from disk. An unreadable
    /// sidecar surfaces as `{"CORRUPTED": true}`.
    pub fn get_meta(&mut self) -> &Map<String, Value> {
        if self.meta.is_none() {
            let meta = match std::fs::read_to_string(self.part_path("meta")) {
                Ok(raw) => match serde_json::from_str::<Map<String, Value>>(&raw) {
                    Ok(meta) => meta,
                    Err(err) => {
                        tracing::warn!(handle = self.handle, %err, "corrupted run log metadata");
                        let mut meta = Map::new();
                        meta.insert("CORRUPTED".into(), json!(true));
                        meta
                    }
                },
                Err(err) => {
                    tracing::warn!(handle = self.handle, %err, "unreadable run log metadata");
                    let mut meta = Map::new();
                    meta.insert("CORRUPTED".into(), json!(true));
                    meta
                }
            };
            self.meta = Some(meta);
        }
        self.meta.as_ref().expect("metadata just loaded")
    }

    /// Merge metadata. On a running log the update is deferred until
    /// `stop()`; otherwise the sidecar is rewritten immediately.
    pub fn update_meta(&mut self, extra: Map<String, Value>) -> Result<(), RunLogError> {
        self.get_meta();
        let meta = self.meta.as_mut().expect("metadata loaded");
        for (key, value) in extra {
            meta.insert(key, value);
        }
        if self.state != State::Running {
            let meta = self.meta.clone().expect("metadata loaded");
            self.write_meta_file(&meta)?;
        }
        Ok(())
    }

    pub fn has_finished(&mut self) -> bool {
        if self.is_running() {
            return false;
        }
        self.get_meta()
            .get("run_completed")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Whether the on-disk format matches the current revision. Running
    /// logs are always compatible (we are the writer).
    pub fn is_compatible(&mut self) -> bool {
        if self.is_running() {
            return true;
        }
        self.get_meta()
            .get("format_revision")
            .and_then(Value::as_u64)
            .is_some_and(|revision| revision == FORMAT_REVISION)
    }

    /// Stream the log lines. Truncated logs end early with a warning;
    /// comment lines starting with `#` are skipped.
    pub fn lines(&self) -> Result<LogLines, RunLogError> {
        if self.is_running() {
            return Err(RunLogError::InvalidState {
                handle: self.handle.clone(),
                op: "iterate",
            });
        }
        let file = File::open(self.part_path("log.bz2")).map_err(|source| RunLogError::Io {
            handle: self.handle.clone(),
            source,
        })?;
        Ok(LogLines {
            handle: self.handle.clone(),
            reader: BufReader::new(BzDecoder::new(file)),
            line_number: 0,
        })
    }

    /// Number of result lines. Counted from metadata when the run
    /// completed, otherwise by scanning the log part.
    pub fn len(&mut self) -> Result<u64, RunLogError> {
        if self.is_running() {
            return Err(RunLogError::InvalidState {
                handle: self.handle.clone(),
                op: "len",
            });
        }
        if self.has_finished() {
            if let Some(lines) = self.get_meta().get("log_lines").and_then(Value::as_u64) {
                return Ok(lines);
            }
        }
        tracing::debug!(handle = self.handle, "counting lines in incomplete log");
        let mut count = 0;
        for line in self.lines()? {
            line?;
            count += 1;
        }
        Ok(count)
    }
}

/// Iterator over the JSON lines of a stopped log.
pub struct LogLines {
    handle: String,
    reader: BufReader<BzDecoder<File>>,
    line_number: u64,
}

impl Iterator for LogLines {
    type Item = Result<Value, RunLogError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let mut line = String::new();
            self.line_number += 1;
            match self.reader.read_line(&mut line) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(err) => {
                    // Interrupted runs leave a truncated bz2 stream.
                    tracing::warn!(handle = self.handle, %err, "run log is truncated");
                    return None;
                }
            }
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            return Some(serde_json::from_str(trimmed).map_err(|source| RunLogError::Json {
                handle: self.handle.clone(),
                line: self.line_number,
                source,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_db(dir: &Path) -> RunLogDB {
        RunLogDB::open(&Workdir::new(dir)).expect("open run log db")
    }

    #[test]
    fn lifecycle_and_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(dir.path());

        let mut log = db.new_log().expect("new log");
        let handle = log.handle().to_string();
        assert!(log.log(json!({"n": 0})).is_err(), "logging before start fails");

        let mut meta = Map::new();
        meta.insert("mode".into(), json!("scan"));
        log.start(meta).expect("start");
        assert!(log.is_running());
        assert!(log.lines().is_err(), "iterating a running log fails");
        assert!(log.len().is_err(), "len of a running log fails");

        for n in 0..5 {
            log.log(json!({"n": n})).expect("log line");
        }
        let mut stop_meta = Map::new();
        stop_meta.insert("mode".into(), json!("scan2"));
        log.stop(stop_meta).expect("stop");
        assert!(!log.is_running());
        assert!(log.start(Map::new()).is_err(), "stopped logs can't restart");

        let mut read = db.read_log(&handle).expect("read log");
        assert!(read.is_compatible());
        assert!(read.has_finished());
        assert_eq!(read.len().expect("len"), 5);
        assert_eq!(
            read.get_meta().get("mode"),
            Some(&json!("scan2")),
            "stop metadata wins"
        );
        let lines: Vec<Value> = read.lines().expect("lines").map(|l| l.expect("line")).collect();
        assert_eq!(lines.len(), 5);
        for (n, line) in lines.iter().enumerate() {
            assert_eq!(line.get("n").and_then(Value::as_u64), Some(n as u64));
        }

        assert!(db.exists(&handle));
        assert_eq!(db.list(), vec![handle.clone()]);
        db.delete(&handle).expect("delete");
        assert!(!db.exists(&handle));
    }

    #[test]
    fn log_filter_maps_and_drops() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(dir.path());
        let mut log = db.new_log().expect("new log");
        let handle = log.handle().to_string();
        log.start_with_filter(
            Map::new(),
            Some(Box::new(|line: Value| {
                if line.get("drop").is_some() {
                    None
                } else {
                    Some(json!({"wrapped": line}))
                }
            })),
        )
        .expect("start");
        log.log(json!({"keep": 1})).expect("log");
        log.log(json!({"drop": 1})).expect("log");
        log.stop(Map::new()).expect("stop");

        let mut read = db.read_log(&handle).expect("read");
        assert_eq!(read.len().expect("len"), 1);
        let lines: Vec<Value> = read.lines().expect("lines").map(|l| l.expect("line")).collect();
        assert!(lines[0].get("wrapped").is_some());
    }

    #[test]
    fn aborted_runs_read_as_incomplete() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(dir.path());
        let mut log = db.new_log().expect("new log");
        let handle = log.handle().to_string();
        log.start(Map::new()).expect("start");
        for n in 0..3 {
            log.log(json!({"n": n})).expect("log");
        }
        log.abort(Map::new()).expect("abort");

        let mut read = db.read_log(&handle).expect("read");
        assert!(!read.has_finished(), "aborted runs are incomplete");
        assert!(read.is_compatible());
        assert_eq!(read.len().expect("len"), 3, "flushed lines survive the abort");
    }

    #[test]
    fn incompatible_revision_is_detected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(dir.path());
        let mut log = db.new_log().expect("new log");
        let handle = log.handle().to_string();
        log.start(Map::new()).expect("start");
        log.stop(Map::new()).expect("stop");

        let mut downgrade = Map::new();
        downgrade.insert("format_revision".into(), json!(1));
        let mut log = db.read_log(&handle).expect("read");
        log.update_meta(downgrade).expect("update meta");

        let mut reopened = db.read_log(&handle).expect("reopen");
        assert!(!reopened.is_compatible());
    }

    #[test]
    fn corrupted_meta_is_flagged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(dir.path());
        let mut log = db.new_log().expect("new log");
        let handle = log.handle().to_string();
        log.start(Map::new()).expect("start");
        log.stop(Map::new()).expect("stop");

        std::fs::write(log.part_path("meta"), "{ not json").expect("clobber meta");
        let mut read = db.read_log(&handle).expect("read");
        assert_eq!(read.get_meta().get("CORRUPTED"), Some(&json!(true)));
        assert!(!read.is_compatible());
    }

    #[test]
    fn truncated_log_ends_early() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(dir.path());
        let mut log = db.new_log().expect("new log");
        let handle = log.handle().to_string();
        log.start(Map::new()).expect("start");
        for n in 0..2000 {
            log.log(json!({"n": n, "pad": "x".repeat(64)})).expect("log");
        }
        log.stop(Map::new()).expect("stop");

        let part = log.part_path("log.bz2");
        let bytes = std::fs::read(&part).expect("read part");
        std::fs::write(&part, &bytes[..bytes.len() / 2]).expect("truncate part");

        let read = db.read_log(&handle).expect("read");
        let count = read.lines().expect("lines").filter_map(|l| l.ok()).count();
        assert!(count < 2000, "truncated log yields fewer lines");
    }

    #[test]
    fn bad_handles_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(dir.path());
        assert!(db.handle_to_dir("???").is_err());
        assert!(db.handle_to_dir("2026-07-31 16-20-00").is_err());
        assert!(db.handle_to_dir("2026-07-31Z16-20-00").is_ok());
    }
}
