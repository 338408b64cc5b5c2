//! Working directory layout. Everything the harness persists lives in
//! one directory tree, `$HOME/.tlscanary` unless overridden.

use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Workdir {
    root: PathBuf,
}

impl Workdir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Default location, `$HOME/.tlscanary`. Falls back to the current
    /// directory when the home directory cannot be determined.
    pub fn default_root() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tlscanary")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("log")
    }

    pub fn sources_dir(&self) -> PathBuf {
        self.root.join("sources")
    }

    pub fn certs_dir(&self) -> PathBuf {
        self.root.join("certs")
    }

    /// GOPATH handed to the external revocation-list toolchain.
    pub fn go_dir(&self) -> PathBuf {
        self.root.join("go")
    }

    pub fn tags_file(&self) -> PathBuf {
        self.root.join("tags.json")
    }

    pub fn ensure(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.root)
    }
}
