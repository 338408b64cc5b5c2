//! Content-addressed store for DER certificates collected during scans.
//!
//! Certificates are keyed by the SHA-256 of their DER bytes and stored
//! under a four-level fan-out of one hex character per level, e.g.
//! `ca/fe/ba/be/cafebabe….der`.

use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

const FANOUT_DEPTH: usize = 4;

pub struct CertDB {
    root: PathBuf,
}

impl CertDB {
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Store DER bytes and return their content id. Storing the same
    /// bytes again is a no-op returning the same id.
    pub fn put(&self, der: &[u8]) -> io::Result<String> {
        let id = hash_id(der);
        let path = self.root.join(rel_path(&id));
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, der)?;
            tracing::debug!(path = %path.display(), "stored certificate");
        }
        Ok(id)
    }

    pub fn exists(&self, id: &str) -> bool {
        self.root.join(rel_path(id)).is_file()
    }

    pub fn abs_path(&self, id: &str) -> Option<PathBuf> {
        let path = self.root.join(rel_path(id));
        path.is_file().then_some(path)
    }

    pub fn rel_path(&self, id: &str) -> Option<PathBuf> {
        self.exists(id).then(|| rel_path(id))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn hash_id(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    let mut id = String::with_capacity(digest.len() * 2);
    for byte in digest {
        id.push_str(&format!("{byte:02x}"));
    }
    id
}

fn rel_path(id: &str) -> PathBuf {
    let mut path = PathBuf::new();
    for prefix in id.chars().take(FANOUT_DEPTH) {
        path.push(prefix.to_string());
    }
    path.push(format!("{id}.der"));
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_is_idempotent_and_content_addressed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = CertDB::open(dir.path().join("certs")).expect("open");

        let id = db.put(b"not actually DER").expect("put");
        assert_eq!(id.len(), 64);
        assert!(db.exists(&id));

        let again = db.put(b"not actually DER").expect("re-put");
        assert_eq!(id, again);

        let path = db.abs_path(&id).expect("path");
        let stored = std::fs::read(&path).expect("read back");
        assert_eq!(db.put(&stored).expect("round trip"), id);

        let rel = db.rel_path(&id).expect("rel path");
        assert_eq!(
            rel.iter().count(),
            FANOUT_DEPTH + 1,
            "four fan-out levels plus the file"
        );
        assert!(!db.exists("0000"));
    }
}
