//! Interface to the external OneCRL revocation-list toolchain.
//!
//! The list itself is produced by a Go tool maintained out of tree; the
//! harness only installs it into the workdir's GOPATH, runs it and
//! caches the resulting revocations file for an hour.

use std::path::PathBuf;
use std::time::Duration;

use tlscanary_core::Workdir;
use tlscanary_core::cache::DiskCache;

use crate::cli::OneCrlEnv;
use crate::error::CanaryError;

const CACHE_MAX_AGE: Duration = Duration::from_secs(60 * 60);
const ONECRL_TOOL_PACKAGE: &str = "github.com/mozmark/OneCRL-Tools/oneCRL2RevocationsTxt@latest";
const ONECRL_TOOL_BIN: &str = "oneCRL2RevocationsTxt";

/// Fetch the revocations file for an environment, through the cache.
pub async fn get_list(env: OneCrlEnv, workdir: &Workdir) -> Result<PathBuf, CanaryError> {
    let cache = DiskCache::open(workdir.cache_dir(), CACHE_MAX_AGE, true)
        .map_err(|err| CanaryError::Setup(format!("can't open download cache: {err}")))?;
    let cache_id = format!("{env}_revocations.txt");

    if cache.contains(&cache_id) {
        tracing::warn!(id = cache_id, "using cached OneCRL revocations data");
        return Ok(cache.entry(&cache_id));
    }

    let go_bin = find_in_path("go").ok_or_else(|| CanaryError::ExternalTool("go".to_string()))?;
    tracing::debug!(go = %go_bin.display(), "using Go toolchain");

    let go_path = workdir.go_dir();
    std::fs::create_dir_all(&go_path)
        .map_err(|err| CanaryError::Setup(format!("can't create GOPATH: {err}")))?;

    let install = tokio::process::Command::new(&go_bin)
        .arg("install")
        .arg(ONECRL_TOOL_PACKAGE)
        .env("GOPATH", &go_path)
        .env("GOBIN", go_path.join("bin"))
        .status()
        .await
        .map_err(|err| CanaryError::Setup(format!("can't run Go: {err}")))?;
    if !install.success() {
        return Err(CanaryError::Setup(format!(
            "can't install Go package `{ONECRL_TOOL_PACKAGE}`"
        )));
    }

    let tool = go_path.join("bin").join(ONECRL_TOOL_BIN);
    if !tool.is_file() {
        return Err(CanaryError::ExternalTool(ONECRL_TOOL_BIN.to_string()));
    }

    let output = tokio::process::Command::new(&tool)
        .arg("--onecrlenv")
        .arg(env.to_string())
        .env("GOPATH", &go_path)
        .output()
        .await
        .map_err(|err| CanaryError::Setup(format!("can't run `{ONECRL_TOOL_BIN}`: {err}")))?;
    if !output.status.success() {
        return Err(CanaryError::Setup(format!(
            "could not fetch revocations data: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    // The tool does not signal network failures; an empty result is one.
    if output.stdout.is_empty() {
        return Err(CanaryError::Setup(
            "revocations data was empty, likely a network failure".to_string(),
        ));
    }

    let cache_file = cache.entry(&cache_id);
    tracing::debug!(path = %cache_file.display(), "caching OneCRL revocations data");
    std::fs::write(&cache_file, &output.stdout)
        .map_err(|err| CanaryError::Setup(format!("can't cache revocations data: {err}")))?;
    Ok(cache_file)
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}
