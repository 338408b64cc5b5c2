//! Shared plumbing for all run modes: build candidates, worker info,
//! profile construction and snapshots, run-log metadata and the
//! progress logger task.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value, json};
use tokio::task::JoinHandle;

use tlscanary_core::Workdir;
use tlscanary_core::certdb::CertDB;
use tlscanary_core::progress::ProgressTracker;
use tlscanary_core::runlog::{LogFilter, RunLog};
use tlscanary_engine::supervisor::WorkerSupervisor;
use tlscanary_engine::wire::{Command, Response};
use tlscanary_engine::{App, StopHandle, WorkerConnection, WorkerMetadata};

use crate::cli::{OneCrlEnv, ScanArgs};
use crate::error::CanaryError;
use crate::one_crl;

const INFO_TIMEOUT: Duration = Duration::from_secs(30);

/// Context handed into every mode: explicit state instead of process
/// globals. The temporary directory is owned (and removed) by `main`.
pub struct ModeContext {
    pub workdir: Workdir,
    pub tmp_dir: PathBuf,
    pub stop: StopHandle,
}

/// The mode lifecycle. `setup` acquires candidates and profiles, `run`
/// does the scanning, `teardown` releases whatever setup claimed.
pub trait Mode {
    fn name(&self) -> &'static str;

    async fn setup(&mut self, ctx: &ModeContext) -> Result<(), CanaryError>;

    async fn run(&mut self, ctx: &ModeContext) -> Result<(), CanaryError>;

    async fn teardown(&mut self, _ctx: &ModeContext) -> Result<(), CanaryError> {
        Ok(())
    }
}

/// Drive a mode through its lifecycle. Teardown runs even when the run
/// failed; the run error wins over a teardown error.
pub async fn drive<M: Mode>(mode: &mut M, ctx: &ModeContext) -> Result<(), CanaryError> {
    tracing::debug!(mode = mode.name(), "setup");
    mode.setup(ctx).await?;
    tracing::debug!(mode = mode.name(), "run");
    let run_result = mode.run(ctx).await;
    tracing::debug!(mode = mode.name(), "teardown");
    let teardown_result = mode.teardown(ctx).await;
    match run_result {
        Ok(()) => teardown_result,
        Err(err) => {
            if let Err(teardown_err) = teardown_result {
                tracing::warn!(%teardown_err, "teardown failed after run error");
            }
            Err(err)
        }
    }
}

/// Resolve a build directory into an [`App`]. Downloading and archive
/// extraction happen outside the harness; this expects the extracted
/// tree on disk.
pub fn get_test_candidate(build: &Path) -> Result<App, CanaryError> {
    let exe = ["firefox", "firefox-bin", "Contents/MacOS/firefox"]
        .iter()
        .map(|name| build.join(name))
        .find(|path| path.is_file())
        .ok_or_else(|| {
            CanaryError::Setup(format!("no browser executable under `{}`", build.display()))
        })?;
    let gre_dir = exe
        .parent()
        .ok_or_else(|| CanaryError::Setup(format!("bad executable path `{}`", exe.display())))?
        .to_path_buf();
    let app_dir = gre_dir.join("browser");
    tracing::debug!(exe = %exe.display(), "build candidate executable");
    Ok(App::new(exe, gre_dir, app_dir))
}

/// The probe script handed to every worker.
pub fn probe_script(args: &ScanArgs) -> Result<PathBuf, CanaryError> {
    if let Some(script) = &args.script {
        if script.is_file() {
            return Ok(script.clone());
        }
        return Err(CanaryError::Setup(format!(
            "probe script `{}` does not exist",
            script.display()
        )));
    }
    // Default: the script shipped next to the binary.
    let fallback = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("js").join("scan_worker.js")));
    match fallback {
        Some(script) if script.is_file() => Ok(script),
        _ => Err(CanaryError::Setup(
            "no probe script found, pass --script or set TLSCANARY_PROBE_SCRIPT".to_string(),
        )),
    }
}

/// Start a throwaway worker and query its build metadata.
pub async fn collect_worker_info(app: &App, script: &Path) -> Result<WorkerMetadata, CanaryError> {
    let mut supervisor = WorkerSupervisor::new(app, script, None, None);
    let port = supervisor.spawn(0).await?;

    let result = async {
        let mut conn = WorkerConnection::new(port).with_timeout(INFO_TIMEOUT);
        let info = Command::info();
        conn.send(&info, true, None).await?;
        let mut metadata = None;
        // The ACK comes first, then the final info response.
        for _ in 0..2 {
            match conn.receive(None).await? {
                Some(Response::Final(fin)) if fin.command_id == info.id.to_string() => {
                    metadata = WorkerMetadata::from_info(&fin.result);
                    break;
                }
                Some(_) => continue,
                None => break,
            }
        }
        conn.close().await;
        Ok::<_, CanaryError>(metadata)
    }
    .await;

    supervisor.quit().await;
    result?.ok_or_else(|| CanaryError::Setup("worker did not report build metadata".to_string()))
}

const DEFAULT_PROFILE: &[(&str, &str)] = &[
    ("user.js", include_str!("../../default_profile/user.js")),
    (
        "revocations.txt",
        include_str!("../../default_profile/revocations.txt"),
    ),
];

/// Build a scan profile under the run's temporary directory. With a
/// live OneCRL environment the revocation list is fetched through the
/// external toolchain and materialized into the profile; with `none`
/// the default profile's revocation state stays as is.
pub async fn make_profile(
    ctx: &ModeContext,
    name: &str,
    onecrl: OneCrlEnv,
) -> Result<PathBuf, CanaryError> {
    let profile_dir = ctx.tmp_dir.join(name);
    std::fs::create_dir_all(&profile_dir)
        .map_err(|err| CanaryError::Setup(format!("can't create profile `{name}`: {err}")))?;

    for (file_name, content) in DEFAULT_PROFILE {
        std::fs::write(profile_dir.join(file_name), content)
            .map_err(|err| CanaryError::Setup(format!("can't write profile `{name}`: {err}")))?;
    }

    match onecrl {
        OneCrlEnv::Production | OneCrlEnv::Stage => {
            tracing::info!(profile = name, environment = %onecrl, "updating OneCRL revocation data");
            let revocations = one_crl::get_list(onecrl, &ctx.workdir).await?;
            std::fs::copy(&revocations, profile_dir.join("revocations.txt")).map_err(|err| {
                CanaryError::Setup(format!("can't copy revocations into `{name}`: {err}"))
            })?;
        }
        OneCrlEnv::None => {
            tracing::info!(profile = name, "using revocation data from the default profile");
        }
    }

    // Profiles are read-only so workers can't cache state into them.
    for entry in std::fs::read_dir(&profile_dir)
        .map_err(|err| CanaryError::Setup(format!("can't read profile `{name}`: {err}")))?
        .filter_map(|entry| entry.ok())
    {
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(_) => continue,
        };
        let mut permissions = metadata.permissions();
        permissions.set_readonly(true);
        let _ = std::fs::set_permissions(entry.path(), permissions);
    }

    Ok(profile_dir)
}

/// Snapshot a profile directory into a `<name>.zip` part of the run
/// log. Returns the part name for the metadata's profile list.
pub fn save_profile(
    profile_dir: &Path,
    name: &str,
    log: &RunLog,
) -> Result<String, CanaryError> {
    let part = format!("{name}.zip");
    let zip_path = log.part_path(&part);
    tracing::debug!(profile = name, path = %zip_path.display(), "saving profile snapshot");

    let file = std::fs::File::create(&zip_path)
        .map_err(|err| CanaryError::Setup(format!("can't create profile snapshot: {err}")))?;
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    let mut stack = vec![profile_dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = std::fs::read_dir(&dir)
            .map_err(|err| CanaryError::Setup(format!("can't read profile dir: {err}")))?;
        for entry in entries.filter_map(|entry| entry.ok()) {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let rel = path
                .strip_prefix(profile_dir)
                .map_err(|err| CanaryError::Setup(format!("bad profile path: {err}")))?;
            let archive_name = format!("{name}/{}", rel.display());
            zip.start_file(archive_name, options).map_err(|err| {
                CanaryError::Setup(format!("can't write profile snapshot: {err}"))
            })?;
            let content = std::fs::read(&path)
                .map_err(|err| CanaryError::Setup(format!("can't read profile file: {err}")))?;
            zip.write_all(&content).map_err(|err| {
                CanaryError::Setup(format!("can't write profile snapshot: {err}"))
            })?;
        }
    }
    zip.finish()
        .map_err(|err| CanaryError::Setup(format!("can't finish profile snapshot: {err}")))?;
    Ok(part)
}

/// The common run-log metadata header.
pub fn run_meta(
    mode: &str,
    args: &ScanArgs,
    sources_size: usize,
    test_metadata: &WorkerMetadata,
    base_metadata: Option<&WorkerMetadata>,
) -> Map<String, Value> {
    let mut meta = Map::new();
    meta.insert("tlscanary_version".into(), json!(env!("CARGO_PKG_VERSION")));
    meta.insert("mode".into(), json!(mode));
    meta.insert(
        "args".into(),
        serde_json::to_value(args).unwrap_or(Value::Null),
    );
    meta.insert(
        "argv".into(),
        json!(std::env::args().collect::<Vec<String>>()),
    );
    meta.insert("sources_size".into(), json!(sources_size));
    meta.insert(
        "test_metadata".into(),
        serde_json::to_value(test_metadata).unwrap_or(Value::Null),
    );
    if let Some(base_metadata) = base_metadata {
        meta.insert(
            "base_metadata".into(),
            serde_json::to_value(base_metadata).unwrap_or(Value::Null),
        );
    }
    meta.insert("run_start_time".into(), json!(Utc::now().to_rfc3339()));
    meta.insert("profiles".into(), json!([]));
    meta
}

/// Log filter diverting certificate chains into the CertDB: the chain's
/// DER blobs are replaced by their content ids so the log stays small
/// and certificates deduplicate across runs.
pub fn cert_log_filter(cert_db: CertDB) -> LogFilter {
    Box::new(move |mut line: Value| {
        let chain = line
            .pointer_mut("/response/result/info/certificate_chain")
            .filter(|chain| chain.is_array());
        if let Some(chain) = chain {
            let mut ids = Vec::new();
            for cert in chain.as_array().into_iter().flatten() {
                let Some(bytes) = cert.as_array() else {
                    continue;
                };
                let der: Vec<u8> = bytes
                    .iter()
                    .filter_map(Value::as_u64)
                    .map(|byte| byte as u8)
                    .collect();
                match cert_db.put(&der) {
                    Ok(id) => ids.push(json!(id)),
                    Err(err) => tracing::warn!(%err, "failed to store certificate"),
                }
            }
            *chain = Value::Array(ids);
        }
        Some(line)
    })
}

/// Periodic status line from the progress tracker; abort the handle
/// once the run is done.
pub fn spawn_progress_logger(
    progress: Arc<ProgressTracker>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            tracing::info!("progress: {progress}");
        }
    })
}
