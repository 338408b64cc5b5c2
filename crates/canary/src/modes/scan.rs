//! Scan mode: a single pass over a host set with one build, logging the
//! full connection state of every host.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use tlscanary_core::certdb::CertDB;
use tlscanary_core::progress::ProgressTracker;
use tlscanary_core::runlog::RunLogDB;
use tlscanary_core::sources::Sources;
use tlscanary_core::sources_db::SourcesDB;
use tlscanary_engine::pool::{PoolConfig, run_scans};
use tlscanary_engine::{App, EngineError, WorkerMetadata};

use crate::cli::ScanArgs;
use crate::error::CanaryError;
use crate::modes::helpers::{
    Mode, ModeContext, cert_log_filter, collect_worker_info, get_test_candidate, make_profile,
    probe_script, run_meta, save_profile, spawn_progress_logger,
};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(60);

pub struct ScanMode {
    args: ScanArgs,
    script: Option<PathBuf>,
    test_app: Option<App>,
    test_metadata: Option<WorkerMetadata>,
    test_profile: Option<PathBuf>,
    sources: Option<Sources>,
}

impl ScanMode {
    pub fn new(args: ScanArgs) -> Self {
        Self {
            args,
            script: None,
            test_app: None,
            test_metadata: None,
            test_profile: None,
            sources: None,
        }
    }
}

impl Mode for ScanMode {
    fn name(&self) -> &'static str {
        "scan"
    }

    async fn setup(&mut self, ctx: &ModeContext) -> Result<(), CanaryError> {
        let Some(test_build) = self.args.test.clone() else {
            return Err(CanaryError::Setup("must specify a test build for scanning".to_string()));
        };
        if self.args.base.is_some() {
            tracing::debug!("ignoring base build parameter");
        }

        let script = probe_script(&self.args)?;
        let test_app = get_test_candidate(&test_build)?;
        self.test_metadata = Some(collect_worker_info(&test_app, &script).await?);
        self.test_profile = Some(make_profile(ctx, "test_profile", self.args.onecrl).await?);

        let db = SourcesDB::open(&ctx.workdir)?;
        let handle = self.args.source.clone().unwrap_or_else(|| db.default.clone());
        tracing::info!(handle, "reading host database");
        let mut sources = db.read(&handle)?;
        if let Some(limit) = self.args.limit {
            sources.trim(limit);
        }
        tracing::info!(hosts = sources.len(), "hosts in test set");

        self.script = Some(script);
        self.test_app = Some(test_app);
        self.sources = Some(sources);
        Ok(())
    }

    async fn run(&mut self, ctx: &ModeContext) -> Result<(), CanaryError> {
        let (sources, test_app, script, test_metadata) = match (
            self.sources.take(),
            self.test_app.as_ref(),
            self.script.as_ref(),
            self.test_metadata.as_ref(),
        ) {
            (Some(sources), Some(test_app), Some(script), Some(test_metadata)) => {
                (sources, test_app, script, test_metadata)
            }
            _ => return Err(CanaryError::Setup("scan mode is not set up".to_string())),
        };
        tracing::info!(
            build = format!("{} {}", test_metadata.app_version, test_metadata.branch),
            "scan run"
        );

        let mut meta = run_meta(self.name(), &self.args, sources.len(), test_metadata, None);

        let run_log_db = RunLogDB::open(&ctx.workdir)
            .map_err(|err| CanaryError::Setup(format!("can't open run log database: {err}")))?;
        let mut log = run_log_db.new_log()?;
        let cert_db = CertDB::open(ctx.workdir.certs_dir())
            .map_err(|err| CanaryError::Setup(format!("can't open certificate store: {err}")))?;
        log.start_with_filter(meta.clone(), Some(cert_log_filter(cert_db)))?;

        let progress = Arc::new(ProgressTracker::new(sources.len() as u64, "hosts"));
        let logger = spawn_progress_logger(progress.clone(), PROGRESS_INTERVAL);
        let completed = |landed: u64| progress.log_completed(landed);

        let cfg = PoolConfig {
            num_workers: self.args.parallel,
            per_worker: self.args.requests_per_worker,
            timeout: self.args.timeout,
            get_certs: !self.args.remove_certs,
            profile: self.test_profile.clone(),
            prefs: self.args.effective_prefs_test(),
        };
        let outcome = run_scans(
            test_app,
            script,
            &sources.as_set(),
            &cfg,
            &ctx.stop,
            Some(&completed),
        )
        .await;
        logger.abort();

        meta.insert("run_finish_time".into(), json!(Utc::now().to_rfc3339()));
        if let Some(profile) = self.test_profile.as_ref() {
            let part = save_profile(profile, "test_profile", &log)?;
            meta.insert("profiles".into(), json!([{"name": "test_profile", "log_part": part}]));
        }

        match outcome {
            Ok(results) => {
                // Every host is logged, successes included.
                let mut ordered: Vec<_> = results.into_values().collect();
                ordered.sort_by_key(|result| result.rank);
                for result in ordered {
                    log.log(result.to_log_value())?;
                }
                tracing::info!("progress: {progress}");
                log.stop(meta)?;
                tracing::info!(handle = log.handle(), "run log written");
                Ok(())
            }
            Err(EngineError::Cancelled) => {
                log.abort(meta)?;
                Err(CanaryError::Interrupted)
            }
            Err(err) => {
                log.abort(meta)?;
                Err(err.into())
            }
        }
    }

    async fn teardown(&mut self, _ctx: &ModeContext) -> Result<(), CanaryError> {
        self.test_app = None;
        self.sources = None;
        Ok(())
    }
}
