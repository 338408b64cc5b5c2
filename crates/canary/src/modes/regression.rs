//! Regression mode: scan a host set with two builds and report hosts
//! that persistently fail only on the test build.

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
use tlscanary_engine::pipeline::{PipelineKnobs, ProbePipeline};
use tlscanary_engine::{App, EngineError, WorkerMetadata};

use crate::cli::{OneCrlEnv, ScanArgs};
use crate::error::CanaryError;
use crate::modes::helpers::{
    Mode, ModeContext, cert_log_filter, collect_worker_info, get_test_candidate, make_profile,
    probe_script, run_meta, save_profile, spawn_progress_logger,
};

/// Prefs used for the revocation sanity check: OCSP is disabled so the
/// check exercises the OneCRL path alone.
const SANITY_CHECK_PREFS: &[&str] = &["security.OCSP.enabled;0"];

const PROGRESS_INTERVAL: Duration = Duration::from_secs(60);

pub struct RegressionMode {
    args: ScanArgs,
    script: Option<PathBuf>,
    test_app: Option<App>,
    base_app: Option<App>,
    test_metadata: Option<WorkerMetadata>,
    base_metadata: Option<WorkerMetadata>,
    test_profile: Option<PathBuf>,
    base_profile: Option<PathBuf>,
    altered_profile: Option<PathBuf>,
    sources: Option<Sources>,
}

impl RegressionMode {
    pub fn new(args: ScanArgs) -> Self {
        Self {
            args,
            script: None,
            test_app: None,
            base_app: None,
            test_metadata: None,
            base_metadata: None,
            test_profile: None,
            base_profile: None,
            altered_profile: None,
            sources: None,
        }
    }

    fn knobs(&self) -> PipelineKnobs {
        PipelineKnobs {
            parallel: self.args.parallel,
            per_worker: self.args.requests_per_worker,
            timeout: self.args.timeout,
            max_timeout: self.args.max_timeout,
            scans: self.args.scans,
            prefs_test: self.args.effective_prefs_test(),
            prefs_base: self.args.effective_prefs_base(),
            get_certs: !self.args.remove_certs,
        }
    }

    fn pipeline<'a>(
        &'a self,
        test_app: &'a App,
        base_app: &'a App,
        script: &'a PathBuf,
        ctx: &ModeContext,
    ) -> ProbePipeline<'a> {
        ProbePipeline {
            test_app,
            base_app,
            script: script.as_path(),
            test_profile: self.test_profile.clone(),
            base_profile: self.base_profile.clone(),
            knobs: self.knobs(),
            stop: ctx.stop.clone(),
        }
    }

    /// Probe a known-revoked host set twice: with the full test profile
    /// (everything must fail) and with the revocation list removed
    /// (everything must succeed). Anything else means the profile's
    /// revocation state is not actually active.
    async fn one_crl_sanity_check(&mut self, ctx: &ModeContext) -> Result<(), CanaryError> {
        let db = SourcesDB::open(&ctx.workdir)?;
        let revoked = db.read("revoked")?;
        tracing::debug!(hosts = revoked.len(), "revoked test set");
        if revoked.is_empty() {
            return Err(CanaryError::Setup(
                "revoked host database is empty, can't verify revocation state".to_string(),
            ));
        }

        let altered = make_profile(ctx, "altered_profile", OneCrlEnv::None).await?;
        self.altered_profile = Some(altered.clone());

        let (test_app, base_app, script) = self.refs()?;
        let pipeline = self.pipeline(test_app, base_app, script, ctx);
        let prefs: Vec<String> = SANITY_CHECK_PREFS.iter().map(|s| (*s).to_string()).collect();
        let passed = pipeline
            .one_crl_sanity_check(&revoked.as_set(), &altered, &prefs)
            .await?;
        if !passed {
            return Err(CanaryError::Setup(
                "OneCRL sanity check failed, aborting run".to_string(),
            ));
        }
        Ok(())
    }

    fn refs(&self) -> Result<(&App, &App, &PathBuf), CanaryError> {
        match (&self.test_app, &self.base_app, &self.script) {
            (Some(test_app), Some(base_app), Some(script)) => Ok((test_app, base_app, script)),
            _ => Err(CanaryError::Setup("regression mode is not set up".to_string())),
        }
    }
}

impl Mode for RegressionMode {
    fn name(&self) -> &'static str {
        "regression"
    }

    async fn setup(&mut self, ctx: &ModeContext) -> Result<(), CanaryError> {
        let Some(test_build) = self.args.test.clone() else {
            return Err(CanaryError::Setup(
                "must specify a test build for regression testing".to_string(),
            ));
        };
        let Some(base_build) = self.args.base.clone() else {
            return Err(CanaryError::Setup(
                "must specify a base build for regression testing".to_string(),
            ));
        };
        if self.args.scans < 2 {
            return Err(CanaryError::Setup(
                "regression testing needs at least 2 scans".to_string(),
            ));
        }
        if !self.args.prefs.is_empty()
            && (!self.args.prefs_test.is_empty() || !self.args.prefs_base.is_empty())
        {
            tracing::warn!("both global prefs and per-build prefs are set");
        }

        let script = probe_script(&self.args)?;
        let test_app = get_test_candidate(&test_build)?;
        let base_app = get_test_candidate(&base_build)?;

        self.test_metadata = Some(collect_worker_info(&test_app, &script).await?);
        self.base_metadata = Some(collect_worker_info(&base_app, &script).await?);

        self.test_profile = Some(make_profile(ctx, "test_profile", self.args.onecrl).await?);
        self.base_profile = Some(make_profile(ctx, "base_profile", OneCrlEnv::Production).await?);

        let db = SourcesDB::open(&ctx.workdir)?;
        let handle = self.args.source.clone().unwrap_or_else(|| db.default.clone());
        tracing::info!(handle, "reading host database");
        let mut sources = db.read(&handle)?;
        if let Some(limit) = self.args.limit {
            sources.trim(limit);
        }
        tracing::info!(hosts = sources.len(), "hosts in test set");

        self.test_app = Some(test_app);
        self.base_app = Some(base_app);
        self.script = Some(script);
        self.sources = Some(sources);

        self.one_crl_sanity_check(ctx).await
    }

    async fn run(&mut self, ctx: &ModeContext) -> Result<(), CanaryError> {
        let sources = self
            .sources
            .take()
            .ok_or_else(|| CanaryError::Setup("regression mode is not set up".to_string()))?;
        let (test_metadata, base_metadata) =
            match (self.test_metadata.as_ref(), self.base_metadata.as_ref()) {
                (Some(test_metadata), Some(base_metadata)) => (test_metadata, base_metadata),
                _ => return Err(CanaryError::Setup("regression mode is not set up".to_string())),
            };
        tracing::info!(
            test = format!("{} {}", test_metadata.app_version, test_metadata.branch),
            base = format!("{} {}", base_metadata.app_version, base_metadata.branch),
            "testing builds against each other"
        );

        let mut meta = run_meta(
            self.name(),
            &self.args,
            sources.len(),
            test_metadata,
            Some(base_metadata),
        );

        let run_log_db = RunLogDB::open(&ctx.workdir)
            .map_err(|err| CanaryError::Setup(format!("can't open run log database: {err}")))?;
        let mut log = run_log_db.new_log()?;
        let cert_db = CertDB::open(ctx.workdir.certs_dir())
            .map_err(|err| CanaryError::Setup(format!("can't open certificate store: {err}")))?;
        log.start_with_filter(meta.clone(), Some(cert_log_filter(cert_db)))?;

        let progress = Arc::new(
            ProgressTracker::new(sources.len() as u64, "hosts")
                .with_window(Duration::from_secs(30 * 60)),
        );
        let logger = spawn_progress_logger(progress.clone(), PROGRESS_INTERVAL);

        // Work in at most 50 chunks of at least 1000 hosts: bounded
        // memory on million-host runs, partial progress on interrupt.
        let limit = self.args.limit.unwrap_or(sources.len());
        let mut chunks = sources.iter_chunks(limit / 50, 1000);

        let mut run_error: Option<CanaryError> = None;
        loop {
            if ctx.stop.is_stopped() {
                run_error = Some(CanaryError::Interrupted);
                break;
            }
            let Some(chunk) = chunks.next_chunk() else {
                break;
            };
            tracing::info!(hosts = chunk.len(), "starting regression run on chunk");

            let (test_app, base_app, script) = self.refs()?;
            let pipeline = self.pipeline(test_app, base_app, script, ctx);
            match pipeline.run_regression_passes(&chunk, &progress).await {
                Ok(results) => {
                    if !results.is_empty() {
                        tracing::warn!(regressions = results.len(), "potential regressions found");
                    }
                    for result in results {
                        log.log(result.to_log_value())?;
                    }
                    tracing::info!("progress: {progress}");
                }
                Err(EngineError::Cancelled) => {
                    run_error = Some(CanaryError::Interrupted);
                    break;
                }
                Err(err) => {
                    run_error = Some(err.into());
                    break;
                }
            }
        }
        logger.abort();

        meta.insert("run_finish_time".into(), json!(Utc::now().to_rfc3339()));
        let mut profiles = Vec::new();
        for (profile, name) in [
            (self.test_profile.as_ref(), "test_profile"),
            (self.base_profile.as_ref(), "base_profile"),
            (self.altered_profile.as_ref(), "altered_profile"),
        ] {
            if let Some(profile) = profile {
                let part = save_profile(profile, name, &log)?;
                profiles.push(json!({"name": name, "log_part": part}));
            }
        }
        meta.insert("profiles".into(), json!(profiles));

        match run_error {
            Some(err) => {
                // Keep what we have; the log reads as incomplete.
                log.abort(meta)?;
                Err(err)
            }
            None => {
                log.stop(meta)?;
                tracing::info!(handle = log.handle(), "run log written");
                Ok(())
            }
        }
    }

    async fn teardown(&mut self, _ctx: &ModeContext) -> Result<(), CanaryError> {
        self.test_app = None;
        self.base_app = None;
        self.sources = None;
        Ok(())
    }
}
