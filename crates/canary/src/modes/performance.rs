//! Performance mode: repeated full info passes against both builds,
//! comparing TLS connection speed per host and in aggregate.

use std::collections::HashMap;
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
use tlscanary_engine::wire::ScanResult;
use tlscanary_engine::{App, WorkerMetadata};

use crate::cli::{OneCrlEnv, ScanArgs};
use crate::error::CanaryError;
use crate::modes::helpers::{
    Mode, ModeContext, cert_log_filter, collect_worker_info, get_test_candidate, make_profile,
    probe_script, run_meta, save_profile, spawn_progress_logger,
};

/// Hard bounds: 1000 hosts x 20 scans x 2 builds is already a lot of
/// probe traffic.
const MAX_HOSTS: usize = 1000;
const MAX_SCANS: u32 = 20;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(60);

pub struct PerformanceMode {
    args: ScanArgs,
    script: Option<PathBuf>,
    test_app: Option<App>,
    base_app: Option<App>,
    test_metadata: Option<WorkerMetadata>,
    base_metadata: Option<WorkerMetadata>,
    test_profile: Option<PathBuf>,
    base_profile: Option<PathBuf>,
    sources: Option<Sources>,
}

impl PerformanceMode {
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
            sources: None,
        }
    }

    fn pool_config(&self, profile: Option<&PathBuf>, prefs: Option<Vec<String>>) -> PoolConfig {
        PoolConfig {
            num_workers: self.args.parallel,
            per_worker: self.args.requests_per_worker,
            timeout: self.args.timeout,
            get_certs: !self.args.remove_certs,
            profile: profile.cloned(),
            prefs,
        }
    }
}

fn speed_samples(runs: &[HashMap<String, ScanResult>], host: &str) -> Vec<i64> {
    runs.iter()
        .filter_map(|results| results.get(host))
        .map(ScanResult::connection_speed_ms)
        .collect()
}

fn average(samples: &[i64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().sum::<i64>() as f64 / samples.len() as f64)
}

impl Mode for PerformanceMode {
    fn name(&self) -> &'static str {
        "performance"
    }

    async fn setup(&mut self, ctx: &ModeContext) -> Result<(), CanaryError> {
        let Some(test_build) = self.args.test.clone() else {
            return Err(CanaryError::Setup(
                "must specify a test build for performance testing".to_string(),
            ));
        };
        let Some(base_build) = self.args.base.clone() else {
            return Err(CanaryError::Setup(
                "must specify a base build for performance testing".to_string(),
            ));
        };
        if self.args.limit.is_some_and(|limit| limit > MAX_HOSTS) {
            return Err(CanaryError::Setup(format!(
                "performance testing is limited to {MAX_HOSTS} hosts"
            )));
        }
        if self.args.scans > MAX_SCANS {
            return Err(CanaryError::Setup(format!(
                "performance testing is limited to {MAX_SCANS} scans per host list"
            )));
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
        sources.trim(self.args.limit.unwrap_or(MAX_HOSTS).min(MAX_HOSTS));
        tracing::info!(hosts = sources.len(), "hosts in test set");

        self.script = Some(script);
        self.test_app = Some(test_app);
        self.base_app = Some(base_app);
        self.sources = Some(sources);
        Ok(())
    }

    async fn run(&mut self, ctx: &ModeContext) -> Result<(), CanaryError> {
        let (sources, test_app, base_app, script) = match (
            self.sources.take(),
            self.test_app.as_ref(),
            self.base_app.as_ref(),
            self.script.as_ref(),
        ) {
            (Some(sources), Some(test_app), Some(base_app), Some(script)) => {
                (sources, test_app, base_app, script)
            }
            _ => return Err(CanaryError::Setup("performance mode is not set up".to_string())),
        };
        let (test_metadata, base_metadata) =
            match (self.test_metadata.as_ref(), self.base_metadata.as_ref()) {
                (Some(test_metadata), Some(base_metadata)) => (test_metadata, base_metadata),
                _ => return Err(CanaryError::Setup("performance mode is not set up".to_string())),
            };

        let scans = self.args.scans.max(1);
        let host_set = sources.as_set();
        let total_probes = (sources.len() as u64) * 2 * u64::from(scans);

        let mut meta = run_meta(self.name(), &self.args, sources.len(), test_metadata, Some(base_metadata));

        let run_log_db = RunLogDB::open(&ctx.workdir)
            .map_err(|err| CanaryError::Setup(format!("can't open run log database: {err}")))?;
        let mut log = run_log_db.new_log()?;
        let cert_db = CertDB::open(ctx.workdir.certs_dir())
            .map_err(|err| CanaryError::Setup(format!("can't open certificate store: {err}")))?;
        log.start_with_filter(meta.clone(), Some(cert_log_filter(cert_db)))?;

        let progress = Arc::new(ProgressTracker::new(total_probes, "probes"));
        let logger = spawn_progress_logger(progress.clone(), PROGRESS_INTERVAL);
        let completed = |landed: u64| progress.log_completed(landed);

        let outcome: Result<(), CanaryError> = async {
            let mut test_runs: Vec<HashMap<String, ScanResult>> = Vec::new();
            let mut base_runs: Vec<HashMap<String, ScanResult>> = Vec::new();

            for scan_no in 1..=scans {
                tracing::info!(scan_no, scans, "performance pass");
                let test_cfg = self.pool_config(
                    self.test_profile.as_ref(),
                    self.args.effective_prefs_test(),
                );
                test_runs.push(
                    run_scans(test_app, script, &host_set, &test_cfg, &ctx.stop, Some(&completed))
                        .await?,
                );
                let base_cfg = self.pool_config(
                    self.base_profile.as_ref(),
                    self.args.effective_prefs_base(),
                );
                base_runs.push(
                    run_scans(base_app, script, &host_set, &base_cfg, &ctx.stop, Some(&completed))
                        .await?,
                );
            }

            // Per-host speed comparison over all passes; hosts that never
            // answered on one of the builds can't be compared.
            let mut test_speed_aggregate = 0.0;
            let mut base_speed_aggregate = 0.0;
            let mut ordered: Vec<ScanResult> = test_runs[0].values().cloned().collect();
            ordered.sort_by_key(|result| result.rank);
            for result in ordered {
                let test_samples = speed_samples(&test_runs, &result.host);
                let base_samples = speed_samples(&base_runs, &result.host);
                let (Some(test_avg), Some(base_avg)) =
                    (average(&test_samples), average(&base_samples))
                else {
                    tracing::debug!(host = result.host, "host missing from one build's results");
                    continue;
                };
                test_speed_aggregate += test_avg;
                base_speed_aggregate += base_avg;

                let mut line = result.to_log_value();
                line["response"]["connection_speed_average"] = json!(test_avg.round() as i64);
                line["response"]["connection_speed_samples"] = json!(test_samples);
                line["response"]["connection_speed_base_average"] = json!(base_avg.round() as i64);
                line["response"]["connection_speed_base_samples"] = json!(base_samples);
                if base_avg != 0.0 {
                    let change = (test_avg - base_avg) / base_avg * 100.0;
                    line["response"]["connection_speed_change"] = json!(change.round() as i64);
                }
                log.log(line)?;
            }

            if base_speed_aggregate != 0.0 {
                let total_change =
                    (test_speed_aggregate - base_speed_aggregate) / base_speed_aggregate * 100.0;
                tracing::info!(total_change = total_change.round(), "total speed change percent");
                meta.insert("total_speed_change_percent".into(), json!(total_change.round() as i64));
            }
            Ok(())
        }
        .await;
        logger.abort();

        meta.insert("run_finish_time".into(), json!(Utc::now().to_rfc3339()));
        let mut profiles = Vec::new();
        for (profile, name) in [
            (self.test_profile.as_ref(), "test_profile"),
            (self.base_profile.as_ref(), "base_profile"),
        ] {
            if let Some(profile) = profile {
                let part = save_profile(profile, name, &log)?;
                profiles.push(json!({"name": name, "log_part": part}));
            }
        }
        meta.insert("profiles".into(), json!(profiles));

        match outcome {
            Ok(()) => {
                log.stop(meta)?;
                tracing::info!(handle = log.handle(), "run log written");
                Ok(())
            }
            Err(err) => {
                log.abort(meta)?;
                Err(err)
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
