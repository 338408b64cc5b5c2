//! Source update mode: rebuild a ranked host database from a raw
//! top-sites list, keeping only hosts that complete a TLS handshake.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tlscanary_core::progress::ProgressTracker;
use tlscanary_core::sources::{HostSet, Sources};
use tlscanary_core::sources_db::SourcesDB;
use tlscanary_engine::pipeline::failures;
use tlscanary_engine::pool::{PoolConfig, run_scans};
use tlscanary_engine::{App, EngineError};

use crate::cli::{OneCrlEnv, ScanArgs};
use crate::error::CanaryError;
use crate::modes::helpers::{
    Mode, ModeContext, get_test_candidate, make_profile, probe_script, spawn_progress_logger,
};

/// Default size of the rebuilt database.
const DEFAULT_LIMIT: usize = 500_000;
/// Raw lists are published as ~1M rows; much less smells like a bad
/// download.
const EXPECTED_RAW_SIZE: usize = 900_000;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(60);

pub struct SrcUpdateMode {
    args: ScanArgs,
    script: Option<PathBuf>,
    app: Option<App>,
    profile: Option<PathBuf>,
    handle: String,
    is_default: bool,
    raw_sources: Option<Sources>,
}

impl SrcUpdateMode {
    pub fn new(args: ScanArgs) -> Self {
        Self {
            args,
            script: None,
            app: None,
            profile: None,
            handle: String::new(),
            is_default: false,
            raw_sources: None,
        }
    }
}

impl Mode for SrcUpdateMode {
    fn name(&self) -> &'static str {
        "srcupdate"
    }

    async fn setup(&mut self, ctx: &ModeContext) -> Result<(), CanaryError> {
        let Some(base_build) = self.args.base.clone() else {
            return Err(CanaryError::Setup(
                "must specify a base build for source updates".to_string(),
            ));
        };
        let Some(raw_list) = self.args.raw_list.clone() else {
            return Err(CanaryError::Setup(
                "must specify --raw-list with the unfiltered top-sites CSV".to_string(),
            ));
        };

        let script = probe_script(&self.args)?;
        let app = get_test_candidate(&base_build)?;
        let profile = make_profile(ctx, "base_profile", OneCrlEnv::Production).await?;

        let db = SourcesDB::open(&ctx.workdir)?;
        self.handle = self.args.source.clone().unwrap_or_else(|| db.default.clone());
        self.is_default = self.handle == db.default;

        tracing::info!(path = %raw_list.display(), "reading unfiltered top sites data");
        let raw_sources = Sources::load_raw(&raw_list, self.handle.clone())?;

        // Mild plausibility checks on the raw data.
        if raw_sources.len() < EXPECTED_RAW_SIZE {
            tracing::warn!(hosts = raw_sources.len(), "top sites list is surprisingly small");
        }
        match raw_sources.rows().first() {
            Some(first) if first.rank == 1 && first.hostname == "google.com" => {}
            Some(first) => {
                tracing::warn!(rank = first.rank, hostname = first.hostname, "top sites data looks weird");
            }
            None => return Err(CanaryError::Setup("top sites list is empty".to_string())),
        }

        self.script = Some(script);
        self.app = Some(app);
        self.profile = Some(profile);
        self.raw_sources = Some(raw_sources);
        Ok(())
    }

    async fn run(&mut self, ctx: &ModeContext) -> Result<(), CanaryError> {
        let (raw_sources, app, script) = match (
            self.raw_sources.take(),
            self.app.as_ref(),
            self.script.as_ref(),
        ) {
            (Some(raw_sources), Some(app), Some(script)) => (raw_sources, app, script),
            _ => return Err(CanaryError::Setup("srcupdate mode is not set up".to_string())),
        };

        let limit = self.args.limit.unwrap_or(DEFAULT_LIMIT);
        tracing::info!(
            raw = raw_sources.len(),
            limit,
            handle = self.handle,
            "compiling working host set for database update"
        );

        let progress = Arc::new(ProgressTracker::new(limit as u64, "hosts"));
        let logger = spawn_progress_logger(progress.clone(), PROGRESS_INTERVAL);
        let completed = |landed: u64| progress.log_completed(landed);
        let overhead = |landed: u64| progress.log_overhead(landed);

        let chunk_size = (limit / 20).max(1000);
        let mut chunks = raw_sources.iter_chunks(chunk_size, 1000);
        let mut working_set = HostSet::new();
        let mut interrupted = false;

        loop {
            if ctx.stop.is_stopped() {
                interrupted = true;
                break;
            }
            let hosts_to_go = limit.saturating_sub(working_set.len());
            if hosts_to_go == 0 {
                break;
            }
            tracing::info!(hosts_to_go, "hosts to go to complete the working set");

            // The last chunk is downsized to twice the remaining need;
            // the 2x headroom absorbs the expected error rate.
            let size = if chunk_size > hosts_to_go * 2 {
                hosts_to_go * 2
            } else {
                chunk_size
            };
            let Some(chunk) = chunks.next_chunk_sized(size) else {
                break;
            };
            tracing::info!(hosts = chunk.len(), "processing chunk of the unfiltered set");

            // Re-test the chunk's failures until they prove persistent.
            let mut pass_errors = chunk.clone();
            let mut outcome: Result<(), EngineError> = Ok(());
            for pass in 0..self.args.scans.max(1) {
                let cfg = PoolConfig {
                    num_workers: self.args.parallel,
                    per_worker: self.args.requests_per_worker,
                    timeout: self.args.timeout,
                    get_certs: false,
                    profile: self.profile.clone(),
                    prefs: self.args.effective_prefs_base(),
                };
                let report: &(dyn Fn(u64) + Send + Sync) =
                    if pass == 0 { &completed } else { &overhead };
                match run_scans(app, script, &pass_errors, &cfg, &ctx.stop, Some(report)).await {
                    Ok(results) => pass_errors = failures(&results),
                    Err(err) => {
                        outcome = Err(err);
                        break;
                    }
                }
                if pass_errors.is_empty() {
                    break;
                }
            }
            match outcome {
                Ok(()) => {}
                Err(EngineError::Cancelled) => {
                    interrupted = true;
                    break;
                }
                Err(err) => {
                    logger.abort();
                    return Err(err.into());
                }
            }

            let error_rate = 100.0 * pass_errors.len() as f64 / chunk.len() as f64;
            tracing::info!(error_rate = format!("{error_rate:.1}%"), "error rate in chunk");
            working_set.union_with(&chunk.difference(&pass_errors));
            tracing::info!("progress: {progress}");
        }
        logger.abort();

        if working_set.len() < limit && !interrupted {
            tracing::warn!("ran out of hosts before completing the working set");
        }

        // Even an interrupted run writes what it has collected so far.
        let mut final_sources = Sources::new(self.handle.clone(), self.is_default);
        final_sources.from_set(&working_set);
        final_sources.trim(limit);
        tracing::info!(
            hosts = final_sources.len(),
            handle = self.handle,
            "writing updated host database"
        );
        let db = SourcesDB::open(&ctx.workdir)?;
        db.write(&ctx.workdir, &final_sources)?;

        if interrupted {
            Err(CanaryError::Interrupted)
        } else {
            Ok(())
        }
    }

    async fn teardown(&mut self, _ctx: &ModeContext) -> Result<(), CanaryError> {
        self.app = None;
        self.raw_sources = None;
        self.profile = None;
        Ok(())
    }
}
