//! The converging regression pipeline.
//!
//! Network flakiness dominates single-pass diffs between two builds, so
//! the pipeline re-scans the shrinking error set in multiple passes,
//! keeping only hosts that fail on the test build and not on the
//! baseline. Each pass runs with fewer workers and a longer per-probe
//! timeout, trading throughput for reliability as the set converges.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tlscanary_core::HostSet;
use tlscanary_core::progress::ProgressTracker;

use crate::app::App;
use crate::error::EngineError;
use crate::pool::{PoolConfig, run_scans};
use crate::stop::StopHandle;
use crate::wire::ScanResult;

#[derive(Debug, Clone)]
pub struct PipelineKnobs {
    pub parallel: usize,
    pub per_worker: usize,
    /// Initial per-probe timeout in seconds.
    pub timeout: f64,
    /// Ceiling for the decaying pass timeout.
    pub max_timeout: f64,
    /// Number of converging passes (at least 2 for regression runs).
    pub scans: u32,
    pub prefs_test: Option<Vec<String>>,
    pub prefs_base: Option<Vec<String>>,
    /// Collect certificate chains in the final pass.
    pub get_certs: bool,
}

/// Knob decay between passes: three quarters of the workers and
/// in-flight slots, a quarter more timeout, capped at `max_timeout`.
pub(crate) fn decayed(
    workers: usize,
    per_worker: usize,
    timeout: f64,
    max_timeout: f64,
) -> (usize, usize, f64) {
    (
        (((workers as f64) * 0.75).floor() as usize).max(1),
        (((per_worker as f64) * 0.75).floor() as usize).max(1),
        (timeout * 1.25).min(max_timeout),
    )
}

pub struct ProbePipeline<'a> {
    pub test_app: &'a App,
    pub base_app: &'a App,
    pub script: &'a Path,
    pub test_profile: Option<PathBuf>,
    pub base_profile: Option<PathBuf>,
    pub knobs: PipelineKnobs,
    pub stop: StopHandle,
}

impl ProbePipeline<'_> {
    /// One pass over `hosts`, returning the set that failed. Hosts whose
    /// probe never answered are not counted as failures; a later pass
    /// (or the next run) sees them again.
    #[allow(clippy::too_many_arguments)]
    async fn error_pass(
        &self,
        app: &App,
        hosts: &HostSet,
        profile: Option<&PathBuf>,
        prefs: Option<&Vec<String>>,
        num_workers: usize,
        per_worker: usize,
        timeout: f64,
        progress: Option<&(dyn Fn(u64) + Send + Sync)>,
    ) -> Result<HostSet, EngineError> {
        let cfg = PoolConfig {
            num_workers,
            per_worker,
            timeout,
            get_certs: false,
            profile: profile.cloned(),
            prefs: prefs.cloned(),
        };
        let results = run_scans(app, self.script, hosts, &cfg, &self.stop, progress).await?;
        Ok(failures(&results))
    }

    /// The strictly sequential information-extraction pass: every host's
    /// full result is returned, with certificate chains if configured.
    async fn info_pass(
        &self,
        hosts: &HostSet,
        timeout: f64,
        progress: Option<&(dyn Fn(u64) + Send + Sync)>,
    ) -> Result<Vec<ScanResult>, EngineError> {
        let cfg = PoolConfig {
            num_workers: 1,
            per_worker: 1,
            timeout,
            get_certs: self.knobs.get_certs,
            profile: self.test_profile.clone(),
            prefs: self.knobs.prefs_test.clone(),
        };
        let results = run_scans(self.test_app, self.script, hosts, &cfg, &self.stop, progress).await?;
        Ok(results.into_values().collect())
    }

    /// Run the converging passes over one chunk of hosts and extract
    /// diagnostics for the survivors. First-pass scans count as
    /// completed work, every later scan as overhead.
    pub async fn run_regression_passes(
        &self,
        chunk: &HostSet,
        progress: &ProgressTracker,
    ) -> Result<Vec<ScanResult>, EngineError> {
        let completed = |landed: u64| progress.log_completed(landed);
        let overhead = |landed: u64| progress.log_overhead(landed);

        let mut current = chunk.clone();
        let mut num_workers = self.knobs.parallel;
        let mut per_worker = self.knobs.per_worker;
        let mut timeout = self.knobs.timeout;

        for scan_no in 1..=self.knobs.scans {
            let report: &(dyn Fn(u64) + Send + Sync) =
                if scan_no == 1 { &completed } else { &overhead };

            let test_errors = self
                .error_pass(
                    self.test_app,
                    &current,
                    self.test_profile.as_ref(),
                    self.knobs.prefs_test.as_ref(),
                    num_workers,
                    per_worker,
                    timeout,
                    Some(report),
                )
                .await?;
            tracing::info!(
                scan_no,
                errors = test_errors.len(),
                "test candidate pass finished"
            );

            let base_errors = self
                .error_pass(
                    self.base_app,
                    &test_errors,
                    self.base_profile.as_ref(),
                    self.knobs.prefs_base.as_ref(),
                    num_workers,
                    per_worker,
                    timeout,
                    Some(&overhead),
                )
                .await?;
            tracing::info!(
                scan_no,
                errors = base_errors.len(),
                "baseline candidate pass finished"
            );

            current = test_errors.difference(&base_errors);
            if current.is_empty() {
                break;
            }
            (num_workers, per_worker, timeout) =
                decayed(num_workers, per_worker, timeout, self.knobs.max_timeout);
        }

        tracing::debug!(hosts = current.len(), "extracting runtime information");
        let final_results = self.info_pass(&current, timeout, Some(&overhead)).await?;

        if final_results.len() != current.len() {
            let final_hosts: HostSet = final_results
                .iter()
                .map(|result| tlscanary_core::Host::new(result.rank, result.host.clone()))
                .collect();
            let lost = current.difference(&final_hosts);
            tracing::warn!(
                hosts = lost.len(),
                "hosts dropped out of the final error set"
            );
        }
        Ok(final_results)
    }

    /// Verify that the test profile's revocation state is live before a
    /// regression run: every known-revoked host must fail with the full
    /// profile, and succeed once the revocation list is removed.
    pub async fn one_crl_sanity_check(
        &self,
        revoked: &HostSet,
        altered_profile: &Path,
        check_prefs: &[String],
    ) -> Result<bool, EngineError> {
        let prefs = Some(check_prefs.to_vec());

        let with_revocations = self
            .error_pass(
                self.test_app,
                revoked,
                self.test_profile.as_ref(),
                prefs.as_ref(),
                1,
                1,
                self.knobs.timeout,
                None,
            )
            .await?;
        tracing::debug!(
            errors = with_revocations.len(),
            "revocation check with full profile"
        );

        let altered = altered_profile.to_path_buf();
        let without_revocations = self
            .error_pass(
                self.test_app,
                revoked,
                Some(&altered),
                prefs.as_ref(),
                1,
                1,
                self.knobs.timeout,
                None,
            )
            .await?;
        tracing::debug!(
            errors = without_revocations.len(),
            "revocation check with altered profile"
        );

        Ok(with_revocations.len() == revoked.len() && without_revocations.is_empty())
    }
}

/// Hosts whose result violates the success predicate.
pub fn failures(results: &HashMap<String, ScanResult>) -> HostSet {
    results
        .values()
        .filter(|result| !result.success)
        .map(|result| tlscanary_core::Host::new(result.rank, result.host.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn knob_decay_sequence() {
        let max_timeout = 30.0;
        let mut state = (16usize, 50usize, 10.0f64);
        let mut seen = vec![state];
        for _ in 0..4 {
            state = decayed(state.0, state.1, state.2, max_timeout);
            seen.push(state);
        }
        let rounded: Vec<(usize, usize, f64)> = seen
            .iter()
            .map(|(w, p, t)| (*w, *p, (t * 10.0).round() / 10.0))
            .collect();
        assert_eq!(
            rounded,
            vec![
                (16, 50, 10.0),
                (12, 37, 12.5),
                (9, 27, 15.6),
                (6, 20, 19.5),
                (4, 15, 24.4),
            ]
        );
    }

    #[test]
    fn knob_decay_floors_at_one() {
        let (workers, per_worker, timeout) = decayed(1, 1, 100.0, 20.0);
        assert_eq!((workers, per_worker), (1, 1));
        assert!((timeout - 20.0).abs() < f64::EPSILON, "timeout is capped");
    }
}
