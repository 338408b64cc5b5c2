use std::fmt;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;

#[derive(Debug, Parser)]
#[command(
    name = "tlscanary",
    version,
    about = "TLS regression test harness comparing browser builds against live hosts"
)]
pub struct Cli {
    /// Enable debug logging.
    #[arg(short, long, env = "TLSCANARY_DEBUG", global = true, default_value_t = false)]
    pub debug: bool,

    /// Path to the working directory (default `~/.tlscanary`).
    #[arg(short, long, env = "TLSCANARY_WORKDIR", global = true)]
    pub workdir: Option<PathBuf>,

    #[command(subcommand)]
    pub mode: ModeCommand,
}

#[derive(Debug, Subcommand)]
pub enum ModeCommand {
    /// Run a TLS regression test on two builds.
    Regression(ScanArgs),
    /// Collect connection state info on hosts with a single build.
    Scan(ScanArgs),
    /// Compare TLS connection speed between two builds.
    Performance(ScanArgs),
    /// Rebuild a host database from a raw top-sites list.
    Srcupdate(ScanArgs),
}

impl ModeCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ModeCommand::Regression(_) => "regression",
            ModeCommand::Scan(_) => "scan",
            ModeCommand::Performance(_) => "performance",
            ModeCommand::Srcupdate(_) => "srcupdate",
        }
    }

    pub fn args(&self) -> &ScanArgs {
        match self {
            ModeCommand::Regression(args)
            | ModeCommand::Scan(args)
            | ModeCommand::Performance(args)
            | ModeCommand::Srcupdate(args) => args,
        }
    }
}

/// OneCRL revocation environment used for test profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OneCrlEnv {
    Production,
    Stage,
    /// Leave the default profile's revocation state untouched.
    None,
}

impl fmt::Display for OneCrlEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OneCrlEnv::Production => "production",
            OneCrlEnv::Stage => "stage",
            OneCrlEnv::None => "none",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Args, Serialize)]
pub struct ScanArgs {
    /// Path to the extracted build under test.
    #[arg(short = 't', long, env = "TLSCANARY_TEST_BUILD")]
    pub test: Option<PathBuf>,

    /// Path to the extracted baseline build.
    #[arg(short = 'b', long, env = "TLSCANARY_BASE_BUILD")]
    pub base: Option<PathBuf>,

    /// Path to the probe script loaded into each worker.
    #[arg(long, env = "TLSCANARY_PROBE_SCRIPT")]
    pub script: Option<PathBuf>,

    /// Sources database handle, or `list` to show the known databases.
    #[arg(short = 's', long)]
    pub source: Option<String>,

    /// Maximum number of hosts to test.
    #[arg(short = 'l', long)]
    pub limit: Option<usize>,

    /// Number of parallel workers.
    #[arg(short = 'j', long, default_value_t = 4)]
    pub parallel: usize,

    /// Number of in-flight probes per worker.
    #[arg(short = 'n', long, default_value_t = 50)]
    pub requests_per_worker: usize,

    /// Per-probe timeout in seconds.
    #[arg(short = 'm', long, default_value_t = 10.0)]
    pub timeout: f64,

    /// Ceiling for the decaying pass timeout in seconds.
    #[arg(long, default_value_t = 20.0)]
    pub max_timeout: f64,

    /// Number of converging scan passes.
    #[arg(short = 'x', long, default_value_t = 3)]
    pub scans: u32,

    /// Prefs applied to both builds, as `NAME;VALUE`.
    #[arg(short = 'p', long = "prefs")]
    pub prefs: Vec<String>,

    /// Prefs applied to the test build only.
    #[arg(long)]
    pub prefs_test: Vec<String>,

    /// Prefs applied to the baseline build only.
    #[arg(long)]
    pub prefs_base: Vec<String>,

    /// OneCRL revocation environment baked into the test profile.
    #[arg(short = 'o', long, value_enum, default_value_t = OneCrlEnv::Production)]
    pub onecrl: OneCrlEnv,

    /// Omit certificate chains from the final pass and the run log.
    #[arg(long, default_value_t = false)]
    pub remove_certs: bool,

    /// Raw, headerless `rank,hostname` CSV consumed by srcupdate runs.
    #[arg(long)]
    pub raw_list: Option<PathBuf>,
}

impl ScanArgs {
    /// Global prefs plus the test-build specific ones.
    pub fn effective_prefs_test(&self) -> Option<Vec<String>> {
        merge_prefs(&self.prefs, &self.prefs_test)
    }

    /// Global prefs plus the baseline-build specific ones.
    pub fn effective_prefs_base(&self) -> Option<Vec<String>> {
        merge_prefs(&self.prefs, &self.prefs_base)
    }
}

fn merge_prefs(global: &[String], specific: &[String]) -> Option<Vec<String>> {
    let merged: Vec<String> = global.iter().chain(specific).cloned().collect();
    if merged.is_empty() { None } else { Some(merged) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_pref_merging() {
        let cli = Cli::parse_from(["tlscanary", "regression", "-t", "/b/test", "-b", "/b/base"]);
        assert_eq!(cli.mode.name(), "regression");
        let args = cli.mode.args();
        assert_eq!(args.parallel, 4);
        assert_eq!(args.requests_per_worker, 50);
        assert_eq!(args.scans, 3);
        assert!((args.timeout - 10.0).abs() < f64::EPSILON);
        assert!(args.effective_prefs_test().is_none());

        let cli = Cli::parse_from([
            "tlscanary",
            "regression",
            "-p",
            "security.OCSP.enabled;0",
            "--prefs-test",
            "security.tls.version.max;4",
        ]);
        let args = cli.mode.args();
        assert_eq!(
            args.effective_prefs_test().as_deref(),
            Some(
                &[
                    "security.OCSP.enabled;0".to_string(),
                    "security.tls.version.max;4".to_string()
                ][..]
            )
        );
        assert_eq!(
            args.effective_prefs_base().as_deref(),
            Some(&["security.OCSP.enabled;0".to_string()][..])
        );
    }
}
