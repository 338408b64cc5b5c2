mod cli;
mod error;
mod modes;
mod one_crl;
mod shutdown;

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use tlscanary_core::Workdir;
use tlscanary_core::sources_db::SourcesDB;
use tlscanary_engine::StopHandle;

use crate::cli::{Cli, ModeCommand};
use crate::error::CanaryError;
use crate::modes::{
    ModeContext, PerformanceMode, RegressionMode, ScanMode, SrcUpdateMode, drive,
};

/// Open-file limit requested at startup; large pools hold one socket
/// per in-flight probe.
const NOFILE_TARGET: u64 = 3000;

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Raise the soft open-file limit to `min(3000, hard_limit)`.
fn raise_nofile_limit() {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        tracing::warn!("can't query the open-file limit");
        return;
    }
    let target = NOFILE_TARGET.min(limit.rlim_max as u64) as libc::rlim_t;
    if target <= limit.rlim_cur {
        return;
    }
    limit.rlim_cur = target;
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &limit) } != 0 {
        tracing::warn!("can't raise the open-file limit");
    } else {
        tracing::debug!(limit = target, "raised open-file limit");
    }
}

fn list_sources(workdir: &Workdir) -> Result<(), CanaryError> {
    let db = SourcesDB::open(workdir)?;
    println!("Available test sets:");
    for handle in db.list() {
        let sources = db.read(&handle)?;
        let default = if handle == db.default { " (default)" } else { "" };
        println!("  - {handle} [{} hosts]{default}", sources.len());
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<(), CanaryError> {
    let workdir = Workdir::new(
        cli.workdir
            .clone()
            .unwrap_or_else(Workdir::default_root),
    );
    workdir
        .ensure()
        .map_err(|err| CanaryError::Setup(format!("can't create working directory: {err}")))?;
    raise_nofile_limit();

    if cli.mode.args().source.as_deref() == Some("list") {
        return list_sources(&workdir);
    }

    let tmp_dir = tempfile::Builder::new()
        .prefix("tlscanary_")
        .tempdir()
        .map_err(|err| CanaryError::Setup(format!("can't create temp directory: {err}")))?;
    tracing::debug!(path = %tmp_dir.path().display(), "created temp dir");

    let stop = StopHandle::new();
    shutdown::spawn_ctrl_c_handler(stop.clone());
    tracing::info!(mode = cli.mode.name(), "starting run");

    let ctx = ModeContext {
        workdir,
        tmp_dir: tmp_dir.path().to_path_buf(),
        stop: stop.clone(),
    };

    let mode_run = async {
        match cli.mode {
            ModeCommand::Regression(args) => drive(&mut RegressionMode::new(args), &ctx).await,
            ModeCommand::Scan(args) => drive(&mut ScanMode::new(args), &ctx).await,
            ModeCommand::Performance(args) => drive(&mut PerformanceMode::new(args), &ctx).await,
            ModeCommand::Srcupdate(args) => drive(&mut SrcUpdateMode::new(args), &ctx).await,
        }
    };
    // A hard stop abandons the mode mid-flight. The pool sees the hard
    // flag and kills its workers; whatever is still alive when the mode
    // future drops goes down with its kill-on-drop child handles, so no
    // subprocess outlives the run.
    let result = tokio::select! {
        result = mode_run => result,
        () = stop.hard_notified() => Err(CanaryError::Interrupted),
    };

    // The temp dir (profiles included) is removed however the run went.
    drop(tmp_dir);
    result
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug);
    tracing::debug!(?cli, "command arguments");

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match &err {
                CanaryError::Interrupted => tracing::error!("user interrupt, quitting"),
                other => tracing::error!("{other:#}"),
            }
            ExitCode::from(err.exit_code())
        }
    }
}
