//! Fixed-size pool of supervised workers servicing scan commands over
//! persistent connections.
//!
//! Hosts are partitioned into per-worker chunks; within a chunk all
//! commands are in flight concurrently and replies drain as they come.
//! The pool itself is a single cooperative select loop; the only other
//! tasks are the per-worker chunk runners and the subprocess output
//! readers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;

use tlscanary_core::sources::{Host, HostSet};

use crate::app::App;
use crate::connection::WorkerConnection;
use crate::error::EngineError;
use crate::stop::StopHandle;
use crate::supervisor::WorkerSupervisor;
use crate::wire::{Command, Response, ScanResult};

/// Sockets reserved for everything that is not a worker connection.
const SOCKET_OVERHEAD: u64 = 64;
/// A wakeup keep-alive goes out every this many scan commands.
const WAKEUP_INTERVAL: usize = 10;

/// Progress callback, invoked with the number of results just landed.
pub type ProgressFn<'a> = &'a (dyn Fn(u64) + Send + Sync);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub num_workers: usize,
    /// Chunk size and per-worker in-flight bound.
    pub per_worker: usize,
    /// Per-probe timeout in seconds, forwarded to the worker.
    pub timeout: f64,
    pub get_certs: bool,
    pub profile: Option<PathBuf>,
    pub prefs: Option<Vec<String>>,
}

enum WorkerEvent {
    ChunkDone {
        worker: usize,
        results: Vec<ScanResult>,
    },
}

/// Run one scan pass over a host set. The result map is keyed by
/// hostname; hosts whose probe never answered are absent, and the
/// caller decides what missingness means for its pass.
pub async fn run_scans(
    app: &App,
    script: &Path,
    hosts: &HostSet,
    cfg: &PoolConfig,
    stop: &StopHandle,
    progress: Option<ProgressFn<'_>>,
) -> Result<HashMap<String, ScanResult>, EngineError> {
    if hosts.is_empty() {
        return Ok(HashMap::new());
    }
    if stop.is_stopped() {
        return Err(EngineError::Cancelled);
    }

    let per_worker = cfg.per_worker.max(1);
    let mut chunks: VecDeque<Vec<Host>> = hosts
        .by_rank()
        .chunks(per_worker)
        .map(<[Host]>::to_vec)
        .collect();
    let num_workers = cfg.num_workers.max(1).min(chunks.len());
    check_socket_budget(num_workers, per_worker)?;
    tracing::debug!(
        hosts = hosts.len(),
        num_workers,
        per_worker,
        chunks = chunks.len(),
        "starting scan pass"
    );

    // Spawn the worker fleet up front; a startup failure tears down
    // whatever part of the fleet already runs.
    let mut supervisors: Vec<WorkerSupervisor> = Vec::with_capacity(num_workers);
    let mut ports = Vec::with_capacity(num_workers);
    for _ in 0..num_workers {
        let mut supervisor =
            WorkerSupervisor::new(app, script, cfg.profile.clone(), cfg.prefs.clone());
        match supervisor.spawn(0).await {
            Ok(port) => {
                ports.push(port);
                supervisors.push(supervisor);
            }
            Err(err) => {
                teardown(&mut supervisors, stop).await;
                return Err(err);
            }
        }
    }

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<WorkerEvent>();
    let mut chunk_txs: Vec<mpsc::Sender<Vec<Host>>> = Vec::with_capacity(num_workers);
    let mut worker_tasks = JoinSet::new();
    for (idx, (supervisor, port)) in supervisors.iter().zip(&ports).enumerate() {
        let (tx, mut rx) = mpsc::channel::<Vec<Host>>(1);
        chunk_txs.push(tx);

        let worker_id = supervisor.id().to_string();
        let port = *port;
        let timeout = cfg.timeout;
        let get_certs = cfg.get_certs;
        let stop = stop.clone();
        let event_tx = event_tx.clone();
        worker_tasks.spawn(async move {
            let mut conn = WorkerConnection::new(port);
            while let Some(chunk) = rx.recv().await {
                let results =
                    scan_chunk(&mut conn, &worker_id, &chunk, timeout, get_certs, &stop).await;
                if event_tx
                    .send(WorkerEvent::ChunkDone {
                        worker: idx,
                        results,
                    })
                    .is_err()
                {
                    break;
                }
            }
            conn.close().await;
            idx
        });
    }
    drop(event_tx);

    let mut results: HashMap<String, ScanResult> = HashMap::new();
    let mut idle = vec![true; num_workers];
    let mut live = vec![true; num_workers];

    let outcome: Result<(), EngineError> = loop {
        // Hand pending chunks to idle workers.
        for worker in 0..num_workers {
            if !idle[worker] || !live[worker] {
                continue;
            }
            let Some(chunk) = chunks.pop_front() else {
                break;
            };
            match chunk_txs[worker].try_send(chunk) {
                Ok(()) => idle[worker] = false,
                Err(err) => {
                    chunks.push_front(err.into_inner());
                    live[worker] = false;
                }
            }
        }

        let all_drained = chunks.is_empty()
            && idle
                .iter()
                .zip(&live)
                .all(|(is_idle, is_live)| *is_idle || !*is_live);
        if all_drained {
            break Ok(());
        }
        if live.iter().all(|is_live| !*is_live) {
            break Err(EngineError::WorkersLost {
                remaining: chunks.len(),
            });
        }

        tokio::select! {
            _ = stop.notified() => {
                break Err(EngineError::Cancelled);
            }
            event = event_rx.recv() => {
                match event {
                    Some(WorkerEvent::ChunkDone { worker, results: chunk_results }) => {
                        idle[worker] = true;
                        let landed = chunk_results.len() as u64;
                        for result in chunk_results {
                            results.insert(result.host.clone(), result);
                        }
                        if landed > 0 {
                            if let Some(report) = progress {
                                report(landed);
                            }
                        }
                    }
                    None => {
                        break Err(EngineError::WorkersLost { remaining: chunks.len() });
                    }
                }
            }
            joined = worker_tasks.join_next(), if !worker_tasks.is_empty() => {
                match joined {
                    Some(Ok(worker)) => {
                        tracing::warn!(worker, "worker task exited mid-run");
                        if let Some(slot) = live.get_mut(worker) {
                            *slot = false;
                        }
                    }
                    Some(Err(err)) => {
                        tracing::error!(%err, "worker task failed");
                    }
                    None => {}
                }
            }
        }
    };

    // Teardown is unconditional: no subprocess outlives the pool.
    drop(chunk_txs);
    if outcome.is_err() {
        worker_tasks.abort_all();
    }
    while worker_tasks.join_next().await.is_some() {}
    teardown(&mut supervisors, stop).await;

    outcome.map(|()| results)
}

/// Wind the fleet down. Workers get a clean quit unless a hard stop was
/// requested, in which case they are killed outright.
async fn teardown(supervisors: &mut [WorkerSupervisor], stop: &StopHandle) {
    for supervisor in supervisors.iter_mut() {
        if stop.is_hard_stopped() {
            supervisor.kill().await;
        } else {
            supervisor.quit().await;
        }
    }
}

/// Run one chunk through a worker: stream out all scan commands, then
/// collect replies until everything answered or the deadline lapsed.
/// ACKs of scan commands push the deadline out; hosts without a final
/// response are dropped from the chunk's results.
async fn scan_chunk(
    conn: &mut WorkerConnection,
    worker_id: &str,
    chunk: &[Host],
    timeout_secs: f64,
    get_certs: bool,
    stop: &StopHandle,
) -> Vec<ScanResult> {
    let timeout = Duration::from_secs_f64(timeout_secs.max(0.1));
    let max_wait = timeout.mul_f64(1.5);

    let commands: Vec<Command> = chunk
        .iter()
        .map(|host| Command::scan(&host.hostname, host.rank, get_certs, timeout_secs))
        .collect();

    for (sent, command) in commands.iter().enumerate() {
        if stop.is_stopped() {
            return Vec::new();
        }
        if let Err(err) = conn.send(command, true, Some(timeout)).await {
            tracing::warn!(worker = worker_id, %err, "failed to send scan command");
            return Vec::new();
        }
        if sent % WAKEUP_INTERVAL == 0 {
            let _ = conn.send(&Command::wakeup(), true, Some(timeout)).await;
        }
    }

    let scan_ids: HashSet<String> = commands.iter().map(|c| c.id.to_string()).collect();
    let mut results: Vec<ScanResult> = Vec::new();
    let mut seen_hosts: HashSet<String> = HashSet::new();
    let mut deadline = Instant::now() + timeout + Duration::from_secs(1);

    while results.len() < chunk.len() && !stop.is_stopped() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let wait = (deadline - now).min(max_wait);
        match conn.receive(Some(wait)).await {
            Ok(Some(Response::Ack { command_id, .. })) => {
                // Only scan ACKs reset the clock; wakeups don't count.
                if scan_ids.contains(&command_id) {
                    deadline = Instant::now() + timeout + Duration::from_secs(1);
                }
            }
            Ok(Some(Response::Final(final_response))) => {
                if !scan_ids.contains(&final_response.command_id) {
                    continue;
                }
                match ScanResult::from_response(final_response) {
                    Some(result) => {
                        if seen_hosts.insert(result.host.clone()) {
                            results.push(result);
                        }
                    }
                    None => {
                        tracing::warn!(worker = worker_id, "scan response lacks host attribution");
                    }
                }
            }
            Ok(Some(Response::Malformed { raw })) => {
                tracing::warn!(worker = worker_id, raw, "malformed worker response");
            }
            Ok(None) => {
                tracing::warn!(worker = worker_id, "connection closed mid-chunk");
                break;
            }
            Err(EngineError::Timeout(_)) => break,
            Err(err) => {
                tracing::warn!(worker = worker_id, %err, "receive failed mid-chunk");
                break;
            }
        }
    }

    if results.len() < chunk.len() {
        tracing::warn!(
            worker = worker_id,
            yielded = results.len(),
            expected = chunk.len(),
            "worker dropped results"
        );
    }
    results
}

fn check_socket_budget(num_workers: usize, per_worker: usize) -> Result<(), EngineError> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        return Ok(());
    }
    let needed = (num_workers * per_worker) as u64 + SOCKET_OVERHEAD;
    if needed > limit.rlim_cur as u64 {
        return Err(EngineError::SocketBudget {
            needed,
            limit: limit.rlim_cur as u64,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    /// Mock probe host: ACKs every command; scans get a final response
    /// per the per-host script, hosts marked silent never answer.
    async fn spawn_mock_worker(behavior: fn(&str) -> Option<Value>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let (read, mut write) = stream.into_split();
                    let mut lines = BufReader::new(read).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let cmd: Value = serde_json::from_str(&line).expect("command json");
                        let id = cmd["id"].as_str().expect("id").to_string();
                        let mode = cmd["mode"].as_str().expect("mode").to_string();

                        let ack = json!({
                            "id": format!("ACK-{id}"),
                            "worker_id": "mock",
                            "original_cmd": cmd.clone(),
                            "success": null,
                            "result": "ACK",
                            "command_time": 1,
                            "response_time": 1,
                        });
                        if write
                            .write_all(format!("{ack}\n").as_bytes())
                            .await
                            .is_err()
                        {
                            return;
                        }

                        let result = match mode.as_str() {
                            "scan" => {
                                let host = cmd["args"]["host"].as_str().expect("host");
                                match behavior(host) {
                                    Some(result) => result,
                                    None => continue, // silent host: ACK only
                                }
                            }
                            _ => json!({}),
                        };
                        let success = result
                            .get("origin")
                            .and_then(Value::as_str)
                            .map(|origin| origin == "load_handler");
                        let fin = json!({
                            "id": id,
                            "worker_id": "mock",
                            "original_cmd": cmd,
                            "success": success.unwrap_or(true),
                            "result": result,
                            "command_time": 100,
                            "response_time": 150,
                        });
                        if write
                            .write_all(format!("{fin}\n").as_bytes())
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                });
            }
        });
        port
    }

    fn mixed_behavior(host: &str) -> Option<Value> {
        match host {
            "silent.example" => None,
            "revoked.example" => Some(json!({
                "origin": "error_handler",
                "info": {"status": 0x805a_2ff3u64, "error_class": 2},
            })),
            "redirect.example" => Some(json!({
                "origin": "error_handler",
                "info": {"status": 0, "original_uri": "https://redirect.example/"},
            })),
            _ => Some(json!({
                "origin": "load_handler",
                "info": {"status": 0},
            })),
        }
    }

    #[tokio::test]
    async fn chunk_collects_results_and_drops_silent_hosts() {
        let port = spawn_mock_worker(mixed_behavior).await;
        let mut conn = WorkerConnection::new(port);
        let stop = StopHandle::new();

        let chunk = vec![
            Host::new(1, "good.example"),
            Host::new(2, "revoked.example"),
            Host::new(3, "redirect.example"),
            Host::new(4, "silent.example"),
        ];
        let results = scan_chunk(&mut conn, "w0", &chunk, 0.5, false, &stop).await;
        conn.close().await;

        let by_host: HashMap<String, ScanResult> = results
            .into_iter()
            .map(|result| (result.host.clone(), result))
            .collect();
        assert_eq!(by_host.len(), 3, "silent host is dropped");
        assert!(!by_host.contains_key("silent.example"));
        assert!(by_host["good.example"].success);
        assert!(by_host["redirect.example"].success, "benign redirect");
        assert!(!by_host["revoked.example"].success);
    }

    #[tokio::test]
    async fn chunk_respects_stop_requests() {
        let port = spawn_mock_worker(mixed_behavior).await;
        let mut conn = WorkerConnection::new(port);
        let stop = StopHandle::new();
        stop.request_stop();

        let chunk = vec![Host::new(1, "good.example")];
        let results = scan_chunk(&mut conn, "w0", &chunk, 5.0, false, &stop).await;
        assert!(results.is_empty());
    }

    #[test]
    fn socket_budget_is_enforced() {
        assert!(check_socket_budget(1, 1).is_ok());
        let err = check_socket_budget(10_000, 10_000);
        assert!(matches!(err, Err(EngineError::SocketBudget { .. })));
    }
}
