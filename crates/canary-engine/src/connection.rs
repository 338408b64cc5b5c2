//! Stateful client connection to one worker's TCP endpoint.
//!
//! Connections are opened ad hoc and reused until they fail. Requests
//! are re-sent after a reconnect where the contract allows it; replies
//! that were in flight when a connection died are gone, and the caller
//! is responsible for re-issuing their commands.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::EngineError;
use crate::wire::{Command, Response};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

pub struct WorkerConnection {
    pub id: Uuid,
    host: String,
    port: u16,
    default_timeout: Duration,
    stream: Option<BufStream<TcpStream>>,
}

impl WorkerConnection {
    pub fn new(port: u16) -> Self {
        Self {
            id: Uuid::new_v4(),
            host: "127.0.0.1".to_string(),
            port,
            default_timeout: DEFAULT_TIMEOUT,
            stream: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn timeout(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or(self.default_timeout)
    }

    fn transport(&self, source: io::Error) -> EngineError {
        EngineError::Transport {
            port: self.port,
            source,
        }
    }

    /// Open the connection. With `reuse`, an already open socket is kept
    /// as is. Connection-refused and address-exhaustion errors are
    /// retried with `retry_delay` until the deadline passes; refusals
    /// happen while a worker is still binding its socket, exhaustion
    /// when the OS hasn't garbage-collected closed sockets yet.
    pub async fn connect(
        &mut self,
        reuse: bool,
        retry_delay: Duration,
        timeout: Option<Duration>,
    ) -> Result<(), EngineError> {
        if self.stream.is_some() {
            if reuse {
                return Ok(());
            }
            tracing::warn!(port = self.port, "connection already open, closing it first");
            self.close().await;
        }

        let timeout = self.timeout(timeout);
        let deadline = Instant::now() + timeout;
        loop {
            if Instant::now() >= deadline {
                return Err(EngineError::Timeout(timeout));
            }
            match tokio::time::timeout_at(
                deadline,
                TcpStream::connect((self.host.as_str(), self.port)),
            )
            .await
            {
                Ok(Ok(stream)) => {
                    self.stream = Some(BufStream::new(stream));
                    return Ok(());
                }
                Ok(Err(err))
                    if matches!(
                        err.kind(),
                        io::ErrorKind::ConnectionRefused | io::ErrorKind::AddrNotAvailable
                    ) =>
                {
                    tracing::warn!(port = self.port, kind = ?err.kind(), "worker connect failed, retrying");
                    tokio::time::sleep(retry_delay.min(deadline - Instant::now())).await;
                }
                Ok(Err(err)) => return Err(self.transport(err)),
                Err(_) => return Err(EngineError::Timeout(timeout)),
            }
        }
    }

    /// Close the connection. All outstanding replies on it are lost.
    /// Idempotent.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }

    pub async fn reconnect(&mut self, timeout: Option<Duration>) -> Result<(), EngineError> {
        self.close().await;
        self.connect(false, DEFAULT_RETRY_DELAY, timeout).await
    }

    /// Write one request line. Returns whether the socket had to be
    /// (re)connected, in which case replies to earlier requests on this
    /// connection are lost and those requests must be re-sent by the
    /// caller. A write failure with `retry` reconnects once without
    /// re-sending the failed request.
    pub async fn send(
        &mut self,
        request: &Command,
        retry: bool,
        timeout: Option<Duration>,
    ) -> Result<bool, EngineError> {
        let timeout = self.timeout(timeout);
        let deadline = Instant::now() + timeout;

        let mut reconnected = false;
        if self.stream.is_none() {
            self.connect(true, DEFAULT_RETRY_DELAY, Some(timeout)).await?;
            reconnected = true;
        }

        let line = format!("{}\n", request.to_line());
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| self_closed_error(self.port))?;

        let write = async {
            stream.write_all(line.as_bytes()).await?;
            stream.flush().await
        };
        match tokio::time::timeout_at(deadline, write).await {
            Ok(Ok(())) => Ok(reconnected),
            Ok(Err(err))
                if matches!(
                    err.kind(),
                    io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
                ) =>
            {
                tracing::warn!(port = self.port, kind = ?err.kind(), "socket error during send");
                if retry {
                    self.reconnect(Some(timeout)).await?;
                    Ok(true)
                } else {
                    self.close().await;
                    Ok(reconnected)
                }
            }
            Ok(Err(err)) => Err(self.transport(err)),
            Err(_) => Err(EngineError::Timeout(timeout)),
        }
    }

    /// Blocking read of exactly one response line. `None` means the
    /// peer closed the connection (EOF or reset); the socket is closed.
    pub async fn receive(&mut self, timeout: Option<Duration>) -> Result<Option<Response>, EngineError> {
        let timeout = self.timeout(timeout);
        let Some(stream) = self.stream.as_mut() else {
            tracing::warn!(port = self.port, "receiving from a closed worker socket");
            return Ok(None);
        };

        let mut line = String::new();
        match tokio::time::timeout(timeout, stream.read_line(&mut line)).await {
            Ok(Ok(0)) => {
                tracing::warn!(port = self.port, "peer closed connection");
                self.close().await;
                Ok(None)
            }
            Ok(Ok(_)) => Ok(Some(Response::parse(line.trim()))),
            Ok(Err(err)) if err.kind() == io::ErrorKind::ConnectionReset => {
                tracing::warn!(port = self.port, "connection reset by peer");
                self.close().await;
                Ok(None)
            }
            Ok(Err(err)) => Err(self.transport(err)),
            Err(_) => Err(EngineError::Timeout(timeout)),
        }
    }

    /// One request, one reply. With `retry`, a connection lost before
    /// the reply arrives causes a re-send on a fresh connection until
    /// the deadline passes.
    pub async fn ask(
        &mut self,
        request: &Command,
        always_reconnect: bool,
        retry: bool,
        timeout: Option<Duration>,
    ) -> Result<Option<Response>, EngineError> {
        let timeout = self.timeout(timeout);
        if always_reconnect {
            self.reconnect(Some(timeout)).await?;
        } else {
            self.connect(true, DEFAULT_RETRY_DELAY, Some(timeout)).await?;
        }

        let deadline = Instant::now() + timeout;
        loop {
            self.send(request, true, Some(timeout)).await?;
            let reply = self.receive(Some(timeout)).await?;
            if reply.is_some() || !retry {
                return Ok(reply);
            }
            if Instant::now() >= deadline {
                return Err(EngineError::Timeout(timeout));
            }
        }
    }

    /// Synchronous ordered round-trips over one connection: each request
    /// is sent and its reply awaited before the next goes out.
    pub async fn chat(
        &mut self,
        requests: &[Command],
        timeout: Option<Duration>,
    ) -> Result<Vec<Response>, EngineError> {
        let timeout = self.timeout(timeout);
        self.connect(true, DEFAULT_RETRY_DELAY, Some(timeout)).await?;

        let mut replies = Vec::with_capacity(requests.len());
        for request in requests {
            let deadline = Instant::now() + timeout;
            let reply = loop {
                self.send(request, true, Some(timeout)).await?;
                if let Some(reply) = self.receive(Some(timeout)).await? {
                    break reply;
                }
                if Instant::now() >= deadline {
                    return Err(EngineError::Timeout(timeout));
                }
            };
            replies.push(reply);
        }
        Ok(replies)
    }

    /// Fire all requests, then collect as many replies. Replies are not
    /// guaranteed to arrive in request order, and after any reconnect
    /// the whole batch is re-sent, so batches must be idempotent.
    pub async fn async_chat(
        &mut self,
        requests: &[Command],
        timeout: Option<Duration>,
    ) -> Result<Vec<Response>, EngineError> {
        let timeout = self.timeout(timeout);
        self.connect(true, DEFAULT_RETRY_DELAY, Some(timeout)).await?;
        let deadline = Instant::now() + timeout;

        'batch: loop {
            if Instant::now() >= deadline {
                self.close().await;
                return Err(EngineError::Timeout(timeout));
            }

            for request in requests {
                if self.send(request, true, Some(timeout)).await? {
                    // Reconnected mid-batch: earlier replies are lost.
                    continue 'batch;
                }
            }

            let mut replies = Vec::with_capacity(requests.len());
            loop {
                match self.receive(Some(timeout)).await {
                    Ok(Some(reply)) => {
                        replies.push(reply);
                        if replies.len() == requests.len() {
                            return Ok(replies);
                        }
                    }
                    Ok(None) => continue 'batch,
                    Err(EngineError::Timeout(_)) if Instant::now() < deadline => continue 'batch,
                    Err(err) => return Err(err),
                }
            }
        }
    }
}

fn self_closed_error(port: u16) -> EngineError {
    EngineError::Transport {
        port,
        source: io::Error::new(io::ErrorKind::NotConnected, "worker socket is closed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    /// Minimal protocol peer: ACKs then answers every command with a
    /// successful final response echoing the command.
    async fn spawn_echo_worker() -> u16 {
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
                        let cmd: serde_json::Value =
                            serde_json::from_str(&line).expect("command json");
                        let id = cmd["id"].as_str().expect("id").to_string();
                        let echo = cmd["mode"].clone();
                        let ack = json!({
                            "id": format!("ACK-{id}"),
                            "worker_id": "echo",
                            "original_cmd": cmd.clone(),
                            "success": null,
                            "result": "ACK",
                            "command_time": 1,
                            "response_time": 1,
                        });
                        let fin = json!({
                            "id": id,
                            "worker_id": "echo",
                            "original_cmd": cmd,
                            "success": true,
                            "result": {"echo": echo},
                            "command_time": 1,
                            "response_time": 2,
                        });
                        let payload = format!("{ack}\n{fin}\n");
                        if write.write_all(payload.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn ask_reads_one_reply_per_call() {
        let port = spawn_echo_worker().await;
        let mut conn = WorkerConnection::new(port).with_timeout(Duration::from_secs(5));

        let cmd = Command::wakeup();
        let ack = conn
            .ask(&cmd, false, true, None)
            .await
            .expect("ask")
            .expect("reply");
        assert!(ack.is_ack());
        assert_eq!(ack.command_id(), Some(cmd.id.to_string().as_str()));

        let fin = conn.receive(None).await.expect("receive").expect("final");
        assert!(fin.as_final().is_some_and(|f| f.is_success()));
        conn.close().await;
    }

    #[tokio::test]
    async fn chat_keeps_request_order() {
        let port = spawn_echo_worker().await;
        let mut conn = WorkerConnection::new(port).with_timeout(Duration::from_secs(5));

        let cmds = vec![Command::info(), Command::wakeup()];
        // Each command produces an ACK and a final line, so a two-command
        // chat consumes ACK and final of the first command, in order.
        let replies = conn.chat(&cmds, None).await.expect("chat");
        assert_eq!(replies.len(), 2);
        assert!(replies[0].is_ack());
        assert_eq!(replies[0].command_id(), Some(cmds[0].id.to_string().as_str()));
        assert_eq!(replies[1].command_id(), Some(cmds[0].id.to_string().as_str()));
        assert!(replies[1].as_final().is_some());

        // The second command's replies are still queued on the socket.
        let ack = conn.receive(None).await.expect("receive").expect("ack");
        assert!(ack.is_ack());
        assert_eq!(ack.command_id(), Some(cmds[1].id.to_string().as_str()));
        let fin = conn.receive(None).await.expect("receive").expect("final");
        assert_eq!(fin.command_id(), Some(cmds[1].id.to_string().as_str()));
        conn.close().await;
    }

    #[tokio::test]
    async fn receive_reports_peer_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        tokio::spawn(async move {
            // Accept and immediately drop the connection.
            let _ = listener.accept().await;
        });

        let mut conn = WorkerConnection::new(port).with_timeout(Duration::from_secs(5));
        conn.connect(true, Duration::from_millis(10), None)
            .await
            .expect("connect");
        let reply = conn.receive(None).await.expect("receive");
        assert!(reply.is_none());
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn connect_times_out_when_nobody_listens() {
        // Bind and drop to get a port that refuses connections.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let mut conn = WorkerConnection::new(port);
        let result = conn
            .connect(true, Duration::from_millis(10), Some(Duration::from_millis(200)))
            .await;
        assert!(matches!(result, Err(EngineError::Timeout(_))));
    }
}
