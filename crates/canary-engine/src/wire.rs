//! The line-oriented JSON protocol spoken with probe-host workers.
//!
//! Requests are [`Command`] objects, one JSON object per line. For every
//! command the worker emits an ACK line on receipt and a final response
//! line when processing completes, both carrying the command id.

use std::path::Path;

use serde::Serialize;
use serde_json::{Value, json};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandMode {
    Info,
    Scan,
    UseProfile,
    SetPrefs,
    SetId,
    Quit,
    Wakeup,
}

impl CommandMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandMode::Info => "info",
            CommandMode::Scan => "scan",
            CommandMode::UseProfile => "useprofile",
            CommandMode::SetPrefs => "setprefs",
            CommandMode::SetId => "setid",
            CommandMode::Quit => "quit",
            CommandMode::Wakeup => "wakeup",
        }
    }
}

/// A request to a worker. Immutable once constructed; the id ties the
/// ACK and final response back to it.
#[derive(Debug, Clone, Serialize)]
pub struct Command {
    pub id: Uuid,
    pub mode: CommandMode,
    pub args: Value,
}

impl Command {
    fn new(mode: CommandMode, args: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            mode,
            args,
        }
    }

    pub fn info() -> Self {
        Self::new(CommandMode::Info, json!({}))
    }

    pub fn scan(host: &str, rank: u64, include_certificates: bool, timeout_secs: f64) -> Self {
        Self::new(
            CommandMode::Scan,
            json!({
                "host": host,
                "rank": rank,
                "include_certificates": include_certificates,
                "timeout": timeout_secs,
            }),
        )
    }

    pub fn use_profile(path: &Path) -> Self {
        Self::new(CommandMode::UseProfile, json!({"path": path}))
    }

    /// Each pref is a `NAME;VALUE` string.
    pub fn set_prefs(prefs: &[String]) -> Self {
        Self::new(CommandMode::SetPrefs, json!({"prefs": prefs}))
    }

    pub fn set_id(id: &str) -> Self {
        Self::new(CommandMode::SetId, json!({"id": id}))
    }

    pub fn quit() -> Self {
        Self::new(CommandMode::Quit, json!({}))
    }

    pub fn wakeup() -> Self {
        Self::new(CommandMode::Wakeup, json!({}))
    }

    /// The wire form, without the terminating newline.
    pub fn to_line(&self) -> String {
        // Command serialization cannot fail: all fields are JSON-native.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
struct RawResponse {
    id: Option<String>,
    worker_id: Option<String>,
    original_cmd: Option<Value>,
    success: Option<bool>,
    result: Option<Value>,
    command_time: Option<i64>,
    response_time: Option<i64>,
}

/// A worker's final response to one command.
#[derive(Debug, Clone)]
pub struct FinalResponse {
    pub command_id: String,
    pub worker_id: Option<String>,
    pub original_cmd: Option<Value>,
    pub success: Option<bool>,
    pub result: Value,
    /// Epoch milliseconds when the worker accepted the command.
    pub command_time: i64,
    /// Epoch milliseconds when the worker produced the response.
    pub response_time: i64,
}

impl FinalResponse {
    pub fn is_success(&self) -> bool {
        self.success == Some(true)
    }

    /// Run-log form of the response.
    pub fn to_value(&self) -> Value {
        json!({
            "id": self.command_id,
            "original_cmd": self.original_cmd,
            "worker_id": self.worker_id,
            "success": self.success,
            "result": self.result,
            "command_time": self.command_time,
            "response_time": self.response_time,
        })
    }
}

/// One line received from a worker.
#[derive(Debug, Clone)]
pub enum Response {
    /// Immediate receipt acknowledgement; the final response follows.
    Ack {
        command_id: String,
        original_cmd: Option<Value>,
    },
    Final(FinalResponse),
    /// Not attributable to any command; treated as an individual failure.
    Malformed { raw: String },
}

impl Response {
    pub fn parse(line: &str) -> Self {
        let raw: RawResponse = match serde_json::from_str(line) {
            Ok(raw) => raw,
            Err(_) => {
                return Response::Malformed {
                    raw: line.to_string(),
                };
            }
        };
        let Some(id) = raw.id else {
            return Response::Malformed {
                raw: line.to_string(),
            };
        };
        // ACK lines may carry the command id with an "ACK-" prefix.
        let command_id = id.strip_prefix("ACK-").unwrap_or(&id).to_string();

        let is_ack = raw
            .result
            .as_ref()
            .and_then(Value::as_str)
            .is_some_and(|result| result.starts_with("ACK"));
        if is_ack {
            return Response::Ack {
                command_id,
                original_cmd: raw.original_cmd,
            };
        }

        Response::Final(FinalResponse {
            command_id,
            worker_id: raw.worker_id,
            original_cmd: raw.original_cmd,
            success: raw.success,
            result: raw.result.unwrap_or(Value::Null),
            command_time: raw.command_time.unwrap_or_default(),
            response_time: raw.response_time.unwrap_or_default(),
        })
    }

    pub fn command_id(&self) -> Option<&str> {
        match self {
            Response::Ack { command_id, .. } => Some(command_id),
            Response::Final(response) => Some(&response.command_id),
            Response::Malformed { .. } => None,
        }
    }

    pub fn is_ack(&self) -> bool {
        matches!(self, Response::Ack { .. })
    }

    pub fn as_final(&self) -> Option<&FinalResponse> {
        match self {
            Response::Final(response) => Some(response),
            _ => None,
        }
    }

    pub fn into_final(self) -> Option<FinalResponse> {
        match self {
            Response::Final(response) => Some(response),
            _ => None,
        }
    }
}

const STATUS_MODULE_MASK: u32 = 0x00ff_0000;
const STATUS_SECURITY_MODULE: u32 = 0x005a_0000;
const ERROR_CLASS_BAD_CERT: u64 = 2;

/// Failure classification for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    Certificate,
    Protocol,
    Network,
}

impl ErrorType {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorType::Certificate => "certificate",
            ErrorType::Protocol => "protocol",
            ErrorType::Network => "network",
        }
    }
}

/// The outcome of one `scan` command against one host.
#[derive(Debug, Clone)]
pub struct ScanResult {
    pub host: String,
    pub rank: u64,
    pub success: bool,
    pub response: FinalResponse,
}

impl ScanResult {
    /// Build a result from a final response, pulling host and rank back
    /// out of the echoed command. Responses that don't echo a scan
    /// command can't be attributed and yield `None`.
    pub fn from_response(response: FinalResponse) -> Option<Self> {
        let args = response.original_cmd.as_ref()?.get("args")?;
        let host = args.get("host")?.as_str()?.to_string();
        let rank = args.get("rank")?.as_u64()?;
        let success = Self::evaluate_success(&response);
        Some(Self {
            host,
            rank,
            success,
            response,
        })
    }

    /// The single place deciding whether a scan response counts as a
    /// working host.
    ///
    /// A response is successful when the worker's load handler reported
    /// success, or when the error handler fired with status `NS_OK`:
    /// that combination is how the worker reports a redirect whose first
    /// hop completed its handshake, so it must not count as a failure.
    pub fn evaluate_success(response: &FinalResponse) -> bool {
        if response.is_success() {
            return true;
        }
        let info = &response.result["info"];
        let origin = response.result.get("origin").and_then(Value::as_str);
        let status = info.get("status").and_then(Value::as_u64);
        if origin == Some("error_handler") && status == Some(0) {
            if let Some(uri) = info.get("original_uri").and_then(Value::as_str) {
                tracing::debug!(uri, "ignored redirect");
            }
            return true;
        }
        false
    }

    /// Failure classification; `None` for successful scans. Statuses in
    /// the security-module range split into certificate and protocol
    /// errors by the worker's error class, everything else is a network
    /// error.
    pub fn error_type(&self) -> Option<ErrorType> {
        if self.success {
            return None;
        }
        let info = &self.response.result["info"];
        let status = info.get("status").and_then(Value::as_u64).unwrap_or(0) as u32;
        if status & STATUS_MODULE_MASK == STATUS_SECURITY_MODULE {
            let error_class = info.get("error_class").and_then(Value::as_u64);
            if error_class == Some(ERROR_CLASS_BAD_CERT) {
                Some(ErrorType::Certificate)
            } else {
                Some(ErrorType::Protocol)
            }
        } else {
            Some(ErrorType::Network)
        }
    }

    /// Milliseconds between command acceptance and response.
    pub fn connection_speed_ms(&self) -> i64 {
        self.response.response_time - self.response.command_time
    }

    /// Run-log line for this result.
    pub fn to_log_value(&self) -> Value {
        let mut line = json!({
            "host": self.host,
            "rank": self.rank,
            "success": self.success,
            "response": self.response.to_value(),
        });
        if let Some(error_type) = self.error_type() {
            line["error"] = json!({"type": error_type.as_str()});
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_response(success: Option<bool>, origin: &str, status: u64, error_class: u64) -> FinalResponse {
        let cmd = Command::scan("www.mozilla.org", 17, false, 10.0);
        FinalResponse {
            command_id: cmd.id.to_string(),
            worker_id: Some("w0".to_string()),
            original_cmd: Some(serde_json::to_value(&cmd).expect("command json")),
            success,
            result: json!({
                "origin": origin,
                "info": {
                    "status": status,
                    "error_class": error_class,
                    "original_uri": "https://www.mozilla.org/",
                },
            }),
            command_time: 1000,
            response_time: 1350,
        }
    }

    #[test]
    fn command_line_framing() {
        let cmd = Command::scan("mozilla.org", 1, true, 10.0);
        let line = cmd.to_line();
        let parsed: Value = serde_json::from_str(&line).expect("valid JSON");
        assert_eq!(parsed["mode"], "scan");
        assert_eq!(parsed["args"]["host"], "mozilla.org");
        assert_eq!(parsed["args"]["include_certificates"], true);
        assert!(!line.contains('\n'));

        assert_eq!(Command::use_profile(Path::new("/tmp/p")).mode.as_str(), "useprofile");
        assert_eq!(Command::set_id("w1").mode.as_str(), "setid");
    }

    #[test]
    fn ack_and_final_share_the_command_id() {
        let id = Uuid::new_v4();
        let ack = Response::parse(&format!(
            r#"{{"id":"ACK-{id}","worker_id":"w0","result":"ACK"}}"#
        ));
        assert!(ack.is_ack());
        assert_eq!(ack.command_id(), Some(id.to_string().as_str()));

        let fin = Response::parse(&format!(
            r#"{{"id":"{id}","worker_id":"w0","success":true,"result":{{}},"command_time":1,"response_time":2}}"#
        ));
        assert_eq!(fin.command_id(), Some(id.to_string().as_str()));
        assert!(fin.as_final().is_some_and(FinalResponse::is_success));
    }

    #[test]
    fn malformed_lines_are_contained() {
        assert!(matches!(Response::parse("not json"), Response::Malformed { .. }));
        assert!(matches!(Response::parse("{}"), Response::Malformed { .. }));
    }

    #[test]
    fn benign_redirect_counts_as_success() {
        let response = scan_response(Some(false), "error_handler", 0, 0);
        assert!(ScanResult::evaluate_success(&response));
        let result = ScanResult::from_response(response).expect("scan result");
        assert!(result.success);
        assert!(result.error_type().is_none());
    }

    #[test]
    fn certificate_errors_are_classified() {
        let response = scan_response(Some(false), "error_handler", 0x805a_2ff3, 2);
        assert!(!ScanResult::evaluate_success(&response));
        let result = ScanResult::from_response(response).expect("scan result");
        assert_eq!(result.host, "www.mozilla.org");
        assert_eq!(result.rank, 17);
        assert_eq!(result.error_type(), Some(ErrorType::Certificate));
        assert_eq!(result.to_log_value()["error"]["type"], "certificate");
    }

    #[test]
    fn protocol_and_network_errors_are_classified() {
        let protocol = ScanResult::from_response(scan_response(Some(false), "error_handler", 0x805a_1ff0, 1))
            .expect("scan result");
        assert_eq!(protocol.error_type(), Some(ErrorType::Protocol));

        let network = ScanResult::from_response(scan_response(None, "timeout_handler", 0x804b_000d, 0))
            .expect("scan result");
        assert_eq!(network.error_type(), Some(ErrorType::Network));
        assert_eq!(network.connection_speed_ms(), 350);
    }

    #[test]
    fn unattributable_responses_yield_none() {
        let mut response = scan_response(Some(true), "load_handler", 0, 0);
        response.original_cmd = None;
        assert!(ScanResult::from_response(response).is_none());
    }
}
