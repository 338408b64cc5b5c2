//! The external browser build under test and its probe-host invocation.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::Serialize;
use serde_json::Value;

/// An extracted browser build on disk. The engine only ever talks to it
/// through the probe-host subprocess and the wire protocol.
#[derive(Debug, Clone)]
pub struct App {
    /// The shell executable used to run the probe script.
    pub exe: PathBuf,
    /// The GRE directory of the build.
    pub gre_dir: PathBuf,
    /// The application directory of the build.
    pub app_dir: PathBuf,
}

impl App {
    pub fn new(
        exe: impl Into<PathBuf>,
        gre_dir: impl Into<PathBuf>,
        app_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            exe: exe.into(),
            gre_dir: gre_dir.into(),
            app_dir: app_dir.into(),
        }
    }

    /// The probe-host command line. The script announces its listen
    /// port on stdout; `port` 0 lets it pick one. The supervisor wires
    /// both output streams into its merged reader pipe.
    pub(crate) fn probe_command(&self, script: &Path, port: u16) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.exe);
        cmd.arg("-xpcshell")
            .arg("-g")
            .arg(&self.gre_dir)
            .arg("-a")
            .arg(&self.app_dir)
            .arg(script)
            .arg(port.to_string())
            .current_dir(&self.app_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

/// Build metadata reported by a worker's `info` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerMetadata {
    pub app_version: String,
    pub branch: String,
    pub nss_version: String,
    pub nspr_version: String,
}

impl WorkerMetadata {
    /// Extract the metadata from an `info` result payload.
    pub fn from_info(result: &Value) -> Option<Self> {
        let constants = result.get("appConstants")?;
        let nss_info = result.get("nssInfo")?;
        Some(Self {
            app_version: constants
                .get("MOZ_APP_VERSION_DISPLAY")?
                .as_str()?
                .to_string(),
            branch: constants.get("MOZ_UPDATE_CHANNEL")?.as_str()?.to_string(),
            nss_version: nss_info.get("NSS_Version")?.as_str()?.to_string(),
            nspr_version: nss_info.get("NSPR_Version")?.as_str()?.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn metadata_from_info_payload() {
        let result = json!({
            "appConstants": {
                "MOZ_UPDATE_CHANNEL": "nightly",
                "MOZ_APP_VERSION_DISPLAY": "136.0a1",
            },
            "nssInfo": {
                "NSS_Version": "NSS 3.107",
                "NSPR_Version": "NSPR 4.36",
            },
        });
        let meta = WorkerMetadata::from_info(&result).expect("metadata");
        assert_eq!(meta.branch, "nightly");
        assert_eq!(meta.app_version, "136.0a1");
        assert_eq!(meta.nss_version, "NSS 3.107");
        assert_eq!(meta.nspr_version, "NSPR 4.36");

        assert!(WorkerMetadata::from_info(&json!({})).is_none());
    }
}
