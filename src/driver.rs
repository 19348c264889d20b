//! Process driver: run the capture server as a subprocess on behalf of a
//! test harness, publish its address to the SUT, and shut it down.

use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::adapters::ServerProtocol;
use crate::config::{RcConfig, GENERAL_SECTION};
use crate::dispatcher::CaptureMode;
use crate::error::{Error, Result};
use crate::intercept::SERVER_ENV_VAR;

pub const MODE_ENV_VAR: &str = "CAPTUREMOCK_MODE";
pub const REPLAY_FILE_ENV_VAR: &str = "CAPTUREMOCK_REPLAY_FILE";
pub const RECORD_FILE_ENV_VAR: &str = "CAPTUREMOCK_RECORD_FILE";
pub const PROCESS_START_ENV_VAR: &str = "CAPTUREMOCK_PROCESS_START";

#[derive(Debug, Clone, Default)]
pub struct DriverOptions {
    pub mode: u8,
    pub rc_files: Vec<PathBuf>,
    pub replay_file: Option<PathBuf>,
    pub record_file: Option<PathBuf>,
    pub replay_edit_dir: Option<PathBuf>,
    pub record_edit_dir: Option<PathBuf>,
    /// Path of the server binary; the current executable by default.
    pub server_binary: Option<PathBuf>,
    /// Extra arguments passed through verbatim, e.g. `-i <dir>`.
    pub extra_args: Vec<String>,
}

impl DriverOptions {
    /// Assemble options from the `CAPTUREMOCK_*` environment, the contract
    /// used for in-process mocking at interpreter start-up.
    pub fn from_env() -> Self {
        let path_var = |name: &str| std::env::var(name).ok().map(PathBuf::from);
        Self {
            mode: std::env::var(MODE_ENV_VAR)
                .ok()
                .and_then(|mode| mode.parse().ok())
                .unwrap_or(0),
            rc_files: std::env::var(PROCESS_START_ENV_VAR)
                .map(|files| files.split(',').map(PathBuf::from).collect())
                .unwrap_or_default(),
            replay_file: path_var(REPLAY_FILE_ENV_VAR),
            record_file: path_var(RECORD_FILE_ENV_VAR),
            replay_edit_dir: None,
            record_edit_dir: None,
            server_binary: None,
            extra_args: Vec::new(),
        }
    }
}

/// A capture server running as a subprocess.
pub struct ServerDriver {
    child: Child,
    address: String,
    protocol: ServerProtocol,
    options: DriverOptions,
}

impl ServerDriver {
    /// Spawn the server and wait for it to publish its address: the first
    /// line it writes to stdout.
    pub fn start(options: DriverOptions) -> Result<Self> {
        let binary = match &options.server_binary {
            Some(binary) => binary.clone(),
            None => std::env::current_exe()?,
        };
        let mut command = Command::new(binary);
        command
            .arg("-m")
            .arg(options.mode.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if !options.rc_files.is_empty() {
            let joined = options
                .rc_files
                .iter()
                .map(|file| file.display().to_string())
                .collect::<Vec<_>>()
                .join(",");
            command.arg("--rcfiles").arg(joined);
        }
        let mut path_arg = |flag: &str, value: &Option<PathBuf>| {
            if let Some(value) = value {
                command.arg(flag).arg(value);
            }
        };
        path_arg("-p", &options.replay_file);
        path_arg("-r", &options.record_file);
        path_arg("-f", &options.replay_edit_dir);
        path_arg("-F", &options.record_edit_dir);
        command.args(&options.extra_args);

        let mut child = command.spawn()?;
        let stdout = child.stdout.take().expect("stdout was piped");
        let mut lines = BufReader::new(stdout);
        let mut address = String::new();
        lines.read_line(&mut address)?;
        let address = address.trim().to_string();
        if address.is_empty() {
            let _ = child.kill();
            return Err(Error::Bind {
                address: "<subprocess>".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "server exited before publishing an address",
                ),
            });
        }
        debug!("Capture server subprocess on {address}");

        let protocol = {
            let config = RcConfig::load(&options.rc_files).unwrap_or_default();
            ServerProtocol::from_config_value(
                config.get_or(GENERAL_SECTION, "server_protocol", "classic_tcp"),
            )
        };
        Ok(Self {
            child,
            address,
            protocol,
            options,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn mode(&self) -> CaptureMode {
        CaptureMode::from_number(self.options.mode)
    }

    /// The variables to publish into the SUT's environment.
    pub fn sut_environment(&self) -> Vec<(String, String)> {
        sut_environment(&self.options, &self.address)
    }

    /// Send the protocol-appropriate shutdown message, wait out a bounded
    /// grace period, then force-kill.
    pub async fn stop(mut self) -> Result<()> {
        if let Ok(address) = self.address.parse() {
            if let Err(e) = self.protocol.send_terminate(&address).await {
                warn!("Could not send terminate message: {e}");
            }
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match self.child.try_wait()? {
                Some(status) => {
                    debug!("Capture server exited with {status}");
                    return Ok(());
                }
                None if Instant::now() >= deadline => {
                    warn!("Capture server did not stop in time, killing it");
                    self.child.kill()?;
                    self.child.wait()?;
                    return Ok(());
                }
                None => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
    }
}

fn sut_environment(options: &DriverOptions, address: &str) -> Vec<(String, String)> {
    let mut environment = vec![
        (SERVER_ENV_VAR.to_string(), address.to_string()),
        (MODE_ENV_VAR.to_string(), options.mode.to_string()),
    ];
    if let Some(replay) = &options.replay_file {
        environment.push((REPLAY_FILE_ENV_VAR.to_string(), replay.display().to_string()));
    }
    if let Some(record) = &options.record_file {
        environment.push((RECORD_FILE_ENV_VAR.to_string(), record.display().to_string()));
    }
    environment
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_options_pick_up_the_documented_variables() {
        // set/unset in one test to avoid cross-test env races
        std::env::set_var(MODE_ENV_VAR, "2");
        std::env::set_var(REPLAY_FILE_ENV_VAR, "/tmp/replay.journal");
        std::env::set_var(PROCESS_START_ENV_VAR, "/tmp/a.rc,/tmp/b.rc");
        let options = DriverOptions::from_env();
        std::env::remove_var(MODE_ENV_VAR);
        std::env::remove_var(REPLAY_FILE_ENV_VAR);
        std::env::remove_var(PROCESS_START_ENV_VAR);

        assert_eq!(options.mode, 2);
        assert_eq!(options.replay_file.as_deref(), Some(std::path::Path::new("/tmp/replay.journal")));
        assert_eq!(options.rc_files.len(), 2);
    }

    #[test]
    fn sut_environment_always_carries_server_and_mode() {
        let options = DriverOptions {
            mode: 1,
            record_file: Some(PathBuf::from("/tmp/record.journal")),
            ..DriverOptions::default()
        };
        let environment = sut_environment(&options, "127.0.0.1:4000");
        assert!(environment.iter().any(|(k, v)| k == SERVER_ENV_VAR && v == "127.0.0.1:4000"));
        assert!(environment.iter().any(|(k, v)| k == MODE_ENV_VAR && v == "1"));
        assert!(environment.iter().any(|(k, _)| k == RECORD_FILE_ENV_VAR));
    }
}
