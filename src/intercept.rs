//! Path interception: shim executables that divert `PATH`-resolved
//! commands to the capture server.
//!
//! The factory populates a directory with one shim per intercepted
//! command; the directory is prepended to the SUT's `PATH`. Each shim
//! execs this binary's `intercept` subcommand, which performs the wire
//! exchange: send the invocation, half-close, read back stdout, stderr
//! and the exit code.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Error, Result};
use crate::traffic::{split_command_reply, wire, CommandInvocation};

pub const SERVER_ENV_VAR: &str = "CAPTUREMOCK_SERVER";

/// Creates and owns a directory of interception shims.
pub struct InterceptFactory {
    directory: PathBuf,
}

impl InterceptFactory {
    pub fn new(directory: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&directory).map_err(|source| Error::Intercept {
            path: directory.clone(),
            source,
        })?;
        Ok(Self { directory })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Create one shim per command name. Commands given as absolute paths
    /// are skipped with a warning: interception works through `PATH`
    /// resolution only.
    pub fn create_shims(&self, commands: &[String]) -> Result<()> {
        let server_binary = std::env::current_exe().map_err(|source| Error::Intercept {
            path: self.directory.clone(),
            source,
        })?;
        for command in commands {
            if Path::new(command).is_absolute() {
                warn!("Not intercepting {command}: absolute paths bypass PATH resolution");
                continue;
            }
            self.write_shim(command, &server_binary)?;
        }
        Ok(())
    }

    #[cfg(unix)]
    fn write_shim(&self, command: &str, server_binary: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let path = self.directory.join(command);
        let script = format!(
            "#!/bin/sh\nexec \"{}\" intercept \"$0\" \"$@\"\n",
            server_binary.display()
        );
        let write = |path: &Path| -> std::io::Result<()> {
            let mut file = std::fs::File::create(path)?;
            file.write_all(script.as_bytes())?;
            file.set_permissions(std::fs::Permissions::from_mode(0o755))?;
            Ok(())
        };
        write(&path).map_err(|source| Error::Intercept {
            path: path.clone(),
            source,
        })?;
        debug!("Created shim {}", path.display());
        Ok(())
    }

    #[cfg(not(unix))]
    fn write_shim(&self, command: &str, server_binary: &Path) -> Result<()> {
        let path = self.directory.join(format!("{command}.cmd"));
        let script = format!(
            "@echo off\r\n\"{}\" intercept \"%~f0\" %*\r\n",
            server_binary.display()
        );
        std::fs::write(&path, script).map_err(|source| Error::Intercept {
            path: path.clone(),
            source,
        })?;
        debug!("Created shim {}", path.display());
        Ok(())
    }
}

/// Strip `intercept_dir` from a `PATH`-style value so the real executable
/// resolves when the server forwards the command.
pub fn strip_path_entry(path_value: &str, intercept_dir: &Path) -> String {
    let entries: Vec<PathBuf> = std::env::split_paths(path_value)
        .filter(|entry| entry != intercept_dir)
        .collect();
    std::env::join_paths(entries)
        .ok()
        .and_then(|joined| joined.into_string().ok())
        .unwrap_or_else(|| path_value.to_string())
}

/// The wire exchange run by a shim. Returns the exit code for the caller.
///
/// Signals: SIGINT/SIGTERM are reported to the server as
/// `SUT_COMMAND_KILL`; a negative exit code in the reply means the shim
/// should die by that signal so the calling shell sees the real cause.
pub async fn run_client(script: &Path, args: &[String]) -> i32 {
    let Some(command) = script.file_name().and_then(|name| name.to_str()) else {
        eprintln!("{}: unusable shim path {}", wire::MISMATCH, script.display());
        return 1;
    };
    let Ok(server) = std::env::var(SERVER_ENV_VAR) else {
        eprintln!("{}: {SERVER_ENV_VAR} is not set", wire::MISMATCH);
        return 1;
    };

    let mut argv = vec![command.to_string()];
    argv.extend(args.iter().cloned());
    let path_value = std::env::var("PATH").unwrap_or_default();
    let intercept_dir = script.parent().unwrap_or_else(|| Path::new(""));
    let invocation = CommandInvocation {
        argv,
        environment: vec![("PATH".to_string(), strip_path_entry(&path_value, intercept_dir))],
        working_dir: std::env::current_dir()
            .map(|dir| dir.display().to_string())
            .unwrap_or_default(),
        pid: std::process::id(),
    };

    let pid = invocation.pid;
    let exchange = exchange(&server, &invocation);
    tokio::select! {
        outcome = exchange => match outcome {
            Ok(code) => code,
            Err(e) => {
                eprintln!("{}: {e}", wire::MISMATCH);
                1
            }
        },
        signal = wait_for_signal() => {
            match report_kill(&server, signal, pid).await {
                Ok(code) if code < 0 => 128 - code,
                Ok(code) => code,
                Err(_) => 128 + signal,
            }
        }
    }
}

async fn exchange(server: &str, invocation: &CommandInvocation) -> std::io::Result<i32> {
    let mut stream = TcpStream::connect(server).await?;
    let message = format!("{}:{}\n", wire::SUT_COMMAND_LINE, invocation.to_wire());
    stream.write_all(message.as_bytes()).await?;
    stream.flush().await?;
    // Half-close: the server reads to the end of our send side.
    stream.shutdown().await?;

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await?;
    let reply = String::from_utf8_lossy(&reply);
    if let Some(message) = reply.strip_prefix(wire::MISMATCH) {
        eprint!("{}{message}", wire::MISMATCH);
        return Ok(1);
    }
    let (stdout, stderr, exit_code) = split_command_reply(&reply);
    print!("{stdout}");
    eprint!("{stderr}");
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
    Ok(exit_code)
}

async fn report_kill(server: &str, signal: i32, pid: u32) -> std::io::Result<i32> {
    let mut stream = TcpStream::connect(server).await?;
    let message = format!(
        "{}:{signal}{}{pid}\n",
        wire::SUT_COMMAND_KILL,
        wire::SUT_SEP
    );
    stream.write_all(message.as_bytes()).await?;
    stream.shutdown().await?;
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await?;
    let (_, _, exit_code) = split_command_reply(&String::from_utf8_lossy(&reply));
    Ok(exit_code)
}

#[cfg(unix)]
async fn wait_for_signal() -> i32 {
    use tokio::signal::unix::{signal, SignalKind};
    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(interrupt) => interrupt,
        Err(_) => return futures::future::pending().await,
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(_) => return futures::future::pending().await,
    };
    tokio::select! {
        _ = interrupt.recv() => 2,
        _ = terminate.recv() => 15,
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> i32 {
    let _ = tokio::signal::ctrl_c().await;
    2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(unix)]
    fn factory_creates_executable_shims() {
        let dir = tempfile::tempdir().unwrap();
        let factory = InterceptFactory::new(dir.path().join("intercepts")).unwrap();
        factory
            .create_shims(&["echo".to_string(), "ls".to_string()])
            .unwrap();

        let shim = factory.directory().join("echo");
        let contents = std::fs::read_to_string(&shim).unwrap();
        assert!(contents.starts_with("#!/bin/sh"));
        assert!(contents.contains("intercept"));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&shim).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }

    #[test]
    fn absolute_commands_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let factory = InterceptFactory::new(dir.path().to_path_buf()).unwrap();
        factory.create_shims(&["/usr/bin/echo".to_string()]).unwrap();
        assert!(!dir.path().join("echo").exists());
        assert!(!dir.path().join("usr").exists());
    }

    #[test]
    fn path_stripping_removes_only_the_intercept_dir() {
        let stripped = strip_path_entry("/opt/shims:/usr/bin:/bin", Path::new("/opt/shims"));
        assert_eq!(stripped, "/usr/bin:/bin");
        let untouched = strip_path_entry("/usr/bin:/bin", Path::new("/opt/shims"));
        assert_eq!(untouched, "/usr/bin:/bin");
    }
}
