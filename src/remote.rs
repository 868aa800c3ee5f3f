//! Running commands on remote hosts and copying files to and from them.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use log::debug;

use spurs::{cmd, Execute, SshError, SshShell};

use crate::common::ssh_addr;

/// The result of a remote command that ran to completion.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemoteOutput {
    pub stdout: String,
    pub exit_status: i32,
}

impl RemoteOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

/// Remote execution service.
///
/// Implementations must be usable from several worker threads at once. A command that runs but
/// exits with a non-zero status is _not_ an error: it is reported through
/// `RemoteOutput::exit_status`. Errors are reserved for failing to run the command at all.
pub trait RemoteExec: Send + Sync {
    /// Run `command` with bash on `host`.
    fn run(&self, host: &str, command: &str) -> Result<RemoteOutput, failure::Error>;

    /// Copy `local_files` into `remote_dir` on `host`.
    fn put(&self, host: &str, local_files: &[PathBuf], remote_dir: &str)
        -> Result<(), failure::Error>;

    /// Copy `remote_files` from `host` into `local_dir`.
    fn get(&self, host: &str, remote_files: &[String], local_dir: &Path)
        -> Result<(), failure::Error>;
}

/// Runs commands over SSH with the default key and copies files with `scp`.
#[derive(Clone, Debug)]
pub struct SshRemote {
    username: String,
}

impl SshRemote {
    pub fn new(username: &str) -> Self {
        SshRemote {
            username: username.to_owned(),
        }
    }

    fn scp_target(&self, host: &str, path: &str) -> String {
        // scp wants `user@host:path`, without a port.
        let host = host.split(':').next().unwrap_or(host);
        format!("{}@{}:{}", self.username, host, path)
    }

    fn scp(&self, sources: Vec<String>, dest: String) -> Result<(), failure::Error> {
        debug!("scp {:?} {}", sources, dest);

        let status = Command::new("scp")
            .args(&["-q", "-r", "-o", "StrictHostKeyChecking=no", "-o", "BatchMode=yes"])
            .args(&sources)
            .arg(&dest)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;

        if status.success() {
            Ok(())
        } else {
            Err(failure::format_err!(
                "scp {:?} -> {} exited with {}",
                sources,
                dest,
                status
            ))
        }
    }
}

impl RemoteExec for SshRemote {
    fn run(&self, host: &str, command: &str) -> Result<RemoteOutput, failure::Error> {
        let shell = SshShell::with_default_key(&self.username, &ssh_addr(host))?;

        let result = shell
            .run(cmd!("{}", command).use_bash())
            .map_err(failure::Error::from);

        match result {
            Ok(output) => Ok(RemoteOutput {
                stdout: output.stdout,
                exit_status: 0,
            }),
            Err(err) => match err.downcast_ref::<SshError>() {
                Some(SshError::NonZeroExit { exit, .. }) => Ok(RemoteOutput {
                    stdout: String::new(),
                    exit_status: *exit,
                }),
                _ => Err(err),
            },
        }
    }

    fn put(
        &self,
        host: &str,
        local_files: &[PathBuf],
        remote_dir: &str,
    ) -> Result<(), failure::Error> {
        if local_files.is_empty() {
            return Ok(());
        }

        let sources = local_files
            .iter()
            .map(|f| f.to_string_lossy().into_owned())
            .collect();
        self.scp(sources, self.scp_target(host, &dir!(remote_dir, "")))
    }

    fn get(
        &self,
        host: &str,
        remote_files: &[String],
        local_dir: &Path,
    ) -> Result<(), failure::Error> {
        if remote_files.is_empty() {
            return Ok(());
        }

        let sources = remote_files
            .iter()
            .map(|f| self.scp_target(host, f))
            .collect();
        self.scp(sources, local_dir.to_string_lossy().into_owned())
    }
}
