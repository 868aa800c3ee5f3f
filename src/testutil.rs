//! Test doubles for the reservation and remote execution services.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::remote::{RemoteExec, RemoteOutput};
use crate::reservation::{JobHandle, Reservation};

/// A reservation service that hands out fake jobs over a fixed set of hosts.
pub struct FakeReservation {
    hosts: Vec<String>,
    deployable: Option<Vec<String>>,
    alive: Arc<AtomicBool>,
    /// If set, the job dies after this many `is_alive` checks.
    checks_until_death: Option<usize>,
    checks: AtomicUsize,
    next_job: AtomicU64,
    acquisitions: Mutex<Vec<JobHandle>>,
    releases: Mutex<Vec<JobHandle>>,
}

impl FakeReservation {
    pub fn new(hosts: Vec<String>) -> Self {
        FakeReservation {
            hosts,
            deployable: None,
            alive: Arc::new(AtomicBool::new(true)),
            checks_until_death: None,
            checks: AtomicUsize::new(0),
            next_job: AtomicU64::new(100),
            acquisitions: Mutex::new(vec![]),
            releases: Mutex::new(vec![]),
        }
    }

    /// Only these hosts survive deployment.
    pub fn deploying_only(mut self, hosts: Vec<String>) -> Self {
        self.deployable = Some(hosts);
        self
    }

    /// The job dies after `checks` liveness checks.
    pub fn dying_after(mut self, checks: usize) -> Self {
        self.checks_until_death = Some(checks);
        self
    }

    /// Clearing the returned flag kills the job.
    pub fn kill_switch(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.alive)
    }

    /// Bring the job (or the next one) back to life.
    pub fn revive(&self) {
        self.alive.store(true, Ordering::SeqCst);
        self.checks.store(0, Ordering::SeqCst);
    }

    pub fn releases(&self) -> Vec<JobHandle> {
        self.releases.lock().unwrap().clone()
    }

    pub fn acquisitions(&self) -> Vec<JobHandle> {
        self.acquisitions.lock().unwrap().clone()
    }
}

impl Reservation for FakeReservation {
    fn acquire(&self, _nodes: usize, _walltime: &str) -> Result<JobHandle, failure::Error> {
        let job = JobHandle(self.next_job.fetch_add(1, Ordering::SeqCst));
        self.acquisitions.lock().unwrap().push(job);
        Ok(job)
    }

    fn wait_until_started(&self, _job: &JobHandle) -> Result<(), failure::Error> {
        Ok(())
    }

    fn is_alive(&self, _job: &JobHandle) -> bool {
        let checks = self.checks.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(limit) = self.checks_until_death {
            if checks > limit {
                self.alive.store(false, Ordering::SeqCst);
            }
        }
        self.alive.load(Ordering::SeqCst)
    }

    fn list_nodes(&self, _job: &JobHandle) -> Result<Vec<String>, failure::Error> {
        Ok(self.hosts.clone())
    }

    fn deploy_image(&self, hosts: &[String], _image: &str) -> Result<Vec<String>, failure::Error> {
        Ok(match &self.deployable {
            Some(deployable) => hosts
                .iter()
                .filter(|h| deployable.contains(h))
                .cloned()
                .collect(),
            None => hosts.to_vec(),
        })
    }

    fn release(&self, job: &JobHandle) -> Result<(), failure::Error> {
        self.releases.lock().unwrap().push(*job);
        Ok(())
    }
}

/// A remote execution service that records everything and runs nothing.
#[derive(Default)]
pub struct FakeRemote {
    /// `(host, command)` for every `run`.
    pub commands: Mutex<Vec<(String, String)>>,
    /// `(host, local files, remote dir)` for every `put`.
    pub puts: Mutex<Vec<(String, Vec<PathBuf>, String)>>,
    /// `(host, remote files, local dir)` for every `get`.
    pub gets: Mutex<Vec<(String, Vec<String>, PathBuf)>>,
    /// Commands containing the key exit with the given status.
    failures: Vec<(String, i32)>,
    /// Commands containing the key print the given output.
    responses: Vec<(String, String)>,
    /// `put`s and `get`s to hosts containing the key fail.
    broken_copies: Vec<String>,
    /// Only `get`s from hosts containing the key fail.
    broken_gets: Vec<String>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, command: &str, status: i32) -> Self {
        self.failures.push((command.into(), status));
        self
    }

    pub fn responding(mut self, command: &str, stdout: &str) -> Self {
        self.responses.push((command.into(), stdout.into()));
        self
    }

    pub fn breaking_copies_to(mut self, host: &str) -> Self {
        self.broken_copies.push(host.into());
        self
    }

    pub fn breaking_gets_from(mut self, host: &str) -> Self {
        self.broken_gets.push(host.into());
        self
    }

    pub fn commands_on(&self, host: &str) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, c)| c.clone())
            .collect()
    }
}

impl RemoteExec for FakeRemote {
    fn run(&self, host: &str, command: &str) -> Result<RemoteOutput, failure::Error> {
        self.commands
            .lock()
            .unwrap()
            .push((host.into(), command.into()));

        let exit_status = self
            .failures
            .iter()
            .find(|(key, _)| command.contains(key.as_str()))
            .map(|&(_, status)| status)
            .unwrap_or(0);
        let stdout = self
            .responses
            .iter()
            .find(|(key, _)| command.contains(key.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default();

        Ok(RemoteOutput {
            stdout,
            exit_status,
        })
    }

    fn put(
        &self,
        host: &str,
        local_files: &[PathBuf],
        remote_dir: &str,
    ) -> Result<(), failure::Error> {
        if self.broken_copies.iter().any(|h| host.contains(h.as_str())) {
            failure::bail!("connection to {} refused", host);
        }
        for f in local_files {
            if !f.exists() {
                failure::bail!("no such local file: {}", f.display());
            }
        }
        self.puts
            .lock()
            .unwrap()
            .push((host.into(), local_files.to_vec(), remote_dir.into()));
        Ok(())
    }

    /// Creates an empty local file for every remote file.
    fn get(
        &self,
        host: &str,
        remote_files: &[String],
        local_dir: &Path,
    ) -> Result<(), failure::Error> {
        if self
            .broken_copies
            .iter()
            .chain(&self.broken_gets)
            .any(|h| host.contains(h.as_str()))
        {
            failure::bail!("connection to {} refused", host);
        }
        for f in remote_files {
            let name = Path::new(f).file_name().unwrap();
            std::fs::write(local_dir.join(name), b"")?;
        }
        self.gets
            .lock()
            .unwrap()
            .push((host.into(), remote_files.to_vec(), local_dir.into()));
        Ok(())
    }
}
