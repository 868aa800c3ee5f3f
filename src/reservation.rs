//! Reserving, deploying and releasing testbed resources.
//!
//! `OarReservation` drives the OAR batch scheduler and kadeploy through an SSH shell to a site
//! frontend. `ReservationGuard` makes sure that whatever is acquired is released exactly once,
//! on every exit path.

use std::collections::HashMap;
use std::time::Duration;

use log::{error, info, warn};

use serde::Deserialize;

use spurs::{cmd, Execute, SshShell};
use spurs_util::escape_for_bash;

use crate::error::RunnerError;

/// How often to poll OAR while waiting for a job to start.
pub const START_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// A reservation (batch job) known to the reservation service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct JobHandle(pub u64);

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reservation service.
pub trait Reservation {
    /// Reserve `nodes` nodes for `walltime` (`H:MM:SS`).
    fn acquire(&self, nodes: usize, walltime: &str) -> Result<JobHandle, failure::Error>;

    /// Block until the job is running. Fails if the job ends before it starts.
    fn wait_until_started(&self, job: &JobHandle) -> Result<(), failure::Error>;

    /// Whether the job is still usable. Failures to find out count as "no".
    fn is_alive(&self, job: &JobHandle) -> bool;

    /// The hosts assigned to the job.
    fn list_nodes(&self, job: &JobHandle) -> Result<Vec<String>, failure::Error>;

    /// Deploy `image` on `hosts`. Returns the hosts that were deployed successfully.
    fn deploy_image(&self, hosts: &[String], image: &str) -> Result<Vec<String>, failure::Error>;

    /// Release the job and everything it holds.
    fn release(&self, job: &JobHandle) -> Result<(), failure::Error>;
}

/// Releases a reservation when dropped, unless it is being kept alive.
pub struct ReservationGuard<'r> {
    reservation: &'r dyn Reservation,
    job: JobHandle,
    keep_alive: bool,
}

impl<'r> ReservationGuard<'r> {
    pub fn new(reservation: &'r dyn Reservation, job: JobHandle, keep_alive: bool) -> Self {
        ReservationGuard {
            reservation,
            job,
            keep_alive,
        }
    }

    pub fn job(&self) -> &JobHandle {
        &self.job
    }
}

impl Drop for ReservationGuard<'_> {
    fn drop(&mut self) {
        if self.keep_alive {
            info!("Keeping job {} alive for debugging", self.job);
            return;
        }

        info!("Deleting job {}", self.job);
        if let Err(err) = self.reservation.release(&self.job) {
            error!("Unable to delete job {}: {}", self.job, err);
        }
    }
}

/// The state of an OAR job, as reported by `oarstat`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobState {
    Waiting,
    Hold,
    ToLaunch,
    ToError,
    ToAckReservation,
    Launching,
    Running,
    Suspended,
    Resuming,
    Finishing,
    Terminated,
    Error,
    Other(String),
}

impl JobState {
    pub fn parse(state: &str) -> Self {
        match state.trim() {
            "Waiting" => JobState::Waiting,
            "Hold" => JobState::Hold,
            "toLaunch" => JobState::ToLaunch,
            "toError" => JobState::ToError,
            "toAckReservation" => JobState::ToAckReservation,
            "Launching" => JobState::Launching,
            "Running" => JobState::Running,
            "Suspended" => JobState::Suspended,
            "Resuming" => JobState::Resuming,
            "Finishing" => JobState::Finishing,
            "Terminated" => JobState::Terminated,
            "Error" => JobState::Error,
            other => JobState::Other(other.to_owned()),
        }
    }

    /// The job may still run, or is running.
    pub fn is_alive(&self) -> bool {
        match self {
            JobState::Waiting
            | JobState::Hold
            | JobState::ToLaunch
            | JobState::ToError
            | JobState::ToAckReservation
            | JobState::Launching
            | JobState::Running
            | JobState::Suspended
            | JobState::Resuming => true,
            JobState::Finishing | JobState::Terminated | JobState::Error | JobState::Other(_) => {
                false
            }
        }
    }
}

/// The part of `oarstat -f -J` output we care about.
#[derive(Debug, Deserialize)]
struct OarJobInfo {
    #[serde(default)]
    state: String,
    #[serde(default)]
    assigned_network_address: Vec<String>,
}

/// Find `OAR_JOB_ID=<id>` in the output of `oarsub` or `storage5k -a add`.
pub fn parse_job_id(stdout: &str) -> Option<JobHandle> {
    stdout
        .lines()
        .filter_map(|line| line.trim().splitn(2, "OAR_JOB_ID=").nth(1))
        .filter_map(|id| id.trim().parse::<u64>().ok())
        .next()
        .map(JobHandle)
}

fn parse_job_info(stdout: &str, job: &JobHandle) -> Result<OarJobInfo, failure::Error> {
    let mut jobs: HashMap<String, OarJobInfo> = serde_json::from_str(stdout)?;
    jobs.remove(&job.to_string())
        .ok_or_else(|| failure::format_err!("oarstat has no information on job {}", job))
}

/// One resource (core) of `oarnodes -J` output.
#[derive(Debug, Deserialize)]
struct OarResource {
    #[serde(default)]
    network_address: String,
    #[serde(default)]
    state: String,
    /// A job id, a list of them, or nothing, depending on the OAR version.
    #[serde(default)]
    jobs: serde_json::Value,
}

impl OarResource {
    fn is_free(&self) -> bool {
        let busy = match &self.jobs {
            serde_json::Value::Null => false,
            serde_json::Value::String(s) => !s.trim().is_empty(),
            serde_json::Value::Array(jobs) => !jobs.is_empty(),
            _ => true,
        };

        self.state == "Alive" && !busy
    }
}

/// The number of hosts in `oarnodes -J` output all of whose resources are alive and idle.
fn parse_free_nodes(stdout: &str) -> Result<usize, failure::Error> {
    let resources: HashMap<String, OarResource> = serde_json::from_str(stdout)?;

    let mut hosts: HashMap<&str, bool> = HashMap::new();
    for resource in resources.values() {
        let host = resource.network_address.trim();
        if host.is_empty() {
            continue;
        }
        let free = hosts.entry(host).or_insert(true);
        *free = *free && resource.is_free();
    }

    Ok(hosts.values().filter(|&&free| free).count())
}

/// How many nodes to ask for when `wanted` are wanted and `free` are free right now, if that is
/// known. At least one node is requested, so the job queues if nothing is free.
fn nodes_to_request(wanted: usize, free: Option<usize>) -> usize {
    match free {
        Some(free) => wanted.min(free).max(1),
        None => wanted,
    }
}

/// Hosts in order of first appearance, without duplicates.
fn dedup_hosts<I: IntoIterator<Item = String>>(hosts: I) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    hosts
        .into_iter()
        .map(|h| h.trim().to_owned())
        .filter(|h| !h.is_empty() && seen.insert(h.clone()))
        .collect()
}

/// OAR and kadeploy on one testbed site, driven over SSH from the site frontend.
pub struct OarReservation {
    shell: SshShell,
    job_name: String,
    poll_interval: Duration,
}

impl OarReservation {
    /// `shell` must be connected to the site frontend. Jobs are submitted with `job_name`.
    pub fn new(shell: SshShell, job_name: &str) -> Self {
        OarReservation {
            shell,
            job_name: job_name.to_owned(),
            poll_interval: START_POLL_INTERVAL,
        }
    }

    pub fn shell(&self) -> &SshShell {
        &self.shell
    }

    fn free_nodes(&self) -> Result<usize, failure::Error> {
        let out = self.shell.run(cmd!("oarnodes -J"))?;
        parse_free_nodes(&out.stdout)
    }

    fn stat(&self, job: &JobHandle) -> Result<OarJobInfo, failure::Error> {
        let out = self.shell.run(cmd!("oarstat -f -J -j {}", job))?;
        parse_job_info(&out.stdout, job)
    }

    /// kadeploy takes either a registered environment name or an environment description file.
    fn kadeploy_env_flag(image: &str) -> &'static str {
        if image.contains('/') || image.ends_with(".env") || image.ends_with(".yaml") {
            "-a"
        } else {
            "-e"
        }
    }
}

impl Reservation for OarReservation {
    fn acquire(&self, wanted: usize, walltime: &str) -> Result<JobHandle, failure::Error> {
        let free = match self.free_nodes() {
            Ok(free) => {
                info!("{} node(s) free on the site", free);
                Some(free)
            }
            Err(err) => {
                warn!("Unable to count free nodes; asking for all of them: {}", err);
                None
            }
        };
        let nodes = nodes_to_request(wanted, free);
        if nodes < wanted {
            warn!("Only reserving {} of the {} node(s) asked for", nodes, wanted);
        }

        info!(
            "Reserving {} node(s) for {} as {:?}",
            nodes, walltime, self.job_name
        );

        let out = self.shell.run(cmd!(
            "oarsub -t deploy -l nodes={},walltime={} -n {} 'sleep 365d'",
            nodes,
            walltime,
            escape_for_bash(&self.job_name),
        ))?;

        let job = parse_job_id(&out.stdout).ok_or_else(|| {
            RunnerError::reservation_failure(format!(
                "no job id in oarsub output: {:?}",
                out.stdout
            ))
        })?;

        info!("Reservation done: job {}", job);

        Ok(job)
    }

    fn wait_until_started(&self, job: &JobHandle) -> Result<(), failure::Error> {
        loop {
            let state = JobState::parse(&self.stat(job)?.state);

            match state {
                JobState::Running => {
                    info!("Job {} is running", job);
                    return Ok(());
                }
                state if state.is_alive() => {
                    info!("Waiting for job {} to start ({:?})", job, state);
                    std::thread::sleep(self.poll_interval);
                }
                state => {
                    return Err(RunnerError::reservation_failure(format!(
                        "job {} ended before starting ({:?})",
                        job, state
                    ))
                    .into());
                }
            }
        }
    }

    fn is_alive(&self, job: &JobHandle) -> bool {
        match self.stat(job) {
            Ok(info) => JobState::parse(&info.state).is_alive(),
            Err(err) => {
                warn!("Unable to get the state of job {}: {}", job, err);
                false
            }
        }
    }

    fn list_nodes(&self, job: &JobHandle) -> Result<Vec<String>, failure::Error> {
        Ok(dedup_hosts(self.stat(job)?.assigned_network_address))
    }

    fn deploy_image(&self, hosts: &[String], image: &str) -> Result<Vec<String>, failure::Error> {
        if hosts.is_empty() {
            return Ok(vec![]);
        }

        info!("Deploying {} on {:?}", image, hosts);

        let ok_file = format!("/tmp/{}-deployed-{}", self.job_name, std::process::id());
        let machines = hosts
            .iter()
            .map(|h| format!("-m {}", h))
            .collect::<Vec<_>>()
            .join(" ");

        // kadeploy exits with an error if any node fails; the list of good nodes is what
        // matters.
        self.shell.run(
            cmd!(
                "kadeploy3 {} {} {} -k -o {}",
                Self::kadeploy_env_flag(image),
                escape_for_bash(image),
                machines,
                ok_file
            )
            .allow_error(),
        )?;

        let deployed = self
            .shell
            .run(cmd!("cat {} 2>/dev/null; rm -f {}", ok_file, ok_file).use_bash())?;
        let deployed = dedup_hosts(deployed.stdout.lines().map(str::to_owned));

        for host in hosts.iter().filter(|h| !deployed.contains(h)) {
            warn!("Deployment failed on {}", host);
        }

        info!("Deployed {} of {} hosts", deployed.len(), hosts.len());

        Ok(deployed)
    }

    fn release(&self, job: &JobHandle) -> Result<(), failure::Error> {
        self.shell.run(cmd!("oardel {}", job))?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::FakeReservation;

    #[test]
    fn job_ids() {
        let oarsub = "[ADMISSION RULE] Modify resource description\n\
                      Generate a job key...\n\
                      OAR_JOB_ID=1234567\n";
        assert_eq!(parse_job_id(oarsub), Some(JobHandle(1234567)));
        assert_eq!(parse_job_id("[ERROR] no resources"), None);
        assert_eq!(parse_job_id("OAR_JOB_ID=abc"), None);
    }

    #[test]
    fn job_info() {
        let oarstat = r#"{
            "1234": {
                "state": "Running",
                "assigned_network_address": ["b-2.lyon.grid5000.fr", "a-1.lyon.grid5000.fr",
                                             "b-2.lyon.grid5000.fr"],
                "owner": "someone"
            }
        }"#;

        let info = parse_job_info(oarstat, &JobHandle(1234)).unwrap();
        assert_eq!(JobState::parse(&info.state), JobState::Running);
        assert_eq!(
            dedup_hosts(info.assigned_network_address),
            vec!["b-2.lyon.grid5000.fr", "a-1.lyon.grid5000.fr"]
        );

        assert!(parse_job_info(oarstat, &JobHandle(1)).is_err());
        assert!(parse_job_info("not json", &JobHandle(1234)).is_err());

        let waiting = parse_job_info(r#"{"7": {"state": "Waiting"}}"#, &JobHandle(7)).unwrap();
        assert!(waiting.assigned_network_address.is_empty());
    }

    #[test]
    fn free_node_count() {
        let oarnodes = r#"{
            "1": {"network_address": "a-1.lyon.grid5000.fr", "state": "Alive"},
            "2": {"network_address": "a-1.lyon.grid5000.fr", "state": "Alive", "jobs": []},
            "3": {"network_address": "a-2.lyon.grid5000.fr", "state": "Alive", "jobs": [42]},
            "4": {"network_address": "a-2.lyon.grid5000.fr", "state": "Alive"},
            "5": {"network_address": "a-3.lyon.grid5000.fr", "state": "Absent"},
            "6": {"network_address": "a-4.lyon.grid5000.fr", "state": "Alive", "jobs": "43"},
            "7": {"network_address": "a-5.lyon.grid5000.fr", "state": "Alive", "jobs": ""},
            "8": {"state": "Alive"}
        }"#;

        // a-1 and a-5 are free; a-2 is partly busy.
        assert_eq!(parse_free_nodes(oarnodes).unwrap(), 2);
        assert_eq!(parse_free_nodes("{}").unwrap(), 0);
        assert!(parse_free_nodes("oarnodes: command not found").is_err());
    }

    #[test]
    fn requests_are_capped_by_free_nodes() {
        assert_eq!(nodes_to_request(4, Some(10)), 4);
        assert_eq!(nodes_to_request(4, Some(2)), 2);
        assert_eq!(nodes_to_request(4, Some(0)), 1);
        assert_eq!(nodes_to_request(4, None), 4);
    }

    #[test]
    fn liveness_of_states() {
        assert!(JobState::parse("Waiting").is_alive());
        assert!(JobState::parse("Running").is_alive());
        assert!(JobState::parse("toLaunch").is_alive());
        assert!(!JobState::parse("Terminated").is_alive());
        assert!(!JobState::parse("Error").is_alive());
        assert!(!JobState::parse("Finishing").is_alive());
        assert_eq!(JobState::parse("Bogus"), JobState::Other("Bogus".into()));
    }

    #[test]
    fn env_flags() {
        assert_eq!(OarReservation::kadeploy_env_flag("wheezy-x64-nfs"), "-e");
        assert_eq!(
            OarReservation::kadeploy_env_flag("/home/me/env/mywheezy-x64-base.env"),
            "-a"
        );
    }

    #[test]
    fn guard_releases_once() {
        let reservation = FakeReservation::new(vec!["h1".into()]);

        {
            let _guard = ReservationGuard::new(&reservation, JobHandle(1), false);
        }
        assert_eq!(reservation.releases(), vec![JobHandle(1)]);

        {
            let _guard = ReservationGuard::new(&reservation, JobHandle(2), true);
        }
        assert_eq!(reservation.releases(), vec![JobHandle(1)]);
    }

    #[test]
    fn guard_releases_on_unwind() {
        let reservation = FakeReservation::new(vec![]);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = ReservationGuard::new(&reservation, JobHandle(3), false);
            panic!("boom");
        }));

        assert!(result.is_err());
        assert_eq!(reservation.releases(), vec![JobHandle(3)]);
    }
}
