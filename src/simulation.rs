//! Sweep the n-tier cloud simulator over a parameter space, on nodes reserved and deployed for
//! the occasion.
//!
//! Every deployed node first gets the XML generator and the base XML, once. Then every
//! combination runs on one slot of a node: the simulator configuration is rendered for the
//! combination and copied over, the simulator and the trace post-processing run, and the
//! resulting CSV and log come back to `<result dir>/<combination slug>/`.
//!
//! The result directory also holds a `.params` file with the settings of the campaign and the
//! sweep state file. Passing that directory to `--resume` skips combinations that already
//! finished.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::clap_app;

use log::{info, warn};

use prettytable::{cell, row, Table};

use spurs_util::escape_for_bash;

use crate::{
    common::{
        is_usize, is_walltime, output::RunSettings, site_frontend, Login, Username,
        DEPLOYED_USER,
    },
    dispatch::{DispatchConfig, Dispatcher, HostPool, Outcome, Slot, Workflow},
    error::{RunnerError, Stage},
    remote::{RemoteExec, SshRemote},
    reservation::{JobHandle, OarReservation, Reservation, ReservationGuard},
    settings,
    sweep::{Combination, ParamSpace, SweepQueue, SWEEP_STATE_FILE},
};

pub const DEFAULT_SITE: &str = "lyon";
pub const DEFAULT_NODES: usize = 2;
pub const DEFAULT_WALLTIME: &str = "00:10:00";
pub const DEFAULT_IMAGE: &str = "wheezy-x64-base";
pub const DEFAULT_RESULTS_DIR: &str = "results";

/// Where the simulator lives on deployed nodes.
pub const DEFAULT_REMOTE_DIR: &str = "/root/sgcb";

pub const DEFAULT_CONF_TEMPLATE: &str = "sgcb_ntier.conf";
pub const DEFAULT_XML_GENERATOR: &str = "xml_gen_execo.py";
pub const DEFAULT_BASE_XML: &str = "conf.xml";

const SIMULATOR_JAR: &str = "SGCB_nTier.jar";

/// Number of simulated requests per run.
const SIMULATOR_REQUESTS: usize = 100;

/// Name of the OAR jobs we submit.
const JOB_NAME: &str = "sgcb_sweep";

pub fn cli_options() -> clap::App<'static, 'static> {
    clap_app! { sweep =>
        (about: "Reserve and deploy nodes, then run the n-tier simulator on every combination of \
                 the sweep parameters.")
        (@arg USERNAME: +required +takes_value
         "The username on the testbed (e.g. jdoe)")
        (@arg SITE: --site +takes_value
         "(Optional) the site to reserve nodes on (default: lyon)")
        (@arg NODES: -n --nodes +takes_value {is_usize}
         "(Optional) the number of nodes to reserve (default: 2)")
        (@arg WALLTIME: -w --walltime +takes_value {is_walltime}
         "(Optional) the walltime of the reservation, H:MM:SS (default: 00:10:00)")
        (@arg JOB_ID: -j --job +takes_value {is_usize}
         "(Optional) use this existing job instead of reserving nodes")
        (@arg KEEP_ALIVE: -k --keep_alive
         "Do not delete the job at the end, e.g. for debugging")
        (@arg IMAGE: --image +takes_value
         "(Optional) the environment name or description file to deploy (default: \
          wheezy-x64-base)")
        (@arg WORKERS: --workers +takes_value {is_usize}
         "(Optional) the maximum number of concurrent workers (default: one per hardware \
          thread of the deployed nodes)")
        (@arg RESULTS_DIR: --results_dir +takes_value
         "(Optional) the directory in which to create the campaign's result directory \
          (default: results)")
        (@arg RESUME: --resume +takes_value conflicts_with[RESULTS_DIR]
         "(Optional) continue the campaign whose result directory is given, skipping \
          combinations that already finished")
        (@arg PARAM: --param +takes_value +multiple number_of_values(1)
         "(Optional, repeatable) a sweep parameter, as NAME=LO..HI or NAME=V1,V2,... \
          (default: the n-tier parameters)")
        (@arg REMOTE_DIR: --remote_dir +takes_value
         "(Optional) the simulator's directory on the nodes (default: /root/sgcb)")
        (@arg CONF_TEMPLATE: --conf_template +takes_value
         "(Optional) the simulator configuration template (default: sgcb_ntier.conf)")
        (@arg XML_GENERATOR: --xml_generator +takes_value
         "(Optional) the XML generator script (default: xml_gen_execo.py)")
        (@arg BASE_XML: --base_xml +takes_value
         "(Optional) the base XML configuration (default: conf.xml)")
        (@arg RERESERVE: --rereserve
         "Make a new reservation if the current one dies with combinations remaining")
    }
}

pub fn run(sub_m: &clap::ArgMatches<'_>) -> Result<(), failure::Error> {
    let username = sub_m.value_of("USERNAME").unwrap();
    let site = sub_m.value_of("SITE").unwrap_or(DEFAULT_SITE);
    let nodes = sub_m
        .value_of("NODES")
        .map(|n| n.parse::<usize>().unwrap())
        .unwrap_or(DEFAULT_NODES);
    let walltime = sub_m.value_of("WALLTIME").unwrap_or(DEFAULT_WALLTIME);
    let job = sub_m.value_of("JOB_ID").map(|j| j.parse::<u64>().unwrap());
    let keep_alive = sub_m.is_present("KEEP_ALIVE");
    let image = sub_m.value_of("IMAGE").unwrap_or(DEFAULT_IMAGE);
    let workers = sub_m
        .value_of("WORKERS")
        .map(|w| w.parse::<usize>().unwrap());
    let results_dir = sub_m
        .value_of("RESULTS_DIR")
        .unwrap_or(DEFAULT_RESULTS_DIR);
    let resume = sub_m.value_of("RESUME");
    let rereserve = sub_m.is_present("RERESERVE");

    let params = match sub_m.values_of("PARAM") {
        Some(specs) => {
            let mut params = ParamSpace::new();
            for spec in specs {
                params.insert_spec(spec)?;
            }
            params
        }
        None => ParamSpace::ntier_default(),
    };

    let settings = settings! {
        * exp: "sweep",
        * site: site,
        username: username,
        nodes: nodes,
        walltime: walltime,
        job: job,
        keep_alive: keep_alive,
        rereserve: rereserve,
        image: image,
        workers: workers,
        params: params,
        results_dir: results_dir,
        resume: resume,
        remote_dir: sub_m.value_of("REMOTE_DIR").unwrap_or(DEFAULT_REMOTE_DIR),
        conf_template: sub_m.value_of("CONF_TEMPLATE").unwrap_or(DEFAULT_CONF_TEMPLATE),
        xml_generator: sub_m.value_of("XML_GENERATOR").unwrap_or(DEFAULT_XML_GENERATOR),
        base_xml: sub_m.value_of("BASE_XML").unwrap_or(DEFAULT_BASE_XML),
    };

    run_inner(&settings)
}

/// Run the campaign using the settings passed. Everything the campaign does is decided by the
/// settings, so the `.params` file is a complete record of it.
fn run_inner(settings: &RunSettings) -> Result<(), failure::Error> {
    let username = settings.get::<String>("username")?;
    let site = settings.get::<String>("site")?;
    let params = settings.get::<ParamSpace>("params")?;
    let resume = settings.get::<Option<String>>("resume")?;

    let campaign = CampaignConfig {
        nodes: settings.get("nodes")?,
        walltime: settings.get("walltime")?,
        image: settings.get("image")?,
        job: settings.get::<Option<u64>>("job")?.map(JobHandle),
        keep_alive: settings.get("keep_alive")?,
        rereserve: settings.get("rereserve")?,
    };

    let result_dir = match resume {
        Some(dir) => PathBuf::from(dir),
        None => Path::new(&settings.get::<String>("results_dir")?).join(settings.gen_base_name()),
    };
    std::fs::create_dir_all(&result_dir)?;
    let params_file = settings.write_params(&result_dir)?;
    info!("Campaign settings written to {}", params_file.display());

    let queue =
        SweepQueue::with_state_file(params.combinations(), &result_dir.join(SWEEP_STATE_FILE))?;
    info!(
        "{} of {} combinations to run",
        queue.remaining(),
        queue.len()
    );
    let mut dispatcher = Dispatcher::new(
        queue,
        DispatchConfig {
            max_workers: settings.get::<Option<usize>>("workers")?.unwrap_or(usize::MAX),
            ..DispatchConfig::default()
        },
    );

    let remote = Arc::new(SshRemote::new(DEPLOYED_USER));
    let workflow = SimulationWorkflow::new(
        Arc::clone(&remote),
        SimulationSettings {
            remote_dir: settings.get("remote_dir")?,
            conf_template: settings.get::<String>("conf_template")?.into(),
            xml_generator: settings.get::<String>("xml_generator")?.into(),
            base_xml: settings.get::<String>("base_xml")?.into(),
            result_dir: result_dir.clone(),
        },
    )?;

    let frontend = site_frontend(&site);
    let login = Login {
        username: Username(&username),
        hostname: &frontend,
    };
    let reservation = OarReservation::new(login.connect()?, JOB_NAME);

    let mut timers = vec![];
    let result = time!(
        timers,
        "Campaign",
        run_campaign(
            &reservation,
            remote.as_ref(),
            &mut dispatcher,
            Arc::new(workflow),
            &campaign,
        )
    );

    print_summary(&dispatcher);
    for (label, duration) in timers {
        info!("{}: {:?}", label, duration);
    }
    info!("Results are in {}", result_dir.display());

    result
}

/// How to acquire the nodes of a campaign.
#[derive(Clone, Debug)]
pub struct CampaignConfig {
    pub nodes: usize,
    pub walltime: String,
    pub image: String,
    /// Use this job for the first round instead of reserving.
    pub job: Option<JobHandle>,
    pub keep_alive: bool,
    /// Reserve again when the reservation dies with combinations remaining.
    pub rereserve: bool,
}

/// Acquire nodes, deploy them and dispatch the sweep on them.
///
/// Every reservation acquired here is released exactly once before this returns (unless
/// `keep_alive` is set), whichever way it returns. Fails with `ReservationLost` if the
/// reservation dies with combinations remaining and `rereserve` is not set.
pub fn run_campaign(
    reservation: &dyn Reservation,
    remote: &dyn RemoteExec,
    dispatcher: &mut Dispatcher,
    workflow: Arc<dyn Workflow>,
    config: &CampaignConfig,
) -> Result<(), failure::Error> {
    let mut attach = config.job;
    let mut round = 1;

    loop {
        let job = match attach.take() {
            Some(job) => {
                info!("Using existing job {}", job);
                job
            }
            None => reservation.acquire(config.nodes, &config.walltime)?,
        };
        let guard = ReservationGuard::new(reservation, job, config.keep_alive);

        reservation.wait_until_started(guard.job())?;

        let hosts = reservation.list_nodes(guard.job())?;
        let deployed = reservation.deploy_image(&hosts, &config.image)?;
        if deployed.is_empty() {
            return Err(RunnerError::reservation_failure(format!(
                "none of the {} hosts of job {} could be deployed with {}",
                hosts.len(),
                job,
                config.image
            ))
            .into());
        }

        let prepared = prepare_hosts(workflow.as_ref(), &deployed);
        if prepared.is_empty() {
            return Err(RunnerError::reservation_failure(format!(
                "none of the {} deployed hosts of job {} could be prepared",
                deployed.len(),
                job
            ))
            .into());
        }

        let pool = HostPool::from_hosts(&host_slots(remote, &prepared));
        let finished_before = dispatcher.records().len();
        let outcome =
            dispatcher.dispatch_loop(reservation, guard.job(), pool, Arc::clone(&workflow))?;

        let remaining = dispatcher.queue().remaining();
        if !outcome.reservation_lost || remaining == 0 {
            return Ok(());
        }

        // A job that dies before anything ran gives no reason to expect the next one to do
        // better.
        let progressed = dispatcher.records().len() > finished_before;
        if !config.rereserve || !progressed {
            if config.rereserve {
                warn!("Job {} was lost before running anything. Giving up.", job);
            }
            return Err(RunnerError::ReservationLost {
                job: job.to_string(),
                remaining,
            }
            .into());
        }

        round += 1;
        warn!(
            "Job {} was lost with {} combinations remaining. Reserving again (round {}).",
            job, remaining, round
        );
    }
}

/// Prepare every host for the workflow. Returns the hosts that were prepared successfully.
fn prepare_hosts(workflow: &dyn Workflow, hosts: &[String]) -> Vec<String> {
    hosts
        .iter()
        .filter(|host| match workflow.prepare_host(host) {
            Ok(()) => true,
            Err(err) => {
                warn!("Unable to prepare {}; not using it: {}", host, err);
                false
            }
        })
        .cloned()
        .collect()
}

/// The number of execution slots of each host: one per hardware thread, or one if that cannot
/// be found out.
pub fn host_slots(remote: &dyn RemoteExec, hosts: &[String]) -> Vec<(String, usize)> {
    hosts
        .iter()
        .map(|host| {
            let slots = match remote.run(host, "nproc") {
                Ok(out) if out.success() => out.stdout.trim().parse::<usize>().ok(),
                Ok(out) => {
                    warn!("nproc on {} exited with {}", host, out.exit_status);
                    None
                }
                Err(err) => {
                    warn!("Unable to run nproc on {}: {}", host, err);
                    None
                }
            };

            (host.clone(), slots.filter(|&n| n > 0).unwrap_or(1))
        })
        .collect()
}

fn print_summary(dispatcher: &Dispatcher) {
    let mut table = Table::new();

    table.set_format(*prettytable::format::consts::FORMAT_CLEAN);

    table.set_titles(row![ Fwbu =>
        "Combination", "Status", "Slot", "Time", "Error"
    ]);

    for record in dispatcher.records() {
        let time = format!("{}s", record.duration.as_secs());
        match &record.outcome {
            Outcome::Completed => {
                table.add_row(row![b->record.combination, Fg->"Done", record.slot, time, ""]);
            }
            Outcome::Canceled { error } => {
                table.add_row(row![b->record.combination, Fri->"Canceled", record.slot, time, error]);
            }
        }
    }

    table.printstd();

    let queue = dispatcher.queue();
    println!(
        "{} completed, {} canceled, {} not run",
        queue.completed().len(),
        queue.canceled().len(),
        queue.remaining()
    );
}

/// Local inputs and outputs of the simulation workflow.
#[derive(Clone, Debug)]
pub struct SimulationSettings {
    /// Directory on the nodes holding the simulator, where the workflow runs.
    pub remote_dir: String,
    pub conf_template: PathBuf,
    pub xml_generator: PathBuf,
    pub base_xml: PathBuf,
    /// The campaign's result directory.
    pub result_dir: PathBuf,
}

/// The names of the files of one combination. Every name contains the combination's slug, so
/// that several combinations can run in the same directory.
#[derive(Clone, Debug, PartialEq, Eq)]
struct CombinationFiles {
    trace: String,
    xml: String,
    conf: String,
    csv: String,
    log: String,
}

impl CombinationFiles {
    fn new(combination: &Combination) -> Self {
        let slug = combination.slug();
        let trace = format!("ntier_{}", slug);

        CombinationFiles {
            xml: format!("{}.xml", slug),
            conf: format!("sgcb_ntier_{}.conf", slug),
            csv: format!("csv/REQTASK_{}.csv", trace),
            log: format!("log/{}.log", trace),
            trace,
        }
    }
}

/// Stage, execute, collect: what every worker of the simulation campaign does.
pub struct SimulationWorkflow<E: RemoteExec> {
    remote: Arc<E>,
    settings: SimulationSettings,
    template: String,
}

impl<E: RemoteExec> SimulationWorkflow<E> {
    /// Fails if the configuration template cannot be read.
    pub fn new(remote: Arc<E>, settings: SimulationSettings) -> Result<Self, failure::Error> {
        let template = std::fs::read_to_string(&settings.conf_template).map_err(|err| {
            failure::format_err!(
                "unable to read {}: {}",
                settings.conf_template.display(),
                err
            )
        })?;

        Ok(SimulationWorkflow {
            remote,
            settings,
            template,
        })
    }

    fn staging_dir(&self) -> PathBuf {
        self.settings.result_dir.join(".staging")
    }

    /// Run `command` in the remote directory on `host`; a non-zero exit is an error.
    fn run_in_dir(&self, host: &str, command: &str) -> Result<(), failure::Error> {
        let out = self.remote.run(
            host,
            &format!(
                "cd {} && {}",
                escape_for_bash(&self.settings.remote_dir),
                command
            ),
        )?;

        if out.success() {
            Ok(())
        } else {
            Err(failure::format_err!(
                "`{}` exited with {}",
                command,
                out.exit_status
            ))
        }
    }

    fn stage(&self, files: &CombinationFiles, host: &str) -> Result<(), failure::Error> {
        let conf = self
            .template
            .replace("TRACE_FILE", &files.trace)
            .replace("XML_FILE", &files.xml);

        let staging_dir = self.staging_dir();
        std::fs::create_dir_all(&staging_dir)?;
        let local_conf = staging_dir.join(&files.conf);
        std::fs::write(&local_conf, conf)?;

        self.remote
            .put(host, &[local_conf], &self.settings.remote_dir)
    }

    fn execute(
        &self,
        combination: &Combination,
        files: &CombinationFiles,
        host: &str,
    ) -> Result<(), failure::Error> {
        let generator = file_name(&self.settings.xml_generator)?;
        let base_xml = file_name(&self.settings.base_xml)?;
        let values = combination
            .values()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(" ");

        self.run_in_dir(
            host,
            &format!("python {} {} {} > {}", generator, base_xml, values, files.xml),
        )?;

        self.run_in_dir(
            host,
            &format!(
                "java -jar {} {} {} > {}",
                SIMULATOR_JAR, SIMULATOR_REQUESTS, files.conf, files.log
            ),
        )?;

        self.run_in_dir(
            host,
            &format!(
                "pj_dump {}.trace | grep REQTASK > {}",
                files.trace, files.csv
            ),
        )
    }

    fn collect(
        &self,
        combination: &Combination,
        files: &CombinationFiles,
        host: &str,
    ) -> Result<(), failure::Error> {
        let local_dir = self.settings.result_dir.join(combination.slug());

        if local_dir.exists() && std::fs::read_dir(&local_dir)?.next().is_some() {
            warn!(
                "{} already has results; removing them",
                local_dir.display()
            );
            std::fs::remove_dir_all(&local_dir)?;
        }
        std::fs::create_dir_all(&local_dir)?;

        let remote_dir = self.settings.remote_dir.as_str();
        self.remote.get(
            host,
            &[
                dir!(remote_dir, files.csv.as_str()),
                dir!(remote_dir, files.log.as_str()),
            ],
            &local_dir,
        )
    }
}

impl<E: RemoteExec + 'static> Workflow for SimulationWorkflow<E> {
    /// Create the output directories and copy the inputs shared by all combinations. Slots of
    /// the same host run in the same directory, so this must happen before any of them starts.
    fn prepare_host(&self, host: &str) -> Result<(), failure::Error> {
        let remote_dir = &self.settings.remote_dir;
        let out = self.remote.run(
            host,
            &format!(
                "mkdir -p {} {}",
                escape_for_bash(&dir!(remote_dir.as_str(), "log")),
                escape_for_bash(&dir!(remote_dir.as_str(), "csv")),
            ),
        )?;
        if !out.success() {
            failure::bail!("mkdir on {} exited with {}", host, out.exit_status);
        }

        self.remote.put(
            host,
            &[
                self.settings.xml_generator.clone(),
                self.settings.base_xml.clone(),
            ],
            remote_dir,
        )
    }

    fn run(&self, combination: &Combination, slot: &Slot) -> Result<(), failure::Error> {
        let files = CombinationFiles::new(combination);
        let host = slot.host.as_str();

        let failed = |stage: Stage, err: failure::Error| RunnerError::WorkerFailure {
            combination: combination.slug(),
            stage,
            reason: err.to_string(),
        };

        info!("{}: staging files for {}", slot, combination);
        self.stage(&files, host)
            .map_err(|err| failed(Stage::Staging, err))?;

        info!("{}: running the simulation for {}", slot, combination);
        self.execute(combination, &files, host)
            .map_err(|err| failed(Stage::Executing, err))?;

        info!("{}: collecting results of {}", slot, combination);
        self.collect(combination, &files, host)
            .map_err(|err| failed(Stage::Collecting, err))?;

        Ok(())
    }
}

fn file_name(path: &Path) -> Result<String, failure::Error> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| failure::format_err!("{} is not a file", path.display()))
}
