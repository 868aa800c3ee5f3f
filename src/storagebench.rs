//! Measure the throughput of a storage5k volume mounted over NFS from another site.
//!
//! A volume is reserved on the storage site and a node on the distant site. The node is
//! deployed with an NFS-capable image, mounts the volume, and `dd` measures write and read
//! throughput. Both reservations are deleted at the end, whatever happens, unless `-k` is given.

use std::path::Path;

use chrono::{offset::Local, DateTime};

use clap::clap_app;

use log::info;

use serde::Serialize;

use spurs::{cmd, Execute, SshShell};

use crate::{
    common::{
        is_usize, is_walltime, output::RunSettings, site_frontend, site_storage_server, Login,
        Username, DEPLOYED_USER,
    },
    error::RunnerError,
    remote::{RemoteExec, SshRemote},
    reservation::{parse_job_id, JobHandle, OarReservation, Reservation, ReservationGuard},
    settings,
};

pub const DEFAULT_STORAGE_SITE: &str = "rennes";
pub const DEFAULT_DISTANT_SITE: &str = "nancy";
pub const DEFAULT_SIZE_GB: u64 = 50;
pub const DEFAULT_WALLTIME: &str = "2:00:00";
pub const DEFAULT_IMAGE: &str = "wheezy-x64-nfs";
pub const DEFAULT_BLOCK_SIZE: &str = "64M";
pub const DEFAULT_COUNT: usize = 200;
pub const DEFAULT_RESULTS_DIR: &str = "results";

const MOUNT_POINT: &str = "/mnt/";
const TEST_FILE: &str = "test.out";

const JOB_NAME: &str = "storagebench";

pub fn cli_options() -> clap::App<'static, 'static> {
    clap_app! { storagebench =>
        (about: "Reserve storage on one site and a node on another, then measure the throughput \
                 of the storage from the node.")
        (@arg USERNAME: +required +takes_value
         "The username on the testbed (e.g. jdoe)")
        (@arg STORAGE_SITE: --storage_site +takes_value
         "(Optional) the site to reserve storage on (default: rennes)")
        (@arg DISTANT_SITE: --distant_site +takes_value
         "(Optional) the site of the node accessing the storage (default: nancy)")
        (@arg SIZE_GB: --size_gb +takes_value {is_usize}
         "(Optional) the amount of storage to reserve in GB (default: 50)")
        (@arg WALLTIME: -w --walltime +takes_value {is_walltime}
         "(Optional) the walltime of both reservations, H:MM:SS (default: 2:00:00)")
        (@arg IMAGE: --image +takes_value
         "(Optional) the NFS-capable environment to deploy (default: wheezy-x64-nfs)")
        (@arg BS: --bs +takes_value
         "(Optional) the dd block size (default: 64M)")
        (@arg COUNT: --count +takes_value {is_usize}
         "(Optional) the number of dd blocks (default: 200)")
        (@arg KEEP_ALIVE: -k --keep_alive
         "Do not delete the jobs at the end, e.g. for debugging")
        (@arg RESULTS_DIR: --results_dir +takes_value
         "(Optional) where to write the results (default: results)")
    }
}

pub fn run(sub_m: &clap::ArgMatches<'_>) -> Result<(), failure::Error> {
    let username = sub_m.value_of("USERNAME").unwrap();
    let storage_site = sub_m
        .value_of("STORAGE_SITE")
        .unwrap_or(DEFAULT_STORAGE_SITE);
    let distant_site = sub_m
        .value_of("DISTANT_SITE")
        .unwrap_or(DEFAULT_DISTANT_SITE);
    let size_gb = sub_m
        .value_of("SIZE_GB")
        .map(|s| s.parse::<u64>().unwrap())
        .unwrap_or(DEFAULT_SIZE_GB);
    let count = sub_m
        .value_of("COUNT")
        .map(|c| c.parse::<usize>().unwrap())
        .unwrap_or(DEFAULT_COUNT);

    let settings = settings! {
        * exp: "storagebench",
        * storage_site: storage_site,
        * distant_site: distant_site,
        * size_gb: size_gb,
        username: username,
        walltime: sub_m.value_of("WALLTIME").unwrap_or(DEFAULT_WALLTIME),
        image: sub_m.value_of("IMAGE").unwrap_or(DEFAULT_IMAGE),
        bs: sub_m.value_of("BS").unwrap_or(DEFAULT_BLOCK_SIZE),
        count: count,
        keep_alive: sub_m.is_present("KEEP_ALIVE"),
        results_dir: sub_m.value_of("RESULTS_DIR").unwrap_or(DEFAULT_RESULTS_DIR),
    };

    run_inner(&settings)
}

/// Run the benchmark using the settings passed. Note that because the only thing we are passed
/// are the settings, everything that influences the results is recorded in the settings file.
fn run_inner(settings: &RunSettings) -> Result<(), failure::Error> {
    let username = settings.get::<String>("username")?;
    let storage_site = settings.get::<String>("storage_site")?;
    let distant_site = settings.get::<String>("distant_site")?;
    let size_gb = settings.get::<u64>("size_gb")?;
    let walltime = settings.get::<String>("walltime")?;
    let image = settings.get::<String>("image")?;
    let bs = settings.get::<String>("bs")?;
    let count = settings.get::<usize>("count")?;
    let keep_alive = settings.get::<bool>("keep_alive")?;
    let results_dir = settings.get::<String>("results_dir")?;

    let mut timers = vec![];

    // Storage
    let storage_frontend = site_frontend(&storage_site);
    let storage = OarReservation::new(
        Login {
            username: Username(&username),
            hostname: &storage_frontend,
        }
        .connect()?,
        JOB_NAME,
    );

    let chunk_size = query_chunk_size(storage.shell())?;
    let chunks = chunks_needed(size_gb, chunk_size);
    info!(
        "Reserving {} chunks of {}GB on {} for {}GB",
        chunks, chunk_size, storage_site, size_gb
    );

    let storage_job = reserve_chunks(storage.shell(), chunks, &walltime)?;
    let _storage_guard = ReservationGuard::new(&storage, storage_job, keep_alive);
    time!(
        timers,
        "Storage reservation",
        storage.wait_until_started(&storage_job)?
    );

    // Node
    let distant_frontend = site_frontend(&distant_site);
    let distant = OarReservation::new(
        Login {
            username: Username(&username),
            hostname: &distant_frontend,
        }
        .connect()?,
        JOB_NAME,
    );

    let node_job = distant.acquire(1, &walltime)?;
    let _node_guard = ReservationGuard::new(&distant, node_job, keep_alive);

    let host = time!(timers, "Node reservation and deployment", {
        distant.wait_until_started(&node_job)?;
        let hosts = distant.list_nodes(&node_job)?;
        let deployed = distant.deploy_image(&hosts, &image)?;
        deployed.into_iter().next().ok_or_else(|| {
            RunnerError::reservation_failure(format!(
                "job {} has no node deployed with {}",
                node_job, image
            ))
        })?
    });

    // Benchmark
    let remote = SshRemote::new(DEPLOYED_USER);
    let volume = storage_volume(&storage_site, &username, &storage_job);

    let result = time!(
        timers,
        "Benchmark",
        run_benchmark(&remote, &host, &volume, &bs, count)?
    );

    println!(
        "Write: {} ({} - {})\nRead: {} ({} - {})",
        result.write_throughput,
        result.write_start,
        result.write_end,
        result.read_throughput,
        result.read_start,
        result.read_end,
    );

    let results_dir = Path::new(&results_dir);
    std::fs::create_dir_all(results_dir)?;
    settings.write_params(results_dir)?;
    let results_file = results_dir.join(settings.gen_file_name("csv"));
    write_results(&results_file, &result)?;
    info!("Results written to {}", results_file.display());

    for (label, duration) in timers {
        info!("{}: {:?}", label, duration);
    }

    Ok(())
}

/// One run of the benchmark.
#[derive(Clone, Debug, Serialize)]
pub struct BenchResult {
    pub host: String,
    pub volume: String,
    pub bs: String,
    pub count: usize,
    pub write_start: DateTime<Local>,
    pub write_end: DateTime<Local>,
    pub write_throughput: String,
    pub read_start: DateTime<Local>,
    pub read_end: DateTime<Local>,
    pub read_throughput: String,
}

/// The size of a storage5k chunk on the site, in GB.
fn query_chunk_size(shell: &SshShell) -> Result<u64, failure::Error> {
    let out = shell.run(cmd!("storage5k -a chunk_size"))?;
    parse_chunk_size(&out.stdout)
        .ok_or_else(|| failure::format_err!("no chunk size in {:?}", out.stdout))
}

/// Reserve `chunks` chunks of storage and return the job holding them.
fn reserve_chunks(
    shell: &SshShell,
    chunks: u64,
    walltime: &str,
) -> Result<JobHandle, failure::Error> {
    let out = shell.run(cmd!(
        "storage5k -a add -l chunks={},walltime={}",
        chunks,
        walltime
    ))?;

    let job = parse_job_id(&out.stdout).ok_or_else(|| {
        RunnerError::reservation_failure(format!(
            "no job id in storage5k output: {:?}",
            out.stdout
        ))
    })?;

    info!("Storage reserved: job {}", job);

    Ok(job)
}

/// Mount `volume`, then write and read a test file on it with `dd`.
pub fn run_benchmark(
    remote: &dyn RemoteExec,
    host: &str,
    volume: &str,
    bs: &str,
    count: usize,
) -> Result<BenchResult, failure::Error> {
    let run = |command: String| -> Result<String, failure::Error> {
        let out = remote.run(host, &command)?;
        if out.success() {
            Ok(out.stdout)
        } else {
            Err(failure::format_err!(
                "`{}` on {} exited with {}",
                command,
                host,
                out.exit_status
            ))
        }
    };

    info!("Mounting {} on {}:{}", volume, host, MOUNT_POINT);
    run(format!("mount {} {}", volume, MOUNT_POINT))?;

    let test_file = dir!(MOUNT_POINT, TEST_FILE);

    info!("Write benchmark on {}", host);
    let write_start = Local::now();
    let write = run(format!(
        "dd if=/dev/zero of={} bs={} count={} conv=fdatasync oflag=direct 2>&1",
        test_file, bs, count
    ))?;
    let write_end = Local::now();

    info!("Read benchmark on {}", host);
    let read_start = Local::now();
    let read = run(format!(
        "dd if={} of=/dev/null bs={} count={} iflag=direct 2>&1",
        test_file, bs, count
    ))?;
    let read_end = Local::now();

    let throughput = |out: &str| {
        parse_dd_throughput(out)
            .ok_or_else(|| failure::format_err!("no throughput in dd output: {:?}", out))
    };

    Ok(BenchResult {
        host: host.to_owned(),
        volume: volume.to_owned(),
        bs: bs.to_owned(),
        count,
        write_start,
        write_end,
        write_throughput: throughput(&write)?,
        read_start,
        read_end,
        read_throughput: throughput(&read)?,
    })
}

fn write_results(path: &Path, result: &BenchResult) -> Result<(), failure::Error> {
    let mut wtr = csv::WriterBuilder::new().from_path(path)?;
    wtr.serialize(result)?;
    wtr.flush()?;
    Ok(())
}

/// The NFS export of the storage reserved by `job` for `username`.
fn storage_volume(site: &str, username: &str, job: &JobHandle) -> String {
    format!("{}:data/{}_{}", site_storage_server(site), username, job)
}

/// The number of chunks needed to hold `size_gb`. At least one.
fn chunks_needed(size_gb: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 1;
    }
    ((size_gb + chunk_size - 1) / chunk_size).max(1)
}

/// `storage5k -a chunk_size` prints something like `Chunk size: 10G`.
fn parse_chunk_size(stdout: &str) -> Option<u64> {
    stdout
        .lines()
        .filter_map(|line| line.split_whitespace().last())
        .filter_map(|token| {
            token
                .trim_end_matches(|c: char| !c.is_ascii_digit())
                .parse::<u64>()
                .ok()
        })
        .find(|&size| size > 0)
}

/// The throughput from the summary line of `dd`, e.g. `255 MB/s`: the last two words of the
/// last `copied` line.
fn parse_dd_throughput(out: &str) -> Option<String> {
    let line = out.lines().rev().find(|line| line.contains("copied"))?;
    let words: Vec<_> = line.split_whitespace().collect();

    if words.len() < 2 {
        return None;
    }

    Some(words[words.len() - 2..].join(" "))
}
