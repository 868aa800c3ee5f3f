//! The sweep dispatcher.
//!
//! The dispatcher owns the sweep queue and the pool of execution slots. It hands combinations
//! to free slots, one worker thread per slot, until every combination has run or the
//! reservation backing the slots dies.
//!
//! Workers never touch the queue or the pool. Each worker sends exactly one `Report` over a
//! channel when it is done, and the dispatcher applies it. Since the dispatcher is the only
//! thread that moves combinations or slots around, `next_combination` and `mark_done` are
//! atomic with respect to each other without any locking.
//!
//! A worker thread that exits without a report has panicked. The dispatcher snapshots which
//! threads have exited _before_ it drains the channel; a worker sends its report before its
//! thread exits, so any report from a thread in the snapshot is seen in that drain. Every
//! combination thus gets exactly one terminal transition.
//!
//! Failed combinations are canceled and never retried.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use log::{debug, error, info, warn};

use crate::error::RunnerError;
use crate::reservation::{JobHandle, Reservation};
use crate::sweep::{Combination, SweepQueue};

/// How long to wait for a slot to free up before checking again.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// How long to wait between checks while draining the last workers.
pub const DRAIN_INTERVAL: Duration = Duration::from_secs(20);

/// One assignable execution slot. A host contributes one slot per hardware thread.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Slot {
    pub host: String,
    pub index: usize,
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}#{}", self.host, self.index)
    }
}

/// The execution slots not currently assigned to a worker, in FIFO order.
#[derive(Debug, Default)]
pub struct HostPool {
    available: VecDeque<Slot>,
}

impl HostPool {
    /// A pool with `slots` slots for each `(host, slots)`, hosts in the given order.
    pub fn from_hosts(hosts: &[(String, usize)]) -> Self {
        HostPool {
            available: hosts
                .iter()
                .flat_map(|(host, slots)| {
                    (0..*slots).map(move |index| Slot {
                        host: host.clone(),
                        index,
                    })
                })
                .collect(),
        }
    }

    /// Take the slot at the head of the pool.
    pub fn take(&mut self) -> Option<Slot> {
        self.available.pop_front()
    }

    /// Return a slot to the back of the pool after use.
    pub fn give_back(&mut self, slot: Slot) {
        self.available.push_back(slot);
    }

    /// Put back a slot that was taken but not used, at the head of the pool.
    fn restore(&mut self, slot: Slot) {
        self.available.push_front(slot);
    }

    pub fn available(&self) -> usize {
        self.available.len()
    }
}

/// What a worker does with its combination: stage files, execute, collect results.
///
/// An `Err` cancels the combination. The workflow for one combination runs sequentially on
/// its worker's thread; different combinations run concurrently.
pub trait Workflow: Send + Sync + 'static {
    /// Set up `host` for running combinations: everything the slots of a host share. Called
    /// once per host before any of its slots is dispatched to.
    fn prepare_host(&self, _host: &str) -> Result<(), failure::Error> {
        Ok(())
    }

    fn run(&self, combination: &Combination, slot: &Slot) -> Result<(), failure::Error>;
}

impl<F> Workflow for F
where
    F: Fn(&Combination, &Slot) -> Result<(), failure::Error> + Send + Sync + 'static,
{
    fn run(&self, combination: &Combination, slot: &Slot) -> Result<(), failure::Error> {
        self(combination, slot)
    }
}

#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Maximum number of concurrently running workers.
    pub max_workers: usize,
    pub poll_interval: Duration,
    pub drain_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig {
            max_workers: usize::MAX,
            poll_interval: POLL_INTERVAL,
            drain_interval: DRAIN_INTERVAL,
        }
    }
}

/// How a combination ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Canceled { error: String },
}

/// A record of one terminal transition.
#[derive(Clone, Debug)]
pub struct RunRecord {
    pub combination: Combination,
    pub slot: Slot,
    pub outcome: Outcome,
    pub duration: Duration,
}

/// The result of one `dispatch_loop`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// The reservation died before every combination was dispatched.
    pub reservation_lost: bool,
}

/// A worker's one and only message to the dispatcher.
struct Report {
    worker: usize,
    result: Result<(), failure::Error>,
}

/// A running worker, as tracked by the dispatcher.
struct Worker {
    combination: Combination,
    slot: Slot,
    handle: JoinHandle<()>,
    started: Instant,
}

pub struct Dispatcher {
    queue: SweepQueue,
    pool: HostPool,
    config: DispatchConfig,

    /// Running workers by ID.
    workers: HashMap<usize, Worker>,
    next_worker: usize,

    reports_tx: Sender<Report>,
    reports_rx: Receiver<Report>,

    /// Set once the reservation is seen dead. Slots of workers finishing afterwards are
    /// discarded, since their hosts may be gone.
    reservation_lost: bool,

    records: Vec<RunRecord>,
}

impl Dispatcher {
    pub fn new(queue: SweepQueue, config: DispatchConfig) -> Self {
        let (reports_tx, reports_rx) = unbounded();

        Dispatcher {
            queue,
            pool: HostPool::default(),
            config,
            workers: HashMap::new(),
            next_worker: 0,
            reports_tx,
            reports_rx,
            reservation_lost: false,
            records: vec![],
        }
    }

    pub fn queue(&self) -> &SweepQueue {
        &self.queue
    }

    pub fn records(&self) -> &[RunRecord] {
        &self.records
    }

    /// Move one remaining combination to in-progress and return it.
    pub fn next_combination(&mut self) -> Option<Combination> {
        self.queue.next()
    }

    /// Move an in-progress combination to completed or canceled.
    ///
    /// # Panics
    ///
    /// If `combination` is not in progress.
    pub fn mark_done(&mut self, combination: &Combination, success: bool) {
        self.queue.done(combination, success);
        info!(
            "{} has been {}. {} remaining.",
            combination,
            if success { "done" } else { "canceled" },
            self.queue.remaining()
        );
    }

    /// Run remaining combinations on the slots of `pool` until none remain or `job` dies, then
    /// wait for every dispatched worker to finish.
    ///
    /// Fails without dispatching anything if nothing could ever be dispatched (no slots, or a
    /// worker limit of zero).
    pub fn dispatch_loop(
        &mut self,
        reservation: &dyn Reservation,
        job: &JobHandle,
        pool: HostPool,
        workflow: Arc<dyn Workflow>,
    ) -> Result<DispatchOutcome, failure::Error> {
        if pool.available() == 0 {
            return Err(RunnerError::reservation_failure("no execution slots").into());
        }
        if self.config.max_workers == 0 {
            return Err(RunnerError::reservation_failure("worker limit is zero").into());
        }

        self.pool = pool;
        self.reservation_lost = false;

        info!(
            "Dispatching {} combinations on {} slots",
            self.queue.remaining(),
            self.pool.available()
        );

        while self.queue.remaining() > 0 {
            self.reclaim();

            if !reservation.is_alive(job) {
                warn!(
                    "Job {} is no longer alive. {} combinations were not dispatched.",
                    job,
                    self.queue.remaining()
                );
                self.reservation_lost = true;
                break;
            }

            if self.workers.len() < self.config.max_workers {
                if let Some(slot) = self.pool.take() {
                    match self.next_combination() {
                        Some(combination) => {
                            self.spawn(combination, slot, &workflow);
                            continue;
                        }
                        None => {
                            self.pool.restore(slot);
                            break;
                        }
                    }
                }
            }

            debug!(
                "{} combinations in progress, {} slots free; waiting",
                self.queue.in_progress(),
                self.pool.available()
            );
            self.wait(self.config.poll_interval);
        }

        self.drain();

        Ok(DispatchOutcome {
            reservation_lost: self.reservation_lost,
        })
    }

    fn spawn(&mut self, combination: Combination, slot: Slot, workflow: &Arc<dyn Workflow>) {
        let id = self.next_worker;
        self.next_worker += 1;

        let reports = self.reports_tx.clone();
        let workflow = Arc::clone(workflow);
        let (thread_combination, thread_slot) = (combination.clone(), slot.clone());

        let spawned = std::thread::Builder::new()
            .name(format!("worker-{}", slot))
            .spawn(move || {
                let result = workflow.run(&thread_combination, &thread_slot);

                // The dispatcher holds a sender, so the channel is never closed.
                let _ = reports.send(Report { worker: id, result });
            });

        match spawned {
            Ok(handle) => {
                info!("Running {} on {}", combination, slot);
                self.workers.insert(
                    id,
                    Worker {
                        combination,
                        slot,
                        handle,
                        started: Instant::now(),
                    },
                );
            }
            Err(err) => {
                error!("Unable to start a worker for {}: {}", combination, err);
                self.mark_done(&combination, false);
                self.records.push(RunRecord {
                    combination,
                    slot: slot.clone(),
                    outcome: Outcome::Canceled {
                        error: err.to_string(),
                    },
                    duration: Duration::from_secs(0),
                });
                self.pool.restore(slot);
            }
        }
    }

    /// Apply every pending report, and cancel the combinations of workers that died without
    /// one.
    fn reclaim(&mut self) {
        // Snapshot before draining; see the module docs.
        let exited: Vec<usize> = self
            .workers
            .iter()
            .filter(|(_, worker)| worker.handle.is_finished())
            .map(|(&id, _)| id)
            .collect();

        while let Ok(report) = self.reports_rx.try_recv() {
            self.apply(report);
        }

        for id in exited {
            if let Some(worker) = self.workers.remove(&id) {
                let panic = worker.handle.join().err();
                let error = panic
                    .as_ref()
                    .and_then(|p| {
                        p.downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| p.downcast_ref::<String>().cloned())
                    })
                    .unwrap_or_else(|| "worker thread panicked".into());

                error!(
                    "Worker for {} on {} died without reporting: {}",
                    worker.combination, worker.slot, error
                );

                self.finish(
                    worker.combination,
                    worker.slot,
                    worker.started,
                    Err(failure::err_msg(error)),
                );
            }
        }
    }

    /// Wait up to `timeout` for a report, applying it if one arrives.
    fn wait(&mut self, timeout: Duration) {
        match self.reports_rx.recv_timeout(timeout) {
            Ok(report) => self.apply(report),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => unreachable!("dispatcher holds a sender"),
        }
    }

    fn apply(&mut self, report: Report) {
        let worker = match self.workers.remove(&report.worker) {
            Some(worker) => worker,
            None => {
                error!("Report from unknown worker {}", report.worker);
                return;
            }
        };

        // The thread sends its report as its last action, so this does not block for long.
        if worker.handle.join().is_err() {
            warn!("Worker for {} panicked after reporting", worker.combination);
        }

        self.finish(worker.combination, worker.slot, worker.started, report.result);
    }

    fn finish(
        &mut self,
        combination: Combination,
        slot: Slot,
        started: Instant,
        result: Result<(), failure::Error>,
    ) {
        let outcome = match result {
            Ok(()) => Outcome::Completed,
            Err(err) => {
                warn!("{}: {} failed: {}", slot, combination, err);
                Outcome::Canceled {
                    error: err.to_string(),
                }
            }
        };

        self.mark_done(&combination, outcome == Outcome::Completed);

        self.records.push(RunRecord {
            combination,
            slot: slot.clone(),
            outcome,
            duration: started.elapsed(),
        });

        if self.reservation_lost {
            info!("Discarding slot {} of a dead reservation", slot);
        } else {
            self.pool.give_back(slot);
        }
    }

    /// Block until every dispatched worker has reported.
    fn drain(&mut self) {
        while !self.workers.is_empty() {
            info!("Waiting for {} workers to complete", self.workers.len());
            self.wait(self.config.drain_interval);
            self.reclaim();
        }
    }
}
