//! Worker pool and dispatch loop.
//!
//! The dispatch loop leases jobs from the [`JobQueue`] while worker permits
//! are free, hands each lease to a spawned worker task and settles the queue
//! from the worker's [`JobOutcome`]:
//!
//! | Outcome | Queue action |
//! |---------|--------------|
//! | `Completed` | ack |
//! | `Retrying` | release until the backoff ends |
//! | `CoolingDown` | release until the cool-down ends; store leasing paused |
//! | `Failed` | dead-letter |
//! | `Superseded` | none; the newer lease holder settles |
//!
//! Per-store limits are enforced at lease time: stores cooling down or already
//! at `per_store_concurrency` are passed to the queue as blocked. Request
//! pacing is a per-store token bucket handed to every job of that store.

use crate::config::IngestConfig;
use crate::error::{ErrorClass, IngestError, QueueError};
use crate::job::{ExtractionJob, JobState};
use crate::model::{SourceRef, StoreId};
use crate::rate_limit::{CooldownBook, StoreLimiters};
use crate::runner::{JobOutcome, JobRunner};
use crate::store::{CatalogStore, Inserted, JobQueue, Lease};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::{interval, sleep, timeout, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

const EVENT_BUS_CAPACITY: usize = 256;

/// Event emitted by the scheduler.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// The dispatch loop started.
    WorkerStarted,
    /// A job was leased and handed to a worker.
    JobLeased {
        job_id: Uuid,
        store_id: StoreId,
        deliveries: u32,
    },
    /// A worker finished a run and the queue was settled.
    JobFinished {
        job_id: Uuid,
        store_id: StoreId,
        outcome: JobOutcome,
    },
    /// A run could not even load or save its job.
    JobErrored {
        job_id: Uuid,
        store_id: StoreId,
        error: String,
    },
    /// Leasing for a store is paused until `until`.
    StoreCooling {
        store_id: StoreId,
        until: DateTime<Utc>,
    },
    /// The dispatch loop stopped.
    WorkerStopped,
}

/// Result of [`Scheduler::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub job_id: Uuid,
    /// False when an open job already existed for the flyer slot.
    pub created: bool,
}

/// What a worker sends back to the dispatch loop.
struct WorkerReport {
    job_id: Uuid,
    store_id: StoreId,
    outcome: Result<JobOutcome, String>,
}

pub struct Scheduler {
    config: Arc<IngestConfig>,
    queue: Arc<dyn JobQueue>,
    catalog: Arc<dyn CatalogStore>,
    runner: Arc<JobRunner>,
    limiters: Arc<StoreLimiters>,
    event_tx: broadcast::Sender<SchedulerEvent>,
}

impl Scheduler {
    pub fn new(
        config: Arc<IngestConfig>,
        queue: Arc<dyn JobQueue>,
        catalog: Arc<dyn CatalogStore>,
        runner: Arc<JobRunner>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let limiters = Arc::new(StoreLimiters::new(
            config.scheduler.per_store_requests_per_minute,
        ));
        Self {
            config,
            queue,
            catalog,
            runner,
            limiters,
            event_tx,
        }
    }

    /// Get a receiver for scheduler events.
    pub fn events(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.event_tx.subscribe()
    }

    /// Create a job for `source` unless the flyer slot already has an open
    /// one, and enqueue it.
    pub async fn submit(&self, source: SourceRef) -> Result<Submission, IngestError> {
        let now = Utc::now();
        match self
            .catalog
            .insert_job_if_absent(ExtractionJob::new(source, now))
            .await?
        {
            Inserted::New(job) => {
                self.queue
                    .enqueue(job.id, &job.source.store_id, now)
                    .await?;
                info!(job_id = %job.id, slot = %job.source.slot_key(), "Job submitted");
                Ok(Submission {
                    job_id: job.id,
                    created: true,
                })
            }
            Inserted::Existing(job) => {
                debug!(job_id = %job.id, state = %job.state, "Flyer slot already has an open job");
                Ok(Submission {
                    job_id: job.id,
                    created: false,
                })
            }
        }
    }

    /// Ask every registered store for its current flyers and submit them.
    ///
    /// A store that fails discovery is skipped; the others continue.
    #[instrument(skip(self))]
    pub async fn discover(&self) -> Result<Vec<Submission>, IngestError> {
        let mut submissions = Vec::new();
        let sources = self.runner.sources();
        let mut stores: Vec<&StoreId> = sources.stores().collect();
        stores.sort();

        for store in stores {
            let Some(source) = sources.get(store) else {
                continue;
            };
            self.limiters.get(store).acquire().await;
            let flyers = match source.discover().await {
                Ok(flyers) => flyers,
                Err(e) => {
                    warn!(store = %store, class = %e.class(), "Discovery failed: {}", e);
                    continue;
                }
            };
            debug!(store = %store, flyers = flyers.len(), "Discovered flyers");
            for flyer in flyers {
                submissions.push(self.submit(flyer).await?);
            }
        }

        info!(
            submitted = submissions.len(),
            created = submissions.iter().filter(|s| s.created).count(),
            "Discovery finished"
        );
        Ok(submissions)
    }

    /// Re-enqueue every non-terminal job in the catalog. Used after a restart
    /// when the queue may have lost entries the catalog still holds.
    pub async fn recover(&self) -> Result<usize, IngestError> {
        let now = Utc::now();
        let mut count = 0;
        for state in [
            JobState::Discovered,
            JobState::Rendering,
            JobState::Extracting,
            JobState::Aggregating,
            JobState::Matching,
            JobState::Retrying,
        ] {
            for job in self.catalog.jobs_in_state(state).await? {
                let eligible_at = job.next_eligible_at.unwrap_or(now);
                self.queue
                    .enqueue(job.id, &job.source.store_id, eligible_at)
                    .await?;
                count += 1;
            }
        }
        if count > 0 {
            info!(jobs = count, "Re-enqueued unfinished jobs");
        }
        Ok(count)
    }

    /// Run the dispatch loop until `shutdown` is cancelled. Running jobs are
    /// allowed to finish.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), IngestError> {
        self.dispatch(shutdown, false).await
    }

    /// Run the dispatch loop until the queue holds no more jobs, dead letters
    /// aside. Jobs waiting out a backoff or a cool-down keep it running.
    pub async fn run_until_idle(&self) -> Result<(), IngestError> {
        self.dispatch(CancellationToken::new(), true).await
    }

    #[instrument(skip_all, fields(workers = self.config.scheduler.workers))]
    async fn dispatch(&self, shutdown: CancellationToken, until_idle: bool) -> Result<(), IngestError> {
        let sched = &self.config.scheduler;
        let poll_interval = Duration::from_millis(sched.poll_interval_ms);
        let permits = Arc::new(Semaphore::new(sched.workers.max(1)));
        let (report_tx, mut report_rx) = mpsc::channel::<WorkerReport>(sched.workers.max(1) * 2);

        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut running: HashMap<Id, StoreId> = HashMap::new();
        let mut in_flight: HashMap<StoreId, usize> = HashMap::new();
        let mut cooldowns = CooldownBook::default();

        info!(
            per_store = sched.per_store_concurrency,
            poll_interval_ms = sched.poll_interval_ms,
            "Scheduler started"
        );
        let _ = self.event_tx.send(SchedulerEvent::WorkerStarted);

        loop {
            if shutdown.is_cancelled() {
                info!("Scheduler received shutdown signal");
                break;
            }

            // Fill free worker slots.
            let mut leased = 0usize;
            while let Ok(permit) = permits.clone().try_acquire_owned() {
                let now = Utc::now();
                let blocked = self.blocked_stores(&mut cooldowns, &in_flight, now);
                match self.queue.lease(now, sched.lease_timeout(), &blocked).await {
                    Ok(Some(lease)) => {
                        leased += 1;
                        *in_flight.entry(lease.store_id.clone()).or_default() += 1;
                        let store_id = lease.store_id.clone();
                        let worker = self.worker_ref(report_tx.clone());
                        let handle = tasks.spawn(worker.execute(lease, permit));
                        running.insert(handle.id(), store_id);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "Failed to lease job");
                        break;
                    }
                }
            }
            if leased > 0 {
                debug!(leased, running = tasks.len(), "Dispatched jobs");
            }

            if until_idle && tasks.is_empty() && leased == 0 {
                match self.queue.pending().await {
                    Ok(0) => {
                        info!("Queue drained");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Failed to read queue depth"),
                }
            }

            // Reports before joins: a cool-down must be known before the
            // finished worker's permit is handed out again.
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Scheduler received shutdown signal");
                    break;
                }
                Some(report) = report_rx.recv() => {
                    self.absorb(report, &mut cooldowns);
                }
                Some(joined) = tasks.join_next_with_id(), if !tasks.is_empty() => {
                    reap(joined, &mut running, &mut in_flight);
                }
                _ = sleep(poll_interval) => {}
            }
        }

        // Let running jobs finish so their leases are settled.
        drop(report_tx);
        loop {
            tokio::select! {
                biased;
                Some(report) = report_rx.recv() => self.absorb(report, &mut cooldowns),
                Some(joined) = tasks.join_next_with_id(), if !tasks.is_empty() => {
                    reap(joined, &mut running, &mut in_flight);
                }
                else => break,
            }
        }

        let _ = self.event_tx.send(SchedulerEvent::WorkerStopped);
        info!("Scheduler stopped");
        Ok(())
    }

    /// Stores that must not be leased right now.
    fn blocked_stores(
        &self,
        cooldowns: &mut CooldownBook,
        in_flight: &HashMap<StoreId, usize>,
        now: DateTime<Utc>,
    ) -> Vec<StoreId> {
        let limit = self.config.scheduler.per_store_concurrency.max(1);
        let mut blocked = cooldowns.suspended(now);
        let saturated: Vec<StoreId> = in_flight
            .iter()
            .filter(|(store, n)| **n >= limit && !blocked.contains(store))
            .map(|(store, _)| store.clone())
            .collect();
        blocked.extend(saturated);
        blocked
    }

    fn absorb(&self, report: WorkerReport, cooldowns: &mut CooldownBook) {
        let WorkerReport {
            job_id,
            store_id,
            outcome,
        } = report;
        match outcome {
            Ok(outcome) => {
                if let JobOutcome::CoolingDown { store_id, until } = &outcome {
                    cooldowns.suspend(store_id, *until);
                    let _ = self.event_tx.send(SchedulerEvent::StoreCooling {
                        store_id: store_id.clone(),
                        until: *until,
                    });
                }
                let _ = self.event_tx.send(SchedulerEvent::JobFinished {
                    job_id,
                    store_id,
                    outcome,
                });
            }
            Err(error) => {
                let _ = self.event_tx.send(SchedulerEvent::JobErrored {
                    job_id,
                    store_id,
                    error,
                });
            }
        }
    }

    fn worker_ref(&self, report_tx: mpsc::Sender<WorkerReport>) -> WorkerRef {
        WorkerRef {
            config: self.config.clone(),
            queue: self.queue.clone(),
            runner: self.runner.clone(),
            limiters: self.limiters.clone(),
            event_tx: self.event_tx.clone(),
            report_tx,
        }
    }
}

fn reap(
    joined: Result<(Id, ()), JoinError>,
    running: &mut HashMap<Id, StoreId>,
    in_flight: &mut HashMap<StoreId, usize>,
) {
    let id = match joined {
        Ok((id, ())) => id,
        Err(e) => {
            error!(error = ?e, "Job task panicked");
            e.id()
        }
    };
    if let Some(store) = running.remove(&id) {
        if let Some(n) = in_flight.get_mut(&store) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                in_flight.remove(&store);
            }
        }
    }
}

/// Everything a spawned worker task needs.
struct WorkerRef {
    config: Arc<IngestConfig>,
    queue: Arc<dyn JobQueue>,
    runner: Arc<JobRunner>,
    limiters: Arc<StoreLimiters>,
    event_tx: broadcast::Sender<SchedulerEvent>,
    report_tx: mpsc::Sender<WorkerReport>,
}

impl WorkerRef {
    /// Process one leased job and settle its lease.
    async fn execute(self, lease: Lease, _permit: OwnedSemaphorePermit) {
        let start = Instant::now();
        let job_id = lease.job_id;
        let store_id = lease.store_id.clone();
        info!(%job_id, store = %store_id, deliveries = lease.deliveries, "Processing job");
        let _ = self.event_tx.send(SchedulerEvent::JobLeased {
            job_id,
            store_id: store_id.clone(),
            deliveries: lease.deliveries,
        });

        let (lease, result) = self.run_with_heartbeat(lease).await;

        let outcome = match result {
            Ok(outcome) => {
                self.settle(&lease, &outcome).await;
                info!(
                    %job_id,
                    store = %store_id,
                    duration_ms = start.elapsed().as_millis() as u64,
                    outcome = outcome_label(&outcome),
                    "Job run finished"
                );
                Ok(outcome)
            }
            Err(e) => {
                error!(%job_id, error = %e, "Job run errored");
                self.settle_error(&lease, &e).await;
                Err(e.to_string())
            }
        };

        let _ = self
            .report_tx
            .send(WorkerReport {
                job_id,
                store_id,
                outcome,
            })
            .await;
    }

    /// Run the job under its deadline, extending the lease while it runs.
    async fn run_with_heartbeat(&self, mut lease: Lease) -> (Lease, Result<JobOutcome, IngestError>) {
        let sched = &self.config.scheduler;
        let deadline = sched.job_deadline();
        let limiter = self.limiters.get(&lease.store_id);
        let run = timeout(deadline, self.runner.run(lease.job_id, Some(limiter)));
        tokio::pin!(run);

        let mut heartbeat = interval((sched.lease_timeout() / 3).max(Duration::from_secs(1)));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        let result = loop {
            tokio::select! {
                result = &mut run => break result,
                _ = heartbeat.tick() => {
                    match self.queue.heartbeat(&lease, Utc::now(), sched.lease_timeout()).await {
                        Ok(extended) => lease = extended,
                        Err(e) => warn!(job_id = %lease.job_id, error = %e, "Lease heartbeat failed"),
                    }
                }
            }
        };

        let result = match result {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    job_id = %lease.job_id,
                    "Job exceeded deadline of {}s",
                    deadline.as_secs()
                );
                self.runner
                    .abandon(
                        lease.job_id,
                        IngestError::LeaseDeadline {
                            job_id: lease.job_id,
                            secs: deadline.as_secs(),
                        },
                    )
                    .await
            }
        };
        (lease, result)
    }

    async fn settle(&self, lease: &Lease, outcome: &JobOutcome) {
        let now = Utc::now();
        let result = match outcome {
            JobOutcome::Completed(_) | JobOutcome::AlreadyTerminal(JobState::Completed) => {
                self.queue.ack(lease).await
            }
            JobOutcome::Retrying { eligible_at } => self.queue.release(lease, *eligible_at).await,
            JobOutcome::CoolingDown { until, .. } => self.queue.release(lease, *until).await,
            JobOutcome::NotReady { eligible_at } => {
                self.queue
                    .release(lease, eligible_at.unwrap_or(now))
                    .await
            }
            JobOutcome::Failed { reason, summary } => {
                warn!(job_id = %lease.job_id, %reason, %summary, "Job dead-lettered");
                self.queue
                    .fail(lease, &format!("{reason}: {summary}"))
                    .await
            }
            JobOutcome::AlreadyTerminal(state) => {
                self.queue
                    .fail(lease, &format!("job already {state}"))
                    .await
            }
            JobOutcome::Superseded => Ok(()),
        };
        if let Err(e) = result {
            log_settle_error(lease, e);
        }
    }

    /// The job could not be loaded or its state could not be saved.
    async fn settle_error(&self, lease: &Lease, err: &IngestError) {
        let result = if err.class() == ErrorClass::TerminalJobFailure {
            self.queue.fail(lease, &err.summary()).await
        } else {
            let retry_at = Utc::now()
                + chrono::Duration::from_std(self.config.retry.backoff(0))
                    .unwrap_or_else(|_| chrono::Duration::seconds(30));
            self.queue.release(lease, retry_at).await
        };
        if let Err(e) = result {
            log_settle_error(lease, e);
        }
    }
}

fn log_settle_error(lease: &Lease, err: QueueError) {
    match err {
        QueueError::LeaseLost { .. } => {
            warn!(job_id = %lease.job_id, "Lease lost before the job was settled")
        }
        e => error!(job_id = %lease.job_id, error = %e, "Failed to settle lease"),
    }
}

fn outcome_label(outcome: &JobOutcome) -> &'static str {
    match outcome {
        JobOutcome::Completed(_) => "completed",
        JobOutcome::Retrying { .. } => "retrying",
        JobOutcome::CoolingDown { .. } => "cooling_down",
        JobOutcome::Failed { .. } => "failed",
        JobOutcome::NotReady { .. } => "not_ready",
        JobOutcome::AlreadyTerminal(_) => "already_terminal",
        JobOutcome::Superseded => "superseded",
    }
}
