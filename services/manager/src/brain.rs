//! The orchestrator.
//!
//! [`Brain`] ties the port pool, the registry and worker processes together:
//! it launches and shuts down workers, attaches heartbeat connections, ranks
//! workers for backfill, and runs the periodic sweep that reclaims workers
//! that are fatal, silent or idle.
//!
//! Registry removal and port return happen in exactly one place, the
//! completion callback installed by [`Brain::launch`]. Everything else only
//! asks a worker to stop.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lift_id::WorkerId;
use lift_networking::{Port, PortError, PortPool, PortPoolParams};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

use crate::heartbeat::HeartbeatConnection;
use crate::process::ProcessError;
use crate::registry::{Registry, RegistryError};
use crate::task::{run_isolated, wait_closed, BackoffPolicy};
use crate::worker::{MonitoringStatus, WorkerInfo, WorkerParams, WorkerProcess};

#[derive(Debug, Error)]
pub enum BrainError {
    #[error("class index {index} out of range ({count} classes configured)")]
    IndexOutOfRange { index: usize, count: usize },

    #[error("worker not found: {0}")]
    NotFound(WorkerId),

    #[error("worker {0} already has a heartbeat connection")]
    AlreadyConnected(WorkerId),

    #[error("class {name} declares index {index} but sits at position {position}")]
    ClassIndexMismatch {
        name: String,
        index: usize,
        position: usize,
    },

    #[error(transparent)]
    Port(#[from] PortError),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl From<RegistryError> for BrainError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(id) => BrainError::NotFound(id),
        }
    }
}

/// A kind of worker the manager can launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessClass {
    pub name: String,
    pub index: usize,
    #[serde(skip)]
    pub executable: String,
    #[serde(skip)]
    pub args: Vec<String>,
    /// Client connections one worker can hold.
    pub capacity: i64,
    /// Workers older than this are not offered for backfill.
    pub max_backfill_secs: u64,
}

impl ProcessClass {
    pub fn max_backfill_age(&self) -> Duration {
        Duration::from_secs(self.max_backfill_secs)
    }
}

#[derive(Debug, Clone)]
pub struct BrainParams {
    pub classes: Vec<ProcessClass>,
    pub worker_listen_address: String,
    pub heartbeat_timeout: Duration,
    pub ports: PortPoolParams,
    pub sweep_interval: Duration,
    pub minimum_wait_for_close: Duration,
}

/// Result of a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LaunchedWorker {
    pub id: WorkerId,
    pub port: Port,
}

/// One entry of a backfill ranking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackfillCandidate {
    pub id: WorkerId,
    pub port: Port,
    pub since: DateTime<Utc>,
    pub active_session_count: i64,
}

/// Why the sweep decided to stop a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReapReason {
    Fatal,
    Silent,
    NeverEstablished,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Reaped {
    pub id: WorkerId,
    pub reason: ReapReason,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub before: usize,
    pub after: usize,
    pub total_connections: i64,
    pub total_sessions: i64,
    pub total_active_sessions: i64,
    pub reaped: Vec<Reaped>,
}

/// Orchestrator handle. Cheap to clone.
#[derive(Clone)]
pub struct Brain {
    inner: Arc<BrainInner>,
}

struct BrainInner {
    params: BrainParams,
    ports: PortPool,
    registry: Arc<Registry>,
}

impl Brain {
    /// Every class must carry its own position in `params.classes` as its
    /// index.
    pub fn new(params: BrainParams, registry: Arc<Registry>) -> Result<Self, BrainError> {
        if let Some((position, class)) = params
            .classes
            .iter()
            .enumerate()
            .find(|(position, class)| class.index != *position)
        {
            return Err(BrainError::ClassIndexMismatch {
                name: class.name.clone(),
                index: class.index,
                position,
            });
        }

        let ports = PortPool::new(params.ports)?;
        Ok(Self {
            inner: Arc::new(BrainInner {
                params,
                ports,
                registry,
            }),
        })
    }

    pub fn classes(&self) -> &[ProcessClass] {
        &self.inner.params.classes
    }

    pub fn port_pool(&self) -> &PortPool {
        &self.inner.ports
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn class(&self, index: usize) -> Result<&ProcessClass, BrainError> {
        let classes = &self.inner.params.classes;
        classes.get(index).ok_or(BrainError::IndexOutOfRange {
            index,
            count: classes.len(),
        })
    }

    /// Launch a worker of the given class.
    #[instrument(skip(self))]
    pub fn launch(&self, class_index: usize) -> Result<LaunchedWorker, BrainError> {
        let class = self.class(class_index)?;
        let port = self.inner.ports.next()?;

        let params = &self.inner.params;
        let worker = loop {
            let id = WorkerId::new();
            let worker = WorkerProcess::new(WorkerParams {
                id,
                class_index,
                port,
                program: class.executable.clone(),
                args: class.args.clone(),
                listen_address: params.worker_listen_address.clone(),
                heartbeat_timeout: params.heartbeat_timeout,
            });
            // Register first; an instant exit reclaims this entry.
            if self.inner.registry.add(id, worker.clone()) {
                break worker;
            }
        };
        let id = worker.id();

        let inner = Arc::clone(&self.inner);
        if let Err(e) = worker.start_process(move || inner.reclaim(id, port)) {
            error!(
                worker_id = %id,
                port = %port,
                class = %class.name,
                error = %e,
                "Failed to start worker"
            );
            self.inner.reclaim(id, port);
            return Err(e.into());
        }

        info!(worker_id = %id, port = %port, class = %class.name, "Worker launched");
        Ok(LaunchedWorker { id, port })
    }

    /// Ask a worker to stop. Its registry entry goes away once the process
    /// has ended.
    pub fn shutdown(&self, id: WorkerId) -> Result<(), BrainError> {
        let worker = self.inner.registry.item(&id)?;
        debug!(worker_id = %id, "Closing worker");
        worker.end_process();
        Ok(())
    }

    /// Fail early if `id` is unknown or already has a connection.
    pub fn ensure_connectable(&self, id: WorkerId) -> Result<(), BrainError> {
        let worker = self.inner.registry.item(&id)?;
        if worker.can_attach() {
            Ok(())
        } else {
            Err(BrainError::AlreadyConnected(id))
        }
    }

    /// Attach a heartbeat connection to a worker.
    pub fn connect<C>(&self, id: WorkerId, conn: C) -> Result<(), BrainError>
    where
        C: HeartbeatConnection,
    {
        let worker = self.inner.registry.item(&id)?;
        if worker.start_listen(conn) {
            Ok(())
        } else {
            Err(BrainError::AlreadyConnected(id))
        }
    }

    /// Rank live workers of a class for receiving new sessions.
    pub fn backfill_list(
        &self,
        class_index: usize,
    ) -> Result<Vec<BackfillCandidate>, BrainError> {
        let class = self.class(class_index)?;
        let snapshot = self.inner.registry.unsorted_info();
        Ok(rank_backfill(&snapshot.infos, class_index, class, Utc::now()))
    }

    /// Run one reaping pass over the registry.
    pub fn sweep_once(&self) -> SweepReport {
        let now = Utc::now();
        let min_wait = self.inner.params.minimum_wait_for_close;
        let snapshot = self.inner.registry.unsorted_info();

        let mut report = SweepReport {
            before: snapshot.infos.len(),
            ..SweepReport::default()
        };

        for info in &snapshot.infos {
            let summary = &info.summary;
            report.total_connections += summary.connection_count.max(0);
            report.total_sessions += summary.session_count.max(0);
            report.total_active_sessions += summary.active_session_count.max(0);

            let Some(reason) = reap_reason(info, now, min_wait) else {
                continue;
            };

            match self.shutdown(info.id) {
                Ok(()) => {
                    info!(worker_id = %info.id, port = %info.port, ?reason, "Reaping worker");
                    report.reaped.push(Reaped {
                        id: info.id,
                        reason,
                    });
                }
                Err(e) => {
                    error!(
                        worker_id = %info.id,
                        port = %info.port,
                        error = %e,
                        "Failed to shut down worker, it may remain as a zombie"
                    );
                }
            }
        }

        report.after = report.before - report.reaped.len();
        info!(
            before = report.before,
            after = report.after,
            total_connections = report.total_connections,
            total_sessions = report.total_sessions,
            total_active_sessions = report.total_active_sessions,
            "Sweep finished"
        );

        report
    }

    /// Spawn the periodic sweep. It runs until `shutdown` flips to true; a
    /// panicking tick relaunches the loop.
    pub fn spawn_sweeper(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let brain = self.clone();
        tokio::spawn(
            async move {
                let backoff = BackoffPolicy::default();
                run_isolated("sweep", &backoff, || sweep_loop(brain.clone(), shutdown.clone()))
                    .await;
                info!("Sweeper stopped");
            }
            .instrument(info_span!("sweeper")),
        )
    }

    /// Ask every tracked worker to stop.
    pub fn shutdown_all(&self) -> usize {
        let workers = self.inner.registry.workers();
        for worker in &workers {
            worker.end_process();
        }
        info!(count = workers.len(), "Closing all workers");
        workers.len()
    }

    /// Wait until every worker has been reclaimed, or `timeout` passes.
    /// Returns true if the registry drained.
    pub async fn wait_until_empty(&self, timeout: Duration) -> bool {
        let drained = tokio::time::timeout(timeout, async {
            while self.inner.registry.count() > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!(
                remaining = self.inner.registry.count(),
                "Workers still registered after shutdown timeout"
            );
        }
        drained
    }
}

impl BrainInner {
    fn reclaim(&self, id: WorkerId, port: Port) {
        if !self.registry.remove(&id) {
            error!(worker_id = %id, "Finished worker was not in the registry");
        }
        if let Err(e) = self.ports.release(port) {
            error!(worker_id = %id, port = %port, error = %e, "Failed to return port");
            return;
        }
        debug!(worker_id = %id, port = %port, "Worker removed and port returned");
    }
}

async fn sweep_loop(brain: Brain, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(brain.inner.params.sweep_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                brain.sweep_once();
            }
            _ = wait_closed(&mut shutdown) => return,
        }
    }
}

fn elapsed(now: DateTime<Utc>, since: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

/// Decide whether the sweep should stop a worker.
pub fn reap_reason(
    info: &WorkerInfo,
    now: DateTime<Utc>,
    min_wait: Duration,
) -> Option<ReapReason> {
    if info.fatal {
        return Some(ReapReason::Fatal);
    }

    let summary = &info.summary;
    if let Some(last) = summary.time_last_communicate {
        if elapsed(now, last) >= min_wait {
            return Some(ReapReason::Silent);
        }
    }

    if elapsed(now, summary.time_started) >= min_wait {
        if summary.time_established.is_none() {
            return Some(ReapReason::NeverEstablished);
        }
        if summary.connection_count == 0 {
            return Some(ReapReason::Idle);
        }
    }

    None
}

/// Best-fit ranking: fullest eligible worker first, oldest first on ties.
pub fn rank_backfill(
    infos: &[WorkerInfo],
    class_index: usize,
    class: &ProcessClass,
    now: DateTime<Utc>,
) -> Vec<BackfillCandidate> {
    let max_age = class.max_backfill_age();

    let mut eligible: Vec<(i64, &WorkerInfo)> = infos
        .iter()
        .filter(|info| info.class_index == class_index)
        .filter(|info| !info.fatal && info.summary.status != MonitoringStatus::Closed)
        .map(|info| (class.capacity - info.summary.connection_count, info))
        .filter(|(spare, _)| *spare > 0)
        .filter(|(_, info)| elapsed(now, info.summary.time_started) < max_age)
        .collect();

    eligible.sort_by(|(spare_a, a), (spare_b, b)| {
        spare_a
            .cmp(spare_b)
            .then_with(|| a.summary.time_started.cmp(&b.summary.time_started))
    });

    eligible
        .into_iter()
        .map(|(_, info)| BackfillCandidate {
            id: info.id,
            port: info.port,
            since: info.summary.time_started,
            active_session_count: info.summary.active_session_count,
        })
        .collect()
}
