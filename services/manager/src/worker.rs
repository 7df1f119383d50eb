//! One launched worker: its supervised process, its heartbeat connection,
//! and the monitoring summary built from that heartbeat.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lift_id::WorkerId;
use lift_networking::Port;
use lift_proto::{ErrorCode, HeartbeatMessage};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::heartbeat::{HeartbeatConnection, HeartbeatError};
use crate::process::{ProcessError, ProcessSpec, ProcessState, ProcessSupervisor};
use crate::task::{run_isolated, wait_closed, BackoffPolicy};

/// Count value meaning "unknown", used after a worker reports a fatal error.
pub const UNKNOWN_COUNT: i64 = -1;

/// Health of a worker as seen through its heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitoringStatus {
    NotConnected,
    Ok,
    ConnectionError,
    ProtocolError,
    Fatal,
    Closed,
}

/// Point-in-time view of a worker's heartbeat state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitoringSummary {
    pub status: MonitoringStatus,
    pub time_started: DateTime<Utc>,
    /// Set when a heartbeat connection attaches.
    pub time_established: Option<DateTime<Utc>>,
    /// Set by every accepted heartbeat.
    pub time_last_communicate: Option<DateTime<Utc>>,
    pub connection_count: i64,
    pub session_count: i64,
    pub active_session_count: i64,
}

impl MonitoringSummary {
    pub fn new(time_started: DateTime<Utc>) -> Self {
        Self {
            status: MonitoringStatus::NotConnected,
            time_started,
            time_established: None,
            time_last_communicate: None,
            connection_count: 0,
            session_count: 0,
            active_session_count: 0,
        }
    }

    fn set_status(&mut self, status: MonitoringStatus) {
        if self.status != MonitoringStatus::Closed {
            self.status = status;
        }
    }
}

/// Snapshot of a worker for the sweep, backfill and the control API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub class_index: usize,
    pub port: Port,
    pub process_state: ProcessState,
    pub fatal: bool,
    #[serde(flatten)]
    pub summary: MonitoringSummary,
}

/// Everything needed to build a [`WorkerProcess`].
#[derive(Debug, Clone)]
pub struct WorkerParams {
    pub id: WorkerId,
    pub class_index: usize,
    pub port: Port,
    pub program: String,
    pub args: Vec<String>,
    pub listen_address: String,
    pub heartbeat_timeout: Duration,
}

enum Flow {
    Continue,
    Stop,
}

/// A launched worker. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct WorkerProcess {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    id: WorkerId,
    class_index: usize,
    port: Port,
    heartbeat_timeout: Duration,
    supervisor: ProcessSupervisor,
    summary: RwLock<MonitoringSummary>,
    fatal: AtomicBool,
    attached: AtomicBool,
    listen_close: watch::Sender<bool>,
    listener: Mutex<Option<JoinHandle<()>>>,
    backoff: BackoffPolicy,
}

impl WorkerProcess {
    pub fn new(params: WorkerParams) -> Self {
        let supervisor = ProcessSupervisor::new(ProcessSpec {
            program: params.program,
            args: params.args,
            listen_address: params.listen_address,
            port: params.port,
            worker_id: params.id,
        });
        let (listen_close, _) = watch::channel(false);

        Self {
            inner: Arc::new(WorkerInner {
                id: params.id,
                class_index: params.class_index,
                port: params.port,
                heartbeat_timeout: params.heartbeat_timeout,
                supervisor,
                summary: RwLock::new(MonitoringSummary::new(Utc::now())),
                fatal: AtomicBool::new(false),
                attached: AtomicBool::new(false),
                listen_close,
                listener: Mutex::new(None),
                backoff: BackoffPolicy::default(),
            }),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.inner.id
    }

    pub fn class_index(&self) -> usize {
        self.inner.class_index
    }

    pub fn port(&self) -> Port {
        self.inner.port
    }

    /// Start the process. `on_closed` runs once, after the process has ended
    /// and the heartbeat listener (if any) has stopped.
    pub fn start_process<F>(&self, on_closed: F) -> Result<(), ProcessError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.summary.write().time_started = Utc::now();

        let inner = Arc::clone(&self.inner);
        self.inner.supervisor.start(move |exit| async move {
            inner.finish(exit.state).await;
            on_closed();
        })
    }

    /// Attach a heartbeat connection and start consuming it.
    ///
    /// Returns false, dropping `conn`, if a connection is already attached or
    /// the worker has closed.
    pub fn start_listen<C>(&self, conn: C) -> bool
    where
        C: HeartbeatConnection,
    {
        if *self.inner.listen_close.borrow() {
            return false;
        }
        if self
            .inner
            .attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        {
            let mut summary = self.inner.summary.write();
            summary.time_established = Some(Utc::now());
            if !self.is_fatal() {
                summary.set_status(MonitoringStatus::Ok);
            }
        }
        info!(worker_id = %self.inner.id, "Heartbeat connection established");

        let inner = Arc::clone(&self.inner);
        let conn = Arc::new(tokio::sync::Mutex::new(conn));
        let close_rx = self.inner.listen_close.subscribe();
        let handle = tokio::spawn(
            async move {
                let backoff = inner.backoff.clone();
                run_isolated("heartbeat", &backoff, || {
                    listen(Arc::clone(&inner), Arc::clone(&conn), close_rx.clone())
                })
                .await;
            }
            .instrument(info_span!("heartbeat", worker_id = %self.inner.id)),
        );
        *self.inner.listener.lock() = Some(handle);

        true
    }

    /// Ask the process to stop. Completion is reported through the
    /// `on_closed` callback given to [`start_process`](Self::start_process).
    pub fn end_process(&self) {
        self.inner.supervisor.close();
    }

    /// True if a connection can still be attached.
    pub fn can_attach(&self) -> bool {
        !self.inner.attached.load(Ordering::Acquire) && !*self.inner.listen_close.borrow()
    }

    pub fn is_established(&self) -> bool {
        self.inner.summary.read().time_established.is_some()
    }

    pub fn is_fatal(&self) -> bool {
        self.inner.fatal.load(Ordering::Acquire)
    }

    pub fn summary(&self) -> MonitoringSummary {
        self.inner.summary.read().clone()
    }

    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            id: self.inner.id,
            class_index: self.inner.class_index,
            port: self.inner.port,
            process_state: self.inner.supervisor.state(),
            fatal: self.is_fatal(),
            summary: self.summary(),
        }
    }
}

impl WorkerInner {
    async fn finish(&self, state: ProcessState) {
        self.listen_close.send_replace(true);
        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            if let Err(e) = listener.await {
                debug!(worker_id = %self.id, error = %e, "Heartbeat listener ended abnormally");
            }
        }
        self.summary.write().set_status(MonitoringStatus::Closed);
        debug!(worker_id = %self.id, ?state, "Worker finished");
    }

    fn mark_fatal(&self) {
        self.fatal.store(true, Ordering::Release);
    }

    fn apply(&self, read: Result<HeartbeatMessage, HeartbeatError>) -> Flow {
        let message = match read {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Heartbeat connection lost");
                self.summary
                    .write()
                    .set_status(MonitoringStatus::ConnectionError);
                return Flow::Stop;
            }
        };

        if !message.is_from(&self.id) {
            let e = HeartbeatError::ProtocolViolation {
                expected: self.id.to_string(),
                received: describe_raw_id(&message.worker_id),
            };
            error!(error = %e, "Heartbeat rejected");
            self.mark_fatal();
            self.summary
                .write()
                .set_status(MonitoringStatus::ProtocolError);
            return Flow::Stop;
        }

        match message.error_code {
            ErrorCode::Fatal => {
                let e = HeartbeatError::Fatal(message.error_text().to_string());
                error!(error = %e, "Worker reported fatal error");
                self.mark_fatal();
                let mut summary = self.summary.write();
                summary.set_status(MonitoringStatus::Fatal);
                summary.connection_count = UNKNOWN_COUNT;
                summary.session_count = UNKNOWN_COUNT;
                summary.active_session_count = UNKNOWN_COUNT;
                return Flow::Continue;
            }
            ErrorCode::Warn => {
                warn!(text = message.error_text(), "Worker reported warning");
            }
            ErrorCode::None => {}
        }

        let fatal = self.fatal.load(Ordering::Acquire);
        let mut summary = self.summary.write();
        summary.connection_count = message.connection_count;
        summary.session_count = message.session_count;
        summary.active_session_count = message.active_session_count;
        summary.time_last_communicate = Some(Utc::now());
        if !fatal {
            summary.set_status(MonitoringStatus::Ok);
        }

        Flow::Continue
    }
}

async fn listen<C>(
    inner: Arc<WorkerInner>,
    conn: Arc<tokio::sync::Mutex<C>>,
    mut close_rx: watch::Receiver<bool>,
) where
    C: HeartbeatConnection,
{
    let mut conn = conn.lock().await;
    let deadline = inner.heartbeat_timeout;

    loop {
        let read = tokio::select! {
            _ = wait_closed(&mut close_rx) => break,
            read = tokio::time::timeout(deadline, conn.recv()) => {
                read.unwrap_or(Err(HeartbeatError::Timeout(deadline)))
            }
        };

        if let Flow::Stop = inner.apply(read) {
            wait_closed(&mut close_rx).await;
            break;
        }
    }

    conn.close().await;
}

fn describe_raw_id(raw: &[u8]) -> String {
    WorkerId::from_slice(raw)
        .map(|id| id.to_string())
        .unwrap_or_else(|_| format!("<{} raw bytes>", raw.len()))
}
