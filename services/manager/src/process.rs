//! Supervision of one external worker process.
//!
//! A [`ProcessSupervisor`] spawns the worker binary, drains its stdout and
//! stderr into the log, and watches for exit. Whatever ends the process
//! (its own exit or [`ProcessSupervisor::close`]), the completion callback
//! runs exactly once, after the exit has been observed and both drains have
//! stopped.

use std::future::Future;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use lift_id::WorkerId;
use lift_networking::Port;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, Instrument};

use crate::task::{run_isolated, wait_closed, BackoffPolicy};

/// Errors starting a worker process.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("process already started")]
    AlreadyStarted,

    #[error("process was closed before it started")]
    Canceled,

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// What to run for one worker.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    /// Leading arguments placed before the worker flags.
    pub args: Vec<String>,
    pub listen_address: String,
    pub port: Port,
    pub worker_id: WorkerId,
}

impl ProcessSpec {
    /// Full argument list: class args, then `-a <addr> -p <port> -u <id>`.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        args.extend([
            "-a".to_string(),
            self.listen_address.clone(),
            "-p".to_string(),
            self.port.to_string(),
            "-u".to_string(),
            self.worker_id.to_string(),
        ]);
        args
    }
}

/// Lifecycle of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    NotStarted,
    Running,
    ClosedClean,
    ClosedError,
    Canceled,
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub state: ProcessState,
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn name(self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }

    fn log(self, worker_id: &WorkerId, line: &str) {
        match self {
            Stream::Stdout => info!(worker_id = %worker_id, stream = "stdout", "{line}"),
            Stream::Stderr => error!(worker_id = %worker_id, stream = "stderr", "{line}"),
        }
    }
}

type SharedLines<R> = Arc<tokio::sync::Mutex<Lines<BufReader<R>>>>;

/// Supervisor for one worker process.
pub struct ProcessSupervisor {
    spec: ProcessSpec,
    state: Arc<Mutex<ProcessState>>,
    close_tx: Arc<watch::Sender<bool>>,
    backoff: BackoffPolicy,
}

impl ProcessSupervisor {
    pub fn new(spec: ProcessSpec) -> Self {
        let (close_tx, _) = watch::channel(false);
        Self {
            spec,
            state: Arc::new(Mutex::new(ProcessState::NotStarted)),
            close_tx: Arc::new(close_tx),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn state(&self) -> ProcessState {
        *self.state.lock()
    }

    /// Spawn the process and its drain and exit-watch tasks.
    ///
    /// `on_closed` runs once the process has exited and both output drains
    /// have finished.
    pub fn start<F, Fut>(&self, on_closed: F) -> Result<(), ProcessError>
    where
        F: FnOnce(ProcessExit) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.state.lock();
        match *state {
            ProcessState::NotStarted => {}
            ProcessState::Canceled => return Err(ProcessError::Canceled),
            _ => return Err(ProcessError::AlreadyStarted),
        }

        let mut child = Command::new(&self.spec.program)
            .args(self.spec.to_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| {
                *state = ProcessState::ClosedError;
                ProcessError::Spawn {
                    program: self.spec.program.clone(),
                    source,
                }
            })?;

        let worker_id = self.spec.worker_id;
        info!(
            worker_id = %worker_id,
            program = %self.spec.program,
            port = %self.spec.port,
            pid = child.id(),
            "Worker process started"
        );

        let mut drains = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            drains.push(self.spawn_drain(stdout, Stream::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            drains.push(self.spawn_drain(stderr, Stream::Stderr));
        }

        *state = ProcessState::Running;
        drop(state);

        let state = Arc::clone(&self.state);
        let close_tx = Arc::clone(&self.close_tx);
        tokio::spawn(
            async move {
                let exit = watch_exit(child, close_tx.subscribe()).await;
                close_tx.send_replace(true);
                for drain in drains {
                    if let Err(e) = drain.await {
                        debug!(error = %e, "Output drain ended abnormally");
                    }
                }
                *state.lock() = exit.state;
                on_closed(exit).await;
            }
            .instrument(info_span!("process_exit", worker_id = %worker_id)),
        );

        Ok(())
    }

    fn spawn_drain<R>(&self, reader: R, stream: Stream) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let lines: SharedLines<R> =
            Arc::new(tokio::sync::Mutex::new(BufReader::new(reader).lines()));
        let close_rx = self.close_tx.subscribe();
        let backoff = self.backoff.clone();
        let worker_id = self.spec.worker_id;

        tokio::spawn(
            async move {
                run_isolated(stream.name(), &backoff, || {
                    drain(Arc::clone(&lines), close_rx.clone(), worker_id, stream)
                })
                .await;
            }
            .instrument(info_span!("drain", worker_id = %worker_id, stream = stream.name())),
        )
    }

    /// Stop the process. Safe to call any number of times.
    pub fn close(&self) {
        let mut state = self.state.lock();
        match *state {
            ProcessState::NotStarted => *state = ProcessState::Canceled,
            ProcessState::Running => {
                self.close_tx.send_replace(true);
            }
            _ => {}
        }
    }
}

async fn drain<R>(
    lines: SharedLines<R>,
    mut close_rx: watch::Receiver<bool>,
    worker_id: WorkerId,
    stream: Stream,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut lines = lines.lock().await;
    loop {
        tokio::select! {
            biased;
            line = lines.next_line() => match line {
                Ok(Some(line)) => stream.log(&worker_id, &line),
                Ok(None) => return,
                Err(e) => {
                    debug!(error = %e, "Output stream read failed");
                    return;
                }
            },
            _ = wait_closed(&mut close_rx) => return,
        }
    }
}

async fn watch_exit(mut child: Child, mut close_rx: watch::Receiver<bool>) -> ProcessExit {
    let (status, closed) = tokio::select! {
        status = child.wait() => (status, false),
        _ = wait_closed(&mut close_rx) => {
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "Kill failed, process likely already exited");
            }
            (child.wait().await, true)
        }
    };

    match status {
        Ok(status) => classify(status, closed),
        Err(e) => {
            error!(error = %e, "Failed to wait on worker process");
            ProcessExit {
                state: ProcessState::ClosedError,
                code: None,
                signal: None,
            }
        }
    }
}

fn classify(status: ExitStatus, closed: bool) -> ProcessExit {
    let code = status.code();
    let signal = exit_signal(&status);

    let state = if closed {
        info!(?code, ?signal, "Worker process closed");
        ProcessState::Canceled
    } else if status.success() {
        info!("Worker process exited");
        ProcessState::ClosedClean
    } else if is_kill(signal) {
        info!(?signal, "Worker process killed");
        ProcessState::Canceled
    } else {
        error!(?code, ?signal, "Worker process exited with error");
        ProcessState::ClosedError
    };

    ProcessExit {
        state,
        code,
        signal,
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[cfg(unix)]
fn is_kill(signal: Option<i32>) -> bool {
    signal == Some(libc::SIGKILL)
}

#[cfg(not(unix))]
fn is_kill(_signal: Option<i32>) -> bool {
    false
}
