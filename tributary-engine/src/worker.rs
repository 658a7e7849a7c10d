//! The dedicated background thread shared by the batch processor and the
//! periodic reader, and the blocking request/reply plumbing used to talk to it.

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedSender;

use crate::error::{BuildError, PipelineError};

pub(crate) type Reply = SyncSender<Result<(), PipelineError>>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    /// `shutdown` was requested and the final flush is under way.
    Draining,
    Stopped,
}

#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> StateCell {
        StateCell(AtomicU8::new(WorkerState::Running as u8))
    }

    pub(crate) fn get(&self) -> WorkerState {
        match self.0.load(Ordering::Acquire) {
            0 => WorkerState::Running,
            1 => WorkerState::Draining,
            _ => WorkerState::Stopped,
        }
    }

    pub(crate) fn set(&self, state: WorkerState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Runs `task` to completion on a new named thread with its own
/// current-thread runtime (timers enabled).
pub(crate) fn spawn<F, Fut>(name: &str, task: F) -> Result<JoinHandle<()>, BuildError>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .map_err(BuildError::Worker)?;

    std::thread::Builder::new()
        .name(name.to_owned())
        .spawn(move || runtime.block_on(task()))
        .map_err(BuildError::Worker)
}

/// The caller's side of a worker: a control channel plus the bookkeeping
/// that makes `shutdown` happen exactly once.
#[derive(Debug)]
pub(crate) struct WorkerHandle<C> {
    control: UnboundedSender<C>,
    state: Arc<StateCell>,
    thread: Mutex<Option<JoinHandle<()>>>,
    shutdown_result: Mutex<Option<Result<(), PipelineError>>>,
}

impl<C> WorkerHandle<C> {
    pub(crate) fn new(
        control: UnboundedSender<C>,
        state: Arc<StateCell>,
        thread: JoinHandle<()>,
    ) -> WorkerHandle<C> {
        WorkerHandle {
            control,
            state,
            thread: Mutex::new(Some(thread)),
            shutdown_result: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> WorkerState {
        self.state.get()
    }

    pub(crate) fn flush(
        &self,
        timeout: Duration,
        make: impl FnOnce(Instant, Reply) -> C,
    ) -> Result<(), PipelineError> {
        if self.state.get() != WorkerState::Running {
            return Err(PipelineError::Shutdown);
        }

        self.request(timeout, make)
    }

    /// Sends the shutdown command built by `make` and waits for the worker to
    /// answer. Only the first call talks to the worker; later calls wait for
    /// it to finish and get the same result.
    pub(crate) fn shutdown(
        &self,
        timeout: Duration,
        make: impl FnOnce(Instant, Reply) -> C,
    ) -> Result<(), PipelineError> {
        let mut stored = lock(&self.shutdown_result);
        if let Some(result) = &*stored {
            return result.clone();
        }

        self.state.set(WorkerState::Draining);

        let result = self.request(timeout, make);

        // on timeout the worker may still be exporting; leave it detached
        if result != Err(PipelineError::Timeout) {
            if let Some(thread) = lock(&self.thread).take() {
                if thread.join().is_err() {
                    tracing::error!("worker thread panicked during shutdown");
                }
            }
            self.state.set(WorkerState::Stopped);
        }

        *stored = Some(result.clone());
        result
    }

    fn request(
        &self,
        timeout: Duration,
        make: impl FnOnce(Instant, Reply) -> C,
    ) -> Result<(), PipelineError> {
        let deadline = Instant::now() + timeout;
        let (reply, receiver) = std_mpsc::sync_channel(1);

        if self.control.send(make(deadline, reply)).is_err() {
            return Err(self.gone());
        }

        match receiver.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(PipelineError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(self.gone()),
        }
    }

    // a request queued behind a completed shutdown is dropped unanswered;
    // the worker marks itself stopped before it exits
    fn gone(&self) -> PipelineError {
        match self.state.get() {
            WorkerState::Stopped => PipelineError::Shutdown,
            WorkerState::Running | WorkerState::Draining => PipelineError::WorkerGone,
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Time left until `deadline`, zero if it already passed.
pub(crate) fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_cell_round_trips() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), WorkerState::Running);

        cell.set(WorkerState::Draining);
        assert_eq!(cell.get(), WorkerState::Draining);

        cell.set(WorkerState::Stopped);
        assert_eq!(cell.get(), WorkerState::Stopped);
    }

    #[test]
    fn request_to_dead_worker_is_reported() {
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel::<Reply>();
        drop(receiver);

        let thread = std::thread::spawn(|| {});
        let handle = WorkerHandle::new(sender, Arc::new(StateCell::new()), thread);

        let result = handle.flush(Duration::from_secs(1), |_, reply| reply);
        assert_eq!(result, Err(PipelineError::WorkerGone));
    }

    #[test]
    fn request_dropped_by_stopping_worker_reports_shutdown() {
        let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel::<Reply>();
        let state = Arc::new(StateCell::new());

        // takes one request, stops, and exits without answering it
        let worker_state = state.clone();
        let thread = std::thread::spawn(move || {
            let request = receiver.blocking_recv();
            worker_state.set(WorkerState::Stopped);
            drop(request);
        });

        let handle = WorkerHandle::new(sender, state, thread);

        let result = handle.flush(Duration::from_secs(5), |_, reply| reply);
        assert_eq!(result, Err(PipelineError::Shutdown));
    }
}
