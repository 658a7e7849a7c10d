//! Buffers records from any number of producers and hands them to an
//! exporter in batches on a dedicated worker thread.

mod queue;

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::Notify;

use crate::config::BatchConfig;
use crate::error::{BuildError, PipelineError};
use crate::export::{ExportError, ExportResult, Exporter};
use crate::worker::{self, lock, remaining, Reply, StateCell, WorkerHandle, WorkerState};

use queue::BoundedQueue;

const DEFAULT_THREAD_NAME: &str = "tributary-batch";

struct Shared<R> {
    queue: Mutex<BoundedQueue<R>>,
    notify: Notify,
    dropped: AtomicU64,
    max_export_batch_size: usize,
}

enum Control {
    Flush {
        target: u64,
        deadline: Instant,
        reply: Reply,
    },
    Shutdown {
        deadline: Instant,
        reply: Reply,
    },
}

/// Accepts records without blocking and exports them in batches.
///
/// `enqueue` never blocks and never fails: when the queue is full the new
/// record is dropped and counted. The exporter is only ever called from the
/// worker thread, one batch at a time.
///
/// Dropping the processor without calling `shutdown` stops the worker, but
/// anything still queued is discarded and the exporter is never shut down.
pub struct BatchProcessor<R> {
    shared: Arc<Shared<R>>,
    worker: WorkerHandle<Control>,
    config: BatchConfig,
}

impl<R: Send + 'static> BatchProcessor<R> {
    pub fn builder<E: Exporter<R>>(exporter: E) -> BatchProcessorBuilder<R> {
        BatchProcessorBuilder {
            exporter: Box::new(exporter),
            config: BatchConfig::default(),
            thread_name: DEFAULT_THREAD_NAME.to_owned(),
        }
    }

    pub fn enqueue(&self, record: R) {
        let pushed = lock(&self.shared.queue).push(record);

        match pushed {
            Ok(len) if len >= self.shared.max_export_batch_size => {
                self.shared.notify.notify_one();
            }
            Ok(_) => {}
            Err(_dropped) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// The number of records that were not accepted, either because the
    /// queue was full or because the processor was shut down.
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Exports every record queued before this call, waiting up to `timeout`.
    pub fn force_flush(&self, timeout: Duration) -> Result<(), PipelineError> {
        let target = lock(&self.shared.queue).pushed();

        self.worker.flush(timeout, |deadline, reply| Control::Flush {
            target,
            deadline,
            reply,
        })
    }

    /// Exports what remains, shuts the exporter down and stops the worker.
    ///
    /// Only the first call does any work. Every call returns the result of
    /// the first one.
    pub fn shutdown(&self, timeout: Duration) -> Result<(), PipelineError> {
        self.worker
            .shutdown(timeout, |deadline, reply| Control::Shutdown { deadline, reply })
    }

    pub fn state(&self) -> WorkerState {
        self.worker.state()
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }
}

pub struct BatchProcessorBuilder<R> {
    exporter: Box<dyn Exporter<R>>,
    config: BatchConfig,
    thread_name: String,
}

impl<R: Send + 'static> BatchProcessorBuilder<R> {
    pub fn with_config(mut self, config: BatchConfig) -> BatchProcessorBuilder<R> {
        self.config = config;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> BatchProcessorBuilder<R> {
        self.thread_name = name.into();
        self
    }

    pub fn build(self) -> Result<BatchProcessor<R>, BuildError> {
        self.config.validate()?;

        let shared = Arc::new(Shared {
            queue: Mutex::new(BoundedQueue::new(self.config.max_queue_size)),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            max_export_batch_size: self.config.max_export_batch_size,
        });
        let state = Arc::new(StateCell::new());
        let (control_sender, control_receiver) = mpsc::unbounded_channel();

        let worker = Worker {
            shared: shared.clone(),
            state: state.clone(),
            exporter: self.exporter,
            control: control_receiver,
            scheduled_delay: self.config.scheduled_delay,
        };

        let thread = worker::spawn(&self.thread_name, move || worker.run())?;

        Ok(BatchProcessor {
            shared,
            worker: WorkerHandle::new(control_sender, state, thread),
            config: self.config,
        })
    }
}

enum Wake {
    Control(Option<Control>),
    BatchReady,
    Timer,
}

struct Worker<R> {
    shared: Arc<Shared<R>>,
    state: Arc<StateCell>,
    exporter: Box<dyn Exporter<R>>,
    control: UnboundedReceiver<Control>,
    scheduled_delay: Duration,
}

impl<R: Send + 'static> Worker<R> {
    async fn run(mut self) {
        let delay = self.scheduled_delay;
        let mut next_timed_export = Instant::now() + delay;

        loop {
            let timer = async move {
                if delay.is_zero() {
                    std::future::pending::<()>().await
                } else {
                    tokio::time::sleep_until(next_timed_export.into()).await
                }
            };

            let wake = tokio::select! {
                biased;
                cmd = self.control.recv() => Wake::Control(cmd),
                _ = self.shared.notify.notified() => Wake::BatchReady,
                _ = timer => Wake::Timer,
            };

            match wake {
                Wake::Control(Some(Control::Flush {
                    target,
                    deadline,
                    reply,
                })) => {
                    let _ = reply.send(self.flush(target, deadline));
                }
                Wake::Control(Some(Control::Shutdown { deadline, reply })) => {
                    let _ = reply.send(self.shutdown(deadline));
                    return;
                }
                Wake::Control(None) => {
                    self.abandon();
                    return;
                }
                Wake::BatchReady => {
                    self.export_full_batches();
                }
                Wake::Timer => {
                    let batch = self.pop(u64::MAX);
                    if !batch.is_empty() {
                        let _ = self.export(batch);
                    }
                    self.export_full_batches();
                }
            }

            next_timed_export = Instant::now() + delay;
        }
    }

    fn pop(&self, target: u64) -> Vec<R> {
        lock(&self.shared.queue).pop_batch_until(self.shared.max_export_batch_size, target)
    }

    fn export_full_batches(&mut self) {
        let max = self.shared.max_export_batch_size;

        loop {
            let batch = {
                let mut queue = lock(&self.shared.queue);
                if queue.len() < max {
                    break;
                }
                queue.pop_batch(max)
            };

            let _ = self.export(batch);
        }
    }

    fn flush(&mut self, target: u64, deadline: Instant) -> Result<(), PipelineError> {
        let mut result = Ok(());

        loop {
            if Instant::now() >= deadline {
                return Err(PipelineError::Timeout);
            }

            let batch = self.pop(target);
            if batch.is_empty() {
                break;
            }

            if let Err(err) = self.export(batch) {
                result = result.and(Err(PipelineError::Export(err)));
            }
        }

        if let Err(err) = self.call("flush", |exporter| exporter.force_flush()) {
            result = result.and(Err(PipelineError::Export(err)));
        }

        result
    }

    fn shutdown(&mut self, deadline: Instant) -> Result<(), PipelineError> {
        let max = self.shared.max_export_batch_size;
        let mut result = Ok(());

        loop {
            let batch = {
                let mut queue = lock(&self.shared.queue);
                if Instant::now() >= deadline {
                    let discarded = queue.close();
                    if !discarded.is_empty() {
                        self.shared
                            .dropped
                            .fetch_add(discarded.len() as u64, Ordering::Relaxed);
                        tracing::warn!(
                            parent: None,
                            "shutdown deadline passed, discarding {} records",
                            discarded.len()
                        );
                    }
                    result = result.and(Err(PipelineError::Timeout));
                    break;
                }

                let batch = queue.pop_batch(max);
                if batch.is_empty() {
                    queue.close();
                    break;
                }
                batch
            };

            if let Err(err) = self.export(batch) {
                result = result.and(Err(PipelineError::Export(err)));
            }
        }

        let timeout = remaining(deadline);
        if let Err(err) = self.call("shutdown", |exporter| exporter.shutdown(timeout)) {
            result = result.and(Err(PipelineError::Export(err)));
        }

        self.state.set(WorkerState::Stopped);
        tracing::debug!(parent: None, "batch processor stopped");

        result
    }

    // the processor was dropped without being shut down
    fn abandon(&mut self) {
        let discarded = lock(&self.shared.queue).close();
        self.state.set(WorkerState::Stopped);

        if !discarded.is_empty() {
            tracing::warn!(
                parent: None,
                "batch processor dropped without shutdown, discarding {} records",
                discarded.len()
            );
        }
    }

    fn export(&mut self, batch: Vec<R>) -> ExportResult {
        let count = batch.len();
        let result = self.call("export", |exporter| exporter.export(batch));

        match &result {
            Ok(()) => tracing::trace!(parent: None, "exported {count} records"),
            Err(err) => tracing::error!(parent: None, "failed to export {count} records: {err}"),
        }

        result
    }

    fn call(
        &mut self,
        op: &str,
        f: impl FnOnce(&mut Box<dyn Exporter<R>>) -> ExportResult,
    ) -> ExportResult {
        let exporter = &mut self.exporter;

        match std::panic::catch_unwind(AssertUnwindSafe(|| f(exporter))) {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(parent: None, "exporter panicked during {op}");
                Err(ExportError::Other(format!("exporter panicked during {op}")))
            }
        }
    }
}
