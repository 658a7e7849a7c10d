//! Pull-based metric export: a worker collects from a source on an interval
//! and exports whatever it gets.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, UnboundedReceiver};

use crate::config::ReaderConfig;
use crate::error::{BuildError, PipelineError};
use crate::export::{ExportError, ExportResult, Exporter};
use crate::models::Metric;
use crate::worker::{self, remaining, Reply, StateCell, WorkerHandle, WorkerState};

const DEFAULT_THREAD_NAME: &str = "tributary-reader";

/// Something that can be asked for the current metric points.
pub trait Collect: Send + Sync + 'static {
    fn collect(&self) -> Vec<Metric>;
}

impl<F> Collect for F
where
    F: Fn() -> Vec<Metric> + Send + Sync + 'static,
{
    fn collect(&self) -> Vec<Metric> {
        self()
    }
}

enum Control {
    Flush { deadline: Instant, reply: Reply },
    Shutdown { deadline: Instant, reply: Reply },
}

/// Collects from its source every `export_interval` and exports the result.
///
/// The source is only ever called from the worker thread.
pub struct PeriodicReader {
    worker: WorkerHandle<Control>,
    config: ReaderConfig,
}

impl PeriodicReader {
    pub fn builder<C, E>(source: C, exporter: E) -> PeriodicReaderBuilder
    where
        C: Collect,
        E: Exporter<Metric>,
    {
        PeriodicReaderBuilder {
            source: Box::new(source),
            exporter: Box::new(exporter),
            config: ReaderConfig::default(),
            thread_name: DEFAULT_THREAD_NAME.to_owned(),
        }
    }

    /// Runs one collection and export outside the regular schedule.
    pub fn force_flush(&self, timeout: Duration) -> Result<(), PipelineError> {
        self.worker
            .flush(timeout, |deadline, reply| Control::Flush { deadline, reply })
    }

    /// Runs a final collection and export, then shuts the exporter down and
    /// stops the worker. Every call returns the result of the first one.
    pub fn shutdown(&self, timeout: Duration) -> Result<(), PipelineError> {
        self.worker
            .shutdown(timeout, |deadline, reply| Control::Shutdown { deadline, reply })
    }

    pub fn state(&self) -> WorkerState {
        self.worker.state()
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }
}

pub struct PeriodicReaderBuilder {
    source: Box<dyn Collect>,
    exporter: Box<dyn Exporter<Metric>>,
    config: ReaderConfig,
    thread_name: String,
}

impl PeriodicReaderBuilder {
    pub fn with_config(mut self, config: ReaderConfig) -> PeriodicReaderBuilder {
        self.config = config;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> PeriodicReaderBuilder {
        self.thread_name = name.into();
        self
    }

    pub fn build(self) -> Result<PeriodicReader, BuildError> {
        self.config.validate()?;

        let state = Arc::new(StateCell::new());
        let (control_sender, control_receiver) = mpsc::unbounded_channel();

        let worker = Worker {
            source: self.source,
            exporter: self.exporter,
            state: state.clone(),
            control: control_receiver,
            interval: self.config.export_interval,
            timeout: self.config.export_timeout,
        };

        let thread = worker::spawn(&self.thread_name, move || worker.run())?;

        Ok(PeriodicReader {
            worker: WorkerHandle::new(control_sender, state, thread),
            config: self.config,
        })
    }
}

struct Worker {
    source: Box<dyn Collect>,
    exporter: Box<dyn Exporter<Metric>>,
    state: Arc<StateCell>,
    control: UnboundedReceiver<Control>,
    interval: Duration,
    timeout: Duration,
}

impl Worker {
    async fn run(mut self) {
        let interval = self.interval;
        let mut next_collection = Instant::now() + interval;

        loop {
            let timer = async move {
                if interval.is_zero() {
                    std::future::pending::<()>().await
                } else {
                    tokio::time::sleep_until(next_collection.into()).await
                }
            };

            let cmd = tokio::select! {
                biased;
                cmd = self.control.recv() => Some(cmd),
                _ = timer => None,
            };

            match cmd {
                Some(Some(Control::Flush { deadline, reply })) => {
                    let _ = reply.send(self.flush(deadline));
                }
                Some(Some(Control::Shutdown { deadline, reply })) => {
                    let _ = reply.send(self.shutdown(deadline));
                    return;
                }
                Some(None) => {
                    self.state.set(WorkerState::Stopped);
                    tracing::debug!(parent: None, "periodic reader dropped without shutdown");
                    return;
                }
                None => {
                    let _ = self.collect_and_export(Instant::now() + self.timeout);
                    next_collection = Instant::now() + interval;
                }
            }
        }
    }

    fn collect_and_export(&mut self, deadline: Instant) -> Result<(), PipelineError> {
        let source = &self.source;
        let metrics = match std::panic::catch_unwind(AssertUnwindSafe(|| source.collect())) {
            Ok(metrics) => metrics,
            Err(_) => {
                tracing::error!(parent: None, "metric collection panicked");
                return Err(PipelineError::Export(ExportError::Other(
                    "metric collection panicked".to_owned(),
                )));
            }
        };

        if metrics.is_empty() {
            return Ok(());
        }

        if Instant::now() >= deadline {
            tracing::warn!(
                parent: None,
                "collection overran its deadline, dropping {} points",
                metrics.len()
            );
            return Err(PipelineError::Timeout);
        }

        let count = metrics.len();
        self.call("export", |exporter| exporter.export(metrics))
            .map_err(|err| {
                tracing::error!(parent: None, "failed to export {count} metric points: {err}");
                PipelineError::Export(err)
            })
    }

    fn flush(&mut self, deadline: Instant) -> Result<(), PipelineError> {
        let mut result = self.collect_and_export(deadline);

        if let Err(err) = self.call("flush", |exporter| exporter.force_flush()) {
            result = result.and(Err(PipelineError::Export(err)));
        }

        result
    }

    fn shutdown(&mut self, deadline: Instant) -> Result<(), PipelineError> {
        let mut result = self.collect_and_export(deadline);

        let timeout = remaining(deadline);
        if let Err(err) = self.call("shutdown", |exporter| exporter.shutdown(timeout)) {
            result = result.and(Err(PipelineError::Export(err)));
        }

        self.state.set(WorkerState::Stopped);
        tracing::debug!(parent: None, "periodic reader stopped");

        result
    }

    fn call(
        &mut self,
        op: &str,
        f: impl FnOnce(&mut Box<dyn Exporter<Metric>>) -> ExportResult,
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
