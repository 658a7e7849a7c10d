//! The contract between the pipeline and whatever ships records elsewhere.

use std::fmt::{Display, Error as FmtError, Formatter};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportError {
    Transport(String),
    Encode(String),
    Timeout,
    ShutDown,
    Other(String),
}

impl Display for ExportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            ExportError::Transport(reason) => write!(f, "transport failure: {reason}"),
            ExportError::Encode(reason) => write!(f, "failed to encode batch: {reason}"),
            ExportError::Timeout => write!(f, "export timed out"),
            ExportError::ShutDown => write!(f, "exporter is shut down"),
            ExportError::Other(reason) => write!(f, "{reason}"),
        }
    }
}

impl std::error::Error for ExportError {}

pub type ExportResult = Result<(), ExportError>;

/// Consumes batches of records.
///
/// Processors call an exporter from a single worker thread and never
/// concurrently with itself, hence `&mut self`. Retrying a failed batch, if
/// desired, is the exporter's job; the pipeline discards it.
pub trait Exporter<R>: Send + 'static {
    fn export(&mut self, batch: Vec<R>) -> ExportResult;

    fn force_flush(&mut self) -> ExportResult {
        Ok(())
    }

    /// Releases any resources. Should give up after roughly `timeout`.
    fn shutdown(&mut self, _timeout: Duration) -> ExportResult {
        Ok(())
    }
}

impl<R, E: Exporter<R> + ?Sized> Exporter<R> for Box<E> {
    fn export(&mut self, batch: Vec<R>) -> ExportResult {
        (**self).export(batch)
    }

    fn force_flush(&mut self) -> ExportResult {
        (**self).force_flush()
    }

    fn shutdown(&mut self, timeout: Duration) -> ExportResult {
        (**self).shutdown(timeout)
    }
}

#[derive(Debug)]
struct InMemoryState<R> {
    batches: Vec<Vec<R>>,
    fail_with: Option<ExportError>,
    shutdown_calls: usize,
}

/// Keeps every exported batch in memory. Clones share the same storage, so a
/// clone can be handed to a processor while the original is inspected.
#[derive(Debug)]
pub struct InMemoryExporter<R> {
    state: Arc<Mutex<InMemoryState<R>>>,
}

impl<R> Clone for InMemoryExporter<R> {
    fn clone(&self) -> InMemoryExporter<R> {
        InMemoryExporter {
            state: self.state.clone(),
        }
    }
}

impl<R> Default for InMemoryExporter<R> {
    fn default() -> InMemoryExporter<R> {
        InMemoryExporter::new()
    }
}

impl<R> InMemoryExporter<R> {
    pub fn new() -> InMemoryExporter<R> {
        InMemoryExporter {
            state: Arc::new(Mutex::new(InMemoryState {
                batches: Vec::new(),
                fail_with: None,
                shutdown_calls: 0,
            })),
        }
    }

    /// Makes subsequent exports fail (after recording the batch) with `error`,
    /// or succeed again with `None`.
    pub fn set_failure(&self, error: Option<ExportError>) {
        self.lock().fail_with = error;
    }

    pub fn batches(&self) -> Vec<Vec<R>>
    where
        R: Clone,
    {
        self.lock().batches.clone()
    }

    pub fn records(&self) -> Vec<R>
    where
        R: Clone,
    {
        self.lock().batches.iter().flatten().cloned().collect()
    }

    pub fn shutdown_calls(&self) -> usize {
        self.lock().shutdown_calls
    }

    pub fn reset(&self) {
        self.lock().batches.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InMemoryState<R>> {
        // a panicking test thread shouldn't hide what was exported
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<R: Send + 'static> Exporter<R> for InMemoryExporter<R> {
    fn export(&mut self, batch: Vec<R>) -> ExportResult {
        let mut state = self.lock();
        state.batches.push(batch);

        match &state.fail_with {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn shutdown(&mut self, _timeout: Duration) -> ExportResult {
        self.lock().shutdown_calls += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_batches() {
        let exporter = InMemoryExporter::<u32>::new();
        let mut handle = exporter.clone();

        handle.export(vec![1, 2]).unwrap();
        handle.export(vec![3]).unwrap();

        assert_eq!(exporter.batches(), vec![vec![1, 2], vec![3]]);
        assert_eq!(exporter.records(), vec![1, 2, 3]);
    }

    #[test]
    fn configured_failure_is_reported() {
        let exporter = InMemoryExporter::<u32>::new();
        let mut handle = exporter.clone();

        exporter.set_failure(Some(ExportError::Transport("down".to_owned())));
        assert_eq!(
            handle.export(vec![1]),
            Err(ExportError::Transport("down".to_owned()))
        );

        exporter.set_failure(None);
        assert_eq!(handle.export(vec![2]), Ok(()));
    }
}
