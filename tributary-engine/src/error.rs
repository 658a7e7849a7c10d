use std::fmt::{Display, Error as FmtError, Formatter};

use crate::config::ConfigError;
use crate::export::ExportError;

/// Errors from `force_flush` and `shutdown`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// The deadline passed before the worker finished. The work may still
    /// complete in the background.
    Timeout,
    /// The pipeline was already shut down.
    Shutdown,
    Export(ExportError),
    /// The worker thread exited without answering.
    WorkerGone,
}

impl Display for PipelineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            PipelineError::Timeout => write!(f, "timed out waiting for the worker"),
            PipelineError::Shutdown => write!(f, "pipeline is shut down"),
            PipelineError::Export(err) => write!(f, "export failed: {err}"),
            PipelineError::WorkerGone => write!(f, "worker thread exited unexpectedly"),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Export(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ExportError> for PipelineError {
    fn from(err: ExportError) -> PipelineError {
        PipelineError::Export(err)
    }
}

/// Errors from building a processor or reader.
#[derive(Debug)]
pub enum BuildError {
    Config(ConfigError),
    /// The worker thread or its runtime could not be started.
    Worker(std::io::Error),
}

impl Display for BuildError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            BuildError::Config(err) => write!(f, "invalid configuration: {err}"),
            BuildError::Worker(err) => write!(f, "failed to start worker: {err}"),
        }
    }
}

impl std::error::Error for BuildError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BuildError::Config(err) => Some(err),
            BuildError::Worker(err) => Some(err),
        }
    }
}

impl From<ConfigError> for BuildError {
    fn from(err: ConfigError) -> BuildError {
        BuildError::Config(err)
    }
}
