//! The "engine" crate holds the core of the telemetry pipeline: context and
//! its propagation across process boundaries, the records that flow through
//! the pipeline, the exporter contract, and the two background drivers that
//! push records to exporters (the batch processor and the periodic reader).
//! It does not hook into any instrumentation library on its own.

pub mod config;
pub mod context;
pub mod export;
pub mod ids;
pub mod metrics;
pub mod models;
pub mod processor;
pub mod propagation;
pub mod reader;

mod error;
mod worker;

pub use config::{BatchConfig, ConfigError, ReaderConfig};
pub use context::{Context, ContextGuard, ContextKey, FutureExt};
pub use error::{BuildError, PipelineError};
pub use export::{ExportError, ExportResult, Exporter, InMemoryExporter};
pub use metrics::{Meter, ReaderHandle, View};
pub use models::{
    Attributes, Metric, Number, Point, SpanContext, SpanData, SpanId, Status, Temporality,
    TraceFlags, TraceId, TraceState, Value,
};
pub use processor::{BatchProcessor, BatchProcessorBuilder};
pub use propagation::{CompositePropagator, Extractor, Injector, TextMapPropagator};
pub use reader::{Collect, PeriodicReader, PeriodicReaderBuilder};
pub use worker::WorkerState;
