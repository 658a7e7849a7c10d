//! A `tracing` layer that turns spans into span records and ships them
//! through a tributary batch processor.
//!
//! ```no_run
//! use tracing_subscriber::layer::SubscriberExt;
//! use tracing_subscriber::util::SubscriberInitExt;
//!
//! let layer = tributary::Tributary::builder()
//!     .with_attribute("service.name", "api")
//!     .build()
//!     .unwrap();
//! let handle = layer.handle();
//!
//! tracing_subscriber::registry().with(layer).init();
//!
//! // ... run the application ...
//!
//! handle.shutdown().unwrap();
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use tracing::span::{Attributes as SpanAttributes, Id, Record};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context as LayerContext, Layer};
use tracing_subscriber::registry::{LookupSpan, Registry};
use tributary_engine::export::Exporter;
use tributary_engine::ids::{generate_span_id, generate_trace_id};
use tributary_engine::{
    Attributes, BatchConfig, BatchProcessor, BuildError, Context, PipelineError, SpanContext,
    SpanData, SpanId, Status, TraceFlags, TraceId, TraceState,
};

mod exporter;
mod fields;
mod messaging;

pub use exporter::TcpExporter;

use fields::{AttributeVisitor, MessageVisitor};

// events and spans from the pipeline itself are never recorded
const ENGINE_TARGET: &str = "tributary_engine";
const EXPORTER_TARGET: &str = "tributary::exporter";

pub struct TributaryBuilder {
    host: Option<String>,
    fields: BTreeMap<String, String>,
    config: Option<BatchConfig>,
    exporter: Option<Box<dyn Exporter<SpanData>>>,
}

impl TributaryBuilder {
    /// The collector address for the default TCP exporter.
    pub fn with_host(mut self, host: String) -> TributaryBuilder {
        self.host = Some(host);
        self
    }

    /// A resource attribute sent in the TCP exporter's handshake.
    pub fn with_attribute<A: Into<String>, V: Into<String>>(
        mut self,
        attribute: A,
        value: V,
    ) -> TributaryBuilder {
        self.fields.insert(attribute.into(), value.into());
        self
    }

    /// Overrides the batching configuration, which otherwise comes from the
    /// environment.
    pub fn with_config(mut self, config: BatchConfig) -> TributaryBuilder {
        self.config = Some(config);
        self
    }

    /// Replaces the default TCP exporter.
    pub fn with_exporter<E: Exporter<SpanData>>(mut self, exporter: E) -> TributaryBuilder {
        self.exporter = Some(Box::new(exporter));
        self
    }

    pub fn build(self) -> Result<Tributary, BuildError> {
        let config = self.config.unwrap_or_else(BatchConfig::from_env);
        let exporter = match self.exporter {
            Some(exporter) => exporter,
            None => Box::new(TcpExporter::new(self.host, self.fields)),
        };

        let processor = BatchProcessor::builder(exporter)
            .with_config(config)
            .build()?;

        Ok(Tributary {
            processor: Arc::new(processor),
        })
    }
}

pub struct Tributary {
    processor: Arc<BatchProcessor<SpanData>>,
}

impl Tributary {
    pub fn builder() -> TributaryBuilder {
        TributaryBuilder {
            host: None,
            fields: BTreeMap::new(),
            config: None,
            exporter: None,
        }
    }

    /// A handle for flushing and shutting down after the layer has been
    /// handed to a subscriber.
    pub fn handle(&self) -> TributaryHandle {
        TributaryHandle {
            processor: self.processor.clone(),
        }
    }
}

#[derive(Clone)]
pub struct TributaryHandle {
    processor: Arc<BatchProcessor<SpanData>>,
}

impl TributaryHandle {
    /// Exports every finished span, waiting up to the configured export
    /// timeout.
    pub fn force_flush(&self) -> Result<(), PipelineError> {
        let timeout = self.processor.config().max_export_timeout;
        self.processor.force_flush(timeout)
    }

    pub fn shutdown(&self) -> Result<(), PipelineError> {
        let timeout = self.processor.config().max_export_timeout;
        self.processor.shutdown(timeout)
    }

    pub fn dropped_count(&self) -> u64 {
        self.processor.dropped_count()
    }
}

/// What the layer keeps in a span's extensions until it closes.
struct SpanState {
    trace_id: TraceId,
    span_id: SpanId,
    parent_span_id: Option<SpanId>,
    trace_flags: TraceFlags,
    trace_state: TraceState,
    start_time: SystemTime,
    attributes: Attributes,
    status: Status,
}

impl SpanState {
    fn span_context(&self) -> SpanContext {
        SpanContext {
            trace_id: self.trace_id,
            span_id: self.span_id,
            trace_flags: self.trace_flags,
            is_remote: false,
            trace_state: self.trace_state.clone(),
        }
    }
}

fn is_internal(target: &str) -> bool {
    let in_module = |module: &str| {
        target == module
            || target
                .strip_prefix(module)
                .is_some_and(|rest| rest.starts_with("::"))
    };

    in_module(ENGINE_TARGET) || in_module(EXPORTER_TARGET)
}

impl<S> Layer<S> for Tributary
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    fn on_new_span(&self, attrs: &SpanAttributes<'_>, id: &Id, ctx: LayerContext<'_, S>) {
        if is_internal(attrs.metadata().target()) {
            return;
        }

        let Some(span) = ctx.span(id) else {
            return;
        };

        let parent = span.parent().and_then(|parent| {
            let extensions = parent.extensions();
            let parent = extensions.get::<SpanState>()?;
            Some(parent.span_context())
        });

        // without a local parent, continue a remote trace if one was attached
        let parent = parent.or_else(|| {
            let cx = Context::current();
            let remote = cx.span_context();
            remote.is_valid().then(|| remote.clone())
        });

        let (trace_id, parent_span_id, trace_flags, trace_state) = match parent {
            Some(parent) => (
                parent.trace_id,
                Some(parent.span_id),
                parent.trace_flags,
                parent.trace_state,
            ),
            None => (generate_trace_id(), None, TraceFlags::SAMPLED, TraceState::NONE),
        };

        let mut attributes = Attributes::new();
        attrs.record(&mut AttributeVisitor::new(&mut attributes));

        span.extensions_mut().insert(SpanState {
            trace_id,
            span_id: generate_span_id(),
            parent_span_id,
            trace_flags,
            trace_state,
            start_time: SystemTime::now(),
            attributes,
            status: Status::Unset,
        });
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: LayerContext<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };

        let mut extensions = span.extensions_mut();
        if let Some(state) = extensions.get_mut::<SpanState>() {
            values.record(&mut AttributeVisitor::new(&mut state.attributes));
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: LayerContext<'_, S>) {
        let metadata = event.metadata();
        if is_internal(metadata.target()) || *metadata.level() != Level::ERROR {
            return;
        }

        let Some(span) = ctx.event_span(event) else {
            return;
        };

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let mut extensions = span.extensions_mut();
        if let Some(state) = extensions.get_mut::<SpanState>() {
            state.status = Status::Error {
                message: visitor.finish().unwrap_or_default(),
            };
        }
    }

    fn on_close(&self, id: Id, ctx: LayerContext<'_, S>) {
        let Some(span) = ctx.span(&id) else {
            return;
        };

        let Some(state) = span.extensions_mut().remove::<SpanState>() else {
            return;
        };

        if !state.trace_flags.is_sampled() {
            return;
        }

        let metadata = span.metadata();

        self.processor.enqueue(SpanData {
            trace_id: state.trace_id,
            span_id: state.span_id,
            parent_span_id: state.parent_span_id,
            trace_flags: state.trace_flags,
            name: metadata.name().to_owned(),
            target: metadata.target().to_owned(),
            start_time: state.start_time,
            end_time: SystemTime::now(),
            attributes: state.attributes,
            status: state.status,
        });
    }
}

/// The current context with the current `tracing` span as its active span,
/// for injecting into outgoing requests.
///
/// Falls back to `Context::current()` when there is no current span or the
/// subscriber is not built on a `Registry` with the tributary layer.
pub fn current_context() -> Context {
    let cx = Context::current();

    let span_context = tracing::Span::current()
        .with_subscriber(|(id, dispatch)| {
            let registry = dispatch.downcast_ref::<Registry>()?;
            let span = registry.span(id)?;
            let extensions = span.extensions();
            let state = extensions.get::<SpanState>()?;
            Some(state.span_context())
        })
        .flatten();

    match span_context {
        Some(span_context) => cx.with_span_context(span_context),
        None => cx,
    }
}
