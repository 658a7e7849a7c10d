//! W3C Trace Context propagation
//!
//! See: https://www.w3.org/TR/trace-context/

use std::sync::LazyLock;

use regex::Regex;

use super::{Extractor, Injector, TextMapPropagator};
use crate::context::Context;
use crate::models::{SpanContext, SpanId, TraceFlags, TraceId, TraceState};

const TRACEPARENT_HEADER: &str = "traceparent";
const TRACESTATE_HEADER: &str = "tracestate";

static TRACEPARENT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?P<version>[0-9a-f]{2})-(?P<trace_id>[0-9a-f]{32})-(?P<span_id>[0-9a-f]{16})-(?P<trace_flags>[0-9a-f]{2})(?P<remainder>.+?)?\s*$",
    )
    .expect("traceparent regex is valid")
});

/// Extracts and injects the `traceparent` and `tracestate` headers.
#[derive(Debug, Default)]
pub struct TraceContextPropagator;

impl TraceContextPropagator {
    pub fn new() -> TraceContextPropagator {
        TraceContextPropagator
    }

    fn parse(&self, extractor: &dyn Extractor) -> Option<SpanContext> {
        let header = extractor.get(TRACEPARENT_HEADER)?;
        let captures = TRACEPARENT_REGEX.captures(header)?;

        let version = &captures["version"];
        let remainder = captures.name("remainder").map(|m| m.as_str());

        if version == "ff" {
            return None;
        }

        match (version, remainder) {
            ("00", Some(_)) => return None,
            (_, Some(remainder)) if !remainder.starts_with('-') => return None,
            _ => {}
        }

        let trace_id = TraceId::from_hex(&captures["trace_id"], false)?;
        let span_id = SpanId::from_hex(&captures["span_id"])?;
        let trace_flags = u8::from_str_radix(&captures["trace_flags"], 16).ok()?;

        if !trace_id.is_valid() || !span_id.is_valid() {
            return None;
        }

        let trace_state = match extractor.get_all(TRACESTATE_HEADER) {
            Some(headers) => TraceState::from_header(&headers.join(",")),
            None => TraceState::NONE,
        };

        Some(SpanContext {
            trace_id,
            span_id,
            // only the sampled bit is defined for version 00
            trace_flags: TraceFlags(trace_flags & TraceFlags::SAMPLED.0),
            is_remote: true,
            trace_state,
        })
    }
}

impl TextMapPropagator for TraceContextPropagator {
    fn inject_context(&self, cx: &Context, injector: &mut dyn Injector) {
        let span_context = cx.span_context();
        if !span_context.is_valid() {
            return;
        }

        let traceparent = format!(
            "00-{}-{}-{:02x}",
            span_context.trace_id, span_context.span_id, span_context.trace_flags.0
        );
        injector.set(TRACEPARENT_HEADER, traceparent);

        if !span_context.trace_state.is_empty() {
            injector.set(TRACESTATE_HEADER, span_context.trace_state.header());
        }
    }

    fn extract_with_context(&self, cx: &Context, extractor: &dyn Extractor) -> Context {
        match self.parse(extractor) {
            Some(span_context) => cx.with_remote_span_context(span_context),
            None => cx.clone(),
        }
    }

    fn fields(&self) -> Vec<String> {
        vec![TRACEPARENT_HEADER.to_owned(), TRACESTATE_HEADER.to_owned()]
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn carrier(traceparent: &str) -> HashMap<String, String> {
        HashMap::from_iter([(TRACEPARENT_HEADER.to_owned(), traceparent.to_owned())])
    }

    #[test]
    fn extracts_valid_traceparent() {
        let mut carrier = carrier("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01");
        carrier.insert(TRACESTATE_HEADER.to_owned(), "foo=bar".to_owned());

        let cx = TraceContextPropagator::new().extract_with_context(&Context::new(), &carrier);
        let sc = cx.span_context();

        assert_eq!(sc.trace_id, TraceId(0x4bf92f3577b34da6a3ce929d0e0e4736));
        assert_eq!(sc.span_id, SpanId(0x00f067aa0ba902b7));
        assert!(sc.is_sampled());
        assert!(sc.is_remote);
        assert_eq!(sc.trace_state.get("foo"), Some("bar"));
    }

    #[test]
    fn ignores_invalid_traceparent() {
        let propagator = TraceContextPropagator::new();
        let invalid = [
            "00-invalid",
            "ff-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
            "00-00000000000000000000000000000000-00f067aa0ba902b7-01",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-0000000000000000-01",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01-extra",
            "00-4BF92F3577B34DA6A3CE929D0E0E4736-00f067aa0ba902b7-01",
            "00-4bf92f3577b34da6-00f067aa0ba902b7-01",
        ];

        for header in invalid {
            let cx = propagator.extract_with_context(&Context::new(), &carrier(header));
            assert!(!cx.has_active_span(), "accepted {header}");
        }
    }

    #[test]
    fn accepts_future_versions_with_extra_fields() {
        let cx = TraceContextPropagator::new().extract_with_context(
            &Context::new(),
            &carrier("01-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01-what"),
        );

        assert!(cx.has_active_span());
    }

    #[test]
    fn missing_header_keeps_context() {
        let existing = SpanContext::new_remote(TraceId(1), SpanId(1), TraceFlags::NONE);
        let cx = Context::new().with_span_context(existing.clone());

        let extracted = TraceContextPropagator::new().extract_with_context(&cx, &HashMap::new());

        assert_eq!(extracted.span_context(), &existing);
    }

    #[test]
    fn injects_traceparent_and_tracestate() {
        let mut sc = SpanContext::new_remote(
            TraceId(0x4bf92f3577b34da6a3ce929d0e0e4736),
            SpanId(0x00f067aa0ba902b7),
            TraceFlags::NONE,
        );
        sc.trace_state = TraceState::from_header("vendor=value");

        let mut carrier = HashMap::new();
        TraceContextPropagator::new()
            .inject_context(&Context::new().with_span_context(sc), &mut carrier);

        assert_eq!(
            carrier[TRACEPARENT_HEADER],
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-00"
        );
        assert_eq!(carrier[TRACESTATE_HEADER], "vendor=value");
    }

    #[test]
    fn does_not_inject_invalid_context() {
        let mut carrier = HashMap::new();
        TraceContextPropagator::new().inject_context(&Context::new(), &mut carrier);
        assert!(carrier.is_empty());
    }
}
