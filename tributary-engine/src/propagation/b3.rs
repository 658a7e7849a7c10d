//! B3 propagation (Zipkin)
//!
//! See: https://github.com/openzipkin/b3-propagation

use super::{Extractor, Injector, TextMapPropagator};
use crate::context::Context;
use crate::models::{SpanContext, SpanId, TraceFlags, TraceId};

const SINGLE_HEADER: &str = "b3";
const TRACE_ID_HEADER: &str = "x-b3-traceid";
const SPAN_ID_HEADER: &str = "x-b3-spanid";
const PARENT_SPAN_ID_HEADER: &str = "x-b3-parentspanid";
const SAMPLED_HEADER: &str = "x-b3-sampled";
const FLAGS_HEADER: &str = "x-b3-flags";

const SAMPLED_VALUES: [&str; 4] = ["1", "true", "True", "d"];

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum B3Encoding {
    #[default]
    MultipleHeader,
    SingleHeader,
    SingleAndMultipleHeader,
}

impl B3Encoding {
    fn single(self) -> bool {
        matches!(self, B3Encoding::SingleHeader | B3Encoding::SingleAndMultipleHeader)
    }

    fn multiple(self) -> bool {
        matches!(self, B3Encoding::MultipleHeader | B3Encoding::SingleAndMultipleHeader)
    }
}

/// Extracts either B3 form (the single `b3` header takes precedence) and
/// injects the form(s) selected by its `B3Encoding`.
#[derive(Debug, Default)]
pub struct B3Propagator {
    encoding: B3Encoding,
}

impl B3Propagator {
    pub fn new() -> B3Propagator {
        B3Propagator {
            encoding: B3Encoding::MultipleHeader,
        }
    }

    pub fn with_encoding(encoding: B3Encoding) -> B3Propagator {
        B3Propagator { encoding }
    }

    fn parse_single(&self, header: &str) -> Option<SpanContext> {
        let fields: Vec<&str> = header.split('-').collect();

        // the sampling state is "deferred" unless given, which we treat as
        // sampled
        let (trace_id, span_id, sampled) = match fields.as_slice() {
            [trace_id, span_id] => (*trace_id, *span_id, "1"),
            [trace_id, span_id, sampled] => (*trace_id, *span_id, *sampled),
            [trace_id, span_id, sampled, _parent] => (*trace_id, *span_id, *sampled),
            _ => return None,
        };

        self.build(trace_id, span_id, SAMPLED_VALUES.contains(&sampled))
    }

    fn parse_multiple(&self, extractor: &dyn Extractor) -> Option<SpanContext> {
        let trace_id = extractor.get(TRACE_ID_HEADER)?;
        let span_id = extractor.get(SPAN_ID_HEADER)?;
        let sampled = extractor.get(SAMPLED_HEADER);
        let flags = extractor.get(FLAGS_HEADER);

        let is_sampled = sampled.is_some_and(|s| SAMPLED_VALUES.contains(&s)) || flags == Some("1");

        self.build(trace_id, span_id, is_sampled)
    }

    fn build(&self, trace_id: &str, span_id: &str, sampled: bool) -> Option<SpanContext> {
        let trace_id = TraceId::from_hex(trace_id, true)?;
        let span_id = SpanId::from_hex(span_id)?;

        if !trace_id.is_valid() || !span_id.is_valid() {
            return None;
        }

        Some(SpanContext::new_remote(
            trace_id,
            span_id,
            TraceFlags::NONE.with_sampled(sampled),
        ))
    }
}

impl TextMapPropagator for B3Propagator {
    fn inject_context(&self, cx: &Context, injector: &mut dyn Injector) {
        let span_context = cx.span_context();
        if !span_context.is_valid() {
            return;
        }

        let sampled = if span_context.is_sampled() { "1" } else { "0" };

        if self.encoding.single() {
            injector.set(
                SINGLE_HEADER,
                format!("{}-{}-{}", span_context.trace_id, span_context.span_id, sampled),
            );
        }

        if self.encoding.multiple() {
            injector.set(TRACE_ID_HEADER, span_context.trace_id.to_string());
            injector.set(SPAN_ID_HEADER, span_context.span_id.to_string());
            injector.set(SAMPLED_HEADER, sampled.to_owned());
        }
    }

    fn extract_with_context(&self, cx: &Context, extractor: &dyn Extractor) -> Context {
        let span_context = match extractor.get(SINGLE_HEADER) {
            Some(header) => self.parse_single(header),
            None => self.parse_multiple(extractor),
        };

        match span_context {
            Some(span_context) => cx.with_remote_span_context(span_context),
            None => cx.clone(),
        }
    }

    fn fields(&self) -> Vec<String> {
        let mut fields = Vec::new();
        if self.encoding.single() {
            fields.push(SINGLE_HEADER.to_owned());
        }
        if self.encoding.multiple() {
            fields.extend(
                [TRACE_ID_HEADER, SPAN_ID_HEADER, PARENT_SPAN_ID_HEADER, SAMPLED_HEADER]
                    .map(str::to_owned),
            );
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn carrier(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn extracts_multiple_headers() {
        let carrier = carrier(&[
            (TRACE_ID_HEADER, "4bf92f3577b34da6a3ce929d0e0e4736"),
            (SPAN_ID_HEADER, "00f067aa0ba902b7"),
            (SAMPLED_HEADER, "1"),
        ]);

        let cx = B3Propagator::new().extract_with_context(&Context::new(), &carrier);
        let sc = cx.span_context();

        assert_eq!(sc.trace_id, TraceId(0x4bf92f3577b34da6a3ce929d0e0e4736));
        assert_eq!(sc.span_id, SpanId(0x00f067aa0ba902b7));
        assert!(sc.is_sampled());
    }

    #[test]
    fn extracts_single_header_with_short_trace_id() {
        let carrier = carrier(&[(SINGLE_HEADER, "a3ce929d0e0e4736-00f067aa0ba902b7-0")]);

        let cx = B3Propagator::new().extract_with_context(&Context::new(), &carrier);
        let sc = cx.span_context();

        assert_eq!(sc.trace_id, TraceId(0xa3ce929d0e0e4736));
        assert!(!sc.is_sampled());
    }

    #[test]
    fn single_header_without_sampling_is_sampled() {
        let carrier = carrier(&[(SINGLE_HEADER, "a3ce929d0e0e4736-00f067aa0ba902b7")]);

        let cx = B3Propagator::new().extract_with_context(&Context::new(), &carrier);

        assert!(cx.span_context().is_sampled());
    }

    #[test]
    fn debug_flag_implies_sampled() {
        let carrier = carrier(&[
            (TRACE_ID_HEADER, "a3ce929d0e0e4736"),
            (SPAN_ID_HEADER, "00f067aa0ba902b7"),
            (FLAGS_HEADER, "1"),
        ]);

        let cx = B3Propagator::new().extract_with_context(&Context::new(), &carrier);

        assert!(cx.span_context().is_sampled());
    }

    #[test]
    fn invalid_ids_keep_context() {
        let propagator = B3Propagator::new();

        for header in ["0", "abc-def", "a3ce929d0e0e4736-00f067aa0ba902b7-1-x-y", "0000000000000000-00f067aa0ba902b7"] {
            let cx = propagator.extract_with_context(&Context::new(), &carrier(&[(SINGLE_HEADER, header)]));
            assert!(!cx.has_active_span(), "accepted {header}");
        }

        let cx = propagator.extract_with_context(
            &Context::new(),
            &carrier(&[(TRACE_ID_HEADER, "xyz"), (SPAN_ID_HEADER, "00f067aa0ba902b7")]),
        );
        assert!(!cx.has_active_span());
    }

    #[test]
    fn injects_selected_encodings() {
        let sc = SpanContext::new_remote(TraceId(0xab), SpanId(0xcd), TraceFlags::SAMPLED);
        let cx = Context::new().with_span_context(sc);

        let mut carrier = HashMap::new();
        B3Propagator::with_encoding(B3Encoding::SingleHeader).inject_context(&cx, &mut carrier);
        assert_eq!(carrier.len(), 1);
        assert_eq!(
            carrier[SINGLE_HEADER],
            "000000000000000000000000000000ab-00000000000000cd-1"
        );

        let mut carrier = HashMap::new();
        B3Propagator::new().inject_context(&cx, &mut carrier);
        assert_eq!(carrier[TRACE_ID_HEADER], "000000000000000000000000000000ab");
        assert_eq!(carrier[SPAN_ID_HEADER], "00000000000000cd");
        assert_eq!(carrier[SAMPLED_HEADER], "1");
    }
}
