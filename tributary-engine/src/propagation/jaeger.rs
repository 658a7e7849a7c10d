//! Jaeger propagation
//!
//! See: https://www.jaegertracing.io/docs/1.19/client-libraries/#propagation-format

use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};

use super::{Extractor, Injector, TextMapPropagator};
use crate::context::Context;
use crate::models::{SpanContext, SpanId, TraceFlags, TraceId};

const TRACE_ID_HEADER: &str = "uber-trace-id";
const BAGGAGE_PREFIX: &str = "uberctx-";
const DEBUG_FLAG: u8 = 0x02;

/// Extracts and injects `uber-trace-id` and `uberctx-*` baggage headers.
#[derive(Debug, Default)]
pub struct JaegerPropagator;

impl JaegerPropagator {
    pub fn new() -> JaegerPropagator {
        JaegerPropagator
    }

    fn parse(&self, header: &str) -> Option<SpanContext> {
        let header = percent_decode_str(header).decode_utf8_lossy();
        let fields: Vec<&str> = header.split(':').collect();

        let [trace_id, span_id, _parent_id, flags] = fields.as_slice() else {
            return None;
        };

        let trace_id = parse_hex(trace_id, 32).map(TraceId)?;
        let span_id = parse_hex(span_id, 16).map(|id| SpanId(id as u64))?;
        let flags = u8::from_str_radix(flags, 16).ok()?;

        if !trace_id.is_valid() || !span_id.is_valid() {
            return None;
        }

        Some(SpanContext::new_remote(
            trace_id,
            span_id,
            TraceFlags(flags & TraceFlags::SAMPLED.0),
        ))
    }
}

// jaeger ids are variable length (leading zeros may be omitted)
fn parse_hex(s: &str, max_len: usize) -> Option<u128> {
    if s.is_empty() || s.len() > max_len || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }

    u128::from_str_radix(s, 16).ok()
}

impl TextMapPropagator for JaegerPropagator {
    fn inject_context(&self, cx: &Context, injector: &mut dyn Injector) {
        let span_context = cx.span_context();
        if !span_context.is_valid() {
            return;
        }

        let mut flags = span_context.trace_flags.0;
        if span_context.is_sampled() {
            flags |= DEBUG_FLAG;
        }

        injector.set(
            TRACE_ID_HEADER,
            format!(
                "{}:{}:{}:{:02x}",
                span_context.trace_id,
                span_context.span_id,
                SpanId::INVALID,
                flags
            ),
        );

        for (name, value) in cx.baggage().iter() {
            injector.set(
                &format!("{BAGGAGE_PREFIX}{name}"),
                utf8_percent_encode(value, NON_ALPHANUMERIC).to_string(),
            );
        }
    }

    fn extract_with_context(&self, cx: &Context, extractor: &dyn Extractor) -> Context {
        let Some(header) = extractor.get(TRACE_ID_HEADER) else {
            return cx.clone();
        };

        let mut cx = cx.clone();

        let mut baggage = cx.baggage().clone();
        let mut found_baggage = false;
        for key in extractor.keys() {
            let Some(name) = key.strip_prefix(BAGGAGE_PREFIX) else {
                continue;
            };

            if let Some(value) = extractor.get(key) {
                let value = percent_decode_str(value).decode_utf8_lossy();
                baggage.insert(name, value.trim());
                found_baggage = true;
            }
        }

        if found_baggage {
            cx = cx.with_baggage(baggage);
        }

        match self.parse(header) {
            Some(span_context) => cx.with_remote_span_context(span_context),
            None => cx,
        }
    }

    fn fields(&self) -> Vec<String> {
        vec![TRACE_ID_HEADER.to_owned()]
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::propagation::Baggage;

    #[test]
    fn extracts_trace_and_baggage() {
        let carrier = HashMap::from_iter([
            (
                TRACE_ID_HEADER.to_owned(),
                "4bf92f3577b34da6a3ce929d0e0e4736:f067aa0ba902b7:0:3".to_owned(),
            ),
            ("uberctx-user".to_owned(), "alice%20b".to_owned()),
        ]);

        let cx = JaegerPropagator::new().extract_with_context(&Context::new(), &carrier);
        let sc = cx.span_context();

        assert_eq!(sc.trace_id, TraceId(0x4bf92f3577b34da6a3ce929d0e0e4736));
        assert_eq!(sc.span_id, SpanId(0x00f067aa0ba902b7));
        assert_eq!(sc.trace_flags, TraceFlags::SAMPLED);
        assert_eq!(cx.baggage().get("user"), Some("alice b"));
    }

    #[test]
    fn malformed_header_keeps_baggage_only() {
        let carrier = HashMap::from_iter([
            (TRACE_ID_HEADER.to_owned(), "nonsense".to_owned()),
            ("uberctx-key".to_owned(), "value".to_owned()),
        ]);

        let cx = JaegerPropagator::new().extract_with_context(&Context::new(), &carrier);

        assert!(!cx.has_active_span());
        assert_eq!(cx.baggage().get("key"), Some("value"));
    }

    #[test]
    fn injects_debug_flag_when_sampled() {
        let sc = SpanContext::new_remote(TraceId(0xab), SpanId(0xcd), TraceFlags::SAMPLED);
        let cx = Context::new()
            .with_span_context(sc)
            .with_baggage(Baggage::new().with("key", "a b"));

        let mut carrier = HashMap::new();
        JaegerPropagator::new().inject_context(&cx, &mut carrier);

        assert_eq!(
            carrier[TRACE_ID_HEADER],
            "000000000000000000000000000000ab:00000000000000cd:0000000000000000:03"
        );
        assert_eq!(carrier["uberctx-key"], "a%20b");
    }
}
