//! ID generation
//!
//! Trace and span ids are random so that they are unique across processes
//! without coordination. Zero is reserved as the invalid id on both and is
//! never handed out.

use crate::models::{SpanId, TraceId};

pub fn generate_trace_id() -> TraceId {
    loop {
        let id = fastrand::u128(..);
        if id != 0 {
            return TraceId(id);
        }
    }
}

pub fn generate_span_id() -> SpanId {
    loop {
        let id = fastrand::u64(..);
        if id != 0 {
            return SpanId(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_valid_and_distinct() {
        let a = generate_span_id();
        let b = generate_span_id();
        assert!(a.is_valid());
        assert_ne!(a, b);
        assert!(generate_trace_id().is_valid());
    }
}
