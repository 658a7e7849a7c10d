//! Propagators move a `Context` across process boundaries by writing it into,
//! and reading it out of, a "carrier" such as a header map.
//!
//! Propagators never touch a carrier directly, only through the `Injector`
//! and `Extractor` traits, so any carrier shape works with any propagator.
//! A propagator that cannot find or parse its fields returns the context it
//! was given unchanged.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;

use crate::context::Context;

mod b3;
mod baggage;
mod jaeger;
mod trace_context;

pub use b3::{B3Encoding, B3Propagator};
pub use baggage::{Baggage, BaggagePropagator};
pub use jaeger::JaegerPropagator;
pub use trace_context::TraceContextPropagator;

/// Read access to a carrier.
pub trait Extractor {
    fn get(&self, key: &str) -> Option<&str>;

    fn keys(&self) -> Vec<&str>;

    /// All values for `key` for carriers that allow repeated keys.
    fn get_all(&self, key: &str) -> Option<Vec<&str>> {
        self.get(key).map(|value| vec![value])
    }
}

/// Write access to a carrier.
pub trait Injector {
    fn set(&mut self, key: &str, value: String);
}

// map carriers store keys lowercased, matching how header names compare

impl Extractor for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<&str> {
        HashMap::get(self, &key.to_lowercase()).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        HashMap::keys(self).map(String::as_str).collect()
    }
}

impl Injector for HashMap<String, String> {
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_lowercase(), value);
    }
}

impl Extractor for BTreeMap<String, String> {
    fn get(&self, key: &str) -> Option<&str> {
        BTreeMap::get(self, &key.to_lowercase()).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        BTreeMap::keys(self).map(String::as_str).collect()
    }
}

impl Injector for BTreeMap<String, String> {
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_lowercase(), value);
    }
}

/// Encodes and decodes one correlation scheme into and out of a carrier.
pub trait TextMapPropagator: Debug + Send + Sync {
    fn inject_context(&self, cx: &Context, injector: &mut dyn Injector);

    /// Returns `cx` extended with whatever was found in the carrier, or `cx`
    /// unchanged if nothing was found.
    fn extract_with_context(&self, cx: &Context, extractor: &dyn Extractor) -> Context;

    /// The carrier keys `inject_context` may write.
    fn fields(&self) -> Vec<String>;

    fn inject(&self, injector: &mut dyn Injector) {
        self.inject_context(&Context::current(), injector)
    }

    fn extract(&self, extractor: &dyn Extractor) -> Context {
        self.extract_with_context(&Context::current(), extractor)
    }
}

/// A propagator that neither injects nor extracts anything.
#[derive(Debug, Default)]
pub struct NoopPropagator;

impl NoopPropagator {
    pub fn new() -> NoopPropagator {
        NoopPropagator
    }
}

impl TextMapPropagator for NoopPropagator {
    fn inject_context(&self, _cx: &Context, _injector: &mut dyn Injector) {}

    fn extract_with_context(&self, cx: &Context, _extractor: &dyn Extractor) -> Context {
        cx.clone()
    }

    fn fields(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Runs several propagators as one, in the order given.
///
/// On inject every child writes into the same carrier, so when two children
/// write the same key the later one wins. On extract each child receives the
/// context produced by the previous one, so later children can see and
/// override what earlier ones extracted.
#[derive(Debug, Default)]
pub struct CompositePropagator {
    propagators: Vec<Box<dyn TextMapPropagator>>,
    fields: Vec<String>,
}

impl CompositePropagator {
    pub fn new(propagators: Vec<Box<dyn TextMapPropagator>>) -> CompositePropagator {
        let mut fields: Vec<String> = Vec::new();
        for field in propagators.iter().flat_map(|p| p.fields()) {
            if !fields.contains(&field) {
                fields.push(field);
            }
        }

        CompositePropagator {
            propagators,
            fields,
        }
    }

    pub fn len(&self) -> usize {
        self.propagators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.propagators.is_empty()
    }
}

impl TextMapPropagator for CompositePropagator {
    fn inject_context(&self, cx: &Context, injector: &mut dyn Injector) {
        for propagator in &self.propagators {
            propagator.inject_context(cx, injector);
        }
    }

    fn extract_with_context(&self, cx: &Context, extractor: &dyn Extractor) -> Context {
        self.propagators
            .iter()
            .fold(cx.clone(), |cx, propagator| {
                propagator.extract_with_context(&cx, extractor)
            })
    }

    fn fields(&self) -> Vec<String> {
        self.fields.clone()
    }
}
