//! W3C Baggage propagation
//!
//! See: https://www.w3.org/TR/baggage/

use std::collections::btree_map::Iter;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

use super::{Extractor, Injector, TextMapPropagator};
use crate::context::{Context, ContextKey};

const BAGGAGE_HEADER: &str = "baggage";
const MAX_HEADER_LENGTH: usize = 9182;
const MAX_PAIRS: usize = 180;
const MAX_PAIR_LENGTH: usize = 4096;

const BAGGAGE_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b',')
    .add(b';')
    .add(b'=')
    .add(b'\\')
    .add(b'%');

static BAGGAGE_KEY: LazyLock<ContextKey<Baggage>> = LazyLock::new(|| ContextKey::new("baggage"));

static EMPTY_BAGGAGE: Baggage = Baggage(BTreeMap::new());

/// User-defined name/value pairs propagated alongside the trace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Baggage(BTreeMap<String, String>);

impl Baggage {
    pub fn new() -> Baggage {
        Baggage(BTreeMap::new())
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Baggage {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(name.into(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> Iter<'_, String, String> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Context {
    pub fn baggage(&self) -> &Baggage {
        self.get(&BAGGAGE_KEY).unwrap_or(&EMPTY_BAGGAGE)
    }

    pub fn with_baggage(&self, baggage: Baggage) -> Context {
        self.with_value(&BAGGAGE_KEY, baggage)
    }
}

/// Extracts and injects the `baggage` header. Extracted entries are merged
/// into any baggage the context already has.
#[derive(Debug, Default)]
pub struct BaggagePropagator;

impl BaggagePropagator {
    pub fn new() -> BaggagePropagator {
        BaggagePropagator
    }
}

impl TextMapPropagator for BaggagePropagator {
    fn inject_context(&self, cx: &Context, injector: &mut dyn Injector) {
        let baggage = cx.baggage();
        if baggage.is_empty() {
            return;
        }

        let header = baggage
            .iter()
            .map(|(name, value)| {
                format!(
                    "{}={}",
                    utf8_percent_encode(name, BAGGAGE_ENCODE_SET),
                    utf8_percent_encode(value, BAGGAGE_ENCODE_SET)
                )
            })
            .collect::<Vec<_>>()
            .join(",");

        injector.set(BAGGAGE_HEADER, header);
    }

    fn extract_with_context(&self, cx: &Context, extractor: &dyn Extractor) -> Context {
        let Some(header) = extractor.get(BAGGAGE_HEADER) else {
            return cx.clone();
        };

        if header.len() > MAX_HEADER_LENGTH {
            return cx.clone();
        }

        let mut baggage = cx.baggage().clone();
        let mut found = false;

        for entry in header.split(',').take(MAX_PAIRS) {
            if entry.len() > MAX_PAIR_LENGTH {
                continue;
            }

            // properties after ';' are not kept
            let entry = entry.split(';').next().unwrap_or_default();

            let Some((name, value)) = entry.split_once('=') else {
                continue;
            };

            let name = percent_decode_str(name.trim()).decode_utf8_lossy();
            let value = percent_decode_str(value.trim()).decode_utf8_lossy();

            if name.is_empty() {
                continue;
            }

            baggage.insert(name.into_owned(), value.into_owned());
            found = true;
        }

        if found {
            cx.with_baggage(baggage)
        } else {
            cx.clone()
        }
    }

    fn fields(&self) -> Vec<String> {
        vec![BAGGAGE_HEADER.to_owned()]
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn extract(header: &str) -> Context {
        let carrier = HashMap::from_iter([(BAGGAGE_HEADER.to_owned(), header.to_owned())]);
        BaggagePropagator::new().extract_with_context(&Context::new(), &carrier)
    }

    #[test]
    fn extracts_entries() {
        let cx = extract("key1=val1, key2 = val2;prop=1,bad,=empty");
        let baggage = cx.baggage();

        assert_eq!(baggage.len(), 2);
        assert_eq!(baggage.get("key1"), Some("val1"));
        assert_eq!(baggage.get("key2"), Some("val2"));
    }

    #[test]
    fn decodes_percent_encoding() {
        let cx = extract("key=a%20b%2Cc");
        assert_eq!(cx.baggage().get("key"), Some("a b,c"));
    }

    #[test]
    fn enforces_limits() {
        let too_long = format!("key={}", "x".repeat(MAX_HEADER_LENGTH));
        assert!(extract(&too_long).baggage().is_empty());

        let long_pair = format!("big={},small=1", "x".repeat(MAX_PAIR_LENGTH));
        let cx = extract(&long_pair);
        assert_eq!(cx.baggage().get("big"), None);
        assert_eq!(cx.baggage().get("small"), Some("1"));

        let many = (0..200)
            .map(|i| format!("k{i}=v"))
            .collect::<Vec<_>>()
            .join(",");
        assert_eq!(extract(&many).baggage().len(), MAX_PAIRS);
    }

    #[test]
    fn merges_with_existing_baggage() {
        let cx = Context::new().with_baggage(Baggage::new().with("existing", "1"));
        let carrier = HashMap::from_iter([(BAGGAGE_HEADER.to_owned(), "new=2".to_owned())]);

        let cx = BaggagePropagator::new().extract_with_context(&cx, &carrier);

        assert_eq!(cx.baggage().get("existing"), Some("1"));
        assert_eq!(cx.baggage().get("new"), Some("2"));
    }

    #[test]
    fn injects_encoded_entries() {
        let cx = Context::new().with_baggage(Baggage::new().with("a", "1").with("b", "x y"));

        let mut carrier = HashMap::new();
        BaggagePropagator::new().inject_context(&cx, &mut carrier);

        assert_eq!(carrier[BAGGAGE_HEADER], "a=1,b=x%20y");
    }

    #[test]
    fn injects_nothing_without_baggage() {
        let mut carrier = HashMap::new();
        BaggagePropagator::new().inject_context(&Context::new(), &mut carrier);
        assert!(carrier.is_empty());
    }
}
