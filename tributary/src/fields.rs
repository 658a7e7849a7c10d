use std::fmt::Debug;

use tracing_core::field::{Field, Visit};
use tributary_engine::{Attributes, Value};

/// Records `tracing` fields into span attributes. A field recorded twice
/// keeps its latest value.
pub(crate) struct AttributeVisitor<'a> {
    attributes: &'a mut Attributes,
}

impl<'a> AttributeVisitor<'a> {
    pub(crate) fn new(attributes: &'a mut Attributes) -> AttributeVisitor<'a> {
        AttributeVisitor { attributes }
    }

    fn insert(&mut self, field: &Field, value: Value) {
        self.attributes.insert(field.name().to_owned(), value);
    }
}

impl Visit for AttributeVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
        self.insert(field, Value::Str(format!("{value:?}")));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, Value::F64(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, Value::I64(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, Value::U64(value));
    }

    // 128-bit values are kept as numbers when they fit, otherwise as text
    fn record_i128(&mut self, field: &Field, value: i128) {
        match i64::try_from(value) {
            Ok(value) => self.insert(field, Value::I64(value)),
            Err(_) => self.insert(field, Value::Str(value.to_string())),
        }
    }

    fn record_u128(&mut self, field: &Field, value: u128) {
        match u64::try_from(value) {
            Ok(value) => self.insert(field, Value::U64(value)),
            Err(_) => self.insert(field, Value::Str(value.to_string())),
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, Value::Bool(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, Value::Str(value.to_owned()));
    }
}

/// Pulls the `message` field out of an event, falling back to `error`.
#[derive(Default)]
pub(crate) struct MessageVisitor {
    message: Option<String>,
    error: Option<String>,
}

impl MessageVisitor {
    pub(crate) fn finish(self) -> Option<String> {
        self.message.or(self.error)
    }
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
        match field.name() {
            "message" => self.message = Some(format!("{value:?}")),
            "error" => self.error = Some(format!("{value:?}")),
            _ => {}
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = Some(value.to_owned()),
            "error" => self.error = Some(value.to_owned()),
            _ => {}
        }
    }
}
