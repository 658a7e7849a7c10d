use std::collections::BTreeMap;
use std::fmt::{Display, Error as FmtError, Formatter};
use std::hash::{Hash, Hasher};
use std::ops::{Add, Sub};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// A 128-bit trace identifier. Zero is the invalid id.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TraceId(pub u128);

impl TraceId {
    pub const INVALID: TraceId = TraceId(0);

    pub fn is_valid(&self) -> bool {
        *self != TraceId::INVALID
    }

    /// Parses exactly 32 (or 16 when `allow_short`) lowercase or uppercase hex
    /// digits.
    pub(crate) fn from_hex(s: &str, allow_short: bool) -> Option<TraceId> {
        let valid_len = s.len() == 32 || (allow_short && s.len() == 16);
        if !valid_len || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }

        u128::from_str_radix(s, 16).ok().map(TraceId)
    }
}

impl Display for TraceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "{:032x}", self.0)
    }
}

/// A 64-bit span identifier. Zero is the invalid id.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SpanId(pub u64);

impl SpanId {
    pub const INVALID: SpanId = SpanId(0);

    pub fn is_valid(&self) -> bool {
        *self != SpanId::INVALID
    }

    pub(crate) fn from_hex(s: &str) -> Option<SpanId> {
        if s.len() != 16 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }

        u64::from_str_radix(s, 16).ok().map(SpanId)
    }
}

impl Display for SpanId {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceFlags(pub u8);

impl TraceFlags {
    pub const NONE: TraceFlags = TraceFlags(0x00);
    pub const SAMPLED: TraceFlags = TraceFlags(0x01);

    pub fn is_sampled(&self) -> bool {
        self.0 & TraceFlags::SAMPLED.0 != 0
    }

    pub fn with_sampled(self, sampled: bool) -> TraceFlags {
        if sampled {
            TraceFlags(self.0 | TraceFlags::SAMPLED.0)
        } else {
            TraceFlags(self.0 & !TraceFlags::SAMPLED.0)
        }
    }
}

/// Vendor-specific trace data as carried by the W3C `tracestate` header. The
/// most recently updated entry is first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceState(Vec<(String, String)>);

impl TraceState {
    pub const NONE: TraceState = TraceState(Vec::new());

    const MAX_MEMBERS: usize = 32;

    /// Parses a `tracestate` header. A header with any malformed member is
    /// discarded entirely.
    pub fn from_header(header: &str) -> TraceState {
        let mut entries: Vec<(String, String)> = Vec::new();

        for member in header.split(',') {
            let member = member.trim();
            if member.is_empty() {
                continue;
            }

            let Some((key, value)) = member.split_once('=') else {
                return TraceState::NONE;
            };

            if !valid_key(key) || !valid_value(value) {
                return TraceState::NONE;
            }

            if entries.iter().any(|(k, _)| k == key) {
                return TraceState::NONE;
            }

            entries.push((key.to_owned(), value.to_owned()));
        }

        if entries.len() > TraceState::MAX_MEMBERS {
            return TraceState::NONE;
        }

        TraceState(entries)
    }

    pub fn header(&self) -> String {
        let mut header = String::new();
        for (idx, (key, value)) in self.0.iter().enumerate() {
            if idx != 0 {
                header.push(',');
            }
            header.push_str(key);
            header.push('=');
            header.push_str(value);
        }
        header
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Returns a new state with `key` set to `value` and moved to the front.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) -> Option<TraceState> {
        let key = key.into();
        let value = value.into();

        if !valid_key(&key) || !valid_value(&value) {
            return None;
        }

        let mut entries = Vec::with_capacity(self.0.len() + 1);
        entries.push((key.clone(), value));
        entries.extend(self.0.iter().filter(|(k, _)| *k != key).cloned());
        entries.truncate(TraceState::MAX_MEMBERS);

        Some(TraceState(entries))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 256
        && key.bytes().all(|b| {
            b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'_' | b'-' | b'*' | b'/' | b'@')
        })
}

fn valid_value(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 256
        && value
            .bytes()
            .all(|b| (0x20..=0x7e).contains(&b) && b != b',' && b != b'=')
}

/// The propagated identity of a span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanContext {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub trace_flags: TraceFlags,
    pub is_remote: bool,
    pub trace_state: TraceState,
}

impl SpanContext {
    /// The explicit "no context found" value.
    pub const INVALID: SpanContext = SpanContext {
        trace_id: TraceId::INVALID,
        span_id: SpanId::INVALID,
        trace_flags: TraceFlags::NONE,
        is_remote: false,
        trace_state: TraceState::NONE,
    };

    pub fn new_remote(trace_id: TraceId, span_id: SpanId, trace_flags: TraceFlags) -> SpanContext {
        SpanContext {
            trace_id,
            span_id,
            trace_flags,
            is_remote: true,
            trace_state: TraceState::NONE,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.trace_id.is_valid() && self.span_id.is_valid()
    }

    pub fn is_sampled(&self) -> bool {
        self.trace_flags.is_sampled()
    }
}

/// An attribute value. Arrays are expected to only hold scalars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    I64(i64),
    U64(u64),
    F64(f64),
    Str(String),
    Array(Vec<Value>),
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Value::Bool(value) => write!(f, "{value}"),
            Value::I64(value) => write!(f, "{value}"),
            Value::U64(value) => write!(f, "{value}"),
            Value::F64(value) => write!(f, "{value}"),
            Value::Str(value) => write!(f, "{value}"),
            Value::Array(values) => {
                write!(f, "[")?;
                for (idx, value) in values.iter().enumerate() {
                    if idx != 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{value}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Value {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Value {
        Value::I64(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Value {
        Value::U64(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Value {
        Value::F64(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Value {
        Value::Str(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Value {
        Value::Str(value)
    }
}

impl From<Vec<i64>> for Value {
    fn from(values: Vec<i64>) -> Value {
        Value::Array(values.into_iter().map(Value::I64).collect())
    }
}

impl From<Vec<f64>> for Value {
    fn from(values: Vec<f64>) -> Value {
        Value::Array(values.into_iter().map(Value::F64).collect())
    }
}

impl From<Vec<String>> for Value {
    fn from(values: Vec<String>) -> Value {
        Value::Array(values.into_iter().map(Value::Str).collect())
    }
}

pub type Attributes = BTreeMap<String, Value>;

/// An attribute set usable as a map key. Floats compare and hash by their bit
/// pattern.
#[derive(Debug, Clone, Default)]
pub(crate) struct AttributeKey(pub(crate) Attributes);

impl PartialEq for AttributeKey {
    fn eq(&self, other: &AttributeKey) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .all(|((ak, av), (bk, bv))| ak == bk && value_bits_eq(av, bv))
    }
}

impl Eq for AttributeKey {}

impl Hash for AttributeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.len().hash(state);
        for (key, value) in &self.0 {
            key.hash(state);
            hash_value(value, state);
        }
    }
}

fn value_bits_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::F64(a), Value::F64(b)) => a.to_bits() == b.to_bits(),
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(a, b)| value_bits_eq(a, b))
        }
        (a, b) => a == b,
    }
}

fn hash_value<H: Hasher>(value: &Value, state: &mut H) {
    std::mem::discriminant(value).hash(state);
    match value {
        Value::Bool(v) => v.hash(state),
        Value::I64(v) => v.hash(state),
        Value::U64(v) => v.hash(state),
        Value::F64(v) => v.to_bits().hash(state),
        Value::Str(v) => v.hash(state),
        Value::Array(values) => {
            values.len().hash(state);
            for value in values {
                hash_value(value, state);
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    #[default]
    Unset,
    Ok,
    Error {
        message: String,
    },
}

/// A finished span. Parent linkage is by id only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanData {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub trace_flags: TraceFlags,
    pub name: String,
    pub target: String,
    pub start_time: SystemTime,
    pub end_time: SystemTime,
    pub attributes: Attributes,
    pub status: Status,
}

impl SpanData {
    pub fn span_context(&self) -> SpanContext {
        SpanContext {
            trace_id: self.trace_id,
            span_id: self.span_id,
            trace_flags: self.trace_flags,
            is_remote: false,
            trace_state: TraceState::NONE,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub enum Number {
    I64(i64),
    F64(f64),
}

impl Number {
    pub fn as_f64(&self) -> f64 {
        match *self {
            Number::I64(value) => value as f64,
            Number::F64(value) => value,
        }
    }
}

impl Add for Number {
    type Output = Number;

    fn add(self, rhs: Number) -> Number {
        match (self, rhs) {
            (Number::I64(a), Number::I64(b)) => Number::I64(a.wrapping_add(b)),
            (a, b) => Number::F64(a.as_f64() + b.as_f64()),
        }
    }
}

impl Sub for Number {
    type Output = Number;

    fn sub(self, rhs: Number) -> Number {
        match (self, rhs) {
            (Number::I64(a), Number::I64(b)) => Number::I64(a.wrapping_sub(b)),
            (a, b) => Number::F64(a.as_f64() - b.as_f64()),
        }
    }
}

impl From<i64> for Number {
    fn from(value: i64) -> Number {
        Number::I64(value)
    }
}

impl From<f64> for Number {
    fn from(value: f64) -> Number {
        Number::F64(value)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Temporality {
    Cumulative,
    Delta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sum {
    pub temporality: Temporality,
    pub is_monotonic: bool,
    pub start_time: SystemTime,
    pub time: SystemTime,
    pub value: Number,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gauge {
    pub time: SystemTime,
    pub value: Number,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Point {
    Sum(Sum),
    Gauge(Gauge),
}

impl Point {
    pub fn value(&self) -> Number {
        match self {
            Point::Sum(sum) => sum.value,
            Point::Gauge(gauge) => gauge.value,
        }
    }
}

/// One metric stream point for one attribute set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub description: String,
    pub unit: String,
    pub attributes: Attributes,
    pub point: Point,
}
