//! A "context" is an immutable set of typed values that is carried through a
//! call chain (e.g. the remote span a request came from, or its baggage).
//! Deriving a new context never changes the one it was derived from.
//!
//! Every logical execution has a "current" context. See `current.rs` for how
//! it is tracked across threads and tasks.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::{Debug, Error as FmtError, Formatter};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

mod current;

pub use current::{detach, ContextGuard, FutureExt};

use crate::models::SpanContext;

static KEY_COUNTER: AtomicU64 = AtomicU64::new(1);

static SPAN_CONTEXT_KEY: LazyLock<ContextKey<SpanContext>> =
    LazyLock::new(|| ContextKey::new("span-context"));

static INVALID_SPAN_CONTEXT: SpanContext = SpanContext::INVALID;

/// A typed key for values in a `Context`. Each call to `new` creates a key
/// distinct from every other, even with the same name.
pub struct ContextKey<T> {
    id: u64,
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ContextKey<T> {
    pub fn new(name: &'static str) -> ContextKey<T> {
        ContextKey {
            id: KEY_COUNTER.fetch_add(1, Ordering::Relaxed),
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Debug for ContextKey<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("ContextKey")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

#[derive(Clone)]
struct Entry {
    name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

#[derive(Clone, Default)]
pub struct Context {
    entries: Option<Arc<BTreeMap<u64, Entry>>>,
}

impl Context {
    pub fn new() -> Context {
        Context { entries: None }
    }

    /// Returns a new context with `key` set to `value`; `self` is unchanged.
    pub fn with_value<T>(&self, key: &ContextKey<T>, value: T) -> Context
    where
        T: Send + Sync + 'static,
    {
        let mut entries = self.entries.as_deref().cloned().unwrap_or_default();
        entries.insert(
            key.id,
            Entry {
                name: key.name,
                value: Arc::new(value),
            },
        );

        Context {
            entries: Some(Arc::new(entries)),
        }
    }

    pub fn get<T: 'static>(&self, key: &ContextKey<T>) -> Option<&T> {
        self.entries
            .as_ref()?
            .get(&key.id)?
            .value
            .downcast_ref::<T>()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.as_ref().map_or(true, |entries| entries.is_empty())
    }

    /// The span context stored in this context, or `SpanContext::INVALID`.
    pub fn span_context(&self) -> &SpanContext {
        self.get(&SPAN_CONTEXT_KEY).unwrap_or(&INVALID_SPAN_CONTEXT)
    }

    pub fn has_active_span(&self) -> bool {
        self.span_context().is_valid()
    }

    pub fn with_span_context(&self, span_context: SpanContext) -> Context {
        self.with_value(&SPAN_CONTEXT_KEY, span_context)
    }

    pub fn with_remote_span_context(&self, mut span_context: SpanContext) -> Context {
        span_context.is_remote = true;
        self.with_value(&SPAN_CONTEXT_KEY, span_context)
    }
}

impl Debug for Context {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        let names = self
            .entries
            .iter()
            .flat_map(|entries| entries.values())
            .map(|entry| entry.name);

        f.debug_struct("Context")
            .field("entries", &names.collect::<Vec<_>>())
            .finish()
    }
}
