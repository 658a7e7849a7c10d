//! Tracking of the "current" context.
//!
//! Inside a future wrapped by `Context::scope` (or `FutureExt::with_context`)
//! the current context lives in a tokio task-local. Tokio swaps task-locals in
//! and out around every poll, so an attached context survives `.await` points
//! even if the task resumes on another worker thread, and concurrently running
//! tasks never see each other's context. Everywhere else the current context
//! lives in a thread-local.

use std::cell::RefCell;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use super::Context;

static GUARD_COUNTER: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    static TASK_CONTEXT: RefCell<ContextStack>;
}

thread_local! {
    static THREAD_CONTEXT: RefCell<ContextStack> = RefCell::new(ContextStack::new(Context::new()));
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Slot {
    Task,
    Thread,
}

struct ContextStack {
    current: Context,
    // the context each live guard replaced, keyed by guard id
    saved: Vec<(u64, Context)>,
}

impl ContextStack {
    fn new(current: Context) -> ContextStack {
        ContextStack {
            current,
            saved: Vec::new(),
        }
    }
}

fn with_stack<R>(f: impl FnOnce(&mut ContextStack) -> R) -> (R, Slot) {
    if TASK_CONTEXT.try_with(|_| ()).is_ok() {
        let result = TASK_CONTEXT.with(|stack| f(&mut stack.borrow_mut()));
        (result, Slot::Task)
    } else {
        let result = THREAD_CONTEXT.with(|stack| f(&mut stack.borrow_mut()));
        (result, Slot::Thread)
    }
}

/// Restores the context that was current before the matching `attach`.
#[must_use = "dropping the guard immediately detaches the context"]
#[derive(Debug)]
pub struct ContextGuard {
    id: u64,
    slot: Slot,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let id = self.id;

        // returns whether the guard was the innermost one, or `None` if it
        // was not found; nothing is logged while the stack is borrowed
        let restore = |stack: &mut ContextStack| -> Option<bool> {
            let idx = stack.saved.iter().rposition(|(guard, _)| *guard == id)?;
            let in_order = idx + 1 == stack.saved.len();

            // guards attached after this one are implicitly detached as well
            let (_, previous) = stack.saved.swap_remove(idx);
            stack.saved.truncate(idx);
            stack.current = previous;
            Some(in_order)
        };

        let restored = match self.slot {
            Slot::Task => TASK_CONTEXT
                .try_with(|stack| restore(&mut stack.borrow_mut()))
                .ok()
                .flatten(),
            Slot::Thread => THREAD_CONTEXT
                .try_with(|stack| restore(&mut stack.borrow_mut()))
                .ok()
                .flatten(),
        };

        match restored {
            Some(true) => {}
            Some(false) => tracing::warn!("context detached out of order"),
            None => tracing::warn!("failed to detach context: not attached in this scope"),
        }
    }
}

/// Explicitly detaches a context. Same as dropping the guard.
pub fn detach(guard: ContextGuard) {
    drop(guard);
}

impl Context {
    /// The current context of the calling task or thread.
    pub fn current() -> Context {
        with_stack(|stack| stack.current.clone()).0
    }

    /// Makes this the current context until the returned guard is dropped.
    pub fn attach(self) -> ContextGuard {
        let id = GUARD_COUNTER.fetch_add(1, Ordering::Relaxed);

        let ((), slot) = with_stack(|stack| {
            let previous = std::mem::replace(&mut stack.current, self);
            stack.saved.push((id, previous));
        });

        ContextGuard { id, slot }
    }

    /// Runs `fut` with its own task-local current context, starting as `self`.
    pub fn scope<F: Future>(self, fut: F) -> impl Future<Output = F::Output> {
        TASK_CONTEXT.scope(RefCell::new(ContextStack::new(self)), fut)
    }
}

pub trait FutureExt: Future + Sized {
    /// Wraps the future so that it runs with `cx` as its current context.
    fn with_context(self, cx: Context) -> impl Future<Output = Self::Output> {
        cx.scope(self)
    }

    /// Wraps the future so that it runs with the caller's current context.
    fn with_current_context(self) -> impl Future<Output = Self::Output> {
        Context::current().scope(self)
    }
}

impl<F: Future> FutureExt for F {}

#[cfg(test)]
mod tests {
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use tracing::{Event, Subscriber};
    use tracing_subscriber::layer::{Context as LayerContext, Layer, SubscriberExt};

    use super::*;
    use crate::context::ContextKey;

    #[test]
    fn attach_and_detach_nest() {
        let key = ContextKey::<&'static str>::new("test");

        assert_eq!(Context::current().get(&key), None);

        let outer = Context::new().with_value(&key, "outer").attach();
        assert_eq!(Context::current().get(&key), Some(&"outer"));

        let inner = Context::current().with_value(&key, "inner").attach();
        assert_eq!(Context::current().get(&key), Some(&"inner"));

        detach(inner);
        assert_eq!(Context::current().get(&key), Some(&"outer"));

        detach(outer);
        assert_eq!(Context::current().get(&key), None);
    }

    #[test]
    fn out_of_order_detach_restores_captured_value() {
        let key = ContextKey::<u32>::new("test");

        let first = Context::new().with_value(&key, 1).attach();
        let second = Context::new().with_value(&key, 2).attach();

        drop(first);
        assert_eq!(Context::current().get(&key), None);

        // already implicitly detached, this only warns
        drop(second);
        assert_eq!(Context::current().get(&key), None);
    }

    // reads the current context from inside the logging path
    struct ReadsContext {
        seen: Arc<AtomicUsize>,
    }

    impl<S: Subscriber> Layer<S> for ReadsContext {
        fn on_event(&self, _event: &Event<'_>, _ctx: LayerContext<'_, S>) {
            let _ = Context::current();
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn detach_warnings_can_read_current_context() {
        let key = ContextKey::<u32>::new("test");
        let seen = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(ReadsContext { seen: seen.clone() });

        tracing::subscriber::with_default(subscriber, || {
            let first = Context::new().with_value(&key, 1).attach();
            let second = Context::new().with_value(&key, 2).attach();

            // out of order, then not found
            drop(first);
            drop(second);

            assert_eq!(Context::current().get(&key), None);
        });

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unwinding_restores_previous_context() {
        let key = ContextKey::<u32>::new("test");

        let result = catch_unwind(AssertUnwindSafe(|| {
            let _guard = Context::new().with_value(&key, 7).attach();
            assert_eq!(Context::current().get(&key), Some(&7));
            panic!("boom");
        }));

        assert!(result.is_err());
        assert_eq!(Context::current().get(&key), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn task_context_survives_await() {
        let key = std::sync::Arc::new(ContextKey::<u32>::new("test"));

        let task = |value: u32| {
            let key = key.clone();
            tokio::spawn(
                async move {
                    let _guard = Context::current().with_value(&key, value).attach();
                    for _ in 0..10 {
                        tokio::task::yield_now().await;
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        assert_eq!(Context::current().get(&key), Some(&value));
                    }
                }
                .with_context(Context::new()),
            )
        };

        let a = task(1);
        let b = task(2);

        a.await.unwrap();
        b.await.unwrap();

        assert_eq!(Context::current().get(&key), None);
    }

    #[tokio::test]
    async fn with_current_context_captures_caller() {
        let key = ContextKey::<u32>::new("test");

        let _guard = Context::new().with_value(&key, 5).attach();

        let seen = async { Context::current().get(&key).copied() }
            .with_current_context()
            .await;

        assert_eq!(seen, Some(5));
    }

    #[test]
    fn scope_works_without_tokio_runtime() {
        let key = ContextKey::<u32>::new("test");
        let cx = Context::new().with_value(&key, 3);

        let seen = futures::executor::block_on(cx.scope(async {
            let inner = Context::current();
            let _guard = inner.with_value(&key, 4).attach();
            Context::current().get(&key).copied()
        }));

        assert_eq!(seen, Some(4));
        assert_eq!(Context::current().get(&key), None);
    }
}
