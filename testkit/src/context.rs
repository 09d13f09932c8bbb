//! Per-test contexts.
//!
//! Every test name gets one [`TestContext`], created the first time it is
//! asked for. A context carries a tracing span for the test and a small map
//! of typed values that hooks can use to hand data to test bodies.

use dashmap::DashMap;
use std::{
    any::Any,
    collections::HashMap,
    sync::{Arc, Mutex, OnceLock, PoisonError},
};
use tracing::Span;

/// State attached to one test name.
pub struct TestContext {
    /// The full name of the test.
    name: String,

    /// A span every log line of the test is recorded under.
    span: Span,

    /// Values stored with [`TestContext::set_data`].
    data: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl std::fmt::Debug for TestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestContext")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl TestContext {
    /// Create a context, with its span, for the test called `name`.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            span: tracing::info_span!("test", test = %name),
            data: Mutex::default(),
        }
    }

    /// The full name of the test.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The span the test runs in.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Store `value` under `key`, replacing whatever was there.
    pub fn set_data<T: Any + Send + Sync>(&self, key: &str, value: T) {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), Arc::new(value));
    }

    /// The value stored under `key`, if there is one and it is a `T`.
    pub fn get_data<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self
            .data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()?;
        value.downcast::<T>().ok()
    }
}

/// The contexts of a suite, keyed by full test name.
#[derive(Debug, Default)]
pub struct ContextRegistry {
    /// Contexts by full test name, created with the first context.
    contexts: OnceLock<DashMap<String, Arc<TestContext>>>,
}

impl ContextRegistry {
    /// The context map, created on first use.
    fn contexts(&self) -> &DashMap<String, Arc<TestContext>> {
        self.contexts.get_or_init(|| {
            tracing::trace!("Initializing context registry");
            DashMap::new()
        })
    }

    /// Make sure a context exists for `name`.
    pub fn initialize(&self, name: &str) {
        self.get_context(name);
    }

    /// The context for `name`, created if this is the first time it is
    /// asked for.
    pub fn get_context(&self, name: &str) -> Arc<TestContext> {
        self.contexts()
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::trace!(%name, "Creating new context");
                Arc::new(TestContext::new(name))
            })
            .clone()
    }
}
