//! Test scopes, subtests, and the resources a suite owns.
//!
//! Resources such as Kafka clusters and Postgres databases are recorded under
//! the full name of the scope that asked for them. A nested subtest finds
//! them by looking up its own name first, then each parent name in turn, so
//! a cluster made in `setup_suite` is visible to every test and a database
//! made in a test is visible to that test's subtests.

use crate::{
    api_mock::ApiMockServer,
    context::{ContextRegistry, TestContext},
    kafka::KafkaResources,
    maps,
    postgres::PostgresResources,
    runner::{guarded, Hook, TestOutcome, TestResult},
    search::{ElasticsearchClient, OpenSearchClient},
    utils::logging::LogWatcher,
};
use dashmap::{mapref::one::Ref, DashMap};
use serde_json::Value;
use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};
use testkit_settings::Settings;
use tokio::sync::OnceCell;
use tracing::Instrument;

/// The `setup_test` and `teardown_test` hooks, which run around every test
/// and every subtest.
#[derive(Clone, Default)]
pub(crate) struct TestHooks {
    /// Runs before each test body.
    pub(crate) setup_test: Option<Hook>,
    /// Runs after each test body, whether it passed or not.
    pub(crate) teardown_test: Option<Hook>,
}

/// A running suite. Cheap to clone, all clones share the same state.
#[derive(Clone)]
pub struct Suite {
    /// The shared state.
    pub(crate) inner: Arc<SuiteInner>,
}

/// The state behind a [`Suite`].
pub(crate) struct SuiteInner {
    /// The suite name, which is also the root of every scope name.
    pub(crate) name: String,
    /// Settings after the suite's changer ran.
    pub(crate) settings: Settings,
    /// Hooks run around every test and subtest.
    pub(crate) hooks: TestHooks,
    /// Contexts of the suite and its tests.
    pub(crate) contexts: ContextRegistry,
    /// Collects the log events of the run.
    pub(crate) log_watcher: LogWatcher,

    /// Outcomes of every test and subtest, in the order they finished.
    pub(crate) outcomes: Mutex<Vec<TestOutcome>>,

    /// Databases created by the suite's scopes.
    pub(crate) postgres: PostgresResources,
    /// Kafka clusters and consumers started by the suite's scopes.
    pub(crate) kafka: KafkaResources,

    // Built on first use, since they need a live cluster.
    /// The Elasticsearch client.
    pub(crate) elasticsearch: OnceCell<ElasticsearchClient>,
    /// The OpenSearch client.
    pub(crate) opensearch: OnceCell<OpenSearchClient>,
    /// The stub server.
    pub(crate) api_mock: OnceCell<ApiMockServer>,
}

impl std::fmt::Debug for Suite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Suite")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

impl Suite {
    /// A suite called `name` with nothing run yet.
    pub(crate) fn new(
        name: &str,
        settings: Settings,
        hooks: TestHooks,
        log_watcher: LogWatcher,
    ) -> Self {
        Self {
            inner: Arc::new(SuiteInner {
                name: name.to_string(),
                settings,
                hooks,
                contexts: ContextRegistry::default(),
                log_watcher,
                outcomes: Mutex::default(),
                postgres: PostgresResources::default(),
                kafka: KafkaResources::default(),
                elasticsearch: OnceCell::new(),
                opensearch: OnceCell::new(),
                api_mock: OnceCell::new(),
            }),
        }
    }

    /// The suite name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The scope named after the suite itself, used by suite level hooks.
    pub fn scope(&self) -> TestScope {
        self.inner.contexts.initialize(&self.inner.name);
        TestScope {
            suite: self.clone(),
            name: self.inner.name.clone(),
        }
    }

    /// Outcomes recorded so far.
    pub(crate) fn outcomes(&self) -> Vec<TestOutcome> {
        self.inner
            .outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Add the outcome of a finished test.
    pub(crate) fn record(&self, outcome: TestOutcome) {
        self.inner
            .outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(outcome);
    }

    /// The first failed test nested anywhere below `name`.
    fn failed_descendant(&self, name: &str) -> Option<String> {
        let prefix = format!("{name}/");
        self.inner
            .outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|outcome| outcome.name.starts_with(&prefix) && !outcome.passed())
            .map(|outcome| outcome.name.clone())
    }

    /// Run `body` in `scope`, wrapped in the test hooks.
    ///
    /// `teardown_test` runs even if `setup_test` or the body failed. A
    /// failed subtest fails its parent.
    pub(crate) async fn run_test<F, Fut>(&self, scope: TestScope, body: F) -> TestOutcome
    where
        F: FnOnce(TestScope) -> Fut,
        Fut: Future,
        Fut::Output: TestResult,
    {
        let span = scope.context().span().clone();
        let name = scope.name.clone();
        let hooks = self.inner.hooks.clone();

        let failure = async move {
            tracing::debug!("Starting test");
            let mut failure = None;

            if let Some(setup) = &hooks.setup_test {
                failure = guarded(setup(scope.clone())).await.err();
            }

            if failure.is_none() {
                let test_scope = scope.clone();
                let body = async move { body(test_scope).await.into_test_result() };
                failure = guarded(body).await.err();
            }

            if let Some(teardown) = &hooks.teardown_test {
                if let Err(reason) = guarded(teardown(scope.clone())).await {
                    failure.get_or_insert(format!("teardown_test: {reason}"));
                }
            }

            failure.or_else(|| {
                self.failed_descendant(&scope.name)
                    .map(|subtest| format!("subtest {subtest} failed"))
            })
        }
        .instrument(span.clone())
        .await;

        let outcome = TestOutcome {
            name: name.clone(),
            failure,
        };
        span.in_scope(|| match &outcome.failure {
            None => tracing::info!(test = %name, "Test passed"),
            Some(reason) => tracing::error!(test = %name, %reason, "Test failed"),
        });
        self.record(outcome.clone());
        outcome
    }

    /// The scope with the full name `name`.
    fn scope_named(&self, name: &str) -> TestScope {
        self.inner.contexts.initialize(name);
        TestScope {
            suite: self.clone(),
            name: name.to_string(),
        }
    }
}

/// The handle a test, subtest, or hook works through.
///
/// A scope knows the full hierarchical name of the test it belongs to, such
/// as `OrderSuite/creates_order/with_discount`, and reaches the resources of
/// its suite through it.
#[derive(Clone, Debug)]
pub struct TestScope {
    /// The suite the scope belongs to.
    suite: Suite,
    /// The full name, such as `Suite/test/subtest`.
    name: String,
}

impl TestScope {
    /// The full name of this scope.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The suite this scope belongs to.
    pub fn suite(&self) -> &Suite {
        &self.suite
    }

    /// The settings the suite was started with.
    pub fn settings(&self) -> &Settings {
        &self.suite.inner.settings
    }

    /// The context of this scope, created on first use.
    pub fn context(&self) -> Arc<TestContext> {
        self.suite.inner.contexts.get_context(&self.name)
    }

    /// A handle to the log events recorded while the suite runs.
    pub fn log_watcher(&self) -> LogWatcher {
        self.suite.inner.log_watcher.clone()
    }

    /// The scope of a subtest called `name`, without running anything.
    pub(crate) fn child(&self, name: &str) -> TestScope {
        self.suite
            .scope_named(&format!("{}/{}", self.name, name.replace(' ', "_")))
    }

    /// Run `body` as a subtest named `<this scope>/<name>`, with spaces in
    /// `name` replaced by `_`.
    ///
    /// The `setup_test` and `teardown_test` hooks run around the subtest. A
    /// panic or error in the subtest fails it, and through it this scope,
    /// but does not stop the caller. Returns whether the subtest passed.
    pub async fn run<F, Fut>(&self, name: &str, body: F) -> bool
    where
        F: FnOnce(TestScope) -> Fut,
        Fut: Future,
        Fut::Output: TestResult,
    {
        let child = self.child(name);
        self.suite.run_test(child, body).await.passed()
    }

    /// Find the value recorded for this scope, or for the nearest parent
    /// scope that has one.
    pub(crate) fn lookup<'a, V>(&self, map: &'a DashMap<String, V>) -> Option<Ref<'a, String, V>> {
        scope_chain(&self.name).find_map(|name| map.get(name))
    }

    /// Assert that `actual` contains every key of `expected` with an equal
    /// value, comparing nested objects the same way.
    ///
    /// # Panics
    /// With the reason, if `actual` does not contain `expected`, or either
    /// value is neither an object nor null.
    #[track_caller]
    pub fn assert_map_contains(&self, actual: &Value, expected: &Value) {
        let as_map = |value: &Value| match value {
            Value::Null => None,
            Value::Object(map) => Some(map.clone()),
            other => panic!("{other} has an unsupported type, expected a map"),
        };
        let (actual, expected) = (as_map(actual), as_map(expected));

        if let Err(reason) = maps::contains_with_reason(actual.as_ref(), expected.as_ref()) {
            panic!("[{}] map does not contain expected values:\n\t{reason}", self.name);
        }
    }
}

/// `name` followed by each parent name, ending at the first name without a
/// `/` (or one that starts with it).
pub(crate) fn scope_chain(name: &str) -> impl Iterator<Item = &str> {
    std::iter::successors(Some(name), |name| {
        name.rfind('/')
            .filter(|index| *index > 0)
            .map(|index| &name[..index])
    })
}

#[cfg(test)]
mod tests {
    use super::scope_chain;
    use crate::SuiteRunner;
    use dashmap::DashMap;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[test]
    fn scope_chain_walks_parents() {
        assert_eq!(
            scope_chain("Suite/Test/Sub").collect::<Vec<_>>(),
            ["Suite/Test/Sub", "Suite/Test", "Suite"]
        );
        assert_eq!(scope_chain("Suite").collect::<Vec<_>>(), ["Suite"]);
        assert_eq!(scope_chain("/rooted").collect::<Vec<_>>(), ["/rooted"]);
    }

    #[tokio::test]
    async fn lookup_prefers_the_nearest_scope() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_test = seen.clone();

        SuiteRunner::new("LookupSuite")
            .filter(".*")
            .test("nested", move |scope| async move {
                let map = DashMap::new();
                map.insert("LookupSuite".to_string(), "suite");
                map.insert("LookupSuite/nested/inner".to_string(), "inner");

                let outer = scope.lookup(&map).map(|value| *value);
                let seen = seen_in_test.clone();
                scope
                    .run("inner", |scope| async move {
                        let inner = scope.lookup(&map).map(|value| *value);
                        let deeper = scope.child("deeper").lookup(&map).map(|value| *value);
                        seen.lock().unwrap().extend([outer, inner, deeper]);
                    })
                    .await;
            })
            .run()
            .await
            .unwrap()
            .assert_success();

        assert_eq!(
            *seen.lock().unwrap(),
            [Some("suite"), Some("inner"), Some("inner")]
        );
    }

    #[tokio::test]
    async fn subtest_names_replace_spaces() {
        let names = Arc::new(Mutex::new(Vec::new()));
        let names_in_test = names.clone();

        SuiteRunner::new("NamingSuite")
            .filter(".*")
            .test("parent", move |scope| async move {
                let names = names_in_test.clone();
                scope
                    .run("with a space", |scope| async move {
                        names.lock().unwrap().push(scope.name().to_string());
                    })
                    .await;
            })
            .run()
            .await
            .unwrap()
            .assert_success();

        assert_eq!(*names.lock().unwrap(), ["NamingSuite/parent/with_a_space"]);
    }

    #[tokio::test]
    async fn failed_subtest_fails_parent_but_not_siblings() {
        let report = SuiteRunner::new("SubtestSuite")
            .filter(".*")
            .test("parent", |scope| async move {
                let failed = scope.run("fails", |_| async { panic!("boom") as () }).await;
                let passed = scope.run("passes", |_| async {}).await;
                assert!(!failed);
                assert!(passed);
            })
            .run()
            .await
            .unwrap();

        let failures: Vec<_> = report
            .failures()
            .map(|outcome| outcome.name.as_str())
            .collect();
        assert_eq!(failures, ["SubtestSuite/parent/fails", "SubtestSuite/parent"]);
    }

    #[tokio::test]
    async fn context_is_shared_by_name() {
        SuiteRunner::new("ContextSuite")
            .filter(".*")
            .setup_test(|scope| async move {
                scope.context().set_data("order_id", 7_u32);
            })
            .test("reads_data", |scope| async move {
                assert_eq!(scope.context().get_data::<u32>("order_id").as_deref(), Some(&7));
                assert_eq!(scope.context().name(), "ContextSuite/reads_data");
            })
            .run()
            .await
            .unwrap()
            .assert_success();
    }

    #[tokio::test]
    async fn assert_map_contains_checks_subsets() {
        let report = SuiteRunner::new("MapSuite")
            .filter(".*")
            .test("passes", |scope| async move {
                scope.assert_map_contains(
                    &json!({"id": 1, "address": {"city": "Utrecht", "zip": "3511"}}),
                    &json!({"address": {"city": "Utrecht"}}),
                );
            })
            .test("fails", |scope| async move {
                scope.assert_map_contains(&json!({"id": 1}), &json!({"id": 2}));
            })
            .run()
            .await
            .unwrap();

        assert_eq!(report.passed().count(), 1);
        let failure = report.failures().next().unwrap();
        assert_eq!(failure.name, "MapSuite/fails");
        assert!(failure
            .failure
            .as_deref()
            .unwrap()
            .contains("Hint: Value for key 'id' does not match expected value 'int(2)' but got 'int(1)'"));
    }
}
