//! Running a suite: hook ordering, test selection, and cleanup.

use crate::{
    errors::Error,
    suite::{Suite, TestHooks, TestScope},
    utils::logging::LogWatcher,
};
use futures::{
    future::{FutureExt, LocalBoxFuture},
    Future,
};
use regex::Regex;
use std::{any::Any, fmt::Debug, panic::AssertUnwindSafe, sync::Arc};
use testkit_settings::{LogFormat, LoggingSettings, Settings};
use tracing::{subscriber::DefaultGuard, Instrument};
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Layer};

/// The environment variable holding the default test filter.
pub const ENV_TEST_FILTER: &str = "TESTKIT_RUN";

/// A suite level or test level hook.
pub(crate) type Hook =
    Arc<dyn Fn(TestScope) -> LocalBoxFuture<'static, Result<(), String>> + Send + Sync>;

/// A test body, boxed so tests of different types fit in one list.
type TestFn = Box<dyn FnOnce(TestScope) -> LocalBoxFuture<'static, Result<(), String>>>;

/// What a test function or hook may return.
///
/// `()` always passes. A `Result` passes when it is `Ok`.
pub trait TestResult {
    /// `Err` with a description if this value means the test failed.
    ///
    /// # Errors
    /// If the test failed.
    fn into_test_result(self) -> Result<(), String>;
}

impl TestResult for () {
    fn into_test_result(self) -> Result<(), String> {
        Ok(())
    }
}

impl<E: Debug> TestResult for Result<(), E> {
    fn into_test_result(self) -> Result<(), String> {
        self.map_err(|error| format!("{error:?}"))
    }
}

/// A result that has already been through [`TestResult::into_test_result`],
/// passed on unchanged.
struct Converted(Result<(), String>);

impl TestResult for Converted {
    fn into_test_result(self) -> Result<(), String> {
        self.0
    }
}

/// Box `hook` into a [`Hook`].
fn hook<F, Fut>(hook: F) -> Hook
where
    F: Fn(TestScope) -> Fut + Send + Sync + 'static,
    Fut: Future + 'static,
    Fut::Output: TestResult,
{
    Arc::new(move |scope| {
        let fut = hook(scope);
        async move { fut.await.into_test_result() }.boxed_local()
    })
}

/// Run `fut`, turning a panic into an `Err` holding the panic message.
pub(crate) async fn guarded<Fut>(fut: Fut) -> Result<(), String>
where
    Fut: Future<Output = Result<(), String>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(format!("test panicked: {}", panic_message(payload.as_ref()))),
    }
}

/// The message a panic was started with, if it was a string.
fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// The result of one test or subtest.
#[derive(Clone, Debug, PartialEq)]
pub struct TestOutcome {
    /// The full name, such as `Suite/test/subtest`.
    pub name: String,
    /// Why the test failed, if it did.
    pub failure: Option<String>,
}

impl TestOutcome {
    /// Whether the test passed.
    pub fn passed(&self) -> bool {
        self.failure.is_none()
    }
}

/// Everything that happened in a suite run.
#[derive(Debug)]
pub struct SuiteReport {
    /// Outcomes of every test and subtest, in the order they finished.
    pub outcomes: Vec<TestOutcome>,

    /// Failures of the suite level hooks.
    pub suite_failures: Vec<String>,

    /// The log events recorded during the run.
    pub log_watcher: LogWatcher,
}

impl SuiteReport {
    /// The tests that passed.
    pub fn passed(&self) -> impl Iterator<Item = &TestOutcome> {
        self.outcomes.iter().filter(|outcome| outcome.passed())
    }

    /// The tests that failed.
    pub fn failures(&self) -> impl Iterator<Item = &TestOutcome> {
        self.outcomes.iter().filter(|outcome| !outcome.passed())
    }

    /// Whether no test and no suite hook failed.
    pub fn is_success(&self) -> bool {
        self.suite_failures.is_empty() && self.failures().next().is_none()
    }

    /// Panic with every failure if the suite did not succeed.
    ///
    /// # Panics
    /// If any test or suite hook failed.
    #[track_caller]
    pub fn assert_success(&self) {
        if self.is_success() {
            return;
        }

        let failures: Vec<String> = self
            .suite_failures
            .iter()
            .cloned()
            .chain(self.failures().map(|outcome| {
                format!(
                    "{}: {}",
                    outcome.name,
                    outcome.failure.as_deref().unwrap_or_default()
                )
            }))
            .collect();
        panic!("suite failed:\n\t{}", failures.join("\n\t"));
    }
}

/// Builds and runs a suite of tests that share setup, teardown, and
/// resources.
///
/// ```no_run
/// use testkit::SuiteRunner;
///
/// # async fn example() -> Result<(), testkit::Error> {
/// SuiteRunner::new("OrderSuite")
///     .setup_suite(|scope| async move {
///         scope.requires_kafka(&["orders"]).map(|_| ())
///     })
///     .test("publishes_order", |scope| async move {
///         scope.produce("orders", "1", "{}", &[]).await
///     })
///     .run()
///     .await?
///     .assert_success();
/// # Ok(())
/// # }
/// ```
pub struct SuiteRunner {
    /// The suite name, with spaces replaced by `_`.
    name: String,
    /// See [`SuiteRunner::settings`].
    settings_changer: Option<Box<dyn FnOnce(&mut Settings)>>,
    /// See [`SuiteRunner::filter`].
    filter: Option<String>,
    /// See [`SuiteRunner::setup_suite`].
    setup_suite: Option<Hook>,
    /// See [`SuiteRunner::teardown_suite`].
    teardown_suite: Option<Hook>,
    /// Hooks run around every test.
    hooks: TestHooks,
    /// Tests by name, in the order they were added.
    tests: Vec<(String, TestFn)>,
}

impl SuiteRunner {
    /// Start building a suite called `name`.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.replace(' ', "_"),
            settings_changer: None,
            filter: None,
            setup_suite: None,
            teardown_suite: None,
            hooks: TestHooks::default(),
            tests: Vec::new(),
        }
    }

    /// Adjust the loaded settings before anything runs.
    #[must_use]
    pub fn settings<F: FnOnce(&mut Settings) + 'static>(mut self, changer: F) -> Self {
        self.settings_changer = Some(Box::new(changer));
        self
    }

    /// Only run tests whose name matches `pattern`. Without this, the
    /// pattern is read from `TESTKIT_RUN`, and if that is not set either,
    /// every test runs.
    #[must_use]
    pub fn filter(mut self, pattern: &str) -> Self {
        self.filter = Some(pattern.to_string());
        self
    }

    /// Run `hook` once, before the first test, in the suite's own scope.
    #[must_use]
    pub fn setup_suite<F, Fut>(mut self, hook_fn: F) -> Self
    where
        F: Fn(TestScope) -> Fut + Send + Sync + 'static,
        Fut: Future + 'static,
        Fut::Output: TestResult,
    {
        self.setup_suite = Some(hook(hook_fn));
        self
    }

    /// Run `hook` once, after the last test, if `setup_suite` ran.
    #[must_use]
    pub fn teardown_suite<F, Fut>(mut self, hook_fn: F) -> Self
    where
        F: Fn(TestScope) -> Fut + Send + Sync + 'static,
        Fut: Future + 'static,
        Fut::Output: TestResult,
    {
        self.teardown_suite = Some(hook(hook_fn));
        self
    }

    /// Run `hook` before every test and subtest, in its scope.
    #[must_use]
    pub fn setup_test<F, Fut>(mut self, hook_fn: F) -> Self
    where
        F: Fn(TestScope) -> Fut + Send + Sync + 'static,
        Fut: Future + 'static,
        Fut::Output: TestResult,
    {
        self.hooks.setup_test = Some(hook(hook_fn));
        self
    }

    /// Run `hook` after every test and subtest, even failed ones.
    #[must_use]
    pub fn teardown_test<F, Fut>(mut self, hook_fn: F) -> Self
    where
        F: Fn(TestScope) -> Fut + Send + Sync + 'static,
        Fut: Future + 'static,
        Fut::Output: TestResult,
    {
        self.hooks.teardown_test = Some(hook(hook_fn));
        self
    }

    /// Add a test. Tests run in the order they are added.
    #[must_use]
    pub fn test<F, Fut>(mut self, name: &str, test: F) -> Self
    where
        F: FnOnce(TestScope) -> Fut + 'static,
        Fut: Future + 'static,
        Fut::Output: TestResult,
    {
        let test: TestFn = Box::new(move |scope| {
            let fut = test(scope);
            async move { fut.await.into_test_result() }.boxed_local()
        });
        self.tests.push((name.replace(' ', "_"), test));
        self
    }

    /// The filter to select tests with, or `None` to run every test.
    fn compile_filter(&self) -> Result<Option<Regex>, Error> {
        let pattern = match &self.filter {
            Some(pattern) => pattern.clone(),
            None => match std::env::var(ENV_TEST_FILTER) {
                Ok(pattern) if !pattern.trim().is_empty() => pattern,
                _ => return Ok(None),
            },
        };

        Regex::new(&pattern)
            .map(Some)
            .map_err(|source| Error::InvalidFilter { pattern, source })
    }

    /// Run the suite.
    ///
    /// Failing tests do not make this return an error. Check the returned
    /// report, for example with [`SuiteReport::assert_success`].
    ///
    /// # Errors
    /// If the test filter is invalid or the settings cannot be loaded. In
    /// both cases nothing has run.
    pub async fn run(self) -> Result<SuiteReport, Error> {
        let filter = self.compile_filter()?;
        let mut settings = Settings::load_or_default()?;
        if let Some(changer) = self.settings_changer {
            changer(&mut settings);
        }

        let log_watcher = LogWatcher::default();
        let _logging_guard = install_logging(&settings.logging, &log_watcher);

        let suite = Suite::new(&self.name, settings, self.hooks, log_watcher.clone());
        let suite_scope = suite.scope();
        let span = suite_scope.context().span().clone();

        let tests: Vec<_> = self
            .tests
            .into_iter()
            .filter(|(name, _)| filter.as_ref().map_or(true, |filter| filter.is_match(name)))
            .collect();

        if tests.is_empty() {
            span.in_scope(|| tracing::warn!(suite = %suite.name(), "no tests to run"));
            return Ok(SuiteReport {
                outcomes: Vec::new(),
                suite_failures: Vec::new(),
                log_watcher,
            });
        }

        let mut suite_failures = Vec::new();

        let setup_failure = match &self.setup_suite {
            Some(setup) => guarded(setup(suite_scope.clone()))
                .instrument(span.clone())
                .await
                .err()
                .map(|reason| format!("suite setup failed: {reason}")),
            None => None,
        };

        for (name, test) in tests {
            let scope = suite_scope.child(&name);
            match &setup_failure {
                Some(reason) => suite.record(TestOutcome {
                    name: scope.name().to_string(),
                    failure: Some(reason.clone()),
                }),
                None => {
                    suite
                        .run_test(scope, |scope| test(scope).map(Converted))
                        .await;
                }
            }
        }

        if let Some(reason) = setup_failure {
            suite_failures.push(reason);
        }

        async {
            if let Some(teardown) = &self.teardown_suite {
                if let Err(reason) = guarded(teardown(suite_scope.clone())).await {
                    tracing::error!(%reason, "teardown_suite failed");
                    suite_failures.push(format!("suite teardown failed: {reason}"));
                }
            }
            suite.cleanup().await;
        }
        .instrument(span)
        .await;

        Ok(SuiteReport {
            outcomes: suite.outcomes(),
            suite_failures,
            log_watcher,
        })
    }
}

impl Suite {
    /// Release everything the suite created: Kafka consumers, then Kafka
    /// clusters, then Postgres databases, then API mocks.
    pub(crate) async fn cleanup(&self) {
        self.cleanup_kafka().await;
        self.cleanup_postgres().await;
        self.cleanup_api_mocks().await;
    }
}

/// Send logs to the test output and to `log_watcher` until the returned
/// guard drops.
fn install_logging(settings: &LoggingSettings, log_watcher: &LogWatcher) -> DefaultGuard {
    let env_filter: EnvFilter = (&settings.levels).into();

    let human = match settings.format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .pretty()
            .with_test_writer()
            .boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .compact()
            .with_test_writer()
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_test_writer()
            .boxed(),
    };

    let tracing_subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(log_watcher.clone()),
        )
        .with(human);

    tracing::subscriber::set_default(tracing_subscriber)
}

#[cfg(test)]
mod tests {
    use super::SuiteRunner;
    use crate::Error;
    use pretty_assertions::assert_eq;
    use std::{
        cell::RefCell,
        rc::Rc,
        sync::{Arc, Mutex},
    };

    type Calls = Arc<Mutex<Vec<String>>>;

    fn recorder() -> (Calls, impl Fn(&str) -> Box<dyn Fn(String) + Send + Sync>) {
        let calls = Calls::default();
        let calls_for_make = calls.clone();
        let make = move |label: &str| {
            let calls = calls_for_make.clone();
            let label = label.to_string();
            Box::new(move |name: String| calls.lock().unwrap().push(format!("{label} {name}")))
                as Box<dyn Fn(String) + Send + Sync>
        };
        (calls, make)
    }

    fn hooked_runner(name: &str) -> (Calls, SuiteRunner) {
        let (calls, make) = recorder();
        let (setup_suite, teardown_suite) = (make("setup_suite"), make("teardown_suite"));
        let (setup_test, teardown_test) = (make("setup_test"), make("teardown_test"));

        let runner = SuiteRunner::new(name)
            .setup_suite(move |scope| {
                setup_suite(scope.name().to_string());
                async {}
            })
            .teardown_suite(move |scope| {
                teardown_suite(scope.name().to_string());
                async {}
            })
            .setup_test(move |scope| {
                setup_test(scope.name().to_string());
                async {}
            })
            .teardown_test(move |scope| {
                teardown_test(scope.name().to_string());
                async {}
            });
        (calls, runner)
    }

    #[tokio::test]
    async fn hooks_run_in_order() {
        let (calls, runner) = hooked_runner("OrderedSuite");
        let report = runner
            .filter(".*")
            .test("first", |_| async {})
            .test("second", |_| async {})
            .run()
            .await
            .unwrap();

        report.assert_success();
        assert_eq!(
            *calls.lock().unwrap(),
            [
                "setup_suite OrderedSuite",
                "setup_test OrderedSuite/first",
                "teardown_test OrderedSuite/first",
                "setup_test OrderedSuite/second",
                "teardown_test OrderedSuite/second",
                "teardown_suite OrderedSuite",
            ]
        );
    }

    #[tokio::test]
    async fn teardown_runs_after_panic_and_next_test_still_runs() {
        let (calls, runner) = hooked_runner("PanicSuite");
        let report = runner
            .filter(".*")
            .test("panics", |_| async { panic!("kaboom") as () })
            .test("passes", |_| async {})
            .run()
            .await
            .unwrap();

        assert_eq!(
            *calls.lock().unwrap(),
            [
                "setup_suite PanicSuite",
                "setup_test PanicSuite/panics",
                "teardown_test PanicSuite/panics",
                "setup_test PanicSuite/passes",
                "teardown_test PanicSuite/passes",
                "teardown_suite PanicSuite",
            ]
        );
        assert!(!report.is_success());
        let failure = report.failures().next().unwrap();
        assert_eq!(failure.name, "PanicSuite/panics");
        assert_eq!(failure.failure.as_deref(), Some("test panicked: kaboom"));
        assert_eq!(report.passed().count(), 1);
    }

    #[tokio::test]
    async fn err_results_fail_tests() {
        let report = SuiteRunner::new("ResultSuite")
            .filter(".*")
            .test("errs", |_| async { Err::<(), _>("no such order") })
            .test("oks", |_| async { Ok::<(), String>(()) })
            .run()
            .await
            .unwrap();

        let failures: Vec<_> = report.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].failure.as_deref(), Some("\"no such order\""));
    }

    #[tokio::test]
    async fn no_selected_tests_skips_suite_hooks() {
        let (calls, runner) = hooked_runner("EmptySuite");
        let report = runner
            .filter("^nothing_matches$")
            .test("some_test", |_| async {})
            .run()
            .await
            .unwrap();

        assert!(calls.lock().unwrap().is_empty());
        assert!(report.outcomes.is_empty());
        assert!(report
            .log_watcher
            .has(|event| event.field_contains("message", "no tests to run")));
    }

    #[tokio::test]
    async fn filter_selects_by_name() {
        let report = SuiteRunner::new("FilterSuite")
            .filter("^creates_")
            .test("creates_order", |_| async {})
            .test("deletes_order", |_| async { panic!("should not run") as () })
            .test("creates_invoice", |_| async {})
            .run()
            .await
            .unwrap();

        let names: Vec<_> = report.passed().map(|outcome| outcome.name.as_str()).collect();
        assert_eq!(
            names,
            ["FilterSuite/creates_order", "FilterSuite/creates_invoice"]
        );
        report.assert_success();
    }

    #[tokio::test]
    async fn invalid_filter_runs_nothing() {
        let (calls, runner) = hooked_runner("InvalidFilterSuite");
        let result = runner
            .filter("(unclosed")
            .test("some_test", |_| async {})
            .run()
            .await;

        assert!(matches!(result, Err(Error::InvalidFilter { .. })));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_setup_suite_fails_every_test_and_still_tears_down() {
        let torn_down = Arc::new(Mutex::new(false));
        let torn_down_in_hook = torn_down.clone();

        let report = SuiteRunner::new("BrokenSetupSuite")
            .filter(".*")
            .setup_suite(|_| async { Err::<(), _>("database unreachable") })
            .teardown_suite(move |_| {
                *torn_down_in_hook.lock().unwrap() = true;
                async {}
            })
            .test("first", |_| async { panic!("should not run") as () })
            .test("second", |_| async { panic!("should not run") as () })
            .run()
            .await
            .unwrap();

        assert!(*torn_down.lock().unwrap());
        assert_eq!(report.failures().count(), 2);
        for outcome in report.failures() {
            assert!(outcome
                .failure
                .as_deref()
                .unwrap()
                .contains("suite setup failed: \"database unreachable\""));
        }
    }

    #[tokio::test]
    async fn cleanup_runs_after_teardown_suite() {
        let kept_scope = Rc::new(RefCell::new(None));
        let kept_in_test = kept_scope.clone();
        let seen_in_teardown = Arc::new(Mutex::new(None));
        let seen = seen_in_teardown.clone();

        SuiteRunner::new("CleanupSuite")
            .filter(".*")
            .setup_suite(|scope| async move { scope.requires_kafka(&["orders"]).map(|_| ()) })
            .teardown_suite(move |scope| {
                *seen.lock().unwrap() = Some(scope.kafka_bootstrap_servers().is_ok());
                async {}
            })
            .test("keeps_scope", move |scope| async move {
                scope.kafka_bootstrap_servers()?;
                *kept_in_test.borrow_mut() = Some(scope);
                Ok::<_, Error>(())
            })
            .run()
            .await
            .unwrap()
            .assert_success();

        assert_eq!(*seen_in_teardown.lock().unwrap(), Some(true));
        let scope = kept_scope.borrow_mut().take().unwrap();
        assert!(matches!(
            scope.kafka_bootstrap_servers(),
            Err(Error::KafkaClusterNotFound)
        ));
    }

    #[tokio::test]
    async fn settings_changer_is_applied() {
        SuiteRunner::new("SettingsSuite")
            .filter(".*")
            .settings(|settings| settings.kafka.partitions = 4)
            .test("reads_settings", |scope| async move {
                assert_eq!(scope.settings().kafka.partitions, 4);
            })
            .run()
            .await
            .unwrap()
            .assert_success();
    }

    #[tokio::test]
    async fn test_logs_are_recorded() {
        let report = SuiteRunner::new("LoggingSuite")
            .filter(".*")
            .test("logs", |_| async {
                tracing::warn!(order_id = 12, "order was not found");
            })
            .run()
            .await
            .unwrap();

        assert!(report.log_watcher.has(|event| {
            event.field_contains("message", "order was not found")
                && event.fields.get("order_id") == Some(&serde_json::json!(12))
        }));
    }
}
