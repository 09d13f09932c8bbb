#![warn(missing_docs, clippy::missing_docs_in_private_items)]

//! Test suites with shared setup, teardown, and disposable resources.
//!
//! A suite is a named set of tests run by [`SuiteRunner`]. Hooks run around
//! the whole suite and around every test, and each test gets a [`TestScope`]
//! through which it asks for the resources it needs: a fresh Postgres
//! database, a Kafka cluster, HTTP stubs, or a search client. Resources are
//! owned by the suite and released when it finishes.
//!
//! ```no_run
//! use testkit::{testkit_test, TestScope};
//!
//! #[testkit_test(|settings| settings.kafka.partitions = 2)]
//! async fn order_is_published(scope: TestScope) {
//!     scope.requires_kafka(&["orders"]).unwrap();
//!     scope.produce("orders", "1", r#"{"id": 1}"#, &[]).await.unwrap();
//! }
//! ```
//!
//! Settings come from `.testkit.config.yaml`, see [`testkit_settings`].

extern crate self as testkit;

pub mod api_mock;
mod context;
mod errors;
pub mod kafka;
pub mod maps;
pub mod migrate;
pub mod postgres;
mod runner;
pub mod search;
mod suite;
mod utils;
pub mod xhttp;

pub use crate::{
    context::TestContext,
    errors::{Error, Result},
    runner::{SuiteReport, SuiteRunner, TestOutcome, TestResult, ENV_TEST_FILTER},
    suite::{Suite, TestScope},
    utils::logging::{LogWatcher, TracingJsonEvent},
};

pub use testkit_macro::testkit_test;
pub use testkit_settings::{self as settings, Settings};

/// Re-exports for code generated by [`testkit_test`].
#[doc(hidden)]
pub mod __private {
    pub use tokio;
}
