//! Eventual consistency helpers for timing-dependent tests.
//!
//! The engine exports records to the index store asynchronously and the web
//! apps import them from there, so assertions on exported data retry with
//! exponential backoff.

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Categories of eventual consistency with their time budgets.
#[derive(Debug, Clone, Copy)]
pub enum ConsistencyCategory {
    /// Exporter flush into the index store (bulk size 1, refresh 1s)
    ExporterFlush,

    /// Web app import from the index store
    WebAppImport,

    /// Connector runtime picking up a deployed connector job type
    ConnectorActivation,
}

impl ConsistencyCategory {
    /// Maximum time to wait for this category.
    pub fn timeout(&self) -> Duration {
        match self {
            ConsistencyCategory::ExporterFlush => Duration::from_secs(30),
            ConsistencyCategory::WebAppImport => Duration::from_secs(60),
            ConsistencyCategory::ConnectorActivation => Duration::from_secs(90),
        }
    }

    fn initial_delay(&self) -> Duration {
        Duration::from_millis(500)
    }
}

/// Wait until `condition` holds, within the budget of `category`.
///
/// Delays start at 500ms and double after every attempt, capped at the
/// remaining budget.
///
/// # Example
///
/// ```no_run
/// use env_tests::eventual::{assert_eventually, ConsistencyCategory};
///
/// # async fn example(count: impl Fn() -> std::future::Ready<u64>) {
/// assert_eventually(ConsistencyCategory::ExporterFlush, || async {
///     count().await > 0
/// })
/// .await
/// .expect("records should be exported");
/// # }
/// ```
pub async fn assert_eventually<F, Fut>(
    category: ConsistencyCategory,
    mut condition: F,
) -> Result<(), String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let timeout = category.timeout();
    let mut delay = category.initial_delay();
    let start = Instant::now();

    loop {
        if condition().await {
            return Ok(());
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(format!(
                "Condition not met within {:?} (category: {:?})",
                timeout, category
            ));
        }

        sleep(delay.min(timeout.saturating_sub(elapsed))).await;
        delay *= 2;
    }
}
