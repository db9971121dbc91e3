//! Fail-fast fan-out of independent tasks.
//!
//! Every task of a [`TaskGroup`] shares one cancellation token. The first
//! genuine failure cancels it; siblings notice at their next checkpoint and
//! return [`Error::Cancelled`]. Tasks are never aborted, so in-flight
//! operations finish cleanly before [`TaskGroup::join`] returns.

use std::collections::HashMap;
use std::future::Future;
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// A set of concurrently running, named tasks.
pub struct TaskGroup<T> {
    token: CancellationToken,
    join_set: JoinSet<(usize, Result<T>)>,
    names: Vec<String>,
    ids: HashMap<Id, usize>,
}

impl<T: Send + 'static> TaskGroup<T> {
    /// Create a group whose token is a child of `parent`.
    #[must_use]
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            join_set: JoinSet::new(),
            names: Vec::new(),
            ids: HashMap::new(),
        }
    }

    /// The group's shared cancellation token.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Number of spawned tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether no task was spawned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Spawn a task. `task` receives a token cancelled when any sibling fails.
    pub fn spawn<F, Fut>(&mut self, name: impl Into<String>, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let index = self.names.len();
        let name = name.into();
        let group = self.token.clone();
        let future = task(self.token.child_token());
        let task_name = name.clone();

        let handle = self.join_set.spawn(async move {
            let result = future.await;
            if let Err(e) = &result
                && !e.is_cancelled()
            {
                warn!(task = %task_name, error = %e, "Task failed, cancelling siblings");
                group.cancel();
            }
            (index, result)
        });

        debug!(task = %name, index, "Spawned task");
        self.ids.insert(handle.id(), index);
        self.names.push(name);
    }

    /// Wait for every task and collect their results in spawn order.
    pub async fn join(mut self) -> TaskReport<T> {
        let mut slots: Vec<Option<Result<T>>> = self.names.iter().map(|_| None).collect();
        let mut first_failure = None;

        while let Some(joined) = self.join_set.join_next_with_id().await {
            let (index, result) = match joined {
                Ok((_, (index, result))) => (index, result),
                Err(err) => {
                    self.token.cancel();
                    let Some(&index) = self.ids.get(&err.id()) else {
                        continue;
                    };
                    let name = self.names[index].clone();
                    warn!(task = %name, "Task panicked, cancelling siblings");
                    (
                        index,
                        Err(Error::TaskPanicked {
                            name,
                            message: panic_message(err),
                        }),
                    )
                }
            };

            if let Err(e) = &result
                && !e.is_cancelled()
                && first_failure.is_none()
            {
                first_failure = Some(index);
            }
            slots[index] = Some(result);
        }

        let results = slots
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| Err(Error::Cancelled)))
            .collect();

        TaskReport {
            names: self.names,
            results,
            first_failure,
        }
    }
}

fn panic_message(err: JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string()),
        Err(err) => err.to_string(),
    }
}

/// Per-task results of a joined [`TaskGroup`], indexed by spawn order.
#[derive(Debug)]
pub struct TaskReport<T> {
    names: Vec<String>,
    results: Vec<Result<T>>,
    first_failure: Option<usize>,
}

impl<T> TaskReport<T> {
    /// Task names in spawn order.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Task results in spawn order.
    #[must_use]
    pub fn results(&self) -> &[Result<T>] {
        &self.results
    }

    /// Whether every task succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.results.iter().all(Result::is_ok)
    }

    /// All values, or the error that caused the group to fail.
    ///
    /// That is the first genuine failure in completion order; when only
    /// cancellations occurred, the one with the lowest index.
    ///
    /// # Errors
    ///
    /// Returns the selected task error.
    pub fn into_result(self) -> Result<Vec<T>> {
        let selected = self
            .first_failure
            .or_else(|| self.results.iter().position(Result::is_err));

        let mut values = Vec::with_capacity(self.results.len());
        for (index, result) in self.results.into_iter().enumerate() {
            match result {
                Ok(value) => values.push(value),
                Err(e) if Some(index) == selected => return Err(e),
                Err(_) => {}
            }
        }
        Ok(values)
    }
}

/// Run `tasks` concurrently under one group and fail with its first error.
///
/// # Errors
///
/// Returns the error selected by [`TaskReport::into_result`].
pub async fn run_all<I, F, Fut>(parent: &CancellationToken, tasks: I) -> Result<()>
where
    I: IntoIterator<Item = (String, F)>,
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let mut group = TaskGroup::new(parent);
    for (name, task) in tasks {
        group.spawn(name, task);
    }
    group.join().await.into_result().map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use futures::future::BoxFuture;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    async fn wait_for_cancel(token: CancellationToken, observed: Arc<AtomicBool>) -> Result<u32> {
        tokio::select! {
            () = token.cancelled() => {
                observed.store(true, Ordering::SeqCst);
                Err(Error::Cancelled)
            }
            () = tokio::time::sleep(Duration::from_secs(10)) => Ok(0),
        }
    }

    #[tokio::test]
    async fn test_results_keep_spawn_order() {
        let mut group = TaskGroup::new(&CancellationToken::new());
        for (i, delay) in [30u64, 0, 10].into_iter().enumerate() {
            group.spawn(format!("task-{i}"), move |_| async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(i)
            });
        }

        let report = group.join().await;
        assert!(report.is_success());
        assert_eq!(report.names(), ["task-0", "task-1", "task-2"]);
        assert_eq!(report.into_result().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_failure_cancels_siblings_and_is_reported_once() {
        let observed_1 = Arc::new(AtomicBool::new(false));
        let observed_3 = Arc::new(AtomicBool::new(false));
        let mut group = TaskGroup::new(&CancellationToken::new());

        let flag = observed_1.clone();
        group.spawn("task-1", move |token| wait_for_cancel(token, flag));
        group.spawn("task-2", |_| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err(Error::configuration("task 2 broke"))
        });
        let flag = observed_3.clone();
        group.spawn("task-3", move |token| wait_for_cancel(token, flag));

        let report = group.join().await;
        assert!(observed_1.load(Ordering::SeqCst));
        assert!(observed_3.load(Ordering::SeqCst));

        let genuine = report
            .results()
            .iter()
            .filter(|r| matches!(r, Err(e) if !e.is_cancelled()))
            .count();
        assert_eq!(genuine, 1);

        let err = report.into_result().unwrap_err();
        assert!(err.to_string().contains("task 2 broke"));
    }

    #[tokio::test]
    async fn test_first_failure_in_completion_order_wins() {
        let mut group: TaskGroup<()> = TaskGroup::new(&CancellationToken::new());
        group.spawn("slow", |_| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err(Error::configuration("slow"))
        });
        group.spawn("fast", |_| async { Err(Error::configuration("fast")) });

        let err = group.join().await.into_result().unwrap_err();
        assert!(err.to_string().contains("fast"));
    }

    #[tokio::test]
    async fn test_only_cancellations_reports_lowest_index() {
        let parent = CancellationToken::new();
        parent.cancel();
        let mut group: TaskGroup<()> = TaskGroup::new(&parent);
        for i in 0..3 {
            group.spawn(format!("task-{i}"), |token| async move {
                if token.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                Ok(())
            });
        }

        let report = group.join().await;
        assert!(report.results().iter().all(|r| matches!(r, Err(Error::Cancelled))));
        assert!(matches!(report.into_result(), Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_panic_becomes_task_failure() {
        let observed = Arc::new(AtomicBool::new(false));
        let mut group = TaskGroup::new(&CancellationToken::new());
        group.spawn("boom", |_| async {
            if true {
                panic!("exploded");
            }
            Ok(0)
        });
        let flag = observed.clone();
        group.spawn("sibling", move |token| wait_for_cancel(token, flag));

        let err = group.join().await.into_result().unwrap_err();
        match err {
            Error::TaskPanicked { name, message } => {
                assert_eq!(name, "boom");
                assert!(message.contains("exploded"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(observed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_run_all() {
        let counter = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<(String, Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<()>> + Send>)> = (0..4)
            .map(|i| {
                let counter = counter.clone();
                let task: Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<()>> + Send> =
                    Box::new(move |_| {
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                        .boxed()
                    });
                (format!("task-{i}"), task)
            })
            .collect();

        run_all(&CancellationToken::new(), tasks).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }
}
