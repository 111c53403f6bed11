/*!
Scoped cooperative tasks.

A [`TaskScope`] anchors every task spawned within its dynamic extent: when
the scope exits, still-running tasks are aborted and awaited in reverse
spawn order. Per-task policies decide whether a cancellation or failure
resurfaces at the scope boundary when the scope is not already unwinding;
at most one failure propagates, the rest are logged.

The active scope is exposed ambiently through a task-local so deeply nested
build steps can register cleanup work without threading the scope through
every call.
*/

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{Error, InternalSnafu, Result};

struct TaskEntry {
    handle: JoinHandle<()>,
    /// Holds the task result if no [`TaskHandle`] claimed it.
    slot: Arc<Mutex<Option<Result<()>>>>,
    propagate_cancel: bool,
    propagate_exception: bool,
}

#[derive(Default)]
pub struct TaskScope {
    tasks: Mutex<Vec<TaskEntry>>,
}

tokio::task_local! {
    static CURRENT_SCOPE: Arc<TaskScope>;
}

/// Await the completion of a task spawned in a scope. Dropping the handle
/// leaves the result for the scope to handle at teardown.
pub struct TaskHandle {
    receiver: oneshot::Receiver<Result<()>>,
}

impl TaskHandle {
    /// Wait for the task; a task torn down before finishing reports
    /// cancellation.
    pub async fn join(self) -> Result<()> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(Error::Cancelled),
        }
    }
}

impl TaskScope {
    /// Spawn a task whose cancellation and failure are suppressed (and
    /// logged) at scope teardown unless a [`TaskHandle::join`] claimed the
    /// result first.
    pub fn spawn<F>(self: &Arc<Self>, future: F) -> TaskHandle
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.spawn_with(future, false, false)
    }

    /// Spawn with explicit propagation policy. `propagate_cancel` resurfaces
    /// a cancellation at the scope boundary; `propagate_exception`
    /// resurfaces an unclaimed failure. Either only applies when the scope
    /// is not already unwinding with an error.
    pub fn spawn_with<F>(
        self: &Arc<Self>,
        future: F,
        propagate_cancel: bool,
        propagate_exception: bool,
    ) -> TaskHandle
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let slot = Arc::new(Mutex::new(None));
        let (sender, receiver) = oneshot::channel();
        let task_slot = Arc::clone(&slot);
        let scope = Arc::clone(self);
        let handle = tokio::spawn(CURRENT_SCOPE.scope(scope, async move {
            let result = future.await;
            if let Err(result) = sender.send(result) {
                *task_slot.lock().unwrap() = Some(result);
            }
        }));
        self.tasks.lock().unwrap().push(TaskEntry {
            handle,
            slot,
            propagate_cancel,
            propagate_exception,
        });
        TaskHandle { receiver }
    }

    /// Abort and await every registered task in reverse order, folding
    /// propagated failures into `body` per task policy.
    async fn shutdown<T>(&self, mut body: Result<T>) -> Result<T> {
        loop {
            let entry = match self.tasks.lock().unwrap().pop() {
                Some(entry) => entry,
                None => return body,
            };
            if !entry.handle.is_finished() {
                entry.handle.abort();
            }
            match entry.handle.await {
                Ok(()) => {
                    if let Some(Err(err)) = entry.slot.lock().unwrap().take() {
                        if entry.propagate_exception && body.is_ok() {
                            body = Err(err);
                        } else {
                            log::error!("unhandled error in scoped task dropped: {err}");
                        }
                    }
                }
                Err(join_err) if join_err.is_cancelled() => {
                    if entry.propagate_cancel && body.is_ok() {
                        body = Err(Error::Cancelled);
                    } else {
                        log::debug!("suppressing cancellation of scoped task");
                    }
                }
                Err(join_err) => {
                    let err = InternalSnafu {
                        message: format!("scoped task panicked: {join_err}"),
                    }
                    .build();
                    if body.is_ok() {
                        body = Err(err);
                    } else {
                        log::error!("{err}");
                    }
                }
            }
        }
    }
}

/// Run `body` inside a fresh task scope. The scope is available through
/// [`current_scope`] for the dynamic extent of the body (including tasks it
/// spawns), and is torn down when the body returns.
pub async fn run_scope<T, F, Fut>(body: F) -> Result<T>
where
    F: FnOnce(Arc<TaskScope>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let scope = Arc::new(TaskScope::default());
    let result = CURRENT_SCOPE
        .scope(Arc::clone(&scope), body(Arc::clone(&scope)))
        .await;
    scope.shutdown(result).await
}

/// The scope covering the current task, when inside [`run_scope`].
pub fn current_scope() -> Result<Arc<TaskScope>> {
    CURRENT_SCOPE.try_with(Arc::clone).map_err(|_| {
        InternalSnafu {
            message: "no task scope active",
        }
        .build()
    })
}
