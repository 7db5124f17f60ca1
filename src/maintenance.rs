//! Periodic background jobs.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Owns a set of periodic tasks sharing one cancellation token.
///
/// Dropping the handle cancels the tasks; [`shutdown`](Self::shutdown) also
/// waits for them to finish.
#[derive(Default)]
pub struct MaintenanceHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl MaintenanceHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `job` every `period`, starting one period from now.
    pub fn spawn<J, Fut>(&mut self, name: &'static str, period: Duration, mut job: J)
    where
        J: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let period = period.max(Duration::from_millis(1));
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(period) => {}
                    () = cancel.cancelled() => break,
                }
                job().await;
            }
            debug!(task = name, "maintenance task stopped");
        }));
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel every task and wait for them to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for task in std::mem::take(&mut self.tasks) {
            let _ = task.await;
        }
    }
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
