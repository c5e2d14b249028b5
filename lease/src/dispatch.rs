use std::future::Future;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Single-worker FIFO work queue.
///
/// Transport callbacks and waiter completions are posted here so they never
/// run on the thread that delivered them, and so completions are observed in
/// the order they were posted.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    name: &'static str,
    tx: mpsc::UnboundedSender<Job>,
    runtime: Handle,
}

impl Dispatcher {
    /// Spawns the worker task. Must be called from within a tokio runtime;
    /// the runtime is kept so later timers can be started from any thread.
    pub fn spawn(name: &'static str) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let runtime = Handle::current();

        runtime.spawn(async move {
            while let Some(job) = rx.recv().await {
                job();
            }
            debug!(dispatcher = name, "dispatcher drained and stopped");
        });

        Self { name, tx, runtime }
    }

    /// Spawns `task` on the runtime the dispatcher was created on.
    pub fn spawn_task<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime.spawn(task)
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Queues `job`. Returns false if the worker has stopped.
    pub fn post<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let posted = self.tx.send(Box::new(job)).is_ok();
        if !posted {
            trace!(dispatcher = self.name, "dropping job posted after shutdown");
        }
        posted
    }

    /// Resolves once every job posted before this call has run.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.post(move || {
            let _ = done_tx.send(());
        }) {
            let _ = done_rx.await;
        }
    }
}
